//! Store-and-forward file transfer
//!
//! Uploads stream from the client after `UPLOAD_DATA` as framed chunks
//! written at their declared offsets, terminated by a zero-length chunk;
//! the server tracks progress so an interrupted upload can resume from
//! the on-disk size (server-authoritative). Downloads stream completed
//! files in ascending offset order; the client declares the resume
//! offset (client-authoritative). Both phases share the session socket
//! with the text protocol.

use std::io::SeekFrom;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::Result;
use crate::history::MessageRecord;
use crate::protocol::chunk::{self, MAX_CHUNK_SIZE};
use crate::protocol::response::notify;
use crate::protocol::{Reply, Scope};
use crate::state::FileMetadata;
use crate::storage::LogKey;

use super::connection::Connection;

/// Upload size cap (100 MiB)
pub const MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(super) async fn handle_req_upload(
        &mut self,
        scope: Scope,
        target: &str,
        filename: &str,
        filesize: u64,
    ) -> Reply {
        let me = self.username().to_string();
        if filesize > MAX_UPLOAD_SIZE {
            return Reply::fail(400, "FILE_TOO_LARGE");
        }

        // For user targets the account must exist; for group targets the
        // sender must be a member
        let valid_target = match scope {
            Scope::User => self.domain.users.contains(target).await,
            Scope::Group => self.domain.groups.is_member(target, &me).await,
        };
        if !valid_target {
            return Reply::fail(404, "TARGET_NOT_FOUND");
        }

        let file_id = self.domain.files.mint_id();
        let meta = FileMetadata {
            unique_id: file_id.clone(),
            original_filename: filename.to_string(),
            sender: me,
            target_scope: scope,
            target_name: target.to_string(),
            filesize,
            bytes_received: 0,
            filepath: self.store.upload_rel_path(&file_id),
            upload_complete: false,
            upload_time: current_timestamp(),
        };
        self.domain.files.register_active(meta).await;

        info!(
            client = self.client_id,
            file = %file_id,
            filename,
            filesize,
            "upload registered"
        );
        Reply::success(200, format!("READY_UPLOAD {}", file_id))
    }

    /// Binary receive phase. Chunks arrive until the zero-length marker
    /// or a transport failure; an incomplete transfer keeps the active
    /// entry and the partial file so the client can resume.
    pub(super) async fn handle_upload_data(&mut self, file_id: &str) -> Result<()> {
        let Some(meta) = self.domain.files.active(file_id).await else {
            return self.send_reply(Reply::fail(404, "FILE_ID_NOT_FOUND")).await;
        };

        self.send_reply(Reply::success(
            200,
            format!("START_UPLOAD {}", meta.bytes_received),
        ))
        .await?;

        let path = self.store.upload_path(file_id);
        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(client = self.client_id, error = %e, "upload file open failed");
                return self.send_reply(Reply::fail(500, "FILE_OPEN_ERROR")).await;
            }
        };

        let mut bytes_received = meta.bytes_received;
        let mut payload = vec![0u8; MAX_CHUNK_SIZE];
        let mut clean = true;

        loop {
            let header = match chunk::read_header(self.lines.get_mut()).await {
                Ok(header) => header,
                Err(e) => {
                    debug!(client = self.client_id, error = %e, "upload stream broke");
                    clean = false;
                    break;
                }
            };
            if header.is_eof() {
                debug!(client = self.client_id, file = file_id, "upload EOF marker");
                break;
            }

            let len = header.length as usize;
            if let Err(e) = self.lines.get_mut().read_exact(&mut payload[..len]).await {
                debug!(client = self.client_id, error = %e, "upload payload truncated");
                clean = false;
                break;
            }

            // Positional write at the declared offset
            if file.seek(SeekFrom::Start(header.offset as u64)).await.is_err()
                || file.write_all(&payload[..len]).await.is_err()
            {
                warn!(client = self.client_id, file = file_id, "upload disk write failed");
                clean = false;
                break;
            }

            bytes_received += len as u64;
            self.domain.files.set_progress(file_id, bytes_received).await;
            debug!(
                client = self.client_id,
                file = file_id,
                offset = header.offset,
                len,
                total = bytes_received,
                "chunk received"
            );
        }

        if clean {
            let _ = file.flush().await;
        }

        if clean && bytes_received >= meta.filesize {
            let Some(completed) = self.domain.files.complete(file_id).await else {
                return self.send_reply(Reply::fail(500, "UPLOAD_INTERRUPTED")).await;
            };
            if let Err(e) = self.store.append_file_metadata(&completed).await {
                warn!(client = self.client_id, error = %e, "file metadata append failed");
            }
            self.finish_upload(&completed).await;
            info!(client = self.client_id, file = file_id, "upload complete");
            self.send_reply(Reply::success(200, "UPLOAD_COMPLETE")).await
        } else {
            info!(
                client = self.client_id,
                file = file_id,
                received = bytes_received,
                expected = meta.filesize,
                "upload interrupted"
            );
            self.send_reply(Reply::fail(500, "UPLOAD_INTERRUPTED")).await
        }
    }

    /// History record, files index entry and notification fan-out for a
    /// freshly completed upload
    async fn finish_upload(&mut self, meta: &FileMetadata) {
        let me = self.username().to_string();
        let ts = current_timestamp();
        let file_record = MessageRecord {
            ts,
            sender: me.clone(),
            kind: "FILE".to_string(),
            content: format!("{}:{}", meta.unique_id, meta.original_filename),
        };
        let index_record = MessageRecord {
            ts,
            sender: me.clone(),
            kind: "FILEMETA".to_string(),
            content: format!(
                "{}:{}:{}",
                meta.unique_id, meta.original_filename, meta.filesize
            ),
        };

        match meta.target_scope {
            Scope::Group => {
                let key = LogKey::Group(meta.target_name.clone());
                if let Err(e) = self.store.append_message(&key, &file_record).await {
                    warn!(client = self.client_id, error = %e, "file record append failed");
                }
                if let Err(e) = self.store.append_file_event(&key, &index_record).await {
                    warn!(client = self.client_id, error = %e, "file index append failed");
                }
                if let Some(group) = self.domain.groups.get(&meta.target_name).await {
                    for member in group.members.iter().filter(|m| *m != &me) {
                        self.domain
                            .presence
                            .notify(
                                member,
                                notify::file_group(
                                    &meta.target_name,
                                    &me,
                                    &meta.unique_id,
                                    &meta.original_filename,
                                ),
                            )
                            .await;
                    }
                }
            }
            Scope::User => {
                // Uploads to a user do not require friendship; without a
                // conversation there is no history log to write to
                if let Some(conv) = self
                    .domain
                    .friends
                    .conversation_id(&meta.sender, &meta.target_name)
                    .await
                {
                    let key = LogKey::Direct(conv);
                    if let Err(e) = self.store.append_message(&key, &file_record).await {
                        warn!(client = self.client_id, error = %e, "file record append failed");
                    }
                    if let Err(e) = self.store.append_file_event(&key, &index_record).await {
                        warn!(client = self.client_id, error = %e, "file index append failed");
                    }
                }
                self.domain
                    .presence
                    .notify(
                        &meta.target_name,
                        notify::file_user(&me, &meta.unique_id, &meta.original_filename),
                    )
                    .await;
            }
        }
    }

    /// Server-authoritative resume: the on-disk size decides where the
    /// client continues
    pub(super) async fn handle_resume_upload(&mut self, file_id: &str) -> Reply {
        if self.domain.files.active(file_id).await.is_none() {
            return Reply::fail(404, "FILE_ID_NOT_FOUND");
        }

        let on_disk = fs::metadata(self.store.upload_path(file_id))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        self.domain.files.set_progress(file_id, on_disk).await;

        info!(
            client = self.client_id,
            file = file_id,
            offset = on_disk,
            "upload resume"
        );
        Reply::success(200, format!("READY_UPLOAD {}", on_disk))
    }

    pub(super) async fn handle_cancel_upload(&mut self, file_id: &str) -> Reply {
        if self.domain.files.cancel(file_id).await.is_none() {
            return Reply::fail(404, "FILE_ID_NOT_FOUND");
        }
        let _ = fs::remove_file(self.store.upload_path(file_id)).await;
        info!(client = self.client_id, file = file_id, "upload cancelled");
        Reply::success(200, "UPLOAD_CANCELLED")
    }

    /// Pure acknowledgement; the completed file stays intact and the
    /// client discards its own partial copy
    pub(super) async fn handle_cancel_download(&mut self, file_id: &str) -> Reply {
        debug!(client = self.client_id, file = file_id, "download cancelled by client");
        Reply::success(200, "DOWNLOAD_CANCELLED")
    }

    /// Stream a completed file; `resume_offset` is where the client asks
    /// to continue after an earlier partial download
    pub(super) async fn handle_download(
        &mut self,
        file_id: &str,
        resume_offset: Option<u64>,
    ) -> Result<()> {
        let Some(meta) = self.domain.files.completed(file_id).await else {
            return self.send_reply(Reply::fail(404, "FILE_NOT_FOUND")).await;
        };
        if let Some(offset) = resume_offset {
            if offset >= meta.filesize {
                return self.send_reply(Reply::fail(400, "INVALID_OFFSET")).await;
            }
        }

        let mut file = match File::open(self.store.upload_path(file_id)).await {
            Ok(file) => file,
            Err(e) => {
                warn!(client = self.client_id, error = %e, "download file open failed");
                return self.send_reply(Reply::fail(500, "FILE_OPEN_ERROR")).await;
            }
        };

        let header = match resume_offset {
            None => Reply::success(
                200,
                format!(
                    "READY_DOWNLOAD {} {} {}",
                    file_id, meta.original_filename, meta.filesize
                ),
            ),
            Some(offset) => Reply::success(200, format!("RESUME_DOWNLOAD {}", offset)),
        };
        self.send_reply(header).await?;

        let mut offset = resume_offset.unwrap_or(0);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        while offset < meta.filesize {
            let to_read = std::cmp::min(MAX_CHUNK_SIZE as u64, meta.filesize - offset) as usize;
            let n = file.read(&mut buf[..to_read]).await?;
            if n == 0 {
                break;
            }
            chunk::write_chunk(&mut self.writer, offset as u32, &buf[..n]).await?;
            offset += n as u64;
        }
        chunk::write_eof(&mut self.writer, offset as u32).await?;

        self.send_reply(Reply::success(200, "DOWNLOAD_COMPLETE")).await?;
        info!(client = self.client_id, file = file_id, "download complete");

        self.record_download(&meta).await;
        Ok(())
    }

    /// The download event is attributed to the downloading user, not the
    /// original uploader
    async fn record_download(&mut self, meta: &FileMetadata) {
        let me = self.username().to_string();
        let key = match meta.target_scope {
            Scope::Group => Some(LogKey::Group(meta.target_name.clone())),
            Scope::User => self
                .domain
                .friends
                .conversation_id(&meta.sender, &meta.target_name)
                .await
                .map(LogKey::Direct),
        };
        let Some(key) = key else { return };

        let record = MessageRecord {
            ts: current_timestamp(),
            sender: me,
            kind: "DOWNLOAD".to_string(),
            content: format!("{}:{}", meta.unique_id, meta.original_filename),
        };
        if let Err(e) = self.store.append_message(&key, &record).await {
            warn!(client = self.client_id, error = %e, "download record append failed");
        }
        if let Err(e) = self.store.append_file_event(&key, &record).await {
            warn!(client = self.client_id, error = %e, "download index append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::tests::{connect, harness, login, TestPeer};
    use crate::protocol::chunk;
    use tokio::io::AsyncReadExt;

    async fn send_chunk(peer: &mut TestPeer, offset: u32, payload: &[u8]) {
        chunk::write_chunk(&mut peer.writer, offset, payload)
            .await
            .unwrap();
    }

    async fn send_eof(peer: &mut TestPeer, offset: u32) {
        chunk::write_eof(&mut peer.writer, offset).await.unwrap();
    }

    /// Read chunks until the EOF marker, returning the reassembled bytes
    async fn recv_file(peer: &mut TestPeer) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let header = chunk::read_header(peer.lines.get_mut()).await.unwrap();
            if header.is_eof() {
                return out;
            }
            let mut buf = vec![0u8; header.length as usize];
            peer.lines.get_mut().read_exact(&mut buf).await.unwrap();
            out.extend_from_slice(&buf);
        }
    }

    async fn make_friends(alice: &mut TestPeer, bob: &mut TestPeer) {
        alice.request("ADD_FRIEND bob").await;
        bob.recv().await;
        bob.request("CONFIRM_FRIEND alice").await;
        alice.recv().await;
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn extract_file_id(reply: &str) -> String {
        reply
            .strip_prefix("SUCCESS 200 READY_UPLOAD ")
            .expect("upload not accepted")
            .to_string()
    }

    async fn upload(
        peer: &mut TestPeer,
        target_cmd: &str,
        data: &[u8],
    ) -> String {
        let file_id = extract_file_id(&peer.request(target_cmd).await);
        assert_eq!(
            peer.request(&format!("UPLOAD_DATA {}", file_id)).await,
            "SUCCESS 200 START_UPLOAD 0"
        );
        let mut offset = 0usize;
        for part in data.chunks(chunk::MAX_CHUNK_SIZE) {
            send_chunk(peer, offset as u32, part).await;
            offset += part.len();
        }
        send_eof(peer, offset as u32).await;
        assert_eq!(peer.recv().await, "SUCCESS 200 UPLOAD_COMPLETE");
        file_id
    }

    #[tokio::test]
    async fn test_upload_then_download_roundtrip() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, _) = login(&domain, &store, "alice").await;
        let (mut bob, _) = login(&domain, &store, "bob").await;
        make_friends(&mut alice, &mut bob).await;

        let data = pattern(150_000);
        let file_id = upload(&mut alice, "REQ_UPLOAD U bob f.bin 150000", &data).await;

        // Recipient is told about the stored file
        assert_eq!(
            bob.recv().await,
            format!("NOTIFY_FILE U alice {} f.bin", file_id)
        );

        // Stored blob matches the source bytes
        let stored = tokio::fs::read(store.upload_path(&file_id)).await.unwrap();
        assert_eq!(stored, data);

        // Download as the recipient
        assert_eq!(
            bob.request(&format!("REQ_DOWNLOAD {}", file_id)).await,
            format!("SUCCESS 200 READY_DOWNLOAD {} f.bin 150000", file_id)
        );
        let received = recv_file(&mut bob).await;
        assert_eq!(bob.recv().await, "SUCCESS 200 DOWNLOAD_COMPLETE");
        assert_eq!(received, data);

        // The conversation history now carries the FILE and DOWNLOAD events
        assert_eq!(alice.request("HISTORY U bob 0 0").await, "SUCCESS 200 2");
        let file_line = alice.recv().await;
        let download_line = alice.recv().await;
        assert!(file_line.starts_with("1|alice|"));
        assert!(file_line.contains("|FILE|"));
        assert!(file_line.contains(&format!("{}:f.bin", file_id)));
        assert!(download_line.starts_with("2|bob|"));
        assert!(download_line.contains("|DOWNLOAD|"));
    }

    #[tokio::test]
    async fn test_upload_resume_after_disconnect() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, sid) = login(&domain, &store, "alice").await;
        let (mut bob, _) = login(&domain, &store, "bob").await;
        make_friends(&mut alice, &mut bob).await;

        let data = pattern(200_000);
        let file_id =
            extract_file_id(&alice.request("REQ_UPLOAD U bob f.bin 200000").await);
        assert_eq!(
            alice.request(&format!("UPLOAD_DATA {}", file_id)).await,
            "SUCCESS 200 START_UPLOAD 0"
        );

        // Two full chunks, then the connection drops mid-transfer
        send_chunk(&mut alice, 0, &data[..65536]).await;
        send_chunk(&mut alice, 65536, &data[65536..131072]).await;
        drop(alice);

        // Let the server task observe the hangup and park the upload
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            domain.files.active(&file_id).await.unwrap().bytes_received,
            131072
        );

        // Reconnect with the surviving session and resume where the
        // server says
        let mut again = connect(&domain, &store).await;
        assert_eq!(
            again.request(&format!("AUTH {}", sid)).await,
            "SUCCESS 200 AUTH_OK"
        );
        assert_eq!(
            again
                .request(&format!("REQ_RESUME_UPLOAD {}", file_id))
                .await,
            "SUCCESS 200 READY_UPLOAD 131072"
        );
        assert_eq!(
            again.request(&format!("UPLOAD_DATA {}", file_id)).await,
            "SUCCESS 200 START_UPLOAD 131072"
        );
        send_chunk(&mut again, 131072, &data[131072..196608]).await;
        send_chunk(&mut again, 196608, &data[196608..]).await;
        send_eof(&mut again, 200000).await;
        assert_eq!(again.recv().await, "SUCCESS 200 UPLOAD_COMPLETE");

        let stored = tokio::fs::read(store.upload_path(&file_id)).await.unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn test_upload_eof_before_filesize_is_interrupted() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, _) = login(&domain, &store, "alice").await;
        let (mut bob, _) = login(&domain, &store, "bob").await;
        make_friends(&mut alice, &mut bob).await;

        let file_id = extract_file_id(&alice.request("REQ_UPLOAD U bob f.bin 1000").await);
        alice.request(&format!("UPLOAD_DATA {}", file_id)).await;
        send_chunk(&mut alice, 0, &pattern(400)).await;
        send_eof(&mut alice, 400).await;
        assert_eq!(alice.recv().await, "FAIL 500 UPLOAD_INTERRUPTED");

        // The entry stays active for a later resume
        assert_eq!(
            alice
                .request(&format!("REQ_RESUME_UPLOAD {}", file_id))
                .await,
            "SUCCESS 200 READY_UPLOAD 400"
        );
    }

    #[tokio::test]
    async fn test_download_resume_reconstructs_file() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, _) = login(&domain, &store, "alice").await;
        let (mut bob, _) = login(&domain, &store, "bob").await;
        make_friends(&mut alice, &mut bob).await;

        let data = pattern(200_000);
        let file_id = upload(&mut alice, "REQ_UPLOAD U bob f.bin 200000", &data).await;
        bob.recv().await; // NOTIFY_FILE

        // Pretend a first download delivered the prefix; ask for the rest
        assert_eq!(
            bob.request(&format!("REQ_RESUME_DOWNLOAD {} 131072", file_id))
                .await,
            "SUCCESS 200 RESUME_DOWNLOAD 131072"
        );
        let tail = recv_file(&mut bob).await;
        assert_eq!(bob.recv().await, "SUCCESS 200 DOWNLOAD_COMPLETE");

        let mut rebuilt = data[..131072].to_vec();
        rebuilt.extend_from_slice(&tail);
        assert_eq!(rebuilt, data);

        assert_eq!(
            bob.request(&format!("REQ_RESUME_DOWNLOAD {} 200000", file_id))
                .await,
            "FAIL 400 INVALID_OFFSET"
        );
        assert_eq!(
            bob.request(&format!("REQ_CANCEL_DOWNLOAD {}", file_id)).await,
            "SUCCESS 200 DOWNLOAD_CANCELLED"
        );
    }

    #[tokio::test]
    async fn test_cancel_upload_discards_partial_file() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, _) = login(&domain, &store, "alice").await;
        let (mut bob, _) = login(&domain, &store, "bob").await;
        make_friends(&mut alice, &mut bob).await;

        let file_id = extract_file_id(&alice.request("REQ_UPLOAD U bob f.bin 1000").await);
        alice.request(&format!("UPLOAD_DATA {}", file_id)).await;
        send_chunk(&mut alice, 0, &pattern(400)).await;
        send_eof(&mut alice, 400).await;
        alice.recv().await; // UPLOAD_INTERRUPTED

        assert_eq!(
            alice
                .request(&format!("REQ_CANCEL_UPLOAD {}", file_id))
                .await,
            "SUCCESS 200 UPLOAD_CANCELLED"
        );
        assert!(tokio::fs::metadata(store.upload_path(&file_id)).await.is_err());
        assert_eq!(
            alice
                .request(&format!("REQ_RESUME_UPLOAD {}", file_id))
                .await,
            "FAIL 404 FILE_ID_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_group_upload_notifies_members() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, _) = login(&domain, &store, "alice").await;
        let (mut carol, _) = login(&domain, &store, "carol").await;

        alice.request("INIT_GROUP devs 5").await;
        alice.request("SEND_INVITE devs carol").await;
        carol.recv().await;
        carol.request("CONFIRM_JOIN devs").await;
        alice.recv().await;

        let data = pattern(1000);
        let file_id = upload(&mut alice, "REQ_UPLOAD G devs notes.txt 1000", &data).await;
        assert_eq!(
            carol.recv().await,
            format!("NOTIFY_FILE G devs alice {} notes.txt", file_id)
        );

        // The group history carries the FILE record
        let header = carol.request("HISTORY G devs 0 0").await;
        assert_eq!(header, "SUCCESS 200 1");
        let record = carol.recv().await;
        assert!(record.contains("|FILE|"));
        assert!(record.contains(&format!("{}:notes.txt", file_id)));
    }

    #[tokio::test]
    async fn test_req_upload_validation() {
        let (domain, store, _dir) = harness().await;
        let (mut alice, _) = login(&domain, &store, "alice").await;

        assert_eq!(
            alice.request("REQ_UPLOAD U ghost f.bin 1000").await,
            "FAIL 404 TARGET_NOT_FOUND"
        );
        assert_eq!(
            alice.request("REQ_UPLOAD G nogroup f.bin 1000").await,
            "FAIL 404 TARGET_NOT_FOUND"
        );
        assert_eq!(
            alice
                .request("REQ_UPLOAD U alice f.bin 104857601")
                .await,
            "FAIL 400 FILE_TOO_LARGE"
        );
        assert_eq!(
            alice.request("UPLOAD_DATA nosuchfile").await,
            "FAIL 404 FILE_ID_NOT_FOUND"
        );
        assert_eq!(
            alice.request("REQ_DOWNLOAD nosuchfile").await,
            "FAIL 404 FILE_NOT_FOUND"
        );
    }
}
