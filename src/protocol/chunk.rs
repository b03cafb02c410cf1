//! Binary chunk framing for file transfer
//!
//! Chunk format:
//! ```text
//! +----------+----------+------------------+
//! | offset   | length   | payload          |
//! | (4B, BE) | (4B, BE) | (length bytes)   |
//! +----------+----------+------------------+
//! ```
//!
//! Chunks share the session socket with the text protocol: a transfer
//! phase starts after a status line and ends with a zero-length chunk.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Chunk header size: 4 bytes offset + 4 bytes length
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Maximum chunk payload size (64 KiB)
pub const MAX_CHUNK_SIZE: usize = 65536;

/// Header of a single binary chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Byte offset of this chunk within the file
    pub offset: u32,
    /// Payload length; zero marks end of stream
    pub length: u32,
}

impl ChunkHeader {
    /// Create a new header
    pub fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// End-of-stream marker at the given offset
    pub fn eof(offset: u32) -> Self {
        Self { offset, length: 0 }
    }

    /// Whether this header terminates the stream
    pub fn is_eof(&self) -> bool {
        self.length == 0
    }

    /// Encode this header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(CHUNK_HEADER_SIZE);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
    }

    /// Decode a header from exactly [`CHUNK_HEADER_SIZE`] bytes,
    /// rejecting lengths beyond [`MAX_CHUNK_SIZE`]
    pub fn decode(data: &[u8; CHUNK_HEADER_SIZE]) -> io::Result<Self> {
        let mut cursor = Cursor::new(&data[..]);
        let offset = cursor.get_u32();
        let length = cursor.get_u32();

        if length as usize > MAX_CHUNK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Chunk payload too large: {} bytes (max: {})",
                    length, MAX_CHUNK_SIZE
                ),
            ));
        }

        Ok(Self { offset, length })
    }
}

/// Read one chunk header from the stream
pub async fn read_header<R>(reader: &mut R) -> io::Result<ChunkHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK_HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    ChunkHeader::decode(&buf)
}

/// Write one chunk (header + payload) to the stream
pub async fn write_chunk<W>(writer: &mut W, offset: u32, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= MAX_CHUNK_SIZE);
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    ChunkHeader::new(offset, payload.len() as u32).encode(&mut buf);
    buf.put_slice(payload);
    writer.write_all(&buf).await
}

/// Write the end-of-stream marker at the given offset
pub async fn write_eof<W>(writer: &mut W, offset: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
    ChunkHeader::eof(offset).encode(&mut buf);
    writer.write_all(&buf).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let original = ChunkHeader::new(131072, 65536);
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(buf.len(), CHUNK_HEADER_SIZE);

        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        raw.copy_from_slice(&buf);
        let decoded = ChunkHeader::decode(&raw).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_layout() {
        let mut buf = BytesMut::new();
        ChunkHeader::new(1, 2).encode(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn test_eof_marker() {
        let header = ChunkHeader::eof(200000);
        assert!(header.is_eof());
        assert_eq!(header.offset, 200000);
        assert!(!ChunkHeader::new(0, 1).is_eof());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32((MAX_CHUNK_SIZE + 1) as u32);
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        raw.copy_from_slice(&buf);
        assert!(ChunkHeader::decode(&raw).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let payload = vec![0xABu8; 300];
        write_chunk(&mut client, 512, &payload).await.unwrap();
        write_eof(&mut client, 812).await.unwrap();

        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header.offset, 512);
        assert_eq!(header.length, 300);

        let mut received = vec![0u8; header.length as usize];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(received, payload);

        let eof = read_header(&mut server).await.unwrap();
        assert!(eof.is_eof());
        assert_eq!(eof.offset, 812);
    }
}
