//! Request-line grammar for the text protocol
//!
//! Every client request is one `\n`-terminated line: a verb followed by
//! whitespace-separated arguments. `TEXT` and `HISTORY` treat the trailing
//! portion as free-form content; `REQ_UPLOAD` filenames may contain spaces,
//! so the tail is split at the last space to peel off the size.

/// Addressing tag for commands that target either a user or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    User,
    Group,
}

impl Scope {
    /// Parse a `U`/`G` tag
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "U" => Some(Scope::User),
            "G" => Some(Scope::Group),
            _ => None,
        }
    }

    /// Wire representation of the tag
    pub fn tag(&self) -> &'static str {
        match self {
            Scope::User => "U",
            Scope::Group => "G",
        }
    }
}

/// Default member limit when `INIT_GROUP` omits one
pub const DEFAULT_GROUP_LIMIT: u32 = 20;

/// A parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { username: String, password: String },
    Login { username: String, password: String },
    Auth { session_id: String },
    Logout,
    AddFriend { target: String },
    ConfirmFriend { sender: String },
    RejectFriend { sender: String },
    GetFriends,
    InitGroup { name: String, max_members: u32 },
    SendInvite { group: String, target: String },
    ConfirmJoin { group: String },
    RejectJoin { group: String },
    EjectUser { group: String, target: String },
    GetMembers { group: String },
    GetGroups,
    Text { scope: Scope, target: String, content: String },
    History { scope: Scope, target: String, begin: String, end: String },
    ReqUpload { scope: Scope, target: String, filename: String, filesize: u64 },
    UploadData { file_id: String },
    ReqResumeUpload { file_id: String },
    ReqCancelUpload { file_id: String },
    ReqDownload { file_id: String },
    ReqResumeDownload { file_id: String, offset: u64 },
    ReqCancelDownload { file_id: String },
}

/// Why a request line failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Missing or malformed arguments
    InvalidFormat,
    /// Target tag was neither `U` nor `G`
    InvalidType,
    /// `INIT_GROUP` name missing, or limit not a positive integer
    InvalidLimit,
    /// Verb not in the command catalogue
    Unknown,
}

/// Pop the next whitespace-delimited token, returning it and the remainder
fn next_token(input: &str) -> (Option<&str>, &str) {
    let input = input.trim_start();
    if input.is_empty() {
        return (None, input);
    }
    match input.find(char::is_whitespace) {
        Some(idx) => (Some(&input[..idx]), &input[idx..]),
        None => (Some(input), ""),
    }
}

/// Pop a required token or fail with `InvalidFormat`
fn require_token<'a>(input: &'a str) -> Result<(&'a str, &'a str), ParseError> {
    match next_token(input) {
        (Some(tok), rest) => Ok((tok, rest)),
        (None, _) => Err(ParseError::InvalidFormat),
    }
}

fn require_scope(input: &str) -> Result<(Scope, &str), ParseError> {
    let (tag, rest) = require_token(input)?;
    let scope = Scope::parse(tag).ok_or(ParseError::InvalidType)?;
    Ok((scope, rest))
}

impl Command {
    /// Parse one request line (already stripped of its terminator)
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let (verb, rest) = require_token(line)?;

        match verb {
            "REGISTER" => {
                let (username, rest) = require_token(rest)?;
                let (password, _) = require_token(rest)?;
                Ok(Command::Register {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            "LOGIN" => {
                let (username, rest) = require_token(rest)?;
                let (password, _) = require_token(rest)?;
                Ok(Command::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            "AUTH" => {
                let (session_id, _) = require_token(rest)?;
                Ok(Command::Auth {
                    session_id: session_id.to_string(),
                })
            }
            "LOGOUT" => Ok(Command::Logout),
            "ADD_FRIEND" => {
                let (target, _) = require_token(rest)?;
                Ok(Command::AddFriend {
                    target: target.to_string(),
                })
            }
            "CONFIRM_FRIEND" => {
                let (sender, _) = require_token(rest)?;
                Ok(Command::ConfirmFriend {
                    sender: sender.to_string(),
                })
            }
            "REJECT_FRIEND" => {
                let (sender, _) = require_token(rest)?;
                Ok(Command::RejectFriend {
                    sender: sender.to_string(),
                })
            }
            "GET_FRIENDS" => Ok(Command::GetFriends),
            "INIT_GROUP" => {
                let (name, rest) = match next_token(rest) {
                    (Some(tok), rest) => (tok, rest),
                    (None, _) => return Err(ParseError::InvalidLimit),
                };
                let max_members = match next_token(rest) {
                    (Some(tok), _) => match tok.parse::<u32>() {
                        Ok(n) if n > 0 => n,
                        _ => return Err(ParseError::InvalidLimit),
                    },
                    (None, _) => DEFAULT_GROUP_LIMIT,
                };
                Ok(Command::InitGroup {
                    name: name.to_string(),
                    max_members,
                })
            }
            "SEND_INVITE" => {
                let (group, rest) = require_token(rest)?;
                let (target, _) = require_token(rest)?;
                Ok(Command::SendInvite {
                    group: group.to_string(),
                    target: target.to_string(),
                })
            }
            "CONFIRM_JOIN" => {
                let (group, _) = require_token(rest)?;
                Ok(Command::ConfirmJoin {
                    group: group.to_string(),
                })
            }
            "REJECT_JOIN" => {
                let (group, _) = require_token(rest)?;
                Ok(Command::RejectJoin {
                    group: group.to_string(),
                })
            }
            "EJECT_USER" => {
                let (group, rest) = require_token(rest)?;
                let (target, _) = require_token(rest)?;
                Ok(Command::EjectUser {
                    group: group.to_string(),
                    target: target.to_string(),
                })
            }
            "GET_MEMBERS" => {
                let (group, _) = require_token(rest)?;
                Ok(Command::GetMembers {
                    group: group.to_string(),
                })
            }
            "GET_GROUPS" => Ok(Command::GetGroups),
            "TEXT" => {
                let (scope, rest) = require_scope(rest)?;
                let (target, rest) = require_token(rest)?;
                let content = rest.trim();
                if content.is_empty() {
                    return Err(ParseError::InvalidFormat);
                }
                Ok(Command::Text {
                    scope,
                    target: target.to_string(),
                    content: content.to_string(),
                })
            }
            "HISTORY" => {
                let (scope, rest) = require_scope(rest)?;
                let (target, rest) = require_token(rest)?;
                // Both bounds are optional; an absent bound is unbounded.
                let (begin, rest) = next_token(rest);
                let (end, _) = next_token(rest);
                Ok(Command::History {
                    scope,
                    target: target.to_string(),
                    begin: begin.unwrap_or_default().to_string(),
                    end: end.unwrap_or_default().to_string(),
                })
            }
            "REQ_UPLOAD" => {
                let (scope, rest) = require_scope(rest)?;
                let (target, rest) = require_token(rest)?;
                // The tail is "<filename> <filesize>" where the filename may
                // contain spaces; split at the last space.
                let tail = rest.trim();
                let split = tail.rfind(' ').ok_or(ParseError::InvalidFormat)?;
                let filename = tail[..split].trim();
                let filesize = tail[split + 1..]
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidFormat)?;
                if filename.is_empty() || filesize == 0 {
                    return Err(ParseError::InvalidFormat);
                }
                Ok(Command::ReqUpload {
                    scope,
                    target: target.to_string(),
                    filename: filename.to_string(),
                    filesize,
                })
            }
            "UPLOAD_DATA" => {
                let (file_id, _) = require_token(rest)?;
                Ok(Command::UploadData {
                    file_id: file_id.to_string(),
                })
            }
            "REQ_RESUME_UPLOAD" => {
                let (file_id, _) = require_token(rest)?;
                Ok(Command::ReqResumeUpload {
                    file_id: file_id.to_string(),
                })
            }
            "REQ_CANCEL_UPLOAD" => {
                let (file_id, _) = require_token(rest)?;
                Ok(Command::ReqCancelUpload {
                    file_id: file_id.to_string(),
                })
            }
            "REQ_DOWNLOAD" => {
                let (file_id, _) = require_token(rest)?;
                Ok(Command::ReqDownload {
                    file_id: file_id.to_string(),
                })
            }
            "REQ_RESUME_DOWNLOAD" => {
                let (file_id, rest) = require_token(rest)?;
                let (offset_tok, _) = require_token(rest)?;
                let offset = offset_tok
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidFormat)?;
                Ok(Command::ReqResumeDownload {
                    file_id: file_id.to_string(),
                    offset,
                })
            }
            "REQ_CANCEL_DOWNLOAD" => {
                let (file_id, _) = require_token(rest)?;
                Ok(Command::ReqCancelDownload {
                    file_id: file_id.to_string(),
                })
            }
            _ => Err(ParseError::Unknown),
        }
    }

    /// Whether this command requires a bound session
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            Command::Register { .. } | Command::Login { .. } | Command::Auth { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_login() {
        let cmd = Command::parse("REGISTER alice s3cret").unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                username: "alice".to_string(),
                password: "s3cret".to_string(),
            }
        );
        assert!(!cmd.requires_auth());

        assert_eq!(
            Command::parse("LOGIN alice s3cret").unwrap(),
            Command::Login {
                username: "alice".to_string(),
                password: "s3cret".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_arguments() {
        assert_eq!(Command::parse("REGISTER alice"), Err(ParseError::InvalidFormat));
        assert_eq!(Command::parse("LOGIN"), Err(ParseError::InvalidFormat));
        assert_eq!(Command::parse("ADD_FRIEND"), Err(ParseError::InvalidFormat));
        assert_eq!(Command::parse("AUTH"), Err(ParseError::InvalidFormat));
    }

    #[test]
    fn test_unknown_verb() {
        assert_eq!(Command::parse("FROBNICATE x y"), Err(ParseError::Unknown));
    }

    #[test]
    fn test_text_tail_preserves_spaces() {
        let cmd = Command::parse("TEXT U bob hello world  again").unwrap();
        match cmd {
            Command::Text { scope, target, content } => {
                assert_eq!(scope, Scope::User);
                assert_eq!(target, "bob");
                assert_eq!(content, "hello world  again");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_text_bad_type_tag() {
        assert_eq!(Command::parse("TEXT X bob hi"), Err(ParseError::InvalidType));
        assert_eq!(Command::parse("TEXT U bob"), Err(ParseError::InvalidFormat));
    }

    #[test]
    fn test_history_optional_bounds() {
        let cmd = Command::parse("HISTORY U bob 0 0").unwrap();
        assert_eq!(
            cmd,
            Command::History {
                scope: Scope::User,
                target: "bob".to_string(),
                begin: "0".to_string(),
                end: "0".to_string(),
            }
        );

        let cmd = Command::parse("HISTORY G devs").unwrap();
        match cmd {
            Command::History { begin, end, .. } => {
                assert!(begin.is_empty());
                assert!(end.is_empty());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_init_group_limit() {
        assert_eq!(
            Command::parse("INIT_GROUP devs 5").unwrap(),
            Command::InitGroup {
                name: "devs".to_string(),
                max_members: 5,
            }
        );
        // Limit omitted falls back to the default
        assert_eq!(
            Command::parse("INIT_GROUP devs").unwrap(),
            Command::InitGroup {
                name: "devs".to_string(),
                max_members: DEFAULT_GROUP_LIMIT,
            }
        );
        assert_eq!(Command::parse("INIT_GROUP devs zero"), Err(ParseError::InvalidLimit));
        assert_eq!(Command::parse("INIT_GROUP devs 0"), Err(ParseError::InvalidLimit));
        assert_eq!(Command::parse("INIT_GROUP"), Err(ParseError::InvalidLimit));
    }

    #[test]
    fn test_req_upload_filename_with_spaces() {
        let cmd = Command::parse("REQ_UPLOAD U bob my vacation photo.jpg 200000").unwrap();
        match cmd {
            Command::ReqUpload { scope, target, filename, filesize } => {
                assert_eq!(scope, Scope::User);
                assert_eq!(target, "bob");
                assert_eq!(filename, "my vacation photo.jpg");
                assert_eq!(filesize, 200000);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_req_upload_rejects_bad_size() {
        assert_eq!(
            Command::parse("REQ_UPLOAD U bob f.bin 0"),
            Err(ParseError::InvalidFormat)
        );
        assert_eq!(
            Command::parse("REQ_UPLOAD U bob f.bin notanumber"),
            Err(ParseError::InvalidFormat)
        );
        assert_eq!(
            Command::parse("REQ_UPLOAD U bob justonefield"),
            Err(ParseError::InvalidFormat)
        );
    }

    #[test]
    fn test_resume_download() {
        assert_eq!(
            Command::parse("REQ_RESUME_DOWNLOAD 1700000000_1 131072").unwrap(),
            Command::ReqResumeDownload {
                file_id: "1700000000_1".to_string(),
                offset: 131072,
            }
        );
        assert_eq!(
            Command::parse("REQ_RESUME_DOWNLOAD 1700000000_1"),
            Err(ParseError::InvalidFormat)
        );
    }

    #[test]
    fn test_auth_required_flags() {
        assert!(Command::parse("LOGOUT").unwrap().requires_auth());
        assert!(Command::parse("GET_FRIENDS").unwrap().requires_auth());
        assert!(Command::parse("REQ_DOWNLOAD f1").unwrap().requires_auth());
        assert!(!Command::parse("AUTH sid").unwrap().requires_auth());
    }
}
