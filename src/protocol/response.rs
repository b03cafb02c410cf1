//! Reply and notification lines
//!
//! Every command produces exactly one terminal status line,
//! `SUCCESS <code> <payload>` or `FAIL <code> <reason>`. Asynchronous
//! events are pushed to online peers as single `NOTIFY*` lines.

use std::fmt;

use super::command::ParseError;

/// A single-line command reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    ok: bool,
    code: u16,
    text: String,
}

impl Reply {
    /// Build a `SUCCESS <code> <text>` reply
    pub fn success<T: Into<String>>(code: u16, text: T) -> Self {
        Reply {
            ok: true,
            code,
            text: text.into(),
        }
    }

    /// Build a `FAIL <code> <reason>` reply
    pub fn fail<T: Into<String>>(code: u16, text: T) -> Self {
        Reply {
            ok: false,
            code,
            text: text.into(),
        }
    }

    /// Reply for a command that requires a bound session on an unbound
    /// connection
    pub fn unauthorized() -> Self {
        Reply::fail(401, "UNAUTHORIZED")
    }

    pub fn is_success(&self) -> bool {
        self.ok
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The wire form including the line terminator
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.ok { "SUCCESS" } else { "FAIL" };
        if self.text.is_empty() {
            write!(f, "{} {}", status, self.code)
        } else {
            write!(f, "{} {} {}", status, self.code, self.text)
        }
    }
}

impl From<ParseError> for Reply {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidFormat => Reply::fail(400, "INVALID_FORMAT"),
            ParseError::InvalidType => Reply::fail(400, "INVALID_TYPE"),
            ParseError::InvalidLimit => Reply::fail(400, "INVALID_LIMIT"),
            ParseError::Unknown => Reply::fail(400, "UNKNOWN_COMMAND"),
        }
    }
}

/// Builders for the `NOTIFY*` event lines delivered to online peers
pub mod notify {
    /// `NOTIFY SESSION_EXPIRED <sid>` — written to an evicted connection
    /// just before its socket is closed
    pub fn session_expired(session_id: &str) -> String {
        format!("NOTIFY SESSION_EXPIRED {}", session_id)
    }

    pub fn friend_request(sender: &str) -> String {
        format!("NOTIFY_FRIEND_REQUEST {}", sender)
    }

    pub fn friend_accepted(user: &str) -> String {
        format!("NOTIFY_FRIEND_ACCEPTED {}", user)
    }

    pub fn friend_rejected(user: &str) -> String {
        format!("NOTIFY_FRIEND_REJECTED {}", user)
    }

    pub fn group_invite(group: &str, sender: &str) -> String {
        format!("NOTIFY_GROUP_INVITE {} {}", group, sender)
    }

    pub fn member_join(group: &str, user: &str) -> String {
        format!("NOTIFY_MEMBER_JOIN {} {}", group, user)
    }

    pub fn invite_rejected(group: &str, user: &str) -> String {
        format!("NOTIFY_INVITE_REJECTED {} {}", group, user)
    }

    pub fn ejected(group: &str, admin: &str) -> String {
        format!("NOTIFY_EJECTED {} {}", group, admin)
    }

    pub fn member_left(group: &str, user: &str) -> String {
        format!("NOTIFY_MEMBER_LEFT {} {}", group, user)
    }

    pub fn text_user(sender: &str, ts: i64, content: &str) -> String {
        format!("NOTIFY_TEXT U {} {} {}", sender, ts, content)
    }

    pub fn text_group(group: &str, sender: &str, ts: i64, content: &str) -> String {
        format!("NOTIFY_TEXT G {} {} {} {}", group, sender, ts, content)
    }

    pub fn file_user(sender: &str, file_id: &str, filename: &str) -> String {
        format!("NOTIFY_FILE U {} {} {}", sender, file_id, filename)
    }

    pub fn file_group(group: &str, sender: &str, file_id: &str, filename: &str) -> String {
        format!("NOTIFY_FILE G {} {} {} {}", group, sender, file_id, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_format() {
        assert_eq!(
            Reply::success(201, "REGISTERED alice").to_string(),
            "SUCCESS 201 REGISTERED alice"
        );
        assert_eq!(
            Reply::fail(404, "USER_NOT_FOUND").to_string(),
            "FAIL 404 USER_NOT_FOUND"
        );
        assert_eq!(Reply::success(200, "X").to_line(), "SUCCESS 200 X\n");
    }

    #[test]
    fn test_parse_error_mapping() {
        assert_eq!(
            Reply::from(ParseError::Unknown).to_string(),
            "FAIL 400 UNKNOWN_COMMAND"
        );
        assert_eq!(
            Reply::from(ParseError::InvalidLimit).to_string(),
            "FAIL 400 INVALID_LIMIT"
        );
    }

    #[test]
    fn test_notify_lines() {
        assert_eq!(
            notify::text_group("devs", "alice", 1700000000, "hi all"),
            "NOTIFY_TEXT G devs alice 1700000000 hi all"
        );
        assert_eq!(
            notify::session_expired("abc"),
            "NOTIFY SESSION_EXPIRED abc"
        );
    }
}
