//! Application control protocol spoken over an established channel.
//!
//! Every datagram (or stream read) is UTF-8 text of one of two shapes:
//! `STATUS:<PUNCH|CONNECTED|CLOSE>` or `MSG:<payload>`.

use std::borrow::Cow;

const STATUS_PREFIX: &str = "STATUS:";
const MSG_PREFIX: &str = "MSG:";

/// Stream keep-alive, filtered out before parsing.
pub const HEARTBEAT: u8 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Punch,
    Connected,
    Close,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Punch => "PUNCH",
            Status::Connected => "CONNECTED",
            Status::Close => "CLOSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Status(Status),
    Msg(String),
}

impl Message {
    /// `None` for unknown prefixes and non UTF-8 input
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(buf).ok()?;

        if let Some(status) = text.strip_prefix(STATUS_PREFIX) {
            let status = match status {
                "PUNCH" => Status::Punch,
                "CONNECTED" => Status::Connected,
                "CLOSE" => Status::Close,
                _ => return None,
            };
            Some(Message::Status(status))
        } else {
            text.strip_prefix(MSG_PREFIX)
                .map(|payload| Message::Msg(payload.to_string()))
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Status(s) => format!("{}{}", STATUS_PREFIX, s.as_str()).into_bytes(),
            Message::Msg(payload) => format!("{}{}", MSG_PREFIX, payload).into_bytes(),
        }
    }
}

/// Drop heartbeat sentinels wherever they sit in a stream read; `None` if
/// nothing else is left. Text frames never carry a NUL.
pub fn strip_heartbeats(buf: &[u8]) -> Option<Cow<'_, [u8]>> {
    if !buf.contains(&HEARTBEAT) {
        return (!buf.is_empty()).then_some(Cow::Borrowed(buf));
    }

    let rest: Vec<u8> = buf.iter().copied().filter(|b| *b != HEARTBEAT).collect();
    (!rest.is_empty()).then_some(Cow::Owned(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            Message::parse(b"STATUS:PUNCH"),
            Some(Message::Status(Status::Punch))
        );
        assert_eq!(
            Message::parse(b"STATUS:CONNECTED"),
            Some(Message::Status(Status::Connected))
        );
        assert_eq!(
            Message::parse(b"STATUS:CLOSE"),
            Some(Message::Status(Status::Close))
        );
        assert_eq!(
            Message::parse("MSG:héllo: there".as_bytes()),
            Some(Message::Msg("héllo: there".into()))
        );
        assert_eq!(Message::parse(b"MSG:"), Some(Message::Msg("".into())));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(Message::parse(b"STATUS:WHAT"), None);
        assert_eq!(Message::parse(b"HELLO"), None);
        assert_eq!(Message::parse(b"msg:lower"), None);
        assert_eq!(Message::parse(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_encode() {
        assert_eq!(Message::Status(Status::Close).encode(), b"STATUS:CLOSE");
        assert_eq!(Message::Msg("hi".into()).encode(), b"MSG:hi");
    }

    #[test]
    fn test_strip_heartbeats() {
        assert_eq!(strip_heartbeats(&[0]), None);
        assert_eq!(strip_heartbeats(&[0, 0, 0]), None);
        assert_eq!(strip_heartbeats(b""), None);

        fn strip(buf: &[u8]) -> Option<Vec<u8>> {
            strip_heartbeats(buf).map(|b| b.into_owned())
        }

        assert_eq!(strip(b"\0\0MSG:x"), Some(b"MSG:x".to_vec()));
        assert_eq!(strip(b"MSG:x"), Some(b"MSG:x".to_vec()));
        assert_eq!(strip(b"MSG:hi\0"), Some(b"MSG:hi".to_vec()));
        assert_eq!(strip(b"\0STATUS:CLOSE\0\0"), Some(b"STATUS:CLOSE".to_vec()));

        let msg = strip(b"STATUS:PUNCH\0").unwrap();
        assert_eq!(Message::parse(&msg), Some(Message::Status(Status::Punch)));
    }
}
