//! Typed reply lines from the control port.
//!
//! Every line tor sends is `<3-digit status><position><text>` in
//! US-ASCII. [`ReplyLine::parse`] enforces that shape; the session
//! layer decides what to do with the typed result.

use crate::framing::FramingError;

/// A violation of the control protocol by the daemon. All of these are
/// fatal to the session that observes them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A line exceeded the maximum length and was cut short.
    #[error("truncated line from tor")]
    TruncatedLine,
    /// A line was too short or its status was not three digits.
    #[error("malformed line from tor")]
    MalformedLine,
    #[error("non-US-ASCII in line from tor")]
    NonAscii,
    /// A synchronous reply carried an unrecognized position character.
    #[error("unknown line type from tor")]
    UnknownLineType,
    /// Data replies (`+`) are not implemented.
    #[error("data replies from tor are not supported")]
    DataReplyUnsupported,
    /// An asynchronous reply line did not fit the event grammar.
    #[error("invalid async reply line")]
    InvalidAsyncReply,
    #[error("duplicate key in async reply")]
    DuplicateAsyncKey,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Where a reply line sits within a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPosition {
    /// `-`: an intermediate line, more follow.
    Mid,
    /// `+`: the start of a data reply.
    Data,
    /// ` `: the final line of a reply.
    End,
}

/// One parsed control-port line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    pub position: ReplyPosition,
    pub text: String,
}

impl ReplyLine {
    /// Parse a framed line (terminator already stripped).
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 4 {
            return Err(ProtocolError::MalformedLine);
        }
        if !bytes.is_ascii() {
            return Err(ProtocolError::NonAscii);
        }
        let digits = &bytes[..3];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::MalformedLine);
        }
        let status = digits
            .iter()
            .fold(0u16, |acc, &b| acc * 10 + u16::from(b - b'0'));
        let position = match bytes[3] {
            b'-' => ReplyPosition::Mid,
            b'+' => ReplyPosition::Data,
            b' ' => ReplyPosition::End,
            // Async replies have their own grammar, so a bad position
            // character is reported against it.
            _ if (600..700).contains(&status) => return Err(ProtocolError::InvalidAsyncReply),
            _ => return Err(ProtocolError::UnknownLineType),
        };
        let text = String::from_utf8(bytes[4..].to_vec()).map_err(|_| ProtocolError::NonAscii)?;
        Ok(ReplyLine {
            status,
            position,
            text,
        })
    }

    /// True for 6yz lines, which belong to the event stream rather than
    /// to any queued command.
    pub fn is_async(&self) -> bool {
        (600..700).contains(&self.status)
    }
}

/// The collected reply to one command: the final line's status and
/// text, plus any intermediate lines in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub text: String,
    pub data: Vec<ReplyLine>,
}

impl Reply {
    /// True for the plain success reply, `250 OK`.
    pub fn is_ok(&self) -> bool {
        self.status == 250 && self.text == "OK"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_end_line() {
        let line = ReplyLine::parse(b"250 OK").unwrap();
        assert_eq!(
            line,
            ReplyLine {
                status: 250,
                position: ReplyPosition::End,
                text: "OK".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_mid_line() {
        let line = ReplyLine::parse(b"250-version=0.4.8.12").unwrap();
        assert_eq!(line.status, 250);
        assert_eq!(line.position, ReplyPosition::Mid);
        assert_eq!(line.text, "version=0.4.8.12");
    }

    #[test]
    fn test_parse_data_line() {
        let line = ReplyLine::parse(b"250+info=").unwrap();
        assert_eq!(line.position, ReplyPosition::Data);
    }

    #[test]
    fn test_parse_empty_text() {
        let line = ReplyLine::parse(b"650 ").unwrap();
        assert_eq!(line.status, 650);
        assert_eq!(line.text, "");
    }

    #[test]
    fn test_too_short_is_malformed() {
        assert_eq!(ReplyLine::parse(b"250"), Err(ProtocolError::MalformedLine));
        assert_eq!(ReplyLine::parse(b""), Err(ProtocolError::MalformedLine));
    }

    #[test]
    fn test_non_digit_status_is_malformed() {
        assert_eq!(
            ReplyLine::parse(b"2x0 OK"),
            Err(ProtocolError::MalformedLine)
        );
    }

    #[test]
    fn test_non_ascii_rejected() {
        assert_eq!(
            ReplyLine::parse(b"250 f\xc3\xb6o"),
            Err(ProtocolError::NonAscii)
        );
    }

    #[test]
    fn test_unknown_position_on_sync_line() {
        assert_eq!(
            ReplyLine::parse(b"250?ok"),
            Err(ProtocolError::UnknownLineType)
        );
    }

    #[test]
    fn test_unknown_position_on_async_line() {
        assert_eq!(
            ReplyLine::parse(b"650?CIRC"),
            Err(ProtocolError::InvalidAsyncReply)
        );
    }

    #[test]
    fn test_is_async_boundaries() {
        for (status, expect) in [(599u16, false), (600, true), (650, true), (699, true), (700, false)] {
            let line = ReplyLine {
                status,
                position: ReplyPosition::End,
                text: String::new(),
            };
            assert_eq!(line.is_async(), expect, "status {status}");
        }
    }

    #[test]
    fn test_reply_is_ok() {
        let ok = Reply {
            status: 250,
            text: "OK".to_string(),
            data: vec![],
        };
        assert!(ok.is_ok());
        let err = Reply {
            status: 515,
            text: "Bad authentication".to_string(),
            data: vec![],
        };
        assert!(!err.is_ok());
        let odd = Reply {
            status: 250,
            text: "done".to_string(),
            data: vec![],
        };
        assert!(!odd.is_ok());
    }
}
