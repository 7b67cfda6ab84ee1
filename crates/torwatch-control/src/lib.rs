#![deny(unsafe_code)]

//! Tor control-port protocol support.
//!
//! Implements the client side of tor's control connection: CRLF line
//! framing, the quoting and key=value grammar torrc and the control
//! protocol share, typed reply lines, and an async session that
//! multiplexes commands and SETEVENTS subscriptions over one socket.
//! The process supervisor in `torwatch-core` builds on this crate.

/// Asynchronous event kinds and decoded event payloads.
pub mod events;
/// Incremental CRLF line scanner with a maximum line length.
pub mod framing;
/// Value escaping and the quoted-string / key=value parsers.
pub mod quote;
/// Typed reply lines and collected command replies.
pub mod reply;
/// The control session: command queue, demux, and event fan-out.
pub mod session;

pub use events::{AsyncEvent, EventKind};
pub use framing::{FramingError, LineScanner, ScanFailure, ScannedLine};
pub use quote::{escape_value, parse_key_value, parse_quoted, KeyValue, QuoteError};
pub use reply::{ProtocolError, Reply, ReplyLine, ReplyPosition};
pub use session::{ControlError, ControlSession, ListenerAddr, MAX_LINE_LEN};
