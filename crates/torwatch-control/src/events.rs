//! Asynchronous event kinds and their decoded payloads.

use std::collections::BTreeMap;
use std::fmt;

/// An asynchronous event type usable with SETEVENTS.
///
/// Variants are declared in ASCII order of their keywords, so the
/// derived [`Ord`] sorts exactly as the wire keywords do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Addrmap,
    AuthdirNewdescs,
    BuildtimeoutSet,
    Bw,
    CellStats,
    Circ,
    CircBw,
    CircMinor,
    ClientsSeen,
    ConfChanged,
    ConnBw,
    Debug,
    Descchanged,
    Err,
    Guard,
    HsDesc,
    Info,
    NetworkLiveness,
    Newdesc,
    Notice,
    Orconn,
    Signal,
    StatusClient,
    StatusGeneral,
    StatusServer,
    Stream,
    StreamBw,
    TbEmpty,
    TransportLaunched,
    Warn,
    // HS_DESC_CONTENT, NEWCONSENSUS, and NS are deliberately absent:
    // tor delivers them as data replies, which the session rejects.
}

impl EventKind {
    /// Every recognized event kind, in keyword order.
    pub const ALL: [EventKind; 30] = [
        EventKind::Addrmap,
        EventKind::AuthdirNewdescs,
        EventKind::BuildtimeoutSet,
        EventKind::Bw,
        EventKind::CellStats,
        EventKind::Circ,
        EventKind::CircBw,
        EventKind::CircMinor,
        EventKind::ClientsSeen,
        EventKind::ConfChanged,
        EventKind::ConnBw,
        EventKind::Debug,
        EventKind::Descchanged,
        EventKind::Err,
        EventKind::Guard,
        EventKind::HsDesc,
        EventKind::Info,
        EventKind::NetworkLiveness,
        EventKind::Newdesc,
        EventKind::Notice,
        EventKind::Orconn,
        EventKind::Signal,
        EventKind::StatusClient,
        EventKind::StatusGeneral,
        EventKind::StatusServer,
        EventKind::Stream,
        EventKind::StreamBw,
        EventKind::TbEmpty,
        EventKind::TransportLaunched,
        EventKind::Warn,
    ];

    /// The SETEVENTS keyword for this kind.
    pub fn keyword(self) -> &'static str {
        match self {
            EventKind::Addrmap => "ADDRMAP",
            EventKind::AuthdirNewdescs => "AUTHDIR_NEWDESCS",
            EventKind::BuildtimeoutSet => "BUILDTIMEOUT_SET",
            EventKind::Bw => "BW",
            EventKind::CellStats => "CELL_STATS",
            EventKind::Circ => "CIRC",
            EventKind::CircBw => "CIRC_BW",
            EventKind::CircMinor => "CIRC_MINOR",
            EventKind::ClientsSeen => "CLIENTS_SEEN",
            EventKind::ConfChanged => "CONF_CHANGED",
            EventKind::ConnBw => "CONN_BW",
            EventKind::Debug => "DEBUG",
            EventKind::Descchanged => "DESCCHANGED",
            EventKind::Err => "ERR",
            EventKind::Guard => "GUARD",
            EventKind::HsDesc => "HS_DESC",
            EventKind::Info => "INFO",
            EventKind::NetworkLiveness => "NETWORK_LIVENESS",
            EventKind::Newdesc => "NEWDESC",
            EventKind::Notice => "NOTICE",
            EventKind::Orconn => "ORCONN",
            EventKind::Signal => "SIGNAL",
            EventKind::StatusClient => "STATUS_CLIENT",
            EventKind::StatusGeneral => "STATUS_GENERAL",
            EventKind::StatusServer => "STATUS_SERVER",
            EventKind::Stream => "STREAM",
            EventKind::StreamBw => "STREAM_BW",
            EventKind::TbEmpty => "TB_EMPTY",
            EventKind::TransportLaunched => "TRANSPORT_LAUNCHED",
            EventKind::Warn => "WARN",
        }
    }

    /// Look up a kind by its wire keyword. Unknown keywords are not an
    /// error; events carrying them are ignored.
    pub fn from_keyword(keyword: &str) -> Option<EventKind> {
        let kind = match keyword {
            "ADDRMAP" => EventKind::Addrmap,
            "AUTHDIR_NEWDESCS" => EventKind::AuthdirNewdescs,
            "BUILDTIMEOUT_SET" => EventKind::BuildtimeoutSet,
            "BW" => EventKind::Bw,
            "CELL_STATS" => EventKind::CellStats,
            "CIRC" => EventKind::Circ,
            "CIRC_BW" => EventKind::CircBw,
            "CIRC_MINOR" => EventKind::CircMinor,
            "CLIENTS_SEEN" => EventKind::ClientsSeen,
            "CONF_CHANGED" => EventKind::ConfChanged,
            "CONN_BW" => EventKind::ConnBw,
            "DEBUG" => EventKind::Debug,
            "DESCCHANGED" => EventKind::Descchanged,
            "ERR" => EventKind::Err,
            "GUARD" => EventKind::Guard,
            "HS_DESC" => EventKind::HsDesc,
            "INFO" => EventKind::Info,
            "NETWORK_LIVENESS" => EventKind::NetworkLiveness,
            "NEWDESC" => EventKind::Newdesc,
            "NOTICE" => EventKind::Notice,
            "ORCONN" => EventKind::Orconn,
            "SIGNAL" => EventKind::Signal,
            "STATUS_CLIENT" => EventKind::StatusClient,
            "STATUS_GENERAL" => EventKind::StatusGeneral,
            "STATUS_SERVER" => EventKind::StatusServer,
            "STREAM" => EventKind::Stream,
            "STREAM_BW" => EventKind::StreamBw,
            "TB_EMPTY" => EventKind::TbEmpty,
            "TRANSPORT_LAUNCHED" => EventKind::TransportLaunched,
            "WARN" => EventKind::Warn,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One decoded asynchronous event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncEvent {
    pub kind: EventKind,
    /// Text after the keyword on the opening line, if any.
    pub initial: Option<String>,
    /// key=value pairs from the continuation lines of a multi-line
    /// event. Values are raw bytes from the quoted-string decoder.
    pub extra: BTreeMap<String, Vec<u8>>,
}
