//! Daemon status reporting.
//!
//! A starting daemon reports client bootstrap through STATUS_CLIENT
//! events shaped like
//!
//! ```text
//! NOTICE BOOTSTRAP PROGRESS=80 TAG=conn_or SUMMARY="Connecting to the Tor network"
//! ```
//!
//! The same line comes back from `GETINFO status/bootstrap-phase`,
//! which seeds reporting in case bootstrap finished before we managed
//! to subscribe. After bootstrap, circuit establishment and network
//! liveness say whether the daemon stays usable; both follow the same
//! subscribe-then-seed pattern.

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};

use torwatch_control::{parse_key_value, ControlError, ControlSession, EventKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("truncated status event: {0}")]
    Truncated(String),
    #[error("not a bootstrap status: {0}")]
    NotBootstrap(String),
    #[error("bootstrap without progress: {0}")]
    NoProgress(String),
}

/// Severity the daemon attached to a bootstrap line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Notice,
    Warn,
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStatus {
    pub severity: Severity,
    /// Percentage, 0 through 100.
    pub progress: u8,
    pub tag: Option<String>,
    pub summary: Option<String>,
}

impl BootstrapStatus {
    pub fn done(&self) -> bool {
        self.progress >= 100
    }
}

/// Parse `<severity> BOOTSTRAP key=value ...`.
///
/// PROGRESS is mandatory. TAG and SUMMARY are kept when present;
/// SUMMARY is usually a QuotedString and is decoded as one. Unknown
/// keys and anything after the first malformed token are ignored.
pub fn parse_bootstrap_status(line: &str) -> Result<BootstrapStatus, BootstrapError> {
    let Some((severity, rest)) = line.split_once(' ') else {
        return Err(BootstrapError::Truncated(line.to_string()));
    };
    let (keyword, args) = match rest.split_once(' ') {
        Some((keyword, args)) => (keyword, args),
        None => (rest, ""),
    };
    if keyword != "BOOTSTRAP" {
        return Err(BootstrapError::NotBootstrap(line.to_string()));
    }
    let severity = match severity {
        "ERR" => Severity::Err,
        "WARN" => Severity::Warn,
        _ => Severity::Notice,
    };

    let mut progress = None;
    let mut tag = None;
    let mut summary = None;
    let mut at = 0;
    while at < args.len() {
        let Ok(kv) = parse_key_value(args, at, args.len()) else {
            break;
        };
        let text = String::from_utf8_lossy(&kv.value).into_owned();
        match kv.keyword.as_str() {
            "PROGRESS" => progress = text.parse::<u8>().ok(),
            "TAG" => tag = Some(text),
            "SUMMARY" => summary = Some(text),
            _ => {}
        }
        at = kv.next;
    }

    match progress {
        Some(progress) => Ok(BootstrapStatus {
            severity,
            progress,
            tag,
            summary,
        }),
        None => Err(BootstrapError::NoProgress(line.to_string())),
    }
}

/// Log one status line. Returns true once bootstrap is complete.
///
/// Non-bootstrap STATUS_CLIENT events (CIRCUIT_ESTABLISHED and
/// friends) pass through silently.
fn report(line: &str) -> bool {
    match parse_bootstrap_status(line) {
        Ok(status) => {
            let summary = status.summary.as_deref().unwrap_or("");
            match status.severity {
                Severity::Err => {
                    warn!(progress = status.progress, summary, "tor bootstrap trouble");
                }
                _ => info!(progress = status.progress, summary, "tor bootstrap"),
            }
            status.done()
        }
        Err(BootstrapError::NotBootstrap(_)) => false,
        Err(err) => {
            warn!(%err, "Unparseable bootstrap status");
            false
        }
    }
}

/// Circuit-establishment report from a STATUS_CLIENT event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStatus {
    pub established: bool,
    /// Reason the daemon gave for losing its circuits, when it gave one.
    pub reason: Option<String>,
}

/// Parse `<severity> CIRCUIT_ESTABLISHED` or
/// `<severity> CIRCUIT_NOT_ESTABLISHED REASON=...`.
///
/// `None` for any other STATUS_CLIENT keyword.
pub fn parse_circuit_status(line: &str) -> Option<CircuitStatus> {
    let (_severity, rest) = line.split_once(' ')?;
    let (keyword, args) = match rest.split_once(' ') {
        Some((keyword, args)) => (keyword, args),
        None => (rest, ""),
    };
    match keyword {
        "CIRCUIT_ESTABLISHED" => Some(CircuitStatus {
            established: true,
            reason: None,
        }),
        "CIRCUIT_NOT_ESTABLISHED" => {
            let mut reason = None;
            let mut at = 0;
            while at < args.len() {
                let Ok(kv) = parse_key_value(args, at, args.len()) else {
                    break;
                };
                if kv.keyword == "REASON" {
                    reason = Some(String::from_utf8_lossy(&kv.value).into_owned());
                }
                at = kv.next;
            }
            Some(CircuitStatus {
                established: false,
                reason,
            })
        }
        _ => None,
    }
}

fn report_circuit(status: &CircuitStatus) {
    if status.established {
        info!("tor circuit established");
    } else {
        let reason = status.reason.as_deref().unwrap_or("");
        warn!(reason, "tor circuit not established");
    }
}

fn report_liveness(up: bool) {
    if up {
        info!("tor network is up");
    } else {
        warn!("tor network is down");
    }
}

/// Single-value `GETINFO`: the text after `<key>=` on the data line.
async fn getinfo_value(
    session: &ControlSession,
    key: &'static str,
) -> Result<String, ControlError> {
    let reply = session.issue_command(format!("GETINFO {key}")).await?;
    if !reply.is_ok() {
        return Err(ControlError::ErrorReply {
            status: reply.status,
            text: reply.text,
        });
    }
    let prefix = format!("{key}=");
    for line in &reply.data {
        if line.status == 250 {
            if let Some(value) = line.text.strip_prefix(&prefix) {
                return Ok(value.to_string());
            }
        }
    }
    Err(ControlError::MalformedReply(key))
}

/// Resolves once the session's closed flag flips.
///
/// The event stream alone cannot signal this: its sender lives inside
/// the session handle, so a dead connection never closes the channel.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Follow bootstrap to completion, logging each phase.
///
/// Subscribes to STATUS_CLIENT, seeds from the current phase, then
/// reports events until the daemon says 100%. The subscription is
/// dropped before returning. Ends with `SessionClosed` if the session
/// dies first.
pub async fn watch_bootstrap(session: &ControlSession) -> Result<(), ControlError> {
    let mut events = session.events();
    let mut closed = session.closed();
    session.subscribe(EventKind::StatusClient).await?;

    let mut done = report(&getinfo_value(session, "status/bootstrap-phase").await?);
    while !done {
        let event = tokio::select! {
            recv = events.recv() => recv,
            () = wait_closed(&mut closed) => return Err(ControlError::SessionClosed),
        };
        match event {
            Ok(event) if event.kind == EventKind::StatusClient => {
                if let Some(line) = event.initial.as_deref() {
                    done = report(line);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Bootstrap reporting lagged behind the event stream");
            }
            Err(RecvError::Closed) => return Err(ControlError::SessionClosed),
        }
    }
    session.unsubscribe(EventKind::StatusClient).await?;
    Ok(())
}

/// Follow circuit establishment and network liveness, logging every
/// transition.
///
/// Subscribes to STATUS_CLIENT and NETWORK_LIVENESS, seeds both states
/// through GETINFO, then reports events for as long as the session
/// lasts. Only ever returns an error.
pub async fn watch_status(session: &ControlSession) -> Result<(), ControlError> {
    let mut events = session.events();
    let mut closed = session.closed();
    session.subscribe(EventKind::StatusClient).await?;
    session.subscribe(EventKind::NetworkLiveness).await?;

    let established = match getinfo_value(session, "status/circuit-established")
        .await?
        .as_str()
    {
        "1" => true,
        "0" => false,
        _ => return Err(ControlError::MalformedReply("status/circuit-established")),
    };
    report_circuit(&CircuitStatus {
        established,
        reason: None,
    });
    match getinfo_value(session, "network-liveness").await?.as_str() {
        "up" => report_liveness(true),
        "down" => report_liveness(false),
        _ => return Err(ControlError::MalformedReply("network-liveness")),
    }

    loop {
        let event = tokio::select! {
            recv = events.recv() => recv,
            () = wait_closed(&mut closed) => return Err(ControlError::SessionClosed),
        };
        match event {
            Ok(event) => match event.kind {
                EventKind::StatusClient => {
                    if let Some(status) = event.initial.as_deref().and_then(parse_circuit_status) {
                        report_circuit(&status);
                    }
                }
                EventKind::NetworkLiveness => match event.initial.as_deref() {
                    Some("UP") => report_liveness(true),
                    Some("DOWN") => report_liveness(false),
                    unknown => warn!(liveness = ?unknown, "Unrecognized network liveness event"),
                },
                _ => {}
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Status reporting lagged behind the event stream");
            }
            Err(RecvError::Closed) => return Err(ControlError::SessionClosed),
        }
    }
}
