//! Control-port session: one connection, one command queue, one event
//! stream.
//!
//! [`ControlSession::spawn`] takes ownership of a connected stream and
//! starts two tasks: a reader that frames incoming lines and a session
//! task that owns all mutable state. Handles are cheap clones that talk
//! to the session task over channels, so no locks are involved.
//!
//! Replies are matched to commands purely by order. The session writes
//! each command as one line and pairs it with the next final reply line
//! the daemon sends, per the control-port contract. Asynchronous 6yz
//! replies bypass the queue entirely and fan out on a broadcast bus as
//! [`AsyncEvent`]s.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::events::{AsyncEvent, EventKind};
use crate::framing::{FramingError, LineScanner, ScannedLine};
use crate::quote::{parse_key_value, parse_quoted};
use crate::reply::{ProtocolError, Reply, ReplyLine, ReplyPosition};

/// Longest control line accepted from the daemon. Anything longer is
/// flushed as truncated, which the session treats as fatal.
pub const MAX_LINE_LEN: usize = 4096;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_LEN: usize = 2048;

/// Errors surfaced by session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The session has been closed; the handle is no longer usable.
    #[error("control session is closed")]
    SessionClosed,
    /// The connection went away before this command completed.
    #[error("control connection closed")]
    ConnectionClosed,
    #[error("control socket error: {0}")]
    Io(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The daemon answered with a non-success status.
    #[error("tor error {status}: {text}")]
    ErrorReply { status: u16, text: String },
    /// A GETINFO reply did not contain the expected payload.
    #[error("malformed {0} reply from tor")]
    MalformedReply(&'static str),
    /// Command lines must not contain CR or LF.
    #[error("command line contains a line terminator")]
    InvalidCommandLine,
}

/// One listener address reported by `GETINFO net/listeners/*`, e.g.
/// `127.0.0.1:9050` or `unix:/run/tor/socks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAddr(String);

impl ListenerAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cloneable handle to a spawned control session.
#[derive(Debug, Clone)]
pub struct ControlSession {
    request_tx: mpsc::UnboundedSender<SessionRequest>,
    events_tx: broadcast::Sender<AsyncEvent>,
    closed_rx: watch::Receiver<bool>,
}

impl ControlSession {
    /// Take ownership of a connected control stream and start the
    /// session. Dropping every handle closes the connection.
    pub fn spawn<S>(stream: S) -> ControlSession
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(read_lines(read_half, line_tx));
        let task = SessionTask {
            writer: write_half,
            request_rx,
            line_rx,
            events_tx: events_tx.clone(),
            closed_tx,
            cmdq: VecDeque::new(),
            subscriptions: BTreeMap::new(),
            pending_event: None,
        };
        tokio::spawn(task.run());
        ControlSession {
            request_tx,
            events_tx,
            closed_rx,
        }
    }

    /// Send one command line and wait for its final reply, collecting
    /// any intermediate lines. The line must not contain CR or LF.
    pub async fn issue_command(&self, line: impl Into<String>) -> Result<Reply, ControlError> {
        let line = line.into();
        if line.bytes().any(|b| b == b'\r' || b == b'\n') {
            return Err(ControlError::InvalidCommandLine);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Issue {
                line,
                done: done_tx,
            })
            .map_err(|_| ControlError::SessionClosed)?;
        done_rx.await.map_err(|_| ControlError::SessionClosed)?
    }

    /// Like [`issue_command`](ControlSession::issue_command) for
    /// commands whose intermediate lines the caller does not want.
    pub async fn issue_simple_command(
        &self,
        line: impl Into<String>,
    ) -> Result<Reply, ControlError> {
        let mut reply = self.issue_command(line).await?;
        if !reply.data.is_empty() {
            debug!(lines = reply.data.len(), "Discarding unexpected mid-reply lines");
            reply.data.clear();
        }
        Ok(reply)
    }

    /// Ask tor to switch to fresh circuits for subsequent streams.
    pub async fn newnym(&self) -> Result<(), ControlError> {
        let reply = self.issue_simple_command("SIGNAL NEWNYM").await?;
        if reply.status != 250 {
            return Err(ControlError::ErrorReply {
                status: reply.status,
                text: reply.text,
            });
        }
        Ok(())
    }

    /// Subscribe to an asynchronous event kind. Subscriptions are
    /// reference-counted; SETEVENTS goes out only when the subscribed
    /// set actually changes.
    pub async fn subscribe(&self, kind: EventKind) -> Result<(), ControlError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Subscribe {
                kind,
                done: done_tx,
            })
            .map_err(|_| ControlError::SessionClosed)?;
        done_rx.await.map_err(|_| ControlError::SessionClosed)?
    }

    /// Drop one subscription reference. Unsubscribing a kind that was
    /// never subscribed succeeds without touching the wire.
    pub async fn unsubscribe(&self, kind: EventKind) -> Result<(), ControlError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Unsubscribe {
                kind,
                done: done_tx,
            })
            .map_err(|_| ControlError::SessionClosed)?;
        done_rx.await.map_err(|_| ControlError::SessionClosed)?
    }

    /// Query the listener addresses for one purpose, e.g. `socks` or
    /// `control`.
    pub async fn listeners(&self, purpose: &str) -> Result<Vec<ListenerAddr>, ControlError> {
        let keyword = format!("net/listeners/{purpose}");
        let reply = self.issue_command(format!("GETINFO {keyword}")).await?;
        if !reply.is_ok() {
            return Err(ControlError::ErrorReply {
                status: reply.status,
                text: reply.text,
            });
        }
        let prefix = format!("{keyword}=");
        let mut listeners = None;
        for line in &reply.data {
            if line.status != 250 || !line.text.starts_with(&prefix) || listeners.is_some() {
                debug!(query = %keyword, "Unexpected GETINFO reply line");
                continue;
            }
            listeners = parse_listener_list(&line.text[prefix.len()..]);
        }
        listeners.ok_or(ControlError::MalformedReply("listeners"))
    }

    /// The daemon's SOCKS listener addresses.
    pub async fn socks_listeners(&self) -> Result<Vec<ListenerAddr>, ControlError> {
        self.listeners("socks").await
    }

    /// The daemon's version string, from `GETINFO version`.
    pub async fn version(&self) -> Result<String, ControlError> {
        let reply = self.issue_command("GETINFO version").await?;
        if !reply.is_ok() {
            return Err(ControlError::ErrorReply {
                status: reply.status,
                text: reply.text,
            });
        }
        let mut version = None;
        for line in &reply.data {
            if line.status != 250 || !line.text.starts_with("version=") || version.is_some() {
                debug!("Unexpected GETINFO version reply line");
                continue;
            }
            version = Some(line.text["version=".len()..].to_string());
        }
        version.ok_or(ControlError::MalformedReply("version"))
    }

    /// A fresh receiver for the asynchronous event stream. Events
    /// published before this call are not replayed.
    pub fn events(&self) -> broadcast::Receiver<AsyncEvent> {
        self.events_tx.subscribe()
    }

    /// A watch that flips to `true` once the session has torn down.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Close the session, failing any commands still in flight. Safe to
    /// call more than once.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .request_tx
            .send(SessionRequest::Close { done: done_tx })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }
}

enum SessionRequest {
    Issue {
        line: String,
        done: oneshot::Sender<Result<Reply, ControlError>>,
    },
    Subscribe {
        kind: EventKind,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    Unsubscribe {
        kind: EventKind,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// What the reader task feeds the session task.
enum ReaderEvent {
    Line(ScannedLine),
    Eof {
        trailing: Option<ScannedLine>,
    },
    Failed(FramingError),
    Io(std::io::Error),
}

/// A command awaiting its final reply line.
struct PendingCommand {
    data: Vec<ReplyLine>,
    completion: Completion,
}

enum Completion {
    Reply(oneshot::Sender<Result<Reply, ControlError>>),
    Subscribed {
        kind: EventKind,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    Unsubscribed {
        done: oneshot::Sender<Result<(), ControlError>>,
    },
}

impl PendingCommand {
    fn fail(self, err: ControlError) {
        match self.completion {
            Completion::Reply(done) => {
                let _ = done.send(Err(err));
            }
            Completion::Subscribed { done, .. } | Completion::Unsubscribed { done } => {
                let _ = done.send(Err(err));
            }
        }
    }
}

/// A multi-line asynchronous reply being accumulated. `kind` is `None`
/// when the opening keyword was unrecognized and the remaining lines
/// are skipped without validation.
struct PendingEvent {
    kind: Option<EventKind>,
    initial: Option<String>,
    extra: BTreeMap<String, Vec<u8>>,
}

struct SessionTask<S> {
    writer: WriteHalf<S>,
    request_rx: mpsc::UnboundedReceiver<SessionRequest>,
    line_rx: mpsc::UnboundedReceiver<ReaderEvent>,
    events_tx: broadcast::Sender<AsyncEvent>,
    closed_tx: watch::Sender<bool>,
    cmdq: VecDeque<PendingCommand>,
    subscriptions: BTreeMap<EventKind, usize>,
    pending_event: Option<PendingEvent>,
}

impl<S> SessionTask<S>
where
    S: AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        let cause = loop {
            tokio::select! {
                event = self.line_rx.recv() => match event {
                    Some(ReaderEvent::Line(line)) => {
                        if let Err(err) = self.handle_line(line) {
                            warn!(%err, "Control protocol violation");
                            break ControlError::Protocol(err);
                        }
                    }
                    Some(ReaderEvent::Eof { trailing }) => {
                        // The close itself terminates a final
                        // unterminated line.
                        if let Some(last) = trailing {
                            if let Err(err) = self.handle_line(last) {
                                warn!(%err, "Control protocol violation");
                                break ControlError::Protocol(err);
                            }
                        }
                        if !self.cmdq.is_empty() {
                            warn!("Control connection closed prematurely");
                        }
                        break ControlError::ConnectionClosed;
                    }
                    Some(ReaderEvent::Failed(err)) => {
                        warn!(%err, "Control stream framing error");
                        break ControlError::Protocol(ProtocolError::Framing(err));
                    }
                    Some(ReaderEvent::Io(err)) => {
                        warn!(%err, "Control socket error");
                        break ControlError::Io(err.to_string());
                    }
                    None => break ControlError::ConnectionClosed,
                },
                request = self.request_rx.recv() => match request {
                    Some(SessionRequest::Issue { line, done }) => {
                        if let Err(err) = self.issue(line, Completion::Reply(done)).await {
                            break ControlError::Io(err.to_string());
                        }
                    }
                    Some(SessionRequest::Subscribe { kind, done }) => {
                        if let Err(err) = self.subscribe(kind, done).await {
                            break ControlError::Io(err.to_string());
                        }
                    }
                    Some(SessionRequest::Unsubscribe { kind, done }) => {
                        if let Err(err) = self.unsubscribe(kind, done).await {
                            break ControlError::Io(err.to_string());
                        }
                    }
                    Some(SessionRequest::Close { done }) => {
                        self.teardown(ControlError::ConnectionClosed).await;
                        let _ = done.send(());
                        return;
                    }
                    None => break ControlError::ConnectionClosed,
                },
            }
        };
        self.teardown(cause).await;
    }

    /// Fail everything still queued, in order, then mark the session
    /// closed and shut the write half down.
    async fn teardown(&mut self, cause: ControlError) {
        while let Some(entry) = self.cmdq.pop_front() {
            entry.fail(cause.clone());
        }
        self.closed_tx.send_replace(true);
        let _ = self.writer.shutdown().await;
    }

    /// Queue a pending entry, then put the command on the wire. The
    /// entry goes in first so a write failure still drains it.
    async fn issue(&mut self, line: String, completion: Completion) -> std::io::Result<()> {
        let verb = line.split_once(' ').map_or(line.as_str(), |(verb, _)| verb);
        trace!(command = verb, "Sending control command");
        self.cmdq.push_back(PendingCommand {
            data: Vec::new(),
            completion,
        });
        // One write for line and terminator so they share a segment.
        let mut frame = Vec::with_capacity(line.len() + 2);
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(b"\r\n");
        self.writer.write_all(&frame).await
    }

    async fn subscribe(
        &mut self,
        kind: EventKind,
        done: oneshot::Sender<Result<(), ControlError>>,
    ) -> std::io::Result<()> {
        if let Some(count) = self.subscriptions.get_mut(&kind) {
            *count += 1;
            let _ = done.send(Ok(()));
            return Ok(());
        }
        self.subscriptions.insert(kind, 1);
        let line = self.setevents_line();
        self.issue(line, Completion::Subscribed { kind, done }).await
    }

    async fn unsubscribe(
        &mut self,
        kind: EventKind,
        done: oneshot::Sender<Result<(), ControlError>>,
    ) -> std::io::Result<()> {
        let Some(count) = self.subscriptions.get_mut(&kind) else {
            let _ = done.send(Ok(()));
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            let _ = done.send(Ok(()));
            return Ok(());
        }
        self.subscriptions.remove(&kind);
        let line = self.setevents_line();
        self.issue(line, Completion::Unsubscribed { done }).await
    }

    /// The SETEVENTS line for the current subscription set. Keyword
    /// order tracks [`EventKind`]'s ordering, which is keyword order.
    fn setevents_line(&self) -> String {
        let mut line = String::from("SETEVENTS");
        for kind in self.subscriptions.keys() {
            line.push(' ');
            line.push_str(kind.keyword());
        }
        line
    }

    fn handle_line(&mut self, line: ScannedLine) -> Result<(), ProtocolError> {
        if line.truncated {
            return Err(ProtocolError::TruncatedLine);
        }
        let reply = ReplyLine::parse(&line.bytes)?;
        if reply.is_async() {
            self.handle_async(reply)
        } else {
            self.handle_sync(reply)
        }
    }

    fn handle_async(&mut self, line: ReplyLine) -> Result<(), ProtocolError> {
        match (self.pending_event.take(), line.position) {
            (None, ReplyPosition::End) => {
                let (keyword, initial) = split_event_text(&line.text);
                match EventKind::from_keyword(keyword) {
                    Some(kind) => {
                        let _ = self.events_tx.send(AsyncEvent {
                            kind,
                            initial,
                            extra: BTreeMap::new(),
                        });
                    }
                    None => debug!(keyword, "Ignoring unknown event"),
                }
                Ok(())
            }
            (None, ReplyPosition::Mid) => {
                let (keyword, initial) = split_event_text(&line.text);
                let kind = EventKind::from_keyword(keyword);
                if kind.is_none() {
                    debug!(keyword, "Ignoring unknown event");
                }
                self.pending_event = Some(PendingEvent {
                    kind,
                    initial,
                    extra: BTreeMap::new(),
                });
                Ok(())
            }
            (Some(mut pending), ReplyPosition::Mid) => {
                if pending.kind.is_some() {
                    add_event_extra(&mut pending, &line.text)?;
                }
                self.pending_event = Some(pending);
                Ok(())
            }
            (Some(mut pending), ReplyPosition::End) => {
                // The final line carries the last key=value pair.
                if let Some(kind) = pending.kind {
                    add_event_extra(&mut pending, &line.text)?;
                    let _ = self.events_tx.send(AsyncEvent {
                        kind,
                        initial: pending.initial,
                        extra: pending.extra,
                    });
                }
                Ok(())
            }
            (_, ReplyPosition::Data) => Err(ProtocolError::InvalidAsyncReply),
        }
    }

    fn handle_sync(&mut self, line: ReplyLine) -> Result<(), ProtocolError> {
        match line.position {
            ReplyPosition::Mid => {
                trace!(status = line.status, "Mid reply line");
                if let Some(front) = self.cmdq.front_mut() {
                    front.data.push(line);
                }
                Ok(())
            }
            ReplyPosition::End => {
                trace!(status = line.status, "End reply line");
                if let Some(entry) = self.cmdq.pop_front() {
                    self.finish_command(entry, line);
                }
                Ok(())
            }
            ReplyPosition::Data => Err(ProtocolError::DataReplyUnsupported),
        }
    }

    fn finish_command(&mut self, entry: PendingCommand, last: ReplyLine) {
        let status = last.status;
        let text = last.text;
        match entry.completion {
            Completion::Reply(done) => {
                let _ = done.send(Ok(Reply {
                    status,
                    text,
                    data: entry.data,
                }));
            }
            Completion::Subscribed { kind, done } => {
                if status == 250 {
                    let _ = done.send(Ok(()));
                } else {
                    // Roll the optimistic table entry back so the next
                    // subscribe retries SETEVENTS.
                    self.subscriptions.remove(&kind);
                    let _ = done.send(Err(ControlError::ErrorReply { status, text }));
                }
            }
            Completion::Unsubscribed { done } => {
                if status == 250 {
                    let _ = done.send(Ok(()));
                } else {
                    let _ = done.send(Err(ControlError::ErrorReply { status, text }));
                }
            }
        }
    }
}

/// Read the connection to completion, framing chunks into lines for
/// the session task. Exits when the socket or the session goes away.
async fn read_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<ReaderEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut scanner = LineScanner::new(MAX_LINE_LEN);
    let mut chunk = vec![0u8; READ_BUFFER_LEN];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                let _ = tx.send(ReaderEvent::Eof {
                    trailing: scanner.finish(),
                });
                return;
            }
            Ok(n) => match scanner.push(&chunk[..n]) {
                Ok(lines) => {
                    for line in lines {
                        if tx.send(ReaderEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                }
                Err(failure) => {
                    // Lines completed before the violation are real
                    // replies; deliver them before tearing down.
                    for line in failure.completed {
                        if tx.send(ReaderEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(ReaderEvent::Failed(failure.error));
                    return;
                }
            },
            Err(err) => {
                let _ = tx.send(ReaderEvent::Io(err));
                return;
            }
        }
    }
}

/// Split an event line's text into keyword and optional initial text.
fn split_event_text(text: &str) -> (&str, Option<String>) {
    match text.split_once(' ') {
        Some((keyword, rest)) => (keyword, Some(rest.to_string())),
        None => (text, None),
    }
}

/// Parse one continuation line as `key=value`, requiring it to consume
/// the entire line, and add it to the accumulating event.
fn add_event_extra(pending: &mut PendingEvent, text: &str) -> Result<(), ProtocolError> {
    let kv = parse_key_value(text, 0, text.len()).map_err(|_| ProtocolError::InvalidAsyncReply)?;
    if kv.keyword.is_empty() || kv.next != text.len() {
        return Err(ProtocolError::InvalidAsyncReply);
    }
    if pending.extra.contains_key(&kv.keyword) {
        return Err(ProtocolError::DuplicateAsyncKey);
    }
    pending.extra.insert(kv.keyword, kv.value);
    Ok(())
}

/// Parse a space-separated list of quoted listener addresses. `None`
/// means the daemon sent something unparseable.
fn parse_listener_list(s: &str) -> Option<Vec<ListenerAddr>> {
    let mut listeners = Vec::new();
    let mut i = 0;
    while i < s.len() {
        let (bytes, j) = parse_quoted(s, i, s.len()).ok()?;
        let addr = String::from_utf8(bytes).ok()?;
        listeners.push(ListenerAddr(addr));
        i = j;
        if i < s.len() {
            if s.as_bytes()[i] != b' ' || i + 1 == s.len() {
                return None;
            }
            i += 1;
        }
    }
    Some(listeners)
}
