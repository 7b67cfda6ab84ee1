//! Supervising an external tor daemon.
//!
//! The supervisor never spawns or signals the daemon process itself;
//! that is the launching collaborator's job. It watches the artifact
//! directory for the control-port and cookie files the daemon writes,
//! opens and authenticates a control connection once both are fresh,
//! and broadcasts [`TorEvent`]s as the daemon comes and goes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use torwatch_control::{ControlError, ControlSession, ListenerAddr};

use crate::artifacts::{self, CookieArtifact, PortArtifact};
use crate::paths::TorPaths;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor already started")]
    AlreadyStarted,
    #[error("supervisor already killed")]
    AlreadyKilled,
    #[error("failed to create {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to watch {path}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Lifecycle notifications from [`TorDaemon::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorEvent {
    /// A control connection was authenticated and the daemon reported
    /// its listeners. Carries the primary SOCKS address.
    Launched(ListenerAddr),
    /// The daemon is gone: its control connection closed, the launch
    /// sequence failed, or [`TorDaemon::kill`] was called.
    Exited,
}

enum Request {
    ListenerAddress(oneshot::Sender<Option<ListenerAddr>>),
    Version(oneshot::Sender<Option<String>>),
    Control(oneshot::Sender<Option<ControlSession>>),
    Kill,
}

/// Handle to a supervised tor daemon.
///
/// Create one with [`TorDaemon::new`], call [`setup`](TorDaemon::setup)
/// to prepare the artifact directories, spawn the daemon process by
/// other means, then [`start`](TorDaemon::start) watching for it.
#[derive(Debug)]
pub struct TorDaemon {
    paths: TorPaths,
    request_tx: mpsc::UnboundedSender<Request>,
    request_rx: Option<mpsc::UnboundedReceiver<Request>>,
    events_tx: broadcast::Sender<TorEvent>,
    killed: Arc<AtomicBool>,
}

impl TorDaemon {
    pub fn new(paths: TorPaths) -> TorDaemon {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        TorDaemon {
            paths,
            request_tx,
            request_rx: Some(request_rx),
            events_tx,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn paths(&self) -> &TorPaths {
        &self.paths
    }

    /// Create the profile, tor, and watch directories, each private to
    /// the owner. Directories that already exist are left alone.
    pub async fn setup(&self) -> Result<(), SupervisorError> {
        let dirs = [
            self.paths.profile_dir().to_path_buf(),
            self.paths.tor_dir(),
            self.paths.watch_dir(),
        ];
        for dir in dirs {
            if let Err(source) = create_private_dir(&dir).await {
                return Err(SupervisorError::CreateDir { path: dir, source });
            }
        }
        Ok(())
    }

    /// Begin watching the artifact directory and polling for the
    /// daemon's control port. Emits [`TorEvent::Launched`] once a
    /// control connection is authenticated.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyKilled);
        }
        if self.request_rx.is_none() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let watcher_tx = ping_tx.clone();
        let watch_dir = self.paths.watch_dir();
        // The watch callback ignores the event details. Paths reported
        // by the platform backends are unreliable, so every
        // notification just triggers a poll that looks at the files
        // themselves.
        let mut watcher = notify::recommended_watcher(
            move |_event: Result<Event, notify::Error>| {
                let _ = watcher_tx.send(());
            },
        )
        .map_err(|source| SupervisorError::Watch {
            path: watch_dir.clone(),
            source,
        })?;
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|source| SupervisorError::Watch {
                path: watch_dir.clone(),
                source,
            })?;

        let Some(request_rx) = self.request_rx.take() else {
            return Err(SupervisorError::AlreadyStarted);
        };
        // Prime one poll so artifacts already on disk are noticed
        // without waiting for filesystem activity.
        let _ = ping_tx.send(());

        let task = SupervisorTask {
            paths: self.paths.clone(),
            request_rx,
            ping_rx,
            events_tx: self.events_tx.clone(),
            killed: Arc::clone(&self.killed),
            _watcher: Some(watcher),
            session: None,
            session_closed: None,
            listeners: Vec::new(),
            version: None,
            done: false,
        };
        tokio::spawn(task.run());
        Ok(())
    }

    /// Give up on this daemon. Closes any open control session, stops
    /// watching, and emits [`TorEvent::Exited`]. Before
    /// [`start`](TorDaemon::start), or after a previous kill, this is
    /// a no-op. The external process itself is not signalled.
    pub fn kill(&self) {
        if self.request_rx.is_some() {
            return;
        }
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.request_tx.send(Request::Kill);
    }

    /// A fresh receiver for lifecycle events. Events emitted before
    /// this call are not replayed.
    pub fn events(&self) -> broadcast::Receiver<TorEvent> {
        self.events_tx.subscribe()
    }

    /// The daemon's primary SOCKS listener address, or `None` if it
    /// has not launched yet or has exited.
    pub async fn listener_address(&self) -> Option<ListenerAddr> {
        self.request(Request::ListenerAddress).await
    }

    /// The daemon's version string, or `None` if it has not launched
    /// yet or has exited.
    pub async fn version(&self) -> Option<String> {
        self.request(Request::Version).await
    }

    /// The open control session, or `None` if the daemon has not
    /// launched yet or has exited.
    pub async fn control(&self) -> Option<ControlSession> {
        self.request(Request::Control).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Option<T>>) -> Request,
    ) -> Option<T> {
        if self.request_rx.is_some() {
            // Not started, so there is no task to answer.
            return None;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.request_tx.send(make(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }
}

async fn create_private_dir(dir: &Path) -> Result<(), std::io::Error> {
    let mut builder = tokio::fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(0o700);
    match builder.create(dir).await {
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

struct SupervisorTask {
    paths: TorPaths,
    request_rx: mpsc::UnboundedReceiver<Request>,
    ping_rx: mpsc::UnboundedReceiver<()>,
    events_tx: broadcast::Sender<TorEvent>,
    killed: Arc<AtomicBool>,
    /// Held so the filesystem watch stays registered for the task's
    /// whole life.
    _watcher: Option<RecommendedWatcher>,
    session: Option<ControlSession>,
    session_closed: Option<watch::Receiver<bool>>,
    listeners: Vec<ListenerAddr>,
    version: Option<String>,
    done: bool,
}

impl SupervisorTask {
    async fn run(mut self) {
        debug!(dir = %self.paths.watch_dir().display(), "Watching for tor artifacts");
        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle_request(request).await;
                }
                ping = self.ping_rx.recv() => {
                    let Some(()) = ping else { break };
                    if self.session.is_none() && !self.killed() {
                        self.poll_burst().await;
                    }
                }
                () = wait_closed(&mut self.session_closed) => {
                    self.session_gone().await;
                }
            }
            if self.done {
                break;
            }
        }
        debug!("Supervisor stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::ListenerAddress(reply) => {
                let _ = reply.send(self.listeners.first().cloned());
            }
            Request::Version(reply) => {
                let _ = reply.send(self.version.clone());
            }
            Request::Control(reply) => {
                let _ = reply.send(self.session.clone());
            }
            Request::Kill => {
                debug!("Kill requested");
                if let Some(session) = self.session.take() {
                    session.close().await;
                }
                self.clear_daemon_state();
                self.emit(TorEvent::Exited);
                self.done = true;
            }
        }
    }

    /// The control connection went away underneath us. Treat it as the
    /// daemon exiting, then resume polling in case a replacement is
    /// already writing fresh artifacts.
    async fn session_gone(&mut self) {
        self.session = None;
        self.clear_daemon_state();
        if self.killed() {
            // A kill request is in flight and will finish teardown.
            return;
        }
        debug!("Control session closed, assuming tor exited");
        self.emit(TorEvent::Exited);
        self.poll_burst().await;
    }

    /// Run poll attempts until one completes with no watch
    /// notification queued behind it. Notifications that arrive during
    /// an attempt coalesce into exactly one follow-up attempt. Returns
    /// how many attempts ran.
    async fn poll_burst(&mut self) -> usize {
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.poll_once().await;
            let mut retry = false;
            while self.ping_rx.try_recv().is_ok() {
                retry = true;
            }
            if !(retry && self.session.is_none() && !self.killed()) {
                return attempts;
            }
        }
    }

    /// One poll attempt. Failures here are expected while tor is still
    /// starting up and only end the attempt; the next watch
    /// notification drives another.
    ///
    /// Tor writes the port file before the cookie, so the cookie is
    /// consumed first: a poll that lands between the two writes then
    /// consumes nothing, and the port file survives for the attempt
    /// that follows the cookie write.
    async fn poll_once(&mut self) {
        let cookie = match artifacts::consume_cookie_file(&self.paths).await {
            Ok(cookie) => cookie,
            Err(err) => {
                trace!(%err, "Control cookie file not ready");
                return;
            }
        };
        if self.killed() {
            return;
        }
        let port = match artifacts::consume_port_file(&self.paths).await {
            Ok(port) => port,
            Err(err) => {
                trace!(%err, "Control port file not ready");
                return;
            }
        };
        if self.killed() {
            return;
        }
        // A cookie older than the port file is from a previous run.
        // Equal mtimes are accepted: filesystem timestamps may not
        // resolve consecutive writes.
        if cookie.modified < port.modified {
            debug!("Tossing stale control cookie");
            return;
        }
        self.open_control(port, cookie).await;
    }

    async fn open_control(&mut self, port: PortArtifact, cookie: CookieArtifact) {
        let stream = match TcpStream::connect(("127.0.0.1", port.port)).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%err, port = port.port, "Control connect failed");
                return;
            }
        };
        if self.killed() {
            return;
        }
        let session = ControlSession::spawn(stream);
        match launch_sequence(&session, &cookie).await {
            Ok((listeners, version)) => {
                let Some(primary) = listeners.first().cloned() else {
                    warn!("tor reported no socks listeners");
                    self.fail_launch(session).await;
                    return;
                };
                self.session_closed = Some(session.closed());
                self.session = Some(session);
                self.listeners = listeners;
                self.version = Some(version);
                debug!(socks = %primary, "tor launched");
                self.emit(TorEvent::Launched(primary));
            }
            Err(err) => {
                warn!(%err, "tor launch failed");
                self.fail_launch(session).await;
            }
        }
    }

    /// Authentication or the initial queries failed. Polling again
    /// cannot fix a cookie or protocol mismatch, so give up on this
    /// daemon entirely.
    async fn fail_launch(&mut self, session: ControlSession) {
        session.close().await;
        self.killed.store(true, Ordering::SeqCst);
        self.clear_daemon_state();
        self.emit(TorEvent::Exited);
        self.done = true;
    }

    fn clear_daemon_state(&mut self) {
        self.session_closed = None;
        self.listeners.clear();
        self.version = None;
    }

    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TorEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Authenticate and run the initial queries on a fresh session.
async fn launch_sequence(
    session: &ControlSession,
    cookie: &CookieArtifact,
) -> Result<(Vec<ListenerAddr>, String), ControlError> {
    let reply = session
        .issue_simple_command(format!(
            "AUTHENTICATE {}",
            hex::encode(cookie.cookie.as_slice())
        ))
        .await?;
    if reply.status != 250 || reply.text != "OK" {
        return Err(ControlError::ErrorReply {
            status: reply.status,
            text: reply.text,
        });
    }
    let listeners = session.socks_listeners().await?;
    let version = session.version().await?;
    Ok((listeners, version))
}

async fn wait_closed(closed: &mut Option<watch::Receiver<bool>>) {
    match closed {
        Some(rx) => {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        None => std::future::pending().await,
    }
}
