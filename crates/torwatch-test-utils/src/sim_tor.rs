//! A simulated tor control server.
//!
//! Listens on an ephemeral loopback port and answers the handful of
//! control commands the supervisor and session issue: cookie
//! authentication, `GETINFO version`, `GETINFO net/listeners/socks`,
//! `SIGNAL`, and `SETEVENTS`. Connections are served one at a time,
//! like tor's own control port, and a dropped connection can be
//! followed by a fresh one to exercise relaunch handling.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::artifacts;

/// Configures and spawns a [`SimulatedTor`].
pub struct SimulatedTorBuilder {
    cookie: Vec<u8>,
    socks: Vec<String>,
    version: String,
    reject_auth: bool,
}

impl SimulatedTorBuilder {
    /// The raw authentication cookie the server expects.
    pub fn cookie(mut self, cookie: impl Into<Vec<u8>>) -> Self {
        self.cookie = cookie.into();
        self
    }

    /// Replace the SOCKS listener addresses to report. An empty slice
    /// makes `GETINFO net/listeners/socks` return an empty list.
    pub fn socks_listeners(mut self, addrs: &[&str]) -> Self {
        self.socks = addrs.iter().map(|addr| addr.to_string()).collect();
        self
    }

    /// The version string reported by `GETINFO version`.
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Refuse every `AUTHENTICATE`, even with the right cookie.
    pub fn reject_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    /// Bind a listener and start serving.
    pub async fn spawn(self) -> SimulatedTor {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("failed to bind simulated tor");
        let port = listener
            .local_addr()
            .expect("simulated tor has no local addr")
            .port();
        let behavior = Behavior {
            cookie_hex: hex::encode(&self.cookie),
            socks: self.socks.clone(),
            version: self.version.clone(),
            reject_auth: self.reject_auth,
        };
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(accept_loop(listener, behavior, command_rx));
        SimulatedTor {
            port,
            cookie: self.cookie,
            socks: self.socks,
            command_tx,
            server,
        }
    }
}

/// Handle to a running simulated control server.
///
/// The server task is aborted when this handle is dropped.
pub struct SimulatedTor {
    port: u16,
    cookie: Vec<u8>,
    socks: Vec<String>,
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    server: JoinHandle<()>,
}

impl SimulatedTor {
    pub fn builder() -> SimulatedTorBuilder {
        SimulatedTorBuilder {
            cookie: (1..=32).collect(),
            socks: vec!["127.0.0.1:9050".to_string()],
            version: "0.4.8.13".to_string(),
            reject_auth: false,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    pub fn socks_listeners(&self) -> &[String] {
        &self.socks
    }

    /// Write the control-port file and then the cookie file into
    /// `watch_dir`, the way a starting daemon announces itself.
    pub fn publish_artifacts(&self, watch_dir: &Path) {
        artifacts::write_port_file(watch_dir, self.port);
        artifacts::write_cookie_file(watch_dir, &self.cookie);
    }

    /// Send one raw asynchronous line, e.g. `650 CIRC 1 LAUNCHED`, on
    /// the active connection.
    ///
    /// Commands are applied between client lines; the test must be
    /// quiescent on the client side when calling this.
    pub fn push_event(&self, line: impl Into<String>) {
        let _ = self.command_tx.send(ConnectionCommand::PushEvent(line.into()));
    }

    /// Drop the active connection, simulating a daemon crash.
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Disconnect);
    }
}

impl Drop for SimulatedTor {
    fn drop(&mut self) {
        self.server.abort();
    }
}

enum ConnectionCommand {
    PushEvent(String),
    Disconnect,
}

struct Behavior {
    cookie_hex: String,
    socks: Vec<String>,
    version: String,
    reject_auth: bool,
}

impl Behavior {
    fn reply_to(&self, line: &str) -> String {
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "AUTHENTICATE" => {
                if self.reject_auth || rest != self.cookie_hex {
                    "515 Authentication failed\r\n".to_string()
                } else {
                    "250 OK\r\n".to_string()
                }
            }
            "GETINFO" => self.getinfo(rest),
            "SIGNAL" | "SETEVENTS" => "250 OK\r\n".to_string(),
            _ => "510 Unrecognized command\r\n".to_string(),
        }
    }

    fn getinfo(&self, key: &str) -> String {
        match key {
            "version" => format!("250-version={}\r\n250 OK\r\n", self.version),
            "net/listeners/socks" => {
                let quoted: Vec<String> =
                    self.socks.iter().map(|addr| format!("\"{addr}\"")).collect();
                format!("250-net/listeners/socks={}\r\n250 OK\r\n", quoted.join(" "))
            }
            _ => format!("552 Unrecognized key \"{key}\"\r\n"),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    behavior: Behavior,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        trace!(%peer, "Simulated tor accepted control connection");
        // Commands sent while no connection was active are stale.
        while commands.try_recv().is_ok() {}
        serve_connection(stream, &behavior, &mut commands).await;
        trace!(%peer, "Simulated tor connection done");
    }
}

async fn serve_connection(
    stream: TcpStream,
    behavior: &Behavior,
    commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let command = line.trim_end_matches(['\r', '\n']);
                        trace!(command, "Simulated tor received");
                        let reply = behavior.reply_to(command);
                        if write_half.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(ConnectionCommand::PushEvent(text)) => {
                        let event = format!("{text}\r\n");
                        if write_half.write_all(event.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Some(ConnectionCommand::Disconnect) | None => return,
                }
            }
        }
    }
}
