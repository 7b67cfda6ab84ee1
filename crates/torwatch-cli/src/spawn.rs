//! Spawning the tor child process.
//!
//! The daemon gets its torrc on stdin so nothing configuration-shaped
//! lands on disk outside the profile directory. Both ports are `auto`;
//! tor reports what it actually bound through the control-port file
//! and the control connection.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use torwatch_config::DaemonConfig;
use torwatch_control::escape_value;
use torwatch_core::TorPaths;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {binary}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write torrc to tor's stdin")]
    Torrc(#[source] std::io::Error),
}

/// Render extra torrc directives, one `Key value` line per entry.
///
/// Values go through torrc's quoted-or-bare escaping so spaces,
/// quotes, and nonprintables survive the trip through tor's config
/// parser.
pub fn render_torrc(directives: &std::collections::BTreeMap<String, String>) -> String {
    let mut torrc = String::new();
    for (key, value) in directives {
        torrc.push_str(key);
        torrc.push(' ');
        torrc.push_str(&escape_value(value.as_bytes()));
        torrc.push('\n');
    }
    torrc
}

/// Build the tor command line.
///
/// `-f -` makes tor read its torrc from stdin, and the pair of
/// `--defaults-torrc /nonexistent` and `--ignore-missing-torrc` keeps
/// any system-wide torrc from leaking in. The control port and cookie
/// land in the watch directory where the supervisor is looking.
pub fn tor_command(config: &DaemonConfig, paths: &TorPaths) -> Command {
    let mut command = Command::new(&config.binary);
    command
        .arg("-f")
        .arg("-")
        .arg("--defaults-torrc")
        .arg("/nonexistent")
        .arg("--ignore-missing-torrc")
        .arg("--socksport")
        .arg("auto")
        .arg("--controlport")
        .arg("auto")
        .arg("--controlportwritetofile")
        .arg(paths.control_port_file())
        .arg("--cookieauthentication")
        .arg("1")
        .arg("--cookieauthfile")
        .arg(paths.control_cookie_file())
        .arg("--datadirectory")
        .arg(paths.data_dir())
        .arg("--log")
        .arg("notice stderr")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command
}

/// Spawn tor and feed it the rendered torrc on stdin.
pub async fn spawn_tor(config: &DaemonConfig, paths: &TorPaths) -> Result<Child, SpawnError> {
    let mut child = tor_command(config, paths).spawn().map_err(|source| {
        SpawnError::Spawn {
            binary: config.binary.clone(),
            source,
        }
    })?;

    // stdin is always piped by tor_command.
    if let Some(mut stdin) = child.stdin.take() {
        let torrc = render_torrc(&config.torrc);
        stdin
            .write_all(torrc.as_bytes())
            .await
            .map_err(SpawnError::Torrc)?;
        stdin.shutdown().await.map_err(SpawnError::Torrc)?;
    }
    Ok(child)
}
