//! On-disk layout of the supervised daemon's artifact directory.
//!
//! Everything lives under `<profile>/tor`. The daemon writes its
//! control-port and cookie files into the `watch` subdirectory, and the
//! supervisor consumes them by renaming to an `.ack` twin.

use std::path::{Path, PathBuf};

/// Path helpers rooted at one profile directory. Pure data; no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorPaths {
    profile_dir: PathBuf,
}

impl TorPaths {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        TorPaths {
            profile_dir: profile_dir.into(),
        }
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Root artifacts directory, `<profile>/tor`.
    pub fn tor_dir(&self) -> PathBuf {
        self.profile_dir.join("tor")
    }

    /// Daemon working-data directory, handed to the process spawner.
    pub fn data_dir(&self) -> PathBuf {
        self.tor_dir().join("data")
    }

    /// Directory the supervisor watches for daemon artifacts.
    pub fn watch_dir(&self) -> PathBuf {
        self.tor_dir().join("watch")
    }

    /// Control-port artifact, `PORT=127.0.0.1:<port>\n`.
    pub fn control_port_file(&self) -> PathBuf {
        self.watch_dir().join("controlport")
    }

    /// Where the control-port artifact is moved once consumed.
    pub fn control_port_ack(&self) -> PathBuf {
        self.watch_dir().join("controlport.ack")
    }

    /// Control authentication cookie, at most 32 raw bytes.
    pub fn control_cookie_file(&self) -> PathBuf {
        self.watch_dir().join("control_auth_cookie")
    }

    /// Where the cookie artifact is moved once consumed.
    pub fn control_cookie_ack(&self) -> PathBuf {
        self.watch_dir().join("control_auth_cookie.ack")
    }
}
