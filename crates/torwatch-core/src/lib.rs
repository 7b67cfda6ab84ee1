#![deny(unsafe_code)]

//! Tor daemon supervision.
//!
//! Watches the artifact directory an external tor process writes its
//! control port and authentication cookie into, authenticates a
//! control connection once both artifacts are fresh, and reports the
//! daemon's lifecycle as launch and exit events. The control protocol
//! itself lives in `torwatch-control`; spawning the process is the
//! caller's job.

/// Consume-once readers for the control-port and cookie files.
pub mod artifacts;
/// The on-disk layout under a profile directory.
pub mod paths;
/// The supervisor task and its [`TorDaemon`] handle.
pub mod supervisor;

pub use artifacts::{ArtifactError, CookieArtifact, PortArtifact, MAX_COOKIE_LEN};
pub use paths::TorPaths;
pub use supervisor::{SupervisorError, TorDaemon, TorEvent};
