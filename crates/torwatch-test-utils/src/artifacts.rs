//! Writers for the artifact files tor drops into its watch directory.
//!
//! Tests play the daemon's role: they write the control-port file and
//! the cookie file (in that order, like tor does) and let the
//! supervisor under test discover them.

use std::path::{Path, PathBuf};

use filetime::FileTime;

/// File name tor uses for the control-port artifact.
pub const CONTROL_PORT_FILE: &str = "controlport";
/// File name tor uses for the authentication cookie.
pub const CONTROL_COOKIE_FILE: &str = "control_auth_cookie";

/// Write a `PORT=127.0.0.1:<port>` artifact, returning its path.
pub fn write_port_file(watch_dir: &Path, port: u16) -> PathBuf {
    let path = watch_dir.join(CONTROL_PORT_FILE);
    std::fs::write(&path, format!("PORT=127.0.0.1:{port}\n")).expect("failed to write port file");
    path
}

/// Write a raw cookie artifact, returning its path.
pub fn write_cookie_file(watch_dir: &Path, cookie: &[u8]) -> PathBuf {
    let path = watch_dir.join(CONTROL_COOKIE_FILE);
    std::fs::write(&path, cookie).expect("failed to write cookie file");
    path
}

/// Stamp a file with an absolute modification time, for staleness
/// scenarios where one artifact must look older than the other.
pub fn set_mtime(path: &Path, unix_seconds: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(unix_seconds, 0))
        .expect("failed to set mtime");
}
