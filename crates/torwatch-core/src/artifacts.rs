//! Consuming the daemon's startup artifacts.
//!
//! The daemon announces readiness by writing two files into the watch
//! directory: the control-port file and the authentication cookie.
//! Each is consumed exactly once by renaming it to its `.ack` twin
//! before reading, so a poll can never read the same artifact twice or
//! observe a half-written replacement under the original name.

use std::path::Path;
use std::time::SystemTime;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use zeroize::Zeroizing;

use crate::paths::TorPaths;

/// Longest well-formed control-port file, `PORT=<ip>:<port>\n`.
const MAX_PORT_FILE_LEN: usize = "PORT=255.255.255.255:65535\n".len();

/// Cookies are 32 raw bytes; anything longer is rejected.
pub const MAX_COOKIE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Rename, open, stat, or read failed. Usually the daemon has not
    /// written the file yet, so polls treat this as "try again".
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid control port file")]
    InvalidPortFile,
    #[error("control port has non-local address")]
    NonLocalAddress,
    #[error("invalid control port number")]
    InvalidPortNumber,
    #[error("control cookie too long")]
    CookieTooLong,
}

/// A successfully consumed control-port file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortArtifact {
    pub port: u16,
    pub modified: SystemTime,
}

/// A successfully consumed cookie file.
#[derive(Debug)]
pub struct CookieArtifact {
    pub cookie: Zeroizing<Vec<u8>>,
    pub modified: SystemTime,
}

/// Commit to the control-port file by renaming it, then read and parse
/// it. Only `PORT=127.0.0.1:<port>\n` with a nonzero port is accepted.
pub async fn consume_port_file(paths: &TorPaths) -> Result<PortArtifact, ArtifactError> {
    let committed = paths.control_port_ack();
    tokio::fs::rename(paths.control_port_file(), &committed).await?;
    let (bytes, modified) = read_committed(&committed, MAX_PORT_FILE_LEN).await?;
    let port = parse_port_file(&bytes)?;
    Ok(PortArtifact { port, modified })
}

/// Commit to the cookie file by renaming it, then read it whole.
pub async fn consume_cookie_file(paths: &TorPaths) -> Result<CookieArtifact, ArtifactError> {
    let committed = paths.control_cookie_ack();
    tokio::fs::rename(paths.control_cookie_file(), &committed).await?;
    let (bytes, modified) = read_committed(&committed, MAX_COOKIE_LEN).await?;
    if bytes.len() > MAX_COOKIE_LEN {
        return Err(ArtifactError::CookieTooLong);
    }
    Ok(CookieArtifact {
        cookie: Zeroizing::new(bytes),
        modified,
    })
}

/// Open a committed artifact, returning up to `maxlen + 1` bytes (the
/// extra byte lets callers detect overlong files) and the mtime.
async fn read_committed(
    path: &Path,
    maxlen: usize,
) -> Result<(Vec<u8>, SystemTime), ArtifactError> {
    let file = File::open(path).await?;
    let modified = file.metadata().await?.modified()?;
    let mut reader = file.take(maxlen as u64 + 1);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok((bytes, modified))
}

fn parse_port_file(bytes: &[u8]) -> Result<u16, ArtifactError> {
    if bytes.len() > MAX_PORT_FILE_LEN {
        return Err(ArtifactError::InvalidPortFile);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| ArtifactError::InvalidPortFile)?;
    let line = text.strip_suffix('\n').ok_or(ArtifactError::InvalidPortFile)?;
    let rest = line.strip_prefix("PORT=").ok_or(ArtifactError::InvalidPortFile)?;
    let portstr = rest
        .strip_prefix("127.0.0.1:")
        .ok_or(ArtifactError::NonLocalAddress)?;
    let port: u16 = portstr
        .parse()
        .map_err(|_| ArtifactError::InvalidPortNumber)?;
    if port == 0 {
        return Err(ArtifactError::InvalidPortNumber);
    }
    Ok(port)
}
