//! Crate-wide error type for the conditions spec.md classifies as
//! "Resource" failures: fatal at startup, never swallowed.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    UdpBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("seen-set snapshot at {path:?} is corrupt: {reason}")]
    FilterCorrupt { path: PathBuf, reason: String },

    #[error("failed to create storage directory {path:?}: {source}")]
    StorageDirUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
