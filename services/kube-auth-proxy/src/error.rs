//! Service-specific error types
//!
//! Credential errors are worded "getting credentials: ..." so the guard's
//! classifier treats an unreadable token the same way it treats a failed
//! exec credential plugin.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("getting credentials: reading token file {}: {source}", path.display())]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("getting credentials: token file {} is empty", path.display())]
    EmptyToken { path: PathBuf },

    #[error("invalid bearer token: {0}")]
    InvalidToken(String),

    #[error("auth probe {path} returned {status}")]
    ProbeStatus { path: String, status: u16 },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
