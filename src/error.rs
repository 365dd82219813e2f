//! Closed error taxonomy for the account engine.
//!
//! Every variant is serializable so failure responses can carry the exact
//! error back to the originator over the wire.  `StorageFault` wraps the
//! engine message as a plain string for the same reason.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum VaultError {
    #[error("malformed message")]
    MalformedMessage,
    #[error("malformed name: {0}")]
    MalformedName(String),
    #[error("unauthorized sender")]
    UnauthorizedSender,
    #[error("duplicate request")]
    DuplicateRequest,
    #[error("not found")]
    NotFound,
    #[error("unique data written twice")]
    DuplicateData,
    #[error("account balance too low")]
    LowBalance,
    #[error("account already exists")]
    AccountExists,
    #[error("version branch cap reached")]
    TooManyBranches,
    #[error("version count cap reached")]
    TooManyVersions,
    #[error("unknown version")]
    UnknownVersion,
    #[error("storage fault: {0}")]
    StorageFault(String),
    #[error("quorum not reached before timeout")]
    QuorumTimeout,
    #[error("no persona accepts this message")]
    UnroutableMessage,
}

impl From<sqlx::Error> for VaultError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => VaultError::NotFound,
            other => VaultError::StorageFault(other.to_string()),
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            VaultError::NotFound
        } else {
            VaultError::StorageFault(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
