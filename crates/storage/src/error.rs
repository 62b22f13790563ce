// SPDX-License-Identifier: MIT

//! The error taxonomy of spec §7, realized as one `thiserror` enum.
//!
//! `NoSuchKey` is split out from `Io` because compound "create-if-missing"
//! operations (first push to a list, first put to a hash) branch on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("lock conflict on {0}")]
    LockConflict(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue overflow for {0}")]
    QueueOverflow(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("transaction {0} not found")]
    NoSuchTransaction(u64),

    #[error("engine capability not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("fatal storage error, refusing further writes: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NoSuchKey(_))
    }
}
