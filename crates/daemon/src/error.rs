// SPDX-License-Identifier: MIT

//! Daemon-level error kinds (spec.md §7), layered on top of
//! `cronicle_storage::Error` the way the storage crate layers on top of
//! its own engine I/O errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("storage I/O failed: {0}")]
    Io(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("session invalid or expired")]
    Session,

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue overflow for event {0}")]
    QueueOverflow(String),

    #[error("operation timed out")]
    Timeout,

    #[error("worker lost")]
    WorkerLost,

    #[error("launch failed: {0}")]
    LaunchFailure(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// The machine-readable `code` string spec.md §6/§7 puts in the API
    /// error envelope.
    pub fn api_code(&self) -> &'static str {
        match self {
            Error::NoSuchKey(_) => "not_found",
            Error::Io(_) => "io",
            Error::Validation(_) => "api",
            Error::Session => "session",
            Error::Permission(_) => "permission",
            Error::Conflict(_) => "conflict",
            Error::QueueOverflow(_) => "queue_overflow",
            Error::Timeout => "timeout",
            Error::WorkerLost => "worker_lost",
            Error::LaunchFailure(_) => "launch_failure",
            Error::Fatal(_) => "fatal",
        }
    }
}

impl From<cronicle_storage::Error> for Error {
    fn from(e: cronicle_storage::Error) -> Self {
        if e.is_not_found() {
            Error::NoSuchKey(e.to_string())
        } else {
            match e {
                cronicle_storage::Error::Fatal(msg) => Error::Fatal(msg),
                other => Error::Io(other.to_string()),
            }
        }
    }
}

impl From<&Error> for cronicle_wire::ApiError {
    fn from(e: &Error) -> Self {
        cronicle_wire::ApiError::new(e.api_code(), e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
