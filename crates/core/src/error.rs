// SPDX-License-Identifier: MIT

//! The validation error kind shared by every domain type's constructor.
//!
//! Storage- and network-level error kinds (`NoSuchKey`, `Io`, `Session`,
//! `Conflict`, ...) live in `cronicle-storage`/`cronicle-daemon`; this crate
//! only ever rejects malformed domain data.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid hostname pattern {0:?}: {1}")]
    InvalidHostnamePattern(String, String),

    #[error("timing field {field} contains out-of-range value {value}")]
    TimingOutOfRange { field: &'static str, value: i64 },

    #[error("event id must not be empty")]
    EmptyId,
}

pub type Result<T> = std::result::Result<T, CoreError>;
