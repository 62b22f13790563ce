// SPDX-License-Identifier: MIT

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed wire payload: {0}")]
    Malformed(String),

    #[error("signature mismatch")]
    BadSignature,

    #[error("timestamp outside the allowed skew window")]
    StaleTimestamp,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
