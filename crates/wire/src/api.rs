// SPDX-License-Identifier: MIT

//! The `/api/app/*` and `/api/worker/*` JSON envelope: `{code: 0}` on
//! success, `{code: <kind>, description}` on failure — spec.md §6.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A successful API response carries `code: 0` plus whatever payload
/// fields the endpoint adds; callers flatten their own struct's fields in
/// alongside this one when serializing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ok {
    pub code: u32,
}

impl Ok {
    pub const SUCCESS: Ok = Ok { code: 0 };
}

/// A failed API response. `code` is a short machine-readable kind string
/// (`"api"`, `"session"`, `"queue_overflow"`, ...), never a number, so
/// clients can match on it without risking collision with the `0` success
/// code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub description: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { code: code.into(), description: description.into() }
    }
}

/// Either arm of the envelope, for callers that deserialize a response
/// without knowing in advance whether it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ApiResponse {
    // `ApiError` first: its `code` field only ever deserializes from a
    // JSON string, so a numeric `code: 0` success envelope falls through
    // to `Ok` instead of matching this arm vacuously.
    Err(ApiError),
    Ok(Value),
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiResponse::Ok(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_serializes_with_zero_code() {
        let v = serde_json::to_value(Ok::SUCCESS).unwrap();
        assert_eq!(v, serde_json::json!({"code": 0}));
    }

    #[test]
    fn error_envelope_round_trips() {
        let err = ApiError::new("queue_overflow", "event e1 is at max_children");
        let v = serde_json::to_value(&err).unwrap();
        let back: ApiError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn untagged_response_distinguishes_ok_from_err_by_shape() {
        let ok: ApiResponse = serde_json::from_value(serde_json::json!({"code": 0})).unwrap();
        assert!(ok.is_ok());
        let err: ApiResponse =
            serde_json::from_value(serde_json::json!({"code": "api", "description": "bad field"}))
                .unwrap();
        assert!(!err.is_ok());
    }
}
