// SPDX-License-Identifier: MIT

//! Session validation record. Account management proper (creation,
//! password reset, ...) is out of core scope; only the shape needed to
//! authenticate an API request lives here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub created_epoch_ms: u64,
    pub expires_epoch_ms: u64,
    pub ip: String,
}

impl Session {
    pub fn is_expired(&self, now_epoch_ms: u64) -> bool {
        now_epoch_ms >= self.expires_epoch_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_inclusive_of_the_boundary() {
        let s = Session {
            id: "s1".into(),
            username: "admin".into(),
            created_epoch_ms: 0,
            expires_epoch_ms: 1000,
            ip: "127.0.0.1".into(),
        };
        assert!(!s.is_expired(999));
        assert!(s.is_expired(1000));
    }
}
