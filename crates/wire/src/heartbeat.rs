// SPDX-License-Identifier: MIT

//! UDP broadcast heartbeat payload (spec.md §4.3 discovery).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Heartbeat {
    Heartbeat { hostname: String, ip: String },
}

impl Heartbeat {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Heartbeat::Heartbeat { hostname: hostname.into(), ip: ip.into() }
    }

    pub fn hostname(&self) -> &str {
        let Heartbeat::Heartbeat { hostname, .. } = self;
        hostname
    }

    pub fn ip(&self) -> &str {
        let Heartbeat::Heartbeat { ip, .. } = self;
        ip
    }
}
