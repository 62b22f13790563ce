// SPDX-License-Identifier: MIT

//! `Event`: a schedule definition. Stored in the `global/schedule` list by
//! `cronicle-storage`; matched against wall-clock minutes by the scheduler
//! and turned into jobs by the dispatcher.

use crate::target::{DispatchPolicy, RunTarget};
use crate::timing::Timing;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub category_id: String,
    pub target: RunTarget,
    #[serde(default)]
    pub dispatch_policy: DispatchPolicy,
    #[serde(default)]
    pub multiplex: bool,
    #[serde(default)]
    pub timing: Timing,

    pub plugin_id: String,
    #[serde(default)]
    pub params: Value,

    #[serde(default = "default_max_children")]
    pub max_children: u32,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default = "default_queue_max")]
    pub queue_max: u32,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay_sec: u64,

    #[serde(default)]
    pub notify_success: Vec<String>,
    #[serde(default)]
    pub notify_fail: Vec<String>,
    #[serde(default)]
    pub chain_success: Vec<String>,
    #[serde(default)]
    pub chain_error: Vec<String>,
    #[serde(default)]
    pub web_hook: Option<String>,

    #[serde(default)]
    pub cpu_limit: Option<u32>,
    #[serde(default)]
    pub memory_limit: Option<u64>,

    pub created: u64,
    pub modified: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_children() -> u32 {
    1
}

fn default_queue_max() -> u32 {
    0
}

impl Event {
    /// Manual-triggered and chain-reaction-triggered runs bypass timing
    /// matching entirely, but the scheduler still needs to know whether an
    /// event is eligible for its minute tick at all.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.timing.is_manual_only()
    }
}
