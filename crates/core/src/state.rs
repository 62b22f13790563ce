// SPDX-License-Identifier: MIT

//! The `global/state` record: scheduler enable flag and per-event fire
//! cursors, persisted under a short transaction after every tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scheduler_disabled_reason: Option<String>,
    /// event_id -> epoch minute (seconds since epoch / 60) last fired.
    #[serde(default)]
    pub cursors: HashMap<String, i64>,
    #[serde(default)]
    pub last_tick_epoch: i64,
    /// event_id -> next round-robin candidate index (spec.md:196), advanced
    /// by one on every `round_robin` dispatch of that event.
    #[serde(default)]
    pub round_robin_cursors: HashMap<String, u64>,
}

fn default_true() -> bool {
    true
}

impl SchedulerState {
    pub fn cursor_for(&self, event_id: &str) -> i64 {
        *self.cursors.get(event_id).unwrap_or(&0)
    }

    pub fn advance_cursor(&mut self, event_id: &str, minute_epoch: i64) {
        self.cursors.insert(event_id.to_string(), minute_epoch);
    }

    pub fn round_robin_cursor_for(&self, event_id: &str) -> u64 {
        *self.round_robin_cursors.get(event_id).unwrap_or(&0)
    }

    pub fn advance_round_robin_cursor(&mut self, event_id: &str, next: u64) {
        self.round_robin_cursors.insert(event_id.to_string(), next);
    }
}
