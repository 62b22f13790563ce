// SPDX-License-Identifier: MIT

//! WebSocket push messages the cluster coordinator broadcasts to connected
//! UI subscribers (spec.md §4.4). Each message names the subtree that
//! changed; the payload is that subtree's fresh value, not a diff — the
//! teacher's wire crate makes the same "replace, don't patch" choice for
//! its IPC `Response` enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtree {
    Servers,
    ServerGroups,
    Schedule,
    Categories,
    Nearby,
    ApiKeys,
    Secrets,
    Users,
    ActiveJobs,
    SchedulerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    Update { subtree: Subtree, data: Value },
}

impl Update {
    pub fn of(subtree: Subtree, data: Value) -> Self {
        Update::Update { subtree, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_message_tags_its_subtree() {
        let msg = Update::of(Subtree::ActiveJobs, serde_json::json!({"j1": {"progress": 0.5}}));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["subtree"], "active_jobs");
        assert_eq!(v["type"], "update");
    }
}
