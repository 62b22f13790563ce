// SPDX-License-Identifier: MIT

//! Grouping with shared concurrency caps and notification defaults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub title: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_children: Option<u32>,
    #[serde(default)]
    pub notify_success: Vec<String>,
    #[serde(default)]
    pub notify_fail: Vec<String>,
}

fn default_true() -> bool {
    true
}
