// SPDX-License-Identifier: MIT

//! Plugin definitions: the launch contract handed to a worker. Cronicle's
//! core does not execute plugin subprocesses itself (that is a worker-side
//! concern, explicitly out of scope) — it only carries the command/script
//! and parameter schema through to the dispatch payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    pub title: String,
    pub command: String,
    #[serde(default)]
    pub script: Option<String>,
    /// JSON Schema describing accepted `params`, validated by the API layer
    /// before an event referencing this plugin is persisted.
    #[serde(default)]
    pub params_schema: Value,
}
