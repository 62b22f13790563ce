// SPDX-License-Identifier: MIT

//! Where an event's job should run.

use serde::{Deserialize, Serialize};

// Adjacently tagged, not internally tagged: a newtype variant holding a
// bare `String` has no object shape to merge an internal tag into, so
// `{kind, value}` is the only one of the two serde represents a
// `Hostname(String)` variant as a flat JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum RunTarget {
    Hostname(String),
    Group(String),
    All,
}

impl RunTarget {
    pub fn hostname(h: impl Into<String>) -> Self {
        Self::Hostname(h.into())
    }

    pub fn group(g: impl Into<String>) -> Self {
        Self::Group(g.into())
    }
}

/// How a `group` target with multiple live candidates picks one, when the
/// event is not `multiplex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    #[default]
    Random,
    RoundRobin,
    LeastLoaded,
}
