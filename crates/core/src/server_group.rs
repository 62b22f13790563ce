// SPDX-License-Identifier: MIT

//! A named set of workers identified by a hostname regexp.

use crate::error::{CoreError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGroup {
    pub id: String,
    pub title: String,
    /// Regexp matched against a worker's hostname to decide membership.
    /// Groups are evaluated in declared order; first match wins.
    pub hostname_match: String,
    #[serde(default)]
    pub manager_eligible: bool,
    #[serde(default)]
    pub max_children: Option<u32>,
}

impl ServerGroup {
    /// Compiles `hostname_match`. Called lazily by the coordinator, which
    /// caches the result rather than recompiling per heartbeat.
    pub fn compile(&self) -> Result<Regex> {
        Regex::new(&self.hostname_match)
            .map_err(|e| CoreError::InvalidHostnamePattern(self.hostname_match.clone(), e.to_string()))
    }

    pub fn matches_hostname(&self, hostname: &str) -> Result<bool> {
        Ok(self.compile()?.is_match(hostname))
    }
}

/// Finds the first group (in declared order) whose pattern matches
/// `hostname`, per spec: "first match wins".
pub fn first_matching_group<'a>(
    groups: &'a [ServerGroup],
    hostname: &str,
) -> Option<&'a ServerGroup> {
    groups.iter().find(|g| g.matches_hostname(hostname).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, pattern: &str, eligible: bool) -> ServerGroup {
        ServerGroup {
            id: id.into(),
            title: id.into(),
            hostname_match: pattern.into(),
            manager_eligible: eligible,
            max_children: None,
        }
    }

    #[test]
    fn first_match_wins() {
        let groups = vec![group("web", "^web", true), group("all", ".*", true)];
        let m = first_matching_group(&groups, "web-01").unwrap();
        assert_eq!(m.id, "web");
        let m = first_matching_group(&groups, "db-01").unwrap();
        assert_eq!(m.id, "all");
    }

    #[test]
    fn no_match_returns_none() {
        let groups = vec![group("web", "^web", true)];
        assert!(first_matching_group(&groups, "db-01").is_none());
    }

    #[test]
    fn invalid_pattern_surfaces_as_core_error() {
        let g = group("bad", "(unterminated", true);
        assert!(g.compile().is_err());
    }
}
