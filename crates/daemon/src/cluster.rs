// SPDX-License-Identifier: MIT

//! Cluster coordination (spec.md §4.4): the manager-election state machine,
//! worker registration/eviction, and the WebSocket broadcast fan-out keyed
//! by subtree.

use cronicle_core::{server_group::first_matching_group, Clock, ServerGroup};
use cronicle_storage::Storage;
use cronicle_wire::{Subtree, Update};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Worker,
    ManagerCandidate,
    Manager,
    Leaving,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub hostname: String,
    pub group_id: Option<String>,
    pub last_heartbeat_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ManagerClaim {
    hostname: String,
    claimed_epoch_ms: u64,
}

pub struct Coordinator {
    storage: Arc<Storage>,
    hostname: String,
    state: RwLock<NodeState>,
    workers: RwLock<HashMap<String, WorkerInfo>>,
    updates: broadcast::Sender<Update>,
}

impl Coordinator {
    pub fn new(storage: Arc<Storage>, hostname: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            storage,
            hostname: hostname.into(),
            state: RwLock::new(NodeState::Worker),
            workers: RwLock::new(HashMap::new()),
            updates: tx,
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    fn broadcast(&self, subtree: Subtree, data: serde_json::Value) {
        // No active subscribers is not an error — this node may be running
        // headless in tests.
        let _ = self.updates.send(Update::of(subtree, data));
    }

    /// Eligibility is decided from the persisted `global/server_groups`
    /// list, not raw UDP presence (spec §9 open question, resolved): a host
    /// must belong to a `manager_eligible` group to ever become a
    /// candidate, no matter how reliably it's broadcasting on the LAN.
    pub async fn is_manager_eligible(&self) -> Result<bool> {
        let groups = self.server_groups().await?;
        Ok(match first_matching_group(&groups, &self.hostname) {
            Some(g) => g.manager_eligible,
            None => false,
        })
    }

    async fn server_groups(&self) -> Result<Vec<ServerGroup>> {
        let raw = self.storage.list_get("global/server_groups", 0, u64::MAX).await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Attempts to claim `global/manager` under a transaction. Succeeds
    /// only if no live claim (within `ping_timeout_ms` of now) already
    /// exists, or the existing claim is this node's own (idempotent
    /// re-claim on a later heartbeat).
    #[allow(clippy::expect_used)]
    pub async fn try_claim_manager<C: Clock>(&self, clock: &C, ping_timeout_ms: u64) -> Result<bool> {
        if !self.is_manager_eligible().await? {
            return Ok(false);
        }
        let now = clock.epoch_ms();
        let existing: Option<ManagerClaim> = match self.storage.get("global/manager").await {
            std::result::Result::Ok(v) => serde_json::from_value(v).ok(),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(claim) = &existing {
            let live = now.saturating_sub(claim.claimed_epoch_ms) <= ping_timeout_ms;
            if live && claim.hostname != self.hostname {
                *self.state.write() = NodeState::ManagerCandidate;
                return Ok(false);
            }
        }
        let claim = ManagerClaim { hostname: self.hostname.clone(), claimed_epoch_ms: now };
        self.storage.put("global/manager", serde_json::to_value(&claim).expect("serializes")).await?;
        *self.state.write() = NodeState::Manager;
        tracing::info!(hostname = %self.hostname, "claimed manager role");
        Ok(true)
    }

    /// Re-heartbeats an existing claim. No-op (returns `false`) if this
    /// node is not the current manager.
    #[allow(clippy::expect_used)]
    pub async fn renew_manager_claim<C: Clock>(&self, clock: &C) -> Result<bool> {
        if self.state() != NodeState::Manager {
            return Ok(false);
        }
        let claim = ManagerClaim { hostname: self.hostname.clone(), claimed_epoch_ms: clock.epoch_ms() };
        self.storage.put("global/manager", serde_json::to_value(&claim).expect("serializes")).await?;
        Ok(true)
    }

    /// Steps down: a manager that observes another live manager (e.g. after
    /// a network partition heals) yields rather than contest the claim.
    pub fn yield_to(&self, other_hostname: &str) {
        tracing::warn!(hostname = %self.hostname, other = other_hostname, "yielding manager role");
        *self.state.write() = NodeState::ManagerCandidate;
    }

    pub fn begin_leaving(&self) {
        *self.state.write() = NodeState::Leaving;
    }

    /// Registers or refreshes a worker's heartbeat, assigning it to the
    /// first server group (in declared order) whose pattern matches its
    /// hostname.
    #[allow(clippy::expect_used)]
    pub async fn register_worker<C: Clock>(&self, clock: &C, hostname: &str) -> Result<()> {
        let groups = self.server_groups().await?;
        let group_id = first_matching_group(&groups, hostname).map(|g| g.id.clone());
        let info = WorkerInfo {
            hostname: hostname.to_string(),
            group_id,
            last_heartbeat_epoch_ms: clock.epoch_ms(),
        };
        self.workers.write().insert(hostname.to_string(), info.clone());
        self.broadcast(
            Subtree::Servers,
            serde_json::to_value(self.workers.read().clone()).expect("serializes"),
        );
        Ok(())
    }

    /// Evicts workers whose last heartbeat exceeds `dead_job_timeout_ms`,
    /// returning the evicted hostnames.
    #[allow(clippy::expect_used)]
    pub fn evict_dead_workers(&self, now_epoch_ms: u64, dead_job_timeout_ms: u64) -> Vec<String> {
        let mut workers = self.workers.write();
        let dead: Vec<String> = workers
            .values()
            .filter(|w| now_epoch_ms.saturating_sub(w.last_heartbeat_epoch_ms) > dead_job_timeout_ms)
            .map(|w| w.hostname.clone())
            .collect();
        for h in &dead {
            workers.remove(h);
        }
        if !dead.is_empty() {
            self.broadcast(
                Subtree::Servers,
                serde_json::to_value(workers.clone()).expect("serializes"),
            );
        }
        dead
    }

    pub fn worker_snapshot(&self) -> HashMap<String, WorkerInfo> {
        self.workers.read().clone()
    }

    pub fn notify_subtree(&self, subtree: Subtree, data: serde_json::Value) {
        self.broadcast(subtree, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronicle_core::FakeClock;
    use std::sync::Arc as StdArc;

    async fn storage(dir: &std::path::Path) -> Arc<Storage> {
        let engine = StdArc::new(cronicle_storage::engine::LocalFsEngine::new(dir.join("data")));
        Arc::new(Storage::new(engine, dir.join("_transactions"), 4))
    }

    async fn seed_group(storage: &Storage, id: &str, pattern: &str, eligible: bool) {
        let group = ServerGroup {
            id: id.into(),
            title: id.into(),
            hostname_match: pattern.into(),
            manager_eligible: eligible,
            max_children: None,
        };
        storage
            .list_push("global/server_groups", vec![serde_json::to_value(group).unwrap()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ineligible_host_never_claims_manager() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;
        seed_group(&storage, "g1", "^other", true).await;
        let coord = Coordinator::new(storage, "h1");
        let clock = FakeClock::new(1000);
        assert!(!coord.try_claim_manager(&clock, 60_000).await.unwrap());
        assert_eq!(coord.state(), NodeState::Worker);
    }

    #[tokio::test]
    async fn eligible_host_claims_an_unclaimed_manager_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;
        seed_group(&storage, "g1", ".*", true).await;
        let coord = Coordinator::new(storage, "h1");
        let clock = FakeClock::new(1000);
        assert!(coord.try_claim_manager(&clock, 60_000).await.unwrap());
        assert_eq!(coord.state(), NodeState::Manager);
    }

    #[tokio::test]
    async fn a_second_node_does_not_contest_a_live_claim() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;
        seed_group(&storage, "g1", ".*", true).await;
        let a = Coordinator::new(storage.clone(), "a");
        let b = Coordinator::new(storage, "b");
        let clock = FakeClock::new(1000);
        assert!(a.try_claim_manager(&clock, 60_000).await.unwrap());
        clock.advance_secs(5);
        assert!(!b.try_claim_manager(&clock, 60_000).await.unwrap());
        assert_eq!(b.state(), NodeState::ManagerCandidate);
    }

    #[tokio::test]
    async fn a_stale_claim_is_reclaimable_by_another_node() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;
        seed_group(&storage, "g1", ".*", true).await;
        let a = Coordinator::new(storage.clone(), "a");
        let b = Coordinator::new(storage, "b");
        let clock = FakeClock::new(1000);
        assert!(a.try_claim_manager(&clock, 60_000).await.unwrap());
        clock.advance_secs(120);
        assert!(b.try_claim_manager(&clock, 60_000).await.unwrap());
        assert_eq!(b.state(), NodeState::Manager);
    }

    #[test]
    fn dead_workers_are_evicted_by_timeout() {
        let storage_dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let coord = rt.block_on(async {
            let storage = storage(storage_dir.path()).await;
            Coordinator::new(storage, "mgr")
        });
        let clock = FakeClock::new(0);
        rt.block_on(coord.register_worker(&clock, "h1")).unwrap();
        clock.advance_secs(200);
        let evicted = coord.evict_dead_workers(clock.epoch_ms(), 120_000);
        assert_eq!(evicted, vec!["h1".to_string()]);
        assert!(coord.worker_snapshot().is_empty());
    }
}
