// SPDX-License-Identifier: MIT

//! Transactions scoped to a storage path (spec §4.2 Transactions).
//!
//! `TxnHandle` is the "clone of the storage interface" the spec describes,
//! implemented as a `KvStore` that consults an in-memory write/delete set
//! before the real engine. Nothing touches the engine until `commit`;
//! dropping (or calling `abort`) an uncommitted handle simply discards the
//! buffered writes and releases its locks, so the hoisted-transaction
//! pattern (`storage.with_txn(path, |txn| ...)`) can auto-abort on `Err`
//! for free. The on-disk rollback log exists for the *other* failure mode:
//! a crash partway through `commit`'s step 5 (some real writes landed,
//! some didn't) — `recover` replays those logs backwards at startup.

pub mod log;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::lock::{commit_lock_key, txn_lock_key, Guard, LockTable};
use crate::queue::OpQueue;
use crate::store::KvStore;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type PendingOp = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct TxnManager {
    engine: Arc<dyn Engine>,
    locks: Arc<LockTable>,
    queue: Arc<OpQueue>,
    logs_dir: PathBuf,
    next_id: AtomicU64,
}

impl TxnManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        locks: Arc<LockTable>,
        queue: Arc<OpQueue>,
        transactions_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let start_epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Arc::new(Self {
            engine,
            locks,
            queue,
            logs_dir: transactions_dir.into().join("logs"),
            // Seeding from wall-clock epoch ms keeps ids monotonic (and log
            // file names unique) across process restarts without a
            // persisted counter.
            next_id: AtomicU64::new(start_epoch_ms),
        })
    }

    pub async fn begin(self: &Arc<Self>, path: &str) -> TxnHandle {
        let txn_guard = self.locks.exclusive(&txn_lock_key(path)).await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        TxnHandle {
            manager: self.clone(),
            path: path.to_string(),
            id,
            txn_guard: SyncMutex::new(Some(txn_guard)),
            written: SyncMutex::new(HashMap::new()),
            pending: SyncMutex::new(Vec::new()),
        }
    }

    /// Runs `op` inside an implicit begin/commit, aborting on `Err` — the
    /// "hoisted" compound-operation pattern from spec §4.2 Transactions.
    #[allow(clippy::expect_used)]
    pub async fn hoisted<F, Fut, T>(self: &Arc<Self>, path: &str, op: F) -> Result<T>
    where
        F: FnOnce(Arc<TxnHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let txn = Arc::new(self.begin(path).await);
        match op(txn.clone()).await {
            Ok(value) => {
                let txn = Arc::into_inner(txn)
                    .expect("hoisted op must not retain the handle past its future");
                txn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Some(txn) = Arc::into_inner(txn) {
                    txn.abort();
                }
                Err(e)
            }
        }
    }

    /// Replays every leftover transaction log under `transactions_dir`,
    /// newest first, restoring each key's pre-transaction value. Run once
    /// at startup, before any user traffic, per spec §4.2.5 recovery.
    pub async fn recover(&self) -> Result<()> {
        let leftover = log::list_log_ids_descending(&self.logs_dir)?;
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), "replaying leftover transaction logs");
        }
        for (id, log_path) in leftover {
            let entries = log::TxnLog::read_entries(&log_path);
            tracing::debug!(id, entries = entries.len(), "rolling back transaction log");
            for entry in entries.into_iter().rev() {
                let outcome = if entry.value.is_null() {
                    match self.engine.delete(&entry.key).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_not_found() => Ok(()),
                        Err(e) => Err(e),
                    }
                } else {
                    self.engine
                        .put(&entry.key, crate::engine::EngineValue::Json(entry.value))
                        .await
                };
                // A rollback write that itself fails means the engine is in
                // an inconsistent state we cannot safely dig out of; spec
                // §7 calls this fatal.
                outcome.map_err(|e| Error::Fatal(format!("recovery rollback failed: {e}")))?;
            }
            let _ = std::fs::remove_file(&log_path);
        }
        Ok(())
    }
}

pub struct TxnHandle {
    manager: Arc<TxnManager>,
    path: String,
    id: u64,
    txn_guard: SyncMutex<Option<Guard>>,
    written: SyncMutex<HashMap<String, Option<Value>>>,
    pending: SyncMutex<Vec<PendingOp>>,
}

impl TxnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues work to run only after a successful commit (spec's
    /// `pendingAfterCommitQueue`) — e.g. an indexer hook that must not fire
    /// if the transaction aborts.
    pub fn after_commit<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.lock().push(Box::pin(fut));
    }

    /// Discards buffered writes and releases this transaction's locks.
    /// Since nothing reached the engine yet, there is nothing to roll
    /// back on disk.
    pub fn abort(self) {
        // Dropping releases the txn guard; buffered writes in `self.written`
        // are dropped along with it.
    }

    pub async fn commit(self) -> Result<()> {
        tracing::debug!(id = self.id, path = %self.path, "committing transaction");
        let commit_guard = self.manager.locks.exclusive(&commit_lock_key(&self.path)).await;
        // Structure lock last, per the fixed transaction -> commit ->
        // structure acquisition order: holding it across the write phase
        // keeps a concurrent shared-lock reader from observing a partially
        // applied commit.
        let structure_guard = self.manager.locks.exclusive(&crate::lock::list_lock_key(&self.path)).await;
        let written = self.written.lock().clone();

        if !written.is_empty() {
            let mut log = log::TxnLog::create(&self.manager.logs_dir, self.id, &self.path)?;
            for key in written.keys() {
                let prior = match self.manager.engine.get(key).await {
                    Ok(v) => v.into_json().unwrap_or(Value::Null),
                    Err(e) if e.is_not_found() => Value::Null,
                    Err(e) => return Err(e),
                };
                log.append(key, prior)?;
            }
            log.fsync()?;

            for (key, value) in &written {
                match value {
                    Some(v) => {
                        self.manager
                            .engine
                            .put(key, crate::engine::EngineValue::Json(v.clone()))
                            .await?
                    }
                    None => match self.manager.engine.delete(key).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    },
                }
            }

            for key in written.keys() {
                self.manager.engine.sync(key).await?;
            }
            log.unlink()?;
        }

        drop(structure_guard);
        drop(commit_guard);
        self.txn_guard.lock().take();

        let pending = std::mem::take(&mut *self.pending.lock());
        for fut in pending {
            self.manager.queue.submit(fut).await;
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for TxnHandle {
    async fn put_json(&self, key: &str, value: Value) -> Result<()> {
        self.written.lock().insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Value> {
        if let Some(buffered) = self.written.lock().get(key).cloned() {
            return match buffered {
                Some(v) => Ok(v),
                None => Err(Error::NoSuchKey(key.to_string())),
            };
        }
        self.manager.engine.get(key).await?.into_json()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.written.lock().insert(key.to_string(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineValue, LocalFsEngine};

    fn manager(dir: &std::path::Path) -> Arc<TxnManager> {
        let engine = Arc::new(LocalFsEngine::new(dir.join("data")));
        TxnManager::new(
            engine,
            Arc::new(LockTable::new()),
            Arc::new(OpQueue::new(4)),
            dir.join("_transactions"),
        )
    }

    #[tokio::test]
    async fn commit_makes_writes_visible_through_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let txn = mgr.begin("global/schedule").await;
        txn.put_json("global/schedule", serde_json::json!({"length": 1}))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let engine = LocalFsEngine::new(dir.path().join("data"));
        let stored = engine.get("global/schedule").await.unwrap().into_json().unwrap();
        assert_eq!(stored["length"], 1);
    }

    #[tokio::test]
    async fn dropping_without_commit_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let txn = mgr.begin("global/schedule").await;
        txn.put_json("global/schedule", serde_json::json!({"length": 1}))
            .await
            .unwrap();
        txn.abort();

        let engine = LocalFsEngine::new(dir.path().join("data"));
        assert!(engine.get("global/schedule").await.is_err());
    }

    #[tokio::test]
    async fn reads_within_a_txn_see_its_own_buffered_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let txn = mgr.begin("global/schedule").await;
        txn.put_json("k", serde_json::json!(1)).await.unwrap();
        let seen = txn.get_json("k").await.unwrap();
        assert_eq!(seen, serde_json::json!(1));
        txn.abort();
    }

    #[tokio::test]
    async fn recover_replays_a_leftover_log_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalFsEngine::new(dir.path().join("data"));
        engine
            .put("k", EngineValue::Json(serde_json::json!("original")))
            .await
            .unwrap();
        // Simulate a crash mid-commit: the real write landed but the log
        // recording the pre-write value was never cleaned up.
        let logs_dir = dir.path().join("_transactions").join("logs");
        let mut log = log::TxnLog::create(&logs_dir, 1, "k").unwrap();
        log.append("k", serde_json::json!("original")).unwrap();
        log.fsync().unwrap();
        engine
            .put("k", EngineValue::Json(serde_json::json!("half-committed")))
            .await
            .unwrap();

        let mgr = manager(dir.path());
        mgr.recover().await.unwrap();

        let restored = engine.get("k").await.unwrap().into_json().unwrap();
        assert_eq!(restored, serde_json::json!("original"));
        assert!(!logs_dir.join("1.log").exists());
    }
}
