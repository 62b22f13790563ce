// SPDX-License-Identifier: MIT

//! Per-key shared/exclusive locking with FIFO-fair acquisition.
//!
//! Namespacing by prefix character keeps user-visible locks, list/hash
//! locks (`|key`), transaction locks (`T|key`), and commit locks (`C|key`)
//! from deadlocking across layers (spec §4.2 Locking). Every compound
//! operation must acquire in the fixed order transaction -> commit ->
//! structure; `Sequence` is the only way callers are meant to acquire more
//! than one lock at a time, so that order is structural rather than a
//! convention someone can forget.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

pub enum Guard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// `tokio::sync::RwLock` queues waiters FIFO, which is exactly the
    /// fairness spec §4.2 requires.
    pub async fn shared(&self, key: &str) -> Guard {
        let lock = self.entry(key);
        tracing::trace!(key, mode = "shared", "acquiring lock");
        Guard::Shared(lock.read_owned().await)
    }

    pub async fn exclusive(&self, key: &str) -> Guard {
        let lock = self.entry(key);
        tracing::trace!(key, mode = "exclusive", "acquiring lock");
        Guard::Exclusive(lock.write_owned().await)
    }

    /// Removes the table entry once nothing else holds a reference to it,
    /// so long-dead keys don't grow the table forever. Best-effort: if a
    /// racing acquirer has already cloned the `Arc`, the stale entry is
    /// simply recreated on next use.
    pub fn try_reclaim(&self, key: &str) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}

pub fn list_lock_key(key: &str) -> String {
    format!("|{key}")
}

pub fn hash_lock_key(key: &str) -> String {
    format!("|{key}")
}

pub fn txn_lock_key(path: &str) -> String {
    format!("T|{path}")
}

pub fn commit_lock_key(path: &str) -> String {
    format!("C|{path}")
}

/// Acquires all three compound-operation locks atomically, for callers that
/// don't need the transaction lock held across a longer begin/commit span
/// (`txn::TxnHandle` acquires it separately in `begin` instead, since it
/// has to outlive this helper's scope). Holding the returned `Sequence`
/// alive keeps every lock held; dropping it releases them in reverse order.
pub struct Sequence {
    _guards: Vec<Guard>,
}

impl Sequence {
    pub async fn acquire_for_commit(table: &LockTable, path: &str, structure_key: &str) -> Self {
        let txn_guard = table.exclusive(&txn_lock_key(path)).await;
        let commit_guard = table.exclusive(&commit_lock_key(path)).await;
        let structure_guard = table.exclusive(&list_lock_key(structure_key)).await;
        Self {
            _guards: vec![txn_guard, commit_guard, structure_guard],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn shared_locks_do_not_block_each_other() {
        let table = Arc::new(LockTable::new());
        let g1 = table.shared("k").await;
        let g2 = tokio::time::timeout(Duration::from_millis(50), table.shared("k")).await;
        assert!(g2.is_ok());
        drop(g1);
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_other_exclusive() {
        let table = Arc::new(LockTable::new());
        let counter = Arc::new(AtomicU32::new(0));
        let g1 = table.exclusive("k").await;

        let table2 = table.clone();
        let counter2 = counter.clone();
        let handle = tokio::spawn(async move {
            let _g = table2.exclusive("k").await;
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(g1);
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_key_namespaces_are_distinct() {
        assert_ne!(list_lock_key("x"), txn_lock_key("x"));
        assert_ne!(txn_lock_key("x"), commit_lock_key("x"));
    }
}
