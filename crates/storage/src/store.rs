// SPDX-License-Identifier: MIT

//! The `KvStore` seam that lets compound operations (lists, hashes, the
//! indexer) run identically whether or not a transaction is active on
//! their path. `EngineStore` talks straight to the `Engine`; `TxnHandle`
//! (see `txn`) intercepts through an in-memory write/delete set first.
//! This is the "clone of the storage interface" spec §4.2 Transactions
//! describes, done as a trait object instead of a literal struct clone.

use crate::engine::Engine;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put_json(&self, key: &str, value: Value) -> Result<()>;
    async fn get_json(&self, key: &str) -> Result<Value>;
    async fn delete(&self, key: &str) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool> {
        match self.get_json(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `get_json` that treats a missing key as `default` rather than an
    /// error; every structure header (list/hash/txn state) is lazily
    /// created on first write, so "not there yet" is a normal read.
    async fn get_json_or(&self, key: &str, default: Value) -> Result<Value> {
        match self.get_json(key).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_not_found() => Ok(default),
            Err(e) => Err(e),
        }
    }
}

pub struct EngineStore {
    engine: Arc<dyn Engine>,
}

impl EngineStore {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl KvStore for EngineStore {
    async fn put_json(&self, key: &str, value: Value) -> Result<()> {
        self.engine.put(key, crate::engine::EngineValue::Json(value)).await
    }

    async fn get_json(&self, key: &str) -> Result<Value> {
        self.engine.get(key).await?.into_json()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.engine.delete(key).await
    }
}
