// SPDX-License-Identifier: MIT

//! The KV engine adapter: a capability set, not a class hierarchy. Every
//! backend implements the same trait; the storage core holds `Arc<dyn
//! Engine>` and never downcasts, exactly mirroring spec §4.1/§9's
//! duck-typed-polymorphism note.

mod local_fs;
mod remote;

pub use local_fs::LocalFsEngine;
pub use remote::{CouchbaseEngine, RedisEngine, S3Engine};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::pin::Pin;
use tokio_stream_alias::Stream;

/// Local re-export so this module doesn't pull in `tokio-stream` as a direct
/// dependency just for one trait alias.
mod tokio_stream_alias {
    pub use futures_util::Stream;
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub enum EngineValue {
    Json(Value),
    Binary(Bytes),
}

impl EngineValue {
    pub fn into_json(self) -> Result<Value> {
        match self {
            EngineValue::Json(v) => Ok(v),
            EngineValue::Binary(_) => Err(crate::error::Error::Validation(
                "expected a JSON key but found a binary one".into(),
            )),
        }
    }

    pub fn into_binary(self) -> Result<Bytes> {
        match self {
            EngineValue::Binary(b) => Ok(b),
            EngineValue::Json(v) => Ok(Bytes::from(serde_json::to_vec(&v)?)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyInfo {
    pub mtime_epoch_ms: u64,
    pub len: u64,
}

/// Suffixes that mark a key as binary content rather than JSON, per spec
/// §4.1: "binary keys (suffix identifies blob content...)".
pub fn is_binary_key(key: &str) -> bool {
    const BINARY_SUFFIXES: &[&str] = &[".gz", ".bin", ".log", ".dat"];
    BINARY_SUFFIXES.iter().any(|s| key.ends_with(s))
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn put(&self, key: &str, value: EngineValue) -> Result<()>;
    async fn get(&self, key: &str) -> Result<EngineValue>;
    async fn head(&self, key: &str) -> Result<KeyInfo>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn get_stream(&self, key: &str) -> Result<(ByteStream, KeyInfo)>;
    async fn get_stream_range(&self, key: &str, from: u64, to: u64) -> Result<ByteStream>;

    /// Durable flush of a single key. Engines without a meaningful sync
    /// point (most object stores) accept the default no-op; `LocalFsEngine`
    /// overrides it to `fsync`.
    async fn sync(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
