// SPDX-License-Identifier: MIT

//! The local filesystem KV engine. This is the backend every test and the
//! default `init`/`run` path exercise; `base_dir` plus the key (slash
//! delimited, used verbatim as a relative path) gives the file path.

use super::{is_binary_key, ByteStream, Engine, EngineValue, KeyInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

pub struct LocalFsEngine {
    base_dir: PathBuf,
}

impl LocalFsEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn not_found(err: &std::io::Error, key: &str) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NoSuchKey(key.to_string())
        } else {
            Error::Io(std::io::Error::new(err.kind(), err.to_string()))
        }
    }
}

#[async_trait]
impl Engine for LocalFsEngine {
    async fn put(&self, key: &str, value: EngineValue) -> Result<()> {
        let path = self.path_for(key);
        Self::ensure_parent(&path).await?;
        let bytes = match value {
            EngineValue::Json(v) => serde_json::to_vec(&v)?,
            EngineValue::Binary(b) => b.to_vec(),
        };
        // Write-then-rename keeps `put` idempotent-overwrite without ever
        // exposing a partially-written file to a concurrent reader.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("key")
            .to_string();
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp-{}", nanoid::nanoid!(8)));
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<EngineValue> {
        let path = self.path_for(key);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::not_found(&e, key))?;
        if is_binary_key(key) {
            Ok(EngineValue::Binary(Bytes::from(bytes)))
        } else {
            let value = serde_json::from_slice(&bytes)?;
            Ok(EngineValue::Json(value))
        }
    }

    async fn head(&self, key: &str) -> Result<KeyInfo> {
        let path = self.path_for(key);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(&e, key))?;
        let mtime_epoch_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(KeyInfo {
            mtime_epoch_ms,
            len: meta.len(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoSuchKey(key.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn get_stream(&self, key: &str) -> Result<(ByteStream, KeyInfo)> {
        let info = self.head(key).await?;
        let path = self.path_for(key);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(&e, key))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        let stream = futures_util::stream::once(async move { Ok(Bytes::from(buf)) });
        Ok((Box::pin(stream), info))
    }

    async fn get_stream_range(&self, key: &str, from: u64, to: u64) -> Result<ByteStream> {
        use tokio::io::{AsyncSeekExt, AsyncReadExt as _};
        let path = self.path_for(key);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(&e, key))?;
        if to < from {
            // Per spec §9's open question: abort cleanly, never construct a
            // partial/garbage stream.
            return Err(Error::Validation(format!(
                "invalid byte range [{from}, {to}) for {key}"
            )));
        }
        file.seek(std::io::SeekFrom::Start(from)).await?;
        let mut buf = vec![0u8; (to - from) as usize];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        let stream = futures_util::stream::once(async move { Ok(Bytes::from(buf)) });
        Ok(Box::pin(stream))
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Ok(file) = tokio::fs::File::open(&path).await {
            file.sync_all().await?;
        }
        Ok(())
    }
}
