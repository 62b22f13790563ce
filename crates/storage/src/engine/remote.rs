// SPDX-License-Identifier: MIT

//! Remote-service engine backends named by spec §4.1. These are genuinely
//! external-service integrations (an S3 bucket, a Redis instance, a
//! Couchbase cluster) outside this core's build budget; what this core
//! delivers is the `Engine` trait they would implement, plus the resolved
//! open question from spec §9: a range read that cannot be satisfied must
//! return an error, never a partial or garbage stream.

use super::{ByteStream, Engine, EngineValue, KeyInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;

macro_rules! unimplemented_engine {
    ($name:ident, $label:expr) => {
        pub struct $name;

        #[async_trait]
        impl Engine for $name {
            async fn put(&self, _key: &str, _value: EngineValue) -> Result<()> {
                Err(Error::Unimplemented($label))
            }
            async fn get(&self, _key: &str) -> Result<EngineValue> {
                Err(Error::Unimplemented($label))
            }
            async fn head(&self, _key: &str) -> Result<KeyInfo> {
                Err(Error::Unimplemented($label))
            }
            async fn delete(&self, _key: &str) -> Result<()> {
                Err(Error::Unimplemented($label))
            }
            async fn get_stream(&self, _key: &str) -> Result<(ByteStream, KeyInfo)> {
                Err(Error::Unimplemented($label))
            }
            async fn get_stream_range(&self, _key: &str, from: u64, to: u64) -> Result<ByteStream> {
                // Resolves spec §9's open question: an unsatisfiable range
                // must abort with an error rather than leak a stream.
                if to < from {
                    return Err(Error::Validation(format!("invalid byte range [{from}, {to})")));
                }
                Err(Error::Unimplemented($label))
            }
        }
    };
}

unimplemented_engine!(S3Engine, "s3");
unimplemented_engine!(RedisEngine, "redis");
unimplemented_engine!(CouchbaseEngine, "couchbase");
