// SPDX-License-Identifier: MIT

//! Wire types shared between `cronicle-daemon` and its HTTP/WebSocket/UDP
//! peers: the `{code, description}` JSON API envelope, WebSocket `update`
//! push messages, the UDP discovery heartbeat, and HMAC-SHA1 worker
//! request signing — spec.md §6, split out the way the teacher keeps its
//! wire format in its own small crate instead of inline in the daemon.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod api;
pub mod auth;
pub mod error;
pub mod heartbeat;
pub mod ws;

pub use api::{ApiError, ApiResponse, Ok as ApiOk};
pub use auth::{sign, verify, SignedRequest};
pub use error::{Error, Result};
pub use heartbeat::Heartbeat;
pub use ws::{Subtree, Update};
