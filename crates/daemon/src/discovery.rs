// SPDX-License-Identifier: MIT

//! UDP LAN discovery (spec.md §4.3): broadcasts a heartbeat while not part
//! of an established cluster, and maintains the `nearby` map of other
//! broadcasting hosts, expiring entries that go quiet.

use cronicle_core::Clock;
use cronicle_wire::Heartbeat;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyServer {
    pub ip: String,
    pub last_seen_epoch_ms: u64,
}

#[derive(Default)]
pub struct NearbyTable {
    servers: RwLock<HashMap<String, NearbyServer>>,
}

impl NearbyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records/refreshes a heartbeat observation, returning `true` if this
    /// is a previously-unseen hostname (so callers can broadcast a diff).
    pub fn observe(&self, hb: &Heartbeat, now_epoch_ms: u64) -> bool {
        let mut servers = self.servers.write();
        let is_new = !servers.contains_key(hb.hostname());
        servers.insert(
            hb.hostname().to_string(),
            NearbyServer { ip: hb.ip().to_string(), last_seen_epoch_ms: now_epoch_ms },
        );
        is_new
    }

    /// Drops entries whose last heartbeat is older than `timeout_ms`,
    /// returning the hostnames that were dropped.
    pub fn expire(&self, now_epoch_ms: u64, timeout_ms: u64) -> Vec<String> {
        let mut servers = self.servers.write();
        let stale: Vec<String> = servers
            .iter()
            .filter(|(_, s)| now_epoch_ms.saturating_sub(s.last_seen_epoch_ms) > timeout_ms)
            .map(|(h, _)| h.clone())
            .collect();
        for h in &stale {
            servers.remove(h);
        }
        stale
    }

    pub fn snapshot(&self) -> HashMap<String, NearbyServer> {
        self.servers.read().clone()
    }
}

/// Broadcasts a heartbeat once on `sock`, to `broadcast_addr`.
#[allow(clippy::expect_used)]
pub async fn broadcast_once(sock: &UdpSocket, broadcast_addr: SocketAddr, hostname: &str, ip: &str) -> std::io::Result<()> {
    let hb = Heartbeat::new(hostname, ip);
    let mut line = serde_json::to_vec(&hb).expect("Heartbeat always serializes");
    line.push(b'\n');
    tracing::debug!(hostname, ip, "broadcasting discovery heartbeat");
    sock.send_to(&line, broadcast_addr).await?;
    Ok(())
}

/// Runs the broadcast loop until `should_broadcast` (checked each tick)
/// returns `false` — a node stops broadcasting once it has joined an
/// established cluster (spec.md §4.3: "when not part of an established
/// cluster").
pub async fn run_broadcast_loop(
    sock: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    hostname: String,
    ip: String,
    period: std::time::Duration,
    should_broadcast: impl Fn() -> bool,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if !should_broadcast() {
            continue;
        }
        if let Err(e) = broadcast_once(&sock, broadcast_addr, &hostname, &ip).await {
            tracing::warn!(error = %e, "discovery heartbeat broadcast failed");
        }
    }
}

/// Parses one received UDP datagram's payload as a heartbeat, ignoring
/// malformed lines (best-effort discovery, not an authenticated channel).
pub fn parse_received(bytes: &[u8]) -> Option<Heartbeat> {
    serde_json::from_slice(bytes).ok()
}

pub fn expired_hostnames<C: Clock>(table: &NearbyTable, clock: &C, timeout_ms: u64) -> Vec<String> {
    table.expire(clock.epoch_ms(), timeout_ms)
}
