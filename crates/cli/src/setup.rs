// SPDX-License-Identifier: MIT

//! `init`'s storage seeding: a primary server group and admin API key by
//! default, plus whatever `--setup <manifest>` names, with `_HOSTNAME_`/
//! `_IP_` tokens substituted for local values (spec.md §6).

use cronicle_core::{new_id, Category, ServerGroup};
use cronicle_storage::Storage;
use fs2::FileExt;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::UdpSocket;
use std::path::Path;

use crate::exit_error::ExitError;

/// Single-instance enforcement: an exclusive, non-blocking lock on
/// `pid_file`, truncated and rewritten with this process's pid. The
/// returned `File` must be kept alive for as long as the daemon runs —
/// dropping it releases the OS lock.
pub fn acquire_pid_lock(path: &Path) -> Result<File, ExitError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ExitError::fatal(format!("creating {}: {e}", parent.display())))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| ExitError::fatal(format!("opening pid file {}: {e}", path.display())))?;
    file.try_lock_exclusive()
        .map_err(|e| ExitError::fatal(format!("another cronicled instance already holds {}: {e}", path.display())))?;
    file.set_len(0).map_err(|e| ExitError::fatal(format!("writing pid file {}: {e}", path.display())))?;
    writeln!(file, "{}", std::process::id()).map_err(|e| ExitError::fatal(format!("writing pid file {}: {e}", path.display())))?;
    Ok(file)
}

/// Best-effort local IPv4 address, found the same way every other `ifconfig`-less
/// Rust CLI does it: open a UDP socket "connected" to a public address and
/// read back the local address the kernel picked for the route, without
/// sending any packet.
pub fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn substitute(value: &mut Value, hostname: &str, ip: &str) {
    match value {
        Value::String(s) => {
            if s == "_HOSTNAME_" {
                *s = hostname.to_string();
            } else if s == "_IP_" {
                *s = ip.to_string();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, hostname, ip)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, hostname, ip)),
        _ => {}
    }
}

/// Seeds the primary server group and an admin API key if storage is
/// empty of both, then applies an optional setup manifest on top.
#[allow(clippy::expect_used)]
pub async fn seed(storage: &Storage, hostname: &str, manifest_path: Option<&Path>) -> Result<Vec<String>, ExitError> {
    let mut summary = Vec::new();
    let ip = local_ip();

    let existing_groups = storage
        .list_get("global/server_groups", 0, u64::MAX)
        .await
        .map_err(|e| ExitError::fatal(format!("reading server groups: {e}")))?;
    if existing_groups.is_empty() {
        let group = ServerGroup {
            id: "primary".into(),
            title: "All Servers".into(),
            hostname_match: ".*".into(),
            manager_eligible: true,
            max_children: None,
        };
        storage
            .list_push("global/server_groups", vec![serde_json::to_value(&group).expect("serializes")])
            .await
            .map_err(|e| ExitError::fatal(format!("seeding primary server group: {e}")))?;
        summary.push(format!("seeded primary server group matching every host (this node: {hostname})"));
    }

    let existing_keys = storage
        .hash_get_all("global/api_keys")
        .await
        .map_err(|e| ExitError::fatal(format!("reading api keys: {e}")))?;
    if existing_keys.is_empty() {
        let id = new_id("k");
        let key = serde_json::json!({"id": id, "title": "Admin", "description": "seeded by cronicled init"});
        storage
            .hash_put("global/api_keys", &id, key)
            .await
            .map_err(|e| ExitError::fatal(format!("seeding admin api key: {e}")))?;
        summary.push(format!("seeded admin api key {id}"));
    }

    let existing_categories = storage
        .hash_get_all("global/categories")
        .await
        .map_err(|e| ExitError::fatal(format!("reading categories: {e}")))?;
    if existing_categories.is_empty() {
        let category = Category {
            id: "general".into(),
            title: "General".into(),
            enabled: true,
            max_children: None,
            notify_success: vec![],
            notify_fail: vec![],
        };
        storage
            .hash_put("global/categories", &category.id, serde_json::to_value(&category).expect("serializes"))
            .await
            .map_err(|e| ExitError::fatal(format!("seeding general category: {e}")))?;
        summary.push("seeded general category".to_string());
    }

    if let Some(path) = manifest_path {
        let raw = std::fs::read_to_string(path).map_err(|e| ExitError::fatal(format!("reading setup manifest {}: {e}", path.display())))?;
        let mut manifest: Value = serde_json::from_str(&raw).map_err(|e| ExitError::fatal(format!("parsing setup manifest: {e}")))?;
        substitute(&mut manifest, hostname, &ip);

        if let Some(groups) = manifest.get("server_groups").and_then(Value::as_array) {
            for raw_group in groups {
                let group: ServerGroup = serde_json::from_value(raw_group.clone())
                    .map_err(|e| ExitError::fatal(format!("invalid server group in setup manifest: {e}")))?;
                storage
                    .list_push("global/server_groups", vec![serde_json::to_value(&group).expect("serializes")])
                    .await
                    .map_err(|e| ExitError::fatal(format!("applying setup manifest: {e}")))?;
                summary.push(format!("applied setup manifest server group {}", group.id));
            }
        }
        if let Some(categories) = manifest.get("categories").and_then(Value::as_array) {
            for raw_category in categories {
                let category: Category = serde_json::from_value(raw_category.clone())
                    .map_err(|e| ExitError::fatal(format!("invalid category in setup manifest: {e}")))?;
                storage
                    .hash_put("global/categories", &category.id, serde_json::to_value(&category).expect("serializes"))
                    .await
                    .map_err(|e| ExitError::fatal(format!("applying setup manifest: {e}")))?;
                summary.push(format!("applied setup manifest category {}", category.id));
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_hostname_and_ip_tokens_only() {
        let mut v = serde_json::json!({"hostname_match": "_HOSTNAME_", "title": "kept", "nested": ["_IP_", "other"]});
        substitute(&mut v, "h1", "10.0.0.5");
        assert_eq!(v["hostname_match"], "h1");
        assert_eq!(v["title"], "kept");
        assert_eq!(v["nested"][0], "10.0.0.5");
        assert_eq!(v["nested"][1], "other");
    }

    #[test]
    fn acquire_pid_lock_fails_while_another_holds_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronicled.pid");

        let running = acquire_pid_lock(&path).unwrap();
        match acquire_pid_lock(&path) {
            Err(e) => assert_eq!(e.code, 1),
            Ok(_) => panic!("second lock on the same pid file must fail while the first is held"),
        }
        drop(running);

        // Released once the first lock is dropped.
        acquire_pid_lock(&path).unwrap();
    }

    #[test]
    fn acquire_pid_lock_writes_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cronicled.pid");

        let _lock = acquire_pid_lock(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[tokio::test]
    async fn seed_is_idempotent_on_a_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let engine = std::sync::Arc::new(cronicle_storage::engine::LocalFsEngine::new(dir.path().join("data")));
        let storage = Storage::new(engine, dir.path().join("_transactions"), 4);

        let first = seed(&storage, "h1", None).await.unwrap();
        assert!(!first.is_empty());
        let second = seed(&storage, "h1", None).await.unwrap();
        assert!(second.is_empty());

        let groups = storage.list_get("global/server_groups", 0, u64::MAX).await.unwrap();
        assert_eq!(groups.len(), 1);
    }
}
