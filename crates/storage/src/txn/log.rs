// SPDX-License-Identifier: MIT

//! The per-transaction rollback log: one append-only JSON-lines file per
//! in-flight commit, siblings of the teacher's own hand-rolled `Wal`
//! (`oj-storage`'s sequential append log) but scoped to a single
//! transaction instead of the whole daemon's event stream. A line records
//! the value a key held *before* this transaction touched it, so abort can
//! replay it backwards; `Value::Null` stands in for "the key did not
//! exist" (spec's literal `0` sentinel, same meaning).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
pub struct LogHeader {
    pub id: u64,
    pub path: String,
    pub date: u64,
    pub pid: u32,
}

#[derive(Serialize, Deserialize)]
pub struct RollbackEntry {
    pub key: String,
    pub value: Value,
}

pub struct TxnLog {
    path: PathBuf,
    file: std::fs::File,
}

impl TxnLog {
    /// Exclusive-create; spec §4.2.5 step 2. Fails if a log for this id
    /// already exists, which would mean an id was reused.
    pub fn create(dir: &Path, id: u64, txn_path: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{id}.log"));
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let header = LogHeader {
            id,
            path: txn_path.to_string(),
            date: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            pid: std::process::id(),
        };
        writeln!(file, "{}", serde_json::to_string(&header)?)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, key: &str, prior_value: Value) -> Result<()> {
        let entry = RollbackEntry {
            key: key.to_string(),
            value: prior_value,
        };
        writeln!(self.file, "{}", serde_json::to_string(&entry)?)?;
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Reads every well-formed rollback entry, skipping the header line.
    /// A log with no header, or whose body fails to parse partway through,
    /// is surfaced to the caller as an empty entry list rather than an
    /// error — recovery treats unreadable logs as "delete unreplayed"
    /// (spec §4.2.5 recovery note), never as a crash.
    pub fn read_entries(path: &Path) -> Vec<RollbackEntry> {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        let mut lines = contents.lines();
        let Some(header_line) = lines.next() else {
            return Vec::new();
        };
        if serde_json::from_str::<LogHeader>(header_line).is_err() {
            return Vec::new();
        }
        let mut entries = Vec::new();
        for line in lines {
            match serde_json::from_str::<RollbackEntry>(line) {
                Ok(e) => entries.push(e),
                Err(_) => break,
            }
        }
        entries
    }

    pub fn id_from_path(path: &Path) -> Option<u64> {
        path.file_stem()?.to_str()?.parse().ok()
    }
}

/// Lists transaction log ids under `dir`, descending — the order spec
/// §4.2.5 recovery requires ("sort by id descending").
pub fn list_log_ids_descending(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut ids = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if let Some(id) = TxnLog::id_from_path(&path) {
            ids.push((id, path));
        }
    }
    ids.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TxnLog::create(dir.path(), 1, "global/schedule").unwrap();
        log.append("global/schedule", Value::Null).unwrap();
        log.append("global/schedule/0", serde_json::json!([1, 2])).unwrap();
        log.fsync().unwrap();

        let entries = TxnLog::read_entries(&dir.path().join("1.log"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "global/schedule");
        assert!(entries[0].value.is_null());
        assert_eq!(entries[1].value, serde_json::json!([1, 2]));
    }

    #[test]
    fn truncated_body_stops_at_first_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("2.log");
        std::fs::write(
            &log_path,
            "{\"id\":2,\"path\":\"p\",\"date\":0,\"pid\":1}\n{\"key\":\"a\",\"value\":1}\nnot-json\n",
        )
        .unwrap();
        let entries = TxnLog::read_entries(&log_path);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_header_yields_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("3.log");
        std::fs::write(&log_path, "garbage\n").unwrap();
        assert!(TxnLog::read_entries(&log_path).is_empty());
    }

    #[test]
    fn list_log_ids_descending_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        TxnLog::create(dir.path(), 1, "p").unwrap();
        TxnLog::create(dir.path(), 3, "p").unwrap();
        TxnLog::create(dir.path(), 2, "p").unwrap();
        let ids: Vec<u64> = list_log_ids_descending(dir.path())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
