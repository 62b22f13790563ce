// SPDX-License-Identifier: MIT

//! A running or completed execution of an `Event`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    LaunchFailure,
    WorkerLost,
    TimedOut,
}

impl JobStatus {
    /// Cronicle's wire convention: 0 means success, nonzero means failure.
    pub fn code(self) -> i32 {
        match self {
            JobStatus::Running => 0,
            JobStatus::Success => 0,
            JobStatus::Failed => 1,
            JobStatus::LaunchFailure => 2,
            JobStatus::WorkerLost => 255,
            JobStatus::TimedOut => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub event_id: String,
    pub hostname: String,
    #[serde(default)]
    pub pid: Option<u32>,
    pub start_epoch_ms: u64,
    #[serde(default)]
    pub end_epoch_ms: Option<u64>,
    pub status: JobStatus,
    #[serde(default)]
    pub description: String,
    /// Progress in `[0.0, 1.0]`.
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub cpu_pct_samples: Vec<f32>,
    #[serde(default)]
    pub mem_bytes_samples: Vec<u64>,
    pub log_path: String,
    #[serde(default)]
    pub params: Value,
    /// Epoch ms of the most recent status update/heartbeat from the worker,
    /// used by dead-job detection.
    pub last_update_epoch_ms: u64,
    /// Which retry attempt this run is (0 = first try), carried through so
    /// a retried job's completion can be checked against `event.retries`.
    #[serde(default)]
    pub attempt: u32,
}

impl Job {
    pub fn elapsed_ms(&self, now_epoch_ms: u64) -> u64 {
        self.end_epoch_ms.unwrap_or(now_epoch_ms).saturating_sub(self.start_epoch_ms)
    }

    pub fn is_live(&self) -> bool {
        self.status == JobStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_lost_has_code_255() {
        assert_eq!(JobStatus::WorkerLost.code(), 255);
    }

    #[test]
    fn success_and_running_both_have_code_zero() {
        assert_eq!(JobStatus::Success.code(), 0);
        assert_eq!(JobStatus::Running.code(), 0);
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::WorkerLost.is_terminal());
    }
}
