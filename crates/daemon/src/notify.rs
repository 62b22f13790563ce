// SPDX-License-Identifier: MIT

//! The notification interface (spec.md §4.1: "SMTP/webhook notification
//! transport" is an external collaborator). `Notifier` is the seam —
//! actual delivery is a pluggable sink; [`LoggingNotifier`] is the only
//! sink this crate ships, since wiring a real mailer/webhook client is
//! explicitly out of scope.

use cronicle_core::Job;

pub trait Notifier: Send + Sync {
    /// `recipients` is an event's `notify_success`/`notify_fail` list
    /// (spec.md §3); `outcome` is `"success"` or `"failure"` for the log
    /// line's benefit, mirroring the wire's `job_failure`/
    /// `job_launch_failure` naming (spec.md §7).
    fn notify(&self, recipients: &[String], job: &Job, outcome: &str);
}

/// Records the notification as a structured log event instead of sending
/// it anywhere. Every other sink (SMTP, a webhook POST) plugs in behind
/// the same trait without the dispatcher knowing the difference.
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, recipients: &[String], job: &Job, outcome: &str) {
        if recipients.is_empty() {
            return;
        }
        tracing::info!(
            job_id = %job.id,
            event_id = %job.event_id,
            outcome,
            recipients = ?recipients,
            description = %job.description,
            "job notification"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronicle_core::JobStatus;

    fn sample_job() -> Job {
        Job {
            id: "j1".into(),
            event_id: "e1".into(),
            hostname: "h1".into(),
            pid: None,
            start_epoch_ms: 0,
            end_epoch_ms: Some(1),
            status: JobStatus::Failed,
            description: "boom".into(),
            progress: 1.0,
            cpu_pct_samples: vec![],
            mem_bytes_samples: vec![],
            log_path: "jobs/j1/log.txt.gz".into(),
            params: serde_json::json!({}),
            last_update_epoch_ms: 1,
            attempt: 0,
        }
    }

    #[test]
    fn empty_recipient_list_does_not_panic() {
        LoggingNotifier.notify(&[], &sample_job(), "failure");
    }

    #[test]
    fn nonempty_recipient_list_does_not_panic() {
        LoggingNotifier.notify(&["ops@example.com".into()], &sample_job(), "failure");
    }
}
