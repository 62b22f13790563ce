// SPDX-License-Identifier: MIT

//! The worker-side job launcher (spec.md §4.1: "plugin subprocesses that
//! actually execute jobs" are an external collaborator in principle, but
//! the ambient stack still needs a real process to dispatch to — there is
//! no UI/plugin-runtime teacher analogue, so this follows the retrieval
//! pack's own `tokio::process::Command` + captured-output idiom, e.g.
//! `alfredjeanlab-oddjobs::daemon::engine::executor`'s subprocess adapter).
//!
//! Two [`Launcher`] implementations plug into [`crate::dispatcher::Dispatcher`]:
//! [`ProcessLauncher`] runs a job on the local node (the common case — a
//! `cronicled` node dispatching to itself), and [`HttpLauncher`] forwards
//! the launch to a remote worker's `/api/worker/launch` over the same
//! HMAC-signed transport as heartbeats and job updates. [`CompositeLauncher`]
//! picks between them by comparing the target hostname to the node's own.

use async_trait::async_trait;
use cronicle_core::{Clock, Job, JobStatus, Plugin};
use cronicle_storage::Storage;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::dispatcher::{Dispatcher, Launcher};
use crate::error::{Error, Result};
use crate::notify::Notifier;

/// Looks up the `Plugin` an event referenced by id. Shared by the local
/// and remote launch paths since both need the resolved command before
/// they can spawn anything (spec.md §4.6 step 3: "snapshot event params
/// and resolved plugin").
async fn resolve_plugin(storage: &Storage, plugin_id: &str) -> Result<Plugin> {
    let (_, raw) = storage
        .list_find("global/plugins", "id", serde_json::json!(plugin_id))
        .await?
        .ok_or_else(|| Error::NoSuchKey(format!("plugin {plugin_id}")))?;
    serde_json::from_value(raw).map_err(|e| Error::Validation(format!("plugin {plugin_id} is malformed: {e}")))
}

/// Runs one job to completion: spawns `plugin.command` (the shell plugin's
/// convention is `params.script` passed to `sh -c`; any other plugin gets
/// its command invoked directly with the job JSON on stdin), captures
/// combined stdout/stderr, gzips it to the job's binary log key, and
/// returns the terminal status plus a one-line description taken from the
/// last nonblank line of output — scenario 1 of spec.md §8 ("echo ok"
/// completes with description "ok") is exactly this convention.
pub async fn run_job(storage: &Storage, job_env: &std::collections::HashMap<String, String>, plugin: &Plugin, job: &Job) -> (JobStatus, String) {
    let mut command = if plugin.id == "shell" || plugin.command == "sh" {
        let script = job.params.get("script").and_then(serde_json::Value::as_str).unwrap_or("true");
        let mut c = Command::new("sh");
        c.arg("-c").arg(script);
        c
    } else {
        let mut c = Command::new(&plugin.command);
        if let Some(script) = &plugin.script {
            c.arg(script);
        }
        c
    };
    command.envs(job_env).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => return (JobStatus::LaunchFailure, format!("failed to spawn {}: {e}", plugin.command)),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::json!({"id": job.id, "event": job.event_id, "params": job.params});
        let _ = stdin.write_all(payload.to_string().as_bytes()).await;
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout).await;
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr).await;
    }

    let exit = child.wait().await;
    if let Err(e) = archive_log(storage, &job.log_path, &stdout, &stderr).await {
        tracing::warn!(job_id = %job.id, error = %e, "failed to persist job log");
    }

    let description = last_nonblank_line(&stdout).or_else(|| last_nonblank_line(&stderr)).unwrap_or_default();
    match exit {
        Ok(status) if status.success() => (JobStatus::Success, description),
        Ok(status) => (JobStatus::Failed, if description.is_empty() { format!("exited with {status}") } else { description }),
        Err(e) => (JobStatus::Failed, format!("wait failed: {e}")),
    }
}

fn last_nonblank_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes).lines().rev().map(str::trim).find(|l| !l.is_empty()).map(str::to_string)
}

async fn archive_log(storage: &Storage, log_path: &str, stdout: &[u8], stderr: &[u8]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(stdout)?;
    if !stderr.is_empty() {
        encoder.write_all(b"\n--- stderr ---\n")?;
        encoder.write_all(stderr)?;
    }
    let gz = encoder.finish()?;
    storage.put_binary(log_path, bytes::Bytes::from(gz)).await?;
    Ok(())
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Runs jobs targeting this node. Completion is reported by upgrading the
/// [`Weak`] reference to the owning [`Dispatcher`] and calling
/// [`Dispatcher::finish`] directly — no network hop, since launcher and
/// dispatcher share a process. [`crate::Daemon::new`] binds the weak
/// reference via [`std::sync::Arc::new_cyclic`] once both exist.
pub struct ProcessLauncher {
    storage: Arc<Storage>,
    dispatcher: std::sync::OnceLock<Weak<Dispatcher<cronicle_core::SystemClock>>>,
    notifier: Arc<dyn Notifier>,
    job_env: std::collections::HashMap<String, String>,
}

impl ProcessLauncher {
    pub fn new(storage: Arc<Storage>, notifier: Arc<dyn Notifier>, job_env: std::collections::HashMap<String, String>) -> Self {
        Self { storage, dispatcher: std::sync::OnceLock::new(), notifier, job_env }
    }

    /// Completes construction once the owning `Dispatcher` exists.
    /// Panics if called twice — this is a one-shot wiring step performed
    /// exactly once by `Daemon::new`, not a runtime reconfiguration.
    #[allow(clippy::panic)]
    pub fn bind(&self, dispatcher: Weak<Dispatcher<cronicle_core::SystemClock>>) {
        self.dispatcher.set(dispatcher).unwrap_or_else(|_| panic!("ProcessLauncher::bind called twice"));
    }

    async fn event_for(&self, event_id: &str) -> Result<cronicle_core::Event> {
        let (_, raw) = self
            .storage
            .list_find("global/schedule", "id", serde_json::json!(event_id))
            .await?
            .ok_or_else(|| Error::NoSuchKey(format!("event {event_id}")))?;
        serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, _hostname: &str, job: &Job) -> Result<()> {
        let event = self.event_for(&job.event_id).await?;
        let plugin = resolve_plugin(&self.storage, &event.plugin_id).await?;
        let dispatcher = self.dispatcher.get().and_then(Weak::upgrade).ok_or_else(|| Error::Fatal("ProcessLauncher not bound to a dispatcher".into()))?;
        let storage = self.storage.clone();
        let notifier = self.notifier.clone();
        let job = job.clone();
        let job_env = self.job_env.clone();
        tokio::spawn(async move {
            let (status, description) = run_job(&storage, &job_env, &plugin, &job).await;
            if let Err(e) = dispatcher.finish(&job.id, status, description, &event, &notifier).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to record job completion");
            }
        });
        Ok(())
    }
}

/// Runs a job handed to this node by `/api/worker/launch` (i.e. this node
/// is a pure worker for that job, not the dispatching manager) and reports
/// the outcome back to `manager_base_url`'s `/api/worker/job_update`,
/// signed the same way the launch request arrived signed. Spawned as a
/// detached task by the `/api/worker/launch` handler so the HTTP response
/// to the manager's launch POST can return immediately (spec.md §4.6 step
/// 3's launch ack is "accepted", not "finished").
pub async fn run_remote_job(
    storage: Arc<Storage>,
    secret_key: String,
    own_hostname: String,
    job_env: std::collections::HashMap<String, String>,
    job: Job,
    manager_base_url: String,
) {
    let event = match storage.list_find("global/schedule", "id", serde_json::json!(job.event_id.clone())).await {
        Ok(Some((_, raw))) => match serde_json::from_value::<cronicle_core::Event>(raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "remote job's event failed to parse");
                return;
            }
        },
        _ => {
            tracing::error!(job_id = %job.id, event_id = %job.event_id, "remote job's event not found");
            return;
        }
    };
    let plugin = match resolve_plugin(&storage, &event.plugin_id).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "remote job's plugin not found");
            return;
        }
    };

    let (status, description) = run_job(&storage, &job_env, &plugin, &job).await;

    let client = reqwest::Client::new();
    let now = cronicle_core::SystemClock.epoch_ms() as i64;
    let signed = match cronicle_wire::auth::sign(&secret_key, &own_hostname, &nanoid::nanoid!(8), now) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "failed to sign job_update report");
            return;
        }
    };
    let url = format!("{}/api/worker/job_update", manager_base_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "jobId": job.id,
        "kind": "complete",
        "code": status.code(),
        "description": description,
    });
    if let Err(e) = client
        .post(&url)
        .header("x-cronicle-api-key", &signed.api_key)
        .header("x-cronicle-salt", &signed.salt)
        .header("x-cronicle-signature", &signed.signature)
        .json(&body)
        .send()
        .await
    {
        tracing::error!(job_id = %job.id, error = %e, "failed to report remote job completion");
    }
}

/// Forwards a launch to a genuinely remote worker over HTTP, signed the
/// same way as the worker's own heartbeat/job-update calls (spec.md §6:
/// "authenticated by HMAC-SHA1(key+salt, secret_key)"). The remote
/// `/api/worker/launch` handler runs the job locally on that node and
/// reports completion back to `manager_base_url` via `/api/worker/job_update`.
pub struct HttpLauncher {
    client: reqwest::Client,
    secret_key: String,
    api_key: String,
    port: u16,
    manager_base_url: String,
}

impl HttpLauncher {
    pub fn new(secret_key: impl Into<String>, api_key: impl Into<String>, port: u16, manager_base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: secret_key.into(),
            api_key: api_key.into(),
            port,
            manager_base_url: manager_base_url.into(),
        }
    }

    fn sign(&self) -> Result<cronicle_wire::auth::SignedRequest> {
        let now = cronicle_core::SystemClock.epoch_ms() as i64;
        cronicle_wire::auth::sign(&self.secret_key, &self.api_key, &nanoid::nanoid!(8), now).map_err(|e| Error::Fatal(e.to_string()))
    }
}

#[async_trait]
impl Launcher for HttpLauncher {
    async fn launch(&self, hostname: &str, job: &Job) -> Result<()> {
        let signed = self.sign()?;
        let url = format!("http://{hostname}:{}/api/worker/launch", self.port);
        let body = serde_json::json!({
            "job": job,
            "managerBaseUrl": self.manager_base_url,
        });
        let resp = self
            .client
            .post(&url)
            .header("x-cronicle-api-key", &signed.api_key)
            .header("x-cronicle-salt", &signed.salt)
            .header("x-cronicle-signature", &signed.signature)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::LaunchFailure(format!("{hostname}: {e}")))?;
        let value: serde_json::Value = resp.json().await.map_err(|e| Error::LaunchFailure(format!("{hostname}: bad response: {e}")))?;
        if value.get("code").and_then(serde_json::Value::as_i64) == Some(0) {
            Ok(())
        } else {
            Err(Error::LaunchFailure(format!("{hostname}: {value}")))
        }
    }
}

/// Routes a launch to [`ProcessLauncher`] when `hostname` is this node,
/// else to [`HttpLauncher`] (spec.md §9's "worker" vs "self" distinction
/// isn't named explicitly, but every multi-node deployment needs it: a
/// manager that is also a worker must not loop a job through its own HTTP
/// server just to run it locally).
pub struct CompositeLauncher {
    own_hostname: String,
    local: Arc<ProcessLauncher>,
    remote: Arc<HttpLauncher>,
}

impl CompositeLauncher {
    pub fn new(own_hostname: impl Into<String>, local: Arc<ProcessLauncher>, remote: Arc<HttpLauncher>) -> Self {
        Self { own_hostname: own_hostname.into(), local, remote }
    }
}

#[async_trait]
impl Launcher for CompositeLauncher {
    async fn launch(&self, hostname: &str, job: &Job) -> Result<()> {
        if hostname == self.own_hostname {
            self.local.launch(hostname, job).await
        } else {
            self.remote.launch(hostname, job).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronicle_core::JobStatus;

    fn sample_job(params: serde_json::Value) -> Job {
        Job {
            id: "j1".into(),
            event_id: "e1".into(),
            hostname: "h1".into(),
            pid: None,
            start_epoch_ms: 0,
            end_epoch_ms: None,
            status: JobStatus::Running,
            description: String::new(),
            progress: 0.0,
            cpu_pct_samples: vec![],
            mem_bytes_samples: vec![],
            log_path: "jobs/j1/log.txt.gz".into(),
            params,
            last_update_epoch_ms: 0,
            attempt: 0,
        }
    }

    fn storage(dir: &std::path::Path) -> Arc<Storage> {
        let engine = Arc::new(cronicle_storage::engine::LocalFsEngine::new(dir.join("data")));
        Arc::new(Storage::new(engine, dir.join("_transactions"), 4))
    }

    #[tokio::test]
    async fn shell_plugin_runs_the_script_and_captures_stdout_as_description() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let plugin = Plugin { id: "shell".into(), title: "Shell".into(), command: "sh".into(), script: None, params_schema: serde_json::json!({}) };
        let job = sample_job(serde_json::json!({"script": "echo ok"}));

        let (status, description) = run_job(&storage, &Default::default(), &plugin, &job).await;

        assert_eq!(status, JobStatus::Success);
        assert_eq!(description, "ok");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let plugin = Plugin { id: "shell".into(), title: "Shell".into(), command: "sh".into(), script: None, params_schema: serde_json::json!({}) };
        let job = sample_job(serde_json::json!({"script": "exit 3"}));

        let (status, _description) = run_job(&storage, &Default::default(), &plugin, &job).await;

        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn job_log_is_persisted_as_a_gzip_binary_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let plugin = Plugin { id: "shell".into(), title: "Shell".into(), command: "sh".into(), script: None, params_schema: serde_json::json!({}) };
        let job = sample_job(serde_json::json!({"script": "echo hello"}));

        run_job(&storage, &Default::default(), &plugin, &job).await;

        let info = storage.head(&job.log_path).await.unwrap();
        assert!(info.len > 0);
    }

    #[tokio::test]
    async fn composite_launcher_routes_to_local_when_hostname_matches_self() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let event = cronicle_core::Event {
            id: "e1".into(),
            title: "t".into(),
            enabled: true,
            category_id: "general".into(),
            target: cronicle_core::RunTarget::hostname("h1"),
            dispatch_policy: Default::default(),
            multiplex: false,
            timing: Default::default(),
            plugin_id: "shell".into(),
            params: serde_json::json!({"script": "echo ok"}),
            max_children: 1,
            timeout_sec: None,
            catch_up: false,
            queue_max: 0,
            retries: 0,
            retry_delay_sec: 0,
            notify_success: vec![],
            notify_fail: vec![],
            chain_success: vec![],
            chain_error: vec![],
            web_hook: None,
            cpu_limit: None,
            memory_limit: None,
            created: 0,
            modified: 0,
        };
        storage.list_push("global/schedule", vec![serde_json::to_value(&event).unwrap()]).await.unwrap();
        let plugin = Plugin { id: "shell".into(), title: "Shell".into(), command: "sh".into(), script: None, params_schema: serde_json::json!({}) };
        storage.list_push("global/plugins", vec![serde_json::to_value(&plugin).unwrap()]).await.unwrap();

        let coord = Arc::new(crate::cluster::Coordinator::new(storage.clone(), "h1"));
        let notifier: Arc<dyn Notifier> = Arc::new(crate::notify::LoggingNotifier);
        let launcher = Arc::new(ProcessLauncher::new(storage.clone(), notifier, Default::default()));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), coord, launcher.clone(), cronicle_core::SystemClock, 0));
        launcher.bind(Arc::downgrade(&dispatcher));

        dispatcher.dispatch("e1", "h1", 1, 0, event.params.clone()).await.unwrap();
        // Completion runs on a spawned task; give it a moment to land.
        for _ in 0..50 {
            if dispatcher.active_count("e1") == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(dispatcher.active_count("e1"), 0);
        assert_eq!(storage.list_length("logs/completed").await.unwrap(), 1);
    }
}
