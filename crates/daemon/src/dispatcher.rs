// SPDX-License-Identifier: MIT

//! Event dispatch (spec.md §4.6): target resolution, concurrency
//! enforcement, job bookkeeping, completion handling, retries, and
//! chain-reaction dispatch. Actually launching a job on a worker is
//! abstracted behind `Launcher` so this module is testable without a
//! network — `cronicle_daemon::http` supplies the real HTTP-backed
//! implementation.

use async_trait::async_trait;
use cronicle_core::target::{DispatchPolicy, RunTarget};
use cronicle_core::{new_id, Clock, Job, JobStatus};
use cronicle_storage::Storage;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::cluster::Coordinator;
use crate::error::{Error, Result};

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Sends an authenticated launch request to `hostname` for `job`.
    /// `Ok(())` means the worker acknowledged the launch; an `Err` means
    /// the ack never arrived (timeout or transport failure) and the
    /// dispatcher should record a `launch_failure`.
    async fn launch(&self, hostname: &str, job: &Job) -> Result<()>;
}

/// A queued-but-not-yet-dispatched run, held because the event was already
/// at `max_children` (spec.md §4.6's bounded per-event queue).
#[derive(Debug, Clone)]
struct QueuedRun {
    params: serde_json::Value,
}

struct EventRuntime {
    active: u32,
    queue: VecDeque<QueuedRun>,
}

impl Default for EventRuntime {
    fn default() -> Self {
        Self { active: 0, queue: VecDeque::new() }
    }
}

pub struct Dispatcher<C: Clock> {
    storage: Arc<Storage>,
    coordinator: Arc<Coordinator>,
    launcher: Arc<dyn Launcher>,
    clock: C,
    runtimes: Mutex<HashMap<String, EventRuntime>>,
    active_jobs: Mutex<HashMap<String, Job>>,
    global_max_jobs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started,
    Queued,
    Overflow,
}

impl<C: Clock> Dispatcher<C> {
    pub fn new(storage: Arc<Storage>, coordinator: Arc<Coordinator>, launcher: Arc<dyn Launcher>, clock: C, global_max_jobs: u32) -> Self {
        Self {
            storage,
            coordinator,
            launcher,
            clock,
            runtimes: Mutex::new(HashMap::new()),
            active_jobs: Mutex::new(HashMap::new()),
            global_max_jobs,
        }
    }

    fn total_active(&self) -> u32 {
        self.active_jobs.lock().len() as u32
    }

    /// Reads and advances the persisted round-robin cursor for `event_id`
    /// (`global/state.round_robin_cursors`, spec.md:196), returning the
    /// candidate index this dispatch should resolve against.
    #[allow(clippy::expect_used)]
    async fn next_round_robin_index(&self, event_id: &str) -> Result<usize> {
        let mut state: cronicle_core::SchedulerState = match self.storage.get("global/state").await {
            std::result::Result::Ok(v) => serde_json::from_value(v).unwrap_or_default(),
            Err(e) if e.is_not_found() => cronicle_core::SchedulerState::default(),
            Err(e) => return Err(e.into()),
        };
        let index = state.round_robin_cursor_for(event_id);
        state.advance_round_robin_cursor(event_id, index + 1);
        self.storage.put("global/state", serde_json::to_value(&state).expect("serializes")).await?;
        Ok(index as usize)
    }

    /// Picks a hostname for `target`, given the set of currently-live
    /// worker hostnames, per `policy`. `multiplex` callers resolve every
    /// live candidate instead of calling this. `candidate_index` only
    /// matters for `random` (callers vary it per attempt); `round_robin`
    /// ignores it and reads/advances `event_id`'s persisted cursor instead.
    pub async fn resolve_single_target(&self, event_id: &str, target: &RunTarget, policy: DispatchPolicy, candidate_index: usize) -> Option<String> {
        let live: Vec<String> = match target {
            RunTarget::Hostname(h) => {
                if self.coordinator.worker_snapshot().contains_key(h) {
                    vec![h.clone()]
                } else {
                    vec![]
                }
            }
            RunTarget::Group(group_id) => self
                .coordinator
                .worker_snapshot()
                .into_iter()
                .filter(|(_, info)| info.group_id.as_deref() == Some(group_id.as_str()))
                .map(|(h, _)| h)
                .collect(),
            RunTarget::All => self.coordinator.worker_snapshot().into_keys().collect(),
        };
        if live.is_empty() {
            return None;
        }
        let mut sorted = live;
        sorted.sort();
        let len = sorted.len().max(1);
        match policy {
            DispatchPolicy::Random => sorted.into_iter().nth(candidate_index % len),
            DispatchPolicy::RoundRobin => {
                let index = match self.next_round_robin_index(event_id).await {
                    Ok(i) => i,
                    Err(e) => {
                        tracing::warn!(event_id, error = %e, "round-robin cursor persist failed, falling back to candidate 0");
                        0
                    }
                };
                sorted.into_iter().nth(index % len)
            }
            DispatchPolicy::LeastLoaded => {
                let active_jobs = self.active_jobs.lock();
                sorted.into_iter().min_by_key(|h| active_jobs.values().filter(|j| &j.hostname == h).count())
            }
        }
    }

    /// Attempts to start (or queue) one run of `event_id`. Enforces
    /// per-event `max_children`/`queue_max` and the global `max_jobs` cap
    /// (spec.md §4.6 step 2).
    pub async fn dispatch(
        &self,
        event_id: &str,
        hostname: &str,
        max_children: u32,
        queue_max: u32,
        params: serde_json::Value,
    ) -> Result<DispatchOutcome> {
        self.dispatch_attempt(event_id, hostname, max_children, queue_max, params, 0).await
    }

    /// Same as [`Dispatcher::dispatch`] but stamps the launched job with
    /// `attempt` (nonzero for retries, spec.md §4.6 step 7's "schedule
    /// retry after `retry_delay`").
    ///
    /// `queue_max` bounds total in-flight runs for the event (active plus
    /// queued), not the queue alone — `max_children` only decides whether
    /// an admitted run starts immediately or waits in the queue.
    pub async fn dispatch_attempt(
        &self,
        event_id: &str,
        hostname: &str,
        max_children: u32,
        queue_max: u32,
        params: serde_json::Value,
        attempt: u32,
    ) -> Result<DispatchOutcome> {
        if self.global_max_jobs > 0 && self.total_active() >= self.global_max_jobs {
            return Err(Error::QueueOverflow(event_id.to_string()));
        }

        enum Admission {
            Start,
            Queue,
            Overflow,
        }

        let admission = {
            let mut runtimes = self.runtimes.lock();
            let rt = runtimes.entry(event_id.to_string()).or_default();
            if rt.active < max_children {
                rt.active += 1;
                Admission::Start
            } else if rt.active + (rt.queue.len() as u32) < queue_max {
                rt.queue.push_back(QueuedRun { params: params.clone() });
                Admission::Queue
            } else {
                Admission::Overflow
            }
        };

        match admission {
            Admission::Start => {
                self.launch_job(event_id, hostname, params, attempt).await?;
                Ok(DispatchOutcome::Started)
            }
            Admission::Queue => Ok(DispatchOutcome::Queued),
            Admission::Overflow => Err(Error::QueueOverflow(event_id.to_string())),
        }
    }

    #[allow(clippy::expect_used)]
    async fn launch_job(&self, event_id: &str, hostname: &str, params: serde_json::Value, attempt: u32) -> Result<String> {
        let job_id = new_id("j");
        let now = self.clock.epoch_ms();
        let job = Job {
            id: job_id.clone(),
            event_id: event_id.to_string(),
            hostname: hostname.to_string(),
            pid: None,
            start_epoch_ms: now,
            end_epoch_ms: None,
            status: JobStatus::Running,
            description: String::new(),
            progress: 0.0,
            cpu_pct_samples: Vec::new(),
            mem_bytes_samples: Vec::new(),
            log_path: format!("jobs/{job_id}/log.txt.gz"),
            params,
            last_update_epoch_ms: now,
            attempt,
        };

        match self.launcher.launch(hostname, &job).await {
            Ok(()) => {
                self.storage.hash_put("active_jobs", &job_id, serde_json::to_value(&job).expect("serializes")).await?;
                self.active_jobs.lock().insert(job_id.clone(), job);
                tracing::debug!(job_id, event_id, hostname, "job launched");
                Ok(job_id)
            }
            Err(e) => {
                self.release_slot(event_id).await?;
                tracing::warn!(job_id, event_id, hostname, error = %e, "launch failed");
                Err(Error::LaunchFailure(format!("{hostname}: {e}")))
            }
        }
    }

    /// Releases one active slot for `event_id`. The caller is responsible
    /// for draining the next queued run via `take_queued` and re-dispatching
    /// it (re-dispatch needs a freshly resolved target, which this module
    /// doesn't have in hand at release time) — spec.md §4.6 step 7's "drain
    /// next queued run".
    async fn release_slot(&self, event_id: &str) -> Result<()> {
        let mut runtimes = self.runtimes.lock();
        let rt = runtimes.entry(event_id.to_string()).or_default();
        rt.active = rt.active.saturating_sub(1);
        Ok(())
    }

    /// Pops the next queued run for `event_id`, if the slot freed by a
    /// completion should immediately start one. Returns `None` if nothing
    /// is queued.
    pub fn take_queued(&self, event_id: &str) -> Option<serde_json::Value> {
        let mut runtimes = self.runtimes.lock();
        runtimes.get_mut(event_id).and_then(|rt| rt.queue.pop_front()).map(|q| q.params)
    }

    pub fn active_count(&self, event_id: &str) -> u32 {
        self.runtimes.lock().get(event_id).map(|rt| rt.active).unwrap_or(0)
    }

    pub fn queued_count(&self, event_id: &str) -> u32 {
        self.runtimes.lock().get(event_id).map(|rt| rt.queue.len() as u32).unwrap_or(0)
    }

    pub fn record_progress(&self, job_id: &str, progress: f32) {
        if let Some(job) = self.active_jobs.lock().get_mut(job_id) {
            job.progress = progress.clamp(0.0, 1.0);
            job.last_update_epoch_ms = self.clock.epoch_ms();
        }
    }

    pub fn record_heartbeat(&self, job_id: &str) {
        if let Some(job) = self.active_jobs.lock().get_mut(job_id) {
            job.last_update_epoch_ms = self.clock.epoch_ms();
        }
    }

    /// Completion handling (spec.md §4.6 step 7): appends to the completed
    /// log, releases the event's slot, and returns the terminal `Job` so
    /// the caller can decide on retries/chain-reactions/notifications.
    #[allow(clippy::expect_used)]
    pub async fn complete(&self, job_id: &str, status: JobStatus, description: String) -> Result<Option<Job>> {
        let mut job = match self.active_jobs.lock().remove(job_id) {
            Some(j) => j,
            None => return Ok(None),
        };
        job.status = status;
        job.description = description;
        job.end_epoch_ms = Some(self.clock.epoch_ms());

        self.storage.hash_delete("active_jobs", job_id).await?;
        self.storage
            .list_push("logs/completed", vec![serde_json::to_value(&job).expect("serializes")])
            .await?;
        self.storage
            .list_push(&format!("logs/jobs/{}", job.event_id), vec![serde_json::to_value(&job).expect("serializes")])
            .await?;
        self.release_slot(&job.event_id).await?;
        tracing::info!(job_id, event_id = %job.event_id, status = ?job.status, "job completed");
        Ok(Some(job))
    }

    /// Full completion handling (spec.md §4.6 step 7): records the
    /// terminal job via [`Dispatcher::complete`], drains the next queued
    /// run into the freed slot, then either schedules a retry or fires
    /// chain-reaction dispatch and a notification — whichever the
    /// terminal status calls for. `event` is the caller's already-fetched
    /// record for `job.event_id` (the dispatcher itself holds no event
    /// cache, it only knows ids).
    pub async fn finish(
        self: &Arc<Self>,
        job_id: &str,
        status: JobStatus,
        description: String,
        event: &cronicle_core::Event,
        notifier: &Arc<dyn crate::notify::Notifier>,
    ) -> Result<Option<Job>>
    where
        C: Clone + 'static,
    {
        let job = match self.complete(job_id, status, description).await? {
            Some(j) => j,
            None => return Ok(None),
        };

        if let Some(params) = self.take_queued(&event.id) {
            match self.resolve_single_target(&event.id, &event.target, event.dispatch_policy, 0).await {
                Some(hostname) => {
                    if let Err(e) = self.dispatch(&event.id, &hostname, event.max_children.max(1), event.queue_max, params).await {
                        tracing::warn!(event_id = %event.id, error = %e, "queued run failed to start after slot freed");
                    }
                }
                None => tracing::warn!(event_id = %event.id, "queued run has no live worker to start on"),
            }
        }

        if job.status.code() == 0 {
            notifier.notify(&event.notify_success, &job, "success");
            for chained in &event.chain_success {
                self.dispatch_chain(chained).await;
            }
        } else if Self::should_retry(&job, event.retries, job.attempt) {
            self.schedule_retry(event.clone(), job.clone());
        } else {
            notifier.notify(&event.notify_fail, &job, "failure");
            for chained in &event.chain_error {
                self.dispatch_chain(chained).await;
            }
        }

        Ok(Some(job))
    }

    /// Looks up `event_id` fresh (a chain-reaction target may have been
    /// edited or disabled since the triggering event was loaded) and
    /// dispatches it bypassing timing, per spec.md §4.5's "chain-reaction
    /// triggers go straight to the dispatcher". Best-effort: failures are
    /// logged, never propagated, so one broken chain link can't wedge the
    /// triggering job's own completion.
    async fn dispatch_chain(self: &Arc<Self>, event_id: &str) {
        let found = match self.storage.list_find("global/schedule", "id", serde_json::json!(event_id)).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(event_id, error = %e, "chain-reaction lookup failed");
                return;
            }
        };
        let Some((_, raw)) = found else {
            tracing::warn!(event_id, "chain-reaction event not found");
            return;
        };
        let event: cronicle_core::Event = match serde_json::from_value(raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(event_id, error = %e, "chain-reaction event failed to parse");
                return;
            }
        };
        if !event.enabled {
            return;
        }
        match self.resolve_single_target(&event.id, &event.target, event.dispatch_policy, 0).await {
            Some(hostname) => {
                if let Err(e) = self.dispatch(&event.id, &hostname, event.max_children.max(1), event.queue_max, event.params.clone()).await {
                    tracing::warn!(event_id, error = %e, "chain-reaction dispatch failed");
                }
            }
            None => tracing::warn!(event_id, "chain-reaction target has no live worker"),
        }
    }

    /// Spawns a detached task that sleeps `event.retry_delay_sec` then
    /// re-dispatches `job` as `job.attempt + 1` (spec.md §4.6 step 7).
    /// Detached rather than awaited so the triggering completion (and
    /// whichever caller drove it — a worker HTTP update or the local
    /// process launcher) isn't held open for the retry delay.
    fn schedule_retry(self: &Arc<Self>, event: cronicle_core::Event, job: Job)
    where
        C: Clone + 'static,
    {
        let me = self.clone();
        let delay = std::time::Duration::from_secs(event.retry_delay_sec);
        let next_attempt = job.attempt + 1;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match me.resolve_single_target(&event.id, &event.target, event.dispatch_policy, next_attempt as usize).await {
                Some(hostname) => {
                    if let Err(e) = me
                        .dispatch_attempt(&event.id, &hostname, event.max_children.max(1), event.queue_max, job.params.clone(), next_attempt)
                        .await
                    {
                        tracing::warn!(event_id = %event.id, attempt = next_attempt, error = %e, "retry dispatch failed");
                    }
                }
                None => tracing::warn!(event_id = %event.id, attempt = next_attempt, "retry has no live worker"),
            }
        });
    }

    /// Dead-job detection (spec.md §4.6 step 8): any active job whose last
    /// update predates `dead_job_timeout_ms` is marked `WorkerLost`.
    pub async fn detect_dead_jobs(&self, dead_job_timeout_ms: u64) -> Result<Vec<Job>> {
        let now = self.clock.epoch_ms();
        let stale_ids: Vec<String> = self
            .active_jobs
            .lock()
            .values()
            .filter(|j| now.saturating_sub(j.last_update_epoch_ms) > dead_job_timeout_ms)
            .map(|j| j.id.clone())
            .collect();
        let mut dead = Vec::new();
        for id in stale_ids {
            if let Some(job) = self.complete(&id, JobStatus::WorkerLost, "worker lost".into()).await? {
                dead.push(job);
            }
        }
        Ok(dead)
    }

    /// Whether a terminal job should be retried (spec.md §4.6 step 7):
    /// failed with retries remaining.
    pub fn should_retry(job: &Job, retries_configured: u32, attempt: u32) -> bool {
        job.status.code() != 0 && job.status != JobStatus::WorkerLost && attempt < retries_configured
    }

    pub fn active_job_snapshot(&self) -> HashMap<String, Job> {
        self.active_jobs.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronicle_core::FakeClock;

    struct AlwaysAck;
    #[async_trait]
    impl Launcher for AlwaysAck {
        async fn launch(&self, _hostname: &str, _job: &Job) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl Launcher for AlwaysFail {
        async fn launch(&self, _hostname: &str, _job: &Job) -> Result<()> {
            Err(Error::LaunchFailure("connection refused".into()))
        }
    }

    fn storage(dir: &std::path::Path) -> Arc<Storage> {
        let engine = Arc::new(cronicle_storage::engine::LocalFsEngine::new(dir.join("data")));
        Arc::new(Storage::new(engine, dir.join("_transactions"), 4))
    }

    #[tokio::test]
    async fn dispatch_starts_up_to_max_children_then_queues() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        let dispatcher = Dispatcher::new(storage, coord, Arc::new(AlwaysAck), FakeClock::new(0), 0);

        // queue_max bounds total in-flight (active+queued), not the queue
        // alone, so 3 accepted runs with max_children=1 need queue_max=3.
        let a = dispatcher.dispatch("e1", "h1", 1, 3, serde_json::json!({})).await.unwrap();
        let b = dispatcher.dispatch("e1", "h1", 1, 3, serde_json::json!({})).await.unwrap();
        let c = dispatcher.dispatch("e1", "h1", 1, 3, serde_json::json!({})).await.unwrap();

        assert_eq!(a, DispatchOutcome::Started);
        assert_eq!(b, DispatchOutcome::Queued);
        assert_eq!(c, DispatchOutcome::Queued);
        assert_eq!(dispatcher.active_count("e1"), 1);
        assert_eq!(dispatcher.queued_count("e1"), 2);
    }

    #[tokio::test]
    async fn dispatch_overflows_once_the_queue_is_also_full() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        let dispatcher = Dispatcher::new(storage, coord, Arc::new(AlwaysAck), FakeClock::new(0), 0);

        // max_children=1, queue_max=2: call 1 starts, call 2 queues (total=2),
        // call 3 would make total=3 > queue_max and overflows.
        dispatcher.dispatch("e1", "h1", 1, 2, serde_json::json!({})).await.unwrap();
        dispatcher.dispatch("e1", "h1", 1, 2, serde_json::json!({})).await.unwrap();
        let overflow = dispatcher.dispatch("e1", "h1", 1, 2, serde_json::json!({})).await;
        assert!(matches!(overflow, Err(Error::QueueOverflow(_))));
    }

    #[tokio::test]
    async fn failed_launch_releases_the_slot_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        let dispatcher = Dispatcher::new(storage, coord, Arc::new(AlwaysFail), FakeClock::new(0), 0);

        let result = dispatcher.dispatch("e1", "h1", 1, 0, serde_json::json!({})).await;
        assert!(result.is_err());
        assert_eq!(dispatcher.active_count("e1"), 0);
    }

    #[tokio::test]
    async fn completion_appends_to_completed_log_and_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        let dispatcher = Dispatcher::new(storage.clone(), coord, Arc::new(AlwaysAck), FakeClock::new(0), 0);

        dispatcher.dispatch("e1", "h1", 1, 0, serde_json::json!({})).await.unwrap();
        let job_id = dispatcher.active_job_snapshot().into_keys().next().unwrap();
        let job = dispatcher.complete(&job_id, JobStatus::Success, "ok".into()).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(dispatcher.active_count("e1"), 0);
        let completed_len = storage.list_length("logs/completed").await.unwrap();
        assert_eq!(completed_len, 1);
    }

    #[tokio::test]
    async fn dead_job_detection_marks_worker_lost_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        let clock = FakeClock::new(0);
        let dispatcher = Dispatcher::new(storage, coord, Arc::new(AlwaysAck), clock.clone(), 0);

        dispatcher.dispatch("e1", "h1", 1, 0, serde_json::json!({})).await.unwrap();
        clock.advance_secs(200);
        let dead = dispatcher.detect_dead_jobs(120_000).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, JobStatus::WorkerLost);
        assert_eq!(dead[0].status.code(), 255);
    }

    fn sample_event(id: &str) -> cronicle_core::Event {
        cronicle_core::Event {
            id: id.into(),
            title: id.into(),
            enabled: true,
            category_id: "general".into(),
            target: RunTarget::hostname("h1"),
            dispatch_policy: DispatchPolicy::Random,
            multiplex: false,
            timing: cronicle_core::Timing::default(),
            plugin_id: "shell".into(),
            params: serde_json::json!({}),
            max_children: 1,
            timeout_sec: None,
            catch_up: false,
            queue_max: 1,
            retries: 1,
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
        }
    }

    #[tokio::test]
    async fn finish_drains_the_queue_into_the_freed_slot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        coord.register_worker(&FakeClock::new(0), "h1").await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(storage, coord, Arc::new(AlwaysAck), FakeClock::new(0), 0));
        let notifier: Arc<dyn crate::notify::Notifier> = Arc::new(crate::notify::LoggingNotifier);
        let event = sample_event("e1");

        dispatcher.dispatch("e1", "h1", 1, 2, serde_json::json!({})).await.unwrap();
        dispatcher.dispatch("e1", "h1", 1, 2, serde_json::json!({})).await.unwrap();
        assert_eq!(dispatcher.queued_count("e1"), 1);

        let job_id = dispatcher.active_job_snapshot().into_keys().next().unwrap();
        dispatcher.finish(&job_id, JobStatus::Success, "ok".into(), &event, &notifier).await.unwrap();

        assert_eq!(dispatcher.queued_count("e1"), 0);
        assert_eq!(dispatcher.active_count("e1"), 1);
    }

    #[tokio::test]
    async fn finish_fires_chain_success_when_a_chained_event_exists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let mut chained = sample_event("e2");
        chained.id = "e2".into();
        storage.list_push("global/schedule", vec![serde_json::to_value(&chained).unwrap()]).await.unwrap();

        let coord = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        coord.register_worker(&FakeClock::new(0), "h1").await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(storage, coord, Arc::new(AlwaysAck), FakeClock::new(0), 0));
        let notifier: Arc<dyn crate::notify::Notifier> = Arc::new(crate::notify::LoggingNotifier);

        let mut event = sample_event("e1");
        event.chain_success = vec!["e2".into()];
        dispatcher.dispatch("e1", "h1", 1, 0, serde_json::json!({})).await.unwrap();
        let job_id = dispatcher.active_job_snapshot().into_keys().next().unwrap();
        dispatcher.finish(&job_id, JobStatus::Success, "ok".into(), &event, &notifier).await.unwrap();

        assert_eq!(dispatcher.active_count("e2"), 1);
    }

    #[test]
    fn should_retry_only_when_attempts_remain_and_the_job_is_not_worker_lost() {
        let mut job = sample_failed_job();
        assert!(Dispatcher::<FakeClock>::should_retry(&job, 2, 0));
        assert!(!Dispatcher::<FakeClock>::should_retry(&job, 2, 2));
        job.status = JobStatus::WorkerLost;
        assert!(!Dispatcher::<FakeClock>::should_retry(&job, 2, 0));
    }

    fn sample_failed_job() -> Job {
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

}
