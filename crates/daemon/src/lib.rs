// SPDX-License-Identifier: MIT

//! cronicle-daemon: the single-process node that can be a manager, a
//! worker, or both — config loading, UDP discovery, cluster/manager
//! election, the minute-tick scheduler, the dispatcher, and the HTTP/API
//! surface, wired the way the teacher's own daemon crate composes its
//! adapters behind one `Daemon` entry point.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod api;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod notify;
pub mod scheduler;
pub mod worker;

pub use config::{Config, ConfigHandle};
pub use error::{Error, Result};

use cronicle_core::{Clock, SystemClock};
use cronicle_storage::Storage;
use std::sync::Arc;
use std::time::Duration;

use api::AppState;
use cluster::Coordinator;
use dispatcher::{Dispatcher, Launcher};
use scheduler::Scheduler;

/// Everything a running node needs: storage, the cluster coordinator, the
/// scheduler (only active manager-side), and the dispatcher. `run` drives
/// the minute tick and manager-heartbeat loop; the HTTP surface is served
/// separately via [`http::build_router`] against the same [`AppState`].
pub struct Daemon {
    pub storage: Arc<Storage>,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<Dispatcher<SystemClock>>,
    pub scheduler: Scheduler<SystemClock>,
    pub config: ConfigHandle,
    pub notifier: Arc<dyn notify::Notifier>,
}

impl Daemon {
    /// Builds a node with the default [`notify::LoggingNotifier`]. Real
    /// deployments that want actual delivery would supply their own
    /// `Notifier` via [`Daemon::with_notifier`] — cronicle-cli's `run`
    /// subcommand does not, since a real mailer/webhook sink is out of
    /// scope here (spec.md §4.1).
    pub fn new(storage: Arc<Storage>, hostname: impl Into<String>, config: Config) -> Self {
        Self::with_notifier(storage, hostname, config, Arc::new(notify::LoggingNotifier))
    }

    /// Wires up the cluster coordinator, the composite launcher (local
    /// subprocess execution for jobs targeting this node, signed HTTP for
    /// everything else), and the dispatcher that owns them, binding the
    /// local launcher's back-reference to the dispatcher via `new`'s
    /// otherwise-unavoidable ownership cycle through a [`std::sync::Weak`]
    /// set post-construction.
    pub fn with_notifier(
        storage: Arc<Storage>,
        hostname: impl Into<String>,
        config: Config,
        notifier: Arc<dyn notify::Notifier>,
    ) -> Self {
        let hostname = hostname.into();
        let coordinator = Arc::new(Coordinator::new(storage.clone(), hostname.clone()));

        let process_launcher = Arc::new(worker::ProcessLauncher::new(
            storage.clone(),
            notifier.clone(),
            config.job_env.clone(),
        ));
        let http_launcher = Arc::new(worker::HttpLauncher::new(
            config.secret_key.clone(),
            hostname.clone(),
            config.web_server.http_port,
            config.base_app_url.clone(),
        ));
        let composite: Arc<dyn Launcher> = Arc::new(worker::CompositeLauncher::new(
            hostname.clone(),
            process_launcher.clone(),
            http_launcher,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            coordinator.clone(),
            composite,
            SystemClock,
            config.max_jobs,
        ));
        process_launcher.bind(Arc::downgrade(&dispatcher));

        let scheduler = Scheduler::new(storage.clone(), SystemClock);
        Self {
            storage,
            coordinator,
            dispatcher,
            scheduler,
            config: ConfigHandle::new(config),
            notifier,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            storage: self.storage.clone(),
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
            dispatcher: self.dispatcher.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Runs recovery, then loops forever driving manager election, the
    /// minute tick, and dead-worker/dead-job eviction at their configured
    /// cadences (spec.md §4.3-§4.6). Intended to run in its own task
    /// alongside the HTTP server built from [`Daemon::app_state`].
    pub async fn run(&self) -> Result<()> {
        self.storage.recover().await?;
        let cfg = self.config.get();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut last_minute_fired = -1i64;
        loop {
            tick.tick().await;
            let now_ms = SystemClock.epoch_ms();

            if self.coordinator.try_claim_manager(&SystemClock, cfg.manager_ping_timeout_sec * 1000).await? {
                self.coordinator.renew_manager_claim(&SystemClock).await?;
            }

            if self.coordinator.state() == cluster::NodeState::Manager {
                let current_minute = now_ms as i64 / 60_000;
                if current_minute != last_minute_fired {
                    last_minute_fired = current_minute;
                    self.run_scheduler_tick(cfg.scheduler_startup_grace_sec as i64 / 60).await?;
                }
                let evicted = self.coordinator.evict_dead_workers(now_ms, cfg.dead_job_timeout_sec * 1000);
                for hostname in evicted {
                    tracing::warn!(%hostname, "evicted unresponsive worker");
                }
                self.dispatcher.detect_dead_jobs(cfg.dead_job_timeout_sec * 1000).await?;
            }
        }
    }

    async fn run_scheduler_tick(&self, startup_grace_minutes: i64) -> Result<()> {
        let due = self.scheduler.due_runs(startup_grace_minutes).await?;
        if due.is_empty() {
            return Ok(());
        }
        for run in &due {
            if let Err(e) = self.dispatch_due_run(run).await {
                tracing::error!(event_id = %run.event_id, error = %e, "dispatch failed, continuing tick");
            }
        }
        self.scheduler.advance_cursors(&due).await
    }

    async fn dispatch_due_run(&self, run: &scheduler::DueRun) -> Result<()> {
        let Some((_idx, raw)) = self.storage.list_find("global/schedule", "id", serde_json::json!(run.event_id)).await? else {
            return Ok(());
        };
        let event: cronicle_core::Event = serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
        let Some(hostname) = self.dispatcher.resolve_single_target(&event.id, &event.target, event.dispatch_policy, run.minute_epoch as usize).await else {
            return Err(Error::Validation(format!("no live worker for event {}", event.id)));
        };
        self.dispatcher
            .dispatch(&event.id, &hostname, event.max_children.max(1), event.queue_max, event.params.clone())
            .await?;
        Ok(())
    }
}
