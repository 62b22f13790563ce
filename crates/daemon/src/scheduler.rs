// SPDX-License-Identifier: MIT

//! Minute-tick scheduler (spec.md §4.5). Runs only while the node holds
//! `Manager`; ticks are driven by an injected `Clock` rather than wall-clock
//! sleeps so catch-up behavior is deterministically testable.

use cronicle_core::timing::MinuteKey;
use cronicle_core::{Clock, Event, SchedulerState};
use cronicle_storage::Storage;
use std::sync::Arc;

use crate::error::Result;

/// One event whose timing matched a pending minute and should be
/// dispatched. `minute_epoch` is the cursor value to persist once the
/// dispatch has been handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueRun {
    pub event_id: String,
    pub minute_epoch: i64,
}

pub struct Scheduler<C: Clock> {
    storage: Arc<Storage>,
    clock: C,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(storage: Arc<Storage>, clock: C) -> Self {
        Self { storage, clock }
    }

    async fn load_state(&self) -> Result<SchedulerState> {
        match self.storage.get("global/state").await {
            std::result::Result::Ok(v) => Ok(serde_json::from_value(v).unwrap_or_default()),
            Err(e) if e.is_not_found() => Ok(SchedulerState::default()),
            Err(e) => Err(e.into()),
        }
    }

    #[allow(clippy::expect_used)]
    async fn save_state(&self, state: &SchedulerState) -> Result<()> {
        self.storage
            .put("global/state", serde_json::to_value(state).expect("serializes"))
            .await?;
        Ok(())
    }

    async fn schedule(&self) -> Result<Vec<Event>> {
        let raw = self.storage.list_get("global/schedule", 0, u64::MAX).await?;
        Ok(raw.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect())
    }

    /// Computes every (event, minute) pair due since each event's cursor,
    /// bounded by `startup_grace_minutes` of catch-up per event (spec.md
    /// §4.5 step 1-4; catch-up is bounded so a long-dead manager doesn't
    /// replay years of missed minutes on restart).
    pub async fn due_runs(&self, startup_grace_minutes: i64) -> Result<Vec<DueRun>> {
        let state = self.load_state().await?;
        if !state.enabled {
            return Ok(Vec::new());
        }
        let events = self.schedule().await?;
        let now_minute = MinuteKey::from_datetime(&self.clock.now_utc()).as_epoch_minute();

        let mut due = Vec::new();
        for event in events.iter().filter(|e| e.is_schedulable()) {
            let cursor = state.cursor_for(&event.id);
            let earliest = if event.catch_up {
                (now_minute - startup_grace_minutes).max(cursor + 1)
            } else {
                now_minute
            };
            for minute_epoch in earliest..=now_minute {
                if minute_epoch <= cursor {
                    continue;
                }
                let dt = chrono::DateTime::from_timestamp(minute_epoch * 60, 0)
                    .unwrap_or_else(chrono::Utc::now);
                let key = MinuteKey::from_datetime(&dt);
                if event.timing.matches(&key) {
                    due.push(DueRun { event_id: event.id.clone(), minute_epoch });
                }
            }
        }
        Ok(due)
    }

    /// Persists a new cursor for every run in `fired`, under a single short
    /// transaction (spec.md §4.5 step 4).
    pub async fn advance_cursors(&self, fired: &[DueRun]) -> Result<()> {
        if fired.is_empty() {
            return Ok(());
        }
        let mut state = self.load_state().await?;
        for run in fired {
            let cursor = state.cursor_for(&run.event_id);
            if run.minute_epoch > cursor {
                state.advance_cursor(&run.event_id, run.minute_epoch);
            }
        }
        state.last_tick_epoch = MinuteKey::from_datetime(&self.clock.now_utc()).as_epoch_minute();
        self.save_state(&state).await
    }
}
