// SPDX-License-Identifier: MIT

//! The `/api/app/*` and `/api/worker/*` HTTP handlers (spec.md §4.7/§6).
//! Grounded on the retrieval pack's axum route-module style (one `Router`
//! builder per concern, `State<AppState>` + `Path`/`Json` extractors,
//! handlers returning a uniform envelope) — the teacher itself has no HTTP
//! surface, so this layer follows the pack's own axum idiom instead.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use cronicle_core::{Category, Clock, Event, Job, JobStatus, ServerGroup, SystemClock};
use cronicle_storage::Storage;
use cronicle_wire::auth::SignedRequest;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::cluster::Coordinator;
use crate::config::{merge_json, ConfigHandle};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::notify::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub config: ConfigHandle,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<Dispatcher<SystemClock>>,
    pub notifier: Arc<dyn Notifier>,
}

/// Wraps a handler's `Result<Value>` in the `{code: 0, ...}` /
/// `{code: <kind>, description}` envelope (spec.md §6).
fn envelope(result: Result<Value>) -> Json<Value> {
    match result {
        std::result::Result::Ok(mut payload) => {
            if let Value::Object(ref mut map) = payload {
                map.insert("code".into(), json!(0));
                Json(payload)
            } else {
                Json(json!({"code": 0, "data": payload}))
            }
        }
        Err(e) => {
            let api_err = cronicle_wire::ApiError::from(&e);
            Json(json!({"code": api_err.code, "description": api_err.description}))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_session_cookie(cookie_header: &str) -> Option<String> {
    cookie_header
        .split(';')
        .map(str::trim)
        .find_map(|kv| kv.strip_prefix("session=").map(str::to_string))
}

/// Session cookie or HMAC API key (spec.md §4.7). Either is sufficient.
async fn authenticate(storage: &Storage, secret_key: &str, headers: &HeaderMap) -> Result<()> {
    if let Some(cookie) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        if let Some(sid) = parse_session_cookie(cookie) {
            if storage.get(&format!("sessions/{sid}")).await.is_ok() {
                return std::result::Result::Ok(());
            }
        }
    }
    if let (Some(key), Some(salt), Some(sig)) = (
        header_str(headers, "x-cronicle-api-key"),
        header_str(headers, "x-cronicle-salt"),
        header_str(headers, "x-cronicle-signature"),
    ) {
        let req = SignedRequest { api_key: key.to_string(), salt: salt.to_string(), signature: sig.to_string() };
        let now = SystemClock.epoch_ms() as i64;
        cronicle_wire::auth::verify(secret_key, &req, now).map_err(|_| Error::Session)?;
        return std::result::Result::Ok(());
    }
    Err(Error::Session)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/app/get_config", get(get_config))
        .route("/api/app/get_schedule", get(get_schedule))
        .route("/api/app/create_event", post(create_event))
        .route("/api/app/update_event", post(update_event))
        .route("/api/app/delete_event", post(delete_event))
        .route("/api/app/run_event", post(run_event))
        .route("/api/app/abort_job", post(abort_job))
        .route("/api/app/get_job_details", get(get_job_details))
        .route("/api/app/get_live_job_log", get(get_live_job_log))
        .route("/api/app/get_categories", get(get_categories))
        .route("/api/app/create_category", post(create_category))
        .route("/api/app/update_category", post(update_category))
        .route("/api/app/delete_category", post(delete_category))
        .route("/api/app/get_api_keys", get(get_api_keys))
        .route("/api/app/create_api_key", post(create_api_key))
        .route("/api/app/update_api_key", post(update_api_key))
        .route("/api/app/delete_api_key", post(delete_api_key))
        .route("/api/app/get_event_token", get(get_event_token))
        .route("/api/app/get_server_groups", get(get_server_groups))
        .route("/api/app/create_server_group", post(create_server_group))
        .route("/api/app/update_server_group", post(update_server_group))
        .route("/api/app/delete_server_group", post(delete_server_group))
        .route("/api/app/get_secret", get(get_secret))
        .route("/api/app/create_secret", post(create_secret))
        .route("/api/app/update_secret", post(update_secret))
        .route("/api/app/delete_secret", post(delete_secret))
        .route("/api/worker/heartbeat", post(worker_heartbeat))
        .route("/api/worker/job_update", post(worker_job_update))
        .route("/api/worker/launch", post(worker_launch))
        .with_state(state)
}

fn require_id(body: &Value) -> Result<String> {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Validation("missing required field: id".into()))
}

// ---- config / schedule ----

#[allow(clippy::expect_used)]
async fn get_config(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let mut cfg = serde_json::to_value(state.config.get().as_ref()).expect("Config serializes");
        if let Value::Object(ref mut map) = cfg {
            map.insert("secret_key".into(), json!("*****"));
        }
        std::result::Result::Ok(cfg)
    })
    .await)
}

async fn get_schedule(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let events = state.storage.list_get("global/schedule", 0, u64::MAX).await?;
        std::result::Result::Ok(json!({"rows": events}))
    })
    .await)
}

#[allow(clippy::expect_used)]
async fn create_event(State(state): State<AppState>, headers: HeaderMap, Json(mut body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = cronicle_core::new_id("e");
        let now = SystemClock.epoch_ms();
        if let Value::Object(ref mut map) = body {
            map.insert("id".into(), json!(id.clone()));
            map.entry("created").or_insert(json!(now));
            map.entry("modified").or_insert(json!(now));
        }
        let event: Event = serde_json::from_value(body)
            .map_err(|e| Error::Validation(format!("invalid event: {e}")))?;
        state.storage.list_push("global/schedule", vec![serde_json::to_value(&event).expect("serializes")]).await?;
        std::result::Result::Ok(json!({"id": id}))
    })
    .await)
}

async fn update_event(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let Some((_idx, existing)) = state.storage.list_find("global/schedule", "id", json!(id)).await? else {
            return Err(Error::NoSuchKey(format!("no such event: {id}")));
        };
        let mut merged = merge_json(existing, body);
        if let Value::Object(ref mut map) = merged {
            map.insert("modified".into(), json!(SystemClock.epoch_ms()));
        }
        let _: Event = serde_json::from_value(merged.clone())
            .map_err(|e| Error::Validation(format!("invalid event after merge: {e}")))?;
        let updates: Vec<(String, Value)> = match merged {
            Value::Object(map) => map.into_iter().collect(),
            _ => vec![],
        };
        state.storage.list_find_update("global/schedule", "id", json!(id), updates).await?;
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn delete_event(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let removed = state.storage.list_remove("global/schedule", "id", json!(id.clone())).await?;
        if !removed {
            return Err(Error::NoSuchKey(format!("no such event: {id}")));
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn run_event(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let Some((_idx, raw)) = state.storage.list_find("global/schedule", "id", json!(id.clone())).await? else {
            return Err(Error::NoSuchKey(format!("no such event: {id}")));
        };
        let event: Event = serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
        let hostname = state
            .dispatcher
            .resolve_single_target(&event.id, &event.target, event.dispatch_policy, 0)
            .await
            .ok_or_else(|| Error::Validation("no live worker for target".into()))?;
        let max_children = event.max_children.max(1);
        let outcome = state
            .dispatcher
            .dispatch(&event.id, &hostname, max_children, event.queue_max, body.get("params").cloned().unwrap_or(event.params.clone()))
            .await?;
        std::result::Result::Ok(json!({"outcome": format!("{outcome:?}")}))
    })
    .await)
}

async fn abort_job(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let job = state.dispatcher.complete(&id, JobStatus::Failed, "aborted by user".into()).await?;
        if job.is_none() {
            return Err(Error::NoSuchKey(format!("no such active job: {id}")));
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn get_job_details(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        if let Some(raw) = state.storage.hash_get("active_jobs", &id).await? {
            return std::result::Result::Ok(json!({"job": raw}));
        }
        let (_idx, raw) = state
            .storage
            .list_find("logs/completed", "id", json!(id.clone()))
            .await?
            .ok_or_else(|| Error::NoSuchKey(format!("no such job: {id}")))?;
        std::result::Result::Ok(json!({"job": raw}))
    })
    .await)
}

/// Live job progress/description from the in-memory active-job table.
/// Streaming the binary `log.txt.gz` itself (spec.md §4.8's `getStreamRange`)
/// is left to the HTTP layer's range-request handling over the job's
/// `log_path`, not duplicated here.
async fn get_live_job_log(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let jobs = state.dispatcher.active_job_snapshot();
        let job: &Job = jobs.get(&id).ok_or_else(|| Error::NoSuchKey(format!("no such active job: {id}")))?;
        std::result::Result::Ok(json!({"progress": job.progress, "description": job.description, "log_path": job.log_path}))
    })
    .await)
}

// ---- categories ----

async fn get_categories(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let rows = state.storage.hash_get_all("global/categories").await?;
        std::result::Result::Ok(json!({"rows": rows.into_iter().map(|(_, v)| v).collect::<Vec<_>>()}))
    })
    .await)
}

#[allow(clippy::expect_used)]
async fn create_category(State(state): State<AppState>, headers: HeaderMap, Json(mut body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = cronicle_core::new_id("c");
        if let Value::Object(ref mut map) = body {
            map.insert("id".into(), json!(id.clone()));
        }
        let category: Category = serde_json::from_value(body).map_err(|e| Error::Validation(e.to_string()))?;
        state.storage.hash_put("global/categories", &id, serde_json::to_value(&category).expect("serializes")).await?;
        std::result::Result::Ok(json!({"id": id}))
    })
    .await)
}

#[allow(clippy::expect_used)]
async fn update_category(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let existing = state
            .storage
            .hash_get("global/categories", &id)
            .await?
            .ok_or_else(|| Error::NoSuchKey(format!("no such category: {id}")))?;
        let merged = merge_json(existing, body);
        let category: Category = serde_json::from_value(merged).map_err(|e| Error::Validation(e.to_string()))?;
        state.storage.hash_put("global/categories", &id, serde_json::to_value(&category).expect("serializes")).await?;
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn delete_category(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let events = state.storage.list_get("global/schedule", 0, u64::MAX).await?;
        let referenced = events.iter().any(|e| e.get("category_id").and_then(Value::as_str) == Some(id.as_str()));
        if referenced {
            return Err(Error::Conflict(format!("category {id} is still referenced by events")));
        }
        let removed = state.storage.hash_delete("global/categories", &id).await?;
        if !removed {
            return Err(Error::NoSuchKey(format!("no such category: {id}")));
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

// ---- api keys ----

async fn get_api_keys(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let rows = state.storage.hash_get_all("global/api_keys").await?;
        std::result::Result::Ok(json!({"rows": rows.into_iter().map(|(_, v)| v).collect::<Vec<_>>()}))
    })
    .await)
}

async fn create_api_key(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = cronicle_core::new_id("k");
        let mut record = body;
        if let Value::Object(ref mut map) = record {
            map.insert("id".into(), json!(id.clone()));
        }
        state.storage.hash_put("global/api_keys", &id, record).await?;
        std::result::Result::Ok(json!({"id": id}))
    })
    .await)
}

async fn update_api_key(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let existing = state
            .storage
            .hash_get("global/api_keys", &id)
            .await?
            .ok_or_else(|| Error::NoSuchKey(format!("no such api key: {id}")))?;
        let merged = merge_json(existing, body);
        state.storage.hash_put("global/api_keys", &id, merged).await?;
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn delete_api_key(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let removed = state.storage.hash_delete("global/api_keys", &id).await?;
        if !removed {
            return Err(Error::NoSuchKey(format!("no such api key: {id}")));
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn get_event_token(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let now = SystemClock.epoch_ms() as i64;
        let signed = cronicle_wire::auth::sign(&state.config.get().secret_key, &id, "event-token", now)
            .map_err(|e| Error::Fatal(e.to_string()))?;
        std::result::Result::Ok(json!({"api_key": signed.api_key, "salt": signed.salt, "signature": signed.signature}))
    })
    .await)
}

// ---- server groups ----

async fn get_server_groups(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let rows = state.storage.list_get("global/server_groups", 0, u64::MAX).await?;
        std::result::Result::Ok(json!({"rows": rows}))
    })
    .await)
}

#[allow(clippy::expect_used)]
async fn create_server_group(State(state): State<AppState>, headers: HeaderMap, Json(mut body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = cronicle_core::new_id("g");
        if let Value::Object(ref mut map) = body {
            map.insert("id".into(), json!(id.clone()));
        }
        let group: ServerGroup = serde_json::from_value(body).map_err(|e| Error::Validation(e.to_string()))?;
        state.storage.list_push("global/server_groups", vec![serde_json::to_value(&group).expect("serializes")]).await?;
        std::result::Result::Ok(json!({"id": id}))
    })
    .await)
}

async fn update_server_group(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let Some((_idx, existing)) = state.storage.list_find("global/server_groups", "id", json!(id.clone())).await? else {
            return Err(Error::NoSuchKey(format!("no such server group: {id}")));
        };
        let merged = merge_json(existing, body);
        let _: ServerGroup = serde_json::from_value(merged.clone()).map_err(|e| Error::Validation(e.to_string()))?;
        let updates: Vec<(String, Value)> = match merged {
            Value::Object(map) => map.into_iter().collect(),
            _ => vec![],
        };
        state.storage.list_find_update("global/server_groups", "id", json!(id), updates).await?;
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn delete_server_group(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let removed = state.storage.list_remove("global/server_groups", "id", json!(id.clone())).await?;
        if !removed {
            return Err(Error::NoSuchKey(format!("no such server group: {id}")));
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

// ---- secrets ----

async fn get_secret(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let value = state
            .storage
            .hash_get("global/secrets", &id)
            .await?
            .ok_or_else(|| Error::NoSuchKey(format!("no such secret: {id}")))?;
        std::result::Result::Ok(json!({"secret": value}))
    })
    .await)
}

async fn create_secret(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        state.storage.hash_put("global/secrets", &id, body).await?;
        std::result::Result::Ok(json!({"id": id}))
    })
    .await)
}

async fn update_secret(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let existing = state
            .storage
            .hash_get("global/secrets", &id)
            .await?
            .ok_or_else(|| Error::NoSuchKey(format!("no such secret: {id}")))?;
        let merged = merge_json(existing, body);
        state.storage.hash_put("global/secrets", &id, merged).await?;
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn delete_secret(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        authenticate(&state.storage, &state.config.get().secret_key, &headers).await?;
        let id = require_id(&body)?;
        let removed = state.storage.hash_delete("global/secrets", &id).await?;
        if !removed {
            return Err(Error::NoSuchKey(format!("no such secret: {id}")));
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

// ---- worker subtree ----

async fn worker_heartbeat(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        let req = worker_signed_request(&headers)?;
        cronicle_wire::auth::verify(&state.config.get().secret_key, &req, SystemClock.epoch_ms() as i64)
            .map_err(|_| Error::Session)?;
        let hostname = body.get("hostname").and_then(Value::as_str).ok_or_else(|| Error::Validation("missing hostname".into()))?;
        state.coordinator.register_worker(&SystemClock, hostname).await?;
        std::result::Result::Ok(json!({}))
    })
    .await)
}

async fn worker_job_update(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        let req = worker_signed_request(&headers)?;
        cronicle_wire::auth::verify(&state.config.get().secret_key, &req, SystemClock.epoch_ms() as i64)
            .map_err(|_| Error::Session)?;
        let job_id = body.get("jobId").and_then(Value::as_str).ok_or_else(|| Error::Validation("missing jobId".into()))?;
        let kind = body.get("kind").and_then(Value::as_str).unwrap_or("update");
        match kind {
            "progress" => {
                let progress = body.get("progress").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                state.dispatcher.record_progress(job_id, progress);
            }
            "complete" => {
                let code = body.get("code").and_then(Value::as_i64).unwrap_or(1);
                let description = body.get("description").and_then(Value::as_str).unwrap_or("").to_string();
                let status = if code == 0 { JobStatus::Success } else { JobStatus::Failed };
                let event_id = state
                    .dispatcher
                    .active_job_snapshot()
                    .get(job_id)
                    .map(|j| j.event_id.clone())
                    .ok_or_else(|| Error::NoSuchKey(format!("no such active job: {job_id}")))?;
                let (_idx, raw) = state
                    .storage
                    .list_find("global/schedule", "id", json!(event_id.clone()))
                    .await?
                    .ok_or_else(|| Error::NoSuchKey(format!("no such event: {event_id}")))?;
                let event: Event = serde_json::from_value(raw).map_err(|e| Error::Validation(e.to_string()))?;
                state.dispatcher.finish(job_id, status, description, &event, &state.notifier).await?;
            }
            _ => state.dispatcher.record_heartbeat(job_id),
        }
        std::result::Result::Ok(json!({}))
    })
    .await)
}

/// Accepts a job this node is asked to run on behalf of a remote manager
/// (spec.md §4.6 step 3). Runs the plugin subprocess in a detached task and
/// acks immediately — completion is reported back asynchronously to the
/// manager's `/api/worker/job_update`, the same way a local job would be.
async fn worker_launch(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    envelope((async {
        let req = worker_signed_request(&headers)?;
        let secret_key = state.config.get().secret_key.clone();
        cronicle_wire::auth::verify(&secret_key, &req, SystemClock.epoch_ms() as i64).map_err(|_| Error::Session)?;
        let job: Job = serde_json::from_value(
            body.get("job").cloned().ok_or_else(|| Error::Validation("missing job".into()))?,
        )
        .map_err(|e| Error::Validation(format!("invalid job: {e}")))?;
        let manager_base_url = body
            .get("managerBaseUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("missing managerBaseUrl".into()))?
            .to_string();
        let storage = state.storage.clone();
        let own_hostname = state.coordinator.hostname().to_string();
        let job_env = state.config.get().job_env.clone();
        tokio::spawn(crate::worker::run_remote_job(storage, secret_key, own_hostname, job_env, job, manager_base_url));
        std::result::Result::Ok(json!({}))
    })
    .await)
}

fn worker_signed_request(headers: &HeaderMap) -> Result<SignedRequest> {
    let key = header_str(headers, "x-cronicle-api-key").ok_or(Error::Session)?;
    let salt = header_str(headers, "x-cronicle-salt").ok_or(Error::Session)?;
    let sig = header_str(headers, "x-cronicle-signature").ok_or(Error::Session)?;
    std::result::Result::Ok(SignedRequest { api_key: key.to_string(), salt: salt.to_string(), signature: sig.to_string() })
}

/// Small helper so handler bodies read as one `async {}` block instead of
/// an explicit state machine of `?`-chained awaits at the top level.
async fn run<F: std::future::Future<Output = Result<Value>>>(fut: F) -> Result<Value> {
    fut.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Launcher;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cronicle_core::FakeClock;
    use tower::ServiceExt;

    struct AlwaysAck;
    #[async_trait]
    impl Launcher for AlwaysAck {
        async fn launch(&self, _hostname: &str, _job: &Job) -> Result<()> {
            std::result::Result::Ok(())
        }
    }

    fn test_state(dir: &std::path::Path) -> AppState {
        let engine = Arc::new(cronicle_storage::engine::LocalFsEngine::new(dir.join("data")));
        let storage = Arc::new(Storage::new(engine, dir.join("_transactions"), 4));
        let coordinator = Arc::new(Coordinator::new(storage.clone(), "mgr"));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), coordinator.clone(), Arc::new(AlwaysAck), SystemClock, 0));
        let mut cfg = crate::config::Config::default();
        cfg.secret_key = "test-secret-key".into();
        let notifier: Arc<dyn Notifier> = Arc::new(crate::notify::LoggingNotifier);
        AppState { storage, config: ConfigHandle::new(cfg), coordinator, dispatcher, notifier }
    }

    fn auth_headers(secret_key: &str) -> (String, String, String) {
        let now = SystemClock.epoch_ms() as i64;
        let signed = cronicle_wire::auth::sign(secret_key, "testkey", "n1", now).unwrap();
        (signed.api_key, signed.salt, signed.signature)
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_session_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/api/app/get_config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], json!("session"));
    }

    #[tokio::test]
    async fn create_then_list_event_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (key, salt, sig) = auth_headers("test-secret-key");
        let app = router(state);

        let event_body = json!({
            "title": "nightly backup",
            "enabled": true,
            "category_id": "general",
            "target": {"kind": "hostname", "value": "h1"},
            "timing": {},
            "plugin_id": "shell",
            "max_children": 1,
            "queue_max": 0,
        });
        let req = Request::builder()
            .method("POST")
            .uri("/api/app/create_event")
            .header("content-type", "application/json")
            .header("x-cronicle-api-key", key)
            .header("x-cronicle-salt", salt)
            .header("x-cronicle-signature", sig)
            .body(Body::from(event_body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], json!(0));
        assert!(v["id"].is_string());
    }
}
