use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, instrument};

use warden_core::context::AGENT_TYPE_KEY;
use warden_core::{ConnectionId, ExecutionContext};

use crate::state::{prune_finished_runs, AppState, RunRecord};

/// Build the daemon's axum router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(submit_run_handler))
        .route("/runs/{id}", get(get_run_handler))
        .route("/runs/{id}:cancel", post(cancel_run_handler))
        .route("/users/{user_id}/events", get(user_events_handler))
        .route("/agents", get(list_agents_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SubmitRunRequest {
    pub user_id: String,
    pub thread_id: String,
    pub agent: String,
    /// Caller-supplied run id; generated when absent.
    pub run_id: Option<String>,
    /// Originating event-stream connection, recorded on the context when
    /// supplied. Must belong to `user_id`.
    pub connection_id: Option<ConnectionId>,
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct SubmitRunResponse {
    run_id: String,
    request_id: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// POST /runs — create a context and engine for one run and start it.
#[instrument(skip(state, body))]
async fn submit_run_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitRunRequest>,
) -> Response {
    let run_id = body
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let request_id = uuid::Uuid::new_v4().to_string();

    let mut agent_context = HashMap::from([(
        AGENT_TYPE_KEY.to_string(),
        serde_json::json!(body.agent),
    )]);
    if let Some(input) = body.input {
        agent_context.insert("input".to_string(), input);
    }
    let audit_metadata = HashMap::from([("source".to_string(), "http".to_string())]);

    // Structural validation happens here; a malformed identity never
    // reaches an engine.
    let context = match ExecutionContext::root(
        body.user_id,
        body.thread_id,
        run_id.clone(),
        request_id.clone(),
        agent_context,
        audit_metadata,
    ) {
        Ok(context) => context,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_context", &err.to_string());
        }
    };

    let context = match body.connection_id {
        Some(connection_id) => match state.connections.record(connection_id).await {
            Some(record) if record.user_id == context.user_id() => {
                context.with_connection(connection_id)
            }
            Some(_) => {
                return error_response(
                    StatusCode::FORBIDDEN,
                    "connection_user_mismatch",
                    "connection_id belongs to a different user",
                );
            }
            None => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    "connection_not_found",
                    "connection_id is not a live connection",
                );
            }
        },
        None => context,
    };

    if state.registry.get(&body.agent).is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            "agent_not_found",
            &format!("agent type '{}' is not registered", body.agent),
        );
    }

    {
        let mut runs = state.runs.write().await;
        if runs.contains_key(&run_id) {
            return error_response(
                StatusCode::CONFLICT,
                "run_exists",
                &format!("run '{run_id}' was already submitted"),
            );
        }
        runs.insert(
            run_id.clone(),
            RunRecord {
                run_id: run_id.clone(),
                user_id: context.user_id().to_string(),
                thread_id: context.thread_id().to_string(),
                agent_type: body.agent.clone(),
                status: "running".to_string(),
                submitted_at: Utc::now(),
                finished_at: None,
                error: None,
            },
        );
    }

    info!(run_id = %run_id, user_id = %context.user_id(), agent = %body.agent, "run submitted");

    let mut engine = state.factory.create_for_context(context);
    let runs = state.runs.clone();
    let run_index_capacity = state.run_index_capacity;
    let spawned_run_id = run_id.clone();
    // One task owns one engine end-to-end; a panic inside agent logic is
    // contained by the task boundary.
    tokio::spawn(async move {
        let status = engine.run().await;
        let last_error = engine.last_error().map(str::to_string);
        engine.cleanup().await;

        let mut runs = runs.write().await;
        if let Some(record) = runs.get_mut(&spawned_run_id) {
            record.status = status.as_str().to_string();
            record.finished_at = Some(Utc::now());
            record.error = last_error;
        }
        prune_finished_runs(&mut runs, run_index_capacity);
    });

    (
        StatusCode::ACCEPTED,
        Json(SubmitRunResponse {
            run_id,
            request_id,
            status: "running".to_string(),
        }),
    )
        .into_response()
}

/// GET /runs/{id} — run status.
#[instrument(skip(state))]
async fn get_run_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runs.read().await.get(&id) {
        Some(record) => (StatusCode::OK, Json(record.clone())).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "run_not_found", "run not found"),
    }
}

/// POST /runs/{id}:cancel — signal the owning engine to stop.
#[instrument(skip(state))]
async fn cancel_run_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.factory.cancel(&id) {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": id, "status": "cancelling" })),
        )
            .into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "run_not_active",
            "run is not active (unknown or already finished)",
        )
    }
}

/// GET /users/{user_id}/events — SSE stream of this user's lifecycle
/// events, including anything buffered while they were disconnected.
#[instrument(skip(state))]
async fn user_events_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    if user_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_user", "user_id is empty");
    }

    let handle = state.connections.add(&user_id).await;
    let drained = state.router.flush_user(&user_id).await;
    if drained > 0 {
        info!(user_id = %user_id, drained, "reconnect buffer drained to new connection");
    }

    // When the client disconnects the receiver drops; the router prunes
    // the dead connection on its next delivery attempt.
    let stream = ReceiverStream::new(handle.events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|err| {
            error!(error = %err, "failed to serialize lifecycle event");
            String::from("{}")
        });
        Ok::<_, Infallible>(Event::default().event(event.kind.as_str()).data(data))
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, Serialize)]
struct AgentInfo {
    name: String,
    description: String,
    version: String,
    dependencies: Vec<String>,
}

/// GET /agents — read-only view of the frozen registry.
#[instrument(skip(state))]
async fn list_agents_handler(State(state): State<AppState>) -> Response {
    let agents: Vec<AgentInfo> = state
        .registry
        .list_names()
        .into_iter()
        .filter_map(|name| state.registry.get(&name))
        .map(|descriptor| AgentInfo {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            version: descriptor.version.clone(),
            dependencies: descriptor.dependencies.clone(),
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "agents": agents }))).into_response()
}

/// GET /healthz
#[instrument(skip(state))]
async fn health_handler(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "registry_frozen": state.registry.is_frozen(),
        "connections": state.connections.connection_count().await,
        "events_dropped": state.router.events_dropped(),
    });
    (StatusCode::OK, Json(body)).into_response()
}
