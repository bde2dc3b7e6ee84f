//! Embedded HTTP surface on `0.0.0.0:<deploy_port>`: health, deploy, and
//! the TUI API (groups, messages, send, SSE events).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use pynchy_core::util::generate_message_id;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::app::App;
use crate::deploy;

pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/deploy", post(handle_deploy))
        .route("/api/groups", get(handle_api_groups))
        .route("/api/messages", get(handle_api_messages))
        .route("/api/send", post(handle_api_send))
        .route("/api/events", get(handle_api_events))
        .with_state(app)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn handle_health(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": app.started_at.elapsed().as_secs(),
        "head_sha": deploy::head_sha(&app.config.project_root).await,
        "head_commit": deploy::head_commit_subject(&app.config.project_root).await,
        "channels_connected": app.fanout.connected_count(),
    }))
}

async fn handle_deploy(State(app): State<Arc<App>>) -> impl IntoResponse {
    match deploy::run_deploy(&app.config).await {
        Ok((sha, previous_sha)) => {
            let commit = deploy::head_commit_subject(&app.config.project_root).await;
            if let Some(chat) = app.admin_chat_jid() {
                app.post_host_message(
                    &chat,
                    &format!("Deploying {} — restarting.", &sha[..sha.len().min(8)]),
                )
                .await;
            }
            // Let the response flush, then restart; the supervisor brings
            // the process back on the new code.
            tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                info!("deploy restart");
                std::process::exit(0);
            });
            (
                StatusCode::OK,
                Json(json!({
                    "status": "restarting",
                    "sha": sha,
                    "commit": commit,
                    "previous_sha": previous_sha,
                })),
            )
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e })),
        ),
    }
}

async fn handle_api_groups(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let groups: Vec<serde_json::Value> = app
        .workspaces
        .read()
        .unwrap()
        .values()
        .map(|p| {
            json!({
                "jid": p.jid,
                "name": p.name,
                "folder": p.folder,
                "is_admin": p.is_admin,
            })
        })
        .collect();
    Json(serde_json::Value::Array(groups))
}

#[derive(Deserialize)]
struct MessagesQuery {
    jid: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn handle_api_messages(
    State(app): State<Arc<App>>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    match app.store.get_chat_history(&query.jid, query.limit) {
        Ok(messages) => {
            let body: Vec<serde_json::Value> = messages
                .iter()
                .map(|m| {
                    json!({
                        "sender_name": m.sender_name,
                        "content": m.content,
                        "timestamp": m.timestamp,
                        "is_from_me": m.is_from_me,
                        "message_type": m.message_type,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::Value::Array(body)))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct SendBody {
    jid: String,
    content: String,
    #[serde(default)]
    sender: Option<String>,
}

async fn handle_api_send(
    State(app): State<Arc<App>>,
    Json(body): Json<SendBody>,
) -> impl IntoResponse {
    if body.jid.is_empty() || body.content.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "jid and content required" })),
        );
    }
    let canonical = app
        .store
        .resolve_canonical_jid(&body.jid)
        .unwrap_or_else(|_| body.jid.clone());
    let msg = pynchy_core::types::NewMessage {
        id: generate_message_id("tui"),
        chat_jid: canonical.clone(),
        sender: body.sender.clone().unwrap_or_else(|| "tui".to_string()),
        sender_name: body.sender.unwrap_or_else(|| "tui".to_string()),
        content: body.content,
        timestamp: pynchy_core::util::now_iso(),
        is_from_me: false,
        message_type: pynchy_core::types::MessageType::User,
        metadata: None,
    };
    if let Err(e) = app.store.store_message(&msg) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        );
    }
    app.queue.enqueue_message_check(&canonical);
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn handle_api_events(State(app): State<Arc<App>>) -> impl IntoResponse {
    let rx = app.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| async move {
        let event = event.ok()?;
        Event::default().json_data(&event).ok().map(Ok::<_, std::convert::Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
