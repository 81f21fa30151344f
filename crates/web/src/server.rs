//! Web server implementation

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use browsercast_common::{ActionRequest, Error, HealthStatus, Resolution, SessionStatus};
use browsercast_core::{CreateSessionOptions, SessionRegistry, TaskPolicy};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// External task-driving component; sessions created with a `task`
    /// are handed to it in a detached task.
    pub policy: Arc<dyn TaskPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub enable_recording: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub control_port: u16,
    pub control_password: String,
    pub display_slot: u32,
    pub status: SessionStatus,
    pub subscribe_url: String,
    pub control_url: String,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route("/api/sessions/:session_id", delete(stop_session_handler))
        .route(
            "/api/sessions/:session_id/actions",
            post(execute_action_handler),
        )
        .route("/api/sessions/:session_id/content", get(content_handler))
        .route("/api/health", get(health_handler))
        .route("/ws/sessions/:session_id", get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until ctrl-c
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await?;
    Ok(())
}

pub(crate) fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict { .. } | Error::NotReady { .. } => StatusCode::CONFLICT,
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    (
        error_status(&err),
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let resolution = match request.resolution.as_deref() {
        Some(s) => match s.parse::<Resolution>() {
            Ok(resolution) => resolution,
            Err(e) => return error_response(e),
        },
        None => Resolution::default(),
    };

    let created = state
        .registry
        .create_session(CreateSessionOptions {
            id: request.id,
            resolution,
            enable_recording: request.enable_recording,
        })
        .await;

    match created {
        Ok(session) => {
            if let Some(task) = request.task {
                let policy = state.policy.clone();
                let session_id = session.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = policy.run(&session_id, &task).await {
                        error!("policy run failed for session {}: {}", session_id, e);
                    }
                });
            }

            (
                StatusCode::CREATED,
                Json(CreateSessionResponse {
                    session_id: session.id.clone(),
                    control_port: session.control_port,
                    control_password: session.control_password.clone(),
                    display_slot: session.display_slot,
                    status: session.status(),
                    subscribe_url: format!("/ws/sessions/{}", session.id),
                    control_url: format!("vnc://127.0.0.1:{}", session.control_port),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn list_sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": state.registry.list_sessions() }))
}

async fn stop_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registry.stop_session(&session_id).await {
        Ok(()) => Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn execute_action_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ActionRequest>,
) -> Response {
    match state.registry.execute_action(&session_id, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

async fn content_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registry.introspect(&session_id).await {
        Ok(content) => Json(content).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.registry.health();
    let status = match report.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}

async fn stream_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = crate::ws::serve_viewer(state, session_id, socket).await {
            debug!("viewer connection ended: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_the_taxonomy() {
        assert_eq!(
            error_status(&Error::NotFound { id: "x".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&Error::Conflict { id: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&Error::NotReady {
                id: "x".into(),
                status: "initializing".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&Error::ResourceExhausted {
                resource: "TCP port".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&Error::ProcessFailure("Xvfb".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn create_request_accepts_minimal_body() {
        let request: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.id.is_none());
        assert!(request.task.is_none());
        assert!(!request.enable_recording);
    }

    #[test]
    fn create_request_wire_format_is_camel_case() {
        let request: CreateSessionRequest = serde_json::from_str(
            r#"{"task":"look something up","resolution":"1280x720","enableRecording":true}"#,
        )
        .unwrap();
        assert_eq!(request.resolution.as_deref(), Some("1280x720"));
        assert!(request.enable_recording);
    }

    #[test]
    fn create_response_wire_format_is_camel_case() {
        let response = CreateSessionResponse {
            session_id: "s1".into(),
            control_port: 5901,
            control_password: "pw".into(),
            display_slot: 100,
            status: SessionStatus::Ready,
            subscribe_url: "/ws/sessions/s1".into(),
            control_url: "vnc://127.0.0.1:5901".into(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["controlPort"], 5901);
        assert_eq!(json["displaySlot"], 100);
        assert_eq!(json["subscribeUrl"], "/ws/sessions/s1");
        assert_eq!(json["status"], "ready");
    }
}
