//! HTTP control API. Handlers are thin: they call into the [`Warden`] and
//! map errors through [`WardenError`]'s `IntoResponse`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use ward_types::control::{HistoryResponse, RestartResponse, SessionsResponse, StatusReport};

use crate::error::WardenResult;
use crate::sessions::DEFAULT_HISTORY_LIMIT;
use crate::Warden;

type AppState = Arc<Warden>;

pub fn router(warden: Arc<Warden>) -> Router {
    let gateway = Router::new()
        .route("/status", get(handle_status))
        .route("/restart", post(handle_restart))
        .route("/sessions", get(handle_sessions))
        .route("/sessions/:key/history", get(handle_history));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api/gateway", gateway)
        .with_state(warden)
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/gateway/status
async fn handle_status(State(warden): State<AppState>) -> Json<StatusReport> {
    Json(warden.supervisor().status().await)
}

#[derive(Deserialize)]
struct RestartQuery {
    token: Option<String>,
}

/// POST /api/gateway/restart?token=
async fn handle_restart(
    State(warden): State<AppState>,
    Query(query): Query<RestartQuery>,
) -> WardenResult<Json<RestartResponse>> {
    let config = warden.config().await;
    let previous = warden
        .supervisor()
        .schedule_restart(config, query.token.as_deref())
        .await?;
    info!("Gateway restart scheduled (previous pid: {previous:?})");

    Ok(Json(RestartResponse {
        success: true,
        message: "Gateway restart initiated".to_string(),
        previous_process_id: previous,
    }))
}

#[derive(Deserialize)]
struct SessionsQuery {
    active: Option<u32>,
}

/// GET /api/gateway/sessions?active=
async fn handle_sessions(
    State(warden): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> WardenResult<Json<SessionsResponse>> {
    let listing = warden.sessions().list_sessions(query.active).await?;
    Ok(Json(SessionsResponse {
        count: listing.sessions.len(),
        sessions: listing.sessions,
        raw: listing.raw,
    }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /api/gateway/sessions/:key/history?limit=
async fn handle_history(
    State(warden): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> WardenResult<Json<HistoryResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let messages = warden.sessions().get_history(&key, limit).await?;
    Ok(Json(HistoryResponse { messages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use ward_types::settings::WardenSettings;

    use crate::sessions::tests::FixedSource;
    use crate::sessions::SessionSource;
    use crate::supervisor::tests::{config_with_token, free_port, test_options, FakeHost};
    use crate::supervisor::Supervisor;

    fn warden(host: Arc<FakeHost>, listing: &str) -> Arc<Warden> {
        let settings = WardenSettings::default();
        let supervisor = Arc::new(Supervisor::new(
            host,
            settings.gateway.clone(),
            test_options(free_port()),
        ));
        let source: Arc<dyn SessionSource> = Arc::new(FixedSource(listing.to_string()));
        Arc::new(Warden::with_parts(settings, supervisor, source, None))
    }

    async fn call(warden: &Arc<Warden>, method: &str, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = router(warden.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let w = warden(Arc::new(FakeHost::default()), "[]");
        let (status, body) = call(&w, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn status_when_nothing_runs() {
        let w = warden(Arc::new(FakeHost::default()), "[]");
        let (status, body) = call(&w, "GET", "/api/gateway/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "not_running");
        assert_eq!(body["ok"], false);
        assert!(body.get("processId").is_none());
    }

    #[tokio::test]
    async fn restart_with_wrong_token_is_401() {
        let host = Arc::new(FakeHost::default());
        let w = warden(host.clone(), "[]");
        w.set_config(config_with_token(Some("right"))).await;

        let (status, body) = call(&w, "POST", "/api/gateway/restart?token=wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");

        let (status, _) = call(&w, "POST", "/api/gateway/restart").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(host.spawn_count(), 0);
    }

    #[tokio::test]
    async fn restart_with_token_is_scheduled() {
        let host = Arc::new(FakeHost::default());
        let w = warden(host.clone(), "[]");
        let cfg = config_with_token(Some("tok"));
        w.set_config(cfg.clone()).await;
        let running = w.supervisor().ensure_running(&cfg).await.unwrap();

        let (status, body) = call(&w, "POST", "/api/gateway/restart?token=tok").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["previousProcessId"], running.pid);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while host.spawn_count() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "restart never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn sessions_non_json_keeps_raw() {
        let w = warden(Arc::new(FakeHost::default()), "gateway not configured\n");
        let (status, body) = call(&w, "GET", "/api/gateway/sessions?active=30").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
        assert_eq!(body["sessions"], serde_json::json!([]));
        assert_eq!(body["raw"], "gateway not configured\n");
    }

    #[tokio::test]
    async fn history_for_unknown_key_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("sessions.json");
        std::fs::write(&index, "{}").unwrap();
        let listing = serde_json::json!({ "path": index, "sessions": [] }).to_string();
        let w = warden(Arc::new(FakeHost::default()), &listing);

        let (status, body) = call(&w, "GET", "/api/gateway/sessions/nope/history").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Session not found");
    }

    #[tokio::test]
    async fn history_honours_limit() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("sessions.json");
        std::fs::write(&index, r#"{"main":{"sessionId":"s1"}}"#).unwrap();
        let mut f = std::fs::File::create(dir.path().join("s1.jsonl")).unwrap();
        for i in 0..5 {
            writeln!(f, r#"{{"role":"user","content":"m{i}"}}"#).unwrap();
        }
        let listing =
            serde_json::json!({ "path": index, "sessions": [{ "key": "main" }] }).to_string();
        let w = warden(Arc::new(FakeHost::default()), &listing);

        let (status, body) = call(&w, "GET", "/api/gateway/sessions/main/history?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "m3");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "m4");
    }
}
