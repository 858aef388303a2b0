use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use satpwn_core::{ChannelStat, EngineSnapshot, Observation};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc::error::TrySendError, oneshot};
use tracing::info;

use crate::error::ApiError;
use crate::state::{AppState, Command};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/channels", get(channels))
        .route("/api/observations", post(submit_observations))
        .route("/api/mode/cycle", post(cycle_mode))
        .route("/api/home/reset", post(reset_home))
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.snapshot.borrow();
    Json(json!({
        "status": "healthy",
        "service": "satpwn-node",
        "epoch": snapshot.epoch,
        "mode": snapshot.mode_label,
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<EngineSnapshot> {
    Json(state.current())
}

async fn channels(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelStat>> {
    Json(state.snapshot.borrow().channels.clone())
}

/// Queue a batch for the next epoch. Individual events are validated there.
async fn submit_observations(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<Vec<Observation>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if batch.is_empty() {
        return Err(ApiError::BadRequest("empty observation batch".to_string()));
    }
    let accepted = batch.len();
    state.observations.try_send(batch).map_err(|e| match e {
        TrySendError::Full(_) => ApiError::Busy,
        TrySendError::Closed(_) => ApiError::EngineStopped,
    })?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
}

async fn cycle_mode(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let (reply, response) = oneshot::channel();
    state
        .commands
        .send(Command::CycleMode { reply })
        .await
        .map_err(|_| ApiError::EngineStopped)?;
    let mode = response.await.map_err(|_| ApiError::EngineStopped)?;
    info!(mode = %mode, "Mode cycled from dashboard");

    Ok(Json(json!({
        "mode": mode,
        "label": mode.label(),
        "next": mode.next(),
    })))
}

async fn reset_home(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let (reply, response) = oneshot::channel();
    state
        .commands
        .send(Command::ResetHome { reply })
        .await
        .map_err(|_| ApiError::EngineStopped)?;
    let previous = response.await.map_err(|_| ApiError::EngineStopped)?;

    Ok(Json(json!({
        "cleared": previous.is_some(),
        "previous": previous,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{EngineRuntime, Persister};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use satpwn_core::{EngineConfig, EpochScheduler, LoadStatus, MemoryStore};
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        shutdown: watch::Sender<bool>,
        engine: tokio::task::JoinHandle<()>,
        path: std::path::PathBuf,
    }

    fn harness() -> Harness {
        let path = std::env::temp_dir().join(format!("satpwn_api_{}.json", uuid::Uuid::new_v4()));
        let mut config = EngineConfig::new(vec![1, 6, 11]);
        config.memory_path = path.clone();
        config.epoch.period_secs = 3600;
        let scheduler = EpochScheduler::with_seed(
            config,
            MemoryStore::new(&[1, 6, 11]),
            LoadStatus::Fresh,
            5,
            0,
        )
        .unwrap();

        let persister = Persister::spawn(path.clone());
        let (runtime, state) = EngineRuntime::new(scheduler, persister);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = tokio::spawn(runtime.run(shutdown_rx));

        Harness {
            app: router(Arc::new(state)),
            shutdown,
            engine,
            path,
        }
    }

    impl Harness {
        async fn finish(self) {
            self.shutdown.send(true).unwrap();
            self.engine.await.unwrap();
            let _ = std::fs::remove_file(&self.path);
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "satpwn-node");
        assert!(body["timestamp"].as_str().is_some());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_status_and_channels() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/api/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "strict");
        assert_eq!(body["next_mode"], "loose");
        assert_eq!(body["load_status"]["state"], "fresh");

        let (status, body) = call(&h.app, "GET", "/api/channels", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_submit_observations() {
        let h = harness();
        let batch = json!([
            {"kind": "access_point", "bssid": "aa:bb:cc:dd:ee:01", "ssid": "Cafe",
             "channel": 6, "signal_dbm": -50, "timestamp_ms": 1000},
            {"kind": "client", "mac": "11:22:33:44:55:66", "bssid": "aa:bb:cc:dd:ee:01",
             "signal_dbm": -60, "timestamp_ms": 1000}
        ]);
        let (status, body) = call(
            &h.app,
            "POST",
            "/api/observations",
            Body::from(batch.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 2);

        let (status, _) = call(&h.app, "POST", "/api/observations", Body::from("[]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &h.app,
            "POST",
            "/api/observations",
            Body::from(r#"[{"kind": "teleport"}]"#),
        )
        .await;
        assert!(status.is_client_error());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_mode_cycle_and_home_reset() {
        let h = harness();
        let (status, body) = call(&h.app, "POST", "/api/mode/cycle", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "loose");
        assert_eq!(body["next"], "drive-by");

        let (_, snapshot) = call(&h.app, "GET", "/api/status", Body::empty()).await;
        assert_eq!(snapshot["mode"], "loose");

        let (status, body) = call(&h.app, "POST", "/api/home/reset", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], false);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_stopped_engine_reports_unavailable() {
        let h = harness();
        let app = h.app.clone();
        h.finish().await;

        let (status, body) = call(&app, "POST", "/api/mode/cycle", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "ENGINE_STOPPED");
    }
}
