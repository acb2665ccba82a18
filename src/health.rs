use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use crate::reconciler;

/* ============================= STATE ============================= */

/// Process-level readiness facts plus per-component status lines.
#[derive(Debug, Default)]
pub struct HealthState {
    pub config_loaded: bool,
    pub metrics_fetched: bool,
    pub bus_running: bool,
    pub components: BTreeMap<String, String>,
}

impl HealthState {
    pub fn is_ready(&self) -> bool {
        self.config_loaded && self.metrics_fetched && self.bus_running
    }
}

pub type SharedHealth = Arc<Mutex<HealthState>>;

pub fn new_shared() -> SharedHealth {
    Arc::new(Mutex::new(HealthState::default()))
}

/// Record one component's status line for `/statusz`.
pub fn set_component(state: &SharedHealth, name: &str, status: impl Into<String>) {
    state
        .lock()
        .expect("health lock poisoned")
        .components
        .insert(name.to_string(), status.into());
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: SharedHealth) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route(
            "/statusz",
            get({
                let state = state.clone();
                move || status_handler(state.clone())
            }),
        )
        .route("/metrics", get(metrics_handler))
}

async fn ready_handler(state: SharedHealth) -> impl IntoResponse {
    let ready = state.lock().expect("health lock poisoned").is_ready();
    if ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn status_handler(state: SharedHealth) -> impl IntoResponse {
    let state = state.lock().expect("health lock poisoned");
    Json(serde_json::json!({
        "ready": state.is_ready(),
        "configLoaded": state.config_loaded,
        "metricsFetched": state.metrics_fetched,
        "busRunning": state.bus_running,
        "components": state.components,
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = reconciler::registry().gather();
    let mut buffer = Vec::new();

    match encoder.encode(&families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= SERVER ============================= */

pub async fn serve(
    state: SharedHealth,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health server on {addr}"))?;

    info!(addr = %addr, "health_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn ready_state() -> SharedHealth {
        let state = new_shared();
        {
            let mut s = state.lock().unwrap();
            s.config_loaded = true;
            s.metrics_fetched = true;
            s.bus_running = true;
        }
        state
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let app = build_router(new_shared());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_not_ready_initially() {
        let app = build_router(new_shared());
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_ready_when_all_conditions_hold() {
        let app = build_router(ready_state());
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_requires_all_three() {
        for missing in ["config", "metrics", "bus"] {
            let state = ready_state();
            {
                let mut s = state.lock().unwrap();
                match missing {
                    "config" => s.config_loaded = false,
                    "metrics" => s.metrics_fetched = false,
                    _ => s.bus_running = false,
                }
            }
            let app = build_router(state);
            let resp = app
                .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(
                resp.status(),
                StatusCode::SERVICE_UNAVAILABLE,
                "{missing} missing should not be ready"
            );
        }
    }

    #[tokio::test]
    async fn test_statusz_reports_components() {
        let state = ready_state();
        set_component(&state, "reconciler", "running");
        set_component(&state, "predictive-monitor", "running");

        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/statusz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["components"]["reconciler"], "running");
        assert_eq!(json["components"]["predictive-monitor"], "running");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_registry() {
        crate::reconciler::force_metrics();
        let app = build_router(new_shared());
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("rightsize_pods_processed_total"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_router(new_shared());
        let resp = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
