//! HTTP introspection server for a running [`host1x_core::Device`].
//!
//! Read-only: it only renders the debug dump, never submits jobs or
//! mutates state.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use host1x_core::Device;

/// Shared server state: just the device, already wrapped in `Arc` by
/// [`host1x_core::Device::new`].
struct AppState {
    device: Arc<Device>,
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dump = state.device.dump();
    Json(serde_json::json!({
        "name": "host1x-server",
        "version": host1x_core::VERSION,
        "channels": dump.channels.len(),
        "syncpoints": dump.syncpoints.len(),
        "mlocks": dump.mlocks.len(),
        "endpoints": {
            "/dump": "Full device snapshot as JSON",
            "/dump.txt": "Full device snapshot as plain text (debugfs-style)",
            "/channels": "Per-channel snapshots only",
            "/syncpoints": "Sync-point registry snapshot only",
            "/mlocks": "MLOCK registry snapshot only",
            "/health": "Liveness check",
        },
    }))
}

async fn handle_dump(State(state): State<Arc<AppState>>) -> Json<host1x_core::DumpSnapshot> {
    Json(state.device.dump())
}

async fn handle_dump_text(State(state): State<Arc<AppState>>) -> Response {
    let text = state.device.dump().to_text();
    ([(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
}

async fn handle_channels(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dump = state.device.dump();
    Json(serde_json::json!({ "channels": dump.channels }))
}

async fn handle_syncpoints(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dump = state.device.dump();
    Json(serde_json::json!({ "syncpoints": dump.syncpoints }))
}

async fn handle_mlocks(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dump = state.device.dump();
    Json(serde_json::json!({ "mlocks": dump.mlocks }))
}

async fn handle_health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Build the axum router over `device`.
pub fn build_router(device: Arc<Device>) -> Router {
    let state = Arc::new(AppState { device });

    Router::new()
        .route("/", get(handle_index))
        .route("/dump", get(handle_dump))
        .route("/dump.txt", get(handle_dump_text))
        .route("/channels", get(handle_channels))
        .route("/syncpoints", get(handle_syncpoints))
        .route("/mlocks", get(handle_mlocks))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Run the introspection server until the process is killed.
pub async fn run_server(device: Arc<Device>, host: &str, port: u16) {
    let app = build_router(device);
    let addr = format!("{host}:{port}");
    log::info!("host1x-server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use host1x_core::backend::SimChannelBackend;
    use host1x_core::config::Host1xConfig;
    use host1x_core::device::ChannelSpec;
    use host1x_core::submit::Pipe;
    use tower::util::ServiceExt;

    fn test_device() -> Arc<Device> {
        let backend: Arc<dyn host1x_core::backend::ChannelBackend> = Arc::new(SimChannelBackend::new(1));
        Device::new(
            Host1xConfig::default(),
            "test",
            backend,
            &[ChannelSpec { accepted_pipes: Pipe::GR3D, ring_capacity_words: 64 }],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = build_router(test_device());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dump_text_endpoint_renders_every_channel() {
        let app = build_router(test_device());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/dump.txt")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("channel 0"));
    }
}
