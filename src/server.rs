//! HTTP control surface for the scan controller

use crate::config::ScanOverrides;
use crate::error::ScanError;
use crate::scan::ScanController;
use crate::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    controller: ScanController,
}

/// Routes: `POST /start`, `POST /stop`, `GET /logs`, `GET /status`, `GET /results`
pub fn router(controller: ScanController) -> Router {
    Router::new()
        .route("/start", post(start_scan))
        .route("/stop", post(stop_scan))
        .route("/logs", get(get_logs))
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { controller })
}

/// Serve until Ctrl-C, optionally starting a scan right away
pub async fn serve(bind: &str, controller: ScanController, autostart: bool) -> Result<()> {
    if autostart {
        if let Err(e) = controller.start(ScanOverrides::default()) {
            warn!(error = %e, "autostart skipped");
        }
    }

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "control surface listening");

    let app = router(controller.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(controller))
        .await?;
    Ok(())
}

async fn shutdown_signal(controller: ScanController) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
    let _ = controller.stop();
}

async fn start_scan(State(app): State<AppState>, body: Bytes) -> Response {
    let overrides = if body.iter().all(u8::is_ascii_whitespace) {
        ScanOverrides::default()
    } else {
        match serde_json::from_slice::<ScanOverrides>(&body) {
            Ok(overrides) => overrides,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("Invalid scan request: {e}")).into_response()
            }
        }
    };

    match app.controller.start(overrides) {
        Ok(_) => (StatusCode::ACCEPTED, "Started").into_response(),
        Err(ScanError::AlreadyRunning) => (StatusCode::CONFLICT, "Scan already running").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn stop_scan(State(app): State<AppState>) -> Response {
    match app.controller.stop() {
        Ok(()) => (StatusCode::ACCEPTED, "Stopping").into_response(),
        Err(_) => (StatusCode::CONFLICT, "No scan running").into_response(),
    }
}

async fn get_logs(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "logs": app.controller.logs() }))
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.controller.status())
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "results": app.controller.results().await }))
}
