// =============================================================================
// Status API — Axum 0.7
// =============================================================================
//
// Read-only surface polled by the status page. Nothing here mutates the
// ingestion service.
//
//   GET /                          HTML status page
//   GET /api/v1/health             liveness
//   GET /api/v1/status             local counters and freshness
//   GET /api/v1/store              counts read back from the store
//   GET /api/v1/candles/:interval  candles from the current window
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use crate::app_state::IngestionService;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(service: Arc<IngestionService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/store", get(store_status))
        .route("/api/v1/candles/:interval", get(candles))
        .layer(cors)
        .with_state(service)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(State(service): State<Arc<IngestionService>>) -> impl IntoResponse {
    Json(service.status_snapshot())
}

async fn store_status(State(service): State<Arc<IngestionService>>) -> impl IntoResponse {
    match service.store_status().await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => {
            warn!(error = %e, "store status read failed");
            let body = serde_json::json!({ "error": e.to_string() });
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
    }
}

async fn candles(
    State(service): State<Arc<IngestionService>>,
    Path(interval): Path<i64>,
) -> impl IntoResponse {
    match service.candles(interval) {
        Ok(Some(candles)) => Json(candles).into_response(),
        Ok(None) => {
            let body = serde_json::json!({ "error": format!("interval {interval} is not configured") });
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
        Err(e) => {
            error!(error = %e, "candle aggregation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(STATUS_PAGE)
}

const STATUS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Live Tick Stream</title>
  <style>
    body { font-family: sans-serif; text-align: center; margin-top: 3em; }
    .live { color: #1a7f37; }
    .down { color: #cf222e; }
    table { margin: 1.5em auto; border-collapse: collapse; }
    td { padding: 0.3em 1em; text-align: left; }
  </style>
</head>
<body>
  <h1 id="headline">Connecting&hellip;</h1>
  <table>
    <tr><td>Symbol</td><td id="symbol">-</td></tr>
    <tr><td>Ticks in window</td><td id="ticks">-</td></tr>
    <tr><td>Candles</td><td id="candles">-</td></tr>
    <tr><td>Last update</td><td id="updated">-</td></tr>
  </table>
  <script>
    async function refresh() {
      try {
        const s = await (await fetch('/api/v1/status')).json();
        const h = document.getElementById('headline');
        h.textContent = s.is_connected
          ? 'Live tick data is being streamed to Firebase'
          : 'Feed disconnected, retrying';
        h.className = s.is_connected ? 'live' : 'down';
        document.getElementById('symbol').textContent = s.symbol;
        document.getElementById('ticks').textContent = s.tick_count;
        document.getElementById('candles').textContent = Object.entries(s.candle_counts)
          .map(([iv, n]) => iv + 's: ' + n).join(', ') || '-';
        document.getElementById('updated').textContent = s.last_update_time || 'never';
      } catch (e) {
        document.getElementById('headline').textContent = 'Status unavailable';
      }
    }
    refresh();
    setInterval(refresh, 3000);
  </script>
</body>
</html>
"#;

// =============================================================================
// Tests
// =============================================================================
