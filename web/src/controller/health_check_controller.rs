use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use realtime::hub::HubStatsSnapshot;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthStatus {
    status: &'static str,
    online_count: usize,
    stats: HubStatsSnapshot,
}

/// GET the liveness of the server along with realtime hub counters
pub async fn health_check(State(app_state): State<AppState>) -> impl IntoResponse {
    let status = HealthStatus {
        status: "healthy",
        online_count: app_state.hub.online_count().await,
        stats: app_state.hub.stats(),
    };
    (StatusCode::OK, Json(status))
}
