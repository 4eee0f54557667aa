use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use nr_engine::Job;

use crate::auth::Actor;
use crate::dto::{JobAccepted, SyncMetricsRequest};
use crate::error::ApiError;
use crate::state::AppState;

use super::accepted;

/// Queue a metrics sweep for one server, or all active servers when no body is sent.
pub async fn sync_metrics(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    body: Option<Json<SyncMetricsRequest>>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    if let Some(server_id) = req.server_id {
        state.svc.store.get_server(server_id).await?;
    }
    tracing::info!(server_id = ?req.server_id, actor_id = ?actor.0, "metrics sync requested");
    Ok(accepted(
        &state,
        Job::SyncMetrics {
            server_id: req.server_id,
        },
    ))
}
