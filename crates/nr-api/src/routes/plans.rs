use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use nr_db::models::NewPlan;
use uuid::Uuid;

use crate::dto::{CreatePlanRequest, PlanResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), ApiError> {
    if req.memory_mb <= 0 || req.storage_gb <= 0 || req.cpu_millicores <= 0 {
        return Err(ApiError::BadRequest("plan sizes must be positive".into()));
    }
    let plan = state
        .svc
        .store
        .insert_plan(&NewPlan {
            name: req.name,
            memory_mb: req.memory_mb,
            storage_gb: req.storage_gb,
            cpu_millicores: req.cpu_millicores,
            price_cents: req.price_cents,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(PlanResponse::from(plan))))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PlanResponse>, ApiError> {
    let plan = state.svc.store.get_plan(id).await?;
    Ok(Json(PlanResponse::from(plan)))
}
