use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use nr_db::models::{InstanceStatus, NewInstance};
use nr_engine::capacity::Allocation;
use nr_engine::jobs::rename::is_valid_subdomain;
use nr_engine::{Job, ManageAction};
use uuid::Uuid;

use crate::auth::Actor;
use crate::dto::{
    AddUserRequest, CreateInstanceRequest, InstanceCreated, InstanceResponse, JobAccepted,
    LogsQuery, LogsResponse, MoveInstanceRequest, RenameInstanceRequest,
};
use crate::error::ApiError;
use crate::state::AppState;

use super::accepted;

const DEFAULT_LOG_LINES: u32 = 100;
const MAX_LOG_LINES: u32 = 5000;

pub async fn create_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceCreated>), ApiError> {
    let svc = &state.svc;

    if !is_valid_subdomain(&req.slug) {
        return Err(ApiError::BadRequest(format!("invalid slug: {}", req.slug)));
    }
    let subdomain = req.subdomain.unwrap_or_else(|| req.slug.clone());
    if !is_valid_subdomain(&subdomain) {
        return Err(ApiError::BadRequest(format!("invalid subdomain: {subdomain}")));
    }
    if req.admin_password_hash.trim().is_empty() {
        return Err(ApiError::BadRequest("admin_password_hash is required".into()));
    }
    if svc.store.find_instance_by_subdomain(&subdomain).await?.is_some() {
        return Err(ApiError::Conflict(format!("subdomain {subdomain} is taken")));
    }

    let plan = svc.store.get_plan(req.plan_id).await.map_err(|e| {
        if e.is_not_found() {
            ApiError::BadRequest(format!("unknown plan {}", req.plan_id))
        } else {
            e.into()
        }
    })?;

    let mut new = NewInstance::from_plan(
        &plan,
        req.user_id,
        req.slug,
        subdomain.clone(),
        svc.dns.fqdn(&subdomain),
        req.admin_user,
        req.admin_password_hash,
    );
    if let Some(server_id) = req.server_id {
        let server = svc
            .planner()
            .find_or_create_server(Allocation::from(&plan), Some(server_id))
            .await?;
        new.server_id = Some(server.id);
    }

    let instance = svc.store.insert_instance(&new).await?;
    let execution_id = svc.queue.dispatch(Job::Deploy {
        instance_id: instance.id,
        actor_id: actor.0,
    });
    tracing::info!(
        instance_id = %instance.id,
        plan = %plan.name,
        actor_id = ?actor.0,
        %execution_id,
        "instance created, deploy queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(InstanceCreated {
            instance: InstanceResponse::new(instance, None, None, None),
            execution_id,
        }),
    ))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let store = &state.svc.store;
    let instance = store.get_instance(id).await?;
    let domain = store.get_domain(id).await?;
    let deployment = store.latest_deployment(id).await?;
    let metrics = store.get_metrics(id).await?;
    Ok(Json(InstanceResponse::new(
        instance, domain, deployment, metrics,
    )))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    state.svc.store.get_instance(id).await?;
    Ok(accepted(
        &state,
        Job::Delete {
            instance_id: id,
            actor_id: actor.0,
        },
    ))
}

async fn manage(
    state: &AppState,
    actor: Actor,
    id: Uuid,
    action: ManageAction,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let instance = state.svc.store.get_instance(id).await?;
    if instance.server_id.is_none() {
        return Err(ApiError::Conflict(format!(
            "instance {} is not placed on a server",
            instance.slug
        )));
    }
    Ok(accepted(
        state,
        Job::Manage {
            instance_id: id,
            action,
            actor_id: actor.0,
        },
    ))
}

pub async fn start_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    manage(&state, actor, id, ManageAction::Start).await
}

pub async fn stop_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    manage(&state, actor, id, ManageAction::Stop).await
}

pub async fn restart_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    manage(&state, actor, id, ManageAction::Restart).await
}

pub async fn move_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<MoveInstanceRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let instance = state.svc.store.get_instance(id).await?;
    if instance.server_id == Some(req.target_server_id) {
        return Err(ApiError::Conflict(
            "instance already runs on the target server".into(),
        ));
    }
    Ok(accepted(
        &state,
        Job::Move {
            instance_id: id,
            target_server_id: req.target_server_id,
            actor_id: actor.0,
        },
    ))
}

pub async fn rename_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameInstanceRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    if !is_valid_subdomain(&req.subdomain) {
        return Err(ApiError::BadRequest(format!(
            "invalid subdomain: {}",
            req.subdomain
        )));
    }
    state.svc.store.get_instance(id).await?;
    Ok(accepted(
        &state,
        Job::Rename {
            instance_id: id,
            subdomain: req.subdomain,
            actor_id: actor.0,
        },
    ))
}

pub async fn redeploy_instance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let instance = state.svc.store.get_instance(id).await?;
    if instance.status == InstanceStatus::Deleting {
        return Err(ApiError::Conflict("instance is being deleted".into()));
    }
    state
        .svc
        .store
        .set_instance_status(id, InstanceStatus::Pending)
        .await?;
    Ok(accepted(
        &state,
        Job::Deploy {
            instance_id: id,
            actor_id: actor.0,
        },
    ))
}

pub async fn add_user(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddUserRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    if req.username.trim().is_empty() || req.password_hash.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "username and password_hash are required".into(),
        ));
    }
    let store = &state.svc.store;
    store.get_instance(id).await?;
    store
        .insert_instance_user(id, &req.username, &req.password_hash, &req.permissions)
        .await?;
    Ok(accepted(
        &state,
        Job::SyncUsers {
            instance_id: id,
            actor_id: actor.0,
        },
    ))
}

pub async fn sync_users(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    state.svc.store.get_instance(id).await?;
    Ok(accepted(
        &state,
        Job::SyncUsers {
            instance_id: id,
            actor_id: actor.0,
        },
    ))
}

/// Reads container output synchronously; an unreachable server yields empty logs.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let svc = &state.svc;
    let instance = svc.store.get_instance(id).await?;
    let server_id = instance
        .server_id
        .ok_or_else(|| ApiError::Conflict("instance is not placed on a server".into()))?;
    let server = svc.store.get_server(server_id).await?;

    let lines = query
        .lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .clamp(1, MAX_LOG_LINES);
    let logs = svc.deployer_for(&server)?.get_logs(&instance, lines).await;

    Ok(Json(LogsResponse {
        instance_id: id,
        lines,
        logs,
    }))
}
