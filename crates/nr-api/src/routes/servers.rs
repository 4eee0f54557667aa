use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use nr_db::models::{NewServer, Server, ServerStatus};
use nr_engine::Job;
use uuid::Uuid;

use crate::auth::Actor;
use crate::dto::{JobAccepted, RegisterServerRequest, ServerResponse};
use crate::error::ApiError;
use crate::state::AppState;

use super::accepted;

fn to_response(state: &AppState, server: Server) -> ServerResponse {
    let cfg = &state.svc.config;
    ServerResponse::new(server, cfg.reserved_memory_mb, cfg.reserved_disk_gb)
}

pub async fn list_servers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServerResponse>>, ApiError> {
    let servers = state.svc.store.list_servers().await?;
    Ok(Json(
        servers
            .into_iter()
            .map(|s| to_response(&state, s))
            .collect(),
    ))
}

/// Adopt an existing VM. It has no provider id, so deleting it later never
/// touches the cloud provider.
pub async fn register_server(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<RegisterServerRequest>,
) -> Result<(StatusCode, Json<ServerResponse>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    if req.public_ip.parse::<std::net::IpAddr>().is_err() {
        return Err(ApiError::BadRequest(format!(
            "invalid public_ip: {}",
            req.public_ip
        )));
    }
    if req.total_memory_mb <= 0 || req.total_disk_gb <= 0 {
        return Err(ApiError::BadRequest(
            "total_memory_mb and total_disk_gb must be positive".into(),
        ));
    }

    let server = state
        .svc
        .store
        .insert_server(&NewServer {
            provider_id: None,
            name: req.name,
            public_ip: Some(req.public_ip),
            private_ip: req.private_ip,
            region: req.region,
            server_type: req.server_type,
            total_memory_mb: req.total_memory_mb,
            total_disk_gb: req.total_disk_gb,
            status: ServerStatus::Provisioning,
        })
        .await?;

    let execution_id = state.svc.queue.dispatch(Job::BootstrapServer {
        server_id: server.id,
        actor_id: actor.0,
    });
    tracing::info!(
        server_id = %server.id,
        server = %server.name,
        actor_id = ?actor.0,
        %execution_id,
        "server registered, bootstrap queued"
    );

    Ok((StatusCode::CREATED, Json(to_response(&state, server))))
}

pub async fn bootstrap_server(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let server = state.svc.store.get_server(id).await?;
    if server.status == ServerStatus::Deleting {
        return Err(ApiError::Conflict(format!(
            "server {} is being deleted",
            server.name
        )));
    }
    Ok(accepted(
        &state,
        Job::BootstrapServer {
            server_id: id,
            actor_id: actor.0,
        },
    ))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let store = &state.svc.store;
    let server = store.get_server(id).await?;
    let hosted = store.list_instances_on_server(id).await?;
    if !hosted.is_empty() {
        return Err(ApiError::Conflict(format!(
            "server {} still hosts {} instance(s)",
            server.name,
            hosted.len()
        )));
    }
    Ok(accepted(
        &state,
        Job::DeleteServer {
            server_id: id,
            actor_id: actor.0,
        },
    ))
}
