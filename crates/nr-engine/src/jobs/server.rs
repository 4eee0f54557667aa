use nr_db::models::ServerStatus;
use nr_infra::types::ProviderId;
use tracing::{info, warn};
use uuid::Uuid;

use super::JobOutcome;
use crate::{Error, Result, Services};

/// Prepare a server for instances and mark it active.
pub async fn bootstrap(svc: &Services, server_id: Uuid) -> Result<JobOutcome> {
    let server = svc.store.get_server(server_id).await?;
    if server.status == ServerStatus::Deleting {
        info!(server_id = %server.id, "bootstrap: server is being deleted, skipping");
        return Ok(JobOutcome::Done);
    }

    let bootstrapper = svc.bootstrapper_for(&server)?;
    if !bootstrapper.bootstrap().await {
        return Err(Error::Bootstrap(format!("server {}", server.name)));
    }

    svc.store
        .set_server_status(server.id, ServerStatus::Active)
        .await?;
    info!(server_id = %server.id, server = %server.name, "bootstrap: server active");
    Ok(JobOutcome::Done)
}

/// Remove an empty server at the provider and from the store.
pub async fn delete(svc: &Services, server_id: Uuid) -> Result<JobOutcome> {
    let server = match svc.store.get_server(server_id).await {
        Ok(server) => server,
        Err(e) if e.is_not_found() => {
            info!(server_id = %server_id, "delete server: already gone");
            return Ok(JobOutcome::Done);
        }
        Err(e) => return Err(e.into()),
    };

    let instances = svc.store.list_instances_on_server(server.id).await?;
    if !instances.is_empty() {
        return Err(Error::Precondition(format!(
            "server {} still hosts {} instance(s)",
            server.name,
            instances.len()
        )));
    }

    svc.store
        .set_server_status(server.id, ServerStatus::Deleting)
        .await?;

    match &server.provider_id {
        Some(provider_id) => {
            let existed = svc
                .cloud
                .delete_server(&ProviderId(provider_id.clone()))
                .await?;
            if !existed {
                warn!(server_id = %server.id, provider_id = %provider_id, "delete server: provider had no such server");
            }
        }
        None => {
            warn!(server_id = %server.id, server = %server.name, "delete server: no provider id, skipping provider call");
        }
    }

    svc.store.delete_server(server.id).await?;
    info!(server_id = %server.id, server = %server.name, "delete server: removed");
    Ok(JobOutcome::Done)
}

/// Only a server the delete job already took down to `deleting` is marked `error`.
pub(crate) async fn delete_failed(svc: &Services, server_id: Uuid) -> Result<()> {
    match svc.store.get_server(server_id).await {
        Ok(server) if server.status == ServerStatus::Deleting => mark_error(svc, server_id).await,
        Ok(server) => {
            warn!(server_id = %server.id, status = %server.status, "delete server: failed before teardown, status kept");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn mark_error(svc: &Services, server_id: Uuid) -> Result<()> {
    match svc
        .store
        .set_server_status(server_id, ServerStatus::Error)
        .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        other => Ok(other?),
    }
}
