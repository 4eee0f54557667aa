use nr_db::models::InstanceStatus;
use tracing::info;
use uuid::Uuid;

use super::{JobOutcome, ManageAction};
use crate::{Error, Result, Services};

/// Start, stop or restart an instance's container.
pub async fn run(svc: &Services, instance_id: Uuid, action: ManageAction) -> Result<JobOutcome> {
    let instance = svc.store.get_instance(instance_id).await?;
    if instance.status == InstanceStatus::Deleting {
        info!(instance_id = %instance.id, %action, "manage: instance is being deleted, skipping");
        return Ok(JobOutcome::Done);
    }

    let server_id = instance.server_id.ok_or_else(|| {
        Error::Precondition(format!("instance {} is not placed on a server", instance.slug))
    })?;
    let server = svc.store.get_server(server_id).await?;
    let deployer = svc.deployer_for(&server)?;

    let ok = match action {
        ManageAction::Start => deployer.start(&instance).await,
        ManageAction::Stop => deployer.stop(&instance).await,
        ManageAction::Restart => deployer.restart(&instance).await,
    };
    if !ok {
        return Err(Error::Container(format!(
            "{action} {} on {}",
            instance.slug, server.name
        )));
    }

    let status = match action {
        ManageAction::Stop => InstanceStatus::Stopped,
        ManageAction::Start | ManageAction::Restart => InstanceStatus::Active,
    };
    svc.store.set_instance_status(instance.id, status).await?;
    info!(instance_id = %instance.id, %action, %status, "manage: done");
    Ok(JobOutcome::Done)
}

/// Rewrite the instance's user list and restart it so Node-RED reloads it.
pub async fn sync_users(svc: &Services, instance_id: Uuid) -> Result<JobOutcome> {
    let instance = svc.store.get_instance(instance_id).await?;
    if instance.status == InstanceStatus::Deleting {
        return Ok(JobOutcome::Done);
    }
    let server_id = instance.server_id.ok_or_else(|| {
        Error::Precondition(format!("instance {} is not placed on a server", instance.slug))
    })?;
    let server = svc.store.get_server(server_id).await?;
    let deployer = svc.deployer_for(&server)?;
    let users = svc.store.list_instance_users(instance.id).await?;

    if !deployer.sync_users(&instance, &users).await {
        return Err(Error::Container(format!("sync users for {}", instance.slug)));
    }
    if !deployer.restart(&instance).await {
        return Err(Error::Container(format!("restart {} after user sync", instance.slug)));
    }
    info!(instance_id = %instance.id, users = users.len(), "sync users: done");
    Ok(JobOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nr_db::models::ServerStatus;

    use crate::testing::{Harness, seed_instance, seed_server};

    #[tokio::test]
    async fn stop_and_start_flip_status() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;

        run(&h.svc, instance.id, ManageAction::Stop).await.unwrap();
        assert_eq!(
            h.store.get_instance(instance.id).await.unwrap().status,
            InstanceStatus::Stopped
        );

        run(&h.svc, instance.id, ManageAction::Start).await.unwrap();
        assert_eq!(
            h.store.get_instance(instance.id).await.unwrap().status,
            InstanceStatus::Active
        );
        assert!(h.exec(server.public_ip.as_deref().unwrap()).ran("docker compose stop"));
    }

    #[tokio::test]
    async fn failed_command_is_retryable_and_keeps_status() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Active)
            .await
            .unwrap();
        h.exec(server.public_ip.as_deref().unwrap())
            .fail_on("docker compose restart");

        let err = run(&h.svc, instance.id, ManageAction::Restart).await.unwrap_err();

        assert!(matches!(err, Error::Container(_)));
        assert!(!err.is_permanent());
        assert_eq!(
            h.store.get_instance(instance.id).await.unwrap().status,
            InstanceStatus::Active
        );
    }

    #[tokio::test]
    async fn deleting_instance_is_skipped() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Deleting)
            .await
            .unwrap();

        run(&h.svc, instance.id, ManageAction::Start).await.unwrap();
        assert!(h.exec(server.public_ip.as_deref().unwrap()).commands().is_empty());
    }

    #[tokio::test]
    async fn user_sync_rewrites_settings_and_restarts() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        h.store
            .insert_instance_user(instance.id, "viewer", "$2b$10$hash", "read")
            .await
            .unwrap();

        sync_users(&h.svc, instance.id).await.unwrap();

        let exec = h.exec(server.public_ip.as_deref().unwrap());
        let settings = exec
            .uploaded("/opt/noderack/instances/lab/data/settings.js")
            .unwrap();
        assert!(settings.contains("viewer"));
        assert!(exec.ran("docker compose restart"));
    }
}
