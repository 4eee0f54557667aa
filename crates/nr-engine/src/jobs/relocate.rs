use nr_db::models::{Instance, InstanceStatus, Server, ServerStatus};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{JobOutcome, public_ip, publish_dns};
use crate::capacity::Allocation;
use crate::{Error, Result, Services};

/// Move an instance onto `target_id`.
///
/// Preconditions are checked before anything changes. A failed deploy on the
/// target puts the instance back on its old server in `error`.
pub async fn run(svc: &Services, instance_id: Uuid, target_id: Uuid) -> Result<JobOutcome> {
    let instance = svc.store.get_instance(instance_id).await?;
    match instance.status {
        InstanceStatus::Active | InstanceStatus::Stopped | InstanceStatus::Error => {}
        InstanceStatus::Pending | InstanceStatus::Deploying | InstanceStatus::Deleting => {
            return Err(Error::Precondition(format!(
                "instance {} is {} and cannot be moved",
                instance.slug, instance.status
            )));
        }
    }
    let source_id = instance.server_id.ok_or_else(|| {
        Error::Precondition(format!("instance {} is not placed on a server", instance.slug))
    })?;

    let target = match svc.store.get_server(target_id).await {
        Ok(server) => server,
        Err(e) if e.is_not_found() => {
            return Err(Error::Precondition(format!(
                "target server {target_id} does not exist"
            )));
        }
        Err(e) => return Err(e.into()),
    };
    check_target(svc, &instance, source_id, &target)?;

    let source = svc.store.get_server(source_id).await?;
    info!(instance_id = %instance.id, from = %source.name, to = %target.name, "move: starting");

    match svc.deployer_for(&source) {
        Ok(deployer) => {
            if !deployer.stop(&instance).await {
                warn!(instance_id = %instance.id, server = %source.name, "move: could not stop source container, continuing");
            }
        }
        Err(e) => {
            warn!(instance_id = %instance.id, error = %e, "move: source unreachable, continuing");
        }
    }

    svc.store
        .assign_instance_server(instance.id, Some(target.id))
        .await?;

    if let Err(e) = deploy_on_target(svc, &instance, &target).await {
        error!(instance_id = %instance.id, to = %target.name, error = %e, "move: deploy on target failed, reverting");
        svc.store
            .assign_instance_server(instance.id, Some(source.id))
            .await?;
        svc.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await?;
        return Err(e);
    }

    match public_ip(&target) {
        Ok(ip) => {
            if let Err(e) = publish_dns(svc, instance.id, &instance.subdomain, ip).await {
                warn!(instance_id = %instance.id, error = %e, "move: dns update failed, continuing");
            }
        }
        Err(e) => warn!(instance_id = %instance.id, error = %e, "move: dns update skipped"),
    }

    match svc.deployer_for(&source) {
        Ok(deployer) => {
            if !deployer.delete(&instance).await {
                warn!(instance_id = %instance.id, server = %source.name, "move: old container left behind");
            }
        }
        Err(e) => warn!(instance_id = %instance.id, error = %e, "move: old container left behind"),
    }

    let alloc = Allocation::from(&instance);
    let planner = svc.planner();
    if instance.capacity_counted {
        planner.release_server_capacity(source.id, alloc).await?;
        planner.update_server_capacity(target.id, alloc).await?;
    } else {
        // Never deployed successfully before; the target now carries it.
        planner.update_server_capacity(target.id, alloc).await?;
        svc.store
            .set_instance_capacity_counted(instance.id, true)
            .await?;
    }

    svc.store
        .set_instance_status(instance.id, InstanceStatus::Active)
        .await?;
    info!(instance_id = %instance.id, server = %target.name, "move: complete");
    Ok(JobOutcome::Done)
}

fn check_target(svc: &Services, instance: &Instance, source_id: Uuid, target: &Server) -> Result<()> {
    if target.status != ServerStatus::Active {
        return Err(Error::Precondition(format!(
            "target server {} is {}",
            target.name, target.status
        )));
    }
    if target.id == source_id {
        return Err(Error::Precondition(format!(
            "instance {} is already on {}",
            instance.slug, target.name
        )));
    }

    let cfg = &svc.config;
    let free_mb = target.available_memory_mb(cfg.reserved_memory_mb);
    let free_gb = target.available_disk_gb(cfg.reserved_disk_gb);
    if free_mb < instance.memory_mb || free_gb < instance.storage_gb {
        return Err(Error::Precondition(format!(
            "target server {} has {free_mb} MB / {free_gb} GB free, instance needs {} MB / {} GB",
            target.name, instance.memory_mb, instance.storage_gb
        )));
    }
    Ok(())
}

async fn deploy_on_target(svc: &Services, instance: &Instance, target: &Server) -> Result<()> {
    let bootstrapper = svc.bootstrapper_for(target)?;
    if !bootstrapper.is_proxy_running().await {
        info!(server = %target.name, "move: edge proxy not running on target, bootstrapping");
        if !bootstrapper.bootstrap().await {
            return Err(Error::Bootstrap(format!("edge proxy on {}", target.name)));
        }
        tokio::time::sleep(svc.config.timings.proxy_settle).await;
    }

    let secret = match &instance.credential_secret {
        Some(secret) => secret.clone(),
        None => {
            svc.store
                .init_instance_secret(instance.id, &Instance::generate_secret())
                .await?
        }
    };
    let users = svc.store.list_instance_users(instance.id).await?;
    if !svc.deployer_for(target)?.deploy(instance, &secret, &users).await {
        return Err(Error::Deploy(format!(
            "{} did not start on {}",
            instance.slug, target.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::deploy;
    use crate::testing::{Harness, seed_instance, seed_server};

    async fn deployed(h: &Harness) -> (Instance, Server) {
        let source = seed_server(h, "source", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(h, "lab", Some(source.id)).await;
        deploy::run(&h.svc, &h.ctx(), instance.id).await.unwrap();
        (h.store.get_instance(instance.id).await.unwrap(), source)
    }

    #[tokio::test]
    async fn insufficient_target_fails_before_touching_source() {
        let h = Harness::new();
        let (instance, source) = deployed(&h).await;
        // 912 - 512 reserved leaves 400 MB
        let target = seed_server(&h, "tight", 912, 80, ServerStatus::Active).await;
        let source_exec = h.exec(source.public_ip.as_deref().unwrap());
        let before = source_exec.commands().len();

        let err = run(&h.svc, instance.id, target.id).await.unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(source_exec.commands().len(), before);
        let after = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(after.server_id, Some(source.id));
        assert_eq!(after.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn same_or_inactive_target_is_rejected() {
        let h = Harness::new();
        let (instance, source) = deployed(&h).await;
        let booting = seed_server(&h, "booting", 8192, 160, ServerStatus::Provisioning).await;

        assert!(matches!(
            run(&h.svc, instance.id, source.id).await.unwrap_err(),
            Error::Precondition(_)
        ));
        assert!(matches!(
            run(&h.svc, instance.id, booting.id).await.unwrap_err(),
            Error::Precondition(_)
        ));
        assert!(matches!(
            run(&h.svc, instance.id, Uuid::new_v4()).await.unwrap_err(),
            Error::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn moves_container_dns_and_capacity() {
        let h = Harness::new();
        let (instance, source) = deployed(&h).await;
        let target = seed_server(&h, "roomy", 8192, 160, ServerStatus::Active).await;
        let target_ip = target.public_ip.clone().unwrap();

        run(&h.svc, instance.id, target.id).await.unwrap();

        let moved = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(moved.server_id, Some(target.id));
        assert_eq!(moved.status, InstanceStatus::Active);
        assert_eq!(h.dns.record("lab").unwrap().content, target_ip);

        let source_exec = h.exec(source.public_ip.as_deref().unwrap());
        assert!(source_exec.ran("docker compose stop"));
        assert!(source_exec.ran("rm -rf /opt/noderack/instances/lab"));
        // proxy was not running on the target, so it got bootstrapped
        assert!(h.exec(&target_ip).ran("docker network inspect noderack"));

        let source = h.store.get_server(source.id).await.unwrap();
        let target = h.store.get_server(target.id).await.unwrap();
        assert_eq!(source.used_memory_mb, 0);
        assert_eq!(target.used_memory_mb, 512);
    }

    #[tokio::test]
    async fn deleting_or_deploying_instance_is_not_moved() {
        let h = Harness::new();
        let (instance, source) = deployed(&h).await;
        let target = seed_server(&h, "roomy", 8192, 160, ServerStatus::Active).await;
        let target_ip = target.public_ip.clone().unwrap();

        for status in [InstanceStatus::Deleting, InstanceStatus::Deploying] {
            h.store.set_instance_status(instance.id, status).await.unwrap();

            let err = run(&h.svc, instance.id, target.id).await.unwrap_err();

            assert!(matches!(err, Error::Precondition(_)));
            let after = h.store.get_instance(instance.id).await.unwrap();
            assert_eq!(after.status, status);
            assert_eq!(after.server_id, Some(source.id));
        }
        assert!(h.exec(&target_ip).commands().is_empty());
        assert_eq!(h.store.get_server(target.id).await.unwrap().used_memory_mb, 0);
    }

    #[tokio::test]
    async fn uncounted_instance_is_counted_on_target() {
        let h = Harness::new();
        let source = seed_server(&h, "source", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(source.id)).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await
            .unwrap();
        let target = seed_server(&h, "roomy", 8192, 160, ServerStatus::Active).await;

        run(&h.svc, instance.id, target.id).await.unwrap();

        let moved = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(moved.status, InstanceStatus::Active);
        assert!(moved.capacity_counted);
        assert_eq!(h.store.get_server(target.id).await.unwrap().used_memory_mb, 512);
        assert_eq!(h.store.get_server(source.id).await.unwrap().used_memory_mb, 0);
    }

    #[tokio::test]
    async fn dns_failure_does_not_abort_move() {
        let h = Harness::new();
        let (instance, _) = deployed(&h).await;
        let target = seed_server(&h, "roomy", 8192, 160, ServerStatus::Active).await;
        h.dns.fail_ensures();

        run(&h.svc, instance.id, target.id).await.unwrap();
        let moved = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(moved.server_id, Some(target.id));
    }

    #[tokio::test]
    async fn failed_target_deploy_reverts_assignment() {
        let h = Harness::new();
        let (instance, source) = deployed(&h).await;
        let target = seed_server(&h, "flaky", 8192, 160, ServerStatus::Active).await;
        let target_exec = h.exec(target.public_ip.as_deref().unwrap());
        target_exec.respond("docker ps -q --filter name=^traefik$", "proxy\n");
        target_exec.fail_on("/opt/noderack/instances/lab && docker compose up");

        run(&h.svc, instance.id, target.id).await.unwrap_err();

        let after = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(after.server_id, Some(source.id));
        assert_eq!(after.status, InstanceStatus::Error);
        let source = h.store.get_server(source.id).await.unwrap();
        assert_eq!(source.used_memory_mb, 512);
    }
}
