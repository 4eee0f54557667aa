use nr_db::models::{Instance, InstanceStatus};
use tracing::{info, warn};
use uuid::Uuid;

use super::JobOutcome;
use super::cleanup::Cleanup;
use crate::capacity::Allocation;
use crate::{Error, Result, Services};

/// Tear an instance down everywhere and remove its row.
pub async fn run(svc: &Services, instance_id: Uuid) -> Result<JobOutcome> {
    let instance = match svc.store.get_instance(instance_id).await {
        Ok(instance) => instance,
        Err(e) if e.is_not_found() => {
            info!(instance_id = %instance_id, "delete: instance already gone");
            return Ok(JobOutcome::Done);
        }
        Err(e) => return Err(e.into()),
    };

    svc.store
        .set_instance_status(instance.id, InstanceStatus::Deleting)
        .await?;

    if let Err(e) = teardown(svc, &instance).await {
        warn!(instance_id = %instance.id, error = %e, "delete: failed, marking instance error");
        svc.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await?;
        return Err(e);
    }

    info!(instance_id = %instance.id, slug = %instance.slug, "delete: instance removed");
    Ok(JobOutcome::Done)
}

async fn teardown(svc: &Services, instance: &Instance) -> Result<()> {
    let mut cleanup = Cleanup::new("delete", instance.id);
    let store = &svc.store;

    let server = match instance.server_id {
        Some(id) => cleanup.step("load server", store.get_server(id)).await,
        None => None,
    };

    if let Some(server) = &server {
        cleanup
            .step("remove container", async {
                let deployer = svc.deployer_for(server)?;
                if deployer.delete(instance).await {
                    Ok::<(), Error>(())
                } else {
                    Err(Error::Container(format!(
                        "could not remove {} from {}",
                        instance.container_name(),
                        server.name
                    )))
                }
            })
            .await;
    }

    let domain = cleanup
        .step("load domain", store.get_domain(instance.id))
        .await
        .flatten();
    let record_id = match domain.and_then(|d| d.provider_record_id) {
        Some(id) => Some(id),
        None => cleanup
            .step("find dns record", svc.dns.find_record(&instance.subdomain, "A"))
            .await
            .flatten()
            .map(|r| r.id),
    };
    if let Some(record_id) = record_id {
        cleanup
            .step("delete dns record", svc.dns.delete_record(&record_id))
            .await;
    }

    if instance.capacity_counted {
        if let Some(server) = &server {
            cleanup
                .step(
                    "release capacity",
                    svc.planner()
                        .release_server_capacity(server.id, Allocation::from(instance)),
                )
                .await;
        }
    }

    cleanup
        .step("delete deployments", store.delete_deployments(instance.id))
        .await;
    cleanup
        .step("delete domain", store.delete_domain(instance.id))
        .await;
    cleanup
        .step("delete users", store.delete_instance_users(instance.id))
        .await;
    cleanup
        .step("delete metrics", store.delete_metrics(instance.id))
        .await;
    cleanup.finish();

    store.delete_instance(instance.id).await?;
    Ok(())
}
