use nr_db::models::{Instance, InstanceStatus, NewDomain};
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobOutcome, public_ip};
use crate::capacity::Allocation;
use crate::{Error, Result, Services};

/// Whether `label` is usable as a single DNS label under the base domain.
pub fn is_valid_subdomain(label: &str) -> bool {
    (1..=63).contains(&label.len())
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

/// Give an instance a new hostname: DNS first, then rows, then the container's routing.
pub async fn run(svc: &Services, instance_id: Uuid, subdomain: &str) -> Result<JobOutcome> {
    let instance = svc.store.get_instance(instance_id).await?;

    if !is_valid_subdomain(subdomain) {
        return Err(Error::Precondition(format!(
            "{subdomain:?} is not a valid subdomain"
        )));
    }
    if instance.subdomain == subdomain {
        info!(instance_id = %instance.id, subdomain, "rename: already named, nothing to do");
        return Ok(JobOutcome::Done);
    }
    if let Some(other) = svc.store.find_instance_by_subdomain(subdomain).await? {
        if other.id != instance.id {
            return Err(Error::Precondition(format!(
                "subdomain {subdomain} is already taken"
            )));
        }
    }
    if matches!(
        instance.status,
        InstanceStatus::Deleting | InstanceStatus::Deploying
    ) {
        return Err(Error::Precondition(format!(
            "instance {} is {} and cannot be renamed",
            instance.slug, instance.status
        )));
    }

    let server = match instance.server_id {
        Some(id) => Some(svc.store.get_server(id).await?),
        None => None,
    };

    let new_record = match &server {
        Some(server) => Some(
            svc.dns
                .ensure_a_record(subdomain, public_ip(server)?, svc.config.dns_proxied)
                .await?,
        ),
        None => None,
    };

    let old_record_id = match svc.store.get_domain(instance.id).await? {
        Some(domain) => domain.provider_record_id,
        None => svc
            .dns
            .find_record(&instance.subdomain, "A")
            .await
            .ok()
            .flatten()
            .map(|r| r.id),
    };
    if let Some(old_id) = old_record_id {
        if new_record.as_ref().map(|r| r.id.as_str()) != Some(old_id.as_str()) {
            if let Err(e) = svc.dns.delete_record(&old_id).await {
                warn!(instance_id = %instance.id, record_id = %old_id, error = %e, "rename: old record left behind");
            }
        }
    }

    let fqdn = svc.dns.fqdn(subdomain);
    svc.store
        .rename_instance(instance.id, subdomain, &fqdn)
        .await?;
    svc.store
        .upsert_domain(&NewDomain {
            instance_id: instance.id,
            hostname: subdomain.to_string(),
            fqdn: fqdn.clone(),
            dns_provider: svc.dns.name().to_string(),
            provider_record_id: new_record.map(|r| r.id),
        })
        .await?;
    info!(instance_id = %instance.id, from = %instance.subdomain, to = subdomain, "rename: records updated");

    // Routing labels carry the hostname, so any existing container is recreated.
    // A pending instance has none yet; its first deploy reads the new fqdn.
    if let Some(server) = &server {
        let renamed = svc.store.get_instance(instance.id).await?;
        if renamed.status == InstanceStatus::Pending {
            info!(instance_id = %renamed.id, "rename: not deployed yet, routing follows on deploy");
        } else {
            let secret = match &renamed.credential_secret {
                Some(secret) => secret.clone(),
                None => {
                    svc.store
                        .init_instance_secret(renamed.id, &Instance::generate_secret())
                        .await?
                }
            };
            let users = svc.store.list_instance_users(renamed.id).await?;
            if !svc.deployer_for(server)?.deploy(&renamed, &secret, &users).await {
                return Err(Error::Deploy(format!(
                    "{} did not come back under {fqdn}",
                    renamed.slug
                )));
            }
            if !renamed.capacity_counted {
                svc.planner()
                    .update_server_capacity(server.id, Allocation::from(&renamed))
                    .await?;
                svc.store
                    .set_instance_capacity_counted(renamed.id, true)
                    .await?;
            }
            svc.store
                .set_instance_status(renamed.id, InstanceStatus::Active)
                .await?;
        }
    }

    info!(instance_id = %instance.id, fqdn = %fqdn, "rename: complete");
    Ok(JobOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nr_db::models::ServerStatus;

    use crate::jobs::deploy;
    use crate::testing::{Harness, seed_instance, seed_server};

    #[test]
    fn subdomain_rules() {
        assert!(is_valid_subdomain("lab"));
        assert!(is_valid_subdomain("lab-2"));
        assert!(is_valid_subdomain(&"a".repeat(63)));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
        assert!(!is_valid_subdomain("-lab"));
        assert!(!is_valid_subdomain("lab-"));
        assert!(!is_valid_subdomain("Lab"));
        assert!(!is_valid_subdomain("lab.prod"));
        assert!(!is_valid_subdomain("lab_2"));
    }

    #[tokio::test]
    async fn taken_subdomain_fails_before_dns() {
        let h = Harness::new();
        let first = seed_instance(&h, "first", None).await;
        seed_instance(&h, "second", None).await;

        let err = run(&h.svc, first.id, "second").await.unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.is_permanent());
        assert!(h.dns.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_label_fails_before_dns() {
        let h = Harness::new();
        let instance = seed_instance(&h, "lab", None).await;

        let err = run(&h.svc, instance.id, "-bad-").await.unwrap_err();
        assert!(err.is_permanent());
        assert!(h.dns.calls().is_empty());
    }

    #[tokio::test]
    async fn deploying_instance_is_not_renamed() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Deploying)
            .await
            .unwrap();

        let err = run(&h.svc, instance.id, "studio").await.unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert!(h.dns.calls().is_empty());
        let unchanged = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(unchanged.subdomain, "lab");
        assert_eq!(unchanged.status, InstanceStatus::Deploying);
    }

    #[tokio::test]
    async fn errored_instance_is_recreated_under_new_name() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        deploy::run(&h.svc, &h.ctx(), instance.id).await.unwrap();
        h.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await
            .unwrap();

        run(&h.svc, instance.id, "studio").await.unwrap();

        let renamed = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(renamed.status, InstanceStatus::Active);
        let exec = h.exec(server.public_ip.as_deref().unwrap());
        let compose = exec
            .uploaded("/opt/noderack/instances/lab/docker-compose.yml")
            .unwrap();
        assert!(compose.contains("Host(`studio.flows.test`)"));
    }

    #[tokio::test]
    async fn pending_instance_is_renamed_without_deploying() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;

        run(&h.svc, instance.id, "studio").await.unwrap();

        let renamed = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(renamed.fqdn, "studio.flows.test");
        assert_eq!(renamed.status, InstanceStatus::Pending);
        assert!(h.dns.record("studio").is_some());
        let exec = h.exec(server.public_ip.as_deref().unwrap());
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn moves_record_and_redeploys() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        deploy::run(&h.svc, &h.ctx(), instance.id).await.unwrap();

        run(&h.svc, instance.id, "studio").await.unwrap();

        let renamed = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(renamed.subdomain, "studio");
        assert_eq!(renamed.fqdn, "studio.flows.test");
        assert_eq!(renamed.status, InstanceStatus::Active);

        assert!(h.dns.record("lab").is_none());
        let record = h.dns.record("studio").unwrap();
        let domain = h.store.get_domain(instance.id).await.unwrap().unwrap();
        assert_eq!(domain.provider_record_id, Some(record.id));
        assert_eq!(domain.fqdn, "studio.flows.test");

        let exec = h.exec(server.public_ip.as_deref().unwrap());
        let compose = exec
            .uploaded("/opt/noderack/instances/lab/docker-compose.yml")
            .unwrap();
        assert!(compose.contains("Host(`studio.flows.test`)"));
    }
}
