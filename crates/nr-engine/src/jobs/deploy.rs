use std::time::Duration;

use chrono::{DateTime, Utc};
use nr_db::models::{
    Deployment, DeploymentOutcome, DeploymentState, Instance, InstanceStatus, ServerStatus,
};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{JobContext, JobOutcome, merge_metadata, public_ip, publish_dns};
use crate::capacity::Allocation;
use crate::config::Timings;
use crate::{Error, Result, Services};

enum Attempt {
    Deployed { logs: String },
    WaitForServer(Duration),
}

/// Bring an instance from `pending`/`deploying`/`error` to `active`.
pub async fn run(svc: &Services, ctx: &JobContext, instance_id: Uuid) -> Result<JobOutcome> {
    let instance = svc.store.get_instance(instance_id).await?;
    if !instance.status.is_deployable() {
        info!(instance_id = %instance.id, status = %instance.status, "deploy: instance not deployable, skipping");
        return Ok(JobOutcome::Done);
    }

    let deployment = begin(svc, ctx, &instance).await?;
    if instance.status != InstanceStatus::Deploying {
        svc.store
            .set_instance_status(instance.id, InstanceStatus::Deploying)
            .await?;
    }

    match attempt(svc, &instance).await {
        Ok(Attempt::Deployed { logs }) => {
            svc.store
                .complete_deployment(
                    deployment.id,
                    &DeploymentOutcome {
                        state: DeploymentState::Success,
                        reason: None,
                        logs: Some(logs),
                        metadata: deployment.metadata.clone(),
                    },
                )
                .await?;
            info!(instance_id = %instance.id, deployment_id = %deployment.id, attempt = ctx.attempt, "deploy: instance active");
            Ok(JobOutcome::Done)
        }
        Ok(Attempt::WaitForServer(delay)) => {
            info!(
                tag = "provisioning_wait",
                instance_id = %instance.id,
                waits = ctx.waits + 1,
                delay_secs = delay.as_secs(),
                "deploy: server still provisioning, rescheduling"
            );
            Ok(JobOutcome::Reschedule(delay))
        }
        Err(e) => {
            record_failure(svc, ctx, &instance, &deployment, &e).await;
            Err(e)
        }
    }
}

/// New deployment row, or the one a previous attempt of this execution left behind.
async fn begin(svc: &Services, ctx: &JobContext, instance: &Instance) -> Result<Deployment> {
    let fields = json!({
        "execution_id": ctx.execution_id,
        "attempt": ctx.attempt,
        "max_attempts": ctx.max_attempts,
        "provisioning_waits": ctx.waits,
    });

    let token = ctx.execution_id.to_string();
    if let Some(latest) = svc.store.latest_deployment(instance.id).await? {
        if latest.metadata.get("execution_id").and_then(Value::as_str) == Some(token.as_str()) {
            let metadata = merge_metadata(&latest.metadata, &fields);
            return Ok(svc.store.restart_deployment(latest.id, &metadata).await?);
        }
    }
    Ok(svc.store.insert_deployment(instance.id, &fields).await?)
}

async fn attempt(svc: &Services, instance: &Instance) -> Result<Attempt> {
    let planner = svc.planner();
    let alloc = Allocation::from(instance);

    let server = match instance.server_id {
        Some(id) => svc.store.get_server(id).await?,
        None => {
            let server = planner.find_or_create_server(alloc, None).await?;
            svc.store
                .assign_instance_server(instance.id, Some(server.id))
                .await?;
            info!(instance_id = %instance.id, server_id = %server.id, "deploy: server assigned");
            server
        }
    };

    match server.status {
        ServerStatus::Active => {}
        ServerStatus::Provisioning => {
            let delay = provisioning_wait(server.created_at, Utc::now(), &svc.config.timings)?;
            return Ok(Attempt::WaitForServer(delay));
        }
        ServerStatus::Error | ServerStatus::Deleting => {
            return Err(Error::Precondition(format!(
                "server {} is {}",
                server.name, server.status
            )));
        }
    }

    let secret = match &instance.credential_secret {
        Some(secret) => secret.clone(),
        None => {
            svc.store
                .init_instance_secret(instance.id, &Instance::generate_secret())
                .await?
        }
    };

    let deployer = svc.deployer_for(&server)?;
    let users = svc.store.list_instance_users(instance.id).await?;
    if !deployer.deploy(instance, &secret, &users).await {
        return Err(Error::Deploy(format!(
            "{} did not start on {}",
            instance.slug, server.name
        )));
    }

    publish_dns(svc, instance.id, &instance.subdomain, public_ip(&server)?).await?;

    if !instance.capacity_counted {
        planner.update_server_capacity(server.id, alloc).await?;
        svc.store
            .set_instance_capacity_counted(instance.id, true)
            .await?;
    }

    svc.store
        .mark_instance_deployed(instance.id, Utc::now())
        .await?;
    let logs = deployer.get_logs(instance, 100).await;
    Ok(Attempt::Deployed { logs })
}

/// How long to wait before the next look at a provisioning server.
///
/// Inside the boot grace the remaining grace is returned; past the
/// provisioning bound the wait is over for good.
pub fn provisioning_wait(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    timings: &Timings,
) -> Result<Duration> {
    let age = (now - created_at).to_std().unwrap_or(Duration::ZERO);
    if age < timings.boot_grace {
        return Ok(timings.boot_grace - age);
    }
    if age > timings.provisioning_timeout {
        return Err(Error::Timeout(format!(
            "server still provisioning after {}s",
            age.as_secs()
        )));
    }
    Ok(timings.provisioning_poll)
}

async fn record_failure(
    svc: &Services,
    ctx: &JobContext,
    instance: &Instance,
    deployment: &Deployment,
    error: &Error,
) {
    let terminal = ctx.is_final_attempt() || error.is_permanent();
    let reason = format!("attempt {}/{}: {error}", ctx.attempt, ctx.max_attempts);
    let metadata = merge_metadata(
        &deployment.metadata,
        &json!({ "last_error": error.to_string(), "failed_attempt": ctx.attempt }),
    );

    let result = async {
        if terminal {
            svc.store
                .complete_deployment(
                    deployment.id,
                    &DeploymentOutcome {
                        state: DeploymentState::Failed,
                        reason: Some(reason.clone()),
                        logs: None,
                        metadata,
                    },
                )
                .await?;
            svc.store
                .set_instance_status(instance.id, InstanceStatus::Error)
                .await?;
        } else {
            svc.store
                .note_deployment_failure(deployment.id, &reason, &metadata)
                .await?;
        }
        Ok::<_, nr_db::Error>(())
    }
    .await;

    if let Err(e) = result {
        warn!(instance_id = %instance.id, error = %e, "deploy: could not record failure");
    }
    if terminal {
        error!(instance_id = %instance.id, attempt = ctx.attempt, error = %error, "deploy: giving up");
    } else {
        warn!(instance_id = %instance.id, attempt = ctx.attempt, max_attempts = ctx.max_attempts, error = %error, "deploy: attempt failed, will retry");
    }
}

/// Close out a deploy whose attempt never got to record its own failure.
pub async fn failed(svc: &Services, instance_id: Uuid, error: &Error) -> Result<()> {
    let instance = match svc.store.get_instance(instance_id).await {
        Ok(instance) => instance,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if instance.status == InstanceStatus::Deploying {
        svc.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await?;
    }
    if let Some(latest) = svc.store.latest_deployment(instance.id).await? {
        if latest.state == DeploymentState::Deploying {
            svc.store
                .complete_deployment(
                    latest.id,
                    &DeploymentOutcome {
                        state: DeploymentState::Failed,
                        reason: Some(error.to_string()),
                        logs: None,
                        metadata: latest.metadata.clone(),
                    },
                )
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, seed_instance, seed_server};

    #[tokio::test]
    async fn active_instance_is_left_alone() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "done", Some(server.id)).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Active)
            .await
            .unwrap();

        let outcome = run(&h.svc, &h.ctx(), instance.id).await.unwrap();

        assert_eq!(outcome, JobOutcome::Done);
        assert!(h.store.latest_deployment(instance.id).await.unwrap().is_none());
        assert!(h.exec(server.public_ip.as_deref().unwrap()).commands().is_empty());
        assert!(h.dns.calls().is_empty());
    }

    #[tokio::test]
    async fn deploys_publishes_and_counts_capacity() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", None).await;

        let outcome = run(&h.svc, &h.ctx(), instance.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Done);

        let instance = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Active);
        assert_eq!(instance.server_id, Some(server.id));
        assert!(instance.deployed_at.is_some());
        assert!(instance.capacity_counted);
        assert_eq!(instance.credential_secret.as_ref().map(String::len), Some(64));

        let deployment = h.store.latest_deployment(instance.id).await.unwrap().unwrap();
        assert_eq!(deployment.state, DeploymentState::Success);
        assert!(deployment.completed_at.is_some());

        let domain = h.store.get_domain(instance.id).await.unwrap().unwrap();
        assert_eq!(domain.fqdn, "lab.flows.test");
        assert_eq!(domain.dns_provider, "fake");
        let record = h.dns.record("lab").unwrap();
        assert_eq!(Some(record.id), domain.provider_record_id);
        assert_eq!(Some(record.content), server.public_ip);

        let server = h.store.get_server(server.id).await.unwrap();
        assert_eq!((server.used_memory_mb, server.used_disk_gb), (512, 10));
    }

    #[tokio::test]
    async fn redeploy_does_not_count_capacity_twice() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;

        run(&h.svc, &h.ctx(), instance.id).await.unwrap();
        h.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await
            .unwrap();
        run(&h.svc, &h.ctx(), instance.id).await.unwrap();

        let server = h.store.get_server(server.id).await.unwrap();
        assert_eq!(server.used_memory_mb, 512);
    }

    #[tokio::test]
    async fn waits_for_a_booting_server_without_remote_calls() {
        let h = Harness::new();
        let server = seed_server(&h, "booting", 4096, 80, ServerStatus::Provisioning).await;
        let instance = seed_instance(&h, "early", Some(server.id)).await;

        let outcome = run(&h.svc, &h.ctx(), instance.id).await.unwrap();

        match outcome {
            JobOutcome::Reschedule(delay) => assert!(delay <= Duration::from_secs(60)),
            other => panic!("expected reschedule, got {other:?}"),
        }
        let instance = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Deploying);
        assert!(h.exec(server.public_ip.as_deref().unwrap()).commands().is_empty());
    }

    #[tokio::test]
    async fn server_in_error_fails_permanently() {
        let h = Harness::new();
        let server = seed_server(&h, "broken", 4096, 80, ServerStatus::Error).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;

        let err = run(&h.svc, &h.ctx(), instance.id).await.unwrap_err();
        assert!(err.is_permanent());

        let instance = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        let deployment = h.store.latest_deployment(instance.id).await.unwrap().unwrap();
        assert_eq!(deployment.state, DeploymentState::Failed);
        assert!(deployment.reason.unwrap().starts_with("attempt 1/3"));
    }

    #[tokio::test]
    async fn early_failure_keeps_deploying_and_reuses_row_on_retry() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        let exec = h.exec(server.public_ip.as_deref().unwrap());
        exec.fail_on("docker compose up");

        let mut ctx = h.ctx();
        run(&h.svc, &ctx, instance.id).await.unwrap_err();

        let first = h.store.latest_deployment(instance.id).await.unwrap().unwrap();
        assert_eq!(first.state, DeploymentState::Deploying);
        assert_eq!(first.reason.as_deref().map(|r| r.starts_with("attempt 1/3")), Some(true));
        assert_eq!(
            h.store.get_instance(instance.id).await.unwrap().status,
            InstanceStatus::Deploying
        );

        exec.clear_failures();
        ctx.attempt = 2;
        run(&h.svc, &ctx, instance.id).await.unwrap();

        let second = h.store.latest_deployment(instance.id).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.state, DeploymentState::Success);
        assert_eq!(second.metadata["attempt"], 2);
        assert!(second.metadata.get("last_error").is_some());
    }

    #[tokio::test]
    async fn new_execution_gets_its_own_row() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;

        run(&h.svc, &h.ctx(), instance.id).await.unwrap();
        let first = h.store.latest_deployment(instance.id).await.unwrap().unwrap();
        h.store
            .set_instance_status(instance.id, InstanceStatus::Error)
            .await
            .unwrap();
        run(&h.svc, &h.ctx(), instance.id).await.unwrap();
        let second = h.store.latest_deployment(instance.id).await.unwrap().unwrap();

        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn failed_hook_closes_an_interrupted_attempt() {
        let h = Harness::new();
        let instance = seed_instance(&h, "lab", None).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Deploying)
            .await
            .unwrap();
        let row = h
            .store
            .insert_deployment(instance.id, &json!({}))
            .await
            .unwrap();

        failed(&h.svc, instance.id, &Error::AttemptTimeout(Duration::from_secs(600)))
            .await
            .unwrap();

        let instance = h.store.get_instance(instance.id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        let row = h.store.latest_deployment(row.instance_id).await.unwrap().unwrap();
        assert_eq!(row.state, DeploymentState::Failed);
    }

    #[test]
    fn provisioning_wait_respects_grace_and_bound() {
        let timings = Timings::default();
        let created = Utc::now();

        let wait = provisioning_wait(created, created + chrono::Duration::seconds(20), &timings).unwrap();
        assert_eq!(wait, Duration::from_secs(40));

        let wait = provisioning_wait(created, created + chrono::Duration::seconds(120), &timings).unwrap();
        assert_eq!(wait, Duration::from_secs(60));

        let err = provisioning_wait(created, created + chrono::Duration::seconds(601), &timings).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_permanent());
    }
}
