//! Retryable units of orchestration work.
//!
//! Each job re-reads its entity, checks the status it expects, and leaves the
//! entity in `error` with a recorded reason once its retries are spent.

pub mod cleanup;
pub mod delete;
pub mod deploy;
pub mod manage;
pub mod metrics;
pub mod relocate;
pub mod rename;
pub mod server;

use std::fmt;
use std::time::Duration;

use nr_db::models::{Domain, InstanceStatus, NewDomain, Server};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Error, Result, Services};

/// Closed set of jobs the queue can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    Deploy {
        instance_id: Uuid,
        actor_id: Option<Uuid>,
    },
    Delete {
        instance_id: Uuid,
        actor_id: Option<Uuid>,
    },
    Move {
        instance_id: Uuid,
        target_server_id: Uuid,
        actor_id: Option<Uuid>,
    },
    Manage {
        instance_id: Uuid,
        action: ManageAction,
        actor_id: Option<Uuid>,
    },
    Rename {
        instance_id: Uuid,
        subdomain: String,
        actor_id: Option<Uuid>,
    },
    SyncUsers {
        instance_id: Uuid,
        actor_id: Option<Uuid>,
    },
    /// All active servers when `server_id` is `None`.
    SyncMetrics { server_id: Option<Uuid> },
    BootstrapServer {
        server_id: Uuid,
        actor_id: Option<Uuid>,
    },
    DeleteServer {
        server_id: Uuid,
        actor_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManageAction {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for ManageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        })
    }
}

/// Per-execution bookkeeping carried alongside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Stable across retries and reschedules of one dispatch.
    pub execution_id: Uuid,
    /// 1-based failure-retry counter.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Reschedules spent waiting on something external, e.g. a booting server.
    pub waits: u32,
}

impl JobContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            attempt: 1,
            max_attempts,
            waits: 0,
        }
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Run again after the delay without spending a retry.
    Reschedule(Duration),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deploy { .. } => "deploy",
            Self::Delete { .. } => "delete",
            Self::Move { .. } => "move",
            Self::Manage { .. } => "manage",
            Self::Rename { .. } => "rename",
            Self::SyncUsers { .. } => "sync_users",
            Self::SyncMetrics { .. } => "sync_metrics",
            Self::BootstrapServer { .. } => "bootstrap_server",
            Self::DeleteServer { .. } => "delete_server",
        }
    }

    /// Who asked for this job, for the audit trail.
    pub fn actor_id(&self) -> Option<Uuid> {
        match self {
            Self::Deploy { actor_id, .. }
            | Self::Delete { actor_id, .. }
            | Self::Move { actor_id, .. }
            | Self::Manage { actor_id, .. }
            | Self::Rename { actor_id, .. }
            | Self::SyncUsers { actor_id, .. }
            | Self::BootstrapServer { actor_id, .. }
            | Self::DeleteServer { actor_id, .. } => *actor_id,
            Self::SyncMetrics { .. } => None,
        }
    }

    pub async fn run(&self, svc: &Services, ctx: &JobContext) -> Result<JobOutcome> {
        if ctx.attempt == 1 && ctx.waits == 0 {
            info!(
                job = self.name(),
                execution_id = %ctx.execution_id,
                actor_id = ?self.actor_id(),
                "job started"
            );
        }
        match self {
            Self::Deploy { instance_id, .. } => deploy::run(svc, ctx, *instance_id).await,
            Self::Delete { instance_id, .. } => delete::run(svc, *instance_id).await,
            Self::Move {
                instance_id,
                target_server_id,
                ..
            } => relocate::run(svc, *instance_id, *target_server_id).await,
            Self::Manage {
                instance_id,
                action,
                ..
            } => manage::run(svc, *instance_id, *action).await,
            Self::Rename {
                instance_id,
                subdomain,
                ..
            } => rename::run(svc, *instance_id, subdomain).await,
            Self::SyncUsers { instance_id, .. } => manage::sync_users(svc, *instance_id).await,
            Self::SyncMetrics { server_id } => metrics::run(svc, *server_id).await,
            Self::BootstrapServer { server_id, .. } => server::bootstrap(svc, *server_id).await,
            Self::DeleteServer { server_id, .. } => server::delete(svc, *server_id).await,
        }
    }

    /// Runs once after the last attempt failed or the error was permanent.
    ///
    /// A refused precondition left the entity untouched, so only deploy (whose
    /// instance is already `deploying`) records it as an error.
    pub async fn failed(&self, svc: &Services, error: &Error) {
        let refused = matches!(error, Error::Precondition(_));
        let result = match self {
            Self::Deploy { instance_id, .. } => deploy::failed(svc, *instance_id, error).await,
            _ if refused => {
                info!(job = self.name(), error = %error, "job refused, state left unchanged");
                Ok(())
            }
            Self::Delete { instance_id, .. }
            | Self::Move { instance_id, .. }
            | Self::Manage { instance_id, .. }
            | Self::Rename { instance_id, .. }
            | Self::SyncUsers { instance_id, .. } => mark_instance_error(svc, *instance_id).await,
            Self::BootstrapServer { server_id, .. } => server::mark_error(svc, *server_id).await,
            Self::DeleteServer { server_id, .. } => server::delete_failed(svc, *server_id).await,
            Self::SyncMetrics { .. } => Ok(()),
        };
        if let Err(e) = result {
            warn!(job = self.name(), error = %e, "failure handler could not record state");
        }
    }
}

/// Shallow merge of two JSON objects; keys in `extra` win.
pub(crate) fn merge_metadata(base: &Value, extra: &Value) -> Value {
    match (base.as_object(), extra.as_object()) {
        (Some(base), Some(fields)) => {
            let mut merged = base.clone();
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => extra.clone(),
    }
}

pub(crate) fn public_ip(server: &Server) -> Result<&str> {
    server.public_ip.as_deref().ok_or_else(|| {
        Error::Precondition(format!("server {} has no public address", server.name))
    })
}

/// Point `subdomain` at `ip` and remember the record on the instance's domain row.
pub(crate) async fn publish_dns(
    svc: &Services,
    instance_id: Uuid,
    subdomain: &str,
    ip: &str,
) -> Result<Domain> {
    let record = svc
        .dns
        .ensure_a_record(subdomain, ip, svc.config.dns_proxied)
        .await?;
    let domain = svc
        .store
        .upsert_domain(&NewDomain {
            instance_id,
            hostname: subdomain.to_string(),
            fqdn: svc.dns.fqdn(subdomain),
            dns_provider: svc.dns.name().to_string(),
            provider_record_id: Some(record.id),
        })
        .await?;
    info!(instance_id = %instance_id, fqdn = %domain.fqdn, ip, "dns: published");
    Ok(domain)
}

async fn mark_instance_error(svc: &Services, instance_id: Uuid) -> Result<()> {
    match svc
        .store
        .set_instance_status(instance_id, InstanceStatus::Error)
        .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        other => Ok(other?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_serialize_with_type_tag() {
        let id = Uuid::nil();
        let job = Job::Manage {
            instance_id: id,
            action: ManageAction::Restart,
            actor_id: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "manage");
        assert_eq!(value["action"], "restart");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn metadata_merge_overrides_keys() {
        let merged = merge_metadata(
            &serde_json::json!({"execution_id": "x", "attempt": 1}),
            &serde_json::json!({"attempt": 2, "last_error": "boom"}),
        );
        assert_eq!(merged, serde_json::json!({"execution_id": "x", "attempt": 2, "last_error": "boom"}));
    }

    #[test]
    fn final_attempt_is_the_last_allowed() {
        let mut ctx = JobContext::new(3);
        assert!(!ctx.is_final_attempt());
        ctx.attempt = 3;
        assert!(ctx.is_final_attempt());
    }
}
