use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    Deployment, DeploymentOutcome, Domain, Instance, InstanceMetrics, InstanceStatus, InstanceUser,
    NewDomain, NewInstance, NewPlan, NewServer, Plan, Server, ServerStatus,
};
use crate::{Error, Result};

/// Persistence seam used by the orchestration engine.
///
/// `PgStore` is the production backend; `MemoryStore` keeps everything in
/// process for local runs and tests.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Plans
    async fn insert_plan(&self, plan: &NewPlan) -> Result<Plan>;
    async fn get_plan(&self, id: Uuid) -> Result<Plan>;

    // Servers
    async fn insert_server(&self, server: &NewServer) -> Result<Server>;
    async fn get_server(&self, id: Uuid) -> Result<Server>;
    async fn list_servers(&self) -> Result<Vec<Server>>;
    async fn list_servers_by_status(&self, status: ServerStatus) -> Result<Vec<Server>>;
    /// `None` leaves the stored address unchanged.
    async fn update_server_addresses(
        &self,
        id: Uuid,
        public_ip: Option<&str>,
        private_ip: Option<&str>,
    ) -> Result<()>;
    async fn set_server_status(&self, id: Uuid, status: ServerStatus) -> Result<()>;
    async fn mark_server_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    /// Atomic delta on the used counters, clamped at zero.
    async fn adjust_server_usage(&self, id: Uuid, memory_delta_mb: i32, disk_delta_gb: i32)
    -> Result<()>;
    async fn set_server_usage(&self, id: Uuid, memory_mb: i32, disk_gb: i32) -> Result<()>;
    async fn delete_server(&self, id: Uuid) -> Result<()>;

    // Instances
    async fn insert_instance(&self, instance: &NewInstance) -> Result<Instance>;
    async fn get_instance(&self, id: Uuid) -> Result<Instance>;
    async fn find_instance_by_subdomain(&self, subdomain: &str) -> Result<Option<Instance>>;
    async fn list_instances_on_server(&self, server_id: Uuid) -> Result<Vec<Instance>>;
    async fn set_instance_status(&self, id: Uuid, status: InstanceStatus) -> Result<()>;
    async fn assign_instance_server(&self, id: Uuid, server_id: Option<Uuid>) -> Result<()>;
    /// Store the secret only if none exists yet; returns whichever secret is stored.
    async fn init_instance_secret(&self, id: Uuid, secret: &str) -> Result<String>;
    async fn set_instance_capacity_counted(&self, id: Uuid, counted: bool) -> Result<()>;
    async fn mark_instance_deployed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn rename_instance(&self, id: Uuid, subdomain: &str, fqdn: &str) -> Result<()>;
    async fn delete_instance(&self, id: Uuid) -> Result<()>;

    // Instance users
    async fn insert_instance_user(
        &self,
        instance_id: Uuid,
        username: &str,
        password_hash: &str,
        permissions: &str,
    ) -> Result<InstanceUser>;
    async fn list_instance_users(&self, instance_id: Uuid) -> Result<Vec<InstanceUser>>;
    async fn delete_instance_users(&self, instance_id: Uuid) -> Result<()>;

    // Deployments
    async fn insert_deployment(
        &self,
        instance_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<Deployment>;
    async fn latest_deployment(&self, instance_id: Uuid) -> Result<Option<Deployment>>;
    async fn restart_deployment(&self, id: Uuid, metadata: &serde_json::Value) -> Result<Deployment>;
    async fn note_deployment_failure(
        &self,
        id: Uuid,
        reason: &str,
        metadata: &serde_json::Value,
    ) -> Result<()>;
    async fn complete_deployment(&self, id: Uuid, outcome: &DeploymentOutcome) -> Result<()>;
    async fn delete_deployments(&self, instance_id: Uuid) -> Result<()>;

    // Domains
    async fn get_domain(&self, instance_id: Uuid) -> Result<Option<Domain>>;
    async fn upsert_domain(&self, domain: &NewDomain) -> Result<Domain>;
    async fn delete_domain(&self, instance_id: Uuid) -> Result<()>;

    // Metrics
    async fn record_metrics(&self, sample: &InstanceMetrics) -> Result<()>;
    async fn get_metrics(&self, instance_id: Uuid) -> Result<Option<InstanceMetrics>>;
    async fn delete_metrics(&self, instance_id: Uuid) -> Result<()>;
}

/// Postgres-backed store delegating to the model queries.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn found<T>(entity: &'static str, id: Uuid, res: sqlx::Result<T>) -> Result<T> {
    res.map_err(|e| match e {
        sqlx::Error::RowNotFound => Error::NotFound { entity, id },
        other => Error::Database(other),
    })
}

fn unique<T>(res: sqlx::Result<T>, what: &str) -> Result<T> {
    res.map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            Error::Conflict(format!("{what} already exists"))
        }
        other => Error::Database(other),
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert_plan(&self, plan: &NewPlan) -> Result<Plan> {
        unique(Plan::insert(&self.pool, plan).await, "plan")
    }

    async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        found("plan", id, Plan::get_by_id(&self.pool, id).await)
    }

    async fn insert_server(&self, server: &NewServer) -> Result<Server> {
        unique(Server::insert(&self.pool, server).await, "server")
    }

    async fn get_server(&self, id: Uuid) -> Result<Server> {
        found("server", id, Server::get_by_id(&self.pool, id).await)
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(Server::list(&self.pool).await?)
    }

    async fn list_servers_by_status(&self, status: ServerStatus) -> Result<Vec<Server>> {
        Ok(Server::list_by_status(&self.pool, status).await?)
    }

    async fn update_server_addresses(
        &self,
        id: Uuid,
        public_ip: Option<&str>,
        private_ip: Option<&str>,
    ) -> Result<()> {
        Ok(Server::update_addresses(&self.pool, id, public_ip, private_ip).await?)
    }

    async fn set_server_status(&self, id: Uuid, status: ServerStatus) -> Result<()> {
        Ok(Server::set_status(&self.pool, id, status).await?)
    }

    async fn mark_server_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        Ok(Server::mark_provisioned(&self.pool, id, at).await?)
    }

    async fn adjust_server_usage(
        &self,
        id: Uuid,
        memory_delta_mb: i32,
        disk_delta_gb: i32,
    ) -> Result<()> {
        Ok(Server::adjust_usage(&self.pool, id, memory_delta_mb, disk_delta_gb).await?)
    }

    async fn set_server_usage(&self, id: Uuid, memory_mb: i32, disk_gb: i32) -> Result<()> {
        Ok(Server::set_usage(&self.pool, id, memory_mb, disk_gb).await?)
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        Ok(Server::delete(&self.pool, id).await?)
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<Instance> {
        unique(
            Instance::insert(&self.pool, instance).await,
            &format!("instance {}", instance.subdomain),
        )
    }

    async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        found("instance", id, Instance::get_by_id(&self.pool, id).await)
    }

    async fn find_instance_by_subdomain(&self, subdomain: &str) -> Result<Option<Instance>> {
        Ok(Instance::find_by_subdomain(&self.pool, subdomain).await?)
    }

    async fn list_instances_on_server(&self, server_id: Uuid) -> Result<Vec<Instance>> {
        Ok(Instance::list_for_server(&self.pool, server_id).await?)
    }

    async fn set_instance_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        Ok(Instance::set_status(&self.pool, id, status).await?)
    }

    async fn assign_instance_server(&self, id: Uuid, server_id: Option<Uuid>) -> Result<()> {
        Ok(Instance::assign_server(&self.pool, id, server_id).await?)
    }

    async fn init_instance_secret(&self, id: Uuid, secret: &str) -> Result<String> {
        found("instance", id, Instance::init_secret(&self.pool, id, secret).await)
    }

    async fn set_instance_capacity_counted(&self, id: Uuid, counted: bool) -> Result<()> {
        Ok(Instance::set_capacity_counted(&self.pool, id, counted).await?)
    }

    async fn mark_instance_deployed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        Ok(Instance::mark_deployed(&self.pool, id, at).await?)
    }

    async fn rename_instance(&self, id: Uuid, subdomain: &str, fqdn: &str) -> Result<()> {
        unique(
            Instance::rename(&self.pool, id, subdomain, fqdn).await,
            &format!("subdomain {subdomain}"),
        )
    }

    async fn delete_instance(&self, id: Uuid) -> Result<()> {
        Ok(Instance::delete(&self.pool, id).await?)
    }

    async fn insert_instance_user(
        &self,
        instance_id: Uuid,
        username: &str,
        password_hash: &str,
        permissions: &str,
    ) -> Result<InstanceUser> {
        unique(
            InstanceUser::insert(&self.pool, instance_id, username, password_hash, permissions)
                .await,
            &format!("user {username}"),
        )
    }

    async fn list_instance_users(&self, instance_id: Uuid) -> Result<Vec<InstanceUser>> {
        Ok(InstanceUser::list_for_instance(&self.pool, instance_id).await?)
    }

    async fn delete_instance_users(&self, instance_id: Uuid) -> Result<()> {
        Ok(InstanceUser::delete_for_instance(&self.pool, instance_id).await?)
    }

    async fn insert_deployment(
        &self,
        instance_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<Deployment> {
        Ok(Deployment::insert(&self.pool, instance_id, metadata).await?)
    }

    async fn latest_deployment(&self, instance_id: Uuid) -> Result<Option<Deployment>> {
        Ok(Deployment::latest_for_instance(&self.pool, instance_id).await?)
    }

    async fn restart_deployment(&self, id: Uuid, metadata: &serde_json::Value) -> Result<Deployment> {
        found("deployment", id, Deployment::restart(&self.pool, id, metadata).await)
    }

    async fn note_deployment_failure(
        &self,
        id: Uuid,
        reason: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        Ok(Deployment::note_failure(&self.pool, id, reason, metadata).await?)
    }

    async fn complete_deployment(&self, id: Uuid, outcome: &DeploymentOutcome) -> Result<()> {
        Ok(Deployment::complete(&self.pool, id, outcome).await?)
    }

    async fn delete_deployments(&self, instance_id: Uuid) -> Result<()> {
        Ok(Deployment::delete_for_instance(&self.pool, instance_id).await?)
    }

    async fn get_domain(&self, instance_id: Uuid) -> Result<Option<Domain>> {
        Ok(Domain::get_for_instance(&self.pool, instance_id).await?)
    }

    async fn upsert_domain(&self, domain: &NewDomain) -> Result<Domain> {
        Ok(Domain::upsert(&self.pool, domain).await?)
    }

    async fn delete_domain(&self, instance_id: Uuid) -> Result<()> {
        Ok(Domain::delete_for_instance(&self.pool, instance_id).await?)
    }

    async fn record_metrics(&self, sample: &InstanceMetrics) -> Result<()> {
        Ok(InstanceMetrics::upsert(&self.pool, sample).await?)
    }

    async fn get_metrics(&self, instance_id: Uuid) -> Result<Option<InstanceMetrics>> {
        Ok(InstanceMetrics::get_for_instance(&self.pool, instance_id).await?)
    }

    async fn delete_metrics(&self, instance_id: Uuid) -> Result<()> {
        Ok(InstanceMetrics::delete_for_instance(&self.pool, instance_id).await?)
    }
}
