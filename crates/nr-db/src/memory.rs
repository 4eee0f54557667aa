use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Deployment, DeploymentOutcome, DeploymentState, Domain, Instance, InstanceMetrics,
    InstanceStatus, InstanceUser, NewDomain, NewInstance, NewPlan, NewServer, Plan, Server,
    ServerStatus, TlsStatus,
};
use crate::store::Store;
use crate::{Error, Result};

#[derive(Default)]
struct Tables {
    plans: HashMap<Uuid, Plan>,
    servers: HashMap<Uuid, Server>,
    instances: HashMap<Uuid, Instance>,
    users: Vec<InstanceUser>,
    // Insertion order doubles as creation order.
    deployments: Vec<Deployment>,
    domains: HashMap<Uuid, Domain>,
    metrics: HashMap<Uuid, InstanceMetrics>,
}

/// In-process store with the same semantics as `PgStore`.
///
/// Used for the no-provisioning local mode and throughout the engine tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn server_mut<'a>(t: &'a mut Tables, id: Uuid) -> Result<&'a mut Server> {
    t.servers.get_mut(&id).ok_or(Error::NotFound { entity: "server", id })
}

fn instance_mut<'a>(t: &'a mut Tables, id: Uuid) -> Result<&'a mut Instance> {
    t.instances.get_mut(&id).ok_or(Error::NotFound { entity: "instance", id })
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_plan(&self, plan: &NewPlan) -> Result<Plan> {
        let now = Utc::now();
        let row = Plan {
            id: Uuid::new_v4(),
            name: plan.name.clone(),
            memory_mb: plan.memory_mb,
            storage_gb: plan.storage_gb,
            cpu_millicores: plan.cpu_millicores,
            price_cents: plan.price_cents,
            created_at: now,
            updated_at: now,
        };
        let mut t = self.tables();
        if t.plans.values().any(|p| p.name == plan.name) {
            return Err(Error::Conflict(format!("plan {} already exists", plan.name)));
        }
        t.plans.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.tables()
            .plans
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { entity: "plan", id })
    }

    async fn insert_server(&self, server: &NewServer) -> Result<Server> {
        let now = Utc::now();
        let row = Server {
            id: Uuid::new_v4(),
            provider_id: server.provider_id.clone(),
            name: server.name.clone(),
            public_ip: server.public_ip.clone(),
            private_ip: server.private_ip.clone(),
            region: server.region.clone(),
            server_type: server.server_type.clone(),
            total_memory_mb: server.total_memory_mb,
            used_memory_mb: 0,
            total_disk_gb: server.total_disk_gb,
            used_disk_gb: 0,
            status: server.status,
            provisioned_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut t = self.tables();
        if t.servers.values().any(|s| s.name == server.name) {
            return Err(Error::Conflict(format!("server {} already exists", server.name)));
        }
        t.servers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_server(&self, id: Uuid) -> Result<Server> {
        self.tables()
            .servers
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { entity: "server", id })
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let mut servers: Vec<Server> = self.tables().servers.values().cloned().collect();
        servers.sort_by_key(|s| s.created_at);
        Ok(servers)
    }

    async fn list_servers_by_status(&self, status: ServerStatus) -> Result<Vec<Server>> {
        let mut servers: Vec<Server> = self
            .tables()
            .servers
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        servers.sort_by_key(|s| s.created_at);
        Ok(servers)
    }

    async fn update_server_addresses(
        &self,
        id: Uuid,
        public_ip: Option<&str>,
        private_ip: Option<&str>,
    ) -> Result<()> {
        let mut t = self.tables();
        let server = server_mut(&mut t, id)?;
        if let Some(ip) = public_ip {
            server.public_ip = Some(ip.to_string());
        }
        if let Some(ip) = private_ip {
            server.private_ip = Some(ip.to_string());
        }
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn set_server_status(&self, id: Uuid, status: ServerStatus) -> Result<()> {
        let mut t = self.tables();
        let server = server_mut(&mut t, id)?;
        server.status = status;
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_server_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables();
        server_mut(&mut t, id)?.provisioned_at = Some(at);
        Ok(())
    }

    async fn adjust_server_usage(
        &self,
        id: Uuid,
        memory_delta_mb: i32,
        disk_delta_gb: i32,
    ) -> Result<()> {
        let mut t = self.tables();
        let server = server_mut(&mut t, id)?;
        server.used_memory_mb = (server.used_memory_mb + memory_delta_mb).max(0);
        server.used_disk_gb = (server.used_disk_gb + disk_delta_gb).max(0);
        Ok(())
    }

    async fn set_server_usage(&self, id: Uuid, memory_mb: i32, disk_gb: i32) -> Result<()> {
        let mut t = self.tables();
        let server = server_mut(&mut t, id)?;
        server.used_memory_mb = memory_mb;
        server.used_disk_gb = disk_gb;
        Ok(())
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        let mut t = self.tables();
        if t.instances.values().any(|i| i.server_id == Some(id)) {
            return Err(Error::Conflict(format!("server {id} still owns instances")));
        }
        t.servers.remove(&id);
        Ok(())
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<Instance> {
        let mut t = self.tables();
        if let Some(taken) = t.instances.values().find(|i| {
            i.slug == instance.slug || i.subdomain == instance.subdomain || i.fqdn == instance.fqdn
        }) {
            return Err(Error::Conflict(format!(
                "instance {} already exists",
                taken.subdomain
            )));
        }
        let now = Utc::now();
        let row = Instance {
            id: Uuid::new_v4(),
            user_id: instance.user_id,
            server_id: instance.server_id,
            plan_id: instance.plan_id,
            slug: instance.slug.clone(),
            subdomain: instance.subdomain.clone(),
            fqdn: instance.fqdn.clone(),
            memory_mb: instance.memory_mb,
            storage_gb: instance.storage_gb,
            cpu_millicores: instance.cpu_millicores,
            admin_user: instance.admin_user.clone(),
            admin_password_hash: instance.admin_password_hash.clone(),
            credential_secret: None,
            capacity_counted: false,
            status: InstanceStatus::Pending,
            deployed_at: None,
            created_at: now,
            updated_at: now,
        };
        t.instances.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.tables()
            .instances
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { entity: "instance", id })
    }

    async fn find_instance_by_subdomain(&self, subdomain: &str) -> Result<Option<Instance>> {
        Ok(self
            .tables()
            .instances
            .values()
            .find(|i| i.subdomain == subdomain)
            .cloned())
    }

    async fn list_instances_on_server(&self, server_id: Uuid) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .tables()
            .instances
            .values()
            .filter(|i| i.server_id == Some(server_id))
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn set_instance_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        let mut t = self.tables();
        let instance = instance_mut(&mut t, id)?;
        instance.status = status;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn assign_instance_server(&self, id: Uuid, server_id: Option<Uuid>) -> Result<()> {
        let mut t = self.tables();
        instance_mut(&mut t, id)?.server_id = server_id;
        Ok(())
    }

    async fn init_instance_secret(&self, id: Uuid, secret: &str) -> Result<String> {
        let mut t = self.tables();
        let instance = instance_mut(&mut t, id)?;
        Ok(instance
            .credential_secret
            .get_or_insert_with(|| secret.to_string())
            .clone())
    }

    async fn set_instance_capacity_counted(&self, id: Uuid, counted: bool) -> Result<()> {
        let mut t = self.tables();
        instance_mut(&mut t, id)?.capacity_counted = counted;
        Ok(())
    }

    async fn mark_instance_deployed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables();
        let instance = instance_mut(&mut t, id)?;
        instance.status = InstanceStatus::Active;
        instance.deployed_at = Some(at);
        Ok(())
    }

    async fn rename_instance(&self, id: Uuid, subdomain: &str, fqdn: &str) -> Result<()> {
        let mut t = self.tables();
        if t
            .instances
            .values()
            .any(|i| i.id != id && (i.subdomain == subdomain || i.fqdn == fqdn))
        {
            return Err(Error::Conflict(format!("subdomain {subdomain} already exists")));
        }
        let instance = instance_mut(&mut t, id)?;
        instance.subdomain = subdomain.to_string();
        instance.fqdn = fqdn.to_string();
        Ok(())
    }

    async fn delete_instance(&self, id: Uuid) -> Result<()> {
        let mut t = self.tables();
        t.instances.remove(&id);
        t.users.retain(|u| u.instance_id != id);
        t.deployments.retain(|d| d.instance_id != id);
        t.domains.remove(&id);
        t.metrics.remove(&id);
        Ok(())
    }

    async fn insert_instance_user(
        &self,
        instance_id: Uuid,
        username: &str,
        password_hash: &str,
        permissions: &str,
    ) -> Result<InstanceUser> {
        let mut t = self.tables();
        if t
            .users
            .iter()
            .any(|u| u.instance_id == instance_id && u.username == username)
        {
            return Err(Error::Conflict(format!("user {username} already exists")));
        }
        let row = InstanceUser {
            id: Uuid::new_v4(),
            instance_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            permissions: permissions.to_string(),
            created_at: Utc::now(),
        };
        t.users.push(row.clone());
        Ok(row)
    }

    async fn list_instance_users(&self, instance_id: Uuid) -> Result<Vec<InstanceUser>> {
        let mut users: Vec<InstanceUser> = self
            .tables()
            .users
            .iter()
            .filter(|u| u.instance_id == instance_id)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn delete_instance_users(&self, instance_id: Uuid) -> Result<()> {
        self.tables().users.retain(|u| u.instance_id != instance_id);
        Ok(())
    }

    async fn insert_deployment(
        &self,
        instance_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<Deployment> {
        let now = Utc::now();
        let row = Deployment {
            id: Uuid::new_v4(),
            instance_id,
            state: DeploymentState::Deploying,
            reason: None,
            logs: None,
            metadata: metadata.clone(),
            started_at: now,
            completed_at: None,
            created_at: now,
        };
        self.tables().deployments.push(row.clone());
        Ok(row)
    }

    async fn latest_deployment(&self, instance_id: Uuid) -> Result<Option<Deployment>> {
        Ok(self
            .tables()
            .deployments
            .iter()
            .rev()
            .find(|d| d.instance_id == instance_id)
            .cloned())
    }

    async fn restart_deployment(&self, id: Uuid, metadata: &serde_json::Value) -> Result<Deployment> {
        let mut t = self.tables();
        let row = t
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::NotFound { entity: "deployment", id })?;
        row.state = DeploymentState::Deploying;
        row.started_at = Utc::now();
        row.completed_at = None;
        row.metadata = metadata.clone();
        Ok(row.clone())
    }

    async fn note_deployment_failure(
        &self,
        id: Uuid,
        reason: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let mut t = self.tables();
        let row = t
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::NotFound { entity: "deployment", id })?;
        row.reason = Some(reason.to_string());
        row.metadata = metadata.clone();
        Ok(())
    }

    async fn complete_deployment(&self, id: Uuid, outcome: &DeploymentOutcome) -> Result<()> {
        let mut t = self.tables();
        let row = t
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::NotFound { entity: "deployment", id })?;
        row.state = outcome.state;
        row.reason = outcome.reason.clone();
        if outcome.logs.is_some() {
            row.logs = outcome.logs.clone();
        }
        row.metadata = outcome.metadata.clone();
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn delete_deployments(&self, instance_id: Uuid) -> Result<()> {
        self.tables()
            .deployments
            .retain(|d| d.instance_id != instance_id);
        Ok(())
    }

    async fn get_domain(&self, instance_id: Uuid) -> Result<Option<Domain>> {
        Ok(self.tables().domains.get(&instance_id).cloned())
    }

    async fn upsert_domain(&self, domain: &NewDomain) -> Result<Domain> {
        let now = Utc::now();
        let mut t = self.tables();
        let row = t
            .domains
            .entry(domain.instance_id)
            .and_modify(|d| {
                d.hostname = domain.hostname.clone();
                d.fqdn = domain.fqdn.clone();
                d.dns_provider = domain.dns_provider.clone();
                d.provider_record_id = domain.provider_record_id.clone();
                d.updated_at = now;
            })
            .or_insert_with(|| Domain {
                id: Uuid::new_v4(),
                instance_id: domain.instance_id,
                hostname: domain.hostname.clone(),
                fqdn: domain.fqdn.clone(),
                dns_provider: domain.dns_provider.clone(),
                provider_record_id: domain.provider_record_id.clone(),
                tls_status: TlsStatus::Pending,
                issued_at: None,
                expires_at: None,
                created_at: now,
                updated_at: now,
            });
        Ok(row.clone())
    }

    async fn delete_domain(&self, instance_id: Uuid) -> Result<()> {
        self.tables().domains.remove(&instance_id);
        Ok(())
    }

    async fn record_metrics(&self, sample: &InstanceMetrics) -> Result<()> {
        self.tables()
            .metrics
            .insert(sample.instance_id, sample.clone());
        Ok(())
    }

    async fn get_metrics(&self, instance_id: Uuid) -> Result<Option<InstanceMetrics>> {
        Ok(self.tables().metrics.get(&instance_id).cloned())
    }

    async fn delete_metrics(&self, instance_id: Uuid) -> Result<()> {
        self.tables().metrics.remove(&instance_id);
        Ok(())
    }
}
