use chrono::{DateTime, Utc};
use nr_db::models::{
    Deployment, DeploymentState, Domain, Instance, InstanceMetrics, InstanceStatus, Plan, Server,
    ServerStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    #[serde(default)]
    pub price_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub slug: String,
    /// Defaults to the slug.
    pub subdomain: Option<String>,
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    /// bcrypt hash as Node-RED expects it; plaintext is never accepted.
    pub admin_password_hash: String,
    /// Pin to a server instead of letting the planner choose.
    pub server_id: Option<Uuid>,
}

fn default_admin_user() -> String {
    "admin".into()
}

#[derive(Debug, Deserialize)]
pub struct MoveInstanceRequest {
    pub target_server_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RenameInstanceRequest {
    pub subdomain: String,
}

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub username: String,
    pub password_hash: String,
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

fn default_permissions() -> String {
    "read".into()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub name: String,
    pub public_ip: String,
    pub private_ip: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_server_type")]
    pub server_type: String,
    pub total_memory_mb: i32,
    pub total_disk_gb: i32,
}

fn default_region() -> String {
    "self-hosted".into()
}

fn default_server_type() -> String {
    "custom".into()
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncMetricsRequest {
    pub server_id: Option<Uuid>,
}

// ── Responses ──────────────────────────────────────────────────────

/// Returned by every endpoint that only queues work.
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job: &'static str,
    pub execution_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct InstanceCreated {
    pub instance: InstanceResponse,
    pub execution_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub id: Uuid,
    pub name: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    pub price_cents: i64,
}

impl From<Plan> for PlanResponse {
    fn from(p: Plan) -> Self {
        Self {
            id: p.id,
            name: p.name,
            memory_mb: p.memory_mb,
            storage_gb: p.storage_gb,
            cpu_millicores: p.cpu_millicores,
            price_cents: p.price_cents,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub slug: String,
    pub subdomain: String,
    pub url: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    pub status: InstanceStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    pub domain: Option<DomainResponse>,
    pub last_deployment: Option<DeploymentResponse>,
    pub metrics: Option<MetricsResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceResponse {
    pub fn new(
        instance: Instance,
        domain: Option<Domain>,
        deployment: Option<Deployment>,
        metrics: Option<InstanceMetrics>,
    ) -> Self {
        Self {
            id: instance.id,
            user_id: instance.user_id,
            server_id: instance.server_id,
            plan_id: instance.plan_id,
            url: format!("https://{}", instance.fqdn),
            slug: instance.slug,
            subdomain: instance.subdomain,
            memory_mb: instance.memory_mb,
            storage_gb: instance.storage_gb,
            cpu_millicores: instance.cpu_millicores,
            status: instance.status,
            deployed_at: instance.deployed_at,
            domain: domain.map(DomainResponse::from),
            last_deployment: deployment.map(DeploymentResponse::from),
            metrics: metrics.map(MetricsResponse::from),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DomainResponse {
    pub fqdn: String,
    pub dns_provider: String,
    pub provider_record_id: Option<String>,
}

impl From<Domain> for DomainResponse {
    fn from(d: Domain) -> Self {
        Self {
            fqdn: d.fqdn,
            dns_provider: d.dns_provider,
            provider_record_id: d.provider_record_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: Uuid,
    pub state: DeploymentState,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Deployment> for DeploymentResponse {
    fn from(d: Deployment) -> Self {
        Self {
            id: d.id,
            state: d.state,
            reason: d.reason,
            started_at: d.started_at,
            completed_at: d.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub cpu_percent: f64,
    pub memory_used_mb: i32,
    pub memory_limit_mb: i32,
    pub sampled_at: DateTime<Utc>,
}

impl From<InstanceMetrics> for MetricsResponse {
    fn from(m: InstanceMetrics) -> Self {
        Self {
            cpu_percent: m.cpu_percent,
            memory_used_mb: m.memory_used_mb,
            memory_limit_mb: m.memory_limit_mb,
            sampled_at: m.sampled_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub id: Uuid,
    pub provider_id: Option<String>,
    pub name: String,
    pub public_ip: Option<String>,
    pub region: String,
    pub server_type: String,
    pub status: ServerStatus,
    pub total_memory_mb: i32,
    pub used_memory_mb: i32,
    pub available_memory_mb: i32,
    pub total_disk_gb: i32,
    pub used_disk_gb: i32,
    pub available_disk_gb: i32,
    pub created_at: DateTime<Utc>,
}

impl ServerResponse {
    pub fn new(s: Server, reserved_memory_mb: i32, reserved_disk_gb: i32) -> Self {
        Self {
            available_memory_mb: s.available_memory_mb(reserved_memory_mb),
            available_disk_gb: s.available_disk_gb(reserved_disk_gb),
            id: s.id,
            provider_id: s.provider_id,
            name: s.name,
            public_ip: s.public_ip,
            region: s.region,
            server_type: s.server_type,
            status: s.status,
            total_memory_mb: s.total_memory_mb,
            used_memory_mb: s.used_memory_mb,
            total_disk_gb: s.total_disk_gb,
            used_disk_gb: s.used_disk_gb,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub instance_id: Uuid,
    pub lines: u32,
    pub logs: String,
}
