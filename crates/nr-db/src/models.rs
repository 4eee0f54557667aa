use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

// ── Plan ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub name: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    pub price_cents: i64,
}

impl Plan {
    pub async fn insert(pool: &PgPool, plan: &NewPlan) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO plans (name, memory_mb, storage_gb, cpu_millicores, price_cents)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(&plan.name)
        .bind(plan.memory_mb)
        .bind(plan.storage_gb)
        .bind(plan.cpu_millicores)
        .bind(plan.price_cents)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }
}

// ── Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "server_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Provisioning,
    Active,
    Error,
    Deleting,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Error => "error",
            Self::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub provider_id: Option<String>,
    pub name: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub region: String,
    pub server_type: String,
    pub total_memory_mb: i32,
    pub used_memory_mb: i32,
    pub total_disk_gb: i32,
    pub used_disk_gb: i32,
    pub status: ServerStatus,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub provider_id: Option<String>,
    pub name: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub region: String,
    pub server_type: String,
    pub total_memory_mb: i32,
    pub total_disk_gb: i32,
    pub status: ServerStatus,
}

impl Server {
    /// Memory left for new instances after the reserved margin, never negative.
    pub fn available_memory_mb(&self, reserved_mb: i32) -> i32 {
        (self.total_memory_mb - self.used_memory_mb - reserved_mb).max(0)
    }

    /// Disk left for new instances after the reserved margin, never negative.
    pub fn available_disk_gb(&self, reserved_gb: i32) -> i32 {
        (self.total_disk_gb - self.used_disk_gb - reserved_gb).max(0)
    }

    pub async fn insert(pool: &PgPool, server: &NewServer) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO servers (provider_id, name, public_ip, private_ip, region, server_type,
                                    total_memory_mb, total_disk_gb, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING *"#,
        )
        .bind(&server.provider_id)
        .bind(&server.name)
        .bind(&server.public_ip)
        .bind(&server.private_ip)
        .bind(&server.region)
        .bind(&server.server_type)
        .bind(server.total_memory_mb)
        .bind(server.total_disk_gb)
        .bind(server.status)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub async fn list(pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM servers ORDER BY created_at")
            .fetch_all(pool)
            .await
    }

    pub async fn list_by_status(pool: &PgPool, status: ServerStatus) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM servers WHERE status = $1 ORDER BY created_at")
            .bind(status)
            .fetch_all(pool)
            .await
    }

    pub async fn update_addresses(
        pool: &PgPool,
        id: Uuid,
        public_ip: Option<&str>,
        private_ip: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE servers
               SET public_ip  = COALESCE($1, public_ip),
                   private_ip = COALESCE($2, private_ip)
               WHERE id = $3"#,
        )
        .bind(public_ip)
        .bind(private_ip)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(pool: &PgPool, id: Uuid, status: ServerStatus) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_provisioned(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET provisioned_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Atomically shift the used counters by the given deltas, clamping at zero.
    pub async fn adjust_usage(
        pool: &PgPool,
        id: Uuid,
        memory_delta_mb: i32,
        disk_delta_gb: i32,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE servers
               SET used_memory_mb = GREATEST(used_memory_mb + $1, 0),
                   used_disk_gb   = GREATEST(used_disk_gb + $2, 0)
               WHERE id = $3"#,
        )
        .bind(memory_delta_mb)
        .bind(disk_delta_gb)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_usage(pool: &PgPool, id: Uuid, memory_mb: i32, disk_gb: i32) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET used_memory_mb = $1, used_disk_gb = $2 WHERE id = $3")
            .bind(memory_mb)
            .bind(disk_gb)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── Instance ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Deploying,
    Active,
    Stopped,
    Error,
    Deleting,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleting => "deleting",
        }
    }

    /// Whether a deploy attempt may run from this status.
    pub fn is_deployable(&self) -> bool {
        match self {
            Self::Pending | Self::Deploying | Self::Error => true,
            Self::Active | Self::Stopped | Self::Deleting => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub server_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub slug: String,
    pub subdomain: String,
    pub fqdn: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    pub admin_user: String,
    #[serde(skip_serializing)]
    pub admin_password_hash: String,
    #[serde(skip_serializing)]
    pub credential_secret: Option<String>,
    /// Set once this instance's allocation has been added to its server's counters.
    pub capacity_counted: bool,
    pub status: InstanceStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Instance row to insert. Allocation is copied from the plan by the caller.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub user_id: Uuid,
    pub server_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub slug: String,
    pub subdomain: String,
    pub fqdn: String,
    pub memory_mb: i32,
    pub storage_gb: i32,
    pub cpu_millicores: i32,
    pub admin_user: String,
    pub admin_password_hash: String,
}

impl NewInstance {
    pub fn from_plan(
        plan: &Plan,
        user_id: Uuid,
        slug: String,
        subdomain: String,
        fqdn: String,
        admin_user: String,
        admin_password_hash: String,
    ) -> Self {
        Self {
            user_id,
            server_id: None,
            plan_id: plan.id,
            slug,
            subdomain,
            fqdn,
            memory_mb: plan.memory_mb,
            storage_gb: plan.storage_gb,
            cpu_millicores: plan.cpu_millicores,
            admin_user,
            admin_password_hash,
        }
    }
}

impl Instance {
    /// Random secret the container uses to encrypt stored credentials.
    pub fn generate_secret() -> String {
        use rand::Rng;
        let bytes: [u8; 32] = rand::rng().random();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Name of the container on its server.
    pub fn container_name(&self) -> String {
        format!("nr-{}", self.slug)
    }

    pub async fn insert(pool: &PgPool, instance: &NewInstance) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO instances (user_id, server_id, plan_id, slug, subdomain, fqdn,
                                      memory_mb, storage_gb, cpu_millicores, admin_user, admin_password_hash)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               RETURNING *"#,
        )
        .bind(instance.user_id)
        .bind(instance.server_id)
        .bind(instance.plan_id)
        .bind(&instance.slug)
        .bind(&instance.subdomain)
        .bind(&instance.fqdn)
        .bind(instance.memory_mb)
        .bind(instance.storage_gb)
        .bind(instance.cpu_millicores)
        .bind(&instance.admin_user)
        .bind(&instance.admin_password_hash)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_subdomain(pool: &PgPool, subdomain: &str) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM instances WHERE subdomain = $1")
            .bind(subdomain)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_server(pool: &PgPool, server_id: Uuid) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM instances WHERE server_id = $1 ORDER BY created_at")
            .bind(server_id)
            .fetch_all(pool)
            .await
    }

    pub async fn set_status(pool: &PgPool, id: Uuid, status: InstanceStatus) -> sqlx::Result<()> {
        sqlx::query("UPDATE instances SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn assign_server(pool: &PgPool, id: Uuid, server_id: Option<Uuid>) -> sqlx::Result<()> {
        sqlx::query("UPDATE instances SET server_id = $1 WHERE id = $2")
            .bind(server_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Store the credential secret unless one is already set. Returns the stored value.
    pub async fn init_secret(pool: &PgPool, id: Uuid, secret: &str) -> sqlx::Result<String> {
        let (stored,): (Option<String>,) = sqlx::query_as(
            r#"UPDATE instances
               SET credential_secret = COALESCE(credential_secret, $1)
               WHERE id = $2
               RETURNING credential_secret"#,
        )
        .bind(secret)
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(stored.unwrap_or_else(|| secret.to_string()))
    }

    pub async fn set_capacity_counted(pool: &PgPool, id: Uuid, counted: bool) -> sqlx::Result<()> {
        sqlx::query("UPDATE instances SET capacity_counted = $1 WHERE id = $2")
            .bind(counted)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_deployed(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> sqlx::Result<()> {
        sqlx::query("UPDATE instances SET status = 'active', deployed_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn rename(pool: &PgPool, id: Uuid, subdomain: &str, fqdn: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE instances SET subdomain = $1, fqdn = $2 WHERE id = $3")
            .bind(subdomain)
            .bind(fqdn)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── InstanceUser ────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InstanceUser {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Node-RED permission string, e.g. `*` or `read`.
    pub permissions: String,
    pub created_at: DateTime<Utc>,
}

impl InstanceUser {
    pub async fn insert(
        pool: &PgPool,
        instance_id: Uuid,
        username: &str,
        password_hash: &str,
        permissions: &str,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO instance_users (instance_id, username, password_hash, permissions)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(instance_id)
        .bind(username)
        .bind(password_hash)
        .bind(permissions)
        .fetch_one(pool)
        .await
    }

    pub async fn list_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM instance_users WHERE instance_id = $1 ORDER BY username")
            .bind(instance_id)
            .fetch_all(pool)
            .await
    }

    pub async fn delete_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM instance_users WHERE instance_id = $1")
            .bind(instance_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── Deployment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "deployment_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Deploying,
    Success,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub state: DeploymentState,
    pub reason: Option<String>,
    pub logs: Option<String>,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Terminal result written onto a deployment row.
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub state: DeploymentState,
    pub reason: Option<String>,
    pub logs: Option<String>,
    pub metadata: serde_json::Value,
}

impl Deployment {
    pub async fn insert(
        pool: &PgPool,
        instance_id: Uuid,
        metadata: &serde_json::Value,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO deployments (instance_id, metadata)
               VALUES ($1, $2)
               RETURNING *"#,
        )
        .bind(instance_id)
        .bind(metadata)
        .fetch_one(pool)
        .await
    }

    pub async fn latest_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as(
            "SELECT * FROM deployments WHERE instance_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(pool)
        .await
    }

    /// Put a row back into `deploying` for another attempt of the same execution.
    pub async fn restart(pool: &PgPool, id: Uuid, metadata: &serde_json::Value) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"UPDATE deployments
               SET state = 'deploying', started_at = now(), completed_at = NULL, metadata = $1
               WHERE id = $2
               RETURNING *"#,
        )
        .bind(metadata)
        .bind(id)
        .fetch_one(pool)
        .await
    }

    /// Record a failed attempt while the row stays `deploying`.
    pub async fn note_failure(
        pool: &PgPool,
        id: Uuid,
        reason: &str,
        metadata: &serde_json::Value,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE deployments SET reason = $1, metadata = $2 WHERE id = $3")
            .bind(reason)
            .bind(metadata)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn complete(pool: &PgPool, id: Uuid, outcome: &DeploymentOutcome) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE deployments
               SET state = $1, reason = $2, logs = COALESCE($3, logs), metadata = $4,
                   completed_at = now()
               WHERE id = $5"#,
        )
        .bind(outcome.state)
        .bind(&outcome.reason)
        .bind(&outcome.logs)
        .bind(&outcome.metadata)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM deployments WHERE instance_id = $1")
            .bind(instance_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── Domain ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "tls_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TlsStatus {
    Pending,
    Active,
    Error,
    Expired,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub hostname: String,
    pub fqdn: String,
    pub dns_provider: String,
    pub provider_record_id: Option<String>,
    pub tls_status: TlsStatus,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDomain {
    pub instance_id: Uuid,
    pub hostname: String,
    pub fqdn: String,
    pub dns_provider: String,
    pub provider_record_id: Option<String>,
}

impl Domain {
    /// Create or update the domain row keyed by instance id.
    pub async fn upsert(pool: &PgPool, domain: &NewDomain) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO domains (instance_id, hostname, fqdn, dns_provider, provider_record_id)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (instance_id)
               DO UPDATE SET hostname = EXCLUDED.hostname,
                             fqdn = EXCLUDED.fqdn,
                             dns_provider = EXCLUDED.dns_provider,
                             provider_record_id = EXCLUDED.provider_record_id
               RETURNING *"#,
        )
        .bind(domain.instance_id)
        .bind(&domain.hostname)
        .bind(&domain.fqdn)
        .bind(&domain.dns_provider)
        .bind(&domain.provider_record_id)
        .fetch_one(pool)
        .await
    }

    pub async fn get_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM domains WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn delete_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM domains WHERE instance_id = $1")
            .bind(instance_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── InstanceMetrics ─────────────────────────────────────────────────

/// Latest resource sample for one instance.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub instance_id: Uuid,
    pub cpu_percent: f64,
    pub memory_used_mb: i32,
    pub memory_limit_mb: i32,
    pub sampled_at: DateTime<Utc>,
}

impl InstanceMetrics {
    pub async fn upsert(pool: &PgPool, sample: &InstanceMetrics) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO instance_metrics (instance_id, cpu_percent, memory_used_mb, memory_limit_mb, sampled_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (instance_id)
               DO UPDATE SET cpu_percent = EXCLUDED.cpu_percent,
                             memory_used_mb = EXCLUDED.memory_used_mb,
                             memory_limit_mb = EXCLUDED.memory_limit_mb,
                             sampled_at = EXCLUDED.sampled_at"#,
        )
        .bind(sample.instance_id)
        .bind(sample.cpu_percent)
        .bind(sample.memory_used_mb)
        .bind(sample.memory_limit_mb)
        .bind(sample.sampled_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM instance_metrics WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn delete_for_instance(pool: &PgPool, instance_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM instance_metrics WHERE instance_id = $1")
            .bind(instance_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(total_mb: i32, used_mb: i32, total_gb: i32, used_gb: i32) -> Server {
        Server {
            id: Uuid::new_v4(),
            provider_id: None,
            name: "nr-test".into(),
            public_ip: None,
            private_ip: None,
            region: "fsn1".into(),
            server_type: "cx22".into(),
            total_memory_mb: total_mb,
            used_memory_mb: used_mb,
            total_disk_gb: total_gb,
            used_disk_gb: used_gb,
            status: ServerStatus::Active,
            provisioned_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn available_capacity_subtracts_used_and_reserved() {
        let s = server(4096, 1024, 80, 20);
        assert_eq!(s.available_memory_mb(512), 2560);
        assert_eq!(s.available_disk_gb(10), 50);
    }

    #[test]
    fn available_capacity_clamps_at_zero() {
        let s = server(1024, 1024, 20, 15);
        assert_eq!(s.available_memory_mb(512), 0);
        assert_eq!(s.available_disk_gb(10), 0);
    }

    #[test]
    fn deployable_statuses() {
        assert!(InstanceStatus::Pending.is_deployable());
        assert!(InstanceStatus::Deploying.is_deployable());
        assert!(InstanceStatus::Error.is_deployable());
        assert!(!InstanceStatus::Active.is_deployable());
        assert!(!InstanceStatus::Deleting.is_deployable());
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&InstanceStatus::Deploying).unwrap(),
            "\"deploying\""
        );
        assert_eq!(ServerStatus::Provisioning.to_string(), "provisioning");
    }
}
