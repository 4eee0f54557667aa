//! Fakes and fixtures shared by the engine's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nr_db::models::{
    Instance, InstanceStatus, NewInstance, NewPlan, NewServer, Server, ServerStatus,
};
use nr_db::{MemoryStore, Store};
use nr_infra::types::{
    CommandOutput, DnsRecord, DnsRecordUpdate, LocationInfo, Pricing, ProviderId, ServerInfo,
    ServerSpec, ServerState, ServerTypeInfo,
};
use nr_infra::{CloudProvider, DnsProvider, RemoteConnector, RemoteExecutor};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{EngineConfig, RetryPolicy, Timings};
use crate::deployer::ReadinessCheck;
use crate::jobs::{Job, JobContext};
use crate::queue::{Envelope, JobQueue};
use crate::Services;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Engine config with every wait collapsed except the provisioning-age bounds.
pub fn config() -> EngineConfig {
    EngineConfig {
        base_domain: "flows.test".into(),
        provisioning_enabled: true,
        location: None,
        reserved_memory_mb: 512,
        reserved_disk_gb: 10,
        node_red_image: "nodered/node-red:4.0".into(),
        instances_dir: "/opt/noderack/instances".into(),
        proxy_dir: "/opt/noderack/traefik".into(),
        proxy_image: "traefik:v3.1".into(),
        proxy_network: "noderack".into(),
        acme_email: "ops@flows.test".into(),
        dns_api_token: "cf-token".into(),
        dns_proxied: false,
        ssh_key_name: Some("noderack-ops".into()),
        timings: Timings {
            server_ready_timeout: Duration::ZERO,
            server_poll_interval: Duration::ZERO,
            boot_grace: Duration::from_secs(60),
            provisioning_timeout: Duration::from_secs(600),
            provisioning_poll: Duration::from_secs(60),
            readiness_timeout: Duration::ZERO,
            readiness_interval: Duration::ZERO,
            ssh_attempts: 3,
            ssh_retry_base: Duration::ZERO,
            proxy_settle: Duration::ZERO,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
            attempt_timeout: Duration::from_secs(600),
        },
    }
}

// ── Remote ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    commands: Vec<String>,
    uploads: Vec<(String, String, u32)>,
    failures: Vec<String>,
    responses: Vec<(String, String)>,
    unreachable: u32,
}

/// Records every command. Commands succeed with empty output unless scripted otherwise.
pub struct ScriptedExecutor {
    host: String,
    script: Mutex<Script>,
}

impl ScriptedExecutor {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            script: Mutex::new(Script::default()),
        }
    }

    /// Commands containing `pattern` exit 1.
    pub fn fail_on(&self, pattern: &str) {
        lock(&self.script).failures.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.script).failures.clear();
    }

    /// Commands containing `pattern` print `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        lock(&self.script)
            .responses
            .push((pattern.to_string(), stdout.to_string()));
    }

    /// The next `n` calls fail as if the host refused the connection.
    pub fn unreachable_for(&self, n: u32) {
        lock(&self.script).unreachable = n;
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.script).commands.clone()
    }

    /// Whether any command contained `fragment`.
    pub fn ran(&self, fragment: &str) -> bool {
        lock(&self.script).commands.iter().any(|c| c.contains(fragment))
    }

    /// How many times exactly `command` ran.
    pub fn count(&self, command: &str) -> usize {
        lock(&self.script)
            .commands
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// `(path, octal mode)` of every upload.
    pub fn uploads(&self) -> Vec<(String, String)> {
        lock(&self.script)
            .uploads
            .iter()
            .map(|(path, _, mode)| (path.clone(), format!("{mode:o}")))
            .collect()
    }

    /// Content of the most recent upload to `path`.
    pub fn uploaded(&self, path: &str) -> Option<String> {
        lock(&self.script)
            .uploads
            .iter()
            .rev()
            .find(|(p, _, _)| p == path)
            .map(|(_, content, _)| content.clone())
    }

    fn refuse(&self, script: &mut Script) -> Option<nr_infra::Error> {
        if script.unreachable == 0 {
            return None;
        }
        script.unreachable -= 1;
        Some(nr_infra::Error::Remote {
            host: self.host.clone(),
            message: "connection refused".into(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, command: &str, check: bool) -> nr_infra::Result<CommandOutput> {
        let mut script = lock(&self.script);
        script.commands.push(command.to_string());
        if let Some(e) = self.refuse(&mut script) {
            return Err(e);
        }

        if script.failures.iter().any(|f| command.contains(f.as_str())) {
            if check {
                return Err(nr_infra::Error::CommandFailed {
                    host: self.host.clone(),
                    command: command.to_string(),
                    exit_code: 1,
                    stderr: "scripted failure".into(),
                });
            }
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "scripted failure".into(),
            });
        }

        let stdout = script
            .responses
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn upload(&self, content: &str, remote_path: &str, mode: u32) -> nr_infra::Result<()> {
        let mut script = lock(&self.script);
        if let Some(e) = self.refuse(&mut script) {
            return Err(e);
        }
        script
            .uploads
            .push((remote_path.to_string(), content.to_string(), mode));
        Ok(())
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Hands out one `ScriptedExecutor` per host.
#[derive(Default)]
pub struct FakeConnector {
    executors: Mutex<HashMap<String, Arc<ScriptedExecutor>>>,
}

impl FakeConnector {
    pub fn executor(&self, host: &str) -> Arc<ScriptedExecutor> {
        lock(&self.executors)
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(ScriptedExecutor::new(host)))
            .clone()
    }
}

impl RemoteConnector for FakeConnector {
    fn connect(&self, host: &str) -> Arc<dyn RemoteExecutor> {
        self.executor(host)
    }

    fn public_key(&self) -> Option<&str> {
        Some("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITEST ops@noderack")
    }
}

pub struct StubReadiness {
    ready: bool,
}

impl StubReadiness {
    pub fn ready() -> Self {
        Self { ready: true }
    }

    pub fn never() -> Self {
        Self { ready: false }
    }
}

#[async_trait]
impl ReadinessCheck for StubReadiness {
    async fn is_ready(&self, _url: &str) -> bool {
        self.ready
    }
}

// ── Cloud ───────────────────────────────────────────────────────────

#[derive(Default)]
struct CloudState {
    created: Vec<ServerSpec>,
    deleted: Vec<String>,
    servers: HashMap<String, ServerInfo>,
    ssh_keys: Vec<String>,
    never_run: bool,
}

/// Provider that creates servers instantly and reports them running.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn created(&self) -> Vec<ServerSpec> {
        lock(&self.state).created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// Servers stay in `starting` forever.
    pub fn never_run(&self) {
        lock(&self.state).never_run = true;
    }
}

pub fn server_type(name: &str, memory_mb: i32, disk_gb: i32) -> ServerTypeInfo {
    ServerTypeInfo {
        name: name.to_string(),
        cores: (memory_mb / 2048).max(1),
        memory_mb,
        disk_gb,
        prices: Vec::new(),
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(&self, spec: &ServerSpec) -> nr_infra::Result<ServerInfo> {
        let mut state = lock(&self.state);
        state.created.push(spec.clone());
        let n = state.created.len();
        let info = ServerInfo {
            id: ProviderId(format!("{}", 4_000_000 + n)),
            name: spec.name.clone(),
            state: ServerState::Starting,
            public_ip: Some(format!("198.51.100.{n}")),
            private_ip: None,
            server_type: spec.server_type.clone(),
            location: spec.location.clone(),
        };
        state.servers.insert(info.id.0.clone(), info.clone());
        Ok(info)
    }

    async fn delete_server(&self, id: &ProviderId) -> nr_infra::Result<bool> {
        let mut state = lock(&self.state);
        state.deleted.push(id.0.clone());
        Ok(state.servers.remove(&id.0).is_some())
    }

    async fn reboot_server(&self, id: &ProviderId) -> nr_infra::Result<bool> {
        Ok(lock(&self.state).servers.contains_key(&id.0))
    }

    async fn get_server(&self, id: &ProviderId) -> nr_infra::Result<ServerInfo> {
        let state = lock(&self.state);
        let mut info = state
            .servers
            .get(&id.0)
            .cloned()
            .ok_or_else(|| nr_infra::Error::HetznerApi(format!("server {} not found", id.0)))?;
        if !state.never_run {
            info.state = ServerState::Running;
        }
        Ok(info)
    }

    async fn list_servers(&self) -> nr_infra::Result<Vec<ServerInfo>> {
        Ok(lock(&self.state).servers.values().cloned().collect())
    }

    async fn list_server_types(&self) -> nr_infra::Result<Vec<ServerTypeInfo>> {
        Ok(vec![
            server_type("cx22", 4096, 40),
            server_type("cx32", 8192, 80),
            server_type("cx42", 16384, 160),
        ])
    }

    async fn list_locations(&self) -> nr_infra::Result<Vec<LocationInfo>> {
        Ok(vec![LocationInfo {
            name: "fsn1".into(),
            description: "Falkenstein DC Park 1".into(),
            city: "Falkenstein".into(),
            country: "DE".into(),
        }])
    }

    async fn pricing(&self, _server_type: &str, location: &str) -> nr_infra::Result<Option<Pricing>> {
        Ok(Some(Pricing {
            location: location.to_string(),
            hourly_net: 0.006,
            monthly_net: 3.79,
        }))
    }

    async fn ensure_ssh_key(&self, name: &str, _public_key: &str) -> nr_infra::Result<()> {
        let mut state = lock(&self.state);
        if !state.ssh_keys.iter().any(|k| k == name) {
            state.ssh_keys.push(name.to_string());
        }
        Ok(())
    }

    fn default_location(&self) -> &str {
        "fsn1"
    }

    fn default_image(&self) -> &str {
        "ubuntu-24.04"
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

// ── DNS ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct DnsState {
    records: HashMap<String, DnsRecord>,
    calls: Vec<String>,
    next_id: u32,
    fail_deletes: bool,
    fail_ensures: bool,
}

/// Zone `flows.test` kept in memory, keyed by subdomain.
#[derive(Default)]
pub struct FakeDns {
    state: Mutex<DnsState>,
}

impl FakeDns {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn record(&self, subdomain: &str) -> Option<DnsRecord> {
        lock(&self.state).records.get(subdomain).cloned()
    }

    pub fn fail_deletes(&self) {
        lock(&self.state).fail_deletes = true;
    }

    pub fn fail_ensures(&self) {
        lock(&self.state).fail_ensures = true;
    }

    fn outage() -> nr_infra::Error {
        nr_infra::Error::Remote {
            host: "dns.test".into(),
            message: "service unavailable".into(),
        }
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn ensure_a_record(&self, subdomain: &str, ip: &str, proxied: bool) -> nr_infra::Result<DnsRecord> {
        let fqdn = self.fqdn(subdomain);
        let mut state = lock(&self.state);
        state.calls.push(format!("ensure {subdomain} {ip}"));
        if state.fail_ensures {
            return Err(Self::outage());
        }
        if let Some(record) = state.records.get_mut(subdomain) {
            record.content = ip.to_string();
            record.proxied = proxied;
            return Ok(record.clone());
        }
        state.next_id += 1;
        let record = DnsRecord {
            id: format!("rec-{}", state.next_id),
            name: fqdn,
            record_type: "A".into(),
            content: ip.to_string(),
            proxied,
        };
        state.records.insert(subdomain.to_string(), record.clone());
        Ok(record)
    }

    async fn delete_record(&self, record_id: &str) -> nr_infra::Result<bool> {
        let mut state = lock(&self.state);
        state.calls.push(format!("delete {record_id}"));
        if state.fail_deletes {
            return Err(Self::outage());
        }
        let before = state.records.len();
        state.records.retain(|_, r| r.id != record_id);
        Ok(state.records.len() < before)
    }

    async fn update_record(&self, record_id: &str, update: &DnsRecordUpdate) -> nr_infra::Result<DnsRecord> {
        let mut state = lock(&self.state);
        state.calls.push(format!("update {record_id}"));
        let record = state
            .records
            .values_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(Self::outage)?;
        if let Some(content) = &update.content {
            record.content = content.clone();
        }
        if let Some(proxied) = update.proxied {
            record.proxied = proxied;
        }
        Ok(record.clone())
    }

    async fn find_record(&self, subdomain: &str, record_type: &str) -> nr_infra::Result<Option<DnsRecord>> {
        let mut state = lock(&self.state);
        state.calls.push(format!("find {subdomain} {record_type}"));
        Ok(state
            .records
            .get(subdomain)
            .filter(|r| r.record_type == record_type)
            .cloned())
    }

    fn zone(&self) -> &str {
        "flows.test"
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// `Services` wired to in-memory fakes, with handles to inspect them.
pub struct Harness {
    pub svc: Services,
    pub store: Arc<dyn Store>,
    pub cloud: Arc<FakeCloud>,
    pub dns: Arc<FakeDns>,
    pub remote: Arc<FakeConnector>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let mut cfg = config();
        tweak(&mut cfg);

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cloud = Arc::new(FakeCloud::default());
        let dns = Arc::new(FakeDns::default());
        let remote = Arc::new(FakeConnector::default());
        let (queue, rx) = JobQueue::new(cfg.retry.clone());

        let svc = Services {
            store: store.clone(),
            cloud: cloud.clone(),
            dns: dns.clone(),
            remote: remote.clone(),
            readiness: Arc::new(StubReadiness::ready()),
            config: Arc::new(cfg),
            queue,
        };
        Self {
            svc,
            store,
            cloud,
            dns,
            remote,
            rx,
        }
    }

    /// Fresh first-attempt context.
    pub fn ctx(&self) -> JobContext {
        JobContext::new(self.svc.config.retry.max_attempts)
    }

    pub fn exec(&self, host: &str) -> Arc<ScriptedExecutor> {
        self.remote.executor(host)
    }

    /// Jobs dispatched so far, drained from the queue.
    pub fn dispatched(&mut self) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            jobs.push(envelope.job);
        }
        jobs
    }

    pub fn into_parts(self) -> (Services, mpsc::UnboundedReceiver<Envelope>) {
        (self.svc, self.rx)
    }
}

/// Active-or-not server with a public address in 203.0.113.0/24.
pub async fn seed_server(
    h: &Harness,
    name: &str,
    memory_mb: i32,
    disk_gb: i32,
    status: ServerStatus,
) -> Server {
    let n = h.store.list_servers().await.unwrap().len() + 1;
    h.store
        .insert_server(&NewServer {
            provider_id: Some(format!("{}", 3_000_000 + n)),
            name: name.to_string(),
            public_ip: Some(format!("203.0.113.{n}")),
            private_ip: Some(format!("10.0.0.{n}")),
            region: "fsn1".into(),
            server_type: "cx22".into(),
            total_memory_mb: memory_mb,
            total_disk_gb: disk_gb,
            status,
        })
        .await
        .unwrap()
}

/// Pending 512 MB / 10 GB instance whose subdomain equals its slug.
pub async fn seed_instance(h: &Harness, slug: &str, server_id: Option<Uuid>) -> Instance {
    let plan = h
        .store
        .insert_plan(&NewPlan {
            name: format!("starter-{slug}"),
            memory_mb: 512,
            storage_gb: 10,
            cpu_millicores: 500,
            price_cents: 500,
        })
        .await
        .unwrap();
    let mut new = NewInstance::from_plan(
        &plan,
        Uuid::new_v4(),
        slug.to_string(),
        slug.to_string(),
        format!("{slug}.flows.test"),
        "admin".into(),
        "$2b$10$adminhash".into(),
    );
    new.server_id = server_id;
    h.store.insert_instance(&new).await.unwrap()
}

/// Unsaved instance for rendering tests.
pub fn instance_fixture(slug: &str) -> Instance {
    let now = Utc::now();
    Instance {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        server_id: None,
        plan_id: Uuid::new_v4(),
        slug: slug.to_string(),
        subdomain: slug.to_string(),
        fqdn: format!("{slug}.flows.test"),
        memory_mb: 512,
        storage_gb: 10,
        cpu_millicores: 500,
        admin_user: "admin".into(),
        admin_password_hash: "$2b$10$adminhash".into(),
        credential_secret: None,
        capacity_counted: false,
        status: InstanceStatus::Pending,
        deployed_at: None,
        created_at: now,
        updated_at: now,
    }
}
