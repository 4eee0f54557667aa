use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nr_db::models::{Instance, InstanceUser};
use nr_infra::{RemoteExecutor, shell_quote};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::{Error, Result};

/// UID the Node-RED image runs as.
const CONTAINER_UID: u32 = 1000;
const NODE_RED_PORT: u16 = 1880;

/// HTTP readiness check against a public URL.
#[async_trait]
pub trait ReadinessCheck: Send + Sync + 'static {
    /// True on any 2xx or 3xx response.
    async fn is_ready(&self, url: &str) -> bool;
}

/// Readiness check over HTTPS that accepts not-yet-issued certificates.
pub struct HttpReadiness {
    client: reqwest::Client,
}

impl HttpReadiness {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("build readiness client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReadinessCheck for HttpReadiness {
    async fn is_ready(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!(url, error = %e, "readiness check failed");
                false
            }
        }
    }
}

/// Runs one server's Node-RED containers through its command channel.
pub struct WorkloadDeployer {
    exec: Arc<dyn RemoteExecutor>,
    readiness: Arc<dyn ReadinessCheck>,
    config: Arc<EngineConfig>,
}

impl WorkloadDeployer {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        readiness: Arc<dyn ReadinessCheck>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            exec,
            readiness,
            config,
        }
    }

    pub fn host(&self) -> &str {
        self.exec.host()
    }

    fn dir(&self, instance: &Instance) -> String {
        self.config.instance_dir(&instance.slug)
    }

    /// Write compose and settings files, start the container and wait for it to answer.
    ///
    /// A readiness timeout is logged and still counts as success.
    pub async fn deploy(&self, instance: &Instance, secret: &str, users: &[InstanceUser]) -> bool {
        match self.try_deploy(instance, secret, users).await {
            Ok(()) => true,
            Err(e) => {
                error!(instance_id = %instance.id, host = %self.host(), error = %e, "deploy failed");
                false
            }
        }
    }

    async fn try_deploy(&self, instance: &Instance, secret: &str, users: &[InstanceUser]) -> Result<()> {
        let dir = self.dir(instance);
        let data = format!("{dir}/data");

        self.exec
            .execute(&format!("mkdir -p {}", shell_quote(&data)), true)
            .await?;

        let compose = render_compose(instance, &self.config, secret);
        self.exec
            .upload(&compose, &format!("{dir}/docker-compose.yml"), 0o644)
            .await?;

        let settings = render_settings(instance, users);
        self.exec
            .upload(&settings, &format!("{data}/settings.js"), 0o644)
            .await?;

        self.exec
            .execute(
                &format!("chown -R {CONTAINER_UID}:{CONTAINER_UID} {}", shell_quote(&data)),
                true,
            )
            .await?;

        self.compose(instance, "up -d --remove-orphans").await?;
        info!(instance_id = %instance.id, host = %self.host(), "container started");

        let url = format!("https://{}", instance.fqdn);
        if self.wait_ready(&url).await {
            info!(instance_id = %instance.id, url, "instance ready");
        } else {
            warn!(
                instance_id = %instance.id,
                url,
                timeout_secs = self.config.timings.readiness_timeout.as_secs(),
                "instance not answering yet, continuing"
            );
        }
        Ok(())
    }

    async fn wait_ready(&self, url: &str) -> bool {
        let timings = &self.config.timings;
        let deadline = Instant::now() + timings.readiness_timeout;
        loop {
            if self.readiness.is_ready(url).await {
                return true;
            }
            if Instant::now() + timings.readiness_interval > deadline {
                return false;
            }
            tokio::time::sleep(timings.readiness_interval).await;
        }
    }

    async fn compose(&self, instance: &Instance, args: &str) -> Result<()> {
        self.exec
            .execute(
                &format!("cd {} && docker compose {args}", shell_quote(&self.dir(instance))),
                true,
            )
            .await?;
        Ok(())
    }

    async fn lifecycle(&self, instance: &Instance, action: &str, args: &str) -> bool {
        match self.compose(instance, args).await {
            Ok(()) => {
                info!(instance_id = %instance.id, host = %self.host(), action, "container updated");
                true
            }
            Err(e) => {
                error!(instance_id = %instance.id, host = %self.host(), action, error = %e, "container command failed");
                false
            }
        }
    }

    pub async fn start(&self, instance: &Instance) -> bool {
        self.lifecycle(instance, "start", "up -d").await
    }

    pub async fn stop(&self, instance: &Instance) -> bool {
        self.lifecycle(instance, "stop", "stop").await
    }

    pub async fn restart(&self, instance: &Instance) -> bool {
        self.lifecycle(instance, "restart", "restart").await
    }

    /// Remove the container, its volumes and its directory.
    ///
    /// Succeeds without touching anything when the directory is already gone.
    pub async fn delete(&self, instance: &Instance) -> bool {
        let dir = self.dir(instance);
        match self.exec.dir_exists(&dir).await {
            Ok(false) => {
                debug!(instance_id = %instance.id, dir, "instance directory absent, nothing to remove");
                return true;
            }
            Ok(true) => {}
            Err(e) => {
                error!(instance_id = %instance.id, host = %self.host(), error = %e, "cannot inspect instance directory");
                return false;
            }
        }

        let quoted = shell_quote(&dir);
        for command in [
            format!("cd {quoted} && docker compose down -v --remove-orphans"),
            format!("rm -rf {quoted}"),
        ] {
            match self.exec.execute(&command, false).await {
                Ok(out) if !out.success() => {
                    warn!(instance_id = %instance.id, command, exit_code = out.exit_code, "cleanup command failed");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(instance_id = %instance.id, command, error = %e, "cleanup command failed");
                }
            }
        }
        info!(instance_id = %instance.id, host = %self.host(), "instance removed");
        true
    }

    /// Rewrite `settings.js` with the current users. Takes effect after a restart.
    pub async fn sync_users(&self, instance: &Instance, users: &[InstanceUser]) -> bool {
        let data = format!("{}/data", self.dir(instance));
        let settings = render_settings(instance, users);
        let result = async {
            self.exec
                .upload(&settings, &format!("{data}/settings.js"), 0o644)
                .await?;
            self.exec
                .execute(
                    &format!(
                        "chown {CONTAINER_UID}:{CONTAINER_UID} {}",
                        shell_quote(&format!("{data}/settings.js"))
                    ),
                    true,
                )
                .await?;
            Ok::<_, nr_infra::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(instance_id = %instance.id, users = users.len(), "settings rewritten");
                true
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "failed to rewrite settings");
                false
            }
        }
    }

    /// Last `lines` lines of container output, empty on any error.
    pub async fn get_logs(&self, instance: &Instance, lines: u32) -> String {
        let command = format!(
            "docker logs --tail {lines} {} 2>&1",
            shell_quote(&instance.container_name())
        );
        match self.exec.execute(&command, true).await {
            Ok(out) => out.stdout,
            Err(e) => {
                debug!(instance_id = %instance.id, error = %e, "could not fetch logs");
                String::new()
            }
        }
    }

    pub async fn is_running(&self, instance: &Instance) -> bool {
        let command = format!("cd {} && docker compose ps -q", shell_quote(&self.dir(instance)));
        match self.exec.execute(&command, false).await {
            Ok(out) => out.success() && !out.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }
}

/// Node.js heap limit for a container memory limit, leaving room for buffers.
pub fn node_heap_mb(memory_mb: i32) -> i32 {
    memory_mb * 3 / 4
}

pub fn render_compose(instance: &Instance, config: &EngineConfig, secret: &str) -> String {
    let name = instance.container_name();
    let cpus = f64::from(instance.cpu_millicores) / 1000.0;
    format!(
        r#"services:
  {name}:
    image: {image}
    container_name: {name}
    restart: unless-stopped
    environment:
      - TZ=UTC
      - NODE_OPTIONS=--max-old-space-size={heap}
      - NODE_RED_CREDENTIAL_SECRET={secret}
    volumes:
      - ./data:/data
    mem_limit: {memory}m
    cpus: "{cpus:.2}"
    networks:
      - proxy
    labels:
      - traefik.enable=true
      - traefik.http.routers.{name}.rule=Host(`{fqdn}`)
      - traefik.http.routers.{name}.entrypoints=websecure
      - traefik.http.routers.{name}.tls.certresolver=letsencrypt
      - traefik.http.services.{name}.loadbalancer.server.port={port}

networks:
  proxy:
    external: true
    name: {network}
"#,
        image = config.node_red_image,
        heap = node_heap_mb(instance.memory_mb),
        memory = instance.memory_mb,
        fqdn = instance.fqdn,
        port = NODE_RED_PORT,
        network = config.proxy_network,
    )
}

/// `settings.js` with the admin account plus every per-instance user.
pub fn render_settings(instance: &Instance, users: &[InstanceUser]) -> String {
    let mut accounts = vec![json!({
        "username": instance.admin_user,
        "password": instance.admin_password_hash,
        "permissions": "*",
    })];
    accounts.extend(users.iter().map(|u| {
        json!({
            "username": u.username,
            "password": u.password_hash,
            "permissions": u.permissions,
        })
    }));
    let accounts = serde_json::to_string_pretty(&accounts).unwrap_or_else(|_| "[]".into());

    format!(
        r#"module.exports = {{
    uiPort: process.env.PORT || {NODE_RED_PORT},
    credentialSecret: process.env.NODE_RED_CREDENTIAL_SECRET,
    flowFile: "flows.json",
    adminAuth: {{
        type: "credentials",
        users: {accounts}
    }},
    logging: {{
        console: {{ level: "info", metrics: false, audit: false }}
    }},
    editorTheme: {{
        projects: {{ enabled: false }}
    }}
}};
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedExecutor, StubReadiness, config, instance_fixture};

    fn deployer(exec: Arc<ScriptedExecutor>, readiness: StubReadiness) -> WorkloadDeployer {
        WorkloadDeployer::new(exec, Arc::new(readiness), Arc::new(config()))
    }

    #[test]
    fn heap_is_three_quarters_of_memory() {
        assert_eq!(node_heap_mb(512), 384);
        assert_eq!(node_heap_mb(1024), 768);
    }

    #[test]
    fn compose_carries_limits_and_routing() {
        let instance = instance_fixture("lab");
        let compose = render_compose(&instance, &config(), "s3cret");
        assert!(compose.contains("container_name: nr-lab"));
        assert!(compose.contains("mem_limit: 512m"));
        assert!(compose.contains("cpus: \"0.50\""));
        assert!(compose.contains("--max-old-space-size=384"));
        assert!(compose.contains("NODE_RED_CREDENTIAL_SECRET=s3cret"));
        assert!(compose.contains("Host(`lab.flows.test`)"));
        assert!(compose.contains("name: noderack"));
    }

    #[test]
    fn settings_include_admin_and_users() {
        let instance = instance_fixture("lab");
        let users = vec![InstanceUser {
            id: uuid::Uuid::new_v4(),
            instance_id: instance.id,
            username: "viewer".into(),
            password_hash: "$2b$10$viewer".into(),
            permissions: "read".into(),
            created_at: chrono::Utc::now(),
        }];
        let settings = render_settings(&instance, &users);
        assert!(settings.contains(r#""username": "admin""#));
        assert!(settings.contains(r#""permissions": "*""#));
        assert!(settings.contains(r#""username": "viewer""#));
        assert!(settings.contains(r#""permissions": "read""#));
        assert!(settings.contains("credentialSecret"));
    }

    #[tokio::test]
    async fn deploy_uploads_files_and_starts_container() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        let d = deployer(exec.clone(), StubReadiness::ready());
        let instance = instance_fixture("lab");

        assert!(d.deploy(&instance, "secret", &[]).await);

        let uploads = exec.uploads();
        assert!(uploads.iter().any(|(path, _)| path == "/opt/noderack/instances/lab/docker-compose.yml"));
        assert!(uploads.iter().any(|(path, _)| path == "/opt/noderack/instances/lab/data/settings.js"));
        assert!(exec.ran("chown -R 1000:1000 /opt/noderack/instances/lab/data"));
        assert!(exec.ran("docker compose up -d"));
    }

    #[tokio::test]
    async fn readiness_timeout_is_not_fatal() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        let d = deployer(exec, StubReadiness::never());
        assert!(d.deploy(&instance_fixture("lab"), "secret", &[]).await);
    }

    #[tokio::test]
    async fn failed_compose_up_reports_false() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        exec.fail_on("docker compose up");
        let d = deployer(exec, StubReadiness::ready());
        assert!(!d.deploy(&instance_fixture("lab"), "secret", &[]).await);
    }

    #[tokio::test]
    async fn delete_is_a_no_op_when_directory_is_absent() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        exec.fail_on("test -d");
        let d = deployer(exec.clone(), StubReadiness::ready());

        assert!(d.delete(&instance_fixture("gone")).await);
        assert!(!exec.ran("rm -rf"));
        assert!(!exec.ran("docker compose down"));
    }

    #[tokio::test]
    async fn delete_ignores_command_failures() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        exec.fail_on("docker compose down");
        let d = deployer(exec.clone(), StubReadiness::ready());

        assert!(d.delete(&instance_fixture("lab")).await);
        assert!(exec.ran("rm -rf /opt/noderack/instances/lab"));
    }

    #[tokio::test]
    async fn logs_are_empty_on_error() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        exec.fail_on("docker logs");
        let d = deployer(exec, StubReadiness::ready());
        assert_eq!(d.get_logs(&instance_fixture("lab"), 50).await, "");
    }

    #[tokio::test]
    async fn running_means_compose_listed_an_id() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.10"));
        let d = deployer(exec.clone(), StubReadiness::ready());
        let instance = instance_fixture("lab");

        assert!(!d.is_running(&instance).await);
        exec.respond("docker compose ps -q", "4f2a9c\n");
        assert!(d.is_running(&instance).await);
    }
}
