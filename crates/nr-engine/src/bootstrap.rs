use std::sync::Arc;

use nr_infra::{RemoteExecutor, shell_quote};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::{Error, Result};

const PROXY_CONTAINER: &str = "traefik";

/// One-time setup of a server: Docker, the shared network and the Traefik edge proxy.
///
/// Every step checks before it changes anything, so running it twice is harmless.
pub struct EdgeProxyBootstrapper {
    exec: Arc<dyn RemoteExecutor>,
    config: Arc<EngineConfig>,
    public_key: Option<String>,
}

impl EdgeProxyBootstrapper {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        config: Arc<EngineConfig>,
        public_key: Option<String>,
    ) -> Self {
        Self {
            exec,
            config,
            public_key,
        }
    }

    /// Run all steps. Errors are logged and reported as `false`.
    pub async fn bootstrap(&self) -> bool {
        let host = self.exec.host().to_string();
        info!(host, "bootstrap: starting");
        match self.run().await {
            Ok(()) => {
                info!(host, "bootstrap: complete");
                true
            }
            Err(e) => {
                error!(host, error = %e, "bootstrap: failed");
                false
            }
        }
    }

    async fn run(&self) -> Result<()> {
        self.wait_for_ssh().await?;
        self.ensure_authorized_key().await;
        self.ensure_docker().await?;
        self.ensure_network().await?;
        self.start_proxy().await
    }

    /// Fresh servers take a while to accept SSH; back off linearly.
    async fn wait_for_ssh(&self) -> Result<()> {
        let timings = &self.config.timings;
        let attempts = timings.ssh_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exec.execute("true", true).await {
                Ok(_) => {
                    debug!(host = %self.exec.host(), attempt, "bootstrap: ssh reachable");
                    return Ok(());
                }
                Err(e) if attempt >= attempts => {
                    return Err(Error::Bootstrap(format!(
                        "{} unreachable after {attempts} attempts: {e}",
                        self.exec.host()
                    )));
                }
                Err(e) => {
                    let delay = timings.ssh_retry_base * attempt;
                    warn!(host = %self.exec.host(), attempt, delay_secs = delay.as_secs(), error = %e, "bootstrap: ssh not reachable yet");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Providers usually inject the key already; failures here are not fatal.
    async fn ensure_authorized_key(&self) {
        let Some(key) = self.public_key.as_deref() else {
            return;
        };
        let key = shell_quote(key.trim());
        let command = format!(
            "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
             (grep -qxF {key} ~/.ssh/authorized_keys || echo {key} >> ~/.ssh/authorized_keys) && \
             chmod 600 ~/.ssh/authorized_keys"
        );
        if let Err(e) = self.exec.execute(&command, true).await {
            warn!(host = %self.exec.host(), error = %e, "bootstrap: could not install operator key");
        }
    }

    async fn ensure_docker(&self) -> Result<()> {
        let present = self
            .exec
            .execute(
                "command -v docker >/dev/null 2>&1 && docker compose version >/dev/null 2>&1",
                false,
            )
            .await?;

        if !present.success() {
            info!(host = %self.exec.host(), "bootstrap: installing docker");
            self.exec
                .execute("curl -fsSL https://get.docker.com | sh", true)
                .await?;
            self.exec
                .execute("systemctl enable --now docker", false)
                .await?;
        }

        for check in ["docker --version", "docker compose version"] {
            self.exec.execute(check, true).await.map_err(|e| {
                Error::Bootstrap(format!("{check} failed on {}: {e}", self.exec.host()))
            })?;
        }
        Ok(())
    }

    async fn ensure_network(&self) -> Result<()> {
        let network = shell_quote(&self.config.proxy_network);
        self.exec
            .execute(
                &format!(
                    "docker network inspect {network} >/dev/null 2>&1 || docker network create {network}"
                ),
                true,
            )
            .await?;
        Ok(())
    }

    async fn start_proxy(&self) -> Result<()> {
        let dir = self.config.proxy_dir.trim_end_matches('/');
        self.exec
            .execute(&format!("mkdir -p {}/letsencrypt", shell_quote(dir)), true)
            .await?;
        self.exec
            .upload(
                &render_proxy_compose(&self.config),
                &format!("{dir}/docker-compose.yml"),
                0o644,
            )
            .await?;
        self.exec
            .upload(&render_proxy_env(&self.config), &format!("{dir}/.env"), 0o600)
            .await?;
        self.exec
            .execute(&format!("cd {} && docker compose up -d", shell_quote(dir)), true)
            .await?;
        info!(host = %self.exec.host(), "bootstrap: edge proxy started");
        Ok(())
    }

    /// Whether the edge proxy container is up.
    pub async fn is_proxy_running(&self) -> bool {
        let command = format!(
            "docker ps -q --filter name=^{PROXY_CONTAINER}$ --filter status=running"
        );
        match self.exec.execute(&command, false).await {
            Ok(out) => out.success() && !out.stdout.trim().is_empty(),
            Err(e) => {
                warn!(host = %self.exec.host(), error = %e, "bootstrap: could not check proxy");
                false
            }
        }
    }
}

pub fn render_proxy_compose(config: &EngineConfig) -> String {
    format!(
        r#"services:
  {PROXY_CONTAINER}:
    image: {image}
    container_name: {PROXY_CONTAINER}
    restart: unless-stopped
    command:
      - --providers.docker=true
      - --providers.docker.exposedbydefault=false
      - --providers.docker.network={network}
      - --entrypoints.web.address=:80
      - --entrypoints.web.http.redirections.entrypoint.to=websecure
      - --entrypoints.web.http.redirections.entrypoint.scheme=https
      - --entrypoints.websecure.address=:443
      - --certificatesresolvers.letsencrypt.acme.dnschallenge=true
      - --certificatesresolvers.letsencrypt.acme.dnschallenge.provider=cloudflare
      - --certificatesresolvers.letsencrypt.acme.email=${{ACME_EMAIL}}
      - --certificatesresolvers.letsencrypt.acme.storage=/letsencrypt/acme.json
    env_file: .env
    ports:
      - "80:80"
      - "443:443"
    volumes:
      - /var/run/docker.sock:/var/run/docker.sock:ro
      - ./letsencrypt:/letsencrypt
    networks:
      - proxy

networks:
  proxy:
    external: true
    name: {network}
"#,
        image = config.proxy_image,
        network = config.proxy_network,
    )
}

pub fn render_proxy_env(config: &EngineConfig) -> String {
    format!(
        "CF_DNS_API_TOKEN={}\nACME_EMAIL={}\n",
        config.dns_api_token, config.acme_email
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedExecutor, config};

    fn bootstrapper(exec: Arc<ScriptedExecutor>) -> EdgeProxyBootstrapper {
        EdgeProxyBootstrapper::new(exec, Arc::new(config()), Some("ssh-ed25519 AAAA op".into()))
    }

    #[test]
    fn proxy_files_use_dns_challenge() {
        let cfg = config();
        let compose = render_proxy_compose(&cfg);
        assert!(compose.contains("dnschallenge.provider=cloudflare"));
        assert!(compose.contains("email=${ACME_EMAIL}"));
        assert!(compose.contains("name: noderack"));

        let env = render_proxy_env(&cfg);
        assert!(env.contains("CF_DNS_API_TOKEN=cf-token"));
        assert!(env.contains("ACME_EMAIL=ops@flows.test"));
    }

    #[tokio::test]
    async fn installs_docker_when_missing() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.20"));
        exec.fail_on("command -v docker");
        let b = bootstrapper(exec.clone());

        assert!(b.bootstrap().await);
        assert!(exec.ran("get.docker.com"));
        assert!(exec.ran("docker network create noderack"));
        assert!(exec.ran("authorized_keys"));
        assert!(exec.uploads().iter().any(|(path, mode)| path == "/opt/noderack/traefik/.env" && mode == "600"));
    }

    #[tokio::test]
    async fn skips_install_when_docker_present() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.20"));
        let b = bootstrapper(exec.clone());

        assert!(b.bootstrap().await);
        assert!(!exec.ran("get.docker.com"));
    }

    #[tokio::test]
    async fn failed_verification_returns_false() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.20"));
        exec.fail_on("docker --version");
        let b = bootstrapper(exec.clone());

        assert!(!b.bootstrap().await);
        assert!(!exec.ran("docker network"));
    }

    #[tokio::test]
    async fn retries_until_ssh_answers() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.20"));
        exec.unreachable_for(2);
        let b = bootstrapper(exec.clone());

        assert!(b.bootstrap().await);
        assert_eq!(exec.count("true"), 3);
    }

    #[tokio::test]
    async fn gives_up_when_ssh_never_answers() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.20"));
        exec.unreachable_for(100);
        let b = bootstrapper(exec.clone());

        assert!(!b.bootstrap().await);
        assert!(!exec.ran("docker"));
    }

    #[tokio::test]
    async fn detects_running_proxy() {
        let exec = Arc::new(ScriptedExecutor::new("203.0.113.20"));
        let b = bootstrapper(exec.clone());
        assert!(!b.is_proxy_running().await);

        exec.respond("docker ps -q --filter name=^traefik$", "a1b2c3\n");
        assert!(b.is_proxy_running().await);
    }
}
