use std::env;
use std::time::Duration;

use crate::{Error, Result};

/// Engine settings shared by every job.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Zone instance hostnames live under, e.g. `flows.example.com`.
    pub base_domain: String,
    /// When false, the planner refuses to create servers (local/dev mode).
    pub provisioning_enabled: bool,
    /// Preferred provider location; the provider default when unset.
    pub location: Option<String>,
    pub reserved_memory_mb: i32,
    pub reserved_disk_gb: i32,
    pub node_red_image: String,
    pub instances_dir: String,
    pub proxy_dir: String,
    pub proxy_image: String,
    pub proxy_network: String,
    pub acme_email: String,
    /// Token the edge proxy uses for the ACME DNS challenge.
    pub dns_api_token: String,
    pub dns_proxied: bool,
    /// Provider-side name of the operator key registered before server creation.
    pub ssh_key_name: Option<String>,
    pub timings: Timings,
    pub retry: RetryPolicy,
}

/// Bounded waits used while provisioning and deploying.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Total wait for the provider to report a new server as running.
    pub server_ready_timeout: Duration,
    pub server_poll_interval: Duration,
    /// No remote command is sent to a provisioning server younger than this.
    pub boot_grace: Duration,
    /// A server still provisioning after this long fails the deploy.
    pub provisioning_timeout: Duration,
    pub provisioning_poll: Duration,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub ssh_attempts: u32,
    /// Delay before SSH retry `n` is `ssh_retry_base * n`.
    pub ssh_retry_base: Duration,
    pub proxy_settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            server_ready_timeout: Duration::from_secs(300),
            server_poll_interval: Duration::from_secs(5),
            boot_grace: Duration::from_secs(60),
            provisioning_timeout: Duration::from_secs(600),
            provisioning_poll: Duration::from_secs(60),
            readiness_timeout: Duration::from_secs(60),
            readiness_interval: Duration::from_secs(3),
            ssh_attempts: 10,
            ssh_retry_base: Duration::from_secs(5),
            proxy_settle: Duration::from_secs(5),
        }
    }
}

/// Job-level retry bound.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(600),
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{name} must be set")))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Create from env vars:
    ///
    /// - `NR_BASE_DOMAIN`, `ACME_EMAIL`, `CLOUDFLARE_API_TOKEN` (required)
    /// - `NR_PROVISIONING` (`enabled`/`disabled`, default: disabled when `NR_ENV=local`)
    /// - `NR_LOCATION`, `NR_SSH_KEY_NAME` (optional)
    /// - `NR_RESERVED_MEMORY_MB` (default: `512`), `NR_RESERVED_DISK_GB` (default: `10`)
    /// - `NODE_RED_IMAGE` (default: `"nodered/node-red:4.0"`)
    /// - `NR_INSTANCES_DIR` (default: `"/opt/noderack/instances"`)
    /// - `NR_PROXY_NETWORK` (default: `"noderack"`)
    /// - `NR_MAX_ATTEMPTS`, `NR_RETRY_BACKOFF_SECS`, `NR_ATTEMPT_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let local = env::var("NR_ENV").map(|v| v == "local").unwrap_or(false);
        let provisioning_enabled = match env::var("NR_PROVISIONING").as_deref() {
            Ok("enabled") => true,
            Ok("disabled") => false,
            Ok(other) => {
                return Err(Error::Config(format!(
                    "NR_PROVISIONING must be enabled or disabled, got {other}"
                )));
            }
            Err(_) => !local,
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parsed("NR_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff: Duration::from_secs(parsed(
                "NR_RETRY_BACKOFF_SECS",
                defaults.backoff.as_secs(),
            )?),
            attempt_timeout: Duration::from_secs(parsed(
                "NR_ATTEMPT_TIMEOUT_SECS",
                defaults.attempt_timeout.as_secs(),
            )?),
        };
        if retry.max_attempts == 0 {
            return Err(Error::Config("NR_MAX_ATTEMPTS must be at least 1".into()));
        }

        Ok(Self {
            base_domain: required("NR_BASE_DOMAIN")?,
            provisioning_enabled,
            location: env::var("NR_LOCATION").ok(),
            reserved_memory_mb: parsed("NR_RESERVED_MEMORY_MB", 512)?,
            reserved_disk_gb: parsed("NR_RESERVED_DISK_GB", 10)?,
            node_red_image: env::var("NODE_RED_IMAGE")
                .unwrap_or_else(|_| "nodered/node-red:4.0".into()),
            instances_dir: env::var("NR_INSTANCES_DIR")
                .unwrap_or_else(|_| "/opt/noderack/instances".into()),
            proxy_dir: env::var("NR_PROXY_DIR").unwrap_or_else(|_| "/opt/noderack/traefik".into()),
            proxy_image: env::var("NR_PROXY_IMAGE").unwrap_or_else(|_| "traefik:v3.1".into()),
            proxy_network: env::var("NR_PROXY_NETWORK").unwrap_or_else(|_| "noderack".into()),
            acme_email: required("ACME_EMAIL")?,
            dns_api_token: required("CLOUDFLARE_API_TOKEN")?,
            dns_proxied: parsed("NR_DNS_PROXIED", false)?,
            ssh_key_name: env::var("NR_SSH_KEY_NAME").ok(),
            timings: Timings::default(),
            retry,
        })
    }

    pub fn instance_dir(&self, slug: &str) -> String {
        format!("{}/{slug}", self.instances_dir.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_job_bounds() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff, Duration::from_secs(30));
        assert_eq!(retry.attempt_timeout, Duration::from_secs(600));

        let t = Timings::default();
        assert_eq!(t.boot_grace, Duration::from_secs(60));
        assert_eq!(t.provisioning_timeout, Duration::from_secs(600));
        assert_eq!(t.ssh_attempts, 10);
    }

    #[test]
    fn instance_dir_joins_slug() {
        let mut cfg = crate::testing::config();
        cfg.instances_dir = "/srv/nr/".into();
        assert_eq!(cfg.instance_dir("abc"), "/srv/nr/abc");
    }
}
