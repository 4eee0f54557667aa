pub mod dns;
pub mod hetzner;
pub mod ssh;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use types::{
    CommandOutput, DnsRecord, DnsRecordUpdate, LocationInfo, Pricing, ProviderId, ServerInfo,
    ServerSpec, ServerTypeInfo,
};

pub use ssh::shell_quote;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hetzner api error: {0}")]
    HetznerApi(String),

    #[error("dns provider error: {0}")]
    Dns(#[from] cloudflare_api::Error),

    #[error("remote {host}: {message}")]
    Remote { host: String, message: String },

    #[error("remote {host}: `{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Configuration problems never get better by retrying.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::MissingEnv(_) | Self::Config(_) | Self::InvalidId(_))
    }
}

/// Backend-agnostic interface to the VM provider.
///
/// Owns its configuration, loaded from environment variables at construction.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Create and start a server. Returns as soon as the provider assigned an id.
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerInfo>;

    /// Delete a server permanently. `false` when it was already gone.
    async fn delete_server(&self, id: &ProviderId) -> Result<bool>;

    async fn reboot_server(&self, id: &ProviderId) -> Result<bool>;

    async fn get_server(&self, id: &ProviderId) -> Result<ServerInfo>;

    async fn list_servers(&self) -> Result<Vec<ServerInfo>>;

    /// All server types, sorted by memory then disk.
    async fn list_server_types(&self) -> Result<Vec<ServerTypeInfo>>;

    async fn list_locations(&self) -> Result<Vec<LocationInfo>>;

    async fn pricing(&self, server_type: &str, location: &str) -> Result<Option<Pricing>>;

    /// Register the operator key with the provider unless a key of that name exists.
    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()>;

    /// Location used when the caller has no preference.
    fn default_location(&self) -> &str;

    /// Image new servers boot from.
    fn default_image(&self) -> &str;

    /// Provider identifier.
    fn name(&self) -> &'static str;
}

/// Typed access to the DNS zone that hosts instance hostnames.
#[async_trait]
pub trait DnsProvider: Send + Sync + 'static {
    /// Create the A record for `subdomain` or point the existing one at `ip`.
    async fn ensure_a_record(&self, subdomain: &str, ip: &str, proxied: bool) -> Result<DnsRecord>;

    /// `false` when the record did not exist.
    async fn delete_record(&self, record_id: &str) -> Result<bool>;

    async fn update_record(&self, record_id: &str, update: &DnsRecordUpdate) -> Result<DnsRecord>;

    async fn find_record(&self, subdomain: &str, record_type: &str) -> Result<Option<DnsRecord>>;

    /// Zone apex, e.g. `example.com`.
    fn zone(&self) -> &str;

    /// Provider identifier stored on domain rows.
    fn name(&self) -> &'static str;

    fn fqdn(&self, subdomain: &str) -> String {
        format!("{subdomain}.{}", self.zone())
    }
}

/// Command channel to one server.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command. With `check`, a non-zero exit is an error.
    async fn execute(&self, command: &str, check: bool) -> Result<CommandOutput>;

    /// Write `content` to `remote_path` with the given octal mode.
    async fn upload(&self, content: &str, remote_path: &str, mode: u32) -> Result<()>;

    fn host(&self) -> &str;

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        let out = self
            .execute(&format!("test -d {}", shell_quote(path)), false)
            .await?;
        Ok(out.success())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let out = self
            .execute(&format!("test -f {}", shell_quote(path)), false)
            .await?;
        Ok(out.success())
    }
}

/// Opens command channels by address.
pub trait RemoteConnector: Send + Sync + 'static {
    fn connect(&self, host: &str) -> Arc<dyn RemoteExecutor>;

    /// Operator public key to install on servers, if configured.
    fn public_key(&self) -> Option<&str>;
}
