use serde::{Deserialize, Serialize};

/// Opaque provider-side server identifier (e.g. a Hetzner server id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderId(pub String);

/// Specification for creating a server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    /// Provider-side key names injected into the server, in addition to configured ones.
    pub ssh_keys: Vec<String>,
}

/// Server status and metadata returned from the provider.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: ProviderId,
    pub name: String,
    pub state: ServerState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub server_type: String,
    pub location: String,
}

/// Provider-reported server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Stopped,
    Deleting,
    Unknown,
}

/// One purchasable server size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerTypeInfo {
    pub name: String,
    pub cores: i32,
    pub memory_mb: i32,
    pub disk_gb: i32,
    pub prices: Vec<Pricing>,
}

impl ServerTypeInfo {
    pub fn is_available_in(&self, location: &str) -> bool {
        self.prices.is_empty() || self.prices.iter().any(|p| p.location == location)
    }
}

/// Net prices for a server type in one location, in the provider's currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pricing {
    pub location: String,
    pub hourly_net: f64,
    pub monthly_net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationInfo {
    pub name: String,
    pub description: String,
    pub city: String,
    pub country: String,
}

/// A DNS record as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub record_type: String,
    pub content: String,
    pub proxied: bool,
}

/// Fields to change on an existing record.
#[derive(Debug, Clone, Default)]
pub struct DnsRecordUpdate {
    pub name: Option<String>,
    pub content: Option<String>,
    pub proxied: Option<bool>,
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
