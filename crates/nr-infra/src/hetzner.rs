use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::{locations_api, server_types_api, servers_api, ssh_keys_api};
use hcloud::models;
use moka::future::Cache;
use tracing::{debug, info, warn};

use crate::types::{
    LocationInfo, Pricing, ProviderId, ServerInfo, ServerSpec, ServerState, ServerTypeInfo,
};
use crate::{CloudProvider, Error, Result};

/// Server types and locations change rarely; refresh them weekly.
const CATALOG_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const PAGE_SIZE: i64 = 50;

/// Hetzner Cloud provider using the `hcloud` crate.
///
/// All configuration is loaded from environment variables via `from_env()`.
pub struct HetznerProvider {
    config: Configuration,
    location: String,
    image: String,
    network_id: Option<i64>,
    firewall_id: Option<i64>,
    ssh_key_names: Vec<String>,
    server_types: Cache<(), Arc<Vec<ServerTypeInfo>>>,
    locations: Cache<(), Arc<Vec<LocationInfo>>>,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_LOCATION` (default: `"fsn1"`)
    /// - `HETZNER_IMAGE` (default: `"ubuntu-24.04"`)
    /// - `HETZNER_NETWORK_ID` (optional, integer)
    /// - `HETZNER_FIREWALL_ID` (optional, integer)
    /// - `HETZNER_SSH_KEY_NAMES` (comma-separated names, optional)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;
        if token.trim().is_empty() {
            return Err(Error::Config("HETZNER_API_TOKEN is empty".into()));
        }

        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        let location = std::env::var("HETZNER_LOCATION").unwrap_or_else(|_| "fsn1".into());
        let image = std::env::var("HETZNER_IMAGE").unwrap_or_else(|_| "ubuntu-24.04".into());

        let network_id = std::env::var("HETZNER_NETWORK_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        let firewall_id = std::env::var("HETZNER_FIREWALL_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        let ssh_key_names: Vec<String> = std::env::var("HETZNER_SSH_KEY_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            config,
            location,
            image,
            network_id,
            firewall_id,
            ssh_key_names,
            server_types: Cache::builder().time_to_live(CATALOG_TTL).build(),
            locations: Cache::builder().time_to_live(CATALOG_TTL).build(),
        })
    }

    fn parse_state(status: &models::server::Status) -> ServerState {
        match status {
            models::server::Status::Running => ServerState::Running,
            models::server::Status::Initializing | models::server::Status::Starting => {
                ServerState::Starting
            }
            models::server::Status::Off | models::server::Status::Stopping => ServerState::Stopped,
            models::server::Status::Deleting => ServerState::Deleting,
            _ => ServerState::Unknown,
        }
    }

    fn server_info(server: &models::Server) -> ServerInfo {
        ServerInfo {
            id: ProviderId(server.id.to_string()),
            name: server.name.clone(),
            state: Self::parse_state(&server.status),
            public_ip: server.public_net.ipv4.as_ref().map(|v4| v4.ip.clone()),
            private_ip: server.private_net.first().and_then(|net| net.ip.clone()),
            server_type: server.server_type.name.clone(),
            location: server.datacenter.location.name.clone(),
        }
    }

    fn server_type_info(st: &models::ServerType) -> ServerTypeInfo {
        ServerTypeInfo {
            name: st.name.clone(),
            cores: st.cores as i32,
            // Hetzner reports memory in GB as a float.
            memory_mb: (st.memory * 1024.0) as i32,
            disk_gb: st.disk as i32,
            prices: st
                .prices
                .iter()
                .map(|p| Pricing {
                    location: p.location.clone(),
                    hourly_net: p.price_hourly.net.parse().unwrap_or(0.0),
                    monthly_net: p.price_monthly.net.parse().unwrap_or(0.0),
                })
                .collect(),
        }
    }

    fn parse_id(id: &ProviderId) -> Result<i64> {
        id.0.parse::<i64>()
            .map_err(|_| Error::InvalidId(id.0.clone()))
    }

    async fn fetch_server_types(&self) -> Result<Vec<ServerTypeInfo>> {
        let mut types = Vec::new();
        let mut page = 1;
        loop {
            let resp = server_types_api::list_server_types(
                &self.config,
                server_types_api::ListServerTypesParams {
                    page: Some(page),
                    per_page: Some(PAGE_SIZE),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::HetznerApi(format!("list server types (page {page}): {e}")))?;

            let count = resp.server_types.len() as i64;
            types.extend(resp.server_types.iter().map(Self::server_type_info));
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        types.sort_by_key(|t| (t.memory_mb, t.disk_gb));
        debug!(count = types.len(), "hetzner: server types fetched");
        Ok(types)
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerInfo> {
        let firewalls = self.firewall_id.map(|fw_id| {
            vec![models::CreateServerRequestFirewalls {
                firewall: fw_id,
            }]
        });

        let mut key_names = self.ssh_key_names.clone();
        for name in &spec.ssh_keys {
            if !key_names.contains(name) {
                key_names.push(name.clone());
            }
        }
        let ssh_keys = if key_names.is_empty() {
            None
        } else {
            Some(key_names)
        };

        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: spec.name.clone(),
                    server_type: spec.server_type.clone(),
                    image: spec.image.clone(),
                    location: Some(spec.location.clone()),
                    user_data: None,
                    networks: self.network_id.map(|id| vec![id]),
                    firewalls,
                    ssh_keys,
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: None,
                    placement_group: None,
                    public_net: None,
                },
            },
        )
        .await
        .map_err(|e| {
            Error::HetznerApi(format!(
                "create server (type {}, location {}): {e}",
                spec.server_type, spec.location
            ))
        })?;

        let info = Self::server_info(&resp.server);
        info!(server_id = %info.id.0, server_type = %spec.server_type, location = %spec.location, "hetzner: server created");
        Ok(info)
    }

    async fn delete_server(&self, id: &ProviderId) -> Result<bool> {
        let server_id = Self::parse_id(id)?;

        if let Err(e) = servers_api::delete_server(
            &self.config,
            servers_api::DeleteServerParams { id: server_id },
        )
        .await
        {
            let msg = format!("{e}");
            if msg.contains("404") {
                warn!(server_id = %id.0, "hetzner: server already deleted");
                return Ok(false);
            }
            return Err(Error::HetznerApi(format!("delete server {}: {e}", id.0)));
        }

        info!(server_id = %id.0, "hetzner: server deleted");
        Ok(true)
    }

    async fn reboot_server(&self, id: &ProviderId) -> Result<bool> {
        let server_id = Self::parse_id(id)?;

        servers_api::soft_reboot_server(
            &self.config,
            servers_api::SoftRebootServerParams { id: server_id },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("reboot server {}: {e}", id.0)))?;

        info!(server_id = %id.0, "hetzner: server rebooting");
        Ok(true)
    }

    async fn get_server(&self, id: &ProviderId) -> Result<ServerInfo> {
        let server_id = Self::parse_id(id)?;

        let resp = servers_api::get_server(
            &self.config,
            servers_api::GetServerParams { id: server_id },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("get server {}: {e}", id.0)))?;

        let server = resp
            .server
            .ok_or_else(|| Error::HetznerApi("server not found in response".into()))?;

        Ok(Self::server_info(&server))
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let mut servers = Vec::new();
        let mut page = 1;
        loop {
            let resp = servers_api::list_servers(
                &self.config,
                servers_api::ListServersParams {
                    page: Some(page),
                    per_page: Some(PAGE_SIZE),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::HetznerApi(format!("list servers (page {page}): {e}")))?;

            let count = resp.servers.len() as i64;
            servers.extend(resp.servers.iter().map(Self::server_info));
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(servers)
    }

    async fn list_server_types(&self) -> Result<Vec<ServerTypeInfo>> {
        if let Some(cached) = self.server_types.get(&()).await {
            return Ok(cached.as_ref().clone());
        }
        let types = Arc::new(self.fetch_server_types().await?);
        self.server_types.insert((), types.clone()).await;
        Ok(types.as_ref().clone())
    }

    async fn list_locations(&self) -> Result<Vec<LocationInfo>> {
        if let Some(cached) = self.locations.get(&()).await {
            return Ok(cached.as_ref().clone());
        }

        let resp = locations_api::list_locations(&self.config, Default::default())
            .await
            .map_err(|e| Error::HetznerApi(format!("list locations: {e}")))?;

        let locations: Vec<LocationInfo> = resp
            .locations
            .iter()
            .map(|l| LocationInfo {
                name: l.name.clone(),
                description: l.description.clone(),
                city: l.city.clone(),
                country: l.country.clone(),
            })
            .collect();

        self.locations
            .insert((), Arc::new(locations.clone()))
            .await;
        Ok(locations)
    }

    async fn pricing(&self, server_type: &str, location: &str) -> Result<Option<Pricing>> {
        let types = self.list_server_types().await?;
        Ok(types
            .into_iter()
            .find(|t| t.name == server_type)
            .and_then(|t| t.prices.into_iter().find(|p| p.location == location)))
    }

    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()> {
        let existing = ssh_keys_api::list_ssh_keys(
            &self.config,
            ssh_keys_api::ListSshKeysParams {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("list ssh keys: {e}")))?;

        if !existing.ssh_keys.is_empty() {
            debug!(name, "hetzner: ssh key already registered");
            return Ok(());
        }

        ssh_keys_api::create_ssh_key(
            &self.config,
            ssh_keys_api::CreateSshKeyParams {
                create_ssh_key_request: models::CreateSshKeyRequest {
                    name: name.to_string(),
                    public_key: public_key.trim().to_string(),
                    labels: None,
                },
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("create ssh key {name}: {e}")))?;

        info!(name, "hetzner: ssh key registered");
        Ok(())
    }

    fn default_location(&self) -> &str {
        &self.location
    }

    fn default_image(&self) -> &str {
        &self.image
    }

    fn name(&self) -> &'static str {
        "hetzner"
    }
}
