use async_trait::async_trait;
use cloudflare_api::{CloudflareClient, CreateRecordRequest, UpdateRecordRequest};
use tracing::{debug, info};

use crate::types::{DnsRecord, DnsRecordUpdate};
use crate::{DnsProvider, Error, Result};

/// Cloudflare-hosted zone for instance hostnames.
///
/// Delegates to `cloudflare_api::CloudflareClient` for all HTTP calls.
pub struct CloudflareDns {
    client: CloudflareClient,
    zone: String,
}

impl CloudflareDns {
    pub fn new(client: CloudflareClient, zone: impl Into<String>) -> Self {
        Self {
            client,
            zone: zone.into(),
        }
    }

    /// Create from env vars: `CLOUDFLARE_API_TOKEN`, `CLOUDFLARE_ZONE_ID`, `NR_BASE_DOMAIN`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("CLOUDFLARE_API_TOKEN")
            .map_err(|_| Error::MissingEnv("CLOUDFLARE_API_TOKEN".into()))?;
        let zone_id = std::env::var("CLOUDFLARE_ZONE_ID")
            .map_err(|_| Error::MissingEnv("CLOUDFLARE_ZONE_ID".into()))?;
        let zone = std::env::var("NR_BASE_DOMAIN")
            .map_err(|_| Error::MissingEnv("NR_BASE_DOMAIN".into()))?;

        Ok(Self::new(CloudflareClient::new(token, zone_id), zone))
    }

    fn convert(record: cloudflare_api::DnsRecord) -> DnsRecord {
        DnsRecord {
            id: record.id,
            name: record.name,
            record_type: record.record_type,
            content: record.content,
            proxied: record.proxied,
        }
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn ensure_a_record(&self, subdomain: &str, ip: &str, proxied: bool) -> Result<DnsRecord> {
        if let Some(existing) = self.find_record(subdomain, "A").await? {
            if existing.content == ip && existing.proxied == proxied {
                debug!(record = %existing.name, "dns: record already up to date");
                return Ok(existing);
            }
            info!(record = %existing.name, from = %existing.content, to = %ip, "dns: updating record");
            return self
                .update_record(
                    &existing.id,
                    &DnsRecordUpdate {
                        content: Some(ip.to_string()),
                        proxied: Some(proxied),
                        ..Default::default()
                    },
                )
                .await;
        }

        let fqdn = self.fqdn(subdomain);
        info!(record = %fqdn, ip = %ip, "dns: creating record");
        let record = self
            .client
            .create_record(&CreateRecordRequest {
                record_type: "A".into(),
                name: fqdn,
                content: ip.to_string(),
                ttl: 1,
                proxied,
            })
            .await?;
        Ok(Self::convert(record))
    }

    async fn delete_record(&self, record_id: &str) -> Result<bool> {
        let deleted = self.client.delete_record(record_id).await?;
        if deleted {
            info!(record_id, "dns: record deleted");
        } else {
            info!(record_id, "dns: record already gone");
        }
        Ok(deleted)
    }

    async fn update_record(&self, record_id: &str, update: &DnsRecordUpdate) -> Result<DnsRecord> {
        let record = self
            .client
            .update_record(
                record_id,
                &UpdateRecordRequest {
                    name: update.name.clone(),
                    content: update.content.clone(),
                    ttl: None,
                    proxied: update.proxied,
                },
            )
            .await?;
        Ok(Self::convert(record))
    }

    async fn find_record(&self, subdomain: &str, record_type: &str) -> Result<Option<DnsRecord>> {
        let records = self
            .client
            .list_records(&self.fqdn(subdomain), record_type)
            .await?;
        Ok(records.into_iter().next().map(Self::convert))
    }

    fn zone(&self) -> &str {
        &self.zone
    }

    fn name(&self) -> &'static str {
        "cloudflare"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_appends_zone() {
        let dns = CloudflareDns::new(CloudflareClient::new("t", "z"), "example.com");
        assert_eq!(dns.fqdn("flows"), "flows.example.com");
        assert_eq!(dns.name(), "cloudflare");
    }
}
