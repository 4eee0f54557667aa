//! Typed Rust client for the Cloudflare DNS records API.
//!
//! Covers the subset needed for publishing instance hostnames:
//! DNS records in one zone (list, create, patch, delete).

mod types;

pub use types::*;

const BASE_URL: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cloudflare api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloudflare api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("cloudflare api {endpoint} rejected the request: {message}")]
    Rejected {
        endpoint: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the DNS records of a single Cloudflare zone.
#[derive(Clone)]
pub struct CloudflareClient {
    token: String,
    zone_id: String,
    base_url: String,
    http: reqwest::Client,
}

impl CloudflareClient {
    pub fn new(token: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            zone_id: zone_id.into(),
            base_url: BASE_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the client at a different API root (mock servers, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/zones/{}{path}", self.base_url, self.zone_id)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Unwrap the `{success, errors, result}` envelope.
    fn unwrap_envelope<T>(envelope: Envelope<T>, endpoint: &'static str) -> Result<T> {
        if !envelope.success {
            return Err(Error::Rejected {
                endpoint,
                message: join_messages(&envelope.errors),
            });
        }
        envelope.result.ok_or_else(|| Error::Rejected {
            endpoint,
            message: "response carried no result".into(),
        })
    }

    // ── DNS records ──────────────────────────────────────────────────

    pub async fn list_records(&self, name: &str, record_type: &str) -> Result<Vec<DnsRecord>> {
        let resp = self
            .http
            .get(self.url("/dns_records"))
            .bearer_auth(&self.token)
            .query(&[("name", name), ("type", record_type)])
            .send()
            .await?;

        let envelope: Envelope<Vec<DnsRecord>> =
            Self::check(resp, "list records").await?.json().await?;
        Self::unwrap_envelope(envelope, "list records")
    }

    pub async fn create_record(&self, req: &CreateRecordRequest) -> Result<DnsRecord> {
        let resp = self
            .http
            .post(self.url("/dns_records"))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;

        let envelope: Envelope<DnsRecord> =
            Self::check(resp, "create record").await?.json().await?;
        Self::unwrap_envelope(envelope, "create record")
    }

    pub async fn update_record(&self, record_id: &str, req: &UpdateRecordRequest) -> Result<DnsRecord> {
        let resp = self
            .http
            .patch(self.url(&format!("/dns_records/{record_id}")))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;

        let envelope: Envelope<DnsRecord> =
            Self::check(resp, "update record").await?.json().await?;
        Self::unwrap_envelope(envelope, "update record")
    }

    /// Delete a record. Returns `false` when the record was already gone.
    pub async fn delete_record(&self, record_id: &str) -> Result<bool> {
        let resp = self
            .http
            .delete(self.url(&format!("/dns_records/{record_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(false);
        }

        let envelope: Envelope<DeletedRecord> =
            Self::check(resp, "delete record").await?.json().await?;
        Self::unwrap_envelope(envelope, "delete record")?;
        Ok(true)
    }
}

fn join_messages(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "unknown error".into();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_record_list_envelope() {
        let body = r#"{
            "success": true,
            "errors": [],
            "messages": [],
            "result": [
                {"id": "abc", "name": "flows.example.com", "type": "A",
                 "content": "203.0.113.7", "proxied": false, "ttl": 1}
            ]
        }"#;
        let envelope: Envelope<Vec<DnsRecord>> = serde_json::from_str(body).unwrap();
        let records = CloudflareClient::unwrap_envelope(envelope, "list records").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, "A");
        assert_eq!(records[0].content, "203.0.113.7");
    }

    #[test]
    fn unsuccessful_envelope_carries_messages() {
        let body = r#"{
            "success": false,
            "errors": [{"code": 81057, "message": "Record already exists."}],
            "result": null
        }"#;
        let envelope: Envelope<DnsRecord> = serde_json::from_str(body).unwrap();
        let err = CloudflareClient::unwrap_envelope(envelope, "create record").unwrap_err();
        assert!(err.to_string().contains("Record already exists. (81057)"));
    }

    #[test]
    fn update_request_skips_unset_fields() {
        let req = UpdateRecordRequest {
            content: Some("198.51.100.2".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"content": "198.51.100.2"}));
    }

    #[test]
    fn urls_are_zone_scoped() {
        let client = CloudflareClient::new("token", "zone-1").with_base_url("http://localhost:9");
        assert_eq!(
            client.url("/dns_records"),
            "http://localhost:9/zones/zone-1/dns_records"
        );
    }

    mod delete {
        use super::*;
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn client(server: &MockServer) -> CloudflareClient {
            CloudflareClient::new("token", "zone-1").with_base_url(server.uri())
        }

        #[tokio::test]
        async fn missing_record_reports_not_deleted() {
            let server = MockServer::start().await;
            Mock::given(method("DELETE"))
                .and(path("/zones/zone-1/dns_records/gone"))
                .respond_with(ResponseTemplate::new(404))
                .expect(1)
                .mount(&server)
                .await;

            let deleted = client(&server).delete_record("gone").await.unwrap();
            assert!(!deleted);
        }

        #[tokio::test]
        async fn existing_record_reports_deleted() {
            let server = MockServer::start().await;
            Mock::given(method("DELETE"))
                .and(path("/zones/zone-1/dns_records/abc"))
                .and(header("authorization", "Bearer token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "success": true,
                    "errors": [],
                    "result": {"id": "abc"}
                })))
                .expect(1)
                .mount(&server)
                .await;

            let deleted = client(&server).delete_record("abc").await.unwrap();
            assert!(deleted);
        }

        #[tokio::test]
        async fn server_error_is_not_swallowed() {
            let server = MockServer::start().await;
            Mock::given(method("DELETE"))
                .and(path("/zones/zone-1/dns_records/abc"))
                .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
                .mount(&server)
                .await;

            let err = client(&server).delete_record("abc").await.unwrap_err();
            assert!(matches!(err, Error::Api { status, .. } if status.as_u16() == 500));
        }
    }
}
