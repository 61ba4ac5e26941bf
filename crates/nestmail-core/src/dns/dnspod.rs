//! DNSPod record management
//!
//! Talks to the DNSPod token API: form-encoded POSTs, JSON responses,
//! with the application status carried in `status.code` ("1" is success).

use crate::dns::DnsProvider;
use async_trait::async_trait;
use nestmail_common::config::DnsConfig;
use nestmail_common::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// DNSPod-backed DNS provider
pub struct DnsPodProvider {
    client: reqwest::Client,
    api_url: String,
    login_token: String,
    domain: String,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    status: ApiStatus,
    record: Option<ApiRecord>,
}

#[derive(Debug, Deserialize)]
struct RemoveResponse {
    status: ApiStatus,
}

impl DnsPodProvider {
    /// Create a provider for `domain` using the credentials in `config`
    pub fn new(config: &DnsConfig, domain: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::DnsProvider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            login_token: format!("{},{}", config.secret_id, config.secret_key),
            domain,
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.api_url, action);

        let mut form: Vec<(&str, &str)> = vec![
            ("login_token", self.login_token.as_str()),
            ("format", "json"),
            ("domain", self.domain.as_str()),
        ];
        form.extend_from_slice(params);

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::DnsProvider(format!("{} request failed: {}", action, e)))?;

        if !response.status().is_success() {
            return Err(Error::DnsProvider(format!(
                "{} returned HTTP {}",
                action,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::DnsProvider(format!("{} returned invalid JSON: {}", action, e)))
    }
}

#[async_trait]
impl DnsProvider for DnsPodProvider {
    async fn create_mx_record(
        &self,
        subdomain: &str,
        target: &str,
        priority: u16,
        ttl: u32,
    ) -> Result<String> {
        debug!(subdomain, target, "Creating MX record");

        let mx = priority.to_string();
        let ttl = ttl.to_string();
        let response: CreateResponse = self
            .post(
                "Record.Create",
                &[
                    ("sub_domain", subdomain),
                    ("record_type", "MX"),
                    ("record_line", "默认"),
                    ("value", target),
                    ("mx", mx.as_str()),
                    ("ttl", ttl.as_str()),
                ],
            )
            .await?;

        if response.status.code != "1" {
            return Err(Error::DnsProvider(format!(
                "Record.Create failed: {} ({})",
                response.status.message, response.status.code
            )));
        }

        let record_id = response
            .record
            .map(|r| record_id_string(&r.id))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::DnsProvider("Record.Create returned no record id".to_string()))?;

        info!(subdomain, record_id, "MX record created");
        Ok(record_id)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        debug!(record_id, "Deleting DNS record");

        let response: RemoveResponse = self
            .post("Record.Remove", &[("record_id", record_id)])
            .await?;

        if response.status.code != "1" {
            return Err(Error::DnsProvider(format!(
                "Record.Remove failed: {} ({})",
                response.status.message, response.status.code
            )));
        }

        info!(record_id, "DNS record deleted");
        Ok(())
    }
}

/// The API serializes record ids as strings in some responses and as
/// numbers in others.
fn record_id_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
