//! Out-of-band resolver feed from a Cloudflare DNS TXT record
//!
//! A pre-known resolver list can be published as a TXT record whose content
//! is a comma-separated list of `host:port` entries. When enabled, the
//! record is fetched at startup and refreshed every five minutes.

use crate::config::CloudflareConfig;
use crate::resolver::{Pool, ResolverKind};
use crate::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TxtRecord {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    #[serde(default)]
    result: Vec<TxtRecord>,
}

/// Cloudflare DNS API client, read-only.
pub struct Client {
    config: CloudflareConfig,
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(config: CloudflareConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Client {
            config,
            http,
            base_url: API_BASE.to_string(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
            && !self.config.api_token.is_empty()
            && !self.config.zone_id.is_empty()
    }

    /// Fetch the resolver list from the configured TXT record.
    pub async fn fetch_resolvers(&self) -> Result<Vec<String>> {
        let content = self.get_txt_record(&self.config.txt_record).await?;
        let resolvers: Vec<String> = content
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        info!("fetched {} resolvers from TXT record", resolvers.len());
        Ok(resolvers)
    }

    async fn get_txt_record(&self, name: &str) -> Result<String> {
        let url = format!(
            "{}/zones/{}/dns_records?type=TXT&name={}",
            self.base_url, self.config.zone_id, name
        );
        let resp: ListRecordsResponse = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await?
            .json()
            .await?;

        if !resp.success {
            let reason = resp
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "API request failed".to_string());
            return Err(Error::http(format!("Cloudflare API error: {}", reason)));
        }
        resp.result
            .into_iter()
            .next()
            .map(|r| r.content)
            .ok_or_else(|| Error::http(format!("TXT record not found: {}", name)))
    }

    /// Re-fetch the TXT record every five minutes and add anything new to
    /// the pool.
    pub async fn run_refresh(
        &self,
        pool: Arc<Pool>,
        kind: ResolverKind,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(REFRESH_INTERVAL);
        ticker.tick().await; // startup fetch already happened
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.fetch_resolvers().await {
                        Ok(resolvers) => {
                            pool.add_multiple(&resolvers, kind);
                            info!("TXT refresh: pool now holds {} resolvers", pool.count());
                        }
                        Err(e) => warn!("TXT refresh failed: {}", e),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(enabled: bool, token: &str, zone: &str) -> Client {
        Client::new(CloudflareConfig {
            enabled,
            api_token: token.to_string(),
            zone_id: zone.to_string(),
            txt_record: "resolvers.example.com".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_disabled_without_credentials() {
        assert!(!client(true, "", "zone").is_enabled());
        assert!(!client(true, "token", "").is_enabled());
        assert!(!client(false, "token", "zone").is_enabled());
        assert!(client(true, "token", "zone").is_enabled());
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "success": true,
            "errors": [],
            "result": [{"id": "abc", "name": "resolvers.example.com",
                        "type": "TXT", "content": "8.8.8.8:53, 1.1.1.1:53,",
                        "ttl": 300}]
        }"#;
        let resp: ListRecordsResponse = serde_json::from_str(body).unwrap();
        assert!(resp.success);
        let entries: Vec<&str> = resp.result[0]
            .content
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(entries, vec!["8.8.8.8:53", "1.1.1.1:53"]);
    }

    #[test]
    fn test_error_response_parsing() {
        let body = r#"{"success": false, "errors": [{"code": 9109, "message": "Invalid access token"}], "result": []}"#;
        let resp: ListRecordsResponse = serde_json::from_str(body).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.errors[0].message, "Invalid access token");
    }
}
