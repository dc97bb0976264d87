//! Upstream health probes.
//!
//! Each configured URL is requested concurrently. A probe is healthy when the
//! upstream answers at all with a non-5xx status; auth errors still prove it is up.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthEntry {
    pub status: HealthStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_duration_ms: u64,
    pub entries: BTreeMap<String, HealthEntry>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

pub struct HealthChecker {
    http_client: reqwest::Client,
    urls: BTreeMap<String, String>,
}

impl HealthChecker {
    pub fn new(config: &HealthConfig) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            http_client,
            urls: config.urls.clone(),
        })
    }

    /// Probe every URL and aggregate the results.
    pub async fn check(&self) -> HealthReport {
        let started = Instant::now();
        let mut probes = JoinSet::new();

        for (name, url) in &self.urls {
            let client = self.http_client.clone();
            let name = name.clone();
            let url = url.clone();
            probes.spawn(async move {
                let entry = probe(&client, &url).await;
                (name, entry)
            });
        }

        let mut entries = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((name, entry)) => {
                    entries.insert(name, entry);
                }
                Err(e) => warn!("Health probe task failed: {}", e),
            }
        }

        let status = if entries.len() == self.urls.len()
            && entries.values().all(|e| e.status == HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            total_duration_ms: started.elapsed().as_millis() as u64,
            entries,
        }
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> HealthEntry {
    let started = Instant::now();
    let result = client.get(url).send().await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) if response.status().as_u16() < 500 => {
            debug!(url, status = response.status().as_u16(), "Health probe succeeded");
            HealthEntry {
                status: HealthStatus::Healthy,
                duration_ms,
                description: None,
            }
        }
        Ok(response) => {
            warn!(url, status = response.status().as_u16(), "Health probe failed");
            HealthEntry {
                status: HealthStatus::Unhealthy,
                duration_ms,
                description: Some(format!("HTTP {}", response.status().as_u16())),
            }
        }
        Err(e) => {
            warn!(url, error = %e, "Health probe failed");
            HealthEntry {
                status: HealthStatus::Unhealthy,
                duration_ms,
                description: Some(if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    "unreachable".to_string()
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker(urls: &[(&str, String)]) -> HealthChecker {
        HealthChecker::new(&HealthConfig {
            timeout_seconds: 2,
            urls: urls
                .iter()
                .map(|(n, u)| (n.to_string(), u.clone()))
                .collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_reachable_is_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph"))
            // Graph answers 401 without a token; still up
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let report = checker(&[
            ("azure ad", format!("{}/login", server.uri())),
            ("graph api", format!("{}/graph", server.uri())),
        ])
        .check()
        .await;

        assert!(report.is_healthy());
        assert_eq!(report.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_server_error_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let report = checker(&[("graph api", server.uri())]).check().await;

        assert!(!report.is_healthy());
        let entry = &report.entries["graph api"];
        assert_eq!(entry.status, HealthStatus::Unhealthy);
        assert_eq!(entry.description.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_report_serialization() {
        let report = checker(&[]).check().await;
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "Healthy");
        assert!(value["entries"].as_object().unwrap().is_empty());
    }
}
