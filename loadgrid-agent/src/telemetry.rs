//! Client for the external telemetry gateway
//!
//! The gateway serves, per node:
//! - `GET {gateway}/telemetry/{node}/instances` -> `{"instances": N}`
//! - `GET {gateway}/telemetry/{node}/metrics`   -> `{"cpu_percent": .., "memory_percent": ..}`

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("unreadable body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// CPU/memory figures reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ExternalMetrics {
    #[serde(alias = "cpu")]
    pub cpu_percent: f64,
    #[serde(alias = "memory")]
    pub memory_percent: f64,
}

#[derive(Debug, Deserialize)]
struct InstancesBody {
    instances: u32,
}

#[derive(Clone)]
pub struct TelemetryClient {
    http: reqwest::Client,
    base: String,
    node: String,
}

impl TelemetryClient {
    pub fn new(gateway_url: &str, node: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("loadgrid-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base: gateway_url.trim_end_matches('/').to_string(),
            node: node.to_string(),
        })
    }

    pub async fn fetch_metrics(&self) -> Result<ExternalMetrics, TelemetryError> {
        self.get_json(&format!("{}/telemetry/{}/metrics", self.base, self.node))
            .await
    }

    pub async fn fetch_instances(&self) -> Result<u32, TelemetryError> {
        let body: InstancesBody = self
            .get_json(&format!("{}/telemetry/{}/instances", self.base, self.node))
            .await?;
        Ok(body.instances)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, TelemetryError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| TelemetryError::Transport { url: url.to_string(), source })?;

        if !response.status().is_success() {
            return Err(TelemetryError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|source| TelemetryError::Decode { url: url.to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetches_instances_and_metrics() {
        let router = Router::new()
            .route("/telemetry/payment_processing/instances", get(|| async { Json(json!({"instances": 3})) }))
            .route(
                "/telemetry/payment_processing/metrics",
                get(|| async { Json(json!({"cpu": 41.5, "memory_percent": 22.0})) }),
            );
        let base = serve(router).await;

        let client = TelemetryClient::new(&format!("{base}/"), "payment_processing", Duration::from_secs(2)).unwrap();
        assert_eq!(client.fetch_instances().await.unwrap(), 3);
        assert_eq!(
            client.fetch_metrics().await.unwrap(),
            ExternalMetrics { cpu_percent: 41.5, memory_percent: 22.0 }
        );
    }

    #[tokio::test]
    async fn test_missing_route_is_status_error() {
        let base = serve(Router::new()).await;
        let client = TelemetryClient::new(&base, "user_management", Duration::from_secs(2)).unwrap();

        match client.fetch_instances().await {
            Err(TelemetryError::Status { status, url }) => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/telemetry/user_management/instances"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
