use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::types::{FlowSegmentResponse, IncidentDetailResponse};
use super::TrafficProvider;
use crate::config::{ProviderConfig, RequestConfig};
use crate::error::{ProviderError, ProviderResult};
use crate::geo::BoundingBox;
use crate::storage::{FlowRecord, IncidentEvent};

const API_VERSION: &str = "1.0";

/// Client for the Azure Maps traffic flow and incident APIs
#[derive(Clone)]
pub struct AzureMapsClient {
    client: Client,
    base_url: String,
    subscription_key: String,
    language: String,
    request_config: RequestConfig,
}

impl AzureMapsClient {
    /// Create a new Azure Maps client
    pub fn new(config: &ProviderConfig, request_config: RequestConfig) -> ProviderResult<Self> {
        let subscription_key = config
            .subscription_key
            .clone()
            .ok_or(ProviderError::NotConfigured)?;

        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            subscription_key,
            language: config.language.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` with `query`, retrying with exponential backoff
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        let url = format!("{}{}", self.base_url, path);

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(self.request_config.backoff_delay_ms(retries));
                warn!(
                    endpoint,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying Azure Maps request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, query).await {
                Ok(body) => {
                    info!(
                        endpoint,
                        latency_ms = start.elapsed().as_millis(),
                        "Azure Maps call succeeded"
                    );
                    return Ok(body);
                }
                // A payload we cannot decode will not improve on retry.
                Err(e @ ProviderError::InvalidResponse { .. }) => {
                    error!(endpoint, error = %e, "Azure Maps returned an unreadable payload");
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        endpoint,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Azure Maps call failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        // With retries disabled, surface the underlying error as is.
        match last_error {
            Some(e) if self.request_config.max_retries == 0 => Err(e),
            last_error => Err(ProviderError::Unavailable {
                message: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string()),
                retries: retries.saturating_sub(1),
            }),
        }
    }

    /// Execute a single request (internal)
    async fn execute_request<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        debug!(url = %url, "Calling Azure Maps");

        let response = self
            .client
            .get(url)
            .query(&[
                ("api-version", API_VERSION.to_string()),
                ("subscription-key", self.subscription_key.clone()),
            ])
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    timeout_ms: self.request_config.timeout_ms,
                }
            } else {
                ProviderError::Http(e)
            }
        })?;

        serde_json::from_slice(&bytes).map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {}", e),
        })
    }
}

#[async_trait]
impl TrafficProvider for AzureMapsClient {
    fn name(&self) -> &'static str {
        "azure-maps"
    }

    async fn fetch_flows(&self, bbox: BoundingBox) -> ProviderResult<Vec<FlowRecord>> {
        let response: FlowSegmentResponse = self
            .get_json(
                "flow",
                "/traffic/flow/segment/json",
                &[
                    ("style", "absolute".to_string()),
                    ("zoom", "10".to_string()),
                    ("query", format!("{},{}", bbox.min_lat(), bbox.min_lon())),
                ],
            )
            .await?;

        Ok(response.into_flow_records(&bbox, Utc::now()))
    }

    async fn fetch_incidents(&self, bbox: BoundingBox) -> ProviderResult<Vec<IncidentEvent>> {
        let response: IncidentDetailResponse = self
            .get_json(
                "incidents",
                "/traffic/incident/detail/json",
                &[
                    (
                        "bbox",
                        format!(
                            "{},{},{},{}",
                            bbox.min_lon(),
                            bbox.min_lat(),
                            bbox.max_lon(),
                            bbox.max_lat()
                        ),
                    ),
                    ("language", self.language.clone()),
                    ("projection", "EPSG4326".to_string()),
                ],
            )
            .await?;

        Ok(response.into_incident_events(Utc::now()))
    }
}
