//! Pod API client
//!
//! Implements the pod collection endpoints under `/api/podapi/`. Every
//! response is wrapped in the `{"status": "OK", "data": ...}` envelope.

use crate::error::OrchestratorError;
use crate::orchestrator_trait::OrchestratorClientTrait;
use kd_models::{Pod, PodCommand, PodId, UserId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries for transient failures
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
}

/// Pod API client
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    client: Client,
    base_url: String,
    token: String,
    max_retries: u32,
}

impl OrchestratorClient {
    /// Create a new client with the default timeout and retry policy
    ///
    /// # Arguments
    /// * `base_url` - KuberDock base URL (e.g., "https://master.kuberdock.local")
    /// * `token` - API token for authentication
    pub fn new(base_url: String, token: String) -> Result<Self, OrchestratorError> {
        Self::with_policy(base_url, token, DEFAULT_REQUEST_TIMEOUT, DEFAULT_MAX_RETRIES)
    }

    /// Create a new client with an explicit request timeout and retry count
    pub fn with_policy(
        base_url: String,
        token: String,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(OrchestratorError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            max_retries,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
    }

    /// Send a request, retrying connection errors, timeouts and 5xx answers.
    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<Response, OrchestratorError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0;
        loop {
            let result = self.authorized(build()).send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(e) => e.is_timeout() || e.is_connect(),
            };
            if !retryable || attempt >= self.max_retries {
                return result.map_err(OrchestratorError::Http);
            }
            attempt += 1;
            warn!(
                "{} failed (attempt {}/{}), retrying in {:?}",
                what, attempt, self.max_retries, delay
            );
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    /// Map a response to the envelope's payload or a typed error
    async fn unwrap_envelope<T: DeserializeOwned>(
        what: &str,
        response: Response,
    ) -> Result<Option<T>, OrchestratorError> {
        let status = response.status();
        let body = response.text().await?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(OrchestratorError::Authentication(format!(
                    "{}: {} - {}",
                    what, status, body
                )));
            }
            StatusCode::NOT_FOUND => {
                return Err(OrchestratorError::NotFound(what.to_string()));
            }
            StatusCode::CONFLICT | StatusCode::LOCKED => {
                return Err(OrchestratorError::Conflict(format!("{}: {}", what, body)));
            }
            s if !s.is_success() => {
                return Err(OrchestratorError::Api(format!("{}: {} - {}", what, status, body)));
            }
            _ => {}
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            OrchestratorError::Api(format!(
                "error decoding response body for {}: {} - Response (first 500 chars): {}",
                what,
                e,
                body.chars().take(500).collect::<String>()
            ))
        })?;

        if envelope.status != "OK" {
            return Err(OrchestratorError::Api(format!(
                "{}: {}",
                what,
                envelope.message.unwrap_or(envelope.status)
            )));
        }
        Ok(envelope.data)
    }

    fn pod_url(&self, id: PodId) -> String {
        format!("{}/api/podapi/{}", self.base_url, id)
    }
}

#[async_trait::async_trait]
impl OrchestratorClientTrait for OrchestratorClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_pods(&self, owner: UserId) -> Result<Vec<Pod>, OrchestratorError> {
        let owner_param = owner.to_string();
        let url = format!(
            "{}/api/podapi/?owner_id={}",
            self.base_url,
            urlencoding::encode(&owner_param)
        );
        debug!("Listing pods of user {}", owner);

        let what = format!("list pods of user {}", owner);
        let response = self.send_with_retry(&what, || self.client.get(&url)).await?;
        Ok(Self::unwrap_envelope::<Vec<Pod>>(&what, response).await?.unwrap_or_default())
    }

    async fn get_pod(&self, id: PodId) -> Result<Pod, OrchestratorError> {
        let url = self.pod_url(id);
        debug!("Fetching pod {}", id);

        let what = format!("pod {}", id);
        let response = self.send_with_retry(&what, || self.client.get(&url)).await?;
        Self::unwrap_envelope::<Pod>(&what, response)
            .await?
            .ok_or_else(|| OrchestratorError::Api(format!("{}: empty response", what)))
    }

    async fn update_pod(&self, id: PodId, command: PodCommand) -> Result<Pod, OrchestratorError> {
        let url = self.pod_url(id);
        let body = serde_json::json!({ "command": command.as_str() });
        debug!("Sending {} to pod {}", command.as_str(), id);

        let what = format!("{} pod {}", command.as_str(), id);
        let response = self
            .send_with_retry(&what, || self.client.put(&url).json(&body))
            .await?;
        Self::unwrap_envelope::<Pod>(&what, response)
            .await?
            .ok_or_else(|| OrchestratorError::Api(format!("{}: empty response", what)))
    }

    async fn delete_pod(&self, id: PodId) -> Result<(), OrchestratorError> {
        let url = self.pod_url(id);
        debug!("Deleting pod {}", id);

        let what = format!("delete pod {}", id);
        let response = self.send_with_retry(&what, || self.client.delete(&url)).await?;
        Self::unwrap_envelope::<serde_json::Value>(&what, response).await?;
        Ok(())
    }
}
