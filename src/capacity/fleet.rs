//! Fleet manager: the one pluggable interface to whatever provisions workers.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors raised by a fleet manager.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Fleet request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fleet control plane returned HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Fleet request rejected: {0}")]
    Rejected(String),
}

/// Controls the size of the worker fleet.
#[async_trait]
pub trait FleetManager: Send + Sync {
    /// Number of workers currently in the fleet.
    async fn current_size(&self) -> Result<u32, FleetError>;

    /// Asks for the fleet to be resized to `size` workers.
    async fn request_size(&self, size: u32) -> Result<(), FleetError>;

    /// Tells the fleet a worker finished draining and may be terminated.
    async fn acknowledge_termination(&self, worker_id: &str) -> Result<(), FleetError>;
}

#[derive(Debug, Default)]
struct FleetState {
    size: u32,
    requested: Vec<u32>,
    acknowledged: Vec<String>,
}

/// In-process fleet. Resize requests take effect immediately.
#[derive(Debug, Default)]
pub struct InMemoryFleet {
    state: Mutex<FleetState>,
}

impl InMemoryFleet {
    /// Creates a fleet of `size` workers.
    pub fn new(size: u32) -> Self {
        Self {
            state: Mutex::new(FleetState {
                size,
                ..Default::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FleetState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Every size requested so far, oldest first.
    pub fn requested_sizes(&self) -> Vec<u32> {
        self.with_state(|s| s.requested.clone())
    }

    /// Workers whose termination was acknowledged.
    pub fn acknowledged(&self) -> Vec<String> {
        self.with_state(|s| s.acknowledged.clone())
    }
}

#[async_trait]
impl FleetManager for InMemoryFleet {
    async fn current_size(&self) -> Result<u32, FleetError> {
        Ok(self.with_state(|s| s.size))
    }

    async fn request_size(&self, size: u32) -> Result<(), FleetError> {
        self.with_state(|s| {
            s.requested.push(size);
            s.size = size;
        });
        Ok(())
    }

    async fn acknowledge_termination(&self, worker_id: &str) -> Result<(), FleetError> {
        self.with_state(|s| s.acknowledged.push(worker_id.to_string()));
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FleetSizeBody {
    size: u32,
}

#[derive(Debug, Serialize)]
struct DesiredSizeBody {
    desired_size: u32,
}

/// Client for an HTTP fleet control plane.
///
/// Endpoints, relative to the base URL:
/// - `GET /fleet` → `{"size": n}`
/// - `PUT /fleet` with `{"desired_size": n}`
/// - `POST /workers/{worker_id}/termination-ack`
pub struct HttpFleetManager {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFleetManager {
    /// Creates a client for the control plane at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("User-Agent", "trialforge/1.0");
        match self.token {
            Some(ref token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, FleetError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 409 || status.as_u16() == 422 {
            return Err(FleetError::Rejected(body));
        }
        Err(FleetError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl FleetManager for HttpFleetManager {
    async fn current_size(&self) -> Result<u32, FleetError> {
        let response = self
            .authorize(self.client.get(self.url("/fleet")))
            .send()
            .await?;
        let body: FleetSizeBody = Self::check(response).await?.json().await?;
        Ok(body.size)
    }

    async fn request_size(&self, size: u32) -> Result<(), FleetError> {
        let response = self
            .authorize(self.client.put(self.url("/fleet")))
            .json(&DesiredSizeBody { desired_size: size })
            .send()
            .await?;
        Self::check(response).await?;
        debug!(size, "Fleet resize requested");
        Ok(())
    }

    async fn acknowledge_termination(&self, worker_id: &str) -> Result<(), FleetError> {
        let path = format!("/workers/{}/termination-ack", worker_id);
        let response = self
            .authorize(self.client.post(self.url(&path)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_fleet_records_requests() {
        let fleet = InMemoryFleet::new(2);
        assert_eq!(fleet.current_size().await.unwrap(), 2);

        fleet.request_size(5).await.unwrap();
        fleet.request_size(3).await.unwrap();
        fleet.acknowledge_termination("w-1").await.unwrap();

        assert_eq!(fleet.current_size().await.unwrap(), 3);
        assert_eq!(fleet.requested_sizes(), vec![5, 3]);
        assert_eq!(fleet.acknowledged(), vec!["w-1".to_string()]);
    }

    #[test]
    fn test_http_fleet_urls() {
        let fleet = HttpFleetManager::new("http://control:8080/", None);
        assert_eq!(fleet.url("/fleet"), "http://control:8080/fleet");
    }

    #[test]
    fn test_fleet_error_display() {
        let err = FleetError::UnexpectedStatus {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }
}
