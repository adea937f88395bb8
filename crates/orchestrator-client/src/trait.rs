//! OrchestratorClient trait for mocking
//!
//! The suspension coordinator only sees this trait, so tests can swap in the
//! in-memory mock.

use crate::error::OrchestratorError;
use kd_models::{Pod, PodCommand, PodId, UserId};

/// Trait for pod API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait OrchestratorClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// List all pods owned by `owner` (deleted pods included)
    async fn list_pods(&self, owner: UserId) -> Result<Vec<Pod>, OrchestratorError>;

    /// Fetch a single pod
    async fn get_pod(&self, id: PodId) -> Result<Pod, OrchestratorError>;

    /// Issue a lifecycle command and return the pod as it looks afterwards
    async fn update_pod(&self, id: PodId, command: PodCommand) -> Result<Pod, OrchestratorError>;

    /// Delete a pod
    async fn delete_pod(&self, id: PodId) -> Result<(), OrchestratorError>;
}
