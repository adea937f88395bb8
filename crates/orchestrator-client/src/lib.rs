//! Pod API Client
//!
//! Client for the orchestrator's pod collection API, the only way the
//! KuberDock core issues lifecycle commands to pods.
//!
//! # Example
//!
//! ```no_run
//! use kd_models::{PodCommand, UserId};
//! use orchestrator_client::{OrchestratorClient, OrchestratorClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OrchestratorClient::new(
//!     "https://kuberdock.local".to_string(),
//!     "your-api-token".to_string(),
//! )?;
//!
//! for pod in client.list_pods(UserId(42)).await? {
//!     if !pod.status.is_stopped() {
//!         client.update_pod(pod.id, PodCommand::Stop).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Pod collection view**: list a user's pods, fetch a single pod
//! - **Lifecycle commands**: start/stop with bounded request timeouts
//! - **Retry Logic**: transient failures are retried with doubling delays
//! - **test-util**: in-memory `MockOrchestratorClient` with failure injection

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod orchestrator_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::OrchestratorClient;
pub use error::OrchestratorError;
pub use orchestrator_trait::OrchestratorClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockOrchestratorClient;
