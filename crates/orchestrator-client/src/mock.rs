//! Mock OrchestratorClient for unit testing
//!
//! Keeps pods in memory and applies `start`/`stop` commands to their status.
//! Individual pods can be told to fail or hang on lifecycle commands so that
//! callers' timeout and rollback paths can be exercised.

use crate::error::OrchestratorError;
use crate::orchestrator_trait::OrchestratorClientTrait;
use kd_models::{Pod, PodCommand, PodId, PodStatus, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a pod reacts to lifecycle commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Fail,
    Hang(Duration),
    Stall,
}

/// Mock OrchestratorClient for testing
#[derive(Debug, Clone)]
pub struct MockOrchestratorClient {
    base_url: String,
    pods: Arc<Mutex<HashMap<PodId, Pod>>>,
    behaviours: Arc<Mutex<HashMap<PodId, Behaviour>>>,
    commands: Arc<Mutex<Vec<(PodId, PodCommand)>>>,
}

impl MockOrchestratorClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            pods: Arc::new(Mutex::new(HashMap::new())),
            behaviours: Arc::new(Mutex::new(HashMap::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a pod to the mock store (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod.id, pod);
    }

    /// Current copy of a pod, if known
    pub fn pod(&self, id: PodId) -> Option<Pod> {
        self.pods.lock().unwrap().get(&id).cloned()
    }

    /// Make every lifecycle command for `id` fail with an API error
    pub fn fail_commands_for(&self, id: PodId) {
        self.behaviours.lock().unwrap().insert(id, Behaviour::Fail);
    }

    /// Make every lifecycle command for `id` stall for `delay` before applying
    pub fn hang_commands_for(&self, id: PodId, delay: Duration) {
        self.behaviours.lock().unwrap().insert(id, Behaviour::Hang(delay));
    }

    /// Accept lifecycle commands for `id` but leave the pod in the
    /// transitional status (`stopping` or `pending`)
    pub fn stall_commands_for(&self, id: PodId) {
        self.behaviours.lock().unwrap().insert(id, Behaviour::Stall);
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.behaviours.lock().unwrap().clear();
    }

    /// Lifecycle commands received so far, in order
    pub fn commands(&self) -> Vec<(PodId, PodCommand)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OrchestratorClientTrait for MockOrchestratorClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_pods(&self, owner: UserId) -> Result<Vec<Pod>, OrchestratorError> {
        let pods = self.pods.lock().unwrap();
        let mut owned: Vec<Pod> = pods.values().filter(|p| p.owner_id == owner).cloned().collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(owned)
    }

    async fn get_pod(&self, id: PodId) -> Result<Pod, OrchestratorError> {
        self.pod(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Pod {} not found", id)))
    }

    async fn update_pod(&self, id: PodId, command: PodCommand) -> Result<Pod, OrchestratorError> {
        self.commands.lock().unwrap().push((id, command));

        let behaviour = self.behaviours.lock().unwrap().get(&id).copied();
        match behaviour {
            Some(Behaviour::Fail) => {
                return Err(OrchestratorError::Api(format!(
                    "{} pod {}: injected failure",
                    command.as_str(),
                    id
                )));
            }
            Some(Behaviour::Hang(delay)) => tokio::time::sleep(delay).await,
            Some(Behaviour::Stall) | None => {}
        }

        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Pod {} not found", id)))?;
        pod.status = match (command, behaviour) {
            (PodCommand::Start, Some(Behaviour::Stall)) => PodStatus::Pending,
            (PodCommand::Stop, Some(Behaviour::Stall)) => PodStatus::Stopping,
            (PodCommand::Start, _) => PodStatus::Running,
            (PodCommand::Stop, _) => PodStatus::Stopped,
        };
        Ok(pod.clone())
    }

    async fn delete_pod(&self, id: PodId) -> Result<(), OrchestratorError> {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Pod {} not found", id)))?;
        pod.status = PodStatus::Deleted;
        Ok(())
    }
}
