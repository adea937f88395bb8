//! Tenant suspension
//!
//! Suspending a user stops every running pod and returns every public
//! address to the pool; unsuspending gives the addresses back (the same
//! ones when still free) and restarts the pods suspension stopped.
//!
//! One suspend/unsuspend per user runs at a time, serialized by a per-user
//! lock. The user's state records progress: a run that fails part-way
//! leaves `Suspending` or `Unsuspending` behind, and rerunning the same
//! operation picks up from there. Address restoration on unsuspend is all
//! or nothing; if any pod cannot get an address back, every pod restored in
//! that run returns to its suspended config and the user stays `Suspended`.
//! A pod only counts as stopped or started once the pod API reports it in
//! that state.

use crate::backoff::FibonacciBackoff;
use crate::error::KdError;
use crate::lock::{pod_lock, Blocking, LockClient, PodOperation, DEFAULT_POD_OPERATION_TIMEOUT};
use crate::public_ip::PublicIpAssigner;
use crate::store::Store;
use kd_models::{Pod, PodCommand, PodId, PodStatus, SuspensionState, User, UserId};
use orchestrator_client::{OrchestratorClientTrait, OrchestratorError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STATUS_POLL_MIN: Duration = Duration::from_millis(50);
const STATUS_POLL_MAX: Duration = Duration::from_secs(5);

/// Bounds used while (un)suspending
#[derive(Debug, Clone, Copy)]
pub struct SuspensionSettings {
    /// TTL of the per-user lock
    pub lock_ttl: Duration,
    /// TTL of each pod operation lock
    pub pod_lock_ttl: Duration,
    /// Bound on one pod API call
    pub command_timeout: Duration,
}

impl Default for SuspensionSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(3600),
            pod_lock_ttl: DEFAULT_POD_OPERATION_TIMEOUT,
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// What a suspend/unsuspend did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionReport {
    /// User the run was for
    pub user_id: UserId,
    /// The user was already in the requested state
    pub unchanged: bool,
    /// Pods stopped (suspend) or started (unsuspend)
    pub pods: Vec<PodId>,
    /// Addresses freed (suspend) or restored (unsuspend)
    pub addresses: Vec<(PodId, Ipv4Addr)>,
}

impl SuspensionReport {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            unchanged: false,
            pods: Vec::new(),
            addresses: Vec::new(),
        }
    }

    fn unchanged(user_id: UserId) -> Self {
        Self {
            unchanged: true,
            ..Self::new(user_id)
        }
    }
}

/// Suspends and unsuspends users
pub struct SuspensionCoordinator {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn OrchestratorClientTrait>,
    assigner: PublicIpAssigner,
    locks: LockClient,
    settings: SuspensionSettings,
}

fn user_lock_name(user_id: UserId) -> String {
    format!("user.{}.suspension", user_id)
}

/// Whether `status` is where `command` leaves a pod
fn reached(command: PodCommand, status: PodStatus) -> bool {
    match command {
        PodCommand::Stop => status.is_stopped(),
        PodCommand::Start => matches!(status, PodStatus::Pending | PodStatus::Running),
    }
}

impl SuspensionCoordinator {
    /// Create a coordinator over the given store, pod API and locks
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn OrchestratorClientTrait>,
        assigner: PublicIpAssigner,
        locks: LockClient,
        settings: SuspensionSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            assigner,
            locks,
            settings,
        }
    }

    async fn load_user(&self, user_id: UserId) -> Result<User, KdError> {
        let mut tx = self.store.begin().await?;
        tx.get_user(user_id)
            .await?
            .ok_or(KdError::UserNotFound(user_id))
    }

    async fn save_user(&self, user: &User) -> Result<(), KdError> {
        let mut tx = self.store.begin().await?;
        tx.save_user(user.clone()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_state(&self, user: &mut User, state: SuspensionState) -> Result<(), KdError> {
        user.suspension = state;
        self.save_user(user).await?;
        info!("User {} is now {:?}", user.id, state);
        Ok(())
    }

    /// Current suspension state of a user
    pub async fn state(&self, user_id: UserId) -> Result<SuspensionState, KdError> {
        Ok(self.load_user(user_id).await?.suspension)
    }

    async fn live_pods(&self, user_id: UserId) -> Result<Vec<Pod>, KdError> {
        let pods = tokio::time::timeout(
            self.settings.command_timeout,
            self.orchestrator.list_pods(user_id),
        )
        .await
        .map_err(|_| {
            OrchestratorError::Api(format!("listing pods of user {} timed out", user_id))
        })??;
        Ok(pods.into_iter().filter(|p| !p.status.is_deleted()).collect())
    }

    /// Send `command` to a pod under its operation lock and wait for the
    /// pod to reach the commanded state, all within the command timeout.
    /// A timeout means the pod did not transition.
    async fn run_command(&self, pod_id: PodId, command: PodCommand) -> Result<Pod, KdError> {
        let operation = match command {
            PodCommand::Start => PodOperation::Start,
            PodCommand::Stop => PodOperation::Stop,
        };
        let lock = pod_lock(
            &self.locks,
            pod_id,
            operation,
            self.settings.pod_lock_ttl,
            0,
            Duration::ZERO,
        )
        .await?;
        let result = tokio::time::timeout(
            self.settings.command_timeout,
            self.transition(pod_id, command),
        )
        .await;
        lock.release_logged().await;

        let pod = match result {
            Err(_) => {
                return Err(KdError::OrchestratorTimeout {
                    pod_id,
                    command,
                    timeout: self.settings.command_timeout,
                });
            }
            Ok(result) => result?,
        };
        self.record_status(pod_id, pod.status).await?;
        Ok(pod)
    }

    async fn transition(&self, pod_id: PodId, command: PodCommand) -> Result<Pod, KdError> {
        let mut pod = self.orchestrator.update_pod(pod_id, command).await?;
        let mut backoff = FibonacciBackoff::new(STATUS_POLL_MIN, STATUS_POLL_MAX);
        while !reached(command, pod.status) {
            debug!("Pod {} is {:?} after {}", pod_id, pod.status, command.as_str());
            tokio::time::sleep(backoff.next_backoff()).await;
            pod = self.orchestrator.get_pod(pod_id).await?;
        }
        Ok(pod)
    }

    async fn record_status(&self, pod_id: PodId, status: PodStatus) -> Result<(), KdError> {
        let mut tx = self.store.begin().await?;
        if let Some(mut pod) = tx.get_pod(pod_id).await? {
            pod.status = status;
            tx.save_pod(pod).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Run `op` under the user's suspension lock
    async fn with_user_lock<F, Fut>(
        &self,
        user_id: UserId,
        op: F,
    ) -> Result<SuspensionReport, KdError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SuspensionReport, KdError>>,
    {
        self.locks
            .run_exclusive(
                &user_lock_name(user_id),
                Some(self.settings.lock_ttl),
                Blocking::No,
                op,
            )
            .await?
            .ok_or(KdError::SuspensionInProgress(user_id))
    }

    /// Stop a user's pods and take back their public addresses.
    pub async fn suspend(&self, user_id: UserId) -> Result<SuspensionReport, KdError> {
        let user = self.load_user(user_id).await?;
        if !user.is_suspendable() {
            return Err(KdError::UserNotSuspendable(user.username));
        }
        if user.suspension == SuspensionState::Suspended {
            info!("User {} is already suspended", user_id);
            return Ok(SuspensionReport::unchanged(user_id));
        }
        self.with_user_lock(user_id, || self.suspend_locked(user_id))
            .await
    }

    async fn suspend_locked(&self, user_id: UserId) -> Result<SuspensionReport, KdError> {
        // Re-read: another run may have finished while we waited on the lock
        let mut user = self.load_user(user_id).await?;
        if user.suspension == SuspensionState::Suspended {
            return Ok(SuspensionReport::unchanged(user_id));
        }
        if user.suspension != SuspensionState::Suspending {
            self.set_state(&mut user, SuspensionState::Suspending).await?;
        }

        let mut report = SuspensionReport::new(user_id);
        for pod in self.live_pods(user_id).await? {
            if !pod.status.is_stopped() {
                info!("Stopping pod {} of suspended user {}", pod.id, user_id);
                // Recorded first: a stop that completes after a timeout must
                // still be undone by unsuspend.
                if user.stopped_by_suspension.insert(pod.id) {
                    self.save_user(&user).await?;
                }
                if let Err(e) = self.run_command(pod.id, PodCommand::Stop).await {
                    error!("Suspension of user {} halted at pod {}: {}", user_id, pod.id, e);
                    return Err(e);
                }
                report.pods.push(pod.id);
            }
            if let Some(ip) = self.assigner.revoke(pod.id).await? {
                report.addresses.push((pod.id, ip));
            }
        }

        self.set_state(&mut user, SuspensionState::Suspended).await?;
        Ok(report)
    }

    /// Give a user's pods their addresses back and restart them.
    pub async fn unsuspend(&self, user_id: UserId) -> Result<SuspensionReport, KdError> {
        let user = self.load_user(user_id).await?;
        if user.suspension == SuspensionState::Active {
            info!("User {} is not suspended", user_id);
            return Ok(SuspensionReport::unchanged(user_id));
        }
        self.with_user_lock(user_id, || self.unsuspend_locked(user_id))
            .await
    }

    async fn unsuspend_locked(&self, user_id: UserId) -> Result<SuspensionReport, KdError> {
        let mut user = self.load_user(user_id).await?;
        if user.suspension == SuspensionState::Active {
            return Ok(SuspensionReport::unchanged(user_id));
        }
        let pods = self.live_pods(user_id).await?;
        self.set_state(&mut user, SuspensionState::Unsuspending).await?;

        let mut report = SuspensionReport::new(user_id);

        // Addresses first; any failure undoes this run's assignments.
        let mut restored: Vec<Pod> = Vec::new();
        for pod in &pods {
            let snapshot = match self.assigner.load_pod(pod.id).await {
                Ok(snapshot) => snapshot,
                Err(e) => return self.abort_unsuspend(&mut user, &restored, e).await,
            };
            if snapshot.config.freed_ip().is_none() {
                continue;
            }
            match self.assigner.assign(pod.id).await {
                Ok(Some(ip)) => {
                    report.addresses.push((pod.id, ip));
                    restored.push(snapshot);
                }
                Ok(None) => {}
                Err(e) => return self.abort_unsuspend(&mut user, &restored, e).await,
            }
        }

        for pod in &pods {
            if !user.stopped_by_suspension.contains(&pod.id) {
                continue;
            }
            if pod.status.is_stopped() {
                info!("Starting pod {} of unsuspended user {}", pod.id, user_id);
                if let Err(e) = self.run_command(pod.id, PodCommand::Start).await {
                    error!("Unsuspension of user {} halted at pod {}: {}", user_id, pod.id, e);
                    return Err(e);
                }
                report.pods.push(pod.id);
            }
            user.stopped_by_suspension.remove(&pod.id);
            self.save_user(&user).await?;
        }

        // Pods deleted while suspended are no longer tracked
        user.stopped_by_suspension.clear();
        self.set_state(&mut user, SuspensionState::Active).await?;
        Ok(report)
    }

    /// Put every pod in `restored` back to its suspended config and leave
    /// the user `Suspended`, then surface `cause`. If a pod cannot be put
    /// back the user stays `Unsuspending` and the rollback error is returned.
    async fn abort_unsuspend(
        &self,
        user: &mut User,
        restored: &[Pod],
        cause: KdError,
    ) -> Result<SuspensionReport, KdError> {
        warn!(
            "Unsuspension of user {} failed ({}), rolling back {} pod(s)",
            user.id,
            cause,
            restored.len()
        );
        let mut rollback_error = None;
        for previous in restored.iter().rev() {
            if let Err(e) = self.assigner.rollback_assign(previous).await {
                error!("Rollback of pod {} failed: {}", previous.id, e);
                rollback_error.get_or_insert(e);
            }
        }
        if let Some(e) = rollback_error {
            error!(
                "User {} left {:?} after a failed rollback",
                user.id, user.suspension
            );
            return Err(e);
        }
        self.set_state(user, SuspensionState::Suspended).await?;
        Err(cause)
    }
}
