//! Suspension scenarios against the in-memory store and the mock pod API

use kd_core::lock::{pod_lock, MemoryLeaseBackend, PodOperation};
use kd_core::{
    IpPool, KdError, LockClient, MemoryStore, NewNetwork, PublicIpAssigner, Store,
    SuspensionCoordinator, SuspensionSettings,
};
use kd_models::{
    ContainerSpec, Pod, PodCommand, PodStatus, PortSpec, PublicIp, Role, SuspensionState, User,
    UserId,
};
use orchestrator_client::MockOrchestratorClient;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const USER: UserId = UserId(7);

struct Harness {
    store: MemoryStore,
    orchestrator: MockOrchestratorClient,
    locks: LockClient,
    assigner: PublicIpAssigner,
    coordinator: SuspensionCoordinator,
}

impl Harness {
    async fn new(cidr: &str) -> Self {
        let store = MemoryStore::new();
        let orchestrator = MockOrchestratorClient::new("http://test-kd");
        let locks = LockClient::new(Arc::new(MemoryLeaseBackend::new()));
        let assigner = PublicIpAssigner::new(Arc::new(store.clone()), false);
        assigner
            .pool()
            .create(NewNetwork {
                network: cidr.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let coordinator = SuspensionCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(orchestrator.clone()),
            assigner.clone(),
            locks.clone(),
            SuspensionSettings {
                command_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );

        let h = Self {
            store,
            orchestrator,
            locks,
            assigner,
            coordinator,
        };
        h.save_user(User::new(USER, "alice")).await;
        h
    }

    fn pool(&self) -> &IpPool {
        self.assigner.pool()
    }

    async fn save_user(&self, user: User) {
        let mut tx = self.store.begin().await.unwrap();
        tx.save_user(user).await.unwrap();
        tx.commit().await.unwrap();
    }

    /// Pod known to both the database and the pod API; public ones get an address
    async fn add_pod(&self, owner: UserId, name: &str, status: PodStatus, public: bool) -> Pod {
        let port = if public {
            PortSpec::public(80)
        } else {
            PortSpec::private(80)
        };
        let mut pod = Pod::new(
            owner,
            name,
            vec![ContainerSpec {
                name: name.to_string(),
                image: "nginx".to_string(),
                ports: vec![port],
            }],
        );
        pod.status = status;

        let mut tx = self.store.begin().await.unwrap();
        tx.save_pod(pod.clone()).await.unwrap();
        tx.commit().await.unwrap();
        self.orchestrator.add_pod(pod.clone());

        if public {
            self.assigner.assign(pod.id).await.unwrap();
        }
        self.assigner.load_pod(pod.id).await.unwrap()
    }

    async fn config_ip(&self, pod: &Pod) -> PublicIp {
        self.assigner.load_pod(pod.id).await.unwrap().config.public_ip()
    }
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_suspend_stops_pods_and_frees_addresses() {
    let h = Harness::new("10.0.0.0/29").await;
    let web = h.add_pod(USER, "web", PodStatus::Running, true).await;
    let idle = h.add_pod(USER, "idle", PodStatus::Stopped, true).await;
    let db = h.add_pod(USER, "db", PodStatus::Running, false).await;

    let report = h.coordinator.suspend(USER).await.unwrap();

    assert!(!report.unchanged);
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspended);
    assert!(h.pool().user_addresses(USER).await.unwrap().is_empty());
    for pod in [&web, &idle, &db] {
        assert!(h.orchestrator.pod(pod.id).unwrap().status.is_stopped());
    }
    assert_eq!(h.config_ip(&web).await, PublicIp::Freed(ip("10.0.0.1")));
    assert_eq!(h.config_ip(&idle).await, PublicIp::Freed(ip("10.0.0.2")));
    assert_eq!(h.config_ip(&db).await, PublicIp::Unassigned);
    // Only running pods received a stop.
    let mut stopped = report.pods.clone();
    stopped.sort();
    let mut expected = vec![web.id, db.id];
    expected.sort();
    assert_eq!(stopped, expected);
}

#[tokio::test]
async fn test_suspend_twice_is_noop() {
    let h = Harness::new("10.0.0.0/29").await;
    h.add_pod(USER, "web", PodStatus::Running, true).await;

    h.coordinator.suspend(USER).await.unwrap();
    let commands = h.orchestrator.commands().len();
    let again = h.coordinator.suspend(USER).await.unwrap();

    assert!(again.unchanged);
    assert_eq!(h.orchestrator.commands().len(), commands);
}

#[tokio::test]
async fn test_admin_and_internal_user_are_not_suspendable() {
    let h = Harness::new("10.0.0.0/29").await;
    let mut admin = User::new(UserId(1), "root");
    admin.role = Role::Admin;
    h.save_user(admin).await;
    h.save_user(User::new(UserId(2), kd_models::KUBERDOCK_INTERNAL_USER))
        .await;

    assert!(matches!(
        h.coordinator.suspend(UserId(1)).await,
        Err(KdError::UserNotSuspendable(_))
    ));
    assert!(matches!(
        h.coordinator.suspend(UserId(2)).await,
        Err(KdError::UserNotSuspendable(_))
    ));
    assert!(matches!(
        h.coordinator.suspend(UserId(99)).await,
        Err(KdError::UserNotFound(_))
    ));
}

#[tokio::test]
async fn test_unsuspend_restores_addresses_and_restarts_stopped_pods() {
    let h = Harness::new("10.0.0.0/29").await;
    let web = h.add_pod(USER, "web", PodStatus::Running, true).await;
    let idle = h.add_pod(USER, "idle", PodStatus::Stopped, true).await;

    h.coordinator.suspend(USER).await.unwrap();
    let report = h.coordinator.unsuspend(USER).await.unwrap();

    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Active);
    assert_eq!(h.config_ip(&web).await, PublicIp::Assigned(ip("10.0.0.1")));
    assert_eq!(h.config_ip(&idle).await, PublicIp::Assigned(ip("10.0.0.2")));
    assert_eq!(report.pods, vec![web.id]);
    assert_eq!(h.orchestrator.pod(web.id).unwrap().status, PodStatus::Running);
    assert_eq!(h.orchestrator.pod(idle.id).unwrap().status, PodStatus::Stopped);

    let restored = h.assigner.load_pod(web.id).await.unwrap();
    assert_eq!(restored.config, web.config);

    let again = h.coordinator.unsuspend(USER).await.unwrap();
    assert!(again.unchanged);
}

#[tokio::test]
async fn test_unsuspend_gets_new_address_when_old_one_taken() {
    let h = Harness::new("10.0.0.0/29").await;
    let web = h.add_pod(USER, "web", PodStatus::Running, true).await;

    h.coordinator.suspend(USER).await.unwrap();
    let squatter = h.add_pod(UserId(8), "other", PodStatus::Running, true).await;
    assert_eq!(h.config_ip(&squatter).await, PublicIp::Assigned(ip("10.0.0.1")));

    h.coordinator.unsuspend(USER).await.unwrap();
    assert_eq!(h.config_ip(&web).await, PublicIp::Assigned(ip("10.0.0.2")));
}

#[tokio::test]
async fn test_unsuspend_is_all_or_nothing() {
    // Two host addresses: .1 and .2
    let h = Harness::new("10.0.0.0/30").await;
    let first = h.add_pod(USER, "a-first", PodStatus::Running, true).await;
    let second = h.add_pod(USER, "b-second", PodStatus::Running, true).await;
    h.coordinator.suspend(USER).await.unwrap();
    let suspended_first = h.assigner.load_pod(first.id).await.unwrap();
    let suspended_second = h.assigner.load_pod(second.id).await.unwrap();

    // Someone else takes .2; with .1 going back to the first pod nothing is left.
    let squatter_one = h.add_pod(UserId(8), "x", PodStatus::Running, true).await;
    let squatter_two = h.add_pod(UserId(8), "y", PodStatus::Running, true).await;
    h.assigner.release_for_deletion(squatter_one.id).await.unwrap();
    assert_eq!(h.config_ip(&squatter_two).await, PublicIp::Assigned(ip("10.0.0.2")));

    let result = h.coordinator.unsuspend(USER).await;

    assert!(matches!(result, Err(KdError::NoFreeIps)));
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspended);
    assert!(h.pool().user_addresses(USER).await.unwrap().is_empty());
    assert_eq!(h.assigner.load_pod(first.id).await.unwrap().config, suspended_first.config);
    assert_eq!(h.assigner.load_pod(second.id).await.unwrap().config, suspended_second.config);
    assert!(h
        .orchestrator
        .commands()
        .iter()
        .all(|(_, command)| *command == PodCommand::Stop));

    // Once the address is free again the retry succeeds with the original addresses.
    h.assigner.release_for_deletion(squatter_two.id).await.unwrap();
    h.coordinator.unsuspend(USER).await.unwrap();
    assert_eq!(h.config_ip(&first).await, PublicIp::Assigned(ip("10.0.0.1")));
    assert_eq!(h.config_ip(&second).await, PublicIp::Assigned(ip("10.0.0.2")));
}

#[tokio::test]
async fn test_stop_timeout_leaves_suspending_and_rerun_resumes() {
    let h = Harness::new("10.0.0.0/29").await;
    let slow = h.add_pod(USER, "slow", PodStatus::Running, true).await;
    h.orchestrator.hang_commands_for(slow.id, Duration::from_secs(5));

    let result = h.coordinator.suspend(USER).await;

    assert!(matches!(
        result,
        Err(KdError::OrchestratorTimeout { pod_id, .. }) if pod_id == slow.id
    ));
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspending);
    // Not transitioned, so the address stays.
    assert_eq!(h.config_ip(&slow).await, PublicIp::Assigned(ip("10.0.0.1")));

    h.orchestrator.clear_failures();
    h.coordinator.suspend(USER).await.unwrap();
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspended);
    assert_eq!(h.config_ip(&slow).await, PublicIp::Freed(ip("10.0.0.1")));
}

#[tokio::test]
async fn test_pod_stuck_stopping_keeps_its_address() {
    let h = Harness::new("10.0.0.0/29").await;
    let web = h.add_pod(USER, "web", PodStatus::Running, true).await;
    h.orchestrator.stall_commands_for(web.id);

    let result = h.coordinator.suspend(USER).await;

    assert!(matches!(
        result,
        Err(KdError::OrchestratorTimeout { pod_id, command: PodCommand::Stop, .. })
            if pod_id == web.id
    ));
    assert_eq!(h.orchestrator.pod(web.id).unwrap().status, PodStatus::Stopping);
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspending);
    assert_eq!(h.config_ip(&web).await, PublicIp::Assigned(ip("10.0.0.1")));
    assert!(h.pool().find_by_pod(web.id).await.unwrap().is_some());

    // Once the pod can stop, a rerun finishes and unsuspend restarts it.
    h.orchestrator.clear_failures();
    h.coordinator.suspend(USER).await.unwrap();
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspended);
    assert_eq!(h.config_ip(&web).await, PublicIp::Freed(ip("10.0.0.1")));

    h.coordinator.unsuspend(USER).await.unwrap();
    assert_eq!(h.orchestrator.pod(web.id).unwrap().status, PodStatus::Running);
}

#[tokio::test]
async fn test_failed_rollback_leaves_unsuspending_and_consistent() {
    let h = Harness::new("10.0.0.0/30").await;
    let first = h.add_pod(USER, "a-first", PodStatus::Running, true).await;
    let second = h.add_pod(USER, "b-second", PodStatus::Running, true).await;
    h.coordinator.suspend(USER).await.unwrap();

    let squatter_one = h.add_pod(UserId(8), "x", PodStatus::Running, true).await;
    let squatter_two = h.add_pod(UserId(8), "y", PodStatus::Running, true).await;
    h.assigner.release_for_deletion(squatter_one.id).await.unwrap();

    // The first pod's restore is written, its rollback write is not.
    h.store.fail_pod_save_after(1);
    let result = h.coordinator.unsuspend(USER).await;

    assert!(matches!(result, Err(KdError::Store(_))));
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Unsuspending);
    assert_eq!(h.config_ip(&first).await, PublicIp::Assigned(ip("10.0.0.1")));
    let held = h.pool().find_by_pod(first.id).await.unwrap().unwrap();
    assert_eq!(held.addr(), ip("10.0.0.1"));
    assert!(h
        .orchestrator
        .commands()
        .iter()
        .all(|(_, command)| *command == PodCommand::Stop));

    h.assigner.release_for_deletion(squatter_two.id).await.unwrap();
    h.coordinator.unsuspend(USER).await.unwrap();
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Active);
    assert_eq!(h.config_ip(&first).await, PublicIp::Assigned(ip("10.0.0.1")));
    assert_eq!(h.config_ip(&second).await, PublicIp::Assigned(ip("10.0.0.2")));
}

#[tokio::test]
async fn test_start_failure_leaves_unsuspending() {
    let h = Harness::new("10.0.0.0/29").await;
    let web = h.add_pod(USER, "web", PodStatus::Running, true).await;
    h.coordinator.suspend(USER).await.unwrap();

    h.orchestrator.fail_commands_for(web.id);
    assert!(matches!(
        h.coordinator.unsuspend(USER).await,
        Err(KdError::Orchestrator(_))
    ));
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Unsuspending);
    assert_eq!(h.config_ip(&web).await, PublicIp::Assigned(ip("10.0.0.1")));

    h.orchestrator.clear_failures();
    let report = h.coordinator.unsuspend(USER).await.unwrap();
    assert_eq!(report.pods, vec![web.id]);
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Active);
}

#[tokio::test]
async fn test_concurrent_suspend_is_refused() {
    let h = Harness::new("10.0.0.0/29").await;
    let slow = h.add_pod(USER, "slow", PodStatus::Running, true).await;
    h.orchestrator.hang_commands_for(slow.id, Duration::from_millis(50));

    let (first, second) = tokio::join!(h.coordinator.suspend(USER), h.coordinator.suspend(USER));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(KdError::SuspensionInProgress(id)) if *id == USER)));
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspended);
}

#[tokio::test]
async fn test_locked_pod_halts_suspension() {
    let h = Harness::new("10.0.0.0/29").await;
    let web = h.add_pod(USER, "web", PodStatus::Running, true).await;
    let ttl = Duration::from_secs(60);
    let held = pod_lock(&h.locks, web.id, PodOperation::Start, ttl, 0, Duration::ZERO)
        .await
        .unwrap();

    let result = h.coordinator.suspend(USER).await;

    assert!(matches!(
        result,
        Err(KdError::PodIsLocked { ref operation, .. }) if operation == "start"
    ));
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspending);
    assert!(h.orchestrator.commands().is_empty());

    held.release().await.unwrap();
    h.coordinator.suspend(USER).await.unwrap();
    assert_eq!(h.coordinator.state(USER).await.unwrap(), SuspensionState::Suspended);
}
