//! Reconciler sweeps over environments deployed through the orchestrator.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use ephemeral_env::testing::{deploy_request, TestHarness};
use ephemeral_env::{
    CommitState, DeployOutcome, EnvironmentKey, EnvironmentStatus, InstanceState, StateStore,
};

async fn deployed(h: &TestHarness, pr: u64) -> String {
    let outcome = h
        .orchestrator
        .handle(&deploy_request("acme/widgets", pr, "abc123"))
        .await
        .unwrap();
    assert!(matches!(outcome, DeployOutcome::Running { .. }));
    h.store
        .get_environment(&EnvironmentKey::new("acme/widgets", pr))
        .await
        .unwrap()
        .unwrap()
        .compute_instance_id
        .unwrap()
}

#[tokio::test]
async fn vanished_instance_fails_running_environment() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(dir.path());
    let instance = deployed(&h, 42).await;
    h.compute.remove_instance(&instance);

    let stats = h.reconciler.sweep().await;
    assert_eq!(stats.stale_records_fixed, 1);
    assert_eq!(stats.errors, 0);

    let env = h
        .store
        .get_environment(&EnvironmentKey::new("acme/widgets", 42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.status, EnvironmentStatus::Failed);
    assert!(env.compute_instance_id.is_none());
    assert!(env.tunnel_url.is_none());

    // A second sweep finds nothing left to fix.
    let stats = h.reconciler.sweep().await;
    assert_eq!(stats.stale_records_fixed, 0);
}

#[tokio::test]
async fn idle_environment_stops_then_expires() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(dir.path());
    let key = EnvironmentKey::new("acme/widgets", 42);
    let instance = deployed(&h, 42).await;

    // Not idle yet.
    let stats = h.reconciler.sweep_at(Utc::now() + Duration::hours(3)).await;
    assert_eq!(stats.stopped_idle, 0);

    let stats = h
        .reconciler
        .sweep_at(Utc::now() + Duration::hours(4) + Duration::minutes(1))
        .await;
    assert_eq!(stats.stopped_idle, 1);
    assert_eq!(stats.errors, 0);
    let env = h.store.get_environment(&key).await.unwrap().unwrap();
    assert_eq!(env.status, EnvironmentStatus::Stopped);
    assert!(env.stopped_at.is_some());
    assert!(env.tunnel_url.is_none());
    assert_eq!(env.compute_instance_id.as_deref(), Some(instance.as_str()));
    assert_eq!(h.compute.stop_calls(&instance), 1);
    assert_eq!(h.compute.instance_state(&instance), Some(InstanceState::Stopped));

    let stats = h
        .reconciler
        .sweep_at(Utc::now() + Duration::hours(29))
        .await;
    assert_eq!(stats.terminated_expired, 1);
    let env = h.store.get_environment(&key).await.unwrap().unwrap();
    assert_eq!(env.status, EnvironmentStatus::Destroyed);
    assert_eq!(h.compute.terminate_calls(&instance), 1);
    assert_eq!(h.compute.instance_state(&instance), Some(InstanceState::Terminated));
}

#[tokio::test]
async fn stopped_environment_restarts_on_new_push() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(dir.path());
    let instance = deployed(&h, 42).await;
    h.reconciler
        .sweep_at(Utc::now() + Duration::hours(5))
        .await;

    let outcome = h
        .orchestrator
        .handle(&deploy_request("acme/widgets", 42, "def456"))
        .await
        .unwrap();
    assert!(matches!(outcome, DeployOutcome::Running { .. }));

    let env = h
        .store
        .get_environment(&EnvironmentKey::new("acme/widgets", 42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.compute_instance_id.as_deref(), Some(instance.as_str()));
    assert!(env.stopped_at.is_none());
    assert_eq!(h.compute.start_calls(&instance), 1);
    assert_eq!(h.compute.launch_attempts(), 1);
}

#[tokio::test]
async fn push_while_stopping_deploys_once_stopped() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(dir.path());
    let key = EnvironmentKey::new("acme/widgets", 42);
    let instance = deployed(&h, 42).await;
    let mut env = h.store.get_environment(&key).await.unwrap().unwrap();
    env.status = EnvironmentStatus::Stopping;
    h.store.put_environment(&env).await.unwrap();

    let outcome = h
        .orchestrator
        .handle(&deploy_request("acme/widgets", 42, "def456"))
        .await
        .unwrap();
    assert!(matches!(outcome, DeployOutcome::Queued { .. }));
    let env = h.store.get_environment(&key).await.unwrap().unwrap();
    assert_eq!(env.status, EnvironmentStatus::Stopping);
    assert_eq!(env.queued_commit.as_deref(), Some("def456"));
    let last = h.review.statuses().pop().unwrap();
    assert_eq!(last.sha, "def456");
    assert_eq!(last.state, CommitState::Pending);

    // The stop is finished by the stuck-state repair, which hands the
    // queued commit on.
    let stats = h.reconciler.sweep_at(Utc::now() + Duration::hours(2)).await;
    assert_eq!(stats.stuck_repaired, 1);
    assert_eq!(stats.errors, 0);

    let env = h.store.get_environment(&key).await.unwrap().unwrap();
    assert_eq!(env.status, EnvironmentStatus::Running);
    assert_eq!(env.commit_sha, "def456");
    assert!(env.queued_commit.is_none());
    assert_eq!(env.compute_instance_id.as_deref(), Some(instance.as_str()));
    assert_eq!(h.compute.start_calls(&instance), 1);
    assert_eq!(h.compute.launch_attempts(), 1);

    let builds = h.store.list_builds(&key.to_string()).await.unwrap();
    let queued: Vec<_> = builds.iter().filter(|b| b.commit_sha == "def456").collect();
    assert_eq!(queued.len(), 1);
    let last = h.review.statuses().pop().unwrap();
    assert_eq!(last.sha, "def456");
    assert_eq!(last.state, CommitState::Success);
}

#[tokio::test]
async fn closed_pull_request_is_destroyed() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(dir.path());
    let instance = deployed(&h, 42).await;
    let other = deployed(&h, 43).await;
    h.review.close_pull_request("acme/widgets", 42);

    let stats = h.reconciler.sweep().await;
    assert_eq!(stats.prs_checked, 2);
    assert_eq!(stats.orphans_terminated, 1);

    let env = h
        .store
        .get_environment(&EnvironmentKey::new("acme/widgets", 42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.status, EnvironmentStatus::Destroyed);
    assert_eq!(h.compute.terminate_calls(&instance), 1);
    assert_eq!(h.compute.instance_state(&other), Some(InstanceState::Running));
}

#[tokio::test]
async fn pull_request_lookup_failures_are_counted_not_fatal() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(dir.path());
    let instance = deployed(&h, 42).await;
    h.review.fail_pr_lookups(true);

    let stats = h.reconciler.sweep().await;
    assert_eq!(stats.errors, 1);
    assert_eq!(h.compute.instance_state(&instance), Some(InstanceState::Running));
}
