//! Periodic cleanup sweep.
//!
//! Enforces the idle and stopped-lifetime policies and repairs drift between
//! the state store and the compute provider. Observed infrastructure always
//! wins: records are corrected to match what actually exists. Every action
//! is idempotent, so a sweep may overlap in-flight requests and a failed
//! sweep is simply retried by the next one.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::build::BuildStatus;
use crate::config::OrchestratorConfig;
use crate::environment::{Environment, EnvironmentKey, EnvironmentStatus};
use crate::error::Result;
use crate::orchestrator::{write_time, DeployOrchestrator, DeployOutcome, Services};

/// Slack on top of the request timeout before an in-between state counts
/// as abandoned.
const STUCK_GRACE_SECS: i64 = 60;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub stopped_idle: usize,
    pub terminated_expired: usize,
    pub orphans_terminated: usize,
    pub stale_records_fixed: usize,
    pub stuck_repaired: usize,
    pub prs_checked: usize,
    pub purged_records: usize,
    pub errors: usize,
}

enum StuckRepair {
    None,
    Failed,
    StopAgain,
    Teardown,
}

enum AfterStop {
    Nothing,
    Stopped,
    Teardown,
    Deploy,
}

/// Runs sweeps against shared [`Services`].
pub struct Reconciler {
    config: Arc<OrchestratorConfig>,
    orchestrator: DeployOrchestrator,
}

impl Reconciler {
    pub fn new(config: Arc<OrchestratorConfig>, services: Services) -> Self {
        Self {
            orchestrator: DeployOrchestrator::new(config.clone(), services),
            config,
        }
    }

    fn services(&self) -> &Services {
        self.orchestrator.services()
    }

    /// Sweeps once at the current time.
    pub async fn sweep(&self) -> ReconcileStats {
        self.sweep_at(Utc::now()).await
    }

    /// Sweeps once, judging ages against `now`. Never fails; per-item
    /// errors are logged and counted.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        tracing::info!("reconcile sweep started");

        self.fix_stale_records(&mut stats).await;
        self.stop_idle(now, &mut stats).await;
        self.terminate_expired(now, &mut stats).await;
        self.repair_stuck(now, &mut stats).await;
        self.reap_orphans(&mut stats).await;

        match self.services().store.purge_expired(now).await {
            Ok(purged) => stats.purged_records = purged,
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(error = %e, "failed to purge expired records");
            }
        }

        tracing::info!(
            stopped_idle = stats.stopped_idle,
            terminated_expired = stats.terminated_expired,
            orphans_terminated = stats.orphans_terminated,
            stale_records_fixed = stats.stale_records_fixed,
            stuck_repaired = stats.stuck_repaired,
            prs_checked = stats.prs_checked,
            purged_records = stats.purged_records,
            errors = stats.errors,
            "reconcile sweep finished"
        );
        stats
    }

    /// Sweeps every reconcile interval until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;
        Ok(())
    }

    /// Sweeps every reconcile interval until `shutdown` completes. A sweep
    /// in progress is finished first.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        let interval = self.config.reconcile_interval();
        tracing::info!(interval_secs = interval.as_secs(), "reconciler started");
        tokio::pin!(shutdown);

        loop {
            self.sweep().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => {
                    tracing::info!("reconciler shutting down");
                    return;
                }
            }
        }
    }

    async fn list(&self, status: EnvironmentStatus, stats: &mut ReconcileStats) -> Vec<Environment> {
        match self.services().store.list_by_status(status).await {
            Ok(envs) => envs,
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(status = %status, error = %e, "failed to list environments");
                Vec::new()
            }
        }
    }

    /// Running or stopped records whose instance no longer exists.
    async fn fix_stale_records(&self, stats: &mut ReconcileStats) {
        for status in [EnvironmentStatus::Running, EnvironmentStatus::Stopped] {
            for env in self.list(status, stats).await {
                let result = self.fix_vanished(&env).await;
                tally(&mut stats.stale_records_fixed, &mut stats.errors, &env, "stale record", result);
            }
        }
    }

    async fn fix_vanished(&self, env: &Environment) -> Result<bool> {
        let alive = match &env.compute_instance_id {
            Some(instance_id) => self.services().compute.is_alive(instance_id).await?,
            None => false,
        };
        if alive {
            return Ok(false);
        }

        let key = env.key();
        let fixed = {
            let _guard = self.services().locks.lock(&key).await;
            let mut current = self.orchestrator.load(&key).await?;
            if current.status != env.status || current.compute_instance_id != env.compute_instance_id {
                return Ok(false);
            }
            let now = write_time(&current);
            match current.status {
                EnvironmentStatus::Running => {
                    tracing::warn!(env = %key, instance_id = ?env.compute_instance_id, "instance vanished under running environment");
                    current.compute_instance_id = None;
                    current.tunnel_id = None;
                    current.tunnel_url = None;
                    current.fail("compute instance no longer exists", now)?;
                }
                _ => {
                    tracing::warn!(env = %key, instance_id = ?env.compute_instance_id, "instance vanished under stopped environment");
                    current.transition(EnvironmentStatus::Destroyed, now)?;
                }
            }
            self.orchestrator.persist(&mut current, now).await?;
            current
        };

        if fixed.status == EnvironmentStatus::Failed {
            self.orchestrator
                .post_comment(
                    &fixed.repo_full_name,
                    fixed.pr_number,
                    "### Ephemeral environment failed\n\n\
                     The environment's instance no longer exists. Push a new commit to redeploy.",
                )
                .await;
        }
        Ok(true)
    }

    /// Running environments idle past the threshold, and failed ones left
    /// holding an instance.
    async fn stop_idle(&self, now: DateTime<Utc>, stats: &mut ReconcileStats) {
        let threshold = self.config.idle_threshold();

        for env in self.list(EnvironmentStatus::Running, stats).await {
            if env.last_activity_at + threshold > now {
                continue;
            }
            let result = match self.has_active_build(&env).await {
                Ok(true) => Ok(false),
                Ok(false) => self.stop_environment(&env.key(), EnvironmentStatus::Running).await,
                Err(e) => Err(e),
            };
            tally(&mut stats.stopped_idle, &mut stats.errors, &env, "idle stop", result);
        }

        for env in self.list(EnvironmentStatus::Failed, stats).await {
            if env.compute_instance_id.is_none() || env.updated_at + threshold > now {
                continue;
            }
            let result = self.stop_environment(&env.key(), EnvironmentStatus::Failed).await;
            tally(&mut stats.stopped_idle, &mut stats.errors, &env, "failed stop", result);
        }
    }

    async fn has_active_build(&self, env: &Environment) -> Result<bool> {
        Ok(self
            .services()
            .store
            .get_latest_build(&env.id())
            .await?
            .map_or(false, |b| b.status.is_active()))
    }

    /// `expected` → `stopping` → stop instance → `stopped`.
    async fn stop_environment(&self, key: &EnvironmentKey, expected: EnvironmentStatus) -> Result<bool> {
        let instance_id = {
            let _guard = self.services().locks.lock(key).await;
            let mut env = self.orchestrator.load(key).await?;
            if env.status != expected {
                return Ok(false);
            }
            let now = write_time(&env);
            env.transition(EnvironmentStatus::Stopping, now)?;
            self.orchestrator.persist(&mut env, now).await?;
            env.compute_instance_id
        };

        if let Some(instance_id) = &instance_id {
            self.services().compute.stop(instance_id).await?;
        }
        self.finish_stop(key).await?;
        Ok(true)
    }

    /// `stopping` → `stopped`, then on to teardown if a destroy arrived
    /// meanwhile, or to a fresh deploy if a push did.
    async fn finish_stop(&self, key: &EnvironmentKey) -> Result<()> {
        let next = self
            .orchestrator
            .update_env(key, |env, now| {
                if env.status != EnvironmentStatus::Stopping {
                    return Ok(AfterStop::Nothing);
                }
                if env.destroy_requested {
                    return Ok(AfterStop::Teardown);
                }
                env.transition(EnvironmentStatus::Stopped, now)?;
                env.tunnel_id = None;
                env.tunnel_url = None;
                Ok(if env.queued_commit.is_some() {
                    AfterStop::Deploy
                } else {
                    AfterStop::Stopped
                })
            })
            .await?;

        match next {
            AfterStop::Nothing => {}
            AfterStop::Stopped => tracing::info!(env = %key, "environment stopped"),
            AfterStop::Teardown => {
                self.orchestrator
                    .teardown(key, "the pull request was closed")
                    .await?;
            }
            AfterStop::Deploy => {
                tracing::info!(env = %key, "environment stopped, deploying commit pushed meanwhile");
                match self.orchestrator.deploy_queued(key).await {
                    Ok(outcome) => tracing::info!(env = %key, outcome = %outcome, "queued deploy handled"),
                    Err(e) => tracing::warn!(env = %key, error = %e, "queued deploy rejected"),
                }
            }
        }
        Ok(())
    }

    /// Stopped environments past their lifetime.
    async fn terminate_expired(&self, now: DateTime<Utc>, stats: &mut ReconcileStats) {
        let lifetime = self.config.stopped_lifetime();

        for env in self.list(EnvironmentStatus::Stopped, stats).await {
            let stopped_at = env.stopped_at.unwrap_or(env.updated_at);
            if stopped_at + lifetime > now {
                continue;
            }
            let result = self.terminate_stopped(&env.key(), lifetime).await;
            tally(&mut stats.terminated_expired, &mut stats.errors, &env, "expiry", result);
        }
    }

    async fn terminate_stopped(&self, key: &EnvironmentKey, lifetime: Duration) -> Result<bool> {
        {
            let _guard = self.services().locks.lock(key).await;
            let mut env = self.orchestrator.load(key).await?;
            if env.status != EnvironmentStatus::Stopped {
                return Ok(false);
            }
            let now = write_time(&env);
            env.transition(EnvironmentStatus::Terminating, now)?;
            self.orchestrator.persist(&mut env, now).await?;
        }

        let reason = format!("it was stopped for more than {} hours", lifetime.num_hours());
        self.orchestrator.teardown(key, &reason).await?;
        Ok(true)
    }

    /// Environments left mid-transition by a crashed request.
    async fn repair_stuck(&self, now: DateTime<Utc>, stats: &mut ReconcileStats) {
        let cutoff = now
            - Duration::from_std(self.config.request_timeout()).unwrap_or_else(|_| Duration::hours(1))
            - Duration::seconds(STUCK_GRACE_SECS);

        for status in [
            EnvironmentStatus::Provisioning,
            EnvironmentStatus::Booting,
            EnvironmentStatus::Stopping,
            EnvironmentStatus::Terminating,
        ] {
            for env in self.list(status, stats).await {
                if env.updated_at > cutoff {
                    continue;
                }
                let result = self.repair(&env).await;
                tally(&mut stats.stuck_repaired, &mut stats.errors, &env, "stuck repair", result);
            }
        }

        for env in self.list(EnvironmentStatus::Running, stats).await {
            let result = self.repair_abandoned_build(&env, cutoff).await;
            tally(&mut stats.stuck_repaired, &mut stats.errors, &env, "abandoned build", result);
        }
    }

    async fn repair(&self, env: &Environment) -> Result<bool> {
        let key = env.key();
        let action = {
            let _guard = self.services().locks.lock(&key).await;
            let mut current = self.orchestrator.load(&key).await?;
            if current.status != env.status || current.updated_at != env.updated_at {
                return Ok(false);
            }
            let now = write_time(&current);
            tracing::warn!(env = %key, status = %current.status, "repairing stuck environment");

            match current.status {
                EnvironmentStatus::Provisioning | EnvironmentStatus::Booting => {
                    self.orchestrator
                        .close_active_builds(&current.id(), "deploy abandoned", now)
                        .await?;
                    current.queued_commit = None;
                    if current.destroy_requested {
                        current.transition(EnvironmentStatus::Stopping, now)?;
                        self.orchestrator.persist(&mut current, now).await?;
                        StuckRepair::Teardown
                    } else {
                        current.fail("deploy abandoned before it finished", now)?;
                        self.orchestrator.persist(&mut current, now).await?;
                        StuckRepair::Failed
                    }
                }
                EnvironmentStatus::Stopping if !current.destroy_requested => StuckRepair::StopAgain,
                EnvironmentStatus::Stopping | EnvironmentStatus::Terminating => StuckRepair::Teardown,
                _ => StuckRepair::None,
            }
        };

        match action {
            StuckRepair::None => return Ok(false),
            StuckRepair::Failed => {}
            StuckRepair::StopAgain => {
                if let Some(instance_id) = &env.compute_instance_id {
                    self.services().compute.stop(instance_id).await?;
                }
                self.finish_stop(&key).await?;
            }
            StuckRepair::Teardown => {
                self.orchestrator
                    .teardown(&key, "the pull request was closed")
                    .await?;
            }
        }
        Ok(true)
    }

    /// A running environment whose rebuild was never finished.
    async fn repair_abandoned_build(&self, env: &Environment, cutoff: DateTime<Utc>) -> Result<bool> {
        let abandoned = self
            .services()
            .store
            .get_latest_build(&env.id())
            .await?
            .map_or(false, |b| b.status == BuildStatus::Running && b.started_at <= cutoff);
        if !abandoned {
            return Ok(false);
        }

        let key = env.key();
        let teardown = {
            let _guard = self.services().locks.lock(&key).await;
            let mut current = self.orchestrator.load(&key).await?;
            if current.status != EnvironmentStatus::Running {
                return Ok(false);
            }
            let now = write_time(&current);
            self.orchestrator
                .close_active_builds(&current.id(), "rebuild abandoned", now)
                .await?;
            current.queued_commit = None;
            if current.destroy_requested {
                current.transition(EnvironmentStatus::Stopping, now)?;
            }
            self.orchestrator.persist(&mut current, now).await?;
            current.destroy_requested
        };

        tracing::warn!(env = %key, "closed abandoned rebuild");
        if teardown {
            self.orchestrator
                .teardown(&key, "the pull request was closed")
                .await?;
        }
        Ok(true)
    }

    /// Live tagged instances with no Environment to answer for them, and
    /// instances whose pull request has been closed.
    async fn reap_orphans(&self, stats: &mut ReconcileStats) {
        let instances = match self.services().compute.list_managed().await {
            Ok(instances) => instances,
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(error = %e, "failed to list managed instances");
                return;
            }
        };

        for info in instances {
            let env = match info.environment_key() {
                Some(key) => match self.services().store.get_environment(&key).await {
                    Ok(env) => env,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(instance_id = %info.instance_id, error = %e, "failed to look up environment");
                        continue;
                    }
                },
                None => None,
            };

            let orphaned = match &env {
                None => true,
                Some(env) if env.status.is_terminal() => true,
                // A deploy may have launched but not yet recorded its instance.
                Some(env) if env.status.is_deploying() => false,
                Some(env) => env.compute_instance_id.as_deref() != Some(info.instance_id.as_str()),
            };

            if orphaned {
                tracing::warn!(instance_id = %info.instance_id, "terminating orphaned instance");
                match self.services().compute.terminate(&info.instance_id).await {
                    Ok(()) => stats.orphans_terminated += 1,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(instance_id = %info.instance_id, error = %e, "failed to terminate orphan");
                    }
                }
                continue;
            }

            let Some(env) = env else { continue };
            stats.prs_checked += 1;
            match self
                .services()
                .review
                .is_pull_request_open(&env.repo_full_name, env.pr_number)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(env = %env.key(), "pull request closed, destroying environment");
                    match self.orchestrator.destroy(&env.key()).await {
                        Ok(DeployOutcome::Destroyed) => stats.orphans_terminated += 1,
                        Ok(_) => {}
                        Err(e) => {
                            stats.errors += 1;
                            tracing::warn!(env = %env.key(), error = %e, "failed to destroy closed PR environment");
                        }
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(env = %env.key(), error = %e, "failed to check pull request state");
                }
            }
        }
    }
}

fn tally(counter: &mut usize, errors: &mut usize, env: &Environment, what: &str, result: Result<bool>) {
    match result {
        Ok(true) => *counter += 1,
        Ok(false) => {}
        Err(e) => {
            *errors += 1;
            tracing::warn!(env = %env.id(), action = what, error = %e, "reconcile action failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::InstanceState;
    use crate::store::StateStore;
    use crate::testing::{deploy_request, TestHarness};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn key() -> EnvironmentKey {
        EnvironmentKey::new("acme/widgets", 42)
    }

    async fn running(h: &TestHarness) -> Environment {
        h.orchestrator
            .handle(&deploy_request("acme/widgets", 42, "abc123"))
            .await
            .unwrap();
        h.store.get_environment(&key()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fresh_running_environment_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        running(&h).await;

        let stats = h.reconciler.sweep().await;
        assert_eq!(stats.stopped_idle, 0);
        assert_eq!(stats.orphans_terminated, 0);
        assert_eq!(stats.prs_checked, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(
            h.store.get_environment(&key()).await.unwrap().unwrap().status,
            EnvironmentStatus::Running
        );
    }

    #[tokio::test]
    async fn untagged_and_unknown_instances_are_orphans() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        h.compute.insert_instance("i-untagged", InstanceState::Running, BTreeMap::new());
        h.compute.insert_instance(
            "i-unknown",
            InstanceState::Stopped,
            BTreeMap::from([
                ("Repository".to_string(), "acme/gone".to_string()),
                ("PRNumber".to_string(), "7".to_string()),
            ]),
        );

        let stats = h.reconciler.sweep().await;
        assert_eq!(stats.orphans_terminated, 2);
        assert_eq!(h.compute.instance_state("i-untagged"), Some(InstanceState::Terminated));
        assert_eq!(h.compute.instance_state("i-unknown"), Some(InstanceState::Terminated));
    }

    #[tokio::test]
    async fn second_instance_for_environment_is_terminated() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        let env = running(&h).await;
        let tags = BTreeMap::from([
            ("Repository".to_string(), "acme/widgets".to_string()),
            ("PRNumber".to_string(), "42".to_string()),
        ]);
        h.compute.insert_instance("i-duplicate", InstanceState::Running, tags);

        let stats = h.reconciler.sweep().await;
        assert_eq!(stats.orphans_terminated, 1);
        assert_eq!(h.compute.instance_state("i-duplicate"), Some(InstanceState::Terminated));
        let kept = env.compute_instance_id.unwrap();
        assert_eq!(h.compute.instance_state(&kept), Some(InstanceState::Running));
    }

    #[tokio::test]
    async fn failed_environment_with_instance_is_stopped_after_idle_threshold() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        h.channel.respond(
            "compose_up",
            crate::bootstrap::CommandOutput {
                exit_code: 2,
                ..Default::default()
            },
        );
        h.orchestrator
            .handle(&deploy_request("acme/widgets", 42, "abc123"))
            .await
            .unwrap();

        let stats = h.reconciler.sweep_at(Utc::now() + Duration::hours(5)).await;
        assert_eq!(stats.stopped_idle, 1);

        let env = h.store.get_environment(&key()).await.unwrap().unwrap();
        assert_eq!(env.status, EnvironmentStatus::Stopped);
        let instance = env.compute_instance_id.unwrap();
        assert_eq!(h.compute.instance_state(&instance), Some(InstanceState::Stopped));
    }

    #[tokio::test]
    async fn stuck_provisioning_is_failed() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        let now = Utc::now() - Duration::hours(3);
        let mut env = Environment::from_request(&deploy_request("acme/widgets", 42, "abc123"), now);
        env.ttl = (Utc::now() + Duration::days(1)).timestamp();
        h.store.put_environment(&env).await.unwrap();

        let stats = h.reconciler.sweep().await;
        assert_eq!(stats.stuck_repaired, 1);
        let env = h.store.get_environment(&key()).await.unwrap().unwrap();
        assert_eq!(env.status, EnvironmentStatus::Failed);
        assert!(env.failure_reason.unwrap().contains("abandoned"));
    }

    #[tokio::test]
    async fn stuck_stopping_with_destroy_request_is_destroyed() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        let mut env = running(&h).await;
        let instance = env.compute_instance_id.clone().unwrap();
        env.status = EnvironmentStatus::Stopping;
        env.destroy_requested = true;
        h.store.put_environment(&env).await.unwrap();

        let stats = h.reconciler.sweep_at(Utc::now() + Duration::hours(2)).await;
        assert_eq!(stats.stuck_repaired, 1);
        let env = h.store.get_environment(&key()).await.unwrap().unwrap();
        assert_eq!(env.status, EnvironmentStatus::Destroyed);
        assert_eq!(h.compute.instance_state(&instance), Some(InstanceState::Terminated));
    }

    #[tokio::test]
    async fn expired_records_are_purged() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        running(&h).await;

        let stats = h.reconciler.sweep_at(Utc::now() + Duration::days(30)).await;
        // Idle stop, then expiry, then the purge of the destroyed record.
        assert_eq!(stats.stopped_idle, 1);
        assert_eq!(stats.terminated_expired, 1);
        assert!(stats.purged_records >= 1);
        assert!(h.store.get_environment(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_until_sweeps_before_shutdown() {
        let dir = TempDir::new().unwrap();
        let h = TestHarness::new(dir.path());
        h.compute.insert_instance("i-stray", InstanceState::Running, BTreeMap::new());

        h.reconciler.run_until(async {}).await;
        assert_eq!(h.compute.instance_state("i-stray"), Some(InstanceState::Terminated));
    }
}
