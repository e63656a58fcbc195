//! Deploy orchestrator: drives one Environment through its lifecycle for a
//! single deploy or destroy request.
//!
//! Each request runs in two phases. The *claim* reads the Environment under
//! its per-PR lock and decides what to do: start provisioning, rebuild in
//! place, queue behind an in-flight deploy, or tear down. The *worker* then
//! runs the long steps (launch, readiness, bootstrap, tunnel) without the
//! lock, re-taking it only at checkpoints to persist progress and to pick up
//! a queued commit or a pending destroy.
//!
//! Every failure path writes `failed` state before returning, and the whole
//! worker is bounded by the configured request timeout.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::bootstrap::{BootstrapPlan, BootstrapRunner, CheckoutTarget};
use crate::build::{Build, BuildId, BuildLogs, BuildStatus};
use crate::compute::{ComputeManager, LaunchSpec, Readiness};
use crate::config::OrchestratorConfig;
use crate::environment::{Environment, EnvironmentKey, EnvironmentStatus};
use crate::error::{Error, FailureStage, Result};
use crate::locks::KeyedLocks;
use crate::notify::{CommitState, ReviewHost};
use crate::request::{LifecycleAction, LifecycleRequest};
use crate::secrets::{Redactor, SecretsResolver};
use crate::store::StateStore;
use crate::tunnel::{TunnelEndpoint, TunnelProvisioner};

/// Collaborators shared by the orchestrator and the reconciler.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn StateStore>,
    pub compute: ComputeManager,
    pub runner: BootstrapRunner,
    pub tunnel: Arc<dyn TunnelProvisioner>,
    pub secrets: SecretsResolver,
    pub review: Arc<dyn ReviewHost>,
    pub locks: KeyedLocks,
}

/// What a request ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The environment is serving `url` at the build's commit.
    Running { url: String, build_id: BuildId },
    /// Queued behind an in-flight deploy of the same PR.
    Queued { build_id: BuildId },
    /// A destroy was recorded for the in-flight deploy to honour.
    DestroyQueued,
    Destroyed,
    Failed { stage: FailureStage, reason: String },
    /// Nothing to do.
    Skipped { reason: String },
}

impl DeployOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DeployOutcome::Failed { .. })
    }
}

impl fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployOutcome::Running { url, build_id } => write!(f, "running at {} ({})", url, build_id),
            DeployOutcome::Queued { build_id } => write!(f, "queued as {}", build_id),
            DeployOutcome::DestroyQueued => f.write_str("destroy queued behind in-flight deploy"),
            DeployOutcome::Destroyed => f.write_str("destroyed"),
            DeployOutcome::Failed { stage, reason } => write!(f, "failed at {}: {}", stage, reason),
            DeployOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Wall-clock time spent in each deploy step.
#[derive(Debug, Clone, Default)]
pub struct DeployTimings {
    steps: Vec<(String, Duration)>,
}

impl DeployTimings {
    pub fn record(&mut self, step: &str, elapsed: Duration) {
        tracing::info!(step, elapsed_ms = elapsed.as_millis() as u64, "deploy step finished");
        self.steps.push((step.to_string(), elapsed));
    }

    pub fn steps(&self) -> &[(String, Duration)] {
        &self.steps
    }

    pub fn total(&self) -> Duration {
        self.steps.iter().map(|(_, d)| *d).sum()
    }

    /// Markdown table for the PR comment.
    pub fn to_markdown(&self) -> String {
        let mut table = String::from("| Step | Duration |\n|---|---|\n");
        for (step, elapsed) in &self.steps {
            table.push_str(&format!("| {} | {:.1}s |\n", step, elapsed.as_secs_f64()));
        }
        table.push_str(&format!("| **total** | **{:.1}s** |\n", self.total().as_secs_f64()));
        table
    }
}

enum Claim {
    Provision(Build),
    Rebuild(Build),
    Queued(BuildId),
    Skipped(String),
}

enum DestroyClaim {
    Teardown,
    Queued,
    Skipped(String),
}

#[derive(Clone, Copy)]
enum WorkerMode {
    /// Fresh, stopped or failed: obtain an instance and run the full plan.
    Provision,
    /// Running: rebuild in place, keeping instance and tunnel.
    Rebuild,
}

enum Checkpoint {
    Ready(Environment),
    Next(Build),
    Destroy,
}

/// Timestamp for a write: never earlier than the stored record, so
/// last-write-wins cannot drop it on clock skew.
pub(crate) fn write_time(env: &Environment) -> DateTime<Utc> {
    Utc::now().max(env.updated_at)
}

pub(crate) fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

/// Executes lifecycle requests.
#[derive(Clone)]
pub struct DeployOrchestrator {
    config: Arc<OrchestratorConfig>,
    services: Services,
}

impl DeployOrchestrator {
    pub fn new(config: Arc<OrchestratorConfig>, services: Services) -> Self {
        Self { config, services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Handles one lifecycle request to completion.
    ///
    /// Deploy and teardown failures are persisted and returned as
    /// [`DeployOutcome::Failed`]; `Err` means the request was rejected
    /// (invalid, over capacity) or state could not be written at all.
    pub async fn handle(&self, request: &LifecycleRequest) -> Result<DeployOutcome> {
        request.validate()?;
        let key = request.key();
        let span = tracing::info_span!(
            "lifecycle",
            repo = %key.repo_full_name,
            pr = key.pr_number,
            action = ?request.action
        );

        async {
            let outcome = match request.action {
                LifecycleAction::Deploy => self.deploy(request).await,
                LifecycleAction::Destroy => self.destroy_at(&key, request.timestamp).await,
            };
            match &outcome {
                Ok(outcome) => tracing::info!(outcome = %outcome, "request handled"),
                Err(e) => tracing::error!(error = %e, "request rejected"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn deploy(&self, request: &LifecycleRequest) -> Result<DeployOutcome> {
        let key = request.key();
        let claim = {
            let _guard = self.services.locks.lock(&key).await;
            self.claim_deploy(request).await?
        };

        match claim {
            Claim::Provision(build) => self.run_worker(&key, build, WorkerMode::Provision).await,
            Claim::Rebuild(build) => self.run_worker(&key, build, WorkerMode::Rebuild).await,
            Claim::Queued(build_id) => {
                tracing::info!(build_id = %build_id, "deploy queued behind in-flight build");
                Ok(DeployOutcome::Queued { build_id })
            }
            Claim::Skipped(reason) => Ok(DeployOutcome::Skipped { reason }),
        }
    }

    /// Decides what a deploy request does. Caller holds the key lock.
    async fn claim_deploy(&self, request: &LifecycleRequest) -> Result<Claim> {
        let store = &self.services.store;
        let key = request.key();
        let sha = request.pull_request.sha.as_str();

        let existing = store.get_environment(&key).await?;
        if existing
            .as_ref()
            .map_or(false, |env| env.is_stale_event(request.timestamp))
        {
            return Ok(Claim::Skipped(format!(
                "delivery for {} predates the last accepted event",
                short_sha(sha)
            )));
        }

        let mut env = match existing {
            Some(env) if !env.status.is_terminal() => env,
            previous => {
                self.check_capacity(&key, sha).await?;
                let now = previous.as_ref().map_or_else(Utc::now, write_time);
                let mut env = Environment::from_request(request, now);
                if let Some(previous) = &previous {
                    env.record_event(previous.last_event_at);
                }
                return self.start_provisioning(env, now).await;
            }
        };
        let now = write_time(&env);

        if let Some(reason) = self.repeated_commit(&env, sha, request.timestamp).await? {
            return Ok(Claim::Skipped(reason));
        }
        env.record_event(request.timestamp);

        match env.status {
            EnvironmentStatus::Stopped | EnvironmentStatus::Failed => {
                self.check_capacity(&key, sha).await?;
                env.apply_request(request);
                env.transition(EnvironmentStatus::Provisioning, now)?;
                env.tunnel_id = None;
                env.tunnel_url = None;
                env.last_activity_at = now;
                self.start_provisioning(env, now).await
            }
            EnvironmentStatus::Provisioning | EnvironmentStatus::Booting => {
                self.queue_commit(env, sha, now).await
            }
            EnvironmentStatus::Running => {
                let in_flight = store
                    .get_latest_build(&env.id())
                    .await?
                    .map_or(false, |b| b.status.is_active());
                if in_flight {
                    return self.queue_commit(env, sha, now).await;
                }
                if env.commit_sha == sha {
                    return Ok(Claim::Skipped(format!(
                        "commit {} is already running",
                        short_sha(sha)
                    )));
                }

                env.apply_request(request);
                env.transition(EnvironmentStatus::Running, now)?;
                env.last_activity_at = now;
                let mut build = Build::new(&key, sha, BuildStatus::Running, now);
                self.persist(&mut env, now).await?;
                self.save_build(&mut build, now).await?;
                tracing::info!(build_id = %build.build_id, commit = sha, "rebuilding in place");
                Ok(Claim::Rebuild(build))
            }
            EnvironmentStatus::Stopping if !env.destroy_requested => {
                // Picked up by the reconciler once the stop completes.
                let claim = self.queue_commit(env, sha, now).await?;
                if let Claim::Queued(_) = &claim {
                    self.post_status(
                        &key.repo_full_name,
                        sha,
                        CommitState::Pending,
                        "Queued until the environment finishes stopping",
                        None,
                    )
                    .await;
                }
                Ok(claim)
            }
            EnvironmentStatus::Stopping
            | EnvironmentStatus::Terminating
            | EnvironmentStatus::Destroyed => Ok(Claim::Skipped(format!(
                "environment is {}",
                env.status
            ))),
        }
    }

    /// Why `sha` repeats a commit this Environment has already built, if
    /// it does.
    ///
    /// A stopped or failed Environment may restart its own commit, and an
    /// event newer than every accepted one may return to an older commit.
    /// Anything else seen before is a redelivery or an out-of-order push.
    async fn repeated_commit(
        &self,
        env: &Environment,
        sha: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let restartable = matches!(
            env.status,
            EnvironmentStatus::Stopped | EnvironmentStatus::Failed
        );
        if restartable && env.commit_sha == sha {
            return Ok(None);
        }
        let newer = matches!((at, env.last_event_at), (Some(at), Some(last)) if at > last);
        if newer && env.commit_sha != sha && env.queued_commit.as_deref() != Some(sha) {
            return Ok(None);
        }

        let seen = self
            .services
            .store
            .list_builds(&env.id())
            .await?
            .iter()
            .any(|b| b.commit_sha == sha);
        if !seen {
            return Ok(None);
        }

        let short = short_sha(sha);
        Ok(Some(if env.queued_commit.as_deref() == Some(sha) {
            format!("commit {} is already queued", short)
        } else if env.commit_sha == sha {
            format!("commit {} is already being deployed", short)
        } else {
            format!("commit {} was already built for this pull request", short)
        }))
    }

    async fn start_provisioning(&self, mut env: Environment, now: DateTime<Utc>) -> Result<Claim> {
        let mut build = Build::new(&env.key(), &env.commit_sha, BuildStatus::Running, now);
        self.persist(&mut env, now).await?;
        self.save_build(&mut build, now).await?;
        tracing::info!(build_id = %build.build_id, commit = %env.commit_sha, "provisioning environment");
        Ok(Claim::Provision(build))
    }

    /// Records `sha` as the commit to build once the in-flight deploy or
    /// stop is done.
    async fn queue_commit(&self, mut env: Environment, sha: &str, now: DateTime<Utc>) -> Result<Claim> {
        if env.commit_sha == sha || env.queued_commit.as_deref() == Some(sha) {
            return Ok(Claim::Skipped(format!(
                "commit {} is already being deployed",
                short_sha(sha)
            )));
        }

        self.supersede_pending(&env.id(), "superseded by a newer commit", now)
            .await?;
        let mut build = Build::new(&env.key(), sha, BuildStatus::Pending, now);
        self.save_build(&mut build, now).await?;

        env.queued_commit = Some(sha.to_string());
        env.last_activity_at = now;
        self.persist(&mut env, now).await?;
        Ok(Claim::Queued(build.build_id))
    }

    /// Rejects a new environment when the fleet is full, telling the PR why.
    async fn check_capacity(&self, key: &EnvironmentKey, sha: &str) -> Result<()> {
        let limit = self.config.fleet.max_environments;
        let active = self.services.store.count_active(Some(key)).await?;
        if active < limit {
            return Ok(());
        }

        let err = Error::Capacity { active, limit };
        tracing::warn!(active, limit, "fleet limit reached, rejecting deploy");
        self.post_status(
            &key.repo_full_name,
            sha,
            CommitState::Failure,
            &err.short_reason(),
            None,
        )
        .await;
        self.post_comment(
            &key.repo_full_name,
            key.pr_number,
            &format!(
                "### Ephemeral environment not created\n\n\
                 All {} environment slots are in use. Push again once another PR's \
                 environment has been stopped or closed.",
                limit
            ),
        )
        .await;
        Err(err)
    }

    /// Deploys the commit that was queued while the Environment was
    /// stopping. Does nothing unless it is now `stopped` with a queued commit.
    pub(crate) async fn deploy_queued(&self, key: &EnvironmentKey) -> Result<DeployOutcome> {
        let claimed = {
            let _guard = self.services.locks.lock(key).await;
            self.claim_queued(key).await?
        };
        match claimed {
            Some(build) => self.run_worker(key, build, WorkerMode::Provision).await,
            None => Ok(DeployOutcome::Skipped {
                reason: "no commit queued".into(),
            }),
        }
    }

    async fn claim_queued(&self, key: &EnvironmentKey) -> Result<Option<Build>> {
        let mut env = self.load(key).await?;
        if env.status != EnvironmentStatus::Stopped {
            return Ok(None);
        }
        let Some(sha) = env.queued_commit.take() else {
            return Ok(None);
        };
        let now = write_time(&env);

        if let Err(e) = self.check_capacity(key, &sha).await {
            self.supersede_pending(&env.id(), "fleet limit reached", now).await?;
            self.persist(&mut env, now).await?;
            return Err(e);
        }

        env.commit_sha = sha.clone();
        env.transition(EnvironmentStatus::Provisioning, now)?;
        env.last_activity_at = now;
        let build = self.promote_pending(&env, &sha, now).await?;
        self.persist(&mut env, now).await?;
        tracing::info!(build_id = %build.build_id, commit = %sha, "deploying commit queued during stop");
        Ok(Some(build))
    }

    async fn run_worker(&self, key: &EnvironmentKey, build: Build, mode: WorkerMode) -> Result<DeployOutcome> {
        let budget = self.config.request_timeout();
        let result = match tokio::time::timeout(budget, self.drive(key, build, mode)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout(budget)),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn drive(&self, key: &EnvironmentKey, mut build: Build, mode: WorkerMode) -> Result<DeployOutcome> {
        let mut timings = DeployTimings::default();
        let env = self.load(key).await?;
        self.post_status(
            &env.repo_full_name,
            &build.commit_sha,
            CommitState::Pending,
            "Deploying environment",
            None,
        )
        .await;

        let (instance_id, mut endpoint) = match mode {
            WorkerMode::Provision => {
                let started = Instant::now();
                let instance_id = self.ensure_instance(&env).await?;
                timings.record("launch_instance", started.elapsed());

                let recorded = instance_id.clone();
                self.update_env(key, move |env, _| {
                    env.compute_instance_id = Some(recorded);
                    Ok(())
                })
                .await?;

                let started = Instant::now();
                let timeout = self.config.readiness_timeout();
                if self.services.compute.wait_until_ready(&instance_id, timeout).await?
                    == Readiness::TimedOut
                {
                    return Err(Error::ReadinessTimeout { instance_id, timeout });
                }
                timings.record("wait_for_instance", started.elapsed());

                let destroy = self
                    .update_env(key, |env, now| {
                        if env.destroy_requested {
                            return Ok(true);
                        }
                        env.transition(EnvironmentStatus::Booting, now)?;
                        Ok(false)
                    })
                    .await?;
                if destroy {
                    {
                        let _guard = self.services.locks.lock(key).await;
                        let mut env = self.load(key).await?;
                        let now = write_time(&env);
                        self.abandon(&mut env, &mut build, now).await?;
                    }
                    return self.teardown(key, "the pull request was closed").await;
                }
                (instance_id, None)
            }
            WorkerMode::Rebuild => {
                let instance_id = env.compute_instance_id.clone().ok_or_else(|| {
                    Error::Store(format!("{} is running without an instance", key))
                })?;
                let endpoint = match (env.tunnel_id.clone(), env.tunnel_url.clone()) {
                    (Some(tunnel_id), Some(url)) => Some(TunnelEndpoint { tunnel_id, url }),
                    _ => None,
                };
                (instance_id, endpoint)
            }
        };

        loop {
            let env = self.load(key).await?;
            let attempt = self
                .build_once(&env, &instance_id, endpoint.as_ref(), &mut build, &mut timings)
                .await;

            match attempt {
                Ok(ready) => {
                    endpoint = Some(ready.clone());
                    match self.finish_build(key, &mut build, &ready).await? {
                        Checkpoint::Ready(env) => {
                            return Ok(self.report_ready(&env, &build, &ready, &timings).await)
                        }
                        Checkpoint::Next(next) => {
                            self.announce_superseded(&env, &build, &next).await;
                            build = next;
                        }
                        Checkpoint::Destroy => {
                            return self.teardown(key, "the pull request was closed").await
                        }
                    }
                }
                Err(e) if matches!(e.stage(), FailureStage::Bootstrap | FailureStage::Tunnel) => {
                    match self.skip_to_queued(key, &mut build, &e).await? {
                        Some(next) => {
                            tracing::warn!(
                                build_id = %build.build_id,
                                error = %e,
                                "build failed, moving on to queued commit"
                            );
                            build = next;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reuses the recorded instance if it still exists, otherwise launches one.
    async fn ensure_instance(&self, env: &Environment) -> Result<String> {
        let compute = &self.services.compute;
        if let Some(instance_id) = &env.compute_instance_id {
            if compute.is_alive(instance_id).await? {
                compute.start(instance_id).await?;
                tracing::info!(instance_id = %instance_id, "reusing instance");
                return Ok(instance_id.clone());
            }
            tracing::warn!(instance_id = %instance_id, "recorded instance is gone, launching a new one");
        }

        let spec = LaunchSpec::for_environment(
            &env.key(),
            &env.branch,
            &self.config.aws.instance_name_prefix,
            &self.config.aws.managed_by,
        )
        .with_instance_profile(self.config.instance_profile_for(&env.repo_full_name));
        compute.launch(&spec).await
    }

    /// One bootstrap attempt for `build`. Returns the endpoint serving it.
    async fn build_once(
        &self,
        env: &Environment,
        instance_id: &str,
        endpoint: Option<&TunnelEndpoint>,
        build: &mut Build,
        timings: &mut DeployTimings,
    ) -> Result<TunnelEndpoint> {
        let logs = BuildLogs::for_build(&self.config.paths.logs_dir, &env.key(), &build.build_id);
        build.logs_ref = Some(logs.reference());
        self.save_build(build, write_time(env)).await?;

        let mut redactor = Redactor::default();
        let target = CheckoutTarget {
            app_dir: self.config.instance.app_dir.clone(),
            clone_url: self.clone_url(env, &mut redactor).await,
            branch: env.branch.clone(),
            commit_sha: build.commit_sha.clone(),
        };
        let secrets = &self.services.secrets;
        let inject = secrets.inject_step(&target.app_dir, &env.repo_full_name);
        let plan = match endpoint {
            Some(_) => BootstrapPlan::rebuild(&target, inject),
            None => BootstrapPlan::full(&target, inject, self.services.tunnel.start_step()),
        };

        let started = Instant::now();
        let steps = self
            .services
            .runner
            .execute(
                instance_id,
                &plan,
                &logs,
                &redactor,
                self.config.bootstrap_timeout(),
            )
            .await?;
        timings.record("bootstrap", started.elapsed());

        let report = secrets.report(&env.repo_full_name, &steps);
        if !report.warnings.is_empty() {
            let lines: Vec<String> = report.warnings.iter().map(|w| w.to_string()).collect();
            if let Err(e) = logs.append("secrets", "", &lines.join("\n")).await {
                tracing::warn!(error = %e, "failed to write secret warnings to build log");
            }
        }

        match endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None => {
                let started = Instant::now();
                let endpoint = self.services.tunnel.provision(instance_id).await?;
                timings.record("tunnel", started.elapsed());
                Ok(endpoint)
            }
        }
    }

    /// Clone URL, carrying a short-lived token for private repositories.
    async fn clone_url(&self, env: &Environment, redactor: &mut Redactor) -> String {
        if !env.is_private {
            return env.clone_url.clone();
        }
        match self.services.review.access_token(&env.repo_full_name).await {
            Ok(Some(token)) => {
                redactor.add("GITHUB_TOKEN", &token);
                format!(
                    "https://x-access-token:{}@github.com/{}.git",
                    token, env.repo_full_name
                )
            }
            Ok(None) => {
                tracing::warn!("no access token for private repository, cloning anonymously");
                env.clone_url.clone()
            }
            Err(e) => {
                tracing::warn!(error = %e, "access token lookup failed, cloning anonymously");
                env.clone_url.clone()
            }
        }
    }

    /// Success checkpoint: publish the build, or hand over to a queued
    /// commit or a pending destroy.
    async fn finish_build(
        &self,
        key: &EnvironmentKey,
        build: &mut Build,
        endpoint: &TunnelEndpoint,
    ) -> Result<Checkpoint> {
        let _guard = self.services.locks.lock(key).await;
        let mut env = self.load(key).await?;
        let now = write_time(&env);

        if env.destroy_requested {
            self.abandon(&mut env, build, now).await?;
            return Ok(Checkpoint::Destroy);
        }
        if let Some(next) = self
            .take_queued(&mut env, build, BuildStatus::Superseded, None, now)
            .await?
        {
            return Ok(Checkpoint::Next(next));
        }

        build.finish(BuildStatus::Succeeded, None, now);
        self.save_build(build, now).await?;
        env.transition(EnvironmentStatus::Running, now)?;
        env.tunnel_id = Some(endpoint.tunnel_id.clone());
        env.tunnel_url = Some(endpoint.url.clone());
        env.last_activity_at = now;
        self.persist(&mut env, now).await?;
        Ok(Checkpoint::Ready(env))
    }

    /// Failure checkpoint: if a newer commit is queued, fail this build and
    /// continue with that one instead of failing the Environment.
    async fn skip_to_queued(
        &self,
        key: &EnvironmentKey,
        build: &mut Build,
        err: &Error,
    ) -> Result<Option<Build>> {
        let _guard = self.services.locks.lock(key).await;
        let mut env = self.load(key).await?;
        if env.destroy_requested {
            return Ok(None);
        }
        let now = write_time(&env);
        self.take_queued(&mut env, build, BuildStatus::Failed, Some(err.short_reason()), now)
            .await
    }

    /// Closes `build` and promotes the queued commit's build to `running`.
    /// Caller holds the key lock.
    async fn take_queued(
        &self,
        env: &mut Environment,
        build: &mut Build,
        status: BuildStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        let Some(sha) = env.queued_commit.take() else {
            return Ok(None);
        };

        let reason = reason.unwrap_or_else(|| format!("superseded by {}", short_sha(&sha)));
        build.finish(status, Some(reason), now);
        self.save_build(build, now).await?;

        let next = self.promote_pending(env, &sha, now).await?;
        env.commit_sha = sha;
        self.persist(env, now).await?;
        tracing::info!(build_id = %next.build_id, commit = %next.commit_sha, "building queued commit");
        Ok(Some(next))
    }

    /// The pending build for `sha`, promoted to `running`.
    async fn promote_pending(&self, env: &Environment, sha: &str, now: DateTime<Utc>) -> Result<Build> {
        let pending = self
            .services
            .store
            .list_builds(&env.id())
            .await?
            .into_iter()
            .rev()
            .find(|b| b.status == BuildStatus::Pending && b.commit_sha == sha);
        let mut next = pending.unwrap_or_else(|| Build::new(&env.key(), sha, BuildStatus::Running, now));
        next.status = BuildStatus::Running;
        next.started_at = now;
        self.save_build(&mut next, now).await?;
        Ok(next)
    }

    /// Retires the in-flight build for a pending destroy and moves the
    /// Environment to `stopping`. Caller holds the key lock.
    async fn abandon(&self, env: &mut Environment, build: &mut Build, now: DateTime<Utc>) -> Result<()> {
        build.finish(BuildStatus::Superseded, Some("destroy requested".into()), now);
        self.save_build(build, now).await?;
        self.supersede_pending(&env.id(), "destroy requested", now).await?;
        env.queued_commit = None;
        if env.status.can_transition_to(EnvironmentStatus::Stopping) {
            env.transition(EnvironmentStatus::Stopping, now)?;
        }
        self.persist(env, now).await
    }

    async fn report_ready(
        &self,
        env: &Environment,
        build: &Build,
        endpoint: &TunnelEndpoint,
        timings: &DeployTimings,
    ) -> DeployOutcome {
        tracing::info!(
            url = %endpoint.url,
            build_id = %build.build_id,
            total_ms = timings.total().as_millis() as u64,
            "environment running"
        );
        self.post_status(
            &env.repo_full_name,
            &build.commit_sha,
            CommitState::Success,
            "Environment ready",
            Some(&endpoint.url),
        )
        .await;
        self.post_comment(
            &env.repo_full_name,
            env.pr_number,
            &format!(
                "### Ephemeral environment ready\n\n\
                 **URL:** {}\n**Commit:** `{}`\n**Build:** `{}`\n\n{}",
                endpoint.url,
                short_sha(&build.commit_sha),
                build.build_id,
                timings.to_markdown()
            ),
        )
        .await;

        DeployOutcome::Running {
            url: endpoint.url.clone(),
            build_id: build.build_id.clone(),
        }
    }

    async fn announce_superseded(&self, env: &Environment, old: &Build, next: &Build) {
        self.post_status(
            &env.repo_full_name,
            &old.commit_sha,
            CommitState::Error,
            &format!("Superseded by {}", short_sha(&next.commit_sha)),
            None,
        )
        .await;
        self.post_status(
            &env.repo_full_name,
            &next.commit_sha,
            CommitState::Pending,
            "Deploying environment",
            None,
        )
        .await;
    }

    /// Persists a failed deploy and reports it.
    async fn record_failure(&self, key: &EnvironmentKey, err: Error) -> Result<DeployOutcome> {
        let stage = err.stage();
        let reason = err.short_reason();
        tracing::error!(stage = %stage, error = %err, "deploy failed");

        let guard = self.services.locks.lock(key).await;
        let Some(mut env) = self.services.store.get_environment(key).await? else {
            return Ok(DeployOutcome::Failed { stage, reason });
        };
        let now = write_time(&env);

        let failed_build = self.close_active_builds(&env.id(), &reason, now).await?;
        env.queued_commit = None;

        if env.destroy_requested {
            if env.status.can_transition_to(EnvironmentStatus::Stopping) {
                env.transition(EnvironmentStatus::Stopping, now)?;
            }
            self.persist(&mut env, now).await?;
            drop(guard);
            return self.teardown(key, "the pull request was closed").await;
        }

        if env.status.can_transition_to(EnvironmentStatus::Failed) {
            env.fail(reason.clone(), now)?;
        } else {
            tracing::warn!(status = %env.status, "cannot mark environment failed from its current state");
            env.failure_reason = Some(reason.clone());
        }
        self.persist(&mut env, now).await?;
        drop(guard);

        let sha = failed_build
            .as_ref()
            .map_or(env.commit_sha.as_str(), |b| b.commit_sha.as_str());
        self.post_status(
            &env.repo_full_name,
            sha,
            CommitState::Failure,
            &format!("Deploy failed at {}: {}", stage, reason),
            None,
        )
        .await;
        self.post_comment(
            &env.repo_full_name,
            env.pr_number,
            &failure_comment(stage, &err, failed_build.as_ref()),
        )
        .await;

        Ok(DeployOutcome::Failed { stage, reason })
    }

    pub(crate) async fn destroy(&self, key: &EnvironmentKey) -> Result<DeployOutcome> {
        self.destroy_at(key, None).await
    }

    /// Destroy for an event sent at `at`; older than the last accepted
    /// event means it is skipped.
    async fn destroy_at(&self, key: &EnvironmentKey, at: Option<DateTime<Utc>>) -> Result<DeployOutcome> {
        let claim = {
            let _guard = self.services.locks.lock(key).await;
            self.claim_destroy(key, at).await?
        };

        match claim {
            DestroyClaim::Teardown => self.teardown(key, "the pull request was closed").await,
            DestroyClaim::Queued => {
                tracing::info!("destroy recorded for in-flight deploy");
                Ok(DeployOutcome::DestroyQueued)
            }
            DestroyClaim::Skipped(reason) => Ok(DeployOutcome::Skipped { reason }),
        }
    }

    async fn claim_destroy(&self, key: &EnvironmentKey, at: Option<DateTime<Utc>>) -> Result<DestroyClaim> {
        let store = &self.services.store;
        let mut env = match store.get_environment(key).await? {
            Some(env) if !env.status.is_terminal() => env,
            Some(_) => return Ok(DestroyClaim::Skipped("environment already destroyed".into())),
            None => return Ok(DestroyClaim::Skipped("no environment for this pull request".into())),
        };
        if env.is_stale_event(at) {
            return Ok(DestroyClaim::Skipped(
                "destroy predates the last accepted event".into(),
            ));
        }
        let now = write_time(&env);
        env.record_event(at);
        env.destroy_requested = true;

        let in_flight = match env.status {
            EnvironmentStatus::Provisioning | EnvironmentStatus::Booting => true,
            EnvironmentStatus::Running => store
                .get_latest_build(&env.id())
                .await?
                .map_or(false, |b| b.status.is_active()),
            _ => false,
        };

        if in_flight {
            env.queued_commit = None;
            self.supersede_pending(&env.id(), "destroy requested", now).await?;
            self.persist(&mut env, now).await?;
            return Ok(DestroyClaim::Queued);
        }
        if env.status.is_tearing_down() {
            env.queued_commit = None;
            self.supersede_pending(&env.id(), "destroy requested", now).await?;
            self.persist(&mut env, now).await?;
            return Ok(DestroyClaim::Skipped("teardown already in progress".into()));
        }

        env.transition(EnvironmentStatus::Stopping, now)?;
        self.persist(&mut env, now).await?;
        Ok(DestroyClaim::Teardown)
    }

    /// Terminates the instance, releases the tunnel and marks the
    /// Environment `destroyed`. Expects `stopping` or `terminating`.
    pub(crate) async fn teardown(&self, key: &EnvironmentKey, reason: &str) -> Result<DeployOutcome> {
        let env = self.load(key).await?;
        if let Some(instance_id) = &env.compute_instance_id {
            self.services.compute.terminate(instance_id).await?;
        }
        if let (Some(tunnel_id), Some(url)) = (&env.tunnel_id, &env.tunnel_url) {
            let endpoint = TunnelEndpoint {
                tunnel_id: tunnel_id.clone(),
                url: url.clone(),
            };
            if let Err(e) = self.services.tunnel.release(&endpoint).await {
                tracing::warn!(error = %e, "failed to release tunnel");
            }
        }

        let env = self
            .update_env(key, |env, now| {
                if env.status != EnvironmentStatus::Destroyed {
                    env.transition(EnvironmentStatus::Destroyed, now)?;
                }
                Ok(env.clone())
            })
            .await?;
        tracing::info!(reason, "environment destroyed");
        self.post_comment(
            &env.repo_full_name,
            env.pr_number,
            &format!(
                "### Ephemeral environment destroyed\n\nThe environment was torn down because {}.",
                reason
            ),
        )
        .await;
        Ok(DeployOutcome::Destroyed)
    }

    /// Fails the running build and supersedes pending ones. Returns the
    /// build that was running, if any.
    pub(crate) async fn close_active_builds(
        &self,
        environment_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        let mut failed = None;
        for mut build in self.services.store.list_builds(environment_id).await? {
            match build.status {
                BuildStatus::Running => {
                    build.finish(BuildStatus::Failed, Some(reason.to_string()), now);
                    self.save_build(&mut build, now).await?;
                    failed = Some(build);
                }
                BuildStatus::Pending => {
                    build.finish(
                        BuildStatus::Superseded,
                        Some("deploy failed before this commit was built".into()),
                        now,
                    );
                    self.save_build(&mut build, now).await?;
                }
                _ => {}
            }
        }
        Ok(failed)
    }

    async fn supersede_pending(&self, environment_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        for mut build in self.services.store.list_builds(environment_id).await? {
            if build.status == BuildStatus::Pending {
                build.finish(BuildStatus::Superseded, Some(reason.to_string()), now);
                self.save_build(&mut build, now).await?;
                tracing::debug!(build_id = %build.build_id, "superseded pending build");
            }
        }
        Ok(())
    }

    /// Writes `build`, pushing its expiry out to `now` plus the record TTL.
    pub(crate) async fn save_build(&self, build: &mut Build, now: DateTime<Utc>) -> Result<()> {
        build.ttl = (now + self.config.record_ttl()).timestamp();
        self.services.store.append_build(&build.environment_id, build).await
    }

    pub(crate) async fn load(&self, key: &EnvironmentKey) -> Result<Environment> {
        self.services
            .store
            .get_environment(key)
            .await?
            .ok_or_else(|| Error::Store(format!("environment {} disappeared", key)))
    }

    /// Stamps and writes `env`.
    pub(crate) async fn persist(&self, env: &mut Environment, now: DateTime<Utc>) -> Result<()> {
        env.updated_at = now;
        env.ttl = (now + self.config.record_ttl()).timestamp();
        self.services.store.put_environment(env).await
    }

    /// Re-reads, mutates and writes an Environment under its lock.
    pub(crate) async fn update_env<T>(
        &self,
        key: &EnvironmentKey,
        f: impl FnOnce(&mut Environment, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.services.locks.lock(key).await;
        let mut env = self.load(key).await?;
        let now = write_time(&env);
        let out = f(&mut env, now)?;
        self.persist(&mut env, now).await?;
        Ok(out)
    }

    pub(crate) async fn post_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) {
        if let Err(e) = self
            .services
            .review
            .post_status(repo, sha, state, description, target_url)
            .await
        {
            tracing::warn!(repo, sha, error = %e, "failed to post commit status");
        }
    }

    pub(crate) async fn post_comment(&self, repo: &str, pr_number: u64, body: &str) {
        if let Err(e) = self.services.review.post_comment(repo, pr_number, body).await {
            tracing::warn!(repo, pr = pr_number, error = %e, "failed to post PR comment");
        }
    }
}

fn failure_comment(stage: FailureStage, err: &Error, build: Option<&Build>) -> String {
    let mut body = format!(
        "### Ephemeral environment failed\n\n**Stage:** {}\n**Reason:** {}\n",
        stage,
        err.short_reason()
    );
    if let Some(build) = build {
        body.push_str(&format!("**Build:** `{}`\n", build.build_id));
        if let Some(logs) = &build.logs_ref {
            body.push_str(&format!("**Logs:** `{}`\n", logs));
        }
    }
    if let Error::Bootstrap { stderr, .. } = err {
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(20)..].join("\n");
        if !tail.trim().is_empty() {
            body.push_str(&format!(
                "\n<details><summary>stderr (last 20 lines)</summary>\n\n```\n{}\n```\n</details>\n",
                tail
            ));
        }
    }
    if matches!(stage, FailureStage::Bootstrap | FailureStage::Tunnel) {
        body.push_str("\nThe instance was left running for inspection. Push a new commit to retry.\n");
    }
    body
}
