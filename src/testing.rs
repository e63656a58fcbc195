//! In-memory fakes of every external collaborator.
//!
//! Used by the unit tests in this crate and by the integration tests under
//! `tests/`. Nothing here touches the network or a cloud account.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::backoff::RetryPolicy;
use crate::bootstrap::{BootstrapRunner, CommandChannel, CommandOutput, InvocationStatus};
use crate::compute::{ComputeError, ComputeManager, ComputeProvider, InstanceInfo, InstanceState, LaunchSpec};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::notify::{CommitState, ReviewHost};
use crate::orchestrator::{DeployOrchestrator, Services};
use crate::reconciler::Reconciler;
use crate::request::{LifecycleAction, LifecycleRequest, PullRequestRef, RepositoryRef};
use crate::secrets::SecretsResolver;
use crate::store::MemoryStateStore;
use crate::tunnel::QuickTunnelProvisioner;

/// Hostname the harness's tunnel reports.
pub const TUNNEL_URL: &str = "https://brave-otter-lamp-sunset.trycloudflare.com";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A deploy request for `repo#pr` at `sha` on branch `feature-x`.
pub fn deploy_request(repo: &str, pr: u64, sha: &str) -> LifecycleRequest {
    LifecycleRequest {
        action: LifecycleAction::Deploy,
        repository: RepositoryRef {
            full_name: repo.to_string(),
            clone_url: format!("https://github.com/{}.git", repo),
            is_private: false,
        },
        pull_request: PullRequestRef {
            number: pr,
            branch: "feature-x".to_string(),
            sha: sha.to_string(),
            author: Some("octocat".to_string()),
            url: Some(format!("https://github.com/{}/pull/{}", repo, pr)),
        },
        sender: Some("octocat".to_string()),
        timestamp: None,
    }
}

/// A destroy request for `repo#pr`.
pub fn destroy_request(repo: &str, pr: u64) -> LifecycleRequest {
    LifecycleRequest {
        action: LifecycleAction::Destroy,
        repository: RepositoryRef {
            full_name: repo.to_string(),
            clone_url: String::new(),
            is_private: false,
        },
        pull_request: PullRequestRef {
            number: pr,
            branch: String::new(),
            sha: String::new(),
            author: None,
            url: None,
        },
        sender: None,
        timestamp: None,
    }
}

#[derive(Default)]
struct ComputeState {
    instances: BTreeMap<String, InstanceInfo>,
    launch_failures: VecDeque<ComputeError>,
    launch_attempts: usize,
    start_calls: HashMap<String, usize>,
    stop_calls: HashMap<String, usize>,
    terminate_calls: HashMap<String, usize>,
    agent_not_ready: bool,
    next_id: u64,
}

/// Compute provider whose instances change state instantly.
#[derive(Default)]
pub struct FakeCompute {
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` launches fail with `err`.
    pub fn fail_next_launches(&self, n: usize, err: ComputeError) {
        let mut state = lock(&self.state);
        for _ in 0..n {
            state.launch_failures.push_back(err.clone());
        }
    }

    pub fn launch_attempts(&self) -> usize {
        lock(&self.state).launch_attempts
    }

    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        lock(&self.state).instances.get(instance_id).map(|i| i.state)
    }

    pub fn start_calls(&self, instance_id: &str) -> usize {
        lock(&self.state).start_calls.get(instance_id).copied().unwrap_or(0)
    }

    pub fn stop_calls(&self, instance_id: &str) -> usize {
        lock(&self.state).stop_calls.get(instance_id).copied().unwrap_or(0)
    }

    pub fn terminate_calls(&self, instance_id: &str) -> usize {
        lock(&self.state).terminate_calls.get(instance_id).copied().unwrap_or(0)
    }

    /// Whether the command agent reports in once an instance runs.
    pub fn set_agent_ready(&self, ready: bool) {
        lock(&self.state).agent_not_ready = !ready;
    }

    /// Forgets an instance, as if it was deleted out of band.
    pub fn remove_instance(&self, instance_id: &str) {
        lock(&self.state).instances.remove(instance_id);
    }

    pub fn insert_instance(&self, instance_id: &str, state: InstanceState, tags: BTreeMap<String, String>) {
        lock(&self.state).instances.insert(
            instance_id.to_string(),
            InstanceInfo {
                instance_id: instance_id.to_string(),
                state,
                tags,
            },
        );
    }

    fn set_state(
        &self,
        instance_id: &str,
        to: InstanceState,
        calls: impl FnOnce(&mut ComputeState) -> &mut HashMap<String, usize>,
    ) -> std::result::Result<(), ComputeError> {
        let mut state = lock(&self.state);
        *calls(&mut *state).entry(instance_id.to_string()).or_default() += 1;
        match state.instances.get_mut(instance_id) {
            Some(info) => {
                info.state = to;
                Ok(())
            }
            None => Err(ComputeError::NotFound(instance_id.to_string())),
        }
    }
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn run_instance(&self, spec: &LaunchSpec) -> std::result::Result<String, ComputeError> {
        let mut state = lock(&self.state);
        state.launch_attempts += 1;
        if let Some(err) = state.launch_failures.pop_front() {
            return Err(err);
        }
        state.next_id += 1;
        let instance_id = format!("i-{:017x}", state.next_id);
        state.instances.insert(
            instance_id.clone(),
            InstanceInfo {
                instance_id: instance_id.clone(),
                state: InstanceState::Running,
                tags: spec.tags.clone(),
            },
        );
        Ok(instance_id)
    }

    async fn start_instance(&self, instance_id: &str) -> std::result::Result<(), ComputeError> {
        self.set_state(instance_id, InstanceState::Running, |s| &mut s.start_calls)
    }

    async fn stop_instance(&self, instance_id: &str) -> std::result::Result<(), ComputeError> {
        self.set_state(instance_id, InstanceState::Stopped, |s| &mut s.stop_calls)
    }

    async fn terminate_instance(&self, instance_id: &str) -> std::result::Result<(), ComputeError> {
        self.set_state(instance_id, InstanceState::Terminated, |s| &mut s.terminate_calls)
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> std::result::Result<Option<InstanceInfo>, ComputeError> {
        Ok(lock(&self.state).instances.get(instance_id).cloned())
    }

    async fn is_command_agent_ready(&self, instance_id: &str) -> std::result::Result<bool, ComputeError> {
        let state = lock(&self.state);
        Ok(!state.agent_not_ready
            && state
                .instances
                .get(instance_id)
                .map_or(false, |i| i.state == InstanceState::Running))
    }

    async fn list_managed_instances(&self) -> std::result::Result<Vec<InstanceInfo>, ComputeError> {
        Ok(lock(&self.state)
            .instances
            .values()
            .filter(|i| i.state != InstanceState::Terminated)
            .cloned()
            .collect())
    }
}

struct Rule {
    pattern: String,
    skips: usize,
    /// `None` never finishes.
    output: Option<CommandOutput>,
}

#[derive(Default)]
struct ChannelState {
    rules: Vec<Rule>,
    sent: Vec<(String, String)>,
    invocations: HashMap<String, Option<CommandOutput>>,
    next_id: u64,
}

/// Command channel answering scripts from substring rules.
///
/// The first rule whose pattern occurs in the script decides the result;
/// unmatched scripts succeed with no output.
pub struct FakeCommandChannel {
    state: Mutex<ChannelState>,
    gate: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
}

impl Default for FakeCommandChannel {
    fn default() -> Self {
        let (gate, gate_rx) = watch::channel(true);
        Self {
            state: Mutex::new(ChannelState::default()),
            gate,
            gate_rx,
        }
    }
}

impl FakeCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.respond_after(pattern, 0, output);
    }

    /// Like [`respond`](Self::respond), but the first `skips` matches get
    /// the default empty output.
    pub fn respond_after(&self, pattern: &str, skips: usize, output: CommandOutput) {
        lock(&self.state).rules.push(Rule {
            pattern: pattern.to_string(),
            skips,
            output: Some(output),
        });
    }

    /// Scripts containing `pattern` stay in progress forever.
    pub fn never_finish(&self, pattern: &str) {
        lock(&self.state).rules.push(Rule {
            pattern: pattern.to_string(),
            skips: 0,
            output: None,
        });
    }

    /// Answers tunnel log reads with [`TUNNEL_URL`].
    pub fn respond_tunnel_url(&self) {
        self.respond(
            "cloudflared.log",
            CommandOutput {
                exit_code: 0,
                stdout: format!("INF |  {}  |\n", TUNNEL_URL),
                stderr: String::new(),
            },
        );
    }

    /// Answers the `inject_secrets` step with `report`, as printed on the
    /// instance.
    pub fn respond_secrets_report(&self, report: &str) {
        self.respond(
            "inject_secrets",
            CommandOutput {
                exit_code: 0,
                stdout: report.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn clear_rules(&self) {
        lock(&self.state).rules.clear();
    }

    /// Holds every subsequent `send` until [`resume`](Self::resume).
    pub fn pause(&self) {
        let _ = self.gate.send(false);
    }

    pub fn resume(&self) {
        let _ = self.gate.send(true);
    }

    /// Scripts sent to `instance_id`, in order.
    pub fn scripts_for(&self, instance_id: &str) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|(instance, _)| instance == instance_id)
            .map(|(_, script)| script.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.state).sent.len()
    }
}

#[async_trait]
impl CommandChannel for FakeCommandChannel {
    async fn send(&self, instance_id: &str, script: &str, _timeout: Duration) -> Result<String> {
        let mut gate = self.gate_rx.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }

        let mut state = lock(&self.state);
        state.next_id += 1;
        let command_id = format!("cmd-{}", state.next_id);
        state.sent.push((instance_id.to_string(), script.to_string()));

        let output = match state.rules.iter_mut().find(|r| script.contains(&r.pattern)) {
            Some(rule) if rule.skips > 0 => {
                rule.skips -= 1;
                Some(CommandOutput::default())
            }
            Some(rule) => rule.output.clone(),
            None => Some(CommandOutput::default()),
        };
        state.invocations.insert(command_id.clone(), output);
        Ok(command_id)
    }

    async fn invocation(&self, _instance_id: &str, command_id: &str) -> Result<Option<InvocationStatus>> {
        match lock(&self.state).invocations.get(command_id) {
            Some(Some(output)) => Ok(Some(InvocationStatus::Finished(output.clone()))),
            Some(None) => Ok(Some(InvocationStatus::InProgress)),
            None => Err(Error::Command(format!("unknown command {}", command_id))),
        }
    }
}

/// A commit status the review host received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedStatus {
    pub repo: String,
    pub sha: String,
    pub state: CommitState,
    pub description: String,
    pub target_url: Option<String>,
}

/// A PR comment the review host received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub repo: String,
    pub pr_number: u64,
    pub body: String,
}

#[derive(Default)]
struct ReviewState {
    statuses: Vec<PostedStatus>,
    comments: Vec<PostedComment>,
    closed: HashSet<(String, u64)>,
    token: Option<String>,
    fail_pr_lookups: bool,
}

/// Review host that records what it is told.
#[derive(Default)]
pub struct RecordingReviewHost {
    state: Mutex<ReviewState>,
}

impl RecordingReviewHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<PostedStatus> {
        lock(&self.state).statuses.clone()
    }

    pub fn comments(&self) -> Vec<PostedComment> {
        lock(&self.state).comments.clone()
    }

    pub fn close_pull_request(&self, repo: &str, pr_number: u64) {
        lock(&self.state).closed.insert((repo.to_string(), pr_number));
    }

    pub fn set_token(&self, token: &str) {
        lock(&self.state).token = Some(token.to_string());
    }

    pub fn fail_pr_lookups(&self, fail: bool) {
        lock(&self.state).fail_pr_lookups = fail;
    }
}

#[async_trait]
impl ReviewHost for RecordingReviewHost {
    async fn post_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()> {
        lock(&self.state).statuses.push(PostedStatus {
            repo: repo.to_string(),
            sha: sha.to_string(),
            state,
            description: description.to_string(),
            target_url: target_url.map(str::to_string),
        });
        Ok(())
    }

    async fn post_comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<()> {
        lock(&self.state).comments.push(PostedComment {
            repo: repo.to_string(),
            pr_number,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn is_pull_request_open(&self, repo: &str, pr_number: u64) -> Result<bool> {
        let state = lock(&self.state);
        if state.fail_pr_lookups {
            return Err(Error::GitHub("API rate limit exceeded".into()));
        }
        Ok(!state.closed.contains(&(repo.to_string(), pr_number)))
    }

    async fn access_token(&self, _repo: &str) -> Result<Option<String>> {
        Ok(lock(&self.state).token.clone())
    }
}

/// An orchestrator and reconciler wired to fakes, with millisecond polling.
pub struct TestHarness {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<MemoryStateStore>,
    pub compute: Arc<FakeCompute>,
    pub channel: Arc<FakeCommandChannel>,
    pub review: Arc<RecordingReviewHost>,
    pub orchestrator: DeployOrchestrator,
    pub reconciler: Reconciler,
}

impl TestHarness {
    /// Default configuration; build logs go under `logs_dir`.
    pub fn new(logs_dir: &Path) -> Self {
        Self::with_config(logs_dir, OrchestratorConfig::default())
    }

    pub fn with_config(logs_dir: &Path, mut config: OrchestratorConfig) -> Self {
        config.paths.logs_dir = logs_dir.to_path_buf();
        let config = Arc::new(config);

        let store = Arc::new(MemoryStateStore::new());
        let compute = Arc::new(FakeCompute::new());
        let channel = Arc::new(FakeCommandChannel::new());
        let review = Arc::new(RecordingReviewHost::new());
        channel.respond_tunnel_url();

        let fast = (Duration::from_millis(1), Duration::from_millis(5));
        let runner = BootstrapRunner::new(channel.clone()).with_poll_interval(fast.0, fast.1);
        let tunnel = QuickTunnelProvisioner::new(
            runner.clone(),
            config.instance.tunnel_log.clone(),
            config.instance.app_port,
            &config.instance.tunnel_public_suffix,
            config.tunnel_timeout(),
        )
        .map(|t| t.with_poll_interval(fast.0, fast.1))
        .unwrap_or_else(|e| panic!("default tunnel suffix must be valid: {}", e));

        let services = Services {
            store: store.clone(),
            compute: ComputeManager::new(
                compute.clone(),
                RetryPolicy {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            )
            .with_poll_interval(fast.0, fast.1),
            runner,
            tunnel: Arc::new(tunnel),
            secrets: SecretsResolver::new(config.instance.secrets_prefix.clone()),
            review: review.clone(),
            locks: KeyedLocks::new(),
        };

        Self {
            orchestrator: DeployOrchestrator::new(config.clone(), services.clone()),
            reconciler: Reconciler::new(config.clone(), services),
            config,
            store,
            compute,
            channel,
            review,
        }
    }
}
