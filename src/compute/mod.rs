//! Compute lifecycle: launch, readiness, stop and terminate of the per-PR VM.
//!
//! [`ComputeProvider`] is the raw control-plane seam. [`ComputeManager`]
//! layers bounded retries for transient failures, idempotent stop/terminate
//! and a cancellable readiness wait on top of it.

mod aws;

pub use aws::AwsComputeProvider;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backoff::{ExponentialBackoff, RetryError, RetryPolicy};
use crate::environment::EnvironmentKey;
use crate::error::{Error, Result};

pub const TAG_NAME: &str = "Name";
pub const TAG_REPOSITORY: &str = "Repository";
pub const TAG_PR_NUMBER: &str = "PRNumber";
pub const TAG_BRANCH: &str = "Branch";
pub const TAG_MANAGED_BY: &str = "ManagedBy";

/// Provider-reported instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "shutting-down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            _ => None,
        }
    }

    /// The instance is gone or going; it can never run again.
    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }

    /// The instance is not running and is not about to.
    pub fn is_halted(&self) -> bool {
        matches!(self, InstanceState::Stopping | InstanceState::Stopped) || self.is_gone()
    }
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub tags: BTreeMap<String, String>,
}

impl InstanceInfo {
    /// The Environment this instance was launched for, from its tags.
    pub fn environment_key(&self) -> Option<EnvironmentKey> {
        let repo = self.tags.get(TAG_REPOSITORY)?;
        let pr = self.tags.get(TAG_PR_NUMBER)?.parse().ok()?;
        Some(EnvironmentKey::new(repo.clone(), pr))
    }
}

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    /// Per-repository instance profile used for scoped secret access.
    pub instance_profile_arn: Option<String>,
}

impl LaunchSpec {
    /// Launch spec carrying the tags the reconciler relies on.
    pub fn for_environment(key: &EnvironmentKey, branch: &str, name_prefix: &str, managed_by: &str) -> Self {
        let name = format!("{}-{}", name_prefix, key.slug());
        let tags = BTreeMap::from([
            (TAG_NAME.to_string(), name.clone()),
            (TAG_REPOSITORY.to_string(), key.repo_full_name.clone()),
            (TAG_PR_NUMBER.to_string(), key.pr_number.to_string()),
            (TAG_BRANCH.to_string(), branch.to_string()),
            (TAG_MANAGED_BY.to_string(), managed_by.to_string()),
        ]);
        Self {
            name,
            tags,
            instance_profile_arn: None,
        }
    }

    pub fn with_instance_profile(mut self, arn: Option<String>) -> Self {
        self.instance_profile_arn = arn;
        self
    }
}

/// Provider-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Fatal(String),
}

impl ComputeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::Transient(_))
    }
}

impl From<crate::aws::AwsCliError> for ComputeError {
    fn from(e: crate::aws::AwsCliError) -> Self {
        use crate::aws::AwsCliError;
        match e {
            AwsCliError::Transient(m) => ComputeError::Transient(m),
            AwsCliError::NotFound(m) => ComputeError::NotFound(m),
            AwsCliError::Fatal(m) => ComputeError::Fatal(m),
        }
    }
}

/// Raw compute control plane.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Requests one instance from the fixed launch template.
    async fn run_instance(&self, spec: &LaunchSpec) -> std::result::Result<String, ComputeError>;

    async fn start_instance(&self, instance_id: &str) -> std::result::Result<(), ComputeError>;

    async fn stop_instance(&self, instance_id: &str) -> std::result::Result<(), ComputeError>;

    async fn terminate_instance(&self, instance_id: &str) -> std::result::Result<(), ComputeError>;

    /// `None` when the provider has no record of the instance.
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> std::result::Result<Option<InstanceInfo>, ComputeError>;

    /// Whether the remote-command agent on the instance has registered.
    async fn is_command_agent_ready(&self, instance_id: &str)
        -> std::result::Result<bool, ComputeError>;

    /// Every live (not terminated) instance tagged as managed by this system.
    async fn list_managed_instances(&self) -> std::result::Result<Vec<InstanceInfo>, ComputeError>;
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Retrying, idempotent facade over a [`ComputeProvider`].
#[derive(Clone)]
pub struct ComputeManager {
    provider: Arc<dyn ComputeProvider>,
    retry: RetryPolicy,
    poll_initial: Duration,
    poll_max: Duration,
}

impl ComputeManager {
    pub fn new(provider: Arc<dyn ComputeProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            poll_initial: Duration::from_secs(2),
            poll_max: Duration::from_secs(15),
        }
    }

    /// Sets the readiness polling interval bounds.
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max;
        self
    }

    async fn call<T, F, Fut>(&self, what: &str, instance: &str, op: F) -> std::result::Result<T, ComputeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ComputeError>>,
    {
        match self.retry.retry(op, ComputeError::is_transient).await {
            Ok(v) => Ok(v),
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(op = what, instance_id = instance, attempts, error = %last, "retries exhausted");
                Err(last)
            }
            Err(RetryError::Permanent(e)) => Err(e),
        }
    }

    /// Launches a new instance, retrying transient failures.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let instance_id = self
            .call("launch", &spec.name, || self.provider.run_instance(spec))
            .await
            .map_err(|e| Error::Provisioning(format!("launch of {} failed: {}", spec.name, e)))?;
        tracing::info!(instance_id = %instance_id, name = %spec.name, "launched instance");
        Ok(instance_id)
    }

    /// Starts a stopped instance; already running is success.
    pub async fn start(&self, instance_id: &str) -> Result<()> {
        match self.describe(instance_id).await? {
            Some(info) if info.state == InstanceState::Running || info.state == InstanceState::Pending => {
                return Ok(())
            }
            Some(info) if info.state.is_gone() => {
                return Err(Error::Provisioning(format!(
                    "instance {} is {:?} and cannot be started",
                    instance_id, info.state
                )))
            }
            None => {
                return Err(Error::Provisioning(format!(
                    "instance {} no longer exists",
                    instance_id
                )))
            }
            Some(_) => {}
        }

        self.call("start", instance_id, || self.provider.start_instance(instance_id))
            .await
            .map_err(|e| Error::Provisioning(format!("start of {} failed: {}", instance_id, e)))?;
        tracing::info!(instance_id, "started instance");
        Ok(())
    }

    /// Polls until the instance runs and accepts remote commands, or `timeout` passes.
    pub async fn wait_until_ready(&self, instance_id: &str, timeout: Duration) -> Result<Readiness> {
        let poll = async {
            let mut backoff = ExponentialBackoff::new(self.poll_initial, self.poll_max);
            loop {
                match self.provider.describe_instance(instance_id).await {
                    Ok(Some(info)) if info.state.is_gone() => {
                        return Err(Error::Provisioning(format!(
                            "instance {} entered {:?} while waiting for readiness",
                            instance_id, info.state
                        )));
                    }
                    Ok(Some(info)) if info.state == InstanceState::Running => {
                        match self.provider.is_command_agent_ready(instance_id).await {
                            Ok(true) => return Ok(()),
                            Ok(false) => tracing::debug!(instance_id, "command agent not registered yet"),
                            Err(e) if e.is_transient() => {
                                tracing::debug!(instance_id, error = %e, "agent check failed, polling again")
                            }
                            Err(e) => {
                                return Err(Error::Provisioning(format!(
                                    "agent check for {} failed: {}",
                                    instance_id, e
                                )))
                            }
                        }
                    }
                    Ok(_) => tracing::debug!(instance_id, "instance not running yet"),
                    Err(e) if e.is_transient() || matches!(e, ComputeError::NotFound(_)) => {
                        // Freshly launched instances can briefly be invisible.
                        tracing::debug!(instance_id, error = %e, "describe failed, polling again")
                    }
                    Err(e) => {
                        return Err(Error::Provisioning(format!(
                            "describe of {} failed: {}",
                            instance_id, e
                        )))
                    }
                }
                backoff.wait().await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(Ok(())) => {
                tracing::info!(instance_id, "instance ready");
                Ok(Readiness::Ready)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(instance_id, timeout_secs = timeout.as_secs(), "instance readiness timed out");
                Ok(Readiness::TimedOut)
            }
        }
    }

    /// Stops an instance. Already stopped, terminated or unknown is success.
    pub async fn stop(&self, instance_id: &str) -> Result<()> {
        if let Some(info) = self.describe(instance_id).await? {
            if info.state.is_halted() {
                tracing::debug!(instance_id, state = ?info.state, "stop is a no-op");
                return Ok(());
            }
        } else {
            return Ok(());
        }

        match self.call("stop", instance_id, || self.provider.stop_instance(instance_id)).await {
            Ok(()) | Err(ComputeError::NotFound(_)) => {
                tracing::info!(instance_id, "stopped instance");
                Ok(())
            }
            Err(e) => Err(Error::Provisioning(format!("stop of {} failed: {}", instance_id, e))),
        }
    }

    /// Terminates an instance. Already terminated or unknown is success.
    pub async fn terminate(&self, instance_id: &str) -> Result<()> {
        match self.describe(instance_id).await? {
            Some(info) if info.state.is_gone() => {
                tracing::debug!(instance_id, state = ?info.state, "terminate is a no-op");
                return Ok(());
            }
            None => return Ok(()),
            Some(_) => {}
        }

        match self
            .call("terminate", instance_id, || self.provider.terminate_instance(instance_id))
            .await
        {
            Ok(()) | Err(ComputeError::NotFound(_)) => {
                tracing::info!(instance_id, "terminated instance");
                Ok(())
            }
            Err(e) => Err(Error::Provisioning(format!(
                "terminate of {} failed: {}",
                instance_id, e
            ))),
        }
    }

    /// Current state of an instance, `None` if the provider does not know it.
    pub async fn describe(&self, instance_id: &str) -> Result<Option<InstanceInfo>> {
        match self
            .call("describe", instance_id, || self.provider.describe_instance(instance_id))
            .await
        {
            Ok(info) => Ok(info),
            Err(ComputeError::NotFound(_)) => Ok(None),
            Err(e) => Err(Error::Provisioning(format!(
                "describe of {} failed: {}",
                instance_id, e
            ))),
        }
    }

    /// Whether the instance exists and can still run.
    pub async fn is_alive(&self, instance_id: &str) -> Result<bool> {
        Ok(self
            .describe(instance_id)
            .await?
            .map_or(false, |info| !info.state.is_gone()))
    }

    /// Live instances tagged as managed by this system.
    pub async fn list_managed(&self) -> Result<Vec<InstanceInfo>> {
        self.call("list", "*", || self.provider.list_managed_instances())
            .await
            .map_err(|e| Error::Provisioning(format!("listing instances failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCompute;

    fn manager(fake: &Arc<FakeCompute>) -> ComputeManager {
        ComputeManager::new(
            fake.clone(),
            RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        )
        .with_poll_interval(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn spec() -> LaunchSpec {
        LaunchSpec::for_environment(&EnvironmentKey::new("acme/widgets", 42), "feature-x", "ephemeral", "ephemeral-env")
    }

    #[test]
    fn launch_spec_carries_reconciler_tags() {
        let spec = spec();
        assert_eq!(spec.name, "ephemeral-acme-widgets-42");
        assert_eq!(spec.tags[TAG_REPOSITORY], "acme/widgets");
        assert_eq!(spec.tags[TAG_PR_NUMBER], "42");
        assert_eq!(spec.tags[TAG_MANAGED_BY], "ephemeral-env");
    }

    #[test]
    fn instance_info_recovers_environment_key() {
        let info = InstanceInfo {
            instance_id: "i-1".into(),
            state: InstanceState::Running,
            tags: spec().tags,
        };
        assert_eq!(info.environment_key(), Some(EnvironmentKey::new("acme/widgets", 42)));
    }

    #[tokio::test]
    async fn launch_retries_transient_errors() {
        let fake = Arc::new(FakeCompute::new());
        fake.fail_next_launches(2, ComputeError::Transient("RequestLimitExceeded".into()));

        let id = manager(&fake).launch(&spec()).await.unwrap();
        assert!(fake.instance_state(&id).is_some());
        assert_eq!(fake.launch_attempts(), 3);
    }

    #[tokio::test]
    async fn launch_fails_with_provisioning_error_after_exhaustion() {
        let fake = Arc::new(FakeCompute::new());
        fake.fail_next_launches(10, ComputeError::Transient("InsufficientInstanceCapacity".into()));

        let err = manager(&fake).launch(&spec()).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert_eq!(fake.launch_attempts(), 3);
    }

    #[tokio::test]
    async fn terminate_twice_is_idempotent() {
        let fake = Arc::new(FakeCompute::new());
        let mgr = manager(&fake);
        let id = mgr.launch(&spec()).await.unwrap();

        mgr.terminate(&id).await.unwrap();
        mgr.terminate(&id).await.unwrap();

        assert_eq!(fake.instance_state(&id), Some(InstanceState::Terminated));
        assert_eq!(fake.terminate_calls(&id), 1);
    }

    #[tokio::test]
    async fn stop_and_terminate_unknown_instances_succeed() {
        let fake = Arc::new(FakeCompute::new());
        let mgr = manager(&fake);

        mgr.stop("i-missing").await.unwrap();
        mgr.terminate("i-missing").await.unwrap();
        assert!(mgr.describe("i-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_of_stopped_instance_is_a_no_op() {
        let fake = Arc::new(FakeCompute::new());
        let mgr = manager(&fake);
        let id = mgr.launch(&spec()).await.unwrap();

        mgr.stop(&id).await.unwrap();
        mgr.stop(&id).await.unwrap();
        assert_eq!(fake.instance_state(&id), Some(InstanceState::Stopped));
        assert_eq!(fake.stop_calls(&id), 1);
    }

    #[tokio::test]
    async fn wait_until_ready_reports_ready() {
        let fake = Arc::new(FakeCompute::new());
        let mgr = manager(&fake);
        let id = mgr.launch(&spec()).await.unwrap();

        let readiness = mgr.wait_until_ready(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_when_agent_never_registers() {
        let fake = Arc::new(FakeCompute::new());
        fake.set_agent_ready(false);
        let mgr = manager(&fake);
        let id = mgr.launch(&spec()).await.unwrap();

        let readiness = mgr
            .wait_until_ready(&id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[tokio::test]
    async fn start_rejects_vanished_instances() {
        let fake = Arc::new(FakeCompute::new());
        let err = manager(&fake).start("i-gone").await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
    }
}
