//! Ephemeral Environments - one preview VM per pull request
//!
//! This library provisions an isolated compute instance for an open pull
//! request, boots the PR's containerized stack on it, publishes it through a
//! tunnel, and reaps it again when the PR is closed or goes idle.

pub mod aws;
pub mod backoff;
pub mod bootstrap;
pub mod build;
pub mod compute;
pub mod config;
pub mod environment;
pub mod error;
pub mod locks;
pub mod notify;
pub mod orchestrator;
pub mod reconciler;
pub mod request;
pub mod secrets;
pub mod store;
pub mod testing;
pub mod tunnel;

pub use error::{Error, FailureStage, Result};

pub use bootstrap::{BootstrapPlan, BootstrapRunner, BootstrapStep, CommandChannel, SsmCommandChannel};
pub use build::{Build, BuildId, BuildLogs, BuildStatus};
pub use compute::{AwsComputeProvider, ComputeManager, ComputeProvider, InstanceInfo, InstanceState, LaunchSpec};
pub use config::{OrchestratorConfig, Validate, ValidationResult};
pub use environment::{Environment, EnvironmentKey, EnvironmentStatus};
pub use notify::{CommitState, GhCliReviewHost, ReviewHost};
pub use orchestrator::{DeployOrchestrator, DeployOutcome, DeployTimings, Services};
pub use reconciler::{ReconcileStats, Reconciler};
pub use request::{parse_requests, LifecycleAction, LifecycleRequest};
pub use secrets::{Redactor, SecretResolutionWarning, SecretsReport, SecretsResolver};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use tunnel::{QuickTunnelProvisioner, TunnelEndpoint, TunnelProvisioner};
