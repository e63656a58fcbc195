//! Orchestrator configuration.
//!
//! Loaded from a TOML file where every field has a default, then overridden
//! by `EPHEMERAL_*` environment variables. Durations are whole seconds.
//! [`Validate`] catches misconfiguration before any cloud call is made.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Compute resources the instances are launched into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub launch_template_id: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub security_group_id: String,
    /// Instance names are `<prefix>-<owner>-<repo>-<pr>`.
    #[serde(default = "default_instance_name_prefix")]
    pub instance_name_prefix: String,
    /// Value of the `ManagedBy` tag identifying our instances.
    #[serde(default = "default_managed_by")]
    pub managed_by: String,
}

fn default_instance_name_prefix() -> String {
    "ephemeral".to_string()
}

fn default_managed_by() -> String {
    "ephemeral-env".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: None,
            launch_template_id: String::new(),
            subnet_ids: Vec::new(),
            security_group_id: String::new(),
            instance_name_prefix: default_instance_name_prefix(),
            managed_by: default_managed_by(),
        }
    }
}

/// Fleet size and lifetime policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_max_environments")]
    pub max_environments: usize,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_stopped_lifetime_secs")]
    pub stopped_lifetime_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// How long records linger in the store after their last write.
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
}

fn default_max_environments() -> usize {
    10
}

fn default_idle_threshold_secs() -> u64 {
    4 * 60 * 60
}

fn default_stopped_lifetime_secs() -> u64 {
    24 * 60 * 60
}

fn default_reconcile_interval_secs() -> u64 {
    30 * 60
}

fn default_record_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_environments: default_max_environments(),
            idle_threshold_secs: default_idle_threshold_secs(),
            stopped_lifetime_secs: default_stopped_lifetime_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            record_ttl_secs: default_record_ttl_secs(),
        }
    }
}

/// Bounds on the long-running waits of a deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_readiness_secs")]
    pub readiness_secs: u64,
    #[serde(default = "default_bootstrap_secs")]
    pub bootstrap_secs: u64,
    #[serde(default = "default_tunnel_secs")]
    pub tunnel_secs: u64,
    /// Bound on a whole request, covering every wait above.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
}

fn default_readiness_secs() -> u64 {
    300
}

fn default_bootstrap_secs() -> u64 {
    900
}

fn default_tunnel_secs() -> u64 {
    30
}

fn default_request_secs() -> u64 {
    900
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            readiness_secs: default_readiness_secs(),
            bootstrap_secs: default_bootstrap_secs(),
            tunnel_secs: default_tunnel_secs(),
            request_secs: default_request_secs(),
        }
    }
}

/// Retry policy for transient compute errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Local directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("./logs")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

/// Layout on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_app_dir")]
    pub app_dir: String,
    /// Port the compose stack serves on; the tunnel forwards to it.
    #[serde(default = "default_app_port")]
    pub app_port: u16,
    #[serde(default = "default_tunnel_log")]
    pub tunnel_log: String,
    #[serde(default = "default_tunnel_public_suffix")]
    pub tunnel_public_suffix: String,
    /// Secret-store prefix of per-repository manifests.
    #[serde(default = "default_secrets_prefix")]
    pub secrets_prefix: String,
}

fn default_app_dir() -> String {
    "/app/repo".to_string()
}

fn default_app_port() -> u16 {
    80
}

fn default_tunnel_log() -> String {
    "/var/log/cloudflared.log".to_string()
}

fn default_tunnel_public_suffix() -> String {
    "trycloudflare.com".to_string()
}

fn default_secrets_prefix() -> String {
    "ephemeral-env/repos".to_string()
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            app_port: default_app_port(),
            tunnel_log: default_tunnel_log(),
            tunnel_public_suffix: default_tunnel_public_suffix(),
            secrets_prefix: default_secrets_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_status_context")]
    pub status_context: String,
}

fn default_status_context() -> String {
    "Ephemeral Environment".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            status_context: default_status_context(),
        }
    }
}

/// Per-repository overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Instance profile granting access to this repository's secrets.
    #[serde(default)]
    pub instance_profile_arn: Option<String>,
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    /// Keyed by `owner/name`.
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

impl OrchestratorConfig {
    /// Parses TOML, filling unspecified fields with defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads `path` (or defaults when `None`) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `EPHEMERAL_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, value)))
        }

        if let Some(v) = lookup("EPHEMERAL_AWS_REGION").or_else(|| lookup("AWS_REGION")) {
            self.aws.region = Some(v).filter(|r| !r.is_empty());
        }
        if let Some(v) = lookup("EPHEMERAL_LAUNCH_TEMPLATE_ID") {
            self.aws.launch_template_id = v;
        }
        if let Some(v) = lookup("EPHEMERAL_SUBNET_IDS") {
            self.aws.subnet_ids = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("EPHEMERAL_SECURITY_GROUP_ID") {
            self.aws.security_group_id = v;
        }
        if let Some(v) = lookup("EPHEMERAL_MAX_ENVIRONMENTS") {
            self.fleet.max_environments = parse("EPHEMERAL_MAX_ENVIRONMENTS", v)?;
        }
        if let Some(v) = lookup("EPHEMERAL_IDLE_THRESHOLD_SECS") {
            self.fleet.idle_threshold_secs = parse("EPHEMERAL_IDLE_THRESHOLD_SECS", v)?;
        }
        if let Some(v) = lookup("EPHEMERAL_STOPPED_LIFETIME_SECS") {
            self.fleet.stopped_lifetime_secs = parse("EPHEMERAL_STOPPED_LIFETIME_SECS", v)?;
        }
        if let Some(v) = lookup("EPHEMERAL_RECONCILE_INTERVAL_SECS") {
            self.fleet.reconcile_interval_secs = parse("EPHEMERAL_RECONCILE_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("EPHEMERAL_REQUEST_TIMEOUT_SECS") {
            self.timeouts.request_secs = parse("EPHEMERAL_REQUEST_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("EPHEMERAL_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("EPHEMERAL_LOGS_DIR") {
            self.paths.logs_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("EPHEMERAL_SECRETS_PREFIX") {
            self.instance.secrets_prefix = v;
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.readiness_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.bootstrap_secs)
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.tunnel_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.fleet.idle_threshold_secs as i64)
    }

    pub fn stopped_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.fleet.stopped_lifetime_secs as i64)
    }

    pub fn record_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.fleet.record_ttl_secs as i64)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.fleet.reconcile_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_secs(self.retry.initial_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    /// Instance profile configured for `repo`, if any.
    pub fn instance_profile_for(&self, repo: &str) -> Option<String> {
        self.repositories
            .get(repo)
            .and_then(|r| r.instance_profile_arn.clone())
    }
}

impl Validate for AwsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.launch_template_id.trim().is_empty() {
            result.add_error("aws.launch_template_id must be set");
        }
        if self.subnet_ids.is_empty() {
            result.add_error("aws.subnet_ids must list at least one subnet");
        }
        if self.security_group_id.trim().is_empty() {
            result.add_warning("aws.security_group_id is empty; the launch template's groups apply");
        }
        if self.managed_by.trim().is_empty() {
            result.add_error("aws.managed_by cannot be empty; the reconciler finds instances by it");
        }
        if self.region.is_none() {
            result.add_warning("no AWS region configured; the CLI default region is used");
        }

        result
    }
}

impl Validate for OrchestratorConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.aws.validate();

        if self.fleet.max_environments == 0 {
            result.add_error("fleet.max_environments must be at least 1");
        }
        if self.fleet.idle_threshold_secs == 0 {
            result.add_error("fleet.idle_threshold_secs must be positive");
        }
        if self.fleet.reconcile_interval_secs == 0 {
            result.add_error("fleet.reconcile_interval_secs must be positive");
        }
        if self.fleet.record_ttl_secs < self.fleet.stopped_lifetime_secs {
            result.add_warning(
                "fleet.record_ttl_secs is shorter than the stopped lifetime; records may expire before their instances",
            );
        }

        if self.retry.max_attempts == 0 {
            result.add_error("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_delay_secs > self.retry.max_delay_secs {
            result.add_error("retry.initial_delay_secs must not exceed retry.max_delay_secs");
        }

        let waits = self.timeouts.readiness_secs + self.timeouts.tunnel_secs;
        if self.timeouts.request_secs <= waits {
            result.add_warning(format!(
                "timeouts.request_secs ({}) leaves no time for bootstrap after readiness and tunnel waits ({}s)",
                self.timeouts.request_secs, waits
            ));
        }

        if self.instance.tunnel_public_suffix.trim().is_empty() {
            result.add_error("instance.tunnel_public_suffix cannot be empty");
        }
        if !self.instance.app_dir.starts_with('/') {
            result.add_error("instance.app_dir must be an absolute path");
        }

        for repo in self.repositories.keys() {
            if !repo.contains('/') {
                result.add_warning(format!("repositories.'{}' is not owner/name", repo));
            }
        }

        result
    }
}
