//! The per-PR Environment record and its lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::LifecycleRequest;

/// Composite identity of an Environment: repository plus PR number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentKey {
    pub repo_full_name: String,
    pub pr_number: u64,
}

impl EnvironmentKey {
    pub fn new(repo_full_name: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            pr_number,
        }
    }

    /// Filesystem- and tag-safe slug, e.g. `acme-widgets-42`.
    pub fn slug(&self) -> String {
        let repo: String = self
            .repo_full_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("{}-{}", repo, self.pr_number)
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo_full_name, self.pr_number)
    }
}

impl FromStr for EnvironmentKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (repo, pr) = s
            .rsplit_once('#')
            .ok_or_else(|| Error::Config(format!("invalid environment key '{}'", s)))?;
        let pr_number = pr
            .parse()
            .map_err(|_| Error::Config(format!("invalid PR number in key '{}'", s)))?;
        if repo.is_empty() {
            return Err(Error::Config(format!("empty repository in key '{}'", s)));
        }
        Ok(Self::new(repo, pr_number))
    }
}

/// Lifecycle state of an Environment.
///
/// The absence of a record is the implicit `none` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Provisioning,
    Booting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Destroyed,
    Failed,
}

impl EnvironmentStatus {
    pub const ALL: [EnvironmentStatus; 8] = [
        EnvironmentStatus::Provisioning,
        EnvironmentStatus::Booting,
        EnvironmentStatus::Running,
        EnvironmentStatus::Stopping,
        EnvironmentStatus::Stopped,
        EnvironmentStatus::Terminating,
        EnvironmentStatus::Destroyed,
        EnvironmentStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Provisioning => "provisioning",
            EnvironmentStatus::Booting => "booting",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Stopping => "stopping",
            EnvironmentStatus::Stopped => "stopped",
            EnvironmentStatus::Terminating => "terminating",
            EnvironmentStatus::Destroyed => "destroyed",
            EnvironmentStatus::Failed => "failed",
        }
    }

    /// Only `destroyed` is terminal; a reopened PR starts over from it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvironmentStatus::Destroyed)
    }

    /// A deploy worker is actively provisioning or booting.
    pub fn is_deploying(&self) -> bool {
        matches!(
            self,
            EnvironmentStatus::Provisioning | EnvironmentStatus::Booting
        )
    }

    /// A teardown is underway.
    pub fn is_tearing_down(&self) -> bool {
        matches!(
            self,
            EnvironmentStatus::Stopping | EnvironmentStatus::Terminating
        )
    }

    /// Counts against the fleet limit.
    pub fn holds_capacity(&self) -> bool {
        matches!(
            self,
            EnvironmentStatus::Provisioning | EnvironmentStatus::Booting | EnvironmentStatus::Running
        )
    }

    /// Whether the lifecycle permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        matches!(
            (self, to),
            (Provisioning, Booting)
                | (Provisioning, Failed)
                | (Provisioning, Stopping)
                | (Booting, Running)
                | (Booting, Failed)
                | (Booting, Stopping)
                | (Running, Running)
                | (Running, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Terminating)
                | (Stopping, Destroyed)
                | (Stopped, Provisioning)
                | (Stopped, Stopping)
                | (Stopped, Terminating)
                | (Stopped, Destroyed)
                | (Terminating, Destroyed)
                | (Failed, Failed)
                | (Failed, Provisioning)
                | (Failed, Stopping)
                | (Failed, Terminating)
                | (Failed, Destroyed)
                | (Destroyed, Provisioning)
        )
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One PR-scoped environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub repo_full_name: String,
    pub pr_number: u64,
    pub status: EnvironmentStatus,
    pub compute_instance_id: Option<String>,
    pub tunnel_id: Option<String>,
    pub tunnel_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// When the environment last entered `stopped`.
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    pub branch: String,
    pub commit_sha: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Human-readable reason for the last failure.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Newest commit waiting behind an in-flight deploy.
    #[serde(default)]
    pub queued_commit: Option<String>,
    /// A destroy arrived while a deploy was in flight.
    #[serde(default)]
    pub destroy_requested: bool,
    /// Newest event time among accepted requests. Older deliveries are
    /// ignored.
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    /// Epoch seconds after which the record may be expired.
    pub ttl: i64,
}

impl Environment {
    /// Creates a fresh record for a PR's first deploy.
    pub fn from_request(request: &LifecycleRequest, now: DateTime<Utc>) -> Self {
        Self {
            repo_full_name: request.repository.full_name.clone(),
            pr_number: request.pull_request.number,
            status: EnvironmentStatus::Provisioning,
            compute_instance_id: None,
            tunnel_id: None,
            tunnel_url: None,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            stopped_at: None,
            branch: request.pull_request.branch.clone(),
            commit_sha: request.pull_request.sha.clone(),
            clone_url: request.repository.clone_url.clone(),
            is_private: request.repository.is_private,
            pr_url: request.pull_request.url.clone(),
            failure_reason: None,
            queued_commit: None,
            destroy_requested: false,
            last_event_at: request.timestamp,
            ttl: 0,
        }
    }

    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey::new(self.repo_full_name.clone(), self.pr_number)
    }

    /// Store identifier, `"<repo>#<pr>"`.
    pub fn id(&self) -> String {
        self.key().to_string()
    }

    /// Moves to `to`, enforcing the transition table and the
    /// running-implies-instance invariant.
    pub fn transition(&mut self, to: EnvironmentStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        if to == EnvironmentStatus::Running && self.compute_instance_id.is_none() {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }

        tracing::debug!(env = %self.id(), from = %self.status, to = %to, "environment transition");
        self.status = to;
        self.updated_at = now;
        match to {
            EnvironmentStatus::Stopped => self.stopped_at = Some(now),
            EnvironmentStatus::Running | EnvironmentStatus::Provisioning => {
                self.stopped_at = None;
                self.failure_reason = None;
            }
            EnvironmentStatus::Destroyed => {
                self.tunnel_url = None;
                self.tunnel_id = None;
                self.queued_commit = None;
                self.destroy_requested = false;
            }
            _ => {}
        }
        Ok(())
    }

    /// Records a failure and moves to `failed`.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(EnvironmentStatus::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Whether an event sent at `at` predates one already accepted.
    /// Events without a time are never stale.
    pub fn is_stale_event(&self, at: Option<DateTime<Utc>>) -> bool {
        matches!((at, self.last_event_at), (Some(at), Some(last)) if at < last)
    }

    /// Advances `last_event_at` to `at` if it is newer.
    pub fn record_event(&mut self, at: Option<DateTime<Utc>>) {
        if let Some(at) = at {
            self.last_event_at = Some(self.last_event_at.map_or(at, |last| last.max(at)));
        }
    }

    /// Adopts the branch/commit/repo details of a newer request.
    pub fn apply_request(&mut self, request: &LifecycleRequest) {
        self.branch = request.pull_request.branch.clone();
        self.commit_sha = request.pull_request.sha.clone();
        self.clone_url = request.repository.clone_url.clone();
        self.is_private = request.repository.is_private;
        if request.pull_request.url.is_some() {
            self.pr_url = request.pull_request.url.clone();
        }
    }

    /// Checks the record's internal consistency.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            EnvironmentStatus::Running | EnvironmentStatus::Booting => {
                self.compute_instance_id.is_some()
            }
            EnvironmentStatus::Destroyed => self.tunnel_url.is_none(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::deploy_request;

    fn sample() -> Environment {
        Environment::from_request(&deploy_request("acme/widgets", 42, "abc123"), Utc::now())
    }

    #[test]
    fn key_round_trips_through_display() {
        let key = EnvironmentKey::new("acme/widgets", 42);
        assert_eq!(key.to_string(), "acme/widgets#42");
        assert_eq!("acme/widgets#42".parse::<EnvironmentKey>().unwrap(), key);
    }

    #[test]
    fn key_rejects_garbage() {
        assert!("acme/widgets".parse::<EnvironmentKey>().is_err());
        assert!("acme/widgets#abc".parse::<EnvironmentKey>().is_err());
        assert!("#12".parse::<EnvironmentKey>().is_err());
    }

    #[test]
    fn slug_is_tag_safe() {
        assert_eq!(EnvironmentKey::new("acme/widgets.io", 7).slug(), "acme-widgets-io-7");
    }

    #[test]
    fn status_serializes_to_lowercase() {
        assert_eq!(
            serde_json::to_string(&EnvironmentStatus::Provisioning).unwrap(),
            "\"provisioning\""
        );
        assert_eq!(
            serde_json::to_string(&EnvironmentStatus::Destroyed).unwrap(),
            "\"destroyed\""
        );
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut env = sample();
        env.compute_instance_id = Some("i-1".into());
        let now = Utc::now();
        env.transition(EnvironmentStatus::Booting, now).unwrap();
        env.transition(EnvironmentStatus::Running, now).unwrap();
        env.transition(EnvironmentStatus::Stopping, now).unwrap();
        env.transition(EnvironmentStatus::Destroyed, now).unwrap();
        assert!(env.status.is_terminal());
    }

    #[test]
    fn running_without_instance_is_rejected() {
        let mut env = sample();
        let now = Utc::now();
        env.status = EnvironmentStatus::Booting;
        let err = env.transition(EnvironmentStatus::Running, now).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn destroyed_cannot_jump_to_running() {
        assert!(!EnvironmentStatus::Destroyed.can_transition_to(EnvironmentStatus::Running));
        assert!(!EnvironmentStatus::Stopped.can_transition_to(EnvironmentStatus::Running));
        assert!(EnvironmentStatus::Destroyed.can_transition_to(EnvironmentStatus::Provisioning));
    }

    #[test]
    fn failure_is_reachable_from_deploying_states() {
        assert!(EnvironmentStatus::Provisioning.can_transition_to(EnvironmentStatus::Failed));
        assert!(EnvironmentStatus::Booting.can_transition_to(EnvironmentStatus::Failed));
        assert!(!EnvironmentStatus::Stopped.can_transition_to(EnvironmentStatus::Failed));
    }

    #[test]
    fn stopping_records_stop_time_and_destroy_clears_url() {
        let mut env = sample();
        env.compute_instance_id = Some("i-1".into());
        env.tunnel_url = Some("https://a.trycloudflare.com".into());
        env.status = EnvironmentStatus::Running;
        let now = Utc::now();

        env.transition(EnvironmentStatus::Stopping, now).unwrap();
        env.transition(EnvironmentStatus::Stopped, now).unwrap();
        assert_eq!(env.stopped_at, Some(now));

        env.transition(EnvironmentStatus::Terminating, now).unwrap();
        env.transition(EnvironmentStatus::Destroyed, now).unwrap();
        assert!(env.tunnel_url.is_none());
        assert!(env.is_consistent());
    }

    #[test]
    fn fail_records_reason() {
        let mut env = sample();
        env.fail("launch throttled", Utc::now()).unwrap();
        assert_eq!(env.status, EnvironmentStatus::Failed);
        assert_eq!(env.failure_reason.as_deref(), Some("launch throttled"));
    }

    #[test]
    fn record_serializes_camel_case() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"repoFullName\":\"acme/widgets\""));
        assert!(json.contains("\"computeInstanceId\":null"));
        assert!(json.contains("\"lastActivityAt\""));
    }

    #[test]
    fn older_events_are_stale_and_never_rewind() {
        let mut env = sample();
        let t0 = Utc::now();
        assert!(!env.is_stale_event(Some(t0)));

        env.record_event(Some(t0));
        env.record_event(Some(t0 - chrono::Duration::minutes(5)));
        env.record_event(None);
        assert_eq!(env.last_event_at, Some(t0));

        assert!(env.is_stale_event(Some(t0 - chrono::Duration::seconds(1))));
        assert!(!env.is_stale_event(Some(t0)));
        assert!(!env.is_stale_event(None));
    }
}
