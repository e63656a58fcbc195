//! Error types for the environment lifecycle orchestrator.

use std::time::Duration;

use thiserror::Error;

use crate::bootstrap::BootstrapStep;
use crate::environment::EnvironmentStatus;

/// Stage of a deploy that a failure is attributed to.
///
/// Used to tell the PR author *where* a deploy broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Capacity,
    Provisioning,
    Bootstrap,
    Tunnel,
    Timeout,
    Internal,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Capacity => "capacity",
            FailureStage::Provisioning => "provisioning",
            FailureStage::Bootstrap => "bootstrap",
            FailureStage::Tunnel => "tunnel",
            FailureStage::Timeout => "timeout",
            FailureStage::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Fleet limit reached; the request is rejected, not queued.
    #[error("fleet limit reached: {active} of {limit} environments active")]
    Capacity { active: usize, limit: usize },

    /// Compute control-plane failure after retries were exhausted.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Instance never became ready for remote commands.
    #[error("instance {instance_id} not ready after {}s", timeout.as_secs())]
    ReadinessTimeout {
        instance_id: String,
        timeout: Duration,
    },

    /// A bootstrap step exited non-zero.
    #[error("bootstrap step '{step}' exited with code {exit_code}")]
    Bootstrap {
        step: BootstrapStep,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// No public hostname was reported by the tunnel process in time.
    #[error("tunnel hostname not observed within {}s", .0.as_secs())]
    TunnelTimeout(Duration),

    /// The whole request exceeded its execution budget.
    #[error("request exceeded overall timeout of {}s", .0.as_secs())]
    RequestTimeout(Duration),

    /// State store read or write failed.
    #[error("state store error: {0}")]
    Store(String),

    /// Remote command channel failure (not a non-zero exit).
    #[error("remote command error: {0}")]
    Command(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Review host (GitHub) operation failed.
    #[error("GitHub operation failed: {0}")]
    GitHub(String),

    /// Attempted a state change the lifecycle does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: EnvironmentStatus,
        to: EnvironmentStatus,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classifies the error into the deploy stage it interrupted.
    pub fn stage(&self) -> FailureStage {
        match self {
            Error::Capacity { .. } => FailureStage::Capacity,
            Error::Provisioning(_) | Error::ReadinessTimeout { .. } => FailureStage::Provisioning,
            Error::Bootstrap { .. } | Error::Command(_) => FailureStage::Bootstrap,
            Error::TunnelTimeout(_) => FailureStage::Tunnel,
            Error::RequestTimeout(_) => FailureStage::Timeout,
            _ => FailureStage::Internal,
        }
    }

    /// Short, single-line reason suitable for a commit status description.
    pub fn short_reason(&self) -> String {
        let mut reason = self.to_string();
        if reason.len() > 100 {
            let mut cut = 100;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        reason
    }
}

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_classifies_taxonomy() {
        assert_eq!(
            Error::Capacity { active: 3, limit: 3 }.stage(),
            FailureStage::Capacity
        );
        assert_eq!(
            Error::Provisioning("throttled".into()).stage(),
            FailureStage::Provisioning
        );
        assert_eq!(
            Error::TunnelTimeout(Duration::from_secs(30)).stage(),
            FailureStage::Tunnel
        );
        assert_eq!(
            Error::Bootstrap {
                step: BootstrapStep::ComposeUp,
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom".into(),
            }
            .stage(),
            FailureStage::Bootstrap
        );
        assert_eq!(Error::Store("x".into()).stage(), FailureStage::Internal);
    }

    #[test]
    fn short_reason_is_bounded() {
        let err = Error::Provisioning("x".repeat(500));
        assert!(err.short_reason().len() <= 100);
    }

    #[test]
    fn tunnel_timeout_message_includes_seconds() {
        let err = Error::TunnelTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "tunnel hostname not observed within 30s");
    }
}
