//! Thin wrapper over the `aws` CLI.
//!
//! All calls use `--output json` and return the parsed document. Failures are
//! classified so callers can decide what is worth retrying.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;

/// Failure of a single CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AwsCliError {
    /// Throttling, capacity or networking trouble.
    #[error("transient AWS error: {0}")]
    Transient(String),
    /// The referenced resource does not exist.
    #[error("AWS resource not found: {0}")]
    NotFound(String),
    /// Anything else: bad input, denied access, missing binary.
    #[error("AWS error: {0}")]
    Fatal(String),
}

const TRANSIENT_MARKERS: &[&str] = &[
    "Throttling",
    "RequestLimitExceeded",
    "InsufficientInstanceCapacity",
    "ServiceUnavailable",
    "InternalError",
    "Could not connect to the endpoint URL",
    "Connection was closed",
    "Read timeout",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidInstanceID.Malformed",
    "InvocationDoesNotExist",
    "ResourceNotFoundException",
    "ParameterNotFound",
];

/// Sorts CLI stderr into transient, not-found, or fatal.
pub fn classify_stderr(stderr: &str) -> AwsCliError {
    let message = stderr.trim().to_string();
    if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
        AwsCliError::NotFound(message)
    } else if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        AwsCliError::Transient(message)
    } else {
        AwsCliError::Fatal(message)
    }
}

/// Invoker for the `aws` binary.
#[derive(Debug, Clone)]
pub struct AwsCli {
    cli_path: String,
    region: Option<String>,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsCli {
    /// Uses `aws` from `PATH` and the ambient region.
    pub fn new() -> Self {
        Self {
            cli_path: "aws".to_string(),
            region: None,
        }
    }

    pub fn with_cli_path(mut self, cli_path: impl Into<String>) -> Self {
        self.cli_path = cli_path.into();
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region.filter(|r| !r.is_empty());
        self
    }

    /// Runs `aws <args> --output json` and parses stdout.
    ///
    /// Empty stdout (as from `terminate-instances` with `--query`) yields `Null`.
    pub async fn json<I, S>(&self, args: I) -> std::result::Result<Value, AwsCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(&args).args(["--output", "json"]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }

        tracing::debug!(cli = %self.cli_path, args = ?args, "invoking aws cli");

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AwsCliError::Fatal(format!("failed to run {}: {}", self.cli_path, e)))?;

        if !output.status.success() {
            return Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|e| AwsCliError::Fatal(format!("unparseable aws output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_throttling_as_transient() {
        let err = classify_stderr(
            "An error occurred (RequestLimitExceeded) when calling the RunInstances operation",
        );
        assert!(matches!(err, AwsCliError::Transient(_)));
    }

    #[test]
    fn classifies_missing_instance_as_not_found() {
        let err = classify_stderr(
            "An error occurred (InvalidInstanceID.NotFound) when calling the StopInstances operation",
        );
        assert!(matches!(err, AwsCliError::NotFound(_)));
    }

    #[test]
    fn classifies_denied_as_fatal() {
        let err = classify_stderr("An error occurred (UnauthorizedOperation)");
        assert!(matches!(err, AwsCliError::Fatal(_)));
    }

    #[test]
    fn empty_region_is_ignored() {
        let cli = AwsCli::new().with_region(Some(String::new()));
        assert!(cli.region.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let cli = AwsCli::new().with_cli_path("/nonexistent/aws-cli-binary");
        let err = cli.json(["ec2", "describe-instances"]).await.unwrap_err();
        assert!(matches!(err, AwsCliError::Fatal(_)));
    }
}
