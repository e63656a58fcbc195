//! Command channel over AWS Systems Manager `AWS-RunShellScript`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::aws::{AwsCli, AwsCliError};
use crate::error::{Error, Result};

use super::{CommandChannel, CommandOutput, InvocationStatus, EXIT_ABORTED};

/// Sends scripts through `ssm send-command` and polls
/// `ssm get-command-invocation`.
#[derive(Debug, Clone)]
pub struct SsmCommandChannel {
    cli: AwsCli,
}

impl SsmCommandChannel {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

/// Maps a `get-command-invocation` document to a status.
pub(crate) fn parse_invocation(doc: &Value) -> Option<InvocationStatus> {
    let status = doc["Status"].as_str()?;
    let stdout = doc["StandardOutputContent"].as_str().unwrap_or_default().to_string();
    let stderr = doc["StandardErrorContent"].as_str().unwrap_or_default().to_string();
    let response_code = doc["ResponseCode"].as_i64().map(|c| c as i32);

    let finished = |exit_code: i32| {
        Some(InvocationStatus::Finished(CommandOutput {
            exit_code,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
        }))
    };

    match status {
        "Pending" | "InProgress" | "Delayed" => Some(InvocationStatus::InProgress),
        "Success" => finished(response_code.unwrap_or(0)),
        "Failed" => finished(response_code.filter(|c| *c != 0).unwrap_or(1)),
        "Cancelled" | "Cancelling" | "TimedOut" => finished(EXIT_ABORTED),
        other => {
            tracing::warn!(status = other, "unknown command invocation status");
            None
        }
    }
}

#[async_trait]
impl CommandChannel for SsmCommandChannel {
    async fn send(&self, instance_id: &str, script: &str, timeout: Duration) -> Result<String> {
        let secs = timeout.as_secs().max(30).to_string();
        let parameters = json!({
            "commands": [script],
            "executionTimeout": [secs],
        })
        .to_string();
        let doc = self
            .cli
            .json([
                "ssm",
                "send-command",
                "--instance-ids",
                instance_id,
                "--document-name",
                "AWS-RunShellScript",
                "--timeout-seconds",
                "600",
                "--parameters",
                parameters.as_str(),
            ])
            .await
            .map_err(|e| Error::Command(format!("send-command to {} failed: {}", instance_id, e)))?;

        doc["Command"]["CommandId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Command("send-command returned no command id".into()))
    }

    async fn invocation(
        &self,
        instance_id: &str,
        command_id: &str,
    ) -> Result<Option<InvocationStatus>> {
        match self
            .cli
            .json([
                "ssm",
                "get-command-invocation",
                "--command-id",
                command_id,
                "--instance-id",
                instance_id,
            ])
            .await
        {
            Ok(doc) => Ok(parse_invocation(&doc)),
            // Invocations become visible a moment after send-command returns.
            Err(AwsCliError::NotFound(_)) => Ok(None),
            Err(AwsCliError::Transient(msg)) => {
                tracing::debug!(command_id, error = %msg, "invocation poll failed, retrying");
                Ok(None)
            }
            Err(e) => Err(Error::Command(format!(
                "get-command-invocation {} failed: {}",
                command_id, e
            ))),
        }
    }
}
