//! Inbound lifecycle request messages.
//!
//! These arrive from the webhook relay, either one message per invocation or
//! wrapped in a queue batch envelope (`{"Records": [{"body": "..."}]}`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentKey;
use crate::error::{Error, Result};

/// What the request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Deploy,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    pub full_name: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRef {
    pub number: u64,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A deploy or destroy request for one repository+PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRequest {
    pub action: LifecycleAction,
    pub repository: RepositoryRef,
    pub pull_request: PullRequestRef,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LifecycleRequest {
    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey::new(self.repository.full_name.clone(), self.pull_request.number)
    }

    /// Rejects requests the orchestrator cannot act on.
    pub fn validate(&self) -> Result<()> {
        if !self.repository.full_name.contains('/') {
            return Err(Error::Config(format!(
                "repository '{}' is not owner/name",
                self.repository.full_name
            )));
        }
        if self.action == LifecycleAction::Deploy {
            if self.pull_request.branch.trim().is_empty() {
                return Err(Error::Config("deploy request missing branch".into()));
            }
            if self.pull_request.sha.trim().is_empty() {
                return Err(Error::Config("deploy request missing commit sha".into()));
            }
            if self.repository.clone_url.trim().is_empty() {
                return Err(Error::Config("deploy request missing clone URL".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    #[serde(rename = "Records")]
    records: Vec<BatchRecord>,
}

#[derive(Debug, Deserialize)]
struct BatchRecord {
    body: String,
}

/// Parses a single message, a JSON array of messages, or a batch envelope.
pub fn parse_requests(input: &str) -> Result<Vec<LifecycleRequest>> {
    let value: serde_json::Value = serde_json::from_str(input)?;

    if value.get("Records").is_some() {
        let envelope: BatchEnvelope = serde_json::from_value(value)?;
        return envelope
            .records
            .iter()
            .map(|r| serde_json::from_str(&r.body).map_err(Error::from))
            .collect();
    }

    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }

    Ok(vec![serde_json::from_value(value)?])
}
