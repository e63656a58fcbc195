//! Reporting back to the code review host.
//!
//! The orchestrator posts commit statuses and PR comments for `running`,
//! `failed` and `destroyed`; the reconciler asks whether a PR is still open.
//! [`GhCliReviewHost`] talks to GitHub through the `gh` CLI.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Commit status state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

/// Review-host operations used by the lifecycle.
#[async_trait]
pub trait ReviewHost: Send + Sync {
    /// Sets the environment's commit status on `sha`.
    async fn post_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()>;

    /// Adds a comment to a pull request.
    async fn post_comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<()>;

    async fn is_pull_request_open(&self, repo: &str, pr_number: u64) -> Result<bool>;

    /// Token for cloning private repositories, if one is available.
    async fn access_token(&self, repo: &str) -> Result<Option<String>>;
}

/// GitHub via `gh api`.
#[derive(Debug, Clone)]
pub struct GhCliReviewHost {
    gh_path: String,
    context: String,
}

impl GhCliReviewHost {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            gh_path: "gh".to_string(),
            context: context.into(),
        }
    }

    pub fn with_gh_path(mut self, gh_path: impl Into<String>) -> Self {
        self.gh_path = gh_path.into();
        self
    }

    async fn gh(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.gh_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::GitHub(format!("failed to run {}: {}", self.gh_path, e)))?;

        if !output.status.success() {
            return Err(Error::GitHub(format!(
                "gh {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Arguments for `gh api` creating a commit status.
pub(crate) fn status_args(
    repo: &str,
    sha: &str,
    state: CommitState,
    context: &str,
    description: &str,
    target_url: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "api".to_string(),
        "--method".to_string(),
        "POST".to_string(),
        format!("repos/{}/statuses/{}", repo, sha),
        "-f".to_string(),
        format!("state={}", state.as_str()),
        "-f".to_string(),
        format!("context={}", context),
        "-f".to_string(),
        // GitHub caps status descriptions at 140 characters.
        format!("description={}", description.chars().take(140).collect::<String>()),
    ];
    if let Some(url) = target_url {
        args.push("-f".to_string());
        args.push(format!("target_url={}", url));
    }
    args
}

#[async_trait]
impl ReviewHost for GhCliReviewHost {
    async fn post_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()> {
        self.gh(&status_args(repo, sha, state, &self.context, description, target_url))
            .await?;
        tracing::debug!(repo, sha, state = state.as_str(), "posted commit status");
        Ok(())
    }

    async fn post_comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<()> {
        self.gh(&[
            "api".to_string(),
            "--method".to_string(),
            "POST".to_string(),
            format!("repos/{}/issues/{}/comments", repo, pr_number),
            "-f".to_string(),
            format!("body={}", body),
        ])
        .await?;
        tracing::debug!(repo, pr = pr_number, "posted PR comment");
        Ok(())
    }

    async fn is_pull_request_open(&self, repo: &str, pr_number: u64) -> Result<bool> {
        let state = self
            .gh(&[
                "api".to_string(),
                format!("repos/{}/pulls/{}", repo, pr_number),
                "--jq".to_string(),
                ".state".to_string(),
            ])
            .await?;
        Ok(state == "open")
    }

    async fn access_token(&self, _repo: &str) -> Result<Option<String>> {
        let token = self.gh(&["auth".to_string(), "token".to_string()]).await?;
        Ok(Some(token).filter(|t| !t.is_empty()))
    }
}
