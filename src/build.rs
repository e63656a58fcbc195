//! Build records: one per deploy attempt of an Environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentKey;
use crate::error::Result;

/// Status of a single build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Queued behind an in-flight deploy.
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Overtaken by a newer commit or a destroy before it could matter.
    Superseded,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Superseded
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

/// Largest per-millisecond sequence number before the stamp moves on.
const MAX_SEQ: u32 = 999_999;

/// Last `(millis, seq)` handed out in this process.
static LAST_STAMP: Mutex<(i64, u32)> = Mutex::new((0, 0));

/// Next `(millis, seq)` strictly after the previous one and not before `now_ms`.
fn next_stamp(now_ms: i64) -> (i64, u32) {
    let mut last = LAST_STAMP.lock().unwrap_or_else(PoisonError::into_inner);
    let next = if now_ms > last.0 {
        (now_ms, 0)
    } else if last.1 < MAX_SEQ {
        (last.0, last.1 + 1)
    } else {
        (last.0 + 1, 0)
    };
    *last = next;
    next
}

/// Time-ordered build identifier: `build-<millis>-<seq>-<sha8>`.
///
/// Lexicographic order matches creation order within one process: the
/// stamp never repeats or goes backwards, and both fields are fixed width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn generate(commit_sha: &str, now: DateTime<Utc>) -> Self {
        let short: String = commit_sha.chars().take(8).collect();
        let (millis, seq) = next_stamp(now.timestamp_millis().max(0));
        Self(format!("build-{:013}-{:06}-{}", millis, seq, short))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One bootstrap attempt for an Environment, tied to a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub environment_id: String,
    pub build_id: BuildId,
    pub commit_sha: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Where captured bootstrap output lives.
    pub logs_ref: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub ttl: i64,
}

impl Build {
    pub fn new(
        key: &EnvironmentKey,
        commit_sha: &str,
        status: BuildStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            environment_id: key.to_string(),
            build_id: BuildId::generate(commit_sha, now),
            commit_sha: commit_sha.to_string(),
            status,
            started_at: now,
            finished_at: None,
            logs_ref: None,
            failure_reason: None,
            ttl: 0,
        }
    }

    /// Marks the build finished with a terminal status.
    pub fn finish(&mut self, status: BuildStatus, reason: Option<String>, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(now);
        if reason.is_some() {
            self.failure_reason = reason;
        }
    }
}

/// Paths to a build's captured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogs {
    pub dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl BuildLogs {
    /// Log location for a build under `logs_dir`.
    pub fn for_build(logs_dir: &Path, key: &EnvironmentKey, build_id: &BuildId) -> Self {
        let dir = logs_dir.join(key.slug()).join(build_id.as_str());
        Self {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
            dir,
        }
    }

    /// Appends a labelled section to both logs, creating them as needed.
    pub async fn append(&self, label: &str, stdout: &str, stderr: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.dir).await?;
        for (path, body) in [(&self.stdout, stdout), (&self.stderr, stderr)] {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(format!("==> {}\n", label).as_bytes()).await?;
            file.write_all(body.as_bytes()).await?;
            if !body.ends_with('\n') {
                file.write_all(b"\n").await?;
            }
        }
        Ok(())
    }

    pub fn reference(&self) -> String {
        self.dir.display().to_string()
    }
}
