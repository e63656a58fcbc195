//! State store backed by JSON documents on disk.
//!
//! Layout under the root directory:
//!
//! ```text
//! environments/<encoded repo#pr>.json
//! builds/<encoded repo#pr>/<build id>.json
//! ```
//!
//! Each document is written to a temporary file and renamed into place, so a
//! reader never observes a half-written record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::build::{Build, BuildId};
use crate::environment::{Environment, EnvironmentKey, EnvironmentStatus};
use crate::error::{Error, Result};

use super::StateStore;

/// Durable store keeping one JSON file per record.
pub struct FileStateStore {
    root: PathBuf,
    /// Serializes compare-and-write of environment documents.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("environments")).await?;
        tokio::fs::create_dir_all(root.join("builds")).await?;
        tracing::debug!(root = ?root, "opened file state store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn environment_path(&self, key: &EnvironmentKey) -> PathBuf {
        self.root
            .join("environments")
            .join(format!("{}.json", encode_component(&key.to_string())))
    }

    fn builds_dir(&self, environment_id: &str) -> PathBuf {
        self.root.join("builds").join(encode_component(environment_id))
    }

    fn build_path(&self, environment_id: &str, build_id: &BuildId) -> PathBuf {
        self.builds_dir(environment_id)
            .join(format!("{}.json", encode_component(build_id.as_str())))
    }

    async fn read_all_environments(&self) -> Result<Vec<Environment>> {
        read_documents(&self.root.join("environments")).await
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9._-]` so keys map to
/// distinct, portable file names.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let dir = path
        .parent()
        .ok_or_else(|| Error::Store(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Store(format!("corrupt record {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads every `*.json` document in `dir`, skipping temp files.
async fn read_documents<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_json = path.extension().map_or(false, |ext| ext == "json");
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if is_json && !is_temp {
            paths.push(path);
        }
    }
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(doc) = read_document(&path).await? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_environment(&self, key: &EnvironmentKey) -> Result<Option<Environment>> {
        read_document(&self.environment_path(key)).await
    }

    async fn put_environment(&self, env: &Environment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.environment_path(&env.key());

        if let Some(existing) = read_document::<Environment>(&path).await? {
            if existing.updated_at > env.updated_at {
                tracing::debug!(env = %env.id(), "dropping stale environment write");
                return Ok(());
            }
        }
        write_atomic(&path, env).await
    }

    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>> {
        Ok(self
            .read_all_environments()
            .await?
            .into_iter()
            .filter(|env| env.status == status)
            .collect())
    }

    async fn append_build(&self, environment_id: &str, build: &Build) -> Result<()> {
        write_atomic(&self.build_path(environment_id, &build.build_id), build).await
    }

    async fn get_latest_build(&self, environment_id: &str) -> Result<Option<Build>> {
        Ok(self.list_builds(environment_id).await?.pop())
    }

    async fn list_builds(&self, environment_id: &str) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = read_documents(&self.builds_dir(environment_id)).await?;
        builds.sort_by(|a, b| a.build_id.cmp(&b.build_id));
        Ok(builds)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.timestamp();
        let _guard = self.write_lock.lock().await;
        let mut purged = 0;

        for env in self.read_all_environments().await? {
            if env.ttl != 0 && env.ttl <= cutoff {
                tokio::fs::remove_file(self.environment_path(&env.key())).await?;
                purged += 1;
            }
        }

        let mut dirs = tokio::fs::read_dir(self.root.join("builds")).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            for build in read_documents::<Build>(&dir.path()).await? {
                if build.ttl != 0 && build.ttl <= cutoff {
                    let path = dir
                        .path()
                        .join(format!("{}.json", encode_component(build.build_id.as_str())));
                    tokio::fs::remove_file(path).await?;
                    purged += 1;
                }
            }
        }

        Ok(purged)
    }
}
