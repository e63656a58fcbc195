//! In-process state store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::build::{Build, BuildId};
use crate::environment::{Environment, EnvironmentKey, EnvironmentStatus};
use crate::error::Result;

use super::StateStore;

/// State store held entirely in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    environments: RwLock<HashMap<EnvironmentKey, Environment>>,
    builds: RwLock<HashMap<String, BTreeMap<BuildId, Build>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_environment(&self, key: &EnvironmentKey) -> Result<Option<Environment>> {
        Ok(self.environments.read().await.get(key).cloned())
    }

    async fn put_environment(&self, env: &Environment) -> Result<()> {
        let mut envs = self.environments.write().await;
        let key = env.key();
        if let Some(existing) = envs.get(&key) {
            if existing.updated_at > env.updated_at {
                tracing::debug!(env = %key, "dropping stale environment write");
                return Ok(());
            }
        }
        envs.insert(key, env.clone());
        Ok(())
    }

    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>> {
        let mut matching: Vec<Environment> = self
            .environments
            .read()
            .await
            .values()
            .filter(|env| env.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(matching)
    }

    async fn append_build(&self, environment_id: &str, build: &Build) -> Result<()> {
        self.builds
            .write()
            .await
            .entry(environment_id.to_string())
            .or_default()
            .insert(build.build_id.clone(), build.clone());
        Ok(())
    }

    async fn get_latest_build(&self, environment_id: &str) -> Result<Option<Build>> {
        Ok(self
            .builds
            .read()
            .await
            .get(environment_id)
            .and_then(|builds| builds.values().next_back().cloned()))
    }

    async fn list_builds(&self, environment_id: &str) -> Result<Vec<Build>> {
        Ok(self
            .builds
            .read()
            .await
            .get(environment_id)
            .map(|builds| builds.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.timestamp();
        let mut purged = 0;

        {
            let mut envs = self.environments.write().await;
            let before = envs.len();
            envs.retain(|_, env| env.ttl == 0 || env.ttl > cutoff);
            purged += before - envs.len();
        }

        let mut builds = self.builds.write().await;
        for history in builds.values_mut() {
            let before = history.len();
            history.retain(|_, build| build.ttl == 0 || build.ttl > cutoff);
            purged += before - history.len();
        }
        builds.retain(|_, history| !history.is_empty());

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn memory_store_round_trips_environment() {
        contract::round_trips_environment(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        contract::last_write_wins_on_updated_at(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_lists_by_status() {
        contract::lists_by_status(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_latest_build_is_newest() {
        contract::latest_build_is_newest(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_purges_expired() {
        contract::purges_expired_records(&MemoryStateStore::new()).await;
    }
}
