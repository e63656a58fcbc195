//! Durable record of Environment and Build state.
//!
//! This module provides the [`StateStore`] trait plus two implementations:
//! [`MemoryStateStore`] for tests and single-process use, and
//! [`FileStateStore`] which keeps one JSON document per record on disk.
//!
//! Writes are atomic per item; there are no cross-item transactions. Callers
//! re-read before mutating and treat read-then-write as best effort.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::build::{Build, BuildId};
use crate::environment::{Environment, EnvironmentKey, EnvironmentStatus};
use crate::error::Result;

/// Persistence contract for the orchestrator and reconciler.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the Environment for a repository+PR, if any.
    async fn get_environment(&self, key: &EnvironmentKey) -> Result<Option<Environment>>;

    /// Upserts an Environment. A stored record with a strictly newer
    /// `updated_at` wins and the incoming write is dropped.
    async fn put_environment(&self, env: &Environment) -> Result<()>;

    /// All Environments currently in `status`.
    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>>;

    /// Appends a Build to an Environment's history (upsert by build id).
    async fn append_build(&self, environment_id: &str, build: &Build) -> Result<()>;

    /// Newest Build of an Environment.
    async fn get_latest_build(&self, environment_id: &str) -> Result<Option<Build>>;

    /// Every Build of an Environment, oldest first.
    async fn list_builds(&self, environment_id: &str) -> Result<Vec<Build>>;

    /// Drops records whose `ttl` is at or before `now`. Returns how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Looks up one Build by id.
    async fn get_build(&self, environment_id: &str, build_id: &BuildId) -> Result<Option<Build>> {
        Ok(self
            .list_builds(environment_id)
            .await?
            .into_iter()
            .find(|b| &b.build_id == build_id))
    }

    /// Number of Environments counting against the fleet limit, excluding `except`.
    async fn count_active(&self, except: Option<&EnvironmentKey>) -> Result<usize> {
        let mut count = 0;
        for status in EnvironmentStatus::ALL.iter().filter(|s| s.holds_capacity()) {
            count += self
                .list_by_status(*status)
                .await?
                .iter()
                .filter(|env| except.map_or(true, |k| &env.key() != k))
                .count();
        }
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every [`StateStore`] implementation must share.

    use super::*;
    use crate::build::BuildStatus;
    use crate::testing::deploy_request;
    use chrono::Duration;

    pub async fn round_trips_environment(store: &dyn StateStore) {
        let env = Environment::from_request(&deploy_request("acme/widgets", 42, "abc123"), Utc::now());
        store.put_environment(&env).await.unwrap();

        let loaded = store.get_environment(&env.key()).await.unwrap();
        assert_eq!(loaded, Some(env));
        assert!(store
            .get_environment(&EnvironmentKey::new("acme/widgets", 43))
            .await
            .unwrap()
            .is_none());
    }

    pub async fn last_write_wins_on_updated_at(store: &dyn StateStore) {
        let now = Utc::now();
        let mut newer = Environment::from_request(&deploy_request("acme/widgets", 1, "new"), now);
        newer.status = EnvironmentStatus::Failed;
        store.put_environment(&newer).await.unwrap();

        let mut stale = newer.clone();
        stale.commit_sha = "old".into();
        stale.updated_at = now - Duration::seconds(10);
        store.put_environment(&stale).await.unwrap();

        let loaded = store.get_environment(&newer.key()).await.unwrap().unwrap();
        assert_eq!(loaded.commit_sha, "new");
    }

    pub async fn lists_by_status(store: &dyn StateStore) {
        let now = Utc::now();
        for (pr, status) in [
            (1, EnvironmentStatus::Running),
            (2, EnvironmentStatus::Running),
            (3, EnvironmentStatus::Stopped),
        ] {
            let mut env = Environment::from_request(&deploy_request("acme/widgets", pr, "sha"), now);
            env.status = status;
            env.compute_instance_id = Some(format!("i-{}", pr));
            store.put_environment(&env).await.unwrap();
        }

        assert_eq!(store.list_by_status(EnvironmentStatus::Running).await.unwrap().len(), 2);
        assert_eq!(store.list_by_status(EnvironmentStatus::Stopped).await.unwrap().len(), 1);
        assert_eq!(store.count_active(None).await.unwrap(), 2);
        assert_eq!(
            store
                .count_active(Some(&EnvironmentKey::new("acme/widgets", 1)))
                .await
                .unwrap(),
            1
        );
    }

    pub async fn latest_build_is_newest(store: &dyn StateStore) {
        let key = EnvironmentKey::new("acme/widgets", 9);
        let t0 = Utc::now();
        let first = Build::new(&key, "aaa", BuildStatus::Succeeded, t0);
        let second = Build::new(&key, "bbb", BuildStatus::Running, t0 + Duration::seconds(1));
        store.append_build(&key.to_string(), &second).await.unwrap();
        store.append_build(&key.to_string(), &first).await.unwrap();

        let latest = store.get_latest_build(&key.to_string()).await.unwrap().unwrap();
        assert_eq!(latest.commit_sha, "bbb");

        let mut updated = latest.clone();
        updated.finish(BuildStatus::Succeeded, None, Utc::now());
        store.append_build(&key.to_string(), &updated).await.unwrap();

        let builds = store.list_builds(&key.to_string()).await.unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].commit_sha, "aaa");
        assert_eq!(builds[1].status, BuildStatus::Succeeded);
        assert_eq!(
            store
                .get_build(&key.to_string(), &second.build_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            BuildStatus::Succeeded
        );
    }

    pub async fn purges_expired_records(store: &dyn StateStore) {
        let now = Utc::now();
        let mut expired = Environment::from_request(&deploy_request("acme/old", 1, "sha"), now);
        expired.ttl = (now - Duration::hours(1)).timestamp();
        let mut fresh = Environment::from_request(&deploy_request("acme/new", 1, "sha"), now);
        fresh.ttl = (now + Duration::hours(1)).timestamp();
        store.put_environment(&expired).await.unwrap();
        store.put_environment(&fresh).await.unwrap();

        let mut old_build = Build::new(&expired.key(), "sha", BuildStatus::Failed, now);
        old_build.ttl = expired.ttl;
        store.append_build(&expired.id(), &old_build).await.unwrap();

        let purged = store.purge_expired(now).await.unwrap();
        assert_eq!(purged, 2);
        assert!(store.get_environment(&expired.key()).await.unwrap().is_none());
        assert!(store.get_environment(&fresh.key()).await.unwrap().is_some());
        assert!(store.get_latest_build(&expired.id()).await.unwrap().is_none());
    }
}
