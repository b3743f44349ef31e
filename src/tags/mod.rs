//! Tag index over runs.
//!
//! Persisted layout, relative to the configured prefix:
//! - `tag:<name>`        ordered list of run ids
//! - `tag:<name>:values` hash of run id to scalar value

pub mod query;

pub use query::{TagFilter, combine_run_lists};

use crate::config::DEFAULT_KEY_PREFIX;
use crate::core::{Result, RunStateError};
use crate::runs::{RunLiveness, RunStatus};
use crate::storage::KvBackend;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Options for [`TagIndex::set_tag_for_run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagOptions {
    /// Claim the tag exclusively for the run
    pub unique: bool,
}

impl TagOptions {
    pub fn unique() -> Self {
        Self { unique: true }
    }
}

pub struct TagIndex {
    backend: Arc<dyn KvBackend>,
    liveness: Arc<dyn RunLiveness>,
    prefix: String,
    /// Treat holders whose liveness lookup fails as orphaned
    reclaim_on_liveness_error: bool,
    /// Per-tag locks serializing claims inside this process
    claim_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TagIndex {
    pub fn new(backend: Arc<dyn KvBackend>, liveness: Arc<dyn RunLiveness>) -> Self {
        Self {
            backend,
            liveness,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            reclaim_on_liveness_error: true,
            claim_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set the key prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Whether a failed liveness lookup lets a claim reclaim the tag
    pub fn reclaim_on_liveness_error(mut self, reclaim: bool) -> Self {
        self.reclaim_on_liveness_error = reclaim;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn list_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.prefix, tag)
    }

    fn values_key(&self, tag: &str) -> String {
        format!("{}:values", self.list_key(tag))
    }

    /// Runs holding a single tag, in insertion order
    pub async fn runs_for_tag(&self, tag: &str) -> Result<Vec<String>> {
        self.backend.lrange(&self.list_key(tag), 0, -1).await
    }

    /// Make a run discoverable under `tag`; repeated calls are no-ops
    pub async fn add_run_to_tag(&self, tag: &str, run_id: &str) -> Result<()> {
        let added = self
            .backend
            .rpush_if_absent(&self.list_key(tag), run_id)
            .await?;
        if added {
            debug!(tag, run_id, "tagged run");
        }
        Ok(())
    }

    pub async fn remove_runs_from_tag(&self, tag: &str, run_ids: &[String]) -> Result<()> {
        if run_ids.is_empty() {
            return Ok(());
        }

        let key = self.list_key(tag);
        for run_id in run_ids {
            self.backend.lrem(&key, 0, run_id).await?;
        }
        debug!(tag, removed = run_ids.len(), "removed runs from tag");
        Ok(())
    }

    pub async fn set_tag_value(&self, tag: &str, run_id: &str, value: &str) -> Result<()> {
        self.backend
            .hset(&self.values_key(tag), run_id, value)
            .await?;
        Ok(())
    }

    pub async fn remove_tag_values(&self, tag: &str, run_ids: &[String]) -> Result<()> {
        if run_ids.is_empty() {
            return Ok(());
        }
        self.backend.hdel(&self.values_key(tag), run_ids).await?;
        Ok(())
    }

    /// Value stored for `(tag, run_id)`
    pub async fn get_tag(&self, run_id: &str, tag: &str) -> Result<Option<String>> {
        self.backend.hget(&self.values_key(tag), run_id).await
    }

    /// Full backend keys matching `pattern`; the prefix is added here
    pub async fn get_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.backend.keys(&format!("{}{}", self.prefix, pattern)).await
    }

    /// Tag names matching `pattern`, without prefix and without the value
    /// hashes that sit next to each list
    pub async fn tag_names(&self, pattern: &str) -> Result<Vec<String>> {
        let list_prefix = format!("{}tag:", self.prefix);
        let names: Vec<String> = self
            .get_keys(&format!("tag:{pattern}"))
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&list_prefix).map(str::to_string))
            .collect();

        let all: HashSet<&str> = names.iter().map(String::as_str).collect();
        Ok(names
            .iter()
            .filter(|name| {
                name.strip_suffix(":values")
                    .is_none_or(|base| !all.contains(base))
            })
            .cloned()
            .collect())
    }

    /// Runs carrying every tag in `tags`, narrowed by `filter`.
    ///
    /// An empty `tags` slice matches nothing. An OR clause that is empty after
    /// dropping blank tag names does not filter.
    pub async fn list_runs_by_tag<S>(&self, tags: &[S], filter: &TagFilter) -> Result<Vec<String>>
    where
        S: AsRef<str>,
    {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let required = try_join_all(tags.iter().map(|tag| self.runs_for_tag(tag.as_ref()))).await?;

        let any_of_tags = filter.effective_any_of();
        let any_of = if any_of_tags.is_empty() {
            None
        } else {
            Some(try_join_all(any_of_tags.iter().map(|tag| self.runs_for_tag(tag))).await?)
        };

        let none_of_tags = filter.effective_none_of();
        let none_of = try_join_all(none_of_tags.iter().map(|tag| self.runs_for_tag(tag))).await?;

        Ok(combine_run_lists(&required, any_of.as_deref(), &none_of))
    }

    /// Claim `tag` exclusively for `run_id`.
    ///
    /// Holders that are completed, failed or unknown are removed together
    /// with their values. Any active holder other than `run_id` rejects the
    /// claim with [`RunStateError::AlreadyOwned`]; orphans are still cleaned
    /// up in that case.
    pub async fn claim_unique(&self, tag: &str, run_id: &str) -> Result<()> {
        let lock = self.claim_lock(tag)?;
        let outcome = {
            let _guard = lock.lock().await;
            self.claim_locked(tag, run_id).await
        };
        self.release_claim_lock(tag, lock)?;
        outcome
    }

    async fn claim_locked(&self, tag: &str, run_id: &str) -> Result<()> {
        let holders = self.runs_for_tag(tag).await?;

        let mut orphaned = Vec::new();
        let mut live_holder: Option<String> = None;

        for holder in holders {
            if holder == run_id {
                continue;
            }

            match self.liveness.status(&holder).await {
                Ok(RunStatus::Active) => {
                    live_holder.get_or_insert(holder);
                }
                Ok(status) => {
                    debug!(tag, holder = %holder, ?status, "orphaned tag holder");
                    orphaned.push(holder);
                }
                Err(err) if self.reclaim_on_liveness_error => {
                    warn!(tag, holder = %holder, error = %err, "liveness check failed, reclaiming");
                    orphaned.push(holder);
                }
                Err(err) => {
                    warn!(tag, holder = %holder, error = %err, "liveness check failed, keeping holder");
                    live_holder.get_or_insert(holder);
                }
            }
        }

        if !orphaned.is_empty() {
            self.remove_runs_from_tag(tag, &orphaned).await?;
            self.remove_tag_values(tag, &orphaned).await?;
        }

        if let Some(holder) = live_holder {
            debug!(tag, run_id, holder = %holder, "unique claim rejected");
            return Err(RunStateError::AlreadyOwned {
                tag: tag.to_string(),
                holder,
            });
        }

        self.backend
            .rpush_if_absent(&self.list_key(tag), run_id)
            .await?;
        info!(tag, run_id, "claimed unique tag");
        Ok(())
    }

    fn claim_lock(&self, tag: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.claim_locks.lock()?;
        Ok(Arc::clone(locks.entry(tag.to_string()).or_default()))
    }

    fn release_claim_lock(&self, tag: &str, lock: Arc<tokio::sync::Mutex<()>>) -> Result<()> {
        let mut locks = self.claim_locks.lock()?;
        // the map and `lock` are the only owners left
        if Arc::strong_count(&lock) == 2 {
            locks.remove(tag);
        }
        Ok(())
    }

    /// Tag a run, optionally claiming the tag exclusively and storing a value
    pub async fn set_tag_for_run(
        &self,
        run_id: &str,
        tag: &str,
        value: Option<&str>,
        options: TagOptions,
    ) -> Result<()> {
        if options.unique {
            self.claim_unique(tag, run_id).await?;
        } else {
            self.add_run_to_tag(tag, run_id).await?;
        }

        if let Some(value) = value {
            self.set_tag_value(tag, run_id, value).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunHost;
    use crate::storage::InMemoryKv;
    use async_trait::async_trait;

    fn index() -> (TagIndex, Arc<RunHost>) {
        let host = Arc::new(RunHost::new());
        let tags = TagIndex::new(Arc::new(InMemoryKv::new()), host.clone());
        (tags, host)
    }

    struct BrokenLiveness;

    #[async_trait]
    impl RunLiveness for BrokenLiveness {
        async fn status(&self, _run_id: &str) -> Result<RunStatus> {
            Err(RunStateError::Backend("status service down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (tags, _) = index();
        tags.add_run_to_tag("channel", "run-1").await.unwrap();
        tags.add_run_to_tag("channel", "run-1").await.unwrap();
        assert_eq!(tags.runs_for_tag("channel").await.unwrap(), vec!["run-1"]);
    }

    #[tokio::test]
    async fn test_claim_by_current_holder_is_noop() {
        let (tags, host) = index();
        host.start_run_with_id("run-1").unwrap();
        tags.claim_unique("stream:a", "run-1").await.unwrap();
        tags.claim_unique("stream:a", "run-1").await.unwrap();
        assert_eq!(tags.runs_for_tag("stream:a").await.unwrap(), vec!["run-1"]);
    }

    #[tokio::test]
    async fn test_liveness_error_reclaims_by_default() {
        let kv: Arc<dyn KvBackend> = Arc::new(InMemoryKv::new());
        let tags = TagIndex::new(kv, Arc::new(BrokenLiveness));
        tags.add_run_to_tag("stream:a", "run-old").await.unwrap();

        tags.claim_unique("stream:a", "run-new").await.unwrap();
        assert_eq!(tags.runs_for_tag("stream:a").await.unwrap(), vec!["run-new"]);
    }

    #[tokio::test]
    async fn test_liveness_error_can_block_reclaim() {
        let kv: Arc<dyn KvBackend> = Arc::new(InMemoryKv::new());
        let tags = TagIndex::new(kv, Arc::new(BrokenLiveness)).reclaim_on_liveness_error(false);
        tags.add_run_to_tag("stream:a", "run-old").await.unwrap();

        let err = tags.claim_unique("stream:a", "run-new").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(tags.runs_for_tag("stream:a").await.unwrap(), vec!["run-old"]);
    }

    #[tokio::test]
    async fn test_claim_locks_are_released() {
        let (tags, host) = index();
        host.start_run_with_id("run-1").unwrap();
        tags.claim_unique("stream:a", "run-1").await.unwrap();
        assert!(tags.claim_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tag_names_skip_value_hashes() {
        let (tags, _) = index();
        tags.set_tag_for_run("run-1", "stream:general", Some("general"), TagOptions::default())
            .await
            .unwrap();
        tags.add_run_to_tag("stream:random", "run-2").await.unwrap();

        assert_eq!(
            tags.tag_names("stream:*").await.unwrap(),
            vec!["stream:general", "stream:random"]
        );
    }

    #[tokio::test]
    async fn test_custom_prefix_layout() {
        let kv = Arc::new(InMemoryKv::new());
        let tags = TagIndex::new(kv.clone(), Arc::new(RunHost::new())).with_prefix("workflow-v4");
        tags.set_tag_for_run("run-1", "name", Some("general"), TagOptions::default())
            .await
            .unwrap();

        assert_eq!(
            kv.keys("*").await.unwrap(),
            vec!["workflow-v4tag:name", "workflow-v4tag:name:values"]
        );
    }
}
