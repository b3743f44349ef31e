//! Stream id to run resolution.
//!
//! A stream `<id>` is served by whichever run holds the unique tag
//! `stream:<id>`. Visibility is checked with an OR query over caller-supplied
//! tags such as `auth:public`.

use crate::config::RunStateConfig;
use crate::core::{Result, RunStateError};
use crate::runs::RunHost;
use crate::stream::{StreamSource, consume_stream_state};
use crate::tags::{TagFilter, TagIndex};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of a one-shot state read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub state: Value,
    /// Offset a live subscription should resume from
    pub start_index: u64,
}

pub struct StreamResolver {
    tags: Arc<TagIndex>,
    host: Arc<RunHost>,
    namespace: String,
    quiescence: Duration,
}

impl StreamResolver {
    pub fn new(tags: Arc<TagIndex>, host: Arc<RunHost>, config: &RunStateConfig) -> Self {
        Self {
            tags,
            host,
            namespace: config.namespace.clone(),
            quiescence: config.quiescence,
        }
    }

    pub fn tags(&self) -> &Arc<TagIndex> {
        &self.tags
    }

    pub fn host(&self) -> &Arc<RunHost> {
        &self.host
    }

    pub fn stream_tag(stream_id: &str) -> String {
        format!("stream:{stream_id}")
    }

    /// Run currently holding `stream:<id>`
    pub async fn holder(&self, stream_id: &str) -> Result<Option<String>> {
        let runs = self.tags.runs_for_tag(&Self::stream_tag(stream_id)).await?;
        Ok(runs.into_iter().next())
    }

    /// Requested ids whose holder carries at least one of `visibility`.
    ///
    /// Order is kept and repeated ids collapse.
    pub async fn visible_streams(
        &self,
        stream_ids: &[String],
        visibility: &[String],
    ) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = stream_ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .collect();

        let filter = TagFilter::new().any_of(visibility.iter().cloned());
        let checks = try_join_all(unique.iter().map(|id| {
            let filter = &filter;
            async move {
                let tag = Self::stream_tag(id);
                let runs = self.tags.list_runs_by_tag(&[tag], filter).await?;
                Ok::<_, RunStateError>(!runs.is_empty())
            }
        }))
        .await?;

        Ok(unique
            .into_iter()
            .zip(checks)
            .filter_map(|(id, visible)| visible.then(|| id.clone()))
            .collect())
    }

    /// Open a reader at `start` for every id that has a holder
    pub async fn open_readers(&self, stream_ids: &[String], start: u64) -> Result<Vec<StreamSource>> {
        let holders = try_join_all(stream_ids.iter().map(|id| self.holder(id))).await?;

        let mut sources = Vec::with_capacity(stream_ids.len());
        for (id, holder) in stream_ids.iter().zip(holders) {
            let Some(run_id) = holder else {
                debug!(stream = %id, "no run holds stream");
                continue;
            };

            match self.host.log(&run_id, &self.namespace) {
                Ok(log) => sources.push(StreamSource::named(id.clone(), log.reader(start))),
                Err(err) if err.is_not_found() => {
                    debug!(stream = %id, run_id = %run_id, "stream holder has no log");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(sources)
    }

    /// Fold the buffered backlog of `stream_id` into a snapshot.
    ///
    /// With no holder, `initial` is returned at offset 0; without `initial`
    /// that case is [`RunStateError::NotFound`].
    pub async fn get_stream_state(
        &self,
        stream_id: &str,
        initial: Option<Value>,
    ) -> Result<StreamSnapshot> {
        let mut sources = self.open_readers(&[stream_id.to_string()], 0).await?;

        let Some(source) = sources.pop() else {
            return match initial {
                Some(state) => Ok(StreamSnapshot {
                    state,
                    start_index: 0,
                }),
                None => Err(RunStateError::NotFound(format!(
                    "no run holds stream '{stream_id}'"
                ))),
            };
        };

        let mut reader = source.into_reader();
        let caught = consume_stream_state(reader.as_mut(), initial, self.quiescence).await?;
        Ok(StreamSnapshot {
            state: caught.state,
            start_index: caught.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKv;
    use crate::tags::TagOptions;
    use serde_json::json;

    fn resolver() -> StreamResolver {
        let host = Arc::new(RunHost::new());
        let tags = Arc::new(TagIndex::new(Arc::new(InMemoryKv::new()), host.clone()));
        StreamResolver::new(tags, host, &RunStateConfig::default())
    }

    #[tokio::test]
    async fn test_missing_stream_uses_initial() {
        let resolver = resolver();
        let snapshot = resolver
            .get_stream_state("nobody", Some(json!({"messages": []})))
            .await
            .unwrap();
        assert_eq!(snapshot.start_index, 0);
        assert_eq!(snapshot.state, json!({"messages": []}));

        let err = resolver.get_stream_state("nobody", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_visibility_filters_and_dedupes() {
        let resolver = resolver();
        let run = resolver.host().start_run_with_id("run-1").unwrap();
        resolver
            .tags()
            .set_tag_for_run(&run, "stream:general", None, TagOptions::unique())
            .await
            .unwrap();
        resolver.tags().add_run_to_tag("auth:private", &run).await.unwrap();

        let ids = vec!["general".to_string(), "general".to_string(), "ghost".to_string()];
        let public = resolver
            .visible_streams(&ids, &["auth:public".to_string()])
            .await
            .unwrap();
        assert!(public.is_empty());

        let signed_in = resolver
            .visible_streams(&ids, &["auth:public".to_string(), "auth:private".to_string()])
            .await
            .unwrap();
        assert_eq!(signed_in, vec!["general"]);
    }

    #[tokio::test]
    async fn test_snapshot_counts_messages() {
        let resolver = resolver();
        let run = resolver.host().start_run_with_id("run-1").unwrap();
        resolver.tags().claim_unique("stream:general", &run).await.unwrap();

        let log = resolver.host().log(&run, "stream-state").unwrap();
        log.push(json!({"type": "replace", "state": {"n": 1}})).unwrap();
        log.push(json!({"type": "patch", "patch": [{"op": "replace", "path": "/n", "value": 2}]}))
            .unwrap();
        resolver.host().complete_run(&run).unwrap();

        let snapshot = resolver.get_stream_state("general", None).await.unwrap();
        assert_eq!(snapshot, StreamSnapshot { state: json!({"n": 2}), start_index: 2 });
    }
}
