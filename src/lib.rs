// ============================================================================
// runstate Library
// ============================================================================

pub mod client;
pub mod config;
pub mod core;
pub mod journal;
pub mod resolver;
pub mod runs;
pub mod storage;
pub mod stream;
pub mod tags;
pub mod web;

// Re-export main types for convenience
pub use config::RunStateConfig;
pub use core::{Result, RunStateError};
pub use journal::{MessageReader, MessageSink, OutputLog, ReadStep};
pub use resolver::{StreamResolver, StreamSnapshot};
pub use runs::{RunHost, RunLiveness, RunStatus};
pub use storage::{InMemoryKv, KvBackend};
pub use stream::{CatchUp, MuxEvent, StateChannel, StreamMsg, create_channel, mux_events};
pub use tags::{TagFilter, TagIndex, TagOptions};

use serde::Serialize;
use std::sync::Arc;

// ============================================================================
// Wiring
// ============================================================================

/// Everything one process needs, wired together
///
/// # Examples
///
/// ```
/// use runstate::{RunState, RunStateConfig, TagOptions};
///
/// # #[tokio::main]
/// # async fn main() -> runstate::Result<()> {
/// let rs = RunState::in_memory(RunStateConfig::default())?;
/// let run = rs.host().start_run()?;
///
/// rs.tags()
///     .set_tag_for_run(&run, "stream:general", None, TagOptions::unique())
///     .await?;
///
/// let mut room = rs.channel(&run, serde_json::json!({"messages": []}))?;
/// room.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct RunState {
    config: RunStateConfig,
    host: Arc<RunHost>,
    tags: Arc<TagIndex>,
    resolver: Arc<StreamResolver>,
}

impl RunState {
    /// Wire against an existing backend
    pub fn new(config: RunStateConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate()?;

        let host = Arc::new(RunHost::new());
        let tags = Arc::new(TagIndex::new(backend, host.clone()).with_prefix(&config.key_prefix));
        let resolver = Arc::new(StreamResolver::new(tags.clone(), host.clone(), &config));

        Ok(Self {
            config,
            host,
            tags,
            resolver,
        })
    }

    /// Wire against a fresh in-memory backend
    pub fn in_memory(config: RunStateConfig) -> Result<Self> {
        Self::new(config, Arc::new(InMemoryKv::new()))
    }

    pub fn config(&self) -> &RunStateConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<RunHost> {
        &self.host
    }

    pub fn tags(&self) -> &Arc<TagIndex> {
        &self.tags
    }

    pub fn resolver(&self) -> &Arc<StreamResolver> {
        &self.resolver
    }

    /// State channel on `run_id`'s log in the configured namespace
    pub fn channel<T: Serialize>(&self, run_id: &str, initial: T) -> Result<StateChannel<T>> {
        StateChannel::for_run_in(&self.host, run_id, &self.config.namespace, initial)
    }

    /// Connector for subscribers in the same process
    pub fn local_connector(&self) -> client::LocalConnector {
        client::LocalConnector::new(self.resolver.clone(), (&self.config).into())
    }

    /// HTTP router serving this instance
    pub fn router(&self) -> axum::Router {
        web::router(web::AppState::new(
            self.resolver.clone(),
            (&self.config).into(),
        ))
    }
}
