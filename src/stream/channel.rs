use crate::config::STREAM_STATE_NAMESPACE;
use crate::core::Result;
use crate::journal::MessageSink;
use crate::runs::RunHost;
use crate::stream::message::StreamMsg;
use serde::Serialize;
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

/// Authoritative state of one run plus the snapshot last sent to subscribers.
///
/// The channel is the only writer of its state: mutate through `&mut` and
/// call [`commit`](StateChannel::commit) to publish.
pub struct StateChannel<T> {
    state: T,
    committed: Option<Value>,
    sink: Arc<dyn MessageSink>,
    namespace: String,
}

/// Create a channel that publishes into `sink`
pub fn create_channel<T: Serialize>(sink: Arc<dyn MessageSink>, initial: T) -> StateChannel<T> {
    StateChannel {
        state: initial,
        committed: None,
        sink,
        namespace: STREAM_STATE_NAMESPACE.to_string(),
    }
}

impl<T: Serialize> StateChannel<T> {
    /// Channel backed by `run_id`'s log in the default namespace
    pub fn for_run(host: &RunHost, run_id: &str, initial: T) -> Result<Self> {
        Self::for_run_in(host, run_id, STREAM_STATE_NAMESPACE, initial)
    }

    pub fn for_run_in(host: &RunHost, run_id: &str, namespace: &str, initial: T) -> Result<Self> {
        let log = host.log(run_id, namespace)?;
        let mut channel = create_channel(Arc::new(log), initial);
        channel.namespace = namespace.to_string();
        Ok(channel)
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut T {
        &mut self.state
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of messages emitted so far; the resume cursor for readers
    pub fn offset(&self) -> u64 {
        self.sink.len()
    }

    /// Publish the current state.
    ///
    /// The first commit sends a full snapshot, later ones a patch against the
    /// last committed snapshot. Returns the offset written, or `None` when
    /// nothing changed.
    pub async fn commit(&mut self) -> Result<Option<u64>> {
        let current = serde_json::to_value(&self.state)?;

        let msg = match &self.committed {
            None => StreamMsg::replace(current.clone()),
            Some(committed) => match StreamMsg::diff(committed, &current) {
                Some(msg) => msg,
                None => return Ok(None),
            },
        };

        let offset = self.sink.append(serde_json::to_value(&msg)?).await?;
        self.committed = Some(current);

        debug!(
            namespace = %self.namespace,
            offset,
            replace = msg.is_replace(),
            "committed state"
        );
        Ok(Some(offset))
    }
}

impl<T> Deref for StateChannel<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> DerefMut for StateChannel<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state
    }
}
