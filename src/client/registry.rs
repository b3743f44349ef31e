//! Client-side subscription cache.
//!
//! Subscribers of the same stream share one reconstructed state. Connections
//! are keyed by `(stream, start offset)` and reference counted; the last
//! subscriber to leave closes its connection. When two connections for one
//! stream overlap, each message offset is applied once.
//!
//! A connection that fails or ends is reopened from the view's current count
//! with exponential backoff, until its last subscriber leaves.

use crate::client::connector::{Connector, EventStream};
use crate::core::{Result, RunStateError};
use crate::stream::{MuxEvent, apply_raw};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RECONNECT_INITIAL_BACKOFF_MS: u64 = 250;
const RECONNECT_MAX_BACKOFF_MS: u64 = 10_000;

/// Delay before reconnect attempt `attempt` (1-based)
fn reconnect_backoff(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(
        RECONNECT_INITIAL_BACKOFF_MS
            .saturating_mul(factor)
            .min(RECONNECT_MAX_BACKOFF_MS),
    )
}

/// Locally reconstructed view of one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamView {
    pub state: Value,
    /// Messages applied so far, counted from offset 0
    pub event_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub initial: Option<Value>,
    pub start_index: Option<u64>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial(mut self, state: Value) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn start_index(mut self, index: u64) -> Self {
        self.start_index = Some(index);
        self
    }
}

type ConnectionKey = (String, u64);

struct StreamEntry {
    refs: usize,
    view: Arc<watch::Sender<StreamView>>,
}

struct ConnectionEntry {
    refs: usize,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<String, StreamEntry>,
    connections: HashMap<ConnectionKey, ConnectionEntry>,
    closed: bool,
}

pub struct SubscriptionRegistry {
    connector: Arc<dyn Connector>,
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    /// Subscribe to `stream_id`.
    ///
    /// Must be called inside a tokio runtime; new connections are driven by a
    /// spawned task.
    pub fn subscribe(&self, stream_id: &str, options: SubscribeOptions) -> Result<Subscription> {
        let mut inner = self.inner.lock()?;
        if inner.closed {
            return Err(RunStateError::Closed("subscription registry".to_string()));
        }

        let stream = inner
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamEntry {
                refs: 0,
                view: Arc::new(watch::Sender::new(StreamView {
                    state: options
                        .initial
                        .clone()
                        .unwrap_or_else(|| Value::Object(Default::default())),
                    event_count: options.start_index.unwrap_or(0),
                })),
            });
        stream.refs += 1;

        // a view that has applied nothing yet adopts the joiner's snapshot
        if let Some(start) = options.start_index.filter(|start| *start > 0) {
            stream.view.send_if_modified(|view| {
                if view.event_count != 0 {
                    return false;
                }
                view.event_count = start;
                if let Some(initial) = &options.initial {
                    view.state = initial.clone();
                }
                true
            });
        }

        let view = Arc::clone(&stream.view);
        let start = view.borrow().event_count;
        let key: ConnectionKey = (stream_id.to_string(), start);

        match inner.connections.get_mut(&key) {
            Some(connection) => connection.refs += 1,
            None => {
                let cancel = CancellationToken::new();
                tokio::spawn(pump_connection(
                    Arc::clone(&self.connector),
                    stream_id.to_string(),
                    start,
                    Arc::clone(&view),
                    cancel.clone(),
                ));
                inner
                    .connections
                    .insert(key.clone(), ConnectionEntry { refs: 1, cancel });
                debug!(stream = stream_id, start, "opened connection");
            }
        }

        Ok(Subscription {
            registry: Arc::clone(&self.inner),
            stream_id: stream_id.to_string(),
            connection: key,
            rx: view.subscribe(),
        })
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.connections.len())
            .unwrap_or(0)
    }

    /// Streams with at least one subscriber
    pub fn stream_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.streams.len())
            .unwrap_or(0)
    }

    /// Close every connection and refuse new subscriptions
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.closed = true;
        for (_, connection) in inner.connections.drain() {
            connection.cancel.cancel();
        }
        inner.streams.clear();
        Ok(())
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

async fn pump_connection(
    connector: Arc<dyn Connector>,
    stream_id: String,
    start: u64,
    view: Arc<watch::Sender<StreamView>>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        // resume after whatever the shared view already holds
        let from = view.borrow().event_count.max(start);
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = connector.connect(&stream_id, from) => connected,
        };

        match connected {
            Ok(mut events) => {
                attempt = 0;
                if follow_events(&mut events, &stream_id, from, &view, &cancel).await {
                    break;
                }
            }
            Err(err) => {
                warn!(stream = %stream_id, error = %err, "stream connection failed");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = reconnect_backoff(attempt);
        debug!(stream = %stream_id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(stream = %stream_id, start, "connection closed");
}

/// Apply events until the connection ends; `true` when cancelled
async fn follow_events(
    events: &mut EventStream,
    stream_id: &str,
    from: u64,
    view: &watch::Sender<StreamView>,
    cancel: &CancellationToken,
) -> bool {
    let mut position = from;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return true,
            next = events.next() => next,
        };

        match next {
            None | Some(Ok(MuxEvent::End)) => break,
            Some(Ok(MuxEvent::Message { stream, message })) => {
                if stream.as_deref().is_some_and(|name| name != stream_id) {
                    continue;
                }
                apply_at(view, stream_id, position, &message);
                position += 1;
            }
            Some(Ok(MuxEvent::Connected | MuxEvent::KeepAlive)) => {}
            Some(Err(err)) => {
                warn!(stream = stream_id, error = %err, "stream connection dropped");
                break;
            }
        }
    }
    debug!(stream = stream_id, from, position, "stream connection ended");
    false
}

/// Apply the message at `offset` unless another connection already did
fn apply_at(view: &watch::Sender<StreamView>, stream_id: &str, offset: u64, message: &Value) {
    view.send_if_modified(|view| {
        if offset < view.event_count {
            return false;
        }
        match apply_raw(&mut view.state, message) {
            Ok(()) => {
                view.event_count = offset + 1;
                true
            }
            Err(err) => {
                warn!(stream = stream_id, offset, error = %err, "skipping bad stream message");
                false
            }
        }
    });
}

/// Handle held by one subscriber; dropping it releases the subscription
pub struct Subscription {
    registry: Arc<Mutex<RegistryInner>>,
    stream_id: String,
    connection: ConnectionKey,
    rx: watch::Receiver<StreamView>,
}

impl Subscription {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn view(&self) -> StreamView {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> Value {
        self.rx.borrow().state.clone()
    }

    pub fn event_count(&self) -> u64 {
        self.rx.borrow().event_count
    }

    /// Current state as `T`
    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.state())?)
    }

    /// Wait until the state changes
    pub async fn changed(&mut self) -> Result<StreamView> {
        self.rx
            .changed()
            .await
            .map_err(|_| RunStateError::Closed(format!("stream '{}'", self.stream_id)))?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until at least `count` messages have been applied
    pub async fn wait_for_count(&mut self, count: u64) -> Result<StreamView> {
        let view = self
            .rx
            .wait_for(|view| view.event_count >= count)
            .await
            .map_err(|_| RunStateError::Closed(format!("stream '{}'", self.stream_id)))?;
        Ok(view.clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Ok(mut inner) = self.registry.lock() else {
            return;
        };

        if let Some(connection) = inner.connections.get_mut(&self.connection) {
            connection.refs -= 1;
            if connection.refs == 0 {
                connection.cancel.cancel();
                inner.connections.remove(&self.connection);
                debug!(stream = %self.stream_id, start = self.connection.1, "closed connection");
            }
        }

        if let Some(stream) = inner.streams.get_mut(&self.stream_id) {
            stream.refs -= 1;
            if stream.refs == 0 {
                inner.streams.remove(&self.stream_id);
            }
        }
    }
}
