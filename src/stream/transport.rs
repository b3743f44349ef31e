//! Many named state streams over one push connection.
//!
//! Each round takes at most one buffered message from every open stream, so a
//! busy stream never waits on a quiet one. When no stream has anything
//! buffered the pump sleeps until any of them becomes ready. A stream that
//! reports end-of-data or fails is dropped on its own; the connection stays
//! up until it is cancelled or the receiving side goes away.

use crate::config::RunStateConfig;
use crate::core::{Result, RunStateError};
use crate::journal::{MessageReader, ReadStep};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Events delivered to a connected client
#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    Connected,
    Message {
        /// `None` for the unnamed single-stream form
        stream: Option<String>,
        message: Value,
    },
    KeepAlive,
    End,
}

impl MuxEvent {
    /// Server-Sent Events encoding
    pub fn to_sse_frame(&self) -> String {
        match self {
            MuxEvent::Connected => "event: connected\ndata: {}\n\n".to_string(),
            MuxEvent::Message {
                stream: Some(name),
                message,
            } => format!("event: {name}\ndata: {message}\n\n"),
            MuxEvent::Message {
                stream: None,
                message,
            } => format!("data: {message}\n\n"),
            MuxEvent::KeepAlive => ": keepalive\n\n".to_string(),
            MuxEvent::End => "event: end\ndata: {}\n\n".to_string(),
        }
    }
}

/// A reader plus the name its messages are tagged with
pub struct StreamSource {
    name: Option<String>,
    reader: Box<dyn MessageReader>,
}

impl StreamSource {
    pub fn named(name: impl Into<String>, reader: impl MessageReader + 'static) -> Self {
        Self {
            name: Some(name.into()),
            reader: Box::new(reader),
        }
    }

    pub fn unnamed(reader: impl MessageReader + 'static) -> Self {
        Self {
            name: None,
            reader: Box::new(reader),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn into_reader(self) -> Box<dyn MessageReader> {
        self.reader
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.reader.name().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxOptions {
    pub keepalive_interval: Duration,
    /// Capacity of the event channel
    pub buffer: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self::from(&RunStateConfig::default())
    }
}

impl From<&RunStateConfig> for MuxOptions {
    fn from(config: &RunStateConfig) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval,
            buffer: config.mux_buffer,
        }
    }
}

/// Start pumping `sources` into a new channel.
///
/// The first event is always [`MuxEvent::Connected`]. Cancelling `cancel`
/// sends [`MuxEvent::End`] and closes the channel.
pub fn spawn_mux(
    sources: Vec<StreamSource>,
    cancel: CancellationToken,
    options: MuxOptions,
) -> mpsc::Receiver<MuxEvent> {
    let (tx, rx) = mpsc::channel(options.buffer.max(1));
    tokio::spawn(run_mux(sources, cancel, options, tx));
    rx
}

async fn run_mux(
    mut sources: Vec<StreamSource>,
    cancel: CancellationToken,
    options: MuxOptions,
    tx: mpsc::Sender<MuxEvent>,
) {
    if tx.send(MuxEvent::Connected).await.is_err() {
        return;
    }
    debug!(streams = sources.len(), "mux connected");

    let period = options.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !cancel.is_cancelled() {
        // one round: at most one buffered message from every open stream
        let mut delivered = false;
        let mut open = Vec::with_capacity(sources.len());
        for mut source in sources.drain(..) {
            match source.reader.try_next() {
                Ok(ReadStep::Message(message)) => {
                    let event = MuxEvent::Message {
                        stream: source.name.clone(),
                        message,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    delivered = true;
                    open.push(source);
                }
                Ok(ReadStep::CaughtUp) => open.push(source),
                Ok(ReadStep::Finished) => {
                    debug!(stream = %source.label(), "stream has no more data");
                }
                Err(err) => {
                    warn!(stream = %source.label(), error = %err, "dropping failed stream");
                }
            }
        }
        sources = open;
        if delivered {
            continue;
        }

        let woken = {
            let mut waiting: FuturesUnordered<_> = sources
                .iter_mut()
                .enumerate()
                .map(|(index, source)| async move { (index, source.reader.ready().await) })
                .collect();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = tx.closed() => break None,
                    Some(woken) = waiting.next(), if !waiting.is_empty() => break Some(woken),
                    _ = keepalive.tick() => {
                        if tx.send(MuxEvent::KeepAlive).await.is_err() {
                            break None;
                        }
                    }
                }
            }
        };

        match woken {
            None => break,
            Some((_, Ok(()))) => {}
            Some((index, Err(err))) => {
                let source = sources.remove(index);
                warn!(stream = %source.label(), error = %err, "dropping failed stream");
            }
        }
    }

    let _ = tx.send(MuxEvent::End).await;
    debug!("mux closed");
}

/// Incremental parser for the frames written by [`MuxEvent::to_sse_frame`]
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<MuxEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(at) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..at + 2).collect();
            let text = std::str::from_utf8(&frame[..at])
                .map_err(|err| RunStateError::Serialization(err.to_string()))?;
            if let Some(event) = parse_frame(text)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

fn parse_frame(frame: &str) -> Result<Option<MuxEvent>> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut comment = false;

    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            comment = true;
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    let parsed = match (event, data.is_empty()) {
        (Some("connected"), _) => Some(MuxEvent::Connected),
        (Some("end"), _) => Some(MuxEvent::End),
        (_, true) if comment => Some(MuxEvent::KeepAlive),
        (_, true) => None,
        (name, false) => Some(MuxEvent::Message {
            stream: name.map(str::to_string),
            message: serde_json::from_str(&data.join("\n"))?,
        }),
    };
    Ok(parsed)
}
