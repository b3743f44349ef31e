//! Append-only, offset-addressable output logs.
//!
//! Every run owns one log per namespace. Writers append JSON payloads and get
//! back the offset they landed at; readers start at any offset and follow the
//! log, waiting for new appends until the log is closed.

use crate::core::{Result, RunStateError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogPhase {
    Open,
    Closed,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogCursor {
    len: u64,
    phase: LogPhase,
}

/// A stored log record
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub offset: u64,
    pub appended_at: DateTime<Utc>,
    pub payload: Value,
}

/// Anything a state channel can emit messages into
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Append one payload, returning its offset
    async fn append(&self, payload: Value) -> Result<u64>;

    /// Number of payloads appended so far
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a non-blocking read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadStep {
    Message(Value),
    /// Nothing buffered right now; more may arrive later
    CaughtUp,
    /// The source has nothing more to give
    Finished,
}

/// A sequential reader over one stream of payloads.
///
/// Errors are local to this reader.
#[async_trait]
pub trait MessageReader: Send {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Take the next buffered payload without waiting
    fn try_next(&mut self) -> Result<ReadStep>;

    /// Resolve once `try_next` would return something other than
    /// [`ReadStep::CaughtUp`]
    async fn ready(&mut self) -> Result<()>;

    /// Wait for the next payload; `Ok(None)` once the source is finished
    async fn read(&mut self) -> Result<Option<Value>> {
        loop {
            match self.try_next()? {
                ReadStep::Message(payload) => return Ok(Some(payload)),
                ReadStep::Finished => return Ok(None),
                ReadStep::CaughtUp => self.ready().await?,
            }
        }
    }
}

struct LogInner {
    name: String,
    entries: RwLock<Vec<LogEntry>>,
    cursor: watch::Sender<LogCursor>,
}

/// Handle to a shared output log
#[derive(Clone)]
pub struct OutputLog {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLog")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl OutputLog {
    pub fn new(name: impl Into<String>) -> Self {
        let (cursor, _) = watch::channel(LogCursor {
            len: 0,
            phase: LogPhase::Open,
        });

        Self {
            inner: Arc::new(LogInner {
                name: name.into(),
                entries: RwLock::new(Vec::new()),
                cursor,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a payload at the tail
    pub fn push(&self, payload: Value) -> Result<u64> {
        let mut entries = self.inner.entries.write()?;

        match self.inner.cursor.borrow().phase {
            LogPhase::Open => {}
            LogPhase::Closed | LogPhase::Discarded => {
                return Err(RunStateError::Closed(format!(
                    "log '{}' no longer accepts appends",
                    self.inner.name
                )));
            }
        }

        let offset = entries.len() as u64;
        entries.push(LogEntry {
            offset,
            appended_at: Utc::now(),
            payload,
        });
        // publish while still holding the entries lock so readers observe
        // offsets in append order
        self.inner.cursor.send_modify(|cursor| cursor.len = offset + 1);

        debug!(log = %self.inner.name, offset, "appended log entry");
        Ok(offset)
    }

    /// Number of entries appended so far
    pub fn entry_count(&self) -> u64 {
        self.inner.cursor.borrow().len
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cursor.borrow().phase != LogPhase::Open
    }

    /// Stop accepting appends; readers drain what is left and then end
    pub fn close(&self) {
        self.inner.cursor.send_modify(|cursor| {
            if cursor.phase == LogPhase::Open {
                cursor.phase = LogPhase::Closed;
            }
        });
    }

    /// Drop all entries; any reader still attached fails on its next read
    pub fn discard(&self) -> Result<()> {
        let mut entries = self.inner.entries.write()?;
        entries.clear();
        self.inner
            .cursor
            .send_modify(|cursor| cursor.phase = LogPhase::Discarded);
        Ok(())
    }

    /// Copy of the entries in `[from, len)`
    pub fn entries_from(&self, from: u64) -> Result<Vec<LogEntry>> {
        let entries = self.inner.entries.read()?;
        Ok(entries.iter().skip(from as usize).cloned().collect())
    }

    /// Open a following reader positioned at `start`
    pub fn reader(&self, start: u64) -> LogReader {
        LogReader {
            log: self.clone(),
            position: start,
            cursor: self.inner.cursor.subscribe(),
        }
    }

    fn entry_at(&self, offset: u64) -> Result<Option<Value>> {
        let entries = self.inner.entries.read()?;
        Ok(entries.get(offset as usize).map(|entry| entry.payload.clone()))
    }
}

#[async_trait]
impl MessageSink for OutputLog {
    async fn append(&self, payload: Value) -> Result<u64> {
        self.push(payload)
    }

    fn len(&self) -> u64 {
        self.entry_count()
    }
}

/// Reader that follows an [`OutputLog`]
pub struct LogReader {
    log: OutputLog,
    position: u64,
    cursor: watch::Receiver<LogCursor>,
}

impl LogReader {
    /// Offset of the next entry this reader will return
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Return the next entry if one is already buffered
    pub fn try_read(&mut self) -> Result<Option<Value>> {
        let cursor = *self.cursor.borrow_and_update();
        self.take_available(cursor)
    }

    fn take_available(&mut self, cursor: LogCursor) -> Result<Option<Value>> {
        if cursor.phase == LogPhase::Discarded {
            return Err(RunStateError::stream_read(self.log.name(), "log was discarded"));
        }

        if self.position < cursor.len {
            let payload = self.log.entry_at(self.position)?.ok_or_else(|| {
                RunStateError::stream_read(self.log.name(), "entry missing below log length")
            })?;
            self.position += 1;
            return Ok(Some(payload));
        }

        Ok(None)
    }
}

#[async_trait]
impl MessageReader for LogReader {
    fn name(&self) -> &str {
        self.log.name()
    }

    fn try_next(&mut self) -> Result<ReadStep> {
        let cursor = *self.cursor.borrow_and_update();
        if let Some(payload) = self.take_available(cursor)? {
            return Ok(ReadStep::Message(payload));
        }
        match cursor.phase {
            LogPhase::Open => Ok(ReadStep::CaughtUp),
            LogPhase::Closed | LogPhase::Discarded => Ok(ReadStep::Finished),
        }
    }

    async fn ready(&mut self) -> Result<()> {
        loop {
            let cursor = *self.cursor.borrow_and_update();
            if cursor.phase != LogPhase::Open || self.position < cursor.len {
                return Ok(());
            }
            self.cursor
                .changed()
                .await
                .map_err(|_| RunStateError::stream_read(self.log.name(), "log went away"))?;
        }
    }
}
