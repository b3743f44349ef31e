//! Run substrate.
//!
//! Runs are owned by an execution layer outside this crate; the tag index
//! only needs their liveness through [`RunLiveness`]. [`RunHost`] is the
//! in-process stand-in: it hands out run ids, tracks status and keeps each
//! run's output logs.

use crate::core::{Result, RunStateError};
use crate::journal::OutputLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Externally visible liveness of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Unknown,
}

impl RunStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Active)
    }
}

/// Liveness lookup used by unique tag claims
#[async_trait]
pub trait RunLiveness: Send + Sync {
    async fn status(&self, run_id: &str) -> Result<RunStatus>;
}

struct RunRecord {
    status: RunStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    logs: HashMap<String, OutputLog>,
}

/// Snapshot of one run for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct RunHost {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl RunHost {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Start a run with a fresh id
    pub fn start_run(&self) -> Result<String> {
        self.start_run_with_id(&Uuid::new_v4().to_string())
    }

    /// Start a run under a caller-chosen id
    pub fn start_run_with_id(&self, run_id: &str) -> Result<String> {
        let mut runs = self.runs.write()?;
        if runs.contains_key(run_id) {
            return Err(RunStateError::RunExists(run_id.to_string()));
        }

        runs.insert(
            run_id.to_string(),
            RunRecord {
                status: RunStatus::Active,
                started_at: Utc::now(),
                finished_at: None,
                logs: HashMap::new(),
            },
        );

        info!(run_id, "run started");
        Ok(run_id.to_string())
    }

    pub fn complete_run(&self, run_id: &str) -> Result<()> {
        self.finish(run_id, RunStatus::Completed)
    }

    pub fn fail_run(&self, run_id: &str) -> Result<()> {
        self.finish(run_id, RunStatus::Failed)
    }

    fn finish(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut runs = self.runs.write()?;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| RunStateError::NotFound(format!("run '{run_id}'")))?;

        record.status = status;
        record.finished_at = Some(Utc::now());
        for log in record.logs.values() {
            log.close();
        }

        info!(run_id, ?status, "run finished");
        Ok(())
    }

    /// Forget a run and drop its logs; it reports `Unknown` afterwards
    pub fn discard_run(&self, run_id: &str) -> Result<()> {
        let record = self.runs.write()?.remove(run_id);
        if let Some(record) = record {
            for log in record.logs.values() {
                log.discard()?;
            }
            debug!(run_id, "run discarded");
        }
        Ok(())
    }

    /// Output log for `(run_id, namespace)`, created on first use
    pub fn log(&self, run_id: &str, namespace: &str) -> Result<OutputLog> {
        let mut runs = self.runs.write()?;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| RunStateError::NotFound(format!("run '{run_id}'")))?;

        let finished = record.status != RunStatus::Active;
        let log = record
            .logs
            .entry(namespace.to_string())
            .or_insert_with(|| {
                let log = OutputLog::new(format!("{run_id}/{namespace}"));
                if finished {
                    log.close();
                }
                log
            })
            .clone();

        Ok(log)
    }

    pub fn run_status(&self, run_id: &str) -> Result<RunStatus> {
        let runs = self.runs.read()?;
        Ok(runs
            .get(run_id)
            .map(|record| record.status)
            .unwrap_or(RunStatus::Unknown))
    }

    pub fn list_runs(&self) -> Result<Vec<RunInfo>> {
        let runs = self.runs.read()?;
        let mut infos: Vec<RunInfo> = runs
            .iter()
            .map(|(id, record)| RunInfo {
                id: id.clone(),
                status: record.status,
                started_at: record.started_at,
                finished_at: record.finished_at,
            })
            .collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(infos)
    }
}

impl Default for RunHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunLiveness for RunHost {
    async fn status(&self, run_id: &str) -> Result<RunStatus> {
        self.run_status(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MessageReader;
    use serde_json::json;

    #[tokio::test]
    async fn test_lifecycle_statuses() {
        let host = RunHost::new();
        let run = host.start_run().unwrap();
        assert_eq!(host.status(&run).await.unwrap(), RunStatus::Active);

        host.complete_run(&run).unwrap();
        assert_eq!(host.status(&run).await.unwrap(), RunStatus::Completed);

        assert_eq!(host.status("nope").await.unwrap(), RunStatus::Unknown);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let host = RunHost::new();
        host.start_run_with_id("run-1").unwrap();
        assert!(matches!(
            host.start_run_with_id("run-1"),
            Err(RunStateError::RunExists(_))
        ));
    }

    #[tokio::test]
    async fn test_finishing_closes_logs() {
        let host = RunHost::new();
        let run = host.start_run_with_id("run-1").unwrap();
        let log = host.log(&run, "stream-state").unwrap();
        log.push(json!({"n": 1})).unwrap();

        host.fail_run(&run).unwrap();
        assert!(log.is_closed());

        let mut reader = host.log(&run, "stream-state").unwrap().reader(0);
        assert_eq!(reader.read().await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[test]
    fn test_log_for_unknown_run() {
        let host = RunHost::new();
        assert!(host.log("ghost", "stream-state").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_discard_forgets_run() {
        let host = RunHost::new();
        host.start_run_with_id("run-1").unwrap();
        host.discard_run("run-1").unwrap();
        assert_eq!(host.status("run-1").await.unwrap(), RunStatus::Unknown);
        assert!(host.list_runs().unwrap().is_empty());
    }
}
