//! Job progress reporting for long-running ingestion.
//!
//! The pipeline only writes progress; nothing reads it back for control
//! flow. [`InMemoryJobs`] is the registry an HTTP surface would poll.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strata_core::JobId;

/// Where a job is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Accepted, not started.
    #[default]
    Pending,
    /// Writing chunks.
    Ingest,
    /// Waiting out a rate limit.
    RateLimited,
    /// Finished cleanly.
    Done,
    /// Finished with dropped data or partial failures.
    DoneWithWarnings,
    /// Nothing was written.
    Error,
}

impl JobStage {
    /// Whether the job has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DoneWithWarnings | Self::Error)
    }

    /// Final stage from the run's tallies: errors with some writes is a
    /// partial success, errors without writes a failure.
    pub fn resolve(added: usize, errors: usize, warnings: usize) -> Self {
        match (errors, warnings) {
            (0, 0) => Self::Done,
            (0, _) => Self::DoneWithWarnings,
            _ if added > 0 => Self::DoneWithWarnings,
            _ => Self::Error,
        }
    }
}

/// A partial update; `None` fields leave the stored value alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    /// New stage.
    pub stage: Option<JobStage>,
    /// Chunks processed.
    pub processed: Option<usize>,
    /// Chunks in total.
    pub total: Option<usize>,
    /// Replaces the warning list.
    pub warnings: Option<Vec<String>>,
    /// Free-form status line.
    pub message: Option<String>,
    /// Seconds until the next retry.
    pub retry_in_secs: Option<f64>,
    /// Elapsed seconds at completion.
    pub elapsed_secs: Option<f64>,
}

impl JobUpdate {
    /// Update that only moves the stage.
    pub fn stage(stage: JobStage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }
}

/// Receiver of job progress.
pub trait ProgressSink: Send + Sync {
    /// Apply `update` to `job`.
    fn update(&self, job: &JobId, update: JobUpdate);
}

/// Discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn update(&self, _job: &JobId, _update: JobUpdate) {}
}

/// Current state of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Stage.
    pub stage: JobStage,
    /// Chunks processed.
    pub processed: usize,
    /// Chunks in total.
    pub total: usize,
    /// Warnings so far.
    pub warnings: Vec<String>,
    /// Last status line.
    pub message: Option<String>,
    /// Seconds until the next retry, while rate limited.
    pub retry_in_secs: Option<f64>,
    /// Elapsed seconds, once finished.
    pub elapsed_secs: Option<f64>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(id: JobId) -> Self {
        Self {
            id,
            stage: JobStage::Pending,
            processed: 0,
            total: 0,
            warnings: Vec::new(),
            message: None,
            retry_in_secs: None,
            elapsed_secs: None,
            updated_at: Utc::now(),
        }
    }
}

/// In-process job registry.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobs {
    jobs: Arc<DashMap<JobId, JobRecord>>,
}

impl InMemoryJobs {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending job and return its id.
    pub fn create(&self) -> JobId {
        let id = JobId::new();
        let _ = self.jobs.insert(id.clone(), JobRecord::new(id.clone()));
        id
    }

    /// Snapshot of `job`.
    pub fn get(&self, job: &JobId) -> Option<JobRecord> {
        self.jobs.get(job).map(|r| r.value().clone())
    }

    /// Drop finished jobs older than `max_age`. Returns how many went.
    pub fn prune_finished(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.jobs.len();
        self.jobs
            .retain(|_, r| !(r.stage.is_terminal() && r.updated_at < cutoff));
        before - self.jobs.len()
    }
}

impl ProgressSink for InMemoryJobs {
    fn update(&self, job: &JobId, update: JobUpdate) {
        let mut record = self
            .jobs
            .entry(job.clone())
            .or_insert_with(|| JobRecord::new(job.clone()));
        if let Some(stage) = update.stage {
            record.stage = stage;
            if stage != JobStage::RateLimited {
                record.retry_in_secs = None;
            }
        }
        if let Some(processed) = update.processed {
            record.processed = processed;
        }
        if let Some(total) = update.total {
            record.total = total;
        }
        if let Some(warnings) = update.warnings {
            record.warnings = warnings;
        }
        if update.message.is_some() {
            record.message = update.message;
        }
        if update.retry_in_secs.is_some() {
            record.retry_in_secs = update.retry_in_secs;
        }
        if update.elapsed_secs.is_some() {
            record.elapsed_secs = update.elapsed_secs;
        }
        record.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_stage_rule() {
        assert_eq!(JobStage::resolve(3, 0, 0), JobStage::Done);
        assert_eq!(JobStage::resolve(3, 0, 2), JobStage::DoneWithWarnings);
        assert_eq!(JobStage::resolve(1, 1, 0), JobStage::DoneWithWarnings);
        assert_eq!(JobStage::resolve(0, 2, 0), JobStage::Error);
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(JobStage::DoneWithWarnings).unwrap(),
            "done_with_warnings"
        );
        assert_eq!(
            serde_json::to_value(JobStage::RateLimited).unwrap(),
            "rate_limited"
        );
    }

    #[test]
    fn updates_merge_into_record() {
        let jobs = InMemoryJobs::new();
        let id = jobs.create();
        assert_eq!(jobs.get(&id).unwrap().stage, JobStage::Pending);

        jobs.update(
            &id,
            JobUpdate {
                stage: Some(JobStage::Ingest),
                total: Some(4),
                processed: Some(0),
                ..JobUpdate::default()
            },
        );
        jobs.update(
            &id,
            JobUpdate {
                stage: Some(JobStage::RateLimited),
                retry_in_secs: Some(2.5),
                ..JobUpdate::default()
            },
        );
        let record = jobs.get(&id).unwrap();
        assert_eq!(record.total, 4);
        assert_eq!(record.retry_in_secs, Some(2.5));

        jobs.update(&id, JobUpdate::stage(JobStage::Done));
        let record = jobs.get(&id).unwrap();
        assert!(record.stage.is_terminal());
        assert_eq!(record.retry_in_secs, None);
        assert_eq!(record.total, 4);
    }

    #[test]
    fn prune_keeps_running_jobs() {
        let jobs = InMemoryJobs::new();
        let running = jobs.create();
        let done = jobs.create();
        jobs.update(&done, JobUpdate::stage(JobStage::Done));
        assert_eq!(jobs.prune_finished(chrono::Duration::seconds(-1)), 1);
        assert!(jobs.get(&running).is_some());
        assert!(jobs.get(&done).is_none());
    }
}
