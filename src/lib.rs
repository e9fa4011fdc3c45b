use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub mod config;
pub mod converter;
pub mod downloader;
pub mod error;
pub mod notifier;
pub mod probe;
pub mod queue;
pub mod reference;
pub mod telemetry;
pub mod workspace;

mod worker;

/// Opaque job identifier, assigned at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an external caller hands to [`queue::JobQueue::submit`].
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub source_url: String,
    pub display_name: String,
    pub model_reference: String,
    /// Size announced by the caller (e.g. an attachment's metadata), checked
    /// before anything is downloaded.
    pub declared_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub display_name: String,
    pub model_reference: String,
    pub status: Status,
    pub submitted_at: DateTime<Utc>,
    pub result_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Queued,
    Downloading,
    ProbingDuration,
    Converting,
    Completed,
    Failed,
    Rejected,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Rejected)
    }

    /// True while the worker owns the job.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Status::Queued
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::ProbingDuration => "probing_duration",
            Status::Converting => "converting",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pipeline_states_are_active() {
        assert!(!Status::Queued.is_active());
        assert!(Status::Downloading.is_active());
        assert!(Status::ProbingDuration.is_active());
        assert!(Status::Converting.is_active());
        assert!(!Status::Completed.is_active());
        assert!(!Status::Rejected.is_active());
    }

    #[test]
    fn job_ids_are_distinct() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
