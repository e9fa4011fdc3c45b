use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, warn};

use crate::error::{FailureKind, JobFailure};
use crate::{JobId, Status};

/// Receives progress and the outcome of one submitted job.
///
/// The worker awaits `on_completed`/`on_failed` before it deletes the job's
/// artifacts, so `result_path` is readable for the whole call.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `position` counts the jobs ahead, including the one being processed.
    ///
    /// Runs before the worker can see the job. It may read the queue but
    /// must not submit to it or clear it.
    fn on_enqueued(&self, job_id: JobId, position: usize);

    fn on_status(&self, _job_id: JobId, _status: Status) {}

    async fn on_completed(&self, job_id: JobId, result_path: &Path);

    async fn on_failed(&self, job_id: JobId, failure: &JobFailure);
}

/// Call a synchronous notifier hook, logging instead of unwinding if it
/// panics.
pub(crate) fn report(hook: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        error!(panic = %panic_message(panic.as_ref()), "Notifier panicked");
    }
}

/// Await a notifier delivery, logging instead of unwinding if it panics.
pub(crate) async fn deliver<F: Future<Output = ()>>(delivery: F) {
    if let Err(panic) = AssertUnwindSafe(delivery).catch_unwind().await {
        error!(panic = %panic_message(panic.as_ref()), "Notifier panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        position: usize,
    },
    StatusChanged {
        job_id: JobId,
        status: Status,
    },
    Completed {
        job_id: JobId,
        path: PathBuf,
    },
    Failed {
        job_id: JobId,
        kind: FailureKind,
        detail: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::StatusChanged { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }
}

/// Forwards notifications as [`JobEvent`]s over a channel.
///
/// Without a delivery directory the `Completed` path points into the
/// workspace and is deleted right after the event is sent.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    sender: UnboundedSender<JobEvent>,
    deliver_dir: Option<PathBuf>,
}

impl EventNotifier {
    pub fn new(sender: UnboundedSender<JobEvent>) -> Self {
        EventNotifier {
            sender,
            deliver_dir: None,
        }
    }

    /// Copy each result into `dir` before reporting it.
    pub fn deliver_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.deliver_dir = Some(dir.into());
        self
    }

    fn send(&self, event: JobEvent) {
        if let Err(err) = self.sender.send(event) {
            warn!(event = ?err.0, "Nobody is listening for job events");
        }
    }

    async fn deliver(&self, result_path: &Path) -> Result<PathBuf, std::io::Error> {
        let Some(dir) = &self.deliver_dir else {
            return Ok(result_path.to_path_buf());
        };
        let file_name = result_path.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "result has no file name")
        })?;
        let destination = dir.join(file_name);
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::copy(result_path, &destination).await?;
        Ok(destination)
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    fn on_enqueued(&self, job_id: JobId, position: usize) {
        self.send(JobEvent::Enqueued { job_id, position });
    }

    fn on_status(&self, job_id: JobId, status: Status) {
        self.send(JobEvent::StatusChanged { job_id, status });
    }

    async fn on_completed(&self, job_id: JobId, result_path: &Path) {
        match self.deliver(result_path).await {
            Ok(path) => self.send(JobEvent::Completed { job_id, path }),
            Err(err) => {
                error!(%job_id, error = %err, "Failed to deliver conversion result");
                self.send(JobEvent::Failed {
                    job_id,
                    kind: FailureKind::ConversionNoOutput,
                    detail: format!("result could not be delivered: {err}"),
                });
            }
        }
    }

    async fn on_failed(&self, job_id: JobId, failure: &JobFailure) {
        self.send(JobEvent::Failed {
            job_id,
            kind: failure.kind(),
            detail: failure.to_string(),
        });
    }
}
