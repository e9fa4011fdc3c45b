//! FIFO queue in front of a single conversion worker.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::converter::Converter;
use crate::downloader::Downloader;
use crate::error::{JobFailure, ValidationError};
use crate::notifier::{deliver, report, Notifier};
use crate::probe::DurationProbe;
use crate::workspace::{sanitize_file_name, Workspace};
use crate::{worker, Job, JobId, JobRequest, Status};

pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(560);
pub const DEFAULT_MAX_INPUT_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_ALGORITHM: &str = "rmvpe";

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Longest source accepted for conversion.
    pub max_duration: Duration,
    pub max_input_bytes: u64,
    /// First positional argument passed to the converter.
    pub algorithm: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_duration: DEFAULT_MAX_DURATION,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            algorithm: DEFAULT_ALGORITHM.to_string(),
        }
    }
}

/// The collaborators a job passes through, in order.
#[derive(Clone)]
pub struct Pipeline {
    pub workspace: Workspace,
    pub downloader: Arc<dyn Downloader>,
    pub probe: Arc<dyn DurationProbe>,
    pub converter: Arc<dyn Converter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub id: JobId,
    /// Jobs ahead of this one when it was enqueued.
    pub position: usize,
}

pub(crate) struct Entry {
    pub(crate) job: Job,
    pub(crate) file_name: String,
    pub(crate) notifier: Arc<dyn Notifier>,
}

#[derive(Default)]
pub(crate) struct LiveJobs {
    entries: VecDeque<Entry>,
}

impl LiveJobs {
    pub(crate) fn get_mut(&mut self, id: JobId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.job.id == id)
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<Entry> {
        let index = self.entries.iter().position(|entry| entry.job.id == id)?;
        self.entries.remove(index)
    }

    fn take_queued(&mut self) -> Vec<Entry> {
        let (queued, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|entry| entry.job.status == Status::Queued);
        self.entries = kept.into();
        queued
    }
}

#[derive(Default)]
pub(crate) struct JobTable {
    live: Mutex<LiveJobs>,
    /// Held by a submitter from enqueue until `on_enqueued` returns.
    admission: Mutex<()>,
}

pub(crate) type SharedJobs = Arc<JobTable>;

pub(crate) fn lock(jobs: &SharedJobs) -> MutexGuard<'_, LiveJobs> {
    jobs.live.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn admission(jobs: &SharedJobs) -> MutexGuard<'_, ()> {
    jobs.admission.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove every job that has not started yet and tell its submitter.
pub(crate) async fn cancel_queued(jobs: &SharedJobs) -> usize {
    let cancelled = {
        let _admission = admission(jobs);
        lock(jobs).take_queued()
    };
    let failure = JobFailure::Cancelled;
    for entry in &cancelled {
        let id = entry.job.id;
        report(|| entry.notifier.on_status(id, failure.status()));
        deliver(entry.notifier.on_failed(id, &failure)).await;
    }
    cancelled.len()
}

pub struct JobQueue {
    jobs: SharedJobs,
    send_to_worker: mpsc::UnboundedSender<JobId>,
    max_input_bytes: u64,
    cancel_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawn the worker and return a handle for submitting jobs. Cancelling
    /// `cancel_token` has the same effect as [`JobQueue::shutdown`] minus the
    /// wait.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        pipeline: Pipeline,
        settings: QueueSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        let cancel_token = cancel_token.child_token();
        let jobs: SharedJobs = Arc::default();
        let (send_to_worker, recv_from_queue) = mpsc::unbounded_channel();
        let max_input_bytes = settings.max_input_bytes;

        let worker = {
            let cancel_token = cancel_token.clone();
            let jobs = jobs.clone();
            tokio::spawn(
                async move {
                    worker::start(cancel_token, recv_from_queue, pipeline, settings, jobs).await;
                }
                .instrument(info_span!("worker")),
            )
        };

        JobQueue {
            jobs,
            send_to_worker,
            max_input_bytes,
            cancel_token,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Validate and enqueue a request. Returns as soon as the job is queued;
    /// the outcome arrives through `notifier`.
    pub fn submit(
        &self,
        request: JobRequest,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Submitted, ValidationError> {
        if request.source_url.trim().is_empty() {
            return Err(ValidationError::MissingSourceUrl);
        }
        if request.model_reference.trim().is_empty() {
            return Err(ValidationError::MissingModelReference);
        }
        if let Some(size) = request.declared_size {
            if size > self.max_input_bytes {
                return Err(ValidationError::InputTooLarge {
                    size,
                    limit: self.max_input_bytes,
                });
            }
        }
        let file_name = sanitize_file_name(&request.display_name).ok_or_else(|| {
            ValidationError::InvalidDisplayName {
                name: request.display_name.clone(),
            }
        })?;

        let job = Job {
            id: JobId::new(),
            source_url: request.source_url,
            display_name: request.display_name,
            model_reference: request.model_reference,
            status: Status::Queued,
            submitted_at: Utc::now(),
            result_path: None,
            failure_reason: None,
        };
        let id = job.id;

        let admission = admission(&self.jobs);
        // Channel order must match list order, so both happen under the lock.
        let mut jobs = lock(&self.jobs);
        if self.cancel_token.is_cancelled() {
            return Err(ValidationError::QueueClosed);
        }
        if self.send_to_worker.send(id).is_err() {
            return Err(ValidationError::QueueClosed);
        }
        let position = jobs.entries.len();
        jobs.entries.push_back(Entry {
            job,
            file_name,
            notifier: notifier.clone(),
        });
        drop(jobs);

        report(|| notifier.on_enqueued(id, position));
        drop(admission);

        debug!(job_id = %id, position, "Job enqueued");
        Ok(Submitted { id, position })
    }

    /// Jobs not yet removed, including the one being processed.
    pub fn len(&self) -> usize {
        lock(&self.jobs).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        lock(&self.jobs)
            .entries
            .iter()
            .find(|entry| entry.job.id == id)
            .map(|entry| entry.job.clone())
    }

    /// Snapshot of the live queue in processing order.
    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.jobs)
            .entries
            .iter()
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// The job the worker currently owns, if any.
    pub fn active(&self) -> Option<JobId> {
        lock(&self.jobs)
            .entries
            .iter()
            .find(|entry| entry.job.status.is_active())
            .map(|entry| entry.job.id)
    }

    /// Drop every job that has not started. The running job is left alone.
    pub async fn clear(&self) -> usize {
        let cancelled = cancel_queued(&self.jobs).await;
        if cancelled > 0 {
            info!(cancelled, "Cleared queued jobs");
        }
        cancelled
    }

    /// Stop accepting jobs, let the running job finish, cancel the rest and
    /// wait for the worker to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Worker task failed");
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
