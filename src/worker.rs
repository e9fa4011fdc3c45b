use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::converter::ConversionRequest;
use crate::error::JobFailure;
use crate::notifier::{self, Notifier};
use crate::queue::{self, Pipeline, QueueSettings, SharedJobs};
use crate::reference::is_valid_reference;
use crate::workspace::JobPaths;
use crate::{JobId, Status};

/// What the worker needs from a live entry, copied out so the queue lock is
/// never held across an await.
struct Ticket {
    id: JobId,
    source_url: String,
    model_reference: String,
    file_name: String,
    notifier: Arc<dyn Notifier>,
}

pub(crate) async fn start(
    cancel_token: CancellationToken,
    mut recv_from_queue: UnboundedReceiver<JobId>,
    pipeline: Pipeline,
    settings: QueueSettings,
    jobs: SharedJobs,
) {
    info!("Worker started");
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job_id = recv_from_queue.recv() => {
                match job_id {
                    None => {
                        debug!("Queue channel closed, exiting");
                        break;
                    },
                    Some(job_id) => {
                        process(job_id, &pipeline, &settings, &jobs)
                            .instrument(info_span!("job", %job_id))
                            .await;
                    }
                }
            }
        }
    }

    let abandoned = queue::cancel_queued(&jobs).await;
    if abandoned > 0 {
        warn!(abandoned, "Cancelled jobs that never started");
    }
    info!("Worker stopped.");
}

/// Run one job to its terminal state, report it, then delete its artifacts.
async fn process(job_id: JobId, pipeline: &Pipeline, settings: &QueueSettings, jobs: &SharedJobs) {
    let Some(ticket) = claim(jobs, job_id) else {
        debug!("Job was cleared before it started");
        return;
    };

    let started = Instant::now();
    let paths = pipeline.workspace.job_paths(job_id, &ticket.file_name);

    let outcome = AssertUnwindSafe(run_pipeline(&ticket, &paths, pipeline, settings, jobs))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(JobFailure::WorkerPanic {
                message: notifier::panic_message(panic.as_ref()),
            })
        });

    match &outcome {
        Ok(()) => {
            finish(jobs, &ticket, Status::Completed, Some(paths.output.clone()), None);
            info!(output = %paths.output.display(), "Conversion completed");
            notifier::deliver(ticket.notifier.on_completed(job_id, &paths.output)).await;
        }
        Err(failure) => {
            let status = failure.status();
            finish(jobs, &ticket, status, None, Some(failure.to_string()));
            warn!(%status, kind = %failure.kind(), error = %failure, "Job did not complete");
            notifier::deliver(ticket.notifier.on_failed(job_id, failure)).await;
        }
    }

    pipeline.workspace.cleanup_artifacts(&paths.artifacts()).await;
    queue::lock(jobs).remove(job_id);

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Job finished");
}

async fn run_pipeline(
    ticket: &Ticket,
    paths: &JobPaths,
    pipeline: &Pipeline,
    settings: &QueueSettings,
    jobs: &SharedJobs,
) -> Result<(), JobFailure> {
    transition(jobs, ticket, Status::Downloading);
    let bytes = pipeline
        .downloader
        .fetch(&ticket.source_url, &paths.input)
        .await
        .map_err(|source| JobFailure::DownloadFailed {
            url: ticket.source_url.clone(),
            source,
        })?;
    debug!(bytes, "Source downloaded");

    transition(jobs, ticket, Status::ProbingDuration);
    let duration = pipeline
        .probe
        .duration(&paths.input)
        .await
        .map_err(JobFailure::UnreadableMedia)?;
    let limit = settings.max_duration.as_secs_f64();
    if duration > limit {
        return Err(JobFailure::DurationExceeded { duration, limit });
    }

    if !is_valid_reference(&ticket.model_reference) {
        return Err(JobFailure::InvalidModelReference {
            reference: ticket.model_reference.clone(),
        });
    }

    transition(jobs, ticket, Status::Converting);
    let output = pipeline
        .converter
        .convert(&ConversionRequest {
            algorithm: &settings.algorithm,
            input: &paths.input,
            output: &paths.output,
            model_reference: &ticket.model_reference,
        })
        .await?;
    debug!(elapsed_ms = output.elapsed.as_millis() as u64, "Converter finished");

    Ok(())
}

fn claim(jobs: &SharedJobs, job_id: JobId) -> Option<Ticket> {
    // Wait out a submitter still announcing this job.
    drop(queue::admission(jobs));
    let mut jobs = queue::lock(jobs);
    let entry = jobs.get_mut(job_id)?;
    Some(Ticket {
        id: job_id,
        source_url: entry.job.source_url.clone(),
        model_reference: entry.job.model_reference.clone(),
        file_name: entry.file_name.clone(),
        notifier: entry.notifier.clone(),
    })
}

fn transition(jobs: &SharedJobs, ticket: &Ticket, status: Status) {
    if let Some(entry) = queue::lock(jobs).get_mut(ticket.id) {
        entry.job.status = status;
    }
    debug!(%status, "Job status transition");
    notifier::report(|| ticket.notifier.on_status(ticket.id, status));
}

fn finish(
    jobs: &SharedJobs,
    ticket: &Ticket,
    status: Status,
    result_path: Option<PathBuf>,
    failure_reason: Option<String>,
) {
    if let Some(entry) = queue::lock(jobs).get_mut(ticket.id) {
        entry.job.result_path = result_path;
        entry.job.failure_reason = failure_reason;
    }
    transition(jobs, ticket, status);
}
