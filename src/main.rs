use anyhow::{bail, Error};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use coverq::config::Config;
use coverq::downloader::HttpDownloader;
use coverq::notifier::{EventNotifier, JobEvent};
use coverq::probe::SymphoniaProbe;
use coverq::queue::{JobQueue, Pipeline};
use coverq::{telemetry, JobRequest};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Queue audio files for sequential voice conversion")]
pub struct ConfigContext {
    #[command(flatten)]
    config: Config,

    #[arg(
        short = 'd',
        long = "deliver-dir",
        env = "COVERQ_DELIVER_DIR",
        help = "Where converted files are copied before the workspace is cleaned",
        default_value = "./converted"
    )]
    deliver_dir: PathBuf,

    #[arg(
        short = 'j',
        long = "job",
        num_args = 3,
        value_names = ["SOURCE_URL", "DISPLAY_NAME", "MODEL_REFERENCE"],
        help = "A conversion to run; may be repeated"
    )]
    jobs: Vec<String>,

    #[arg(
        long = "declared-size",
        help = "Size in bytes announced for each --job, in the same order"
    )]
    declared_sizes: Vec<u64>,
}

impl ConfigContext {
    fn requests(&self) -> Vec<JobRequest> {
        self.jobs
            .chunks(3)
            .enumerate()
            .map(|(index, job)| JobRequest {
                source_url: job[0].clone(),
                display_name: job[1].clone(),
                model_reference: job[2].clone(),
                declared_size: self.declared_sizes.get(index).copied(),
            })
            .collect()
    }
}

#[instrument(skip_all)]
async fn setup(context: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let config = &context.config;

    let workspace = config.workspace();
    workspace.reset().await?;
    info!(root = %config.workspace_root.display(), "Workspace ready");

    let pipeline = Pipeline {
        workspace,
        downloader: Arc::new(HttpDownloader::new(
            config.download_timeout(),
            Some(config.max_input_bytes),
        )?),
        probe: Arc::new(SymphoniaProbe),
        converter: Arc::new(config.converter()),
    };
    let queue = JobQueue::start(pipeline, config.queue_settings(), cancel_token.clone());

    // Channel for getting job events back from the worker
    let (send_to_client, mut recv_from_queue) = mpsc::unbounded_channel();
    let notifier = Arc::new(EventNotifier::new(send_to_client).deliver_to(&context.deliver_dir));

    let mut pending = HashSet::new();
    for request in context.requests() {
        let name = request.display_name.clone();
        match queue.submit(request, notifier.clone()) {
            Ok(submitted) => {
                pending.insert(submitted.id);
            }
            Err(err) => warn!(display_name = %name, error = %err, "Job refused"),
        }
    }
    drop(notifier);

    if pending.is_empty() {
        queue.shutdown().await;
        bail!("no jobs were accepted");
    }

    debug!("Done submitting jobs");
    let mut failed = 0usize;
    while !pending.is_empty() {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Client Cancelled");
                break;
            },
            event = recv_from_queue.recv() => {
                let Some(event) = event else {
                    debug!("Job event channel closed unexpectedly, exiting");
                    break;
                };
                match &event {
                    JobEvent::Completed { job_id, path } => {
                        info!(%job_id, path = %path.display(), "Converted");
                    },
                    JobEvent::Failed { job_id, kind, detail } => {
                        failed += 1;
                        error!(%job_id, %kind, %detail, "Conversion failed");
                    },
                    other => debug!(event = ?other, "Job event"),
                }
                if event.is_terminal() {
                    pending.remove(&event.job_id());
                }
            }
        }
    }

    println!("Waiting for queue to shutdown...");
    queue.shutdown().await;

    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let context = ConfigContext::parse();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "coverq=DEBUG");
    }

    telemetry::init("coverq", context.config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(context, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await;
    println!("Shutting down.");
    telemetry::shutdown();
    result??;

    Ok(())
}
