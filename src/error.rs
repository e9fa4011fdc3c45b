use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::Status;

/// Submission was refused; no job was created.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("source url is required")]
    MissingSourceUrl,

    #[error("model reference is required")]
    MissingModelReference,

    #[error("display name {name:?} cannot be used as a file name")]
    InvalidDisplayName { name: String },

    #[error("input of {size} bytes exceeds the {limit} byte limit")]
    InputTooLarge { size: u64, limit: u64 },

    #[error("queue is shut down")]
    QueueClosed,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server responded with {status}")]
    Status { status: reqwest::StatusCode },

    #[error("download exceeded the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported or corrupt media: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    #[error("no audio track found")]
    NoAudioTrack,

    #[error("track has neither a time base nor a sample rate")]
    UnknownTimeBase,

    #[error("probe task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to spawn converter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("converter exited with {}: {stderr}", exit_code_label(.code))]
    Exited { code: Option<i32>, stderr: String },

    #[error("converter timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("converter produced no file at {}", .output.display())]
    NoOutput { output: PathBuf, stderr: String },
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Terminal outcome of a job that did not complete.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("could not download {url}: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: DownloadError,
    },

    #[error("could not read media duration: {0}")]
    UnreadableMedia(#[source] ProbeError),

    #[error("audio lasts {duration:.1}s, the limit is {limit:.0}s")]
    DurationExceeded { duration: f64, limit: f64 },

    #[error("model reference {reference:?} is not a link")]
    InvalidModelReference { reference: String },

    #[error("conversion failed: {0}")]
    ConversionProcessFailed(#[source] ConvertError),

    #[error("converter did not produce {}: {stderr}", .output.display())]
    ConversionNoOutput { output: PathBuf, stderr: String },

    #[error("job was cancelled before it started")]
    Cancelled,

    #[error("job panicked: {message}")]
    WorkerPanic { message: String },
}

impl From<ConvertError> for JobFailure {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::NoOutput { output, stderr } => {
                JobFailure::ConversionNoOutput { output, stderr }
            }
            other => JobFailure::ConversionProcessFailed(other),
        }
    }
}

impl JobFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobFailure::DownloadFailed { .. } => FailureKind::DownloadFailed,
            JobFailure::UnreadableMedia(_) => FailureKind::UnreadableMedia,
            JobFailure::DurationExceeded { .. } => FailureKind::DurationExceeded,
            JobFailure::InvalidModelReference { .. } => FailureKind::InvalidModelReference,
            JobFailure::ConversionProcessFailed(_) => FailureKind::ConversionProcessFailed,
            JobFailure::ConversionNoOutput { .. } => FailureKind::ConversionNoOutput,
            JobFailure::Cancelled => FailureKind::Cancelled,
            JobFailure::WorkerPanic { .. } => FailureKind::WorkerPanic,
        }
    }

    /// Terminal status the job ends in.
    pub fn status(&self) -> Status {
        if self.kind().is_rejection() {
            Status::Rejected
        } else {
            Status::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    DownloadFailed,
    UnreadableMedia,
    DurationExceeded,
    InvalidModelReference,
    ConversionProcessFailed,
    ConversionNoOutput,
    Cancelled,
    WorkerPanic,
}

impl FailureKind {
    /// Rejections happen before the converter is ever started.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            FailureKind::DownloadFailed
                | FailureKind::UnreadableMedia
                | FailureKind::DurationExceeded
                | FailureKind::InvalidModelReference
                | FailureKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::DownloadFailed => "DownloadFailed",
            FailureKind::UnreadableMedia => "UnreadableMedia",
            FailureKind::DurationExceeded => "DurationExceeded",
            FailureKind::InvalidModelReference => "InvalidModelReference",
            FailureKind::ConversionProcessFailed => "ConversionProcessFailed",
            FailureKind::ConversionNoOutput => "ConversionNoOutput",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::WorkerPanic => "WorkerPanic",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
