use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ConvertError;

/// The four positional arguments handed to the converter.
#[derive(Debug, Clone)]
pub struct ConversionRequest<'a> {
    pub algorithm: &'a str,
    pub input: &'a Path,
    pub output: &'a Path,
    pub model_reference: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<ConversionOutput, ConvertError>;
}

/// Runs an external executable as
/// `program [leading args..] <algorithm> <input> <output> <model reference>`.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
    program: PathBuf,
    leading_args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl ProcessConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ProcessConverter {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Kill the converter if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, request: &ConversionRequest<'_>) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(request.algorithm)
            .arg(request.input)
            .arg(request.output)
            .arg(request.model_reference)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Converter for ProcessConverter {
    #[instrument(name = "convert", skip_all, fields(algorithm = %request.algorithm))]
    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<ConversionOutput, ConvertError> {
        let started = Instant::now();
        debug!(program = %self.program.display(), input = %request.input.display(), "Starting converter");
        let child = self.command(request).spawn().map_err(ConvertError::Spawn)?;

        let output = match self.timeout {
            Some(after) => match tokio::time::timeout(after, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(?after, "Converter timed out, killing it");
                    return Err(ConvertError::TimedOut { after });
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(ConvertError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let elapsed = started.elapsed();
        debug!(status = %output.status, elapsed_ms = elapsed.as_millis() as u64, "Converter exited");
        if !stdout.is_empty() {
            debug!(%stdout, "Converter stdout");
        }
        if !stderr.is_empty() {
            debug!(%stderr, "Converter stderr");
        }

        if !output.status.success() {
            return Err(ConvertError::Exited {
                code: output.status.code(),
                stderr,
            });
        }

        if !tokio::fs::try_exists(request.output).await.unwrap_or(false) {
            return Err(ConvertError::NoOutput {
                output: request.output.to_path_buf(),
                stderr,
            });
        }

        Ok(ConversionOutput {
            stdout,
            stderr,
            elapsed,
        })
    }
}
