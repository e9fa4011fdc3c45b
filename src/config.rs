use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::converter::ProcessConverter;
use crate::queue::{QueueSettings, DEFAULT_ALGORITHM, DEFAULT_MAX_INPUT_BYTES};
use crate::workspace::Workspace;

#[derive(Args, Clone, Debug, PartialEq)]
pub struct Config {
    #[arg(
        long = "workspace-root",
        env = "COVERQ_WORKSPACE_ROOT",
        help = "Directory holding the input, output, archives and staging folders",
        default_value = "./workspace"
    )]
    pub workspace_root: PathBuf,

    #[arg(
        long = "max-duration-secs",
        env = "COVERQ_MAX_DURATION_SECS",
        help = "Longest source audio accepted for conversion, in seconds",
        default_value = "560"
    )]
    pub max_duration_secs: u64,

    #[arg(
        long = "max-input-bytes",
        env = "COVERQ_MAX_INPUT_BYTES",
        help = "Largest source file accepted, in bytes",
        default_value_t = DEFAULT_MAX_INPUT_BYTES
    )]
    pub max_input_bytes: u64,

    #[arg(
        long = "converter-program",
        env = "COVERQ_CONVERTER_PROGRAM",
        help = "Executable that performs the voice conversion",
        default_value = "python"
    )]
    pub converter_program: PathBuf,

    #[arg(
        long = "converter-arg",
        env = "COVERQ_CONVERTER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        help = "Arguments placed before the algorithm, input, output and model arguments",
        default_values_t = ["python/infer.py".to_string(), "0".to_string(), "0.66".to_string()]
    )]
    pub converter_args: Vec<String>,

    #[arg(
        long = "algorithm",
        env = "COVERQ_ALGORITHM",
        help = "Pitch extraction algorithm passed to the converter",
        default_value = DEFAULT_ALGORITHM
    )]
    pub algorithm: String,

    #[arg(
        long = "conversion-timeout-secs",
        env = "COVERQ_CONVERSION_TIMEOUT_SECS",
        help = "Kill the converter after this many seconds (no limit when unset)"
    )]
    pub conversion_timeout_secs: Option<u64>,

    #[arg(
        long = "download-timeout-secs",
        env = "COVERQ_DOWNLOAD_TIMEOUT_SECS",
        help = "Abort source downloads after this many seconds (no limit when unset)"
    )]
    pub download_timeout_secs: Option<u64>,

    #[arg(
        long = "jaeger-endpoint",
        env = "COVERQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl Config {
    pub fn workspace(&self) -> Workspace {
        Workspace::local(&self.workspace_root)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_duration: Duration::from_secs(self.max_duration_secs),
            max_input_bytes: self.max_input_bytes,
            algorithm: self.algorithm.clone(),
        }
    }

    pub fn converter(&self) -> ProcessConverter {
        ProcessConverter::new(&self.converter_program)
            .with_leading_args(&self.converter_args)
            .with_timeout(self.conversion_timeout_secs.map(Duration::from_secs))
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_match_the_reference_deployment() {
        let cli = Cli::try_parse_from(["coverq"]).unwrap();
        let settings = cli.config.queue_settings();

        assert_eq!(settings.max_duration, Duration::from_secs(560));
        assert_eq!(settings.max_input_bytes, 50 * 1024 * 1024);
        assert_eq!(settings.algorithm, "rmvpe");
        assert_eq!(
            cli.config.converter_args,
            vec!["python/infer.py", "0", "0.66"]
        );
        assert_eq!(cli.config.conversion_timeout_secs, None);
    }

    #[test]
    fn overrides_are_applied() {
        let cli = Cli::try_parse_from([
            "coverq",
            "--max-duration-secs",
            "30",
            "--converter-program",
            "/opt/rvc/convert",
            "--converter-arg",
            "--pitch,2",
            "--conversion-timeout-secs",
            "900",
        ])
        .unwrap();

        assert_eq!(cli.config.max_duration_secs, 30);
        assert_eq!(cli.config.converter_program, PathBuf::from("/opt/rvc/convert"));
        assert_eq!(cli.config.converter_args, vec!["--pitch", "2"]);
        assert_eq!(cli.config.conversion_timeout_secs, Some(900));
    }
}
