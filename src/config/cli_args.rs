use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::poll_config::PollOverrides;

// lisaprobe - run one parameterised Linux guest test and print its verdict
#[derive(Parser, Debug)]
#[clap(
    name = "lisaprobe",
    version,
    about = "Run a Linux guest test case and report PASS/FAIL/ABORTED/SKIPPED",
    override_usage = "lisaprobe [OPTIONS] { --test | --parse-only }\n       lisaprobe --test --case <FILE> [--params <STRING>] [TARGET_OPTIONS]\n       lisaprobe --parse-only --params <STRING>",
    group(ArgGroup::new("mode").required(true).args(["test", "parse_only"])),
    after_help = "EXECUTION MODES:\n  --test                 Run a test case and print its verdict\n  --parse-only           Print the parsed parameters as JSON\n\nENVIRONMENT TYPES:\n  --local                Run on this machine\n  --remote               Run on the target from --target via SSH\n\nEXAMPLES:\n  lisaprobe --test --local --case kvp.toml --params 'Key=foo;Value=bar'\n  lisaprobe --test --remote --target vm.toml --case disks.yaml --params-file params.txt\n  lisaprobe --parse-only --params 'SCSI_1=0,0,Dynamic;SCSI_2=0,1,Fixed'"
)]
pub struct CliArgs {
    #[clap(short = 't', long = "test", help = "Run a test case")]
    pub test: bool,

    #[clap(short = 'p', long = "parse-only", help = "Parse parameters without running anything")]
    pub parse_only: bool,

    #[clap(short = 'v', long = "verbose", help = "Enable verbose logging")]
    pub verbose: bool,

    #[clap(short = 'q', long = "quiet", help = "Suppress non-essential output")]
    pub quiet: bool,

    #[clap(long = "local", help = "Execute in local environment", conflicts_with = "remote")]
    pub local: bool,

    #[clap(long = "remote", help = "Execute on remote target via SSH", requires = "target")]
    pub remote: bool,

    #[clap(long = "target", help = "Target configuration file")]
    pub target: Option<PathBuf>,

    #[clap(short = 'c', long = "case", help = "Test case definition (TOML or YAML)")]
    pub case: Option<PathBuf>,

    // Raw `key=value;key=value` parameter string
    #[clap(long = "params", help = "Test parameters as key=value;key=value")]
    pub params: Option<String>,

    #[clap(long = "params-file", help = "File holding the parameter string", conflicts_with = "params")]
    pub params_file: Option<PathBuf>,

    #[clap(long = "artifacts-dir", help = "Directory for downloaded sentinels and logs")]
    pub artifacts_dir: Option<PathBuf>,

    #[clap(long = "report", help = "JSON report output file")]
    pub report: Option<PathBuf>,

    // Step timeout in seconds, overriding the target's poll policy
    #[clap(long = "timeout", help = "Step timeout in seconds")]
    pub timeout: Option<u64>,

    #[clap(long = "retry", help = "Number of retries on connection failure")]
    pub retry: Option<u32>,

    #[clap(long = "retry-interval", help = "Retry interval in seconds")]
    pub retry_interval: Option<u64>,

    #[clap(long = "poll-interval", help = "Sentinel poll interval in seconds")]
    pub poll_interval: Option<u64>,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get log level
    pub fn get_log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Poll settings given on the command line
    pub fn poll_overrides(&self) -> PollOverrides {
        PollOverrides {
            interval: self.poll_interval.map(Duration::from_secs),
            timeout: self.timeout.map(Duration::from_secs),
            max_retries: self.retry,
            retry_backoff: self.retry_interval.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_flags_become_overrides() {
        let args = CliArgs::parse_from([
            "lisaprobe",
            "--test",
            "--local",
            "--timeout",
            "90",
            "--retry",
            "0",
        ]);
        let overrides = args.poll_overrides();
        assert_eq!(overrides.timeout, Some(Duration::from_secs(90)));
        assert_eq!(overrides.max_retries, Some(0));
        assert_eq!(overrides.interval, None);
        assert_eq!(args.get_log_level(), "info");
    }

    #[test]
    fn remote_requires_target() {
        assert!(CliArgs::try_parse_from(["lisaprobe", "--test", "--remote"]).is_err());
        assert!(
            CliArgs::try_parse_from(["lisaprobe", "--test", "--local", "--remote", "--target", "t.toml"])
                .is_err()
        );
    }

    #[test]
    fn a_mode_is_mandatory() {
        assert!(CliArgs::try_parse_from(["lisaprobe", "--local"]).is_err());
        assert!(CliArgs::try_parse_from(["lisaprobe", "--parse-only", "--params", "a=1"]).is_ok());
    }
}
