use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use log::{error, info, warn};

use lisaprobe::case::{CaseDefinition, execute_case};
use lisaprobe::config::{CliArgs, TargetConfig, TestingType};
use lisaprobe::connection::ConnectionFactory;
use lisaprobe::context::TestContext;
use lisaprobe::outcome::TestVerdict;
use lisaprobe::params::{self, ParameterSet};
use lisaprobe::report::TestReport;

fn main() {
    let args = CliArgs::parse_args();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.get_log_level()))
        .format_timestamp_secs()
        .init();

    if args.parse_only {
        match load_params(&args) {
            Ok(params) => match serde_json::to_string_pretty(&params) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Failed to render parameters: {e}"),
            },
            Err(e) => {
                error!("{e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    let verdict = run_test(&args);
    // The verdict is the result; the exit code only reports usage errors.
    println!("{verdict}");
}

fn load_params(args: &CliArgs) -> Result<ParameterSet> {
    let raw = match (&args.params, &args.params_file) {
        (Some(raw), _) => raw.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameter file {}", path.display()))?,
        (None, None) => String::new(),
    };
    Ok(params::parse(&raw))
}

fn load_target(args: &CliArgs) -> Result<TargetConfig> {
    let mut target = match &args.target {
        Some(path) => TargetConfig::from_file(path)
            .with_context(|| format!("Failed to load target config {}", path.display()))?,
        None => TargetConfig::local(),
    };
    if args.local {
        target.testing_type = TestingType::Local;
    } else if args.remote {
        target.testing_type = TestingType::Remote;
    }
    Ok(target)
}

fn build_context(args: &CliArgs) -> Result<(CaseDefinition, TestContext)> {
    let case_path = args
        .case
        .as_ref()
        .context("No test case given, use --case <FILE>")?;
    let case = CaseDefinition::from_file(case_path)?;
    let target = load_target(args)?;
    let params = load_params(args)?;

    let artifacts_dir = args
        .artifacts_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("artifacts").join(&case.name));
    let ctx = TestContext::new(case.name.clone(), target, params)
        .with_artifacts_dir(artifacts_dir)
        .with_poll_overrides(&args.poll_overrides());
    Ok((case, ctx))
}

fn run_test(args: &CliArgs) -> TestVerdict {
    let started_at = Local::now();
    let (case, ctx) = match build_context(args) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{e:#}");
            return TestVerdict::Aborted;
        }
    };
    if let Some(description) = &case.description {
        info!("{}: {description}", case.name);
    }

    let mut connection = match ConnectionFactory::create_manager(&ctx.target) {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to create connection: {e:#}");
            return TestVerdict::Aborted;
        }
    };

    let run = execute_case(&case, &ctx, connection.as_mut());
    if let Err(e) = connection.close() {
        warn!("Failed to close connection: {e}");
    }

    let verdict = run.verdict;
    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| ctx.artifacts_dir.join("report.json"));
    let report = TestReport::from_run(&case.name, run, ctx.params, ctx.vm_data, started_at);
    if let Err(e) = report.write_to(&report_path) {
        warn!("Failed to write report: {e:#}");
    }
    verdict
}
