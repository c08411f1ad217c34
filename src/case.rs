//! Test case definitions
//!
//! A case file (TOML, or YAML by extension) names the parameters a test
//! needs, the files to put on the guest and the steps to run there:
//!
//! ```toml
//! name = "kvp-basic"
//! required_params = ["Key", "Value"]
//! upload = ["kvp_basic.sh"]
//!
//! [[steps]]
//! id = "kvp"
//! command = "bash kvp_basic.sh {{ Key }}"
//! sentinel = "state.txt"
//! timeout = "5m"
//! ```
//!
//! Foreground steps run in file order. Background steps are spawned and keep
//! running while later steps execute; they are polled round-robin once the
//! last step has been dispatched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::aggregator::{GuardedRun, ResultCollector, run_guarded};
use crate::config::poll_config::{PollOverrides, PollPolicy};
use crate::connection::ConnectionManager;
use crate::context::TestContext;
use crate::outcome::{StepOutcome, StepResult};
use crate::params::ParamError;
use crate::runner::{PollStatus, RemoteStep, StepHandle, StepRunner, retry_operation};
use crate::utils::{CONSTANTS_FILE, file_name, read_config_file, shell_quote};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Parameters that must be present before anything runs
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Report ABORTED instead of FAIL when a required parameter is missing
    #[serde(default)]
    pub abort_if_missing: bool,
    /// Local files copied into the target's working directory
    #[serde(default)]
    pub upload: Vec<PathBuf>,
    /// Upload the parameters as `constants.sh`
    #[serde(default = "default_true")]
    pub write_constants: bool,
    #[serde(default)]
    pub poll: PollOverrides,
    pub steps: Vec<StepDefinition>,
    /// Remote files downloaded into the artifacts directory afterwards
    #[serde(default)]
    pub collect: Vec<String>,

    /// Directory relative upload paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub command: String,
    /// Sentinel path, relative to the target's working directory
    #[serde(default)]
    pub sentinel: Option<String>,
    #[serde(default)]
    pub background: bool,
    /// Skip this step when the named parameter is absent
    #[serde(default)]
    pub requires_param: Option<String>,
    #[serde(flatten)]
    pub poll: PollOverrides,
}

impl CaseDefinition {
    /// Loads a case file; relative uploads resolve against its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut case: CaseDefinition = read_config_file(path)
            .with_context(|| format!("Failed to load test case {}", path.display()))?;
        case.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail!("Test case {} defines no steps", self.name);
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                bail!("Test case {} has duplicate step id {}", self.name, step.id);
            }
            if step.background && step.sentinel.is_none() {
                bail!("Background step {} needs a sentinel", step.id);
            }
        }
        // Collected files land side by side in one artifacts directory
        let mut collected = std::collections::HashSet::new();
        for path in &self.collect {
            if !collected.insert(file_name(path)) {
                bail!(
                    "Test case {} collects more than one file named {}",
                    self.name,
                    file_name(path)
                );
            }
        }
        Ok(())
    }
}

/// Replaces every `{{ Key }}` with the parameter (or VM data) value.
pub fn substitute(template: &str, ctx: &TestContext) -> Result<String, ParamError> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        match ctx.params.get(key).or_else(|| ctx.vm_data.get(key).map(String::as_str)) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(ParamError::Missing(key)),
        None => Ok(rendered.into_owned()),
    }
}

impl StepDefinition {
    fn to_remote_step(&self, ctx: &TestContext, policy: &PollPolicy) -> Result<RemoteStep, ParamError> {
        let command = substitute(&self.command, ctx)?;
        let mut step = ctx
            .step(&self.id, &command)
            .in_background(self.background);
        let policy = policy.with_overrides(&self.poll);
        step.timeout = policy.timeout;
        step.poll_interval = policy.interval;
        step.max_retries = policy.max_retries;
        step.retry_backoff = policy.retry_backoff;
        if let Some(sentinel) = &self.sentinel {
            step = step.with_sentinel(ctx.remote_path(sentinel));
        }
        Ok(step)
    }

    fn is_enabled(&self, ctx: &TestContext) -> bool {
        match &self.requires_param {
            Some(key) => ctx.params.contains_key(key) || ctx.params.alias_count(key) > 0,
            None => true,
        }
    }
}

/// Creates the working directory and uploads constants and case files.
fn prepare_target(
    case: &CaseDefinition,
    ctx: &TestContext,
    connection: &mut dyn ConnectionManager,
) -> Result<()> {
    let policy = ctx.poll.with_overrides(&case.poll);
    let remote_dir = &ctx.target.remote_dir;

    let mkdir = format!("mkdir -p {}", shell_quote(remote_dir));
    let output = retry_operation("create working directory", policy.max_retries, policy.retry_backoff, || {
        connection.execute_command(&mkdir, None)
    })?;
    if output.exit_code != 0 {
        bail!("Cannot create {remote_dir}: {}", output.stderr.trim());
    }

    if case.write_constants {
        fs::create_dir_all(&ctx.artifacts_dir)
            .with_context(|| format!("Failed to create {}", ctx.artifacts_dir.display()))?;
        let local = ctx.artifacts_dir.join(CONSTANTS_FILE);
        fs::write(&local, ctx.params.to_constants_sh())
            .with_context(|| format!("Failed to write {}", local.display()))?;
        let remote = ctx.remote_path(CONSTANTS_FILE);
        debug!("Uploading {} to {remote}", local.display());
        retry_operation("constants upload", policy.max_retries, policy.retry_backoff, || {
            connection.upload_file(&local, &remote)
        })?;
    }

    for file in &case.upload {
        let local = case.base_dir.join(file);
        let Some(name) = local.file_name().and_then(|n| n.to_str()) else {
            bail!("Invalid upload path {}", local.display());
        };
        let remote = ctx.remote_path(name);
        debug!("Uploading {} to {remote}", local.display());
        retry_operation("case file upload", policy.max_retries, policy.retry_backoff, || {
            connection.upload_file(&local, &remote)
        })
        .with_context(|| format!("Failed to upload {}", local.display()))?;
    }
    Ok(())
}

/// Polls outstanding background steps round-robin until all have resolved.
fn drain_background(runner: &mut StepRunner, mut pending: Vec<StepHandle>, collector: &mut ResultCollector) {
    while !pending.is_empty() {
        let mut unresolved = Vec::with_capacity(pending.len());
        for handle in pending {
            match runner.poll(&handle) {
                PollStatus::Done(result) => collector.record(result),
                PollStatus::Pending => unresolved.push(handle),
            }
        }
        pending = unresolved;
        if let Some(nap) = pending.iter().map(|h| h.step().poll_interval).min() {
            thread::sleep(nap);
        }
    }
}

fn collect_artifacts(case: &CaseDefinition, ctx: &TestContext, runner: &mut StepRunner) {
    for path in &case.collect {
        match runner.fetch_artifact("collected", &ctx.remote_path(path)) {
            Ok(local) => info!("Collected {path} into {}", local.display()),
            Err(e) => warn!("Cannot collect {path}: {e}"),
        }
    }
}

/// Runs a case against a connection and returns its verdict.
pub fn execute_case(
    case: &CaseDefinition,
    ctx: &TestContext,
    connection: &mut dyn ConnectionManager,
) -> GuardedRun {
    info!("Running test case {} ({} steps)", case.name, case.steps.len());
    run_guarded(&case.name, |collector| {
        for key in &case.required_params {
            if let Err(e) = ctx.params.require(key) {
                if case.abort_if_missing {
                    bail!(e);
                }
                collector.record_outcome("parameters", StepOutcome::Failure, Some(e.to_string()));
                return Ok(());
            }
        }

        prepare_target(case, ctx, connection)?;

        let policy = ctx.poll.with_overrides(&case.poll);
        let mut runner = StepRunner::new(connection, &ctx.artifacts_dir);
        let mut background = Vec::new();
        for definition in &case.steps {
            if !definition.is_enabled(ctx) {
                let reason = format!(
                    "parameter {} not set",
                    definition.requires_param.as_deref().unwrap_or_default()
                );
                info!("Skipping step {}: {reason}", definition.id);
                collector.record(StepResult::new(&definition.id, StepOutcome::Skipped).with_message(reason));
                continue;
            }
            let step = match definition.to_remote_step(ctx, &policy) {
                Ok(step) => step,
                Err(e) => {
                    warn!("Step {} cannot be built: {e}", definition.id);
                    collector.record(StepResult::new(&definition.id, StepOutcome::Failure).with_message(e.to_string()));
                    continue;
                }
            };
            if step.background {
                background.push(runner.spawn_step(&step));
            } else {
                collector.record(runner.run_step(&step));
            }
        }

        drain_background(&mut runner, background, collector);
        collect_artifacts(case, ctx, &mut runner);
        Ok(())
    })
}
