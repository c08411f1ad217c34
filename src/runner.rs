//! Remote step runner
//!
//! Runs one command on the guest and waits for it to report completion
//! through a sentinel file. Foreground steps block on the command itself;
//! background steps return a [`StepHandle`] right after dispatch and are
//! driven by [`StepRunner::poll`] or [`StepRunner::wait`].
//!
//! Connection-level failures are retried with a fixed backoff. A sentinel
//! that reports failure is final and never retried. The runner never kills
//! a remote process: once the budget is spent it stops waiting and reports
//! `Timeout`.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::poll_config::PollPolicy;
use crate::connection::{self, ConnectionError, ConnectionManager};
use crate::outcome::{StepOutcome, StepResult};
use crate::sentinel;
use crate::utils::{file_name, remote_join, shell_quote};

/// One remote invocation
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStep {
    pub id: String,
    pub command: String,
    /// Remote state file; without one the exit code decides the outcome
    pub sentinel_path: Option<String>,
    /// Dispatch detached and return a handle immediately
    pub background: bool,
    /// Where a background command's output goes on the guest
    pub log_path: Option<String>,
    /// Budget from dispatch until the sentinel must resolve
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl RemoteStep {
    /// A foreground step without sentinel, timing taken from `policy`
    pub fn new(id: impl Into<String>, command: impl Into<String>, policy: &PollPolicy) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            sentinel_path: None,
            background: false,
            log_path: None,
            timeout: policy.timeout,
            poll_interval: policy.interval,
            max_retries: policy.max_retries,
            retry_backoff: policy.retry_backoff,
        }
    }

    pub fn with_sentinel(mut self, path: impl Into<String>) -> Self {
        self.sentinel_path = Some(path.into());
        self
    }

    pub fn in_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Background output goes next to the sentinel unless set explicitly
    fn effective_log_path(&self) -> String {
        if let Some(path) = &self.log_path {
            return path.clone();
        }
        let dir = self
            .sentinel_path
            .as_deref()
            .and_then(|p| p.rsplit_once('/').map(|(dir, _)| dir))
            .filter(|dir| !dir.is_empty())
            .unwrap_or("/tmp");
        remote_join(dir, &format!("{}.log", artifact_name(&self.id)))
    }
}

/// A dispatched step that has not been reported yet
#[derive(Debug, Clone)]
pub struct StepHandle {
    step: RemoteStep,
    started: Instant,
    /// Set when dispatch itself failed; polling returns it straight away
    dispatch_failure: Option<StepResult>,
}

impl StepHandle {
    pub fn step_id(&self) -> &str {
        &self.step.id
    }

    pub fn step(&self) -> &RemoteStep {
        &self.step
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Done(StepResult),
}

/// Runs `op` until it succeeds, fails with a non-transient error, or
/// `max_retries` retries have been spent, sleeping `backoff` between attempts.
pub fn retry_operation<T, F>(
    description: &str,
    max_retries: u32,
    backoff: Duration,
    mut op: F,
) -> connection::Result<T>
where
    F: FnMut() -> connection::Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                warn!("{description} failed: {e}; retry {attempt}/{max_retries} in {backoff:?}");
                thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Keeps step ids usable as local directory names
fn artifact_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

/// Reports a finished step through the log, Timeout distinct from Failure
fn log_result(result: &StepResult) {
    let detail = result.message.as_deref().unwrap_or("");
    match result.outcome {
        StepOutcome::Success => info!("Step {} succeeded in {:?} {detail}", result.step_id, result.elapsed),
        StepOutcome::Skipped => info!("Step {} skipped {detail}", result.step_id),
        StepOutcome::Timeout => warn!("Step {} timed out after {:?} {detail}", result.step_id, result.elapsed),
        StepOutcome::Failure => error!("Step {} failed after {:?} {detail}", result.step_id, result.elapsed),
    }
}

pub struct StepRunner<'a> {
    connection: &'a mut dyn ConnectionManager,
    /// Local directory for downloaded sentinels and logs
    artifacts_dir: PathBuf,
}

impl<'a> StepRunner<'a> {
    pub fn new(connection: &'a mut dyn ConnectionManager, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            connection,
            artifacts_dir: artifacts_dir.into(),
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Runs a step to completion.
    ///
    /// Background steps are spawned and then waited on, so the caller gets the
    /// same contract either way.
    pub fn run_step(&mut self, step: &RemoteStep) -> StepResult {
        if step.background {
            let handle = self.spawn_step(step);
            return self.wait(&handle);
        }

        let started = Instant::now();
        if let Err(failure) = self.clear_sentinel(step, started) {
            log_result(&failure);
            return failure;
        }

        debug!("Dispatching step {}: {}", step.id, step.command);
        let conn = &mut *self.connection;
        let output = match retry_operation(
            &format!("step {}", step.id),
            step.max_retries,
            step.retry_backoff,
            || conn.execute_command(&step.command, Some(step.timeout)),
        ) {
            Ok(output) => output,
            Err(e) => {
                let result = self.dispatch_failed(step, started, &e);
                log_result(&result);
                return result;
            }
        };

        if step.sentinel_path.is_none() {
            let mut result = match output.exit_code {
                0 => StepResult::new(&step.id, StepOutcome::Success),
                // -1 is what connection managers report for a killed command
                -1 if started.elapsed() >= step.timeout => StepResult::new(&step.id, StepOutcome::Timeout)
                    .with_message(format!("command exceeded {:?}", step.timeout)),
                code => StepResult::new(&step.id, StepOutcome::Failure)
                    .with_message(format!("exit code {code}: {}", output.stderr.trim())),
            };
            result.elapsed = started.elapsed();
            log_result(&result);
            return result;
        }

        if output.exit_code != 0 {
            debug!(
                "Step {} command exited with {}, waiting on sentinel anyway",
                step.id, output.exit_code
            );
        }
        let handle = StepHandle {
            step: step.clone(),
            started,
            dispatch_failure: None,
        };
        self.wait(&handle)
    }

    /// Dispatches a background step and returns without waiting for it.
    pub fn spawn_step(&mut self, step: &RemoteStep) -> StepHandle {
        let started = Instant::now();
        let mut handle = StepHandle {
            step: step.clone(),
            started,
            dispatch_failure: None,
        };

        if step.sentinel_path.is_none() {
            handle.dispatch_failure = Some(
                StepResult::new(&step.id, StepOutcome::Failure)
                    .with_message("background step has no sentinel to poll"),
            );
            return handle;
        }
        if let Err(failure) = self.clear_sentinel(step, started) {
            handle.dispatch_failure = Some(failure);
            return handle;
        }

        let log_path = step.effective_log_path();
        debug!("Spawning step {} in background, output in {log_path}", step.id);
        let conn = &mut *self.connection;
        if let Err(e) = retry_operation(
            &format!("spawn of step {}", step.id),
            step.max_retries,
            step.retry_backoff,
            || conn.spawn_command(&step.command, &log_path),
        ) {
            handle.dispatch_failure = Some(self.dispatch_failed(step, started, &e));
        }
        handle
    }

    /// Checks a dispatched step once.
    pub fn poll(&mut self, handle: &StepHandle) -> PollStatus {
        if let Some(failure) = &handle.dispatch_failure {
            log_result(failure);
            return PollStatus::Done(failure.clone());
        }
        let step = &handle.step;

        let content = match self.fetch_sentinel(step) {
            Ok(content) => content,
            Err(e) => {
                let mut result = StepResult::new(&step.id, StepOutcome::Failure)
                    .with_message(format!("cannot read sentinel: {e}"));
                result.elapsed = handle.elapsed();
                log_result(&result);
                return PollStatus::Done(result);
            }
        };

        if let Some(outcome) = sentinel::outcome_of(content.as_deref()) {
            let mut result = StepResult::new(&step.id, outcome);
            result.sentinel = content.map(|c| c.trim().to_string());
            result.elapsed = handle.elapsed();
            log_result(&result);
            return PollStatus::Done(result);
        }

        let elapsed = handle.elapsed();
        if elapsed >= step.timeout {
            let mut result = StepResult::new(&step.id, StepOutcome::Timeout).with_message(format!(
                "sentinel unresolved after {:?} (last content: {})",
                step.timeout,
                content.as_deref().map(str::trim).unwrap_or("<absent>")
            ));
            result.sentinel = content.map(|c| c.trim().to_string());
            result.elapsed = elapsed;
            log_result(&result);
            return PollStatus::Done(result);
        }

        debug!(
            "Step {} pending after {elapsed:?}: {}",
            step.id,
            content.as_deref().map(str::trim).unwrap_or("<no sentinel yet>")
        );
        PollStatus::Pending
    }

    /// Polls until the step resolves or its budget is spent.
    pub fn wait(&mut self, handle: &StepHandle) -> StepResult {
        loop {
            match self.poll(handle) {
                PollStatus::Done(result) => return result,
                PollStatus::Pending => {
                    let remaining = handle.step.timeout.saturating_sub(handle.elapsed());
                    thread::sleep(handle.step.poll_interval.min(remaining));
                }
            }
        }
    }

    /// Downloads a remote file into this step's artifact directory.
    pub fn fetch_artifact(&mut self, step_id: &str, remote_path: &str) -> connection::Result<PathBuf> {
        let local = self
            .artifacts_dir
            .join(artifact_name(step_id))
            .join(file_name(remote_path));
        self.connection.download_file(remote_path, &local)?;
        Ok(local)
    }

    /// Removes a stale sentinel so an earlier run cannot be mistaken for this one.
    fn clear_sentinel(&mut self, step: &RemoteStep, started: Instant) -> Result<(), StepResult> {
        let Some(path) = step.sentinel_path.as_deref() else {
            return Ok(());
        };
        let command = format!("rm -f {}", shell_quote(path));
        let conn = &mut *self.connection;
        match retry_operation(
            &format!("sentinel cleanup for step {}", step.id),
            step.max_retries,
            step.retry_backoff,
            || conn.execute_command(&command, Some(Duration::from_secs(30))),
        ) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.dispatch_failed(step, started, &e)),
        }
    }

    /// Fetches the sentinel with retries; `Ok(None)` when it does not exist yet.
    fn fetch_sentinel(&mut self, step: &RemoteStep) -> connection::Result<Option<String>> {
        let Some(remote) = step.sentinel_path.as_deref() else {
            return Ok(None);
        };
        let local = self
            .artifacts_dir
            .join(artifact_name(&step.id))
            .join(file_name(remote));

        let conn = &mut *self.connection;
        let fetched = retry_operation(
            &format!("sentinel fetch for step {}", step.id),
            step.max_retries,
            step.retry_backoff,
            || conn.download_file(remote, &local),
        );
        match fetched {
            Ok(()) => {}
            Err(ConnectionError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        let content = fs::read_to_string(&local).map_err(|e| {
            ConnectionError::Other(anyhow::anyhow!("cannot read {}: {e}", local.display()))
        })?;
        Ok(Some(content))
    }

    fn dispatch_failed(&self, step: &RemoteStep, started: Instant, e: &ConnectionError) -> StepResult {
        let message = if e.is_transient() {
            format!("dispatch failed after {} retries: {e}", step.max_retries)
        } else {
            format!("dispatch failed: {e}")
        };
        let mut result = StepResult::new(&step.id, StepOutcome::Failure).with_message(message);
        result.elapsed = started.elapsed();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::aggregate;
    use crate::connection::{CommandOutput, MockConnectionManager};
    use crate::outcome::TestVerdict;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::tempdir;

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(300),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn ok_output() -> CommandOutput {
        CommandOutput::default()
    }

    fn write_sentinel(local: &Path, content: &str) {
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(local, content).unwrap();
    }

    fn expect_cleanup(mock: &mut MockConnectionManager) {
        mock.expect_execute_command()
            .withf(|cmd, _| cmd.starts_with("rm -f"))
            .returning(|_, _| Ok(ok_output()));
    }

    #[test_log::test]
    fn completed_sentinel_is_success() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        expect_cleanup(&mut mock);
        mock.expect_execute_command()
            .withf(|cmd, _| cmd == "bash run.sh")
            .times(1)
            .returning(|_, _| Ok(ok_output()));
        mock.expect_download_file()
            .withf(|remote, _| remote == "/tmp/work/state.txt")
            .returning(|_, local| {
                write_sentinel(local, "TestCompleted\n");
                Ok(())
            });

        let step = RemoteStep::new("basic", "bash run.sh", &fast_policy())
            .with_sentinel("/tmp/work/state.txt");
        let mut runner = StepRunner::new(&mut mock, dir.path());
        let result = runner.run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Success);
        assert_eq!(result.sentinel.as_deref(), Some("TestCompleted"));
        assert!(dir.path().join("basic/state.txt").exists());
        assert_eq!(aggregate(&[result.outcome]), TestVerdict::Pass);
    }

    #[test_log::test]
    fn failed_sentinel_is_not_retried() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        expect_cleanup(&mut mock);
        mock.expect_execute_command()
            .withf(|cmd, _| cmd == "bash run.sh")
            .times(1)
            .returning(|_, _| Ok(ok_output()));
        mock.expect_download_file().times(1).returning(|_, local| {
            write_sentinel(local, "TestFailed");
            Ok(())
        });

        let step = RemoteStep::new("entries", "bash run.sh", &fast_policy())
            .with_sentinel("/tmp/work/state.txt");
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Failure);
        assert_eq!(aggregate(&[result.outcome]), TestVerdict::Fail);
    }

    #[test_log::test]
    fn aborted_and_skipped_sentinels_map_through() {
        for (content, expected) in [
            ("TestAborted", StepOutcome::Failure),
            ("TestSkipped", StepOutcome::Skipped),
        ] {
            let dir = tempdir().unwrap();
            let mut mock = MockConnectionManager::new();
            mock.expect_execute_command().returning(|_, _| Ok(ok_output()));
            mock.expect_download_file().returning(move |_, local| {
                write_sentinel(local, content);
                Ok(())
            });
            let step = RemoteStep::new("s", "bash run.sh", &fast_policy()).with_sentinel("state.txt");
            let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);
            assert_eq!(result.outcome, expected, "sentinel {content}");
        }
    }

    #[test_log::test]
    fn unresolved_sentinel_times_out() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command().returning(|_, _| Ok(ok_output()));
        mock.expect_download_file().returning(|_, local| {
            write_sentinel(local, "TestRunning");
            Ok(())
        });

        let step = RemoteStep::new("slow", "bash run.sh", &fast_policy()).with_sentinel("state.txt");
        let started = Instant::now();
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.sentinel.as_deref(), Some("TestRunning"));
        assert_eq!(aggregate(&[result.outcome]), TestVerdict::Fail);
    }

    #[test_log::test]
    fn missing_sentinel_is_pending_until_timeout() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command().returning(|_, _| Ok(ok_output()));
        mock.expect_download_file()
            .returning(|remote, _| Err(ConnectionError::NotFound(remote.to_string())));

        let step = RemoteStep::new("never", "true", &fast_policy()).with_sentinel("state.txt");
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);
        assert_eq!(result.outcome, StepOutcome::Timeout);
        assert_eq!(result.sentinel, None);
    }

    #[test_log::test]
    fn transient_dispatch_errors_are_retried() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        expect_cleanup(&mut mock);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        mock.expect_execute_command()
            .withf(|cmd, _| cmd == "uname -r")
            .returning(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConnectionError::Transport("connection refused".into()))
                } else {
                    Ok(CommandOutput {
                        stdout: "6.8.0\n".into(),
                        ..Default::default()
                    })
                }
            });

        let step = RemoteStep::new("kernel", "uname -r", &fast_policy());
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test]
    fn exhausted_retries_are_a_failure() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command()
            .times(3)
            .returning(|_, _| Err(ConnectionError::Transport("connection refused".into())));

        let step = RemoteStep::new("down", "true", &fast_policy());
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Failure);
        assert!(result.message.unwrap().contains("after 2 retries"));
    }

    #[test_log::test]
    fn non_transient_errors_fail_without_retry() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command()
            .times(1)
            .returning(|_, _| Err(ConnectionError::Other(anyhow::anyhow!("bad command"))));

        let step = RemoteStep::new("bad", "true", &fast_policy());
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);
        assert_eq!(result.outcome, StepOutcome::Failure);
    }

    #[test_log::test]
    fn exit_code_decides_without_sentinel() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command().returning(|_, _| {
            Ok(CommandOutput {
                stderr: "no such module".into(),
                exit_code: 1,
                ..Default::default()
            })
        });

        let step = RemoteStep::new("lsmod", "modinfo hv_netvsc", &fast_policy());
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);
        assert_eq!(result.outcome, StepOutcome::Failure);
        assert!(result.message.unwrap().contains("no such module"));
    }

    #[test_log::test]
    fn background_step_returns_handle_and_polls() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        expect_cleanup(&mut mock);
        mock.expect_spawn_command()
            .withf(|cmd, log| cmd == "bash server.sh" && log == "/tmp/work/server.log")
            .times(1)
            .returning(|_, _| Ok(()));
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        mock.expect_download_file().returning(move |remote, local| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ConnectionError::NotFound(remote.to_string()))
            } else {
                write_sentinel(local, "TestCompleted");
                Ok(())
            }
        });

        let step = RemoteStep::new("server", "bash server.sh", &fast_policy())
            .with_sentinel("/tmp/work/state.txt")
            .in_background(true);
        let mut runner = StepRunner::new(&mut mock, dir.path());
        let handle = runner.spawn_step(&step);
        assert_eq!(handle.step_id(), "server");

        assert_eq!(runner.poll(&handle), PollStatus::Pending);
        match runner.poll(&handle) {
            PollStatus::Done(result) => assert_eq!(result.outcome, StepOutcome::Success),
            PollStatus::Pending => panic!("expected the second poll to resolve"),
        }
    }

    #[test_log::test]
    fn background_step_without_sentinel_fails() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_spawn_command().never();

        let step = RemoteStep::new("bg", "sleep 60", &fast_policy()).in_background(true);
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);
        assert_eq!(result.outcome, StepOutcome::Failure);
    }

    #[test_log::test]
    fn transient_sentinel_fetch_is_retried() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command().returning(|_, _| Ok(ok_output()));
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        mock.expect_download_file().returning(move |_, local| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ConnectionError::Transport("connection reset".into()))
            } else {
                write_sentinel(local, "TestCompleted");
                Ok(())
            }
        });

        let step = RemoteStep::new("flaky", "bash run.sh", &fast_policy()).with_sentinel("state.txt");
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Success);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test_log::test]
    fn exhausted_sentinel_fetch_retries_are_a_failure() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        mock.expect_execute_command().returning(|_, _| Ok(ok_output()));
        // max_retries is 2: one attempt plus two retries
        mock.expect_download_file()
            .times(3)
            .returning(|_, _| Err(ConnectionError::Auth("permission denied".into())));

        let step = RemoteStep::new("locked", "bash run.sh", &fast_policy()).with_sentinel("state.txt");
        let result = StepRunner::new(&mut mock, dir.path()).run_step(&step);

        assert_eq!(result.outcome, StepOutcome::Failure);
        let message = result.message.unwrap();
        assert!(message.contains("cannot read sentinel"), "{message}");
        assert!(message.contains("permission denied"), "{message}");
    }

    #[test_log::test]
    fn transient_spawn_errors_are_retried() {
        let dir = tempdir().unwrap();
        let mut mock = MockConnectionManager::new();
        expect_cleanup(&mut mock);
        let spawns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawns);
        mock.expect_spawn_command().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ConnectionError::Transport("broken pipe".into()))
            } else {
                Ok(())
            }
        });
        mock.expect_download_file().returning(|_, local| {
            write_sentinel(local, "TestCompleted");
            Ok(())
        });

        let step = RemoteStep::new("server", "bash server.sh", &fast_policy())
            .with_sentinel("/tmp/work/state.txt")
            .in_background(true);
        let mut runner = StepRunner::new(&mut mock, dir.path());
        let handle = runner.spawn_step(&step);
        let result = runner.wait(&handle);

        assert_eq!(result.outcome, StepOutcome::Success);
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_operation_stops_on_success() {
        let mut attempts = 0;
        let value = retry_operation("op", 5, Duration::ZERO, || {
            attempts += 1;
            if attempts < 3 {
                Err(ConnectionError::Auth("denied".into()))
            } else {
                Ok(attempts)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn artifact_names_are_path_safe() {
        assert_eq!(artifact_name("client/server run"), "client_server_run");
        assert_eq!(artifact_name("step-1.a"), "step-1.a");
    }
}
