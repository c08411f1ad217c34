//! Local connection manager
//!
//! Runs commands through `sh -c` on this machine and treats "remote" paths as
//! local paths. Used for `testing_type = "local"` and by the integration tests.

use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, warn};

use crate::connection::{CommandOutput, ConnectionError, ConnectionManager, Result};

/// Default budget for a foreground local command
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct LocalConnectionManager;

impl LocalConnectionManager {
    pub fn new() -> Self {
        Self
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    match fs::copy(from, to) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ConnectionError::NotFound(from.display().to_string()))
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to copy {} to {}", from.display(), to.display()))
            .into()),
    }
}

/// Joins a pipe reader; output that is not UTF-8 is decoded lossily
fn collect_output(reader: Option<JoinHandle<io::Result<Vec<u8>>>>, stream: &str) -> Result<String> {
    let Some(handle) = reader else {
        return Ok(String::new());
    };
    let bytes = handle
        .join()
        .map_err(|_| anyhow::anyhow!("{stream} reader panicked"))?
        .with_context(|| format!("Failed to read {stream}"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl ConnectionManager for LocalConnectionManager {
    fn execute_command(&mut self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        debug!("Running local command: {command}");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start command: {command}"))?;

        // Drain the pipes on their own threads so a chatty command cannot block on a full pipe
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let start_time = Instant::now();
        let timeout_duration = timeout.unwrap_or(DEFAULT_TIMEOUT);

        let mut timed_out = false;
        while child.try_wait().context("Failed to poll child process")?.is_none() {
            if start_time.elapsed() > timeout_duration {
                timed_out = true;
                warn!("Local command timed out after {timeout_duration:?}: {command}");
                child.kill().context("Failed to kill timed out command")?;
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        let status = child.wait().context("Failed to wait for child process")?;
        if timed_out {
            // Grandchildren may still hold the pipes open; leave the readers behind
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("command timed out after {timeout_duration:?}"),
                exit_code: -1,
            });
        }
        let stdout = collect_output(stdout_reader, "stdout")?;
        let stderr = collect_output(stderr_reader, "stderr")?;

        let exit_code = status.code().unwrap_or(-1);
        debug!("Local command finished: exit_code={exit_code}");

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        debug!("Copying {} to {remote_path}", local_path.display());
        copy_file(local_path, Path::new(remote_path))
    }

    fn download_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        debug!("Copying {remote_path} to {}", local_path.display());
        copy_file(Path::new(remote_path), local_path)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn captures_output_and_exit_code() {
        let mut conn = LocalConnectionManager::new();
        let output = conn
            .execute_command("echo hello; echo oops >&2; exit 3", None)
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
    }

    #[test]
    fn invalid_utf8_output_is_kept_lossily() {
        let mut conn = LocalConnectionManager::new();
        let output = conn
            .execute_command(r"printf 'ok\377\n'; printf 'disk missing\377\n' >&2; exit 1", None)
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.stdout.starts_with("ok"));
        assert!(output.stderr.contains("disk missing"));
        assert!(output.stderr.contains('\u{FFFD}'));
    }

    #[test]
    fn timeout_kills_the_command() {
        let mut conn = LocalConnectionManager::new();
        let start = Instant::now();
        let output = conn
            .execute_command("sleep 5", Some(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(output.exit_code, -1);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn download_of_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let mut conn = LocalConnectionManager::new();
        let missing = dir.path().join("state.txt");
        let err = conn
            .download_file(missing.to_str().unwrap(), &dir.path().join("out/state.txt"))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotFound(_)));
    }

    #[test]
    fn upload_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("run.sh");
        fs::write(&source, "echo hi\n").unwrap();
        let target = dir.path().join("guest/work/run.sh");

        let mut conn = LocalConnectionManager::new();
        conn.upload_file(&source, target.to_str().unwrap()).unwrap();
        assert_eq!(fs::read_to_string(target).unwrap(), "echo hi\n");
    }

    #[test]
    fn spawned_command_runs_detached() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        let log = dir.path().join("bg.log");
        let mut conn = LocalConnectionManager::new();

        let start = Instant::now();
        conn.spawn_command(
            &format!(
                "sleep 0.2; echo done > {0}.tmp && mv {0}.tmp {0}",
                marker.display()
            ),
            log.to_str().unwrap(),
        )
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !marker.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(fs::read_to_string(marker).unwrap().trim(), "done");
    }
}
