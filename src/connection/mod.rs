//! Remoting collaborator
//!
//! A `ConnectionManager` runs commands on the guest and moves files to and
//! from it. The step runner only talks to this trait; `LocalConnectionManager`
//! runs everything through `sh -c` on this machine and
//! `SSHConnectionManager` talks to a real guest.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::config::target_config::{TargetConfig, TestingType};
use crate::utils::shell_quote;

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `-1` when the command was killed or timed out
    pub exit_code: i32,
}

/// Failures reported by a connection manager
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection refused, reset, or the session dropped
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The requested remote file does not exist
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectionError {
    /// Connection-level failures are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionError::Transport(_) | ConnectionError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Operations the harness needs from a guest connection
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionManager {
    /// Runs `command` and waits for it, killing it after `timeout` where the
    /// transport supports that.
    fn execute_command(&mut self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput>;

    /// Starts `command` detached on the guest and returns without waiting.
    ///
    /// Output goes to `log_path`. The default implementation wraps the command
    /// in `nohup` and backgrounds it through `execute_command`.
    fn spawn_command(&mut self, command: &str, log_path: &str) -> Result<()> {
        let wrapped = format!(
            "nohup sh -c {} > {} 2>&1 < /dev/null &",
            shell_quote(command),
            shell_quote(log_path)
        );
        let output = self.execute_command(&wrapped, Some(Duration::from_secs(30)))?;
        if output.exit_code != 0 {
            return Err(anyhow::anyhow!(
                "failed to start background command (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )
            .into());
        }
        Ok(())
    }

    /// Copies a local file to `remote_path`, creating parent directories.
    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Copies `remote_path` to a local file. A missing remote file is
    /// `ConnectionError::NotFound`.
    fn download_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Creates the connection manager a target config asks for
pub struct ConnectionFactory;

impl ConnectionFactory {
    /// Builds the connection manager matching the target's `testing_type`
    pub fn create_manager(config: &TargetConfig) -> anyhow::Result<Box<dyn ConnectionManager>> {
        match config.testing_type {
            TestingType::Local => Ok(Box::new(LocalConnectionManager::new())),
            TestingType::Remote => {
                let connection = match config.get_connection() {
                    Some(conn) => conn,
                    None => anyhow::bail!("No connection configuration provided for remote target"),
                };
                Ok(Box::new(SSHConnectionManager::new(connection.clone())))
            }
        }
    }
}

mod local;
pub use local::LocalConnectionManager;

mod ssh;
pub use ssh::SSHConnectionManager;
