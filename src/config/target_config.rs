//! Represents the configuration for the guest a test runs against.

use crate::config::connection_config::ConnectionConfig;
use crate::config::poll_config::PollPolicy;
use crate::utils;
/// This struct is deserialized from a TOML file with `utils::read_toml_from_file`.
/// It contains the following fields:
/// - `testing_type`: `local` to run steps through `sh -c` on this machine, or `remote` for SSH.
/// - `connection`: the SSH connection, required when `testing_type` is `remote`.
/// - `poll`: the default poll policy for every step run against this target.
/// - `remote_dir`: working directory on the guest where scripts are uploaded and run.
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestingType {
    #[serde(alias = "locally")]
    Local,
    #[serde(alias = "ssh")]
    Remote,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub testing_type: TestingType,

    #[serde(default)]
    pub connection: Option<ConnectionConfig>,

    #[serde(default)]
    pub poll: PollPolicy,

    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

fn default_remote_dir() -> String {
    "/tmp/lisaprobe".to_string()
}

impl TargetConfig {
    /// A local target with default poll policy, used when no target file is given
    pub fn local() -> Self {
        Self {
            testing_type: TestingType::Local,
            connection: None,
            poll: PollPolicy::default(),
            remote_dir: default_remote_dir(),
        }
    }

    /// Connection settings, present for remote targets
    pub fn get_connection(&self) -> Option<&ConnectionConfig> {
        self.connection.as_ref()
    }

    /// Reads a target from a TOML file
    pub fn from_file(file_path: &Path) -> anyhow::Result<Self> {
        utils::read_toml_from_file(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn remote_target_with_poll_table() {
        let config: TargetConfig = toml::from_str(
            r#"
testing_type = "ssh"
remote_dir = "/home/lisa"

[connection]
ip = "192.168.1.20"
port = 2222
username = "lisa"
password = "secret"

[poll]
interval = "1s"
timeout = "30s"
"#,
        )
        .unwrap();
        assert_eq!(config.testing_type, TestingType::Remote);
        assert_eq!(config.remote_dir, "/home/lisa");
        let connection = config.get_connection().unwrap();
        assert_eq!(connection.port, 2222);
        assert_eq!(connection.password.as_deref(), Some("secret"));
        assert_eq!(config.poll.interval, Duration::from_secs(1));
        assert_eq!(config.poll.timeout, Duration::from_secs(30));
    }

    #[test]
    fn local_target_uses_defaults() {
        let config: TargetConfig = toml::from_str("testing_type = \"locally\"").unwrap();
        assert_eq!(config.testing_type, TestingType::Local);
        assert!(config.connection.is_none());
        assert_eq!(config.poll, PollPolicy::default());
        assert_eq!(config.remote_dir, "/tmp/lisaprobe");
    }
}
