//! Explicit per-test context
//!
//! Everything a test body needs to know about its environment travels in a
//! `TestContext`: the target, the parsed parameters, where artifacts go, the
//! poll policy and whatever opaque VM data the harness supplied.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::config::poll_config::{PollOverrides, PollPolicy};
use crate::config::target_config::TargetConfig;
use crate::params::ParameterSet;
use crate::runner::RemoteStep;
use crate::utils::{DEFAULT_SENTINEL, remote_join};

#[derive(Debug, Clone)]
pub struct TestContext {
    pub name: String,
    pub target: TargetConfig,
    pub params: ParameterSet,
    /// Local directory for downloaded sentinels, logs and the report
    pub artifacts_dir: PathBuf,
    pub poll: PollPolicy,
    /// Harness-provided VM data (role name, VM name, ...), never interpreted here
    pub vm_data: IndexMap<String, String>,
}

impl TestContext {
    pub fn new(name: impl Into<String>, target: TargetConfig, params: ParameterSet) -> Self {
        let name = name.into();
        let poll = target.poll;
        Self {
            artifacts_dir: PathBuf::from("artifacts").join(&name),
            name,
            target,
            params,
            poll,
            vm_data: IndexMap::new(),
        }
    }

    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = dir.into();
        self
    }

    pub fn with_poll_overrides(mut self, overrides: &PollOverrides) -> Self {
        self.poll = self.poll.with_overrides(overrides);
        self
    }

    pub fn with_vm_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vm_data.insert(key.into(), value.into());
        self
    }

    /// Path of `relative` inside the target's working directory on the guest
    pub fn remote_path(&self, relative: &str) -> String {
        remote_join(&self.target.remote_dir, relative)
    }

    /// Conventional sentinel location for this target
    pub fn default_sentinel(&self) -> String {
        self.remote_path(DEFAULT_SENTINEL)
    }

    /// A foreground step run from the target's working directory
    pub fn step(&self, id: &str, command: &str) -> RemoteStep {
        RemoteStep::new(
            id,
            format!("cd {} && {command}", crate::utils::shell_quote(&self.target.remote_dir)),
            &self.poll,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::parse;
    use std::time::Duration;

    #[test]
    fn steps_run_in_remote_dir_with_context_policy() {
        let mut target = TargetConfig::local();
        target.remote_dir = "/home/lisa/work".into();
        let ctx = TestContext::new("net", target, parse("NIC=eth0"))
            .with_poll_overrides(&PollOverrides {
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            })
            .with_vm_data("RoleName", "client");

        let step = ctx.step("ping", "ping -c 1 8.8.8.8");
        assert_eq!(step.command, "cd '/home/lisa/work' && ping -c 1 8.8.8.8");
        assert_eq!(step.timeout, Duration::from_secs(5));
        assert_eq!(ctx.default_sentinel(), "/home/lisa/work/state.txt");
        assert_eq!(ctx.artifacts_dir, PathBuf::from("artifacts/net"));
        assert_eq!(ctx.vm_data.get("RoleName").map(String::as_str), Some("client"));
    }
}
