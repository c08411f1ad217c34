//! Configuration for the harness: command line, target and poll policy.

pub mod cli_args;
pub mod connection_config;
pub mod poll_config;
pub mod target_config;

pub use cli_args::CliArgs;
pub use connection_config::ConnectionConfig;
pub use poll_config::PollPolicy;
pub use target_config::{TargetConfig, TestingType};
