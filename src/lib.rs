//! lisaprobe: parameter parsing, remote step execution and verdict
//! aggregation for Linux guest integration tests.

pub mod aggregator;
pub mod case;
pub mod config;
pub mod connection;
pub mod context;
pub mod outcome;
pub mod params;
pub mod report;
pub mod runner;
pub mod sentinel;
pub mod utils;

pub use aggregator::{aggregate, run_guarded};
pub use outcome::{StepOutcome, StepResult, TestVerdict};
pub use params::{ParameterSet, parse};
pub use runner::{RemoteStep, StepRunner};
