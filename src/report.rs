//! JSON test report
//!
//! One report per test run: verdict, timing, parameters and the per-step
//! results. Diagnostic detail lives here and in the log, never in the verdict.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use log::info;
use serde::Serialize;

use crate::aggregator::GuardedRun;
use crate::outcome::{StepResult, TestVerdict};
use crate::params::ParameterSet;

#[derive(Debug, Serialize)]
pub struct TestReport {
    pub name: String,
    pub verdict: TestVerdict,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub parameters: ParameterSet,
    pub vm_data: IndexMap<String, String>,
    pub steps: Vec<StepResult>,
    /// Error or panic that ended the test body early
    pub failure: Option<String>,
}

impl TestReport {
    pub fn from_run(
        name: &str,
        run: GuardedRun,
        parameters: ParameterSet,
        vm_data: IndexMap<String, String>,
        started_at: DateTime<Local>,
    ) -> Self {
        Self {
            name: name.to_string(),
            verdict: run.verdict,
            started_at,
            finished_at: Local::now(),
            parameters,
            vm_data,
            steps: run.results,
            failure: run.failure,
        }
    }

    /// Writes the report as pretty JSON, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let mut file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(json.as_bytes())?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::StepOutcome;
    use crate::params::parse;
    use tempfile::tempdir;

    #[test]
    fn report_serializes_verdict_and_steps() {
        let dir = tempdir().unwrap();
        let run = GuardedRun {
            verdict: TestVerdict::Fail,
            results: vec![
                StepResult::new("setup", StepOutcome::Success),
                StepResult::new("run", StepOutcome::Timeout).with_message("sentinel unresolved"),
            ],
            failure: None,
        };
        let report = TestReport::from_run(
            "kvp",
            run,
            parse("Key=foo;SCSI_1=a"),
            IndexMap::new(),
            Local::now(),
        );
        let path = dir.path().join("nested/report.json");
        report.write_to(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["verdict"], "FAIL");
        assert_eq!(value["steps"][1]["outcome"], "timeout");
        assert_eq!(value["steps"][1]["message"], "sentinel unresolved");
        assert_eq!(value["parameters"]["values"]["Key"], "foo");
        assert_eq!(value["parameters"]["aliases"]["SCSI"][0]["key"], "SCSI_1");
    }
}
