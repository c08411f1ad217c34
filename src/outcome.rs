//! Step outcomes and test verdicts

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of one remote step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Failure,
    /// The sentinel never resolved within the step's budget
    Timeout,
    Skipped,
}

impl StepOutcome {
    /// Failure and Timeout both count against the test
    pub fn is_failure(self) -> bool {
        matches!(self, StepOutcome::Failure | StepOutcome::Timeout)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Timeout => "timeout",
            StepOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Final verdict handed back to the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestVerdict {
    Pass,
    Fail,
    Aborted,
    Skipped,
}

impl TestVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            TestVerdict::Pass => "PASS",
            TestVerdict::Fail => "FAIL",
            TestVerdict::Aborted => "ABORTED",
            TestVerdict::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(TestVerdict::Pass),
            "FAIL" => Ok(TestVerdict::Fail),
            "ABORTED" => Ok(TestVerdict::Aborted),
            "SKIPPED" => Ok(TestVerdict::Skipped),
            other => Err(format!("unknown verdict `{other}`")),
        }
    }
}

/// What the runner learned about one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub outcome: StepOutcome,
    /// Diagnostic detail for logs and reports; never part of the verdict
    pub message: Option<String>,
    /// Raw sentinel content from the last successful fetch
    pub sentinel: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            step_id: step_id.into(),
            outcome,
            message: None,
            sentinel: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_strings_are_the_harness_vocabulary() {
        for verdict in [
            TestVerdict::Pass,
            TestVerdict::Fail,
            TestVerdict::Aborted,
            TestVerdict::Skipped,
        ] {
            assert_eq!(verdict.as_str().parse::<TestVerdict>(), Ok(verdict));
        }
        assert_eq!(TestVerdict::Aborted.to_string(), "ABORTED");
        assert_eq!(serde_json::to_string(&TestVerdict::Pass).unwrap(), "\"PASS\"");
        assert!("MAYBE".parse::<TestVerdict>().is_err());
    }

    #[test]
    fn timeout_counts_as_failure() {
        assert!(StepOutcome::Timeout.is_failure());
        assert!(StepOutcome::Failure.is_failure());
        assert!(!StepOutcome::Skipped.is_failure());
        assert!(!StepOutcome::Success.is_failure());
    }
}
