//! Result aggregation
//!
//! Folds step outcomes into one verdict. Precedence, highest first:
//! any failure or timeout is FAIL; skips with no success are SKIPPED; at
//! least one success and nothing worse is PASS; nothing at all is ABORTED.
//!
//! [`run_guarded`] is the entry point for a test body. Whatever the body
//! does, returning an error or panicking included, exactly one verdict comes
//! back.

use std::panic::{self, AssertUnwindSafe};

use log::{error, info, warn};

use crate::outcome::{StepOutcome, StepResult, TestVerdict};

pub fn aggregate(outcomes: &[StepOutcome]) -> TestVerdict {
    if outcomes.is_empty() {
        return TestVerdict::Aborted;
    }
    let mut any_success = false;
    let mut any_skipped = false;
    for outcome in outcomes {
        match outcome {
            StepOutcome::Failure | StepOutcome::Timeout => return TestVerdict::Fail,
            StepOutcome::Success => any_success = true,
            StepOutcome::Skipped => any_skipped = true,
        }
    }
    if any_skipped && !any_success {
        TestVerdict::Skipped
    } else {
        TestVerdict::Pass
    }
}

/// Collects step results for one test; single writer, appended in order
#[derive(Debug, Default)]
pub struct ResultCollector {
    results: Vec<StepResult>,
    abnormal_exit: bool,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: StepResult) {
        self.results.push(result);
    }

    /// Records a bare outcome, for checks that run locally
    pub fn record_outcome(&mut self, step_id: &str, outcome: StepOutcome, message: Option<String>) {
        let mut result = StepResult::new(step_id, outcome);
        result.message = message;
        self.record(result);
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn outcomes(&self) -> Vec<StepOutcome> {
        self.results.iter().map(|r| r.outcome).collect()
    }

    /// Marks that the test body ended by error or panic.
    pub fn mark_abnormal_exit(&mut self) {
        self.abnormal_exit = true;
    }

    /// Verdict for what has been recorded so far.
    ///
    /// After an abnormal exit a verdict that would read PASS or SKIPPED is
    /// reported as ABORTED instead: the steps that never ran decide nothing.
    pub fn verdict(&self) -> TestVerdict {
        let verdict = aggregate(&self.outcomes());
        match verdict {
            TestVerdict::Pass | TestVerdict::Skipped if self.abnormal_exit => TestVerdict::Aborted,
            other => other,
        }
    }

    /// Consumes the collector; a verdict is finalized once.
    pub fn finalize(self) -> (TestVerdict, Vec<StepResult>) {
        (self.verdict(), self.results)
    }
}

/// Outcome of [`run_guarded`]
#[derive(Debug)]
pub struct GuardedRun {
    pub verdict: TestVerdict,
    pub results: Vec<StepResult>,
    /// Error or panic message when the body did not finish normally
    pub failure: Option<String>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a test body and always produces a verdict.
///
/// The body records results into the collector as it goes. An `Err` return
/// or a panic is logged with its message and the verdict is computed from
/// what was recorded before it.
pub fn run_guarded<F>(name: &str, body: F) -> GuardedRun
where
    F: FnOnce(&mut ResultCollector) -> anyhow::Result<()>,
{
    let mut collector = ResultCollector::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut collector)));

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!("Test {name} stopped with an error: {e:#}");
            Some(format!("{e:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Test {name} panicked: {message}");
            Some(format!("panic: {message}"))
        }
    };
    if failure.is_some() {
        collector.mark_abnormal_exit();
    }

    let (verdict, results) = collector.finalize();
    if results.is_empty() {
        warn!("Test {name} recorded no step outcome");
    }
    info!("Test {name} verdict: {verdict}");
    GuardedRun {
        verdict,
        results,
        failure,
    }
}
