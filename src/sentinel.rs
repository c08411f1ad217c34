//! Sentinel file vocabulary
//!
//! A guest script reports progress by writing a single line into a state
//! file (conventionally `state.txt`). Anything we cannot recognise, including
//! a missing file, means the script is still running.

use std::fmt;

use crate::outcome::StepOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    Running,
    Completed,
    Failed,
    Aborted,
    Skipped,
}

impl SentinelState {
    /// Exact text a guest script writes for this state
    pub fn as_str(self) -> &'static str {
        match self {
            SentinelState::Running => "TestRunning",
            SentinelState::Completed => "TestCompleted",
            SentinelState::Failed => "TestFailed",
            SentinelState::Aborted => "TestAborted",
            SentinelState::Skipped => "TestSkipped",
        }
    }

    /// Reads sentinel content; surrounding whitespace is ignored, unknown text is `None`.
    pub fn from_content(content: &str) -> Option<Self> {
        match content.trim() {
            "TestRunning" => Some(SentinelState::Running),
            "TestCompleted" => Some(SentinelState::Completed),
            "TestFailed" => Some(SentinelState::Failed),
            "TestAborted" => Some(SentinelState::Aborted),
            "TestSkipped" => Some(SentinelState::Skipped),
            _ => None,
        }
    }

    /// Terminal outcome for this state, `None` while still running
    pub fn outcome(self) -> Option<StepOutcome> {
        match self {
            SentinelState::Running => None,
            SentinelState::Completed => Some(StepOutcome::Success),
            SentinelState::Failed | SentinelState::Aborted => Some(StepOutcome::Failure),
            SentinelState::Skipped => Some(StepOutcome::Skipped),
        }
    }
}

impl fmt::Display for SentinelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps fetched sentinel content (or its absence) to an outcome; `None` means pending.
pub fn outcome_of(content: Option<&str>) -> Option<StepOutcome> {
    content
        .and_then(SentinelState::from_content)
        .and_then(SentinelState::outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_maps_to_outcomes() {
        assert_eq!(outcome_of(Some("TestCompleted")), Some(StepOutcome::Success));
        assert_eq!(outcome_of(Some("TestFailed")), Some(StepOutcome::Failure));
        assert_eq!(outcome_of(Some("TestAborted")), Some(StepOutcome::Failure));
        assert_eq!(outcome_of(Some("TestSkipped")), Some(StepOutcome::Skipped));
        assert_eq!(outcome_of(Some("TestRunning")), None);
    }

    #[test]
    fn absent_or_unknown_content_is_pending() {
        assert_eq!(outcome_of(None), None);
        assert_eq!(outcome_of(Some("")), None);
        assert_eq!(outcome_of(Some("testcompleted")), None);
        assert_eq!(outcome_of(Some("TestCompleted now")), None);
    }

    #[test]
    fn trailing_newline_is_ignored() {
        assert_eq!(outcome_of(Some("TestCompleted\n")), Some(StepOutcome::Success));
        assert_eq!(SentinelState::from_content("  TestFailed \r\n"), Some(SentinelState::Failed));
    }

    #[test]
    fn as_str_round_trips() {
        for state in [
            SentinelState::Running,
            SentinelState::Completed,
            SentinelState::Failed,
            SentinelState::Aborted,
            SentinelState::Skipped,
        ] {
            assert_eq!(SentinelState::from_content(state.as_str()), Some(state));
        }
    }
}
