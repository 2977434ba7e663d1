//! # Run error kinds
//!
//! Every way a step or a run can fail, with the message formats the rest
//! of the system (traces, events, persisted results) relies on. Step
//! handlers fold most of these into `StepOutcome.error` strings; the
//! variants that alter control flow (`Stopped`, `DeadlineExceeded`) are
//! matched on by the orchestrator to decide whether to drop straight to
//! the `after` section.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// Malformed step shape discovered at dispatch time. The message names
    /// the missing or invalid field.
    #[error("{0}")]
    StepValidation(String),

    /// A per-step deadline (retry block, wait_for, choose_dropdown) ran out.
    #[error("Timeout after {0}ms")]
    StepTimeout(u64),

    /// A BrowserClient call failed. Wraps the transport's message.
    #[error("{0}")]
    BrowserTransport(String),

    /// An `assert`-family expression stayed falsy. Carries the expression
    /// or the last evaluation error.
    #[error("{0}")]
    AssertionFailure(String),

    /// `network_check` found responses with status >= 400.
    #[error("Network errors: {0}")]
    NetworkCheckFailure(String),

    /// `console_check` found messages at forbidden levels.
    #[error("Console messages found: {0}")]
    ConsoleCheckFailure(String),

    /// External stop command.
    #[error("Stopped by user")]
    Stopped,

    /// The whole-run deadline passed. Handled like a stop: remaining steps
    /// are abandoned and `after` runs.
    #[error("Timeout after {0}ms")]
    DeadlineExceeded(u64),

    /// A nested `run_test` failed.
    #[error("{0}")]
    SubTestFailure(String),

    /// `run_test` re-entered a test that is still on the visited stack.
    #[error("Cycle detected: test \"{0}\"")]
    CycleDetected(String),
}

impl RunError {
    /// Builds the sub-test failure message:
    /// `Sub-test "ID" failed at step N (label): cause`.
    pub fn sub_test(id: &str, step: usize, label: Option<&str>, cause: &str) -> Self {
        let message = match label {
            Some(label) => format!(
                "Sub-test \"{}\" failed at step {} ({}): {}",
                id, step, label, cause
            ),
            None => format!("Sub-test \"{}\" failed at step {}: {}", id, step, cause),
        };
        RunError::SubTestFailure(message)
    }

    /// True for the variants that abort the run rather than a single step.
    pub fn stops_run(&self) -> bool {
        matches!(self, RunError::Stopped | RunError::DeadlineExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_message() {
        assert_eq!(RunError::Stopped.to_string(), "Stopped by user");
    }

    #[test]
    fn test_timeout_messages() {
        assert_eq!(RunError::StepTimeout(500).to_string(), "Timeout after 500ms");
        assert_eq!(
            RunError::DeadlineExceeded(30_000).to_string(),
            "Timeout after 30000ms"
        );
    }

    #[test]
    fn test_sub_test_message_with_label() {
        let err = RunError::sub_test("login", 2, Some("Submit"), "element not found");
        assert_eq!(
            err.to_string(),
            "Sub-test \"login\" failed at step 2 (Submit): element not found"
        );
    }

    #[test]
    fn test_sub_test_message_without_label() {
        let err = RunError::sub_test("login", 0, None, "boom");
        assert_eq!(err.to_string(), "Sub-test \"login\" failed at step 0: boom");
    }

    #[test]
    fn test_cycle_message() {
        assert_eq!(
            RunError::CycleDetected("smoke".to_string()).to_string(),
            "Cycle detected: test \"smoke\""
        );
    }

    #[test]
    fn test_stop_classification() {
        assert!(RunError::Stopped.stops_run());
        assert!(RunError::DeadlineExceeded(1).stops_run());
        assert!(!RunError::AssertionFailure("x".into()).stops_run());
    }
}
