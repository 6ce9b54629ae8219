//! Pass/fail accumulation for one scenario run.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub step: String,
    pub reason: String,
}

/// Every checked step of a run, in order. A run is successful when no
/// step failed.
#[derive(Debug, Clone, Default)]
pub struct TestResults {
    scenario: String,
    passed: Vec<String>,
    failures: Vec<Failure>,
}

impl TestResults {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            ..Default::default()
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn pass(&mut self, step: impl Into<String>) {
        let step = step.into();
        tracing::info!(scenario = %self.scenario, %step, "PASS");
        self.passed.push(step);
    }

    pub fn fail(&mut self, step: impl Into<String>, reason: impl fmt::Display) {
        let failure = Failure {
            step: step.into(),
            reason: format!("{reason:#}"),
        };
        tracing::error!(scenario = %self.scenario, step = %failure.step, reason = %failure.reason, "FAIL");
        self.failures.push(failure);
    }

    /// Record `result` as the outcome of `step`, keeping the value on
    /// success.
    pub fn record<T, E: fmt::Display>(&mut self, step: impl Into<String>, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => {
                self.pass(step);
                Some(value)
            }
            Err(err) => {
                self.fail(step, err);
                None
            }
        }
    }

    /// Pass `step` if `condition` holds, otherwise fail it with `reason`.
    pub fn expect(&mut self, step: impl Into<String>, condition: bool, reason: impl FnOnce() -> String) -> bool {
        if condition {
            self.pass(step);
        } else {
            self.fail(step, reason());
        }
        condition
    }

    pub fn was_successful(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn passed(&self) -> &[String] {
        &self.passed
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }
}

impl fmt::Display for TestResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.was_successful() { "PASSED" } else { "FAILED" };
        write!(
            f,
            "{} has {verdict}: {} steps passed, {} failed",
            self.scenario,
            self.passed.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  FAIL {}: {}", failure.step, failure.reason)?;
        }
        Ok(())
    }
}
