use std::fmt::{Debug, Display};
use std::sync::Mutex;

/// Soft-assertion sink handed to checks and conditions.
///
/// Failed expectations are recorded instead of panicking, so a single
/// evaluation can report why it returned `false`. Every recorded failure is
/// kept in order; [`Assertions::into_message`] joins them.
#[derive(Debug, Default)]
pub struct Assertions {
    failures: Mutex<Vec<String>>,
}

impl Assertions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Always returns `false` so it can end an assertion:
    /// `return g.fail("machine has no nodeRef")`.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.failures.lock().unwrap().push(message.into());
        false
    }

    /// Record `message` unless `ok` holds. Returns `ok`.
    pub fn expect(&self, ok: bool, message: impl Display) -> bool {
        if !ok {
            self.fail(message.to_string());
        }
        ok
    }

    pub fn expect_eq<T: PartialEq + Debug>(&self, actual: T, expected: T, what: &str) -> bool {
        if actual == expected {
            return true;
        }
        self.fail(format!("{what}: expected {expected:?}, got {actual:?}"))
    }

    /// Unwrap `result`, recording the error as a failure.
    pub fn expect_ok<T, E: Display>(&self, result: Result<T, E>, what: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.fail(format!("{what}: {error}"));
                None
            }
        }
    }

    pub fn expect_some<T>(&self, value: Option<T>, what: &str) -> Option<T> {
        if value.is_none() {
            self.fail(format!("{what}: expected a value, found none"));
        }
        value
    }

    pub fn failed(&self) -> bool {
        !self.failures.lock().unwrap().is_empty()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    /// All recorded failures joined with `"; "`, or `None` if nothing failed.
    pub fn into_message(self) -> Option<String> {
        let failures = self.failures.into_inner().unwrap();
        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}
