use super::context::Cancellation;

/// Terminal outcome of a wait that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The check was observed false before the condition held.
    #[error("check failed before condition succeeded: {message}")]
    CheckFailed { attempts: u32, message: String },

    /// An attempt asked the scheduler to stop retrying.
    #[error("stopped trying after {attempts} attempt(s): {message}")]
    StoppedTrying { attempts: u32, message: String },

    /// The context was cancelled explicitly.
    #[error(
        "condition did not succeed before the context was cancelled{}",
        last_message(.last)
    )]
    Cancelled { attempts: u32, last: Option<String> },

    /// The context deadline elapsed.
    #[error(
        "condition did not succeed before the context was cancelled (deadline exceeded after {attempts} attempt(s)){}",
        last_message(.last)
    )]
    TimedOut { attempts: u32, last: Option<String> },
}

fn last_message(last: &Option<String>) -> String {
    match last {
        Some(message) => format!(": {message}"),
        None => String::new(),
    }
}

impl WaitError {
    pub(crate) fn from_cancellation(
        cancellation: Cancellation,
        attempts: u32,
        last: Option<String>,
    ) -> Self {
        match cancellation {
            Cancellation::Cancelled => Self::Cancelled { attempts, last },
            Cancellation::DeadlineExceeded => Self::TimedOut { attempts, last },
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CheckFailed { attempts, .. }
            | Self::StoppedTrying { attempts, .. }
            | Self::Cancelled { attempts, .. }
            | Self::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// True for explicit cancellation and deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_failure_message_carries_check_text() {
        let err = WaitError::CheckFailed {
            attempts: 2,
            message: "machine worker-a is Failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "check failed before condition succeeded: machine worker-a is Failed"
        );
        assert!(!err.is_cancellation());
        assert_eq!(err.attempts(), 2);
    }

    #[test]
    fn cancellation_message_appends_last_condition_failure() {
        let err = WaitError::Cancelled {
            attempts: 4,
            last: Some("1 of 3 machines running".into()),
        };
        assert_eq!(
            err.to_string(),
            "condition did not succeed before the context was cancelled: 1 of 3 machines running"
        );

        let bare = WaitError::Cancelled {
            attempts: 0,
            last: None,
        };
        assert_eq!(
            bare.to_string(),
            "condition did not succeed before the context was cancelled"
        );
    }

    #[test]
    fn timeout_is_a_cancellation() {
        let err = WaitError::from_cancellation(Cancellation::DeadlineExceeded, 10, None);
        assert!(matches!(err, WaitError::TimedOut { attempts: 10, .. }));
        assert!(err.is_cancellation());
        assert!(err.to_string().contains("deadline exceeded after 10 attempt(s)"));
    }
}
