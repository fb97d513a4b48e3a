//! Bounded polling of an eventually-consistent cluster.
//!
//! [`Eventually`] re-runs an attempt on a fixed interval until it succeeds or
//! its [`WaitContext`] ends. [`run_check_until`] layers a check/condition pair
//! on top: the check must keep holding while the condition is awaited.

mod assertions;
mod check;
mod context;
mod error;
mod eventually;

pub use assertions::Assertions;
pub use check::{UNRECORDED_FAILURE, assert_check_until, run_check_until, run_check_until_every};
pub use context::{Cancellation, WaitContext};
pub use error::WaitError;
pub use eventually::{AttemptError, DEFAULT_POLL_INTERVAL, Eventually};
