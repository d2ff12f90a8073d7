//! Per-process check dispatch
//!
//! A [`Checker`] turns the list of started checks into at most one running
//! unit per check id. [`run_periodically`] is the timer loop a host process
//! drives it with.

pub mod checker;
pub mod running;

pub use checker::{Checker, run_periodically};
pub use running::{RunningCheckGuard, RunningChecks};
