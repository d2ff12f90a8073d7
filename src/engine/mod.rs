//! Execution of a single check
//!
//! The dispatcher only knows [`Engine`] and [`Runnable`]. [`check::CheckEngine`]
//! is the stock engine that queries a [`check::Resource`] and records what it
//! reports in the version store.

pub mod check;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::check::Check;

pub use check::{CheckEngine, CheckResponse, Resource};

/// One prepared check run
#[async_trait]
pub trait Runnable: Send {
    /// Run to completion. Cancelling `cancel` must abort promptly.
    async fn run(self: Box<Self>, cancel: CancellationToken);
}

/// Turns a check into something the dispatcher can run
pub trait Engine: Send + Sync + 'static {
    fn new_check(&self, check: Check) -> Box<dyn Runnable>;
}
