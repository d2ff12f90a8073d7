//! Resource version tracking and check scheduling for a CI orchestrator
//!
//! - [`db`]: version store, checking lock and check jobs, shared by every
//!   process through one SQLite file
//! - [`engine`]: runs a single check against a [`engine::Resource`]
//! - [`dispatcher`]: launches started checks at most once per process
//! - [`config`], [`logging`], [`metrics`]: ambient setup

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
