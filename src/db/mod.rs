//! Persistent state shared by every scheduler process
//!
//! All processes open the same SQLite file. Per-process state lives in the
//! dispatcher; everything here is visible cluster-wide.
//!
//! # Modules
//!
//! - [`database`]: Connection handling, schema and migrations
//! - [`resource_config`]: Version store: spaces, versions and check order
//! - [`resource_config_scope`]: Check rate gate and checking lock per scope
//! - [`lock`]: Lease-backed named locks
//! - [`check`]: Check jobs and their status transitions
//! - [`types`]: Version, space and metadata types

pub mod check;
pub mod database;
pub mod lock;
pub mod resource_config;
pub mod resource_config_scope;
pub mod types;

pub use check::{Check, CheckFactory, CheckStatus, NewCheck, SqliteCheckFactory};
pub use database::Database;
pub use lock::{LeaseLock, Lock, LockFactory, LockId};
pub use resource_config::{ResourceConfig, ResourceConfigFactory, ResourceVersion};
pub use resource_config_scope::ResourceConfigScope;
pub use types::{Metadata, MetadataField, ResourceRef, Space, SpaceVersion, Version};
