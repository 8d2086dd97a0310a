#![forbid(unsafe_code)]

//! Dependency-aware parallel dispatcher for external agent sessions.
//!
//! Tasks are discovered from a directory by the [`catalog`], released once
//! their dependencies have a completed session, dispatched in bounded
//! batches through the [`orchestrator`], and tracked as durable session
//! records in the [`persistence`] layer.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
