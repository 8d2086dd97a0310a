//! Task orchestration.
//!
//! Covers dispatching single tasks, resolving which tasks are ready,
//! monitoring in-flight sessions, and the batch coordination loop.

pub mod coordinator;
pub mod launcher;
pub mod monitor;
pub mod readiness;
