//! Persistence layer modules.

pub mod db;
pub mod retention;
pub mod schema;
pub mod session_store;
