//! Task definitions discovered by the catalog.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;

/// Priority assigned when a definition declares none.
pub const DEFAULT_PRIORITY: i64 = 5;

/// Immutable unit of declared work.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Task {
    /// Identifier unique within one catalog load.
    pub id: String,
    /// Originating definition file.
    pub source_path: PathBuf,
    /// Lower sorts first.
    pub priority: i64,
    /// Ids of tasks that must have a completed session first.
    pub dependencies: BTreeSet<String>,
    /// Advisory size (line count of the definition).
    pub size_hint: usize,
}

impl Task {
    /// Key used for catalog and batch ordering.
    #[must_use]
    pub fn sort_key(&self) -> (i64, &str) {
        (self.priority, self.id.as_str())
    }
}
