//! Task catalog: discovers task definition files and extracts metadata.
//!
//! Each file matching the configured pattern yields at most one [`Task`].
//! Only two metadata lines are recognised (`priority: <int>` and
//! `depends on: <id>, <id>`); the rest of the file is opaque context
//! handed to the executor verbatim.
//!
//! Files that cannot be used are skipped and reported as [`ParseWarning`]s
//! so one bad definition never aborts the whole load.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CatalogConfig;
use crate::models::task::{Task, DEFAULT_PRIORITY};
use crate::{AppError, Result};

const PRIORITY_KEY: &str = "priority";
const DEPENDS_KEY: &str = "depends on";
const ID_PREFIX: &str = "story_";

/// Why a definition file was skipped or flagged.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// File could not be read as UTF-8 text.
    Unreadable,
    /// `priority:` value is not an integer.
    InvalidPriority,
    /// Another file already produced the same task id.
    DuplicateId,
    /// A dependency names an id absent from this catalog.
    UnknownDependency,
}

/// Non-fatal diagnostic recorded during a catalog load.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParseWarning {
    /// File the warning refers to.
    pub path: PathBuf,
    /// Warning classification.
    pub kind: WarningKind,
    /// Human-readable detail.
    pub message: String,
}

/// Result of one catalog load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    /// Tasks ordered by `(priority, id)`.
    pub tasks: Vec<Task>,
    /// Files skipped or flagged during the load.
    pub warnings: Vec<ParseWarning>,
}

impl Catalog {
    /// Look up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Tasks named in `ids`, in catalog order. An empty `ids` selects all.
    ///
    /// Dependencies of selected tasks are kept as declared, so a selected
    /// task whose dependency is outside the selection still waits for it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if an id is not in the catalog.
    pub fn select(&self, ids: &[String]) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(self.tasks.clone());
        }
        if let Some(missing) = ids.iter().find(|id| self.get(id).is_none()) {
            return Err(AppError::NotFound(format!("task {missing} not in catalog")));
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .tasks
            .iter()
            .filter(|task| wanted.contains(task.id.as_str()))
            .cloned()
            .collect())
    }
}

/// Load all task definitions in `dir` matching `config.pattern`.
///
/// # Errors
///
/// Returns `AppError::Catalog` if `dir` does not exist or is not a
/// directory, if the pattern is invalid, or if `strict_dependencies` is set
/// and a dependency names an unknown task.
pub fn load(dir: &Path, config: &CatalogConfig) -> Result<Catalog> {
    if !dir.is_dir() {
        return Err(AppError::Catalog(format!(
            "task directory not found: {}",
            dir.display()
        )));
    }

    let pattern = Pattern::new(&config.pattern)
        .map_err(|err| AppError::Catalog(format!("invalid task pattern: {err}")))?;

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|err| AppError::Catalog(format!("cannot list {}: {err}", dir.display())))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| pattern.matches(name))
        })
        .collect();
    paths.sort();

    let mut catalog = Catalog::default();
    let mut seen = HashSet::new();

    for path in paths {
        match parse_file(&path) {
            Ok(task) => {
                if seen.insert(task.id.clone()) {
                    catalog.tasks.push(task);
                } else {
                    record(
                        &mut catalog.warnings,
                        path,
                        WarningKind::DuplicateId,
                        format!("duplicate task id {}", task.id),
                    );
                }
            }
            Err((kind, message)) => record(&mut catalog.warnings, path, kind, message),
        }
    }

    check_dependencies(&mut catalog, &seen, config.strict_dependencies)?;

    catalog
        .tasks
        .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    info!(
        dir = %dir.display(),
        tasks = catalog.tasks.len(),
        warnings = catalog.warnings.len(),
        "task catalog loaded"
    );
    Ok(catalog)
}

/// Derive a task id from a definition file name.
#[must_use]
pub fn task_id_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.strip_prefix(ID_PREFIX)
        .map_or_else(|| stem.clone(), str::to_owned)
}

fn parse_file(path: &Path) -> std::result::Result<Task, (WarningKind, String)> {
    let content = fs::read_to_string(path)
        .map_err(|err| (WarningKind::Unreadable, format!("cannot read file: {err}")))?;

    let mut priority = None;
    let mut dependencies = None;

    for line in content.lines() {
        let Some((key, value)) = line.trim_start().split_once(':') else {
            continue;
        };
        let key = key.trim();

        if priority.is_none() && key.eq_ignore_ascii_case(PRIORITY_KEY) {
            let parsed = value.trim().parse::<i64>().map_err(|err| {
                (
                    WarningKind::InvalidPriority,
                    format!("invalid priority {:?}: {err}", value.trim()),
                )
            })?;
            priority = Some(parsed);
        } else if dependencies.is_none() && key.eq_ignore_ascii_case(DEPENDS_KEY) {
            dependencies = Some(parse_dependencies(value));
        }
    }

    Ok(Task {
        id: task_id_for(path),
        source_path: path.to_path_buf(),
        priority: priority.unwrap_or(DEFAULT_PRIORITY),
        dependencies: dependencies.unwrap_or_default(),
        size_hint: content.lines().count(),
    })
}

fn parse_dependencies(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|dep| !dep.is_empty())
        .map(str::to_owned)
        .collect()
}

fn check_dependencies(catalog: &mut Catalog, known: &HashSet<String>, strict: bool) -> Result<()> {
    let mut unknown = Vec::new();
    for task in &catalog.tasks {
        for dep in task.dependencies.iter().filter(|dep| !known.contains(*dep)) {
            unknown.push((task.source_path.clone(), task.id.clone(), dep.clone()));
        }
    }

    if strict {
        if let Some((_, task_id, dep)) = unknown.first() {
            return Err(AppError::Catalog(format!(
                "task {task_id} depends on unknown task {dep}"
            )));
        }
    }

    for (path, task_id, dep) in unknown {
        record(
            &mut catalog.warnings,
            path,
            WarningKind::UnknownDependency,
            format!("task {task_id} depends on {dep}, which is not in the catalog"),
        );
    }
    Ok(())
}

fn record(warnings: &mut Vec<ParseWarning>, path: PathBuf, kind: WarningKind, message: String) {
    warn!(path = %path.display(), ?kind, %message, "task definition warning");
    warnings.push(ParseWarning {
        path,
        kind,
        message,
    });
}
