//! Structured executor output contract.
//!
//! An executor declares machine-readable facts by printing a single-line
//! JSON object on stdout, e.g. `{"v":1,"external_ref":"https://…"}` or
//! `{"v":1,"status":"completed"}`. Other lines are ignored. Output without
//! a recognised envelope degrades to "unknown" rather than being guessed at.

use serde::Deserialize;

use crate::models::session::SessionStatus;

/// Envelope version understood by this build.
pub const OUTPUT_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(default)]
    external_ref: Option<String>,
    #[serde(default)]
    status: Option<SessionStatus>,
}

fn envelopes(stdout: &str) -> impl Iterator<Item = Envelope> + '_ {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Envelope>(line).ok())
        .filter(|env| env.v == OUTPUT_VERSION)
}

/// First external reference declared on `stdout`, if any.
#[must_use]
pub fn external_ref(stdout: &str) -> Option<String> {
    envelopes(stdout)
        .filter_map(|env| env.external_ref)
        .find(|r| !r.trim().is_empty())
}

/// Last status declared on `stdout`, if any.
#[must_use]
pub fn status(stdout: &str) -> Option<SessionStatus> {
    envelopes(stdout).filter_map(|env| env.status).last()
}
