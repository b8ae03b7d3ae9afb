//! A/B performance comparison of HTTP endpoints across two code states.
//!
//! Given a target application served by an external, long-running server
//! process, branchmark checks out or swaps code, boots the server as a
//! subprocess, issues repeated instrumented requests, aggregates the
//! per-request metadata, optionally diffs response bodies between the two
//! states, and restores whatever git/process state it mutated even when a
//! phase fails mid-run.

pub mod case;
pub mod config;
pub mod error;
pub mod git;
pub mod output;
pub mod runner;
pub mod server;

pub use case::{DiffOutcome, TestCase};
pub use config::RunOptions;
pub use error::{Error, Result};
pub use git::GitRepo;
pub use runner::{RunSummary, Runner};
pub use server::{AppServer, Profile};

/// Normalize a request path to start with a slash
#[must_use]
pub fn normalize_resource(route: &str) -> String {
    let route = route.trim();
    if route.starts_with('/') {
        route.to_string()
    } else {
        format!("/{route}")
    }
}
