//! Run configuration: defaults, optional per-app TOML file, CLI overrides.
//!
//! `RunOptions` is immutable after parsing. A target app may ship defaults in
//! `config/branchmark.toml` at its root; the CLI layer applies flag overrides
//! on top of whatever this module loads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default diff flags ignore the mini-profiler include line, which embeds a
/// per-run asset id even when output is semantically identical.
pub const DEFAULT_DIFF_IGNORE: &str =
    "--ignore-matching-lines=/mini-profiler-resources/includes.js";

/// Configuration for a whole benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Retained samples per case per context
    pub number_of_requests: usize,
    /// Discarded initial samples (cold-cache/autoload bias)
    pub warmup_requests: usize,
    /// Git ref of the reference state; `None` benchmarks only this branch
    pub reference: Option<String>,
    /// Override for the branch considered "current" (skips git detection)
    pub branch: Option<String>,
    /// Cookie sent with every benchmark request
    pub cookie: Option<String>,
    /// Extra request headers merged into every benchmark request
    pub headers: BTreeMap<String, String>,
    /// HTTP statuses considered a successful sample
    pub http_statuses: Vec<u16>,
    /// Capture and diff response bodies between the two states
    pub verify_no_diff: bool,
    /// Diff-only mode: one request, brief output, verify-no-diff
    pub diff_only: bool,
    /// Extra flags passed verbatim to the diff command
    pub diff_options: Vec<String>,
    /// Unified-diff context lines
    pub diff_context_lines: u32,
    /// Leave fragment caching enabled in the target app
    pub caching: bool,
    /// Use fetch + hard reset instead of a plain checkout (CI/deployment)
    pub hard_reset: bool,
    /// Runtime environment the server boots in
    pub environment: String,
    /// Spawn the server through a login shell (version managers need init)
    pub spawn_shell: bool,
    /// Run pending migrations before each phase and unwind them after
    pub run_migrations: bool,
    /// Command prefix migration tasks are invoked through
    pub rake_command: String,
    /// Compare two request paths on the same branch instead of two refs
    pub compare_paths: bool,
    /// Reinstall dependencies between the two compare-paths phases
    pub bundle_between_paths: bool,
    /// Abort the whole run on the first disallowed HTTP status
    pub fail_fast: bool,
    /// One-line-per-case output
    pub brief: bool,
    /// Machine-readable JSON report
    pub json: bool,
    /// Override for the server boot command
    pub server_command: Option<String>,
    /// Port the server under test binds
    pub server_port: u16,
    /// Interval between readiness probes, in milliseconds
    pub server_poll_interval_ms: u64,
    /// Readiness probes before giving up with a spawn timeout
    pub server_poll_attempts: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            number_of_requests: 20,
            warmup_requests: 1,
            reference: None,
            branch: None,
            cookie: None,
            headers: BTreeMap::new(),
            http_statuses: vec![200],
            verify_no_diff: false,
            diff_only: false,
            diff_options: vec![DEFAULT_DIFF_IGNORE.to_string()],
            diff_context_lines: 3,
            caching: true,
            hard_reset: false,
            environment: "development".to_string(),
            spawn_shell: false,
            run_migrations: false,
            rake_command: "bundle exec rake".to_string(),
            compare_paths: false,
            bundle_between_paths: false,
            fail_fast: false,
            brief: false,
            json: false,
            server_command: None,
            server_port: 3031,
            server_poll_interval_ms: 500,
            server_poll_attempts: 60,
        }
    }
}

impl RunOptions {
    /// Load options for the app rooted at `app_root`.
    ///
    /// Reads `<app_root>/config/branchmark.toml` when present; otherwise
    /// returns the built-in defaults. Unset keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigLoad`] when the file exists but cannot be read
    /// or parsed, preserving the underlying error.
    pub fn load(app_root: &Path) -> Result<Self> {
        let path = app_root.join("config").join("branchmark.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path).map_err(|e| Error::ConfigLoad {
            path: path.clone(),
            source: Box::new(e),
        })?;
        toml::from_str(&contents).map_err(|e| Error::ConfigLoad {
            path,
            source: Box::new(e),
        })
    }

    /// Whether `status` counts as a successful sample
    #[must_use]
    pub fn status_allowed(&self, status: u16) -> bool {
        self.http_statuses.contains(&status)
    }
}
