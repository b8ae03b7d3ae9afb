//! Error types for git, process, and benchmark operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during a benchmark run
#[derive(Error, Debug)]
pub enum Error {
    /// Checkout target does not exist
    #[error("no such branch or ref: {0}")]
    NoSuchBranch(String),

    /// `git stash` failed
    #[error("git stash failed: {0}")]
    Stash(String),

    /// `git stash pop` failed or there was nothing to pop
    #[error("git stash pop failed: {0}")]
    StashPop(String),

    /// Dependency installation failed after bounded retries
    #[error("dependency install failed: {0}")]
    Bundle(String),

    /// Any other git command failure outside the named taxonomy
    #[error("git command failed: {0}")]
    Git(String),

    /// Server never accepted TCP connections within the poll budget
    #[error("server did not accept connections on {host}:{port} within {waited_ms}ms")]
    SpawnTimeout {
        /// Host the server was expected to bind
        host: String,
        /// Port the server was expected to bind
        port: u16,
        /// Total time spent polling
        waited_ms: u64,
    },

    /// Connection refused mid-run: the server crashed or never booted.
    /// Distinct from an HTTP-level error status, which is an application bug.
    #[error("server unreachable: {0}")]
    ServerUnreachable(String),

    /// Response status outside the allowed set, surfaced only under fail-fast
    #[error("unexpected HTTP status {status} for {resource}")]
    UnexpectedHttpStatus {
        /// Request path that produced the status
        resource: String,
        /// The disallowed status code
        status: u16,
    },

    /// Config file could not be read or parsed
    #[error("failed to load config at {path}: {source}")]
    ConfigLoad {
        /// Path of the offending config file
        path: PathBuf,
        /// The underlying read/parse error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Database migration command failed
    #[error("migration failed: {0}")]
    Migration(String),

    /// Response diff could not be computed
    #[error("diff failed: {0}")]
    Diff(String),

    /// Invalid combination of options and registered cases
    #[error("{0}")]
    Usage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for benchmark operations
pub type Result<T> = std::result::Result<T, Error>;
