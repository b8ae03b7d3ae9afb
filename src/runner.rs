//! Top-level run coordination.
//!
//! The runner owns one [`GitRepo`] and one [`AppServer`] for the lifetime of
//! a run and drives each registered [`TestCase`] through one or two phases.
//! Whatever state it mutates along the way (server started, reference ref
//! checked out, stash created) is torn down in reverse acquisition order on
//! every exit path, and teardown failures never mask the failure that ended
//! the run.

use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::case::TestCase;
use crate::config::RunOptions;
use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::server::AppServer;

/// Invoked once per case per phase, before its samples are taken
pub type BeforeStartHook = Box<dyn Fn(&Runner, &TestCase)>;
/// Invoked exactly once at the very end of the run
pub type WhenFinishedHook = Box<dyn Fn(&Runner, &RunSummary)>;

/// Aggregated payload handed to the finished-run hooks
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Branch the run considers current
    pub current_branch: String,
    /// When the run finished
    pub timestamp: DateTime<Utc>,
    /// Mean latency of the only case's primary phase, single-case runs only
    pub current_latency: Option<f64>,
    /// Mean latency of the only case's reference phase, single-case runs only
    pub reference_latency: Option<f64>,
    /// Non-nil whenever any fatal condition ended the run
    pub error_message: Option<String>,
}

/// Coordinates a full benchmark run
pub struct Runner {
    /// Immutable run configuration
    pub options: RunOptions,
    /// Root of the application under test
    pub app_root: PathBuf,
    /// Working-tree controller, owned for the run's lifetime
    pub git: GitRepo,
    /// Server subprocess handle, owned for the run's lifetime
    pub server: AppServer,
    /// Registered cases, run in registration order
    pub test_cases: Vec<TestCase>,
    before_start_hooks: Vec<BeforeStartHook>,
    when_finished_hooks: Vec<WhenFinishedHook>,
    reference_phase_entered: bool,
}

impl Runner {
    /// Build a runner for the app rooted at `app_root`.
    ///
    /// The banner logger is always the first before-start observer.
    ///
    /// # Errors
    ///
    /// Fails when the current branch cannot be resolved.
    pub fn new(app_root: impl Into<PathBuf>, options: RunOptions) -> Result<Self> {
        let app_root = app_root.into();
        let git = GitRepo::new(&app_root, options.branch.as_deref())?;
        let server = AppServer::new(&app_root, &options);

        let banner: BeforeStartHook = Box::new(|_, case| {
            info!("{}", "=".repeat(77));
            info!(
                "benchmarking {} -- hands off the working tree, git is automated",
                case.resource
            );
            info!("{}", "=".repeat(77));
        });

        Ok(Self {
            options,
            app_root,
            git,
            server,
            test_cases: Vec::new(),
            before_start_hooks: vec![banner],
            when_finished_hooks: Vec::new(),
            reference_phase_entered: false,
        })
    }

    /// Register a resource path as a benchmark case
    pub fn add_test_case(&mut self, route: &str) {
        let mut case = TestCase::new(route.trim());
        case.cookie = self.options.cookie.clone();
        self.test_cases.push(case);
    }

    /// Register a before-start observer
    pub fn before_start<F>(&mut self, hook: F)
    where
        F: Fn(&Runner, &TestCase) + 'static,
    {
        self.before_start_hooks.push(Box::new(hook));
    }

    /// Register a finished-run observer
    pub fn when_finished<F>(&mut self, hook: F)
    where
        F: Fn(&Runner, &RunSummary) + 'static,
    {
        self.when_finished_hooks.push(Box::new(hook));
    }

    /// Number of registered before-start observers, banner included
    #[must_use]
    pub fn before_start_hook_count(&self) -> usize {
        self.before_start_hooks.len()
    }

    /// Whether any case ended on a disallowed HTTP status
    #[must_use]
    pub fn failed(&self) -> bool {
        self.test_cases.iter().any(|case| case.http_status.is_some())
    }

    /// Directory response-diff artifacts are written to
    #[must_use]
    pub fn diff_dir(&self) -> PathBuf {
        self.app_root.join("tmp").join("branchmark").join("diffs")
    }

    /// Execute the whole run.
    ///
    /// Cleanup always executes, whatever happened: stop the server, restore
    /// the original branch (re-installing dependencies) if a reference phase
    /// was entered, pop the stash if one is outstanding. The finished-run
    /// hooks fire exactly once afterwards, with `error_message` set when the
    /// run failed.
    ///
    /// # Errors
    ///
    /// Re-raises the primary failure; a cleanup failure surfaces only when
    /// the run itself succeeded.
    pub fn run(&mut self) -> Result<()> {
        let mut cases = std::mem::take(&mut self.test_cases);
        let primary = if self.options.compare_paths {
            self.profile_compare_paths(&mut cases)
        } else {
            self.profile_branches(&mut cases)
        };
        self.test_cases = cases;

        let cleanup = self.cleanup();
        let outcome = match primary {
            Err(e) => Err(e),
            Ok(()) => cleanup,
        };
        self.trigger_when_finished(outcome.as_ref().err());
        outcome
    }

    /// Compare-branches mode: all cases against the current state, then, when
    /// a reference ref is configured, stash, check it out, and run them again
    /// in reference context.
    fn profile_branches(&mut self, cases: &mut [TestCase]) -> Result<()> {
        self.profile_phase(cases)?;

        if let Some(reference) = self.options.reference.clone() {
            self.git.stash_if_needed()?;
            self.reference_phase_entered = true;
            self.git.checkout(&reference, true, self.options.hard_reset)?;
            for case in cases.iter_mut() {
                case.switch_to_reference_context();
            }
            self.profile_phase(cases)?;
        }
        Ok(())
    }

    /// Compare-paths mode: two on-disk variants of the same branch, no git
    /// checkout. The first case runs as "this", the second as "reference".
    fn profile_compare_paths(&mut self, cases: &mut [TestCase]) -> Result<()> {
        if cases.len() != 2 {
            return Err(Error::Usage(
                "compare-paths mode requires exactly two resources".to_string(),
            ));
        }
        let (first, second) = cases.split_at_mut(1);
        let first = &mut first[0];
        let second = &mut second[0];

        self.server.restart()?;
        self.trigger_before_start(first);
        self.run_case(first)?;

        second.switch_to_reference_context();
        if self.options.bundle_between_paths {
            self.git.bundle()?;
        }
        self.server.restart()?;
        self.trigger_before_start(second);
        self.run_case(second)
    }

    fn profile_phase(&mut self, cases: &mut [TestCase]) -> Result<()> {
        for case in cases.iter_mut() {
            self.server.restart()?;
            self.trigger_before_start(case);
            info!("benchmarking {}", case.resource);
            self.run_case(case)?;
        }
        Ok(())
    }

    /// Run one case, scoping migrations around it when requested: applied
    /// before, unwound after, whether or not the case succeeded.
    fn run_case(&mut self, case: &mut TestCase) -> Result<()> {
        if !self.options.run_migrations {
            return case.run(&self.server, &self.options);
        }

        self.run_migrations_up()?;
        let result = case.run(&self.server, &self.options);
        if let Err(e) = self.run_migrations_down() {
            match result {
                Ok(()) => return Err(e),
                Err(_) => error!("migration unwind failed after case error: {e}"),
            }
        }
        result
    }

    fn run_migrations_up(&self) -> Result<()> {
        info!("running pending migrations");
        self.migrate(&format!("{} db:migrate", self.options.rake_command))?;
        self.git.clean_db()
    }

    fn run_migrations_down(&self) -> Result<()> {
        let reference = self.options.reference.as_deref().unwrap_or("master");
        for version in self.git.migrations_to_run_down(reference)? {
            info!("unwinding migration {version}");
            self.migrate(&format!(
                "{} db:migrate:down VERSION={version}",
                self.options.rake_command
            ))?;
        }
        self.git.clean_db()
    }

    fn migrate(&self, command: &str) -> Result<()> {
        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.app_root)
            .env("RAILS_ENV", &self.options.environment)
            .output()?;
        if !output.status.success() {
            return Err(Error::Migration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Teardown in reverse acquisition order. Every step runs even when an
    /// earlier one fails; the first failure is reported, the rest logged.
    fn cleanup(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Err(e) = self.server.exit() {
            error!("cleanup: server shutdown failed: {e}");
            first_error.get_or_insert(e);
        }

        if self.reference_phase_entered {
            if let Err(e) = self.git.checkout_initial_branch(true) {
                error!(
                    "cleanup: could not restore branch {}: {e}",
                    self.git.current_branch()
                );
                first_error.get_or_insert(e);
            }
        }

        if self.git.stashed() {
            if let Err(e) = self.git.pop() {
                error!("cleanup: stash pop failed: {e}");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn trigger_before_start(&self, case: &TestCase) {
        for hook in &self.before_start_hooks {
            hook(self, case);
        }
    }

    fn trigger_when_finished(&self, error: Option<&Error>) {
        let mut summary = RunSummary {
            current_branch: self.git.current_branch().to_string(),
            timestamp: Utc::now(),
            current_latency: None,
            reference_latency: None,
            error_message: error.map(ToString::to_string),
        };
        if let [case] = self.test_cases.as_slice() {
            summary.current_latency = Some(case.this_latency());
            summary.reference_latency = case.reference_latency();
        }
        for hook in &self.when_finished_hooks {
            hook(self, &summary);
        }
    }
}
