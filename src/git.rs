//! Working-tree state management for the app under test.
//!
//! Every operation shells out to `git` inside the app root. `GitRepo` is
//! instance-scoped: it captures the branch that was checked out when the run
//! started and tracks whether this run created a stash that has not yet been
//! popped, so cleanup can restore exactly what it changed.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Relative path migrations live under
const MIGRATIONS_DIR: &str = "db/migrate";
/// Relative path of the schema/seed tree that migrations dirty
const DB_DIR: &str = "db";
/// Attempts before giving up on dependency installation
const BUNDLE_ATTEMPTS: u32 = 3;

/// Git working-tree controller for one benchmark run
pub struct GitRepo {
    app_root: PathBuf,
    initial_branch: String,
    stashed: bool,
}

impl GitRepo {
    /// Open the repository at `app_root`.
    ///
    /// Resolves the abbreviated ref name of HEAD unless `branch_override`
    /// supplies one, in which case no git call is made.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] when the current branch cannot be resolved.
    pub fn new(app_root: impl Into<PathBuf>, branch_override: Option<&str>) -> Result<Self> {
        let app_root = app_root.into();
        let initial_branch = match branch_override {
            Some(branch) => branch.to_string(),
            None => detect_current_branch(&app_root)?,
        };
        Ok(Self {
            app_root,
            initial_branch,
            stashed: false,
        })
    }

    /// Branch checked out when the run started (or the configured override)
    #[must_use]
    pub fn current_branch(&self) -> &str {
        &self.initial_branch
    }

    /// True while a stash created by this run has not been popped
    #[must_use]
    pub fn stashed(&self) -> bool {
        self.stashed
    }

    /// Check out `branch`.
    ///
    /// With `hard_reset`, fetches and hard-resets to `origin/<branch>` so the
    /// working tree exactly mirrors the remote (deployment/CI). Otherwise a
    /// plain checkout, safe for local trees. Submodules are updated either
    /// way, and dependencies reinstalled when `bundle_after` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchBranch`] when the checkout fails and
    /// [`Error::Bundle`] when dependency installation does.
    pub fn checkout(&self, branch: &str, bundle_after: bool, hard_reset: bool) -> Result<()> {
        info!("checking out {branch}");
        if hard_reset {
            let fetch = self.git(&["fetch", "--quiet"])?;
            if !fetch.status.success() {
                return Err(Error::Git(stderr_of(&fetch)));
            }
            let target = format!("origin/{branch}");
            let reset = self.git(&["reset", "--hard", &target, "--quiet"])?;
            if !reset.status.success() {
                return Err(Error::NoSuchBranch(branch.to_string()));
            }
        } else {
            let checkout = self.git(&["checkout", branch, "--quiet"])?;
            if !checkout.status.success() {
                return Err(Error::NoSuchBranch(branch.to_string()));
            }
        }

        let submodules = self.git(&["submodule", "update", "--quiet"])?;
        if !submodules.status.success() {
            warn!("git submodule update failed: {}", stderr_of(&submodules));
        }

        if bundle_after {
            self.bundle()?;
        }
        Ok(())
    }

    /// Restore the branch captured at construction
    pub fn checkout_initial_branch(&self, bundle_after: bool) -> Result<()> {
        self.checkout(&self.initial_branch.clone(), bundle_after, false)
    }

    /// Whether the working tree holds unstaged or staged changes
    pub fn anything_to_stash(&self) -> Result<bool> {
        let unstaged = self.git(&["diff"])?;
        let staged = self.git(&["diff", "--staged"])?;
        Ok(!unstaged.stdout.is_empty() || !staged.stdout.is_empty())
    }

    /// Stash the working tree if it is dirty.
    ///
    /// Returns whether a stash was created. No-op on a clean tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stash`] when the stash command fails.
    pub fn stash_if_needed(&mut self) -> Result<bool> {
        if !self.anything_to_stash()? {
            return Ok(false);
        }
        info!("stashing working-tree changes");
        let stash = self.git(&["stash", "--quiet"])?;
        if !stash.status.success() {
            return Err(Error::Stash(stderr_of(&stash)));
        }
        self.stashed = true;
        Ok(true)
    }

    /// Apply and drop the stash created by this run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StashPop`] when there is nothing to pop or the
    /// operation fails.
    pub fn pop(&mut self) -> Result<()> {
        info!("applying stashed changes");
        let pop = self.git(&["stash", "pop", "--quiet"])?;
        if !pop.status.success() {
            return Err(Error::StashPop(stderr_of(&pop)));
        }
        self.stashed = false;
        Ok(())
    }

    /// Migration versions added on the current state relative to `reference`,
    /// newest first so they can be unwound in reverse application order.
    ///
    /// Empty when the app has no migrations directory or the diff adds none.
    pub fn migrations_to_run_down(&self, reference: &str) -> Result<Vec<String>> {
        if !self.app_root.join(MIGRATIONS_DIR).is_dir() {
            return Ok(Vec::new());
        }
        let diff = self.git(&[
            "diff",
            "--name-only",
            "--diff-filter=A",
            reference,
            "--",
            MIGRATIONS_DIR,
        ])?;
        if !diff.status.success() {
            return Err(Error::Git(stderr_of(&diff)));
        }

        let mut versions: Vec<String> = String::from_utf8_lossy(&diff.stdout)
            .lines()
            .filter_map(migration_version)
            .collect();
        // Versions are arbitrary-width digit strings; shorter means smaller,
        // so order by length before the lexicographic tie-break.
        versions.sort_unstable_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        versions.reverse();
        Ok(versions)
    }

    /// Discard working-tree changes under the database schema/seed path.
    ///
    /// Running migrations up or down rewrites the schema dump; this keeps
    /// that churn out of version control.
    pub fn clean_db(&self) -> Result<()> {
        let checkout = self.git(&["checkout", "--quiet", "--", DB_DIR])?;
        if !checkout.status.success() {
            return Err(Error::Git(stderr_of(&checkout)));
        }
        Ok(())
    }

    /// Install dependencies with a frozen lockfile, retrying a bounded
    /// number of times. Skipped when the app carries no manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bundle`] when every attempt fails.
    pub fn bundle(&self) -> Result<()> {
        if !self.app_root.join("Gemfile").exists() {
            debug!("no Gemfile under {}, skipping install", self.app_root.display());
            return Ok(());
        }
        let mut last_output = String::new();
        for attempt in 1..=BUNDLE_ATTEMPTS {
            info!("installing dependencies (attempt {attempt}/{BUNDLE_ATTEMPTS})");
            let output = Command::new("bundle")
                .args(["install", "--frozen", "--quiet"])
                .current_dir(&self.app_root)
                .output()?;
            if output.status.success() {
                return Ok(());
            }
            last_output = stderr_of(&output);
            warn!("dependency install failed: {last_output}");
        }
        Err(Error::Bundle(last_output))
    }

    /// App root the repository lives at
    #[must_use]
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        debug!("git {}", args.join(" "));
        Ok(Command::new("git")
            .args(args)
            .current_dir(&self.app_root)
            .output()?)
    }
}

fn detect_current_branch(app_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(app_root)
        .output()?;
    if !output.status.success() {
        return Err(Error::Git(stderr_of(&output)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Leading numeric version token of a migration path, when it has one
fn migration_version(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let version: String = name.chars().take_while(char::is_ascii_digit).collect();
    if version.is_empty() { None } else { Some(version) }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    }
}
