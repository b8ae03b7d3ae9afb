//! One benchmark case: a single request path sampled repeatedly in the
//! "this" context and, after a one-way switch, in the "reference" context.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::RunOptions;
use crate::error::{Error, Result};
use crate::normalize_resource;
use crate::server::{AppServer, Profile};

/// Accept header sent with every benchmark request
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
/// Where the body of a failed request is dumped, relative to the app root
const FAILED_REQUEST_DUMP: &str = "tmp/branchmark/failed_request.html";

/// Outcome of comparing the two captured response bodies
#[derive(Debug)]
pub enum DiffOutcome {
    /// Bodies are identical after ignore-pattern filtering
    Unchanged,
    /// Bodies differ; the unified diff was written to this file
    Changed(PathBuf),
}

impl DiffOutcome {
    /// Whether the bodies differed
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// A resource benchmarked across both code states
pub struct TestCase {
    /// Request path, normalized to start with `/`
    pub resource: String,
    /// Cookie sent with each request for this case
    pub cookie: Option<String>,
    /// Retained samples from the primary state
    pub this_profiles: Vec<Profile>,
    /// Retained samples from the reference state
    pub reference_profiles: Vec<Profile>,
    /// Comparison body captured in the primary state
    pub this_response_body: Option<Vec<u8>>,
    /// Comparison body captured in the reference state
    pub reference_response_body: Option<Vec<u8>>,
    /// Disallowed status that stopped this case, if any
    pub http_status: Option<String>,
    /// Backtrace recorded alongside a disallowed status
    pub error_backtrace: Option<String>,
    reference_context: bool,
}

impl TestCase {
    /// Register a case for `route`, normalizing it to a leading slash
    #[must_use]
    pub fn new(route: &str) -> Self {
        Self {
            resource: normalize_resource(route),
            cookie: None,
            this_profiles: Vec::new(),
            reference_profiles: Vec::new(),
            this_response_body: None,
            reference_response_body: None,
            http_status: None,
            error_backtrace: None,
            reference_context: false,
        }
    }

    /// One-way switch: subsequent runs append to the reference sequences
    pub fn switch_to_reference_context(&mut self) {
        self.reference_context = true;
    }

    /// Whether this case currently records into the reference context
    #[must_use]
    pub fn in_reference_context(&self) -> bool {
        self.reference_context
    }

    /// Profile sequence of the active context
    #[must_use]
    pub fn context_profiles(&self) -> &[Profile] {
        if self.reference_context {
            &self.reference_profiles
        } else {
            &self.this_profiles
        }
    }

    /// Issue `number_of_requests + warmup_requests` requests against the
    /// running server, discarding the warm-up samples and appending the rest
    /// to the active context.
    ///
    /// A response status outside the allowed set is recorded on the case and
    /// stops further sampling; every later sample would almost certainly fail
    /// the same way and corrupt the averages. Under `fail_fast` it aborts the
    /// run instead.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::ServerUnreachable`] and transport errors; returns
    /// [`Error::UnexpectedHttpStatus`] only under `fail_fast`.
    pub fn run(&mut self, server: &AppServer, options: &RunOptions) -> Result<()> {
        let url = server.url_for(&self.resource);
        let headers = self.request_headers(options);
        let total = options.number_of_requests + options.warmup_requests;

        for i in 0..total {
            let profile = server.profile(|client| {
                let mut request = client.get(url.as_str());
                for (key, value) in &headers {
                    request = request.header(key.as_str(), value.as_str());
                }
                request.send()
            })?;

            // Warm-up samples carry one-time autoload/cold-cache costs.
            if i < options.warmup_requests {
                continue;
            }
            let sample = i - options.warmup_requests;

            if !options.status_allowed(profile.response_code) {
                self.http_status = Some(profile.response_code.to_string());
                self.error_backtrace = profile.backtrace.as_ref().map(|b| b.join("\n"));
                dump_failed_request(server.app_root(), &profile.response_body);
                warn!(
                    "{}: HTTP {} on request {}, abandoning case",
                    self.resource, profile.response_code, sample
                );
                if options.fail_fast {
                    return Err(Error::UnexpectedHttpStatus {
                        resource: self.resource.clone(),
                        status: profile.response_code,
                    });
                }
                break;
            }

            if options.verify_no_diff && sample == 0 {
                let body = profile.response_body.clone();
                if self.reference_context {
                    self.reference_response_body = Some(body);
                } else {
                    self.this_response_body = Some(body);
                }
            }

            info!(
                "request {:2}: {:7.1}ms {:6.1}MB {}",
                sample + 1,
                profile.latency_ms,
                profile.server_memory_kb / 1024.0,
                profile.profile_url.as_deref().unwrap_or("")
            );

            if self.reference_context {
                self.reference_profiles.push(profile);
            } else {
                self.this_profiles.push(profile);
            }
        }
        Ok(())
    }

    /// Mean latency over the primary samples
    #[must_use]
    pub fn this_latency(&self) -> f64 {
        mean(self.this_profiles.iter().map(|p| p.latency_ms)).unwrap_or(0.0)
    }

    /// Mean latency over the reference samples; `None` means no reference
    /// phase ran, which is not an error
    #[must_use]
    pub fn reference_latency(&self) -> Option<f64> {
        mean(self.reference_profiles.iter().map(|p| p.latency_ms))
    }

    /// `this - reference` mean latency, when both phases ran
    #[must_use]
    pub fn latency_difference(&self) -> Option<f64> {
        self.reference_latency().map(|r| self.this_latency() - r)
    }

    /// `reference / this` mean latency, when both phases ran
    #[must_use]
    pub fn speedup_factor(&self) -> Option<f64> {
        self.reference_latency().map(|r| r / self.this_latency())
    }

    /// Mean query count over the primary samples
    #[must_use]
    pub fn this_query_count(&self) -> f64 {
        mean(self.this_profiles.iter().map(|p| p.query_count as f64)).unwrap_or(0.0)
    }

    /// Mean query count over the reference samples
    #[must_use]
    pub fn reference_query_count(&self) -> Option<f64> {
        mean(self.reference_profiles.iter().map(|p| p.query_count as f64))
    }

    /// Diff the two captured response bodies.
    ///
    /// Unified format with the configured context lines; lines matching the
    /// configured ignore patterns do not count as changes. On a difference
    /// the diff is written to a uniquely-named file under `diff_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Diff`] when the diff command itself fails.
    pub fn response_diff(&self, diff_dir: &Path, options: &RunOptions) -> Result<DiffOutcome> {
        let (Some(this_body), Some(reference_body)) =
            (&self.this_response_body, &self.reference_response_body)
        else {
            warn!("{}: response bodies were not captured, skipping diff", self.resource);
            return Ok(DiffOutcome::Unchanged);
        };

        fs::create_dir_all(diff_dir)?;
        let name = self.artifact_name();
        let this_path = diff_dir.join(format!("{name}.this"));
        let reference_path = diff_dir.join(format!("{name}.reference"));
        fs::write(&this_path, this_body)?;
        fs::write(&reference_path, reference_body)?;

        let mut cmd = Command::new("diff");
        cmd.arg(format!("-U{}", options.diff_context_lines));
        for opt in &options.diff_options {
            cmd.arg(opt);
        }
        let output = cmd.arg(&this_path).arg(&reference_path).output()?;

        let outcome = match output.status.code() {
            Some(0) => Ok(DiffOutcome::Unchanged),
            Some(1) => {
                let stamp = Utc::now().format("%Y%m%d%H%M%S%f");
                let diff_path = diff_dir.join(format!("{name}_{stamp}.diff"));
                fs::write(&diff_path, &output.stdout)?;
                Ok(DiffOutcome::Changed(diff_path))
            }
            _ => Err(Error::Diff(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        };

        let _ = fs::remove_file(&this_path);
        let _ = fs::remove_file(&reference_path);
        outcome
    }

    fn request_headers(&self, options: &RunOptions) -> Vec<(String, String)> {
        let mut headers = vec![("Accept".to_string(), ACCEPT.to_string())];
        if let Some(cookie) = &self.cookie {
            headers.push(("Cookie".to_string(), cookie.clone()));
        }
        for (key, value) in &options.headers {
            headers.push((key.clone(), value.clone()));
        }
        headers
    }

    fn artifact_name(&self) -> String {
        let name: String = self
            .resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        name.trim_matches('_').to_string()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 { None } else { Some(sum / count as f64) }
}

fn dump_failed_request(app_root: &Path, body: &[u8]) {
    let path = app_root.join(FAILED_REQUEST_DUMP);
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("could not create {}: {e}", parent.display());
            return;
        }
    }
    match fs::write(&path, body) {
        Ok(()) => info!("failed response body dumped to {}", path.display()),
        Err(e) => warn!("could not dump failed response to {}: {e}", path.display()),
    }
}
