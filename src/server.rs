//! Lifecycle management for the application server under test, plus the
//! request profiler that turns one instrumented HTTP exchange into a
//! [`Profile`].
//!
//! The server runs as a detached subprocess bound to a fixed host and port.
//! Its pid is read from the conventional pid file on every use, never cached
//! across restarts. Liveness checks and signalling go through `kill`, and
//! shutdown escalates from a graceful quit to a forceful kill.

use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::error::{Error, Result};

/// Header carrying server-measured request runtime, in seconds
pub const RUNTIME_HEADER: &str = "x-runtime";
/// Header carrying the instrumented query count
pub const QUERY_COUNT_HEADER: &str = "x-perfcheck-query-count";
/// Header carrying the path of a stack-trace dump, set on unhandled errors
pub const STACKTRACE_HEADER: &str = "x-perfcheck-stacktrace";
/// Optional header carrying a per-request profiler URL
pub const PROFILER_URL_HEADER: &str = "x-perfcheck-profiler-url";

/// Pid file the server is expected to write, relative to the app root
const PID_FILE: &str = "tmp/pids/server.pid";
/// Profiling overhead can dominate normal response time, so the per-request
/// read timeout is far beyond anything a healthy request needs.
const PROFILE_TIMEOUT: Duration = Duration::from_secs(600);
/// Polls while waiting for a signalled process to die
const KILL_WAIT_ATTEMPTS: u32 = 10;
const KILL_WAIT_INTERVAL: Duration = Duration::from_millis(250);

/// One sampled request: timing, status, and resource metadata.
/// Built once per request and immutable thereafter.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Server-reported request runtime in milliseconds
    pub latency_ms: f64,
    /// Queries issued while serving the request
    pub query_count: u64,
    /// HTTP status code
    pub response_code: u16,
    /// Raw response body
    pub response_body: Vec<u8>,
    /// Profiler URL for this request, when the server emitted one
    pub profile_url: Option<String>,
    /// Server resident memory at sample time, in KB
    pub server_memory_kb: f64,
    /// Stack trace lines from the dump file, when the request errored
    pub backtrace: Option<Vec<String>>,
}

/// The application server subprocess under test
pub struct AppServer {
    app_root: PathBuf,
    host: String,
    port: u16,
    command: String,
    spawn_shell: bool,
    env: Vec<(String, String)>,
    poll_interval: Duration,
    max_poll_attempts: u32,
    running: bool,
    child: Option<Child>,
}

impl AppServer {
    /// Build a server handle for the app rooted at `app_root`
    #[must_use]
    pub fn new(app_root: impl Into<PathBuf>, options: &RunOptions) -> Self {
        let host = "127.0.0.1".to_string();
        let port = options.server_port;
        let command = options.server_command.clone().unwrap_or_else(|| {
            format!(
                "bundle exec rails server -b {host} -d -p {port} -e {}",
                options.environment
            )
        });
        Self {
            app_root: app_root.into(),
            host,
            port,
            command,
            spawn_shell: options.spawn_shell,
            env: Self::environment_variables(options),
            poll_interval: Duration::from_millis(options.server_poll_interval_ms),
            max_poll_attempts: options.server_poll_attempts,
            running: false,
            child: None,
        }
    }

    /// Environment negotiated with the server process.
    ///
    /// The marker flag makes the app force production-like settings and
    /// enable its instrumentation middleware; the preloader flag keeps stale
    /// state from surviving restarts. Verification asks the app to seed
    /// non-deterministic generation so response diffing is meaningful.
    #[must_use]
    pub fn environment_variables(options: &RunOptions) -> Vec<(String, String)> {
        let mut env = vec![
            ("PERF_CHECK".to_string(), "1".to_string()),
            ("DISABLE_SPRING".to_string(), "1".to_string()),
        ];
        if options.verify_no_diff {
            env.push(("PERF_CHECK_VERIFICATION".to_string(), "1".to_string()));
        }
        if !options.caching {
            env.push(("PERF_CHECK_NOCACHING".to_string(), "1".to_string()));
        }
        env
    }

    /// Host the server binds
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the server binds
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// App root the server runs in
    #[must_use]
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    /// Absolute URL for a request path on this server
    #[must_use]
    pub fn url_for(&self, resource: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, resource)
    }

    /// Spawn the server and block until it accepts TCP connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnTimeout`] when the port never opens within the
    /// poll budget; the spawned child is killed first.
    pub fn start(&mut self) -> Result<()> {
        info!("starting server: {} ({}:{})", self.command, self.host, self.port);

        let mut cmd = Command::new("sh");
        if self.spawn_shell {
            // Login shell so version managers and shell init run.
            // Keeps the parent environment.
            cmd.arg("-lc");
        } else {
            cmd.arg("-c");
            cmd.env_clear();
            for key in ["PATH", "HOME", "LANG"] {
                if let Some(value) = std::env::var_os(key) {
                    cmd.env(key, value);
                }
            }
        }
        cmd.arg(&self.command)
            .current_dir(&self.app_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        self.child = Some(cmd.spawn()?);

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Usage(format!("cannot resolve {}", self.host)))?;

        for attempt in 1..=self.max_poll_attempts {
            if TcpStream::connect_timeout(&addr, self.poll_interval).is_ok() {
                debug!("server reachable after {attempt} probe(s)");
                self.running = true;
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }

        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(Error::SpawnTimeout {
            host: self.host.clone(),
            port: self.port,
            waited_ms: self.poll_interval.as_millis() as u64 * u64::from(self.max_poll_attempts),
        })
    }

    /// Stop the server if running, then start it
    pub fn restart(&mut self) -> Result<()> {
        if self.running {
            info!("restarting server");
            self.exit()?;
        }
        self.start()
    }

    /// Stop the server. Idempotent: an already-dead server is not an error.
    ///
    /// Sends a graceful quit first, escalates to a forceful kill if the
    /// process persists, and removes the pid file once it is gone.
    pub fn exit(&mut self) -> Result<()> {
        let Some(pid) = self.pid() else {
            // Nothing resolvable from the pid file. Reap a directly-held
            // child (servers that never daemonized) and clear stale state.
            if let Some(mut child) = self.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            self.remove_pid_file();
            self.running = false;
            return Ok(());
        };

        info!("stopping server (pid {pid})");
        signal(pid, "QUIT");
        if !wait_for_death(pid) {
            warn!("server {pid} ignored QUIT, sending KILL");
            signal(pid, "KILL");
            wait_for_death(pid);
        }
        self.remove_pid_file();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.running = false;
        Ok(())
    }

    /// Whether this handle believes the server is up
    #[must_use]
    pub fn running(&self) -> bool {
        self.running
    }

    /// Pid from the pid file, re-read on every call
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(self.pid_file_path()).ok()?;
        contents.trim().parse().ok()
    }

    /// Resident memory of the tracked pid in KB, zero when no pid is known
    #[must_use]
    pub fn mem(&self) -> f64 {
        let Some(pid) = self.pid() else { return 0.0 };
        Command::new("ps")
            .args(["-o", "rss=", "-p", &pid.to_string()])
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .and_then(|rss| rss.trim().parse().ok())
            .unwrap_or(0.0)
    }

    /// Issue one instrumented request and build a [`Profile`] from it.
    ///
    /// Latency comes from the server's runtime header, not a client-side
    /// clock, so connection setup and header parsing never pollute the
    /// reported numbers.
    ///
    /// # Errors
    ///
    /// A refused connection becomes [`Error::ServerUnreachable`]; the server
    /// crashed or never booted, which is not an application-level failure.
    pub fn profile<F>(&self, send: F) -> Result<Profile>
    where
        F: FnOnce(&Client) -> reqwest::Result<Response>,
    {
        let client = Client::builder().timeout(PROFILE_TIMEOUT).build()?;
        let response = send(&client).map_err(|e| {
            if e.is_connect() {
                Error::ServerUnreachable(e.to_string())
            } else {
                Error::from(e)
            }
        })?;

        let response_code = response.status().as_u16();
        let headers = response.headers().clone();
        let response_body = response.bytes()?.to_vec();

        let latency_ms = header_value(&headers, RUNTIME_HEADER)
            .and_then(|s| s.parse::<f64>().ok())
            .map_or(0.0, |seconds| seconds * 1000.0);
        let query_count = header_value(&headers, QUERY_COUNT_HEADER)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let backtrace = header_value(&headers, STACKTRACE_HEADER)
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|dump| dump.lines().map(str::to_owned).collect());
        let profile_url = header_value(&headers, PROFILER_URL_HEADER);

        Ok(Profile {
            latency_ms,
            query_count,
            response_code,
            response_body,
            profile_url,
            server_memory_kb: self.mem(),
            backtrace,
        })
    }

    fn pid_file_path(&self) -> PathBuf {
        self.app_root.join(PID_FILE)
    }

    fn remove_pid_file(&self) {
        let path = self.pid_file_path();
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("could not remove pid file {}: {e}", path.display());
            }
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Check process liveness via `kill -0`
fn is_process_running(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Send `sig` to `pid`, ignoring failures (the process may already be gone)
fn signal(pid: u32, sig: &str) {
    let _ = Command::new("kill")
        .args([&format!("-{sig}"), &pid.to_string()])
        .output();
}

/// Poll briefly for `pid` to disappear; true when it did
fn wait_for_death(pid: u32) -> bool {
    for _ in 0..KILL_WAIT_ATTEMPTS {
        if !is_process_running(pid) {
            return true;
        }
        thread::sleep(KILL_WAIT_INTERVAL);
    }
    !is_process_running(pid)
}
