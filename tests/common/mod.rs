//! Shared test helpers: throwaway git repositories and a stub HTTP responder
//! that plays the role of the instrumented application server.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Run a shell script inside `dir`, panicking on failure
pub fn sh(dir: &Path, script: &str) {
    let status = Command::new("sh")
        .args(["-c", script])
        .current_dir(dir)
        .status()
        .expect("run shell script");
    assert!(status.success(), "script failed: {script}");
}

/// Capture a command's stdout inside `dir`
pub fn sh_output(dir: &Path, script: &str) -> String {
    let output = Command::new("sh")
        .args(["-c", script])
        .current_dir(dir)
        .output()
        .expect("run shell script");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialize a scratch repository on branch `main` with one committed file
/// and an (identical) `feature` branch
pub fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("temp dir");
    sh(
        dir.path(),
        "git init -q -b main \
         && git config user.email test@example.com \
         && git config user.name Test \
         && git config commit.gpgsign false \
         && echo content > file \
         && git add . \
         && git commit -qm 'initial commit' \
         && git branch feature",
    );
    dir
}

/// A canned HTTP response served by the stub responder
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubResponse {
    /// A 200 carrying the instrumentation headers the profiler consumes
    pub fn instrumented(runtime_seconds: f64, query_count: u64, body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: vec![
                ("X-Runtime".to_string(), runtime_seconds.to_string()),
                ("X-PerfCheck-Query-Count".to_string(), query_count.to_string()),
            ],
            body: body.to_vec(),
        }
    }

    pub fn with_status(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }
}

/// Spawn a stub HTTP responder on an ephemeral port. Serves `responses` in
/// order and repeats the last one forever. Returns the bound port and a
/// counter of requests served.
pub fn spawn_stub_server(responses: Vec<StubResponse>) -> (u16, Arc<AtomicUsize>) {
    assert!(!responses.is_empty(), "stub needs at least one response");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let port = listener.local_addr().expect("stub addr").port();
    let counter = Arc::new(AtomicUsize::new(0));
    let served_counter = Arc::clone(&counter);

    thread::spawn(move || {
        let mut served = 0usize;
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            // Drain the request head; a GET fits in one read.
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap_or(0);
            // Readiness probes connect and close without sending anything;
            // they are not requests, so don't count or answer them.
            if n == 0 {
                continue;
            }

            let response = &responses[served.min(responses.len() - 1)];
            served += 1;
            served_counter.fetch_add(1, Ordering::SeqCst);

            let mut head = format!(
                "HTTP/1.1 {} OK\r\nContent-Length: {}\r\nConnection: close\r\n",
                response.status,
                response.body.len()
            );
            for (key, value) in &response.headers {
                head.push_str(&format!("{key}: {value}\r\n"));
            }
            head.push_str("\r\n");
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&response.body);
        }
    });

    (port, counter)
}

/// A port nothing is listening on (freed just before returning)
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    listener.local_addr().expect("probe addr").port()
}
