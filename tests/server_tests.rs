//! Server subprocess lifecycle and request profiler tests

mod common;

use std::fs;

use branchmark::config::RunOptions;
use branchmark::error::Error;
use branchmark::server::AppServer;
use common::{StubResponse, free_port, spawn_stub_server};

fn fast_poll_options(port: u16) -> RunOptions {
    RunOptions {
        server_command: Some("sleep 30".to_string()),
        server_port: port,
        server_poll_interval_ms: 50,
        server_poll_attempts: 3,
        ..RunOptions::default()
    }
}

#[test]
fn start_times_out_when_the_port_never_opens() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut server = AppServer::new(dir.path(), &fast_poll_options(free_port()));

    let err = server.start().expect_err("nothing listens");
    assert!(matches!(err, Error::SpawnTimeout { .. }));
    assert!(!server.running());

    // The spawned child is reaped; exit stays idempotent afterwards.
    server.exit().expect("exit after timeout");
}

#[test]
fn start_returns_once_the_port_accepts_connections() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (port, _) = spawn_stub_server(vec![StubResponse::instrumented(0.01, 1, b"ok")]);
    let mut server = AppServer::new(dir.path(), &fast_poll_options(port));

    server.start().expect("port is open");
    assert!(server.running());

    server.exit().expect("shutdown");
    assert!(!server.running());
}

#[test]
fn exit_is_idempotent_without_a_pid_or_child() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut server = AppServer::new(dir.path(), &RunOptions::default());

    server.exit().expect("already stopped");
    server.exit().expect("still stopped");
}

#[test]
fn exit_removes_a_stale_pid_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pid_dir = dir.path().join("tmp/pids");
    fs::create_dir_all(&pid_dir).expect("pid dir");
    // A pid nothing is running under; liveness checks fail immediately.
    fs::write(pid_dir.join("server.pid"), "3999999").expect("stale pid file");

    let mut server = AppServer::new(dir.path(), &RunOptions::default());
    server.exit().expect("clean up stale state");
    assert!(!pid_dir.join("server.pid").exists());
    assert!(server.pid().is_none());
}

#[test]
fn profile_builds_the_sample_from_instrumentation_headers() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (port, _) = spawn_stub_server(vec![StubResponse::instrumented(0.0125, 7, b"hello")]);
    let options = RunOptions {
        server_port: port,
        ..RunOptions::default()
    };
    let server = AppServer::new(dir.path(), &options);

    let profile = server
        .profile(|client| client.get(server.url_for("/posts")).send())
        .expect("profile");

    assert!((profile.latency_ms - 12.5).abs() < 1e-9);
    assert_eq!(profile.query_count, 7);
    assert_eq!(profile.response_code, 200);
    assert_eq!(profile.response_body, b"hello");
    assert!(profile.backtrace.is_none());
}

#[test]
fn profile_reads_the_stack_trace_dump_when_the_header_points_at_one() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dump_path = dir.path().join("trace.txt");
    fs::write(&dump_path, "RuntimeError: boom\napp/models/widget.rb:10\n").expect("dump");

    let response = StubResponse::with_status(500, b"error page")
        .header("X-Runtime", "0.5")
        .header("X-PerfCheck-StackTrace", dump_path.to_str().expect("utf8 path"));
    let (port, _) = spawn_stub_server(vec![response]);
    let options = RunOptions {
        server_port: port,
        ..RunOptions::default()
    };
    let server = AppServer::new(dir.path(), &options);

    let profile = server
        .profile(|client| client.get(server.url_for("/posts")).send())
        .expect("profile");

    assert_eq!(profile.response_code, 500);
    let backtrace = profile.backtrace.expect("backtrace lines");
    assert_eq!(backtrace[0], "RuntimeError: boom");
    assert_eq!(backtrace[1], "app/models/widget.rb:10");
}

#[test]
fn a_refused_connection_is_server_unreachable_not_an_http_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let options = RunOptions {
        server_port: free_port(),
        ..RunOptions::default()
    };
    let server = AppServer::new(dir.path(), &options);

    let err = server
        .profile(|client| client.get(server.url_for("/posts")).send())
        .expect_err("nothing listens");
    assert!(matches!(err, Error::ServerUnreachable(_)));
}
