//! branchmark - compare HTTP endpoint performance across two code states

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

use branchmark::config::RunOptions;
use branchmark::output;
use branchmark::runner::Runner;

/// Compare HTTP endpoint performance across two git refs or working trees
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Request paths to benchmark
    routes: Vec<String>,

    /// Use N requests per case, defaults to 20
    #[arg(short = 'n', long = "requests")]
    requests: Option<usize>,

    /// Discard N warm-up requests per case, defaults to 1
    #[arg(long)]
    warmup: Option<usize>,

    /// Benchmark against this ref instead of only the current branch
    #[arg(short = 'r', long)]
    reference: Option<String>,

    /// Treat this branch as current instead of detecting it
    #[arg(long)]
    branch: Option<String>,

    /// Benchmark only the current branch, no comparison
    #[arg(short = 'q', long)]
    quick: bool,

    /// Compare two request paths against each other on the same branch
    #[arg(long)]
    compare_paths: bool,

    /// Consider HTTP 302 a successful request
    #[arg(long = "302-success")]
    redirect_success: bool,

    /// Consider HTTP 302 an unsuccessful request
    #[arg(long = "302-failure")]
    redirect_failure: bool,

    /// Use git fetch/reset instead of the safe/friendly checkout
    #[arg(long)]
    deployment: bool,

    /// Runtime environment to profile in, defaults to development
    #[arg(short = 'e', long)]
    environment: Option<String>,

    /// Do not enable fragment caching (the data-layer cache still works)
    #[arg(long)]
    no_caching: bool,

    /// Run pending migrations before each phase and unwind them after
    #[arg(long)]
    run_migrations: bool,

    /// Cookie sent with every benchmark request
    #[arg(short = 'c', long)]
    cookie: Option<String>,

    /// Extra request header, KEY: VALUE (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// File of newline-separated routes to benchmark
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,

    /// One-line-per-case output
    #[arg(short = 'b', long)]
    brief: bool,

    /// Machine-readable JSON report
    #[arg(short = 'j', long)]
    json: bool,

    /// Diff the responses of this and the reference state
    #[arg(long)]
    verify_no_diff: bool,

    /// Just diff the output of the two states (one request, brief output)
    #[arg(long)]
    diff: bool,

    /// Extra flag passed to the diff command (repeatable)
    #[arg(long = "diff-option")]
    diff_options: Vec<String>,

    /// Abort the whole run on the first disallowed HTTP status
    #[arg(short = 'f', long)]
    fail_fast: bool,

    /// Boot the server through a login shell (version managers need init)
    #[arg(long)]
    spawn_shell: bool,

    /// Override the server boot command
    #[arg(long)]
    server_command: Option<String>,

    /// Set the log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let app_root = std::env::current_dir().context("cannot determine working directory")?;
    let options = build_options(&cli, &app_root)?;

    if options.environment == "production" {
        bail!("refusing to benchmark the production environment");
    }

    let mut runner = Runner::new(&app_root, options)?;
    for route in collect_routes(&cli)? {
        runner.add_test_case(&route);
    }
    if runner.test_cases.is_empty() {
        bail!("no routes given; try: branchmark /user/45/posts -r main");
    }

    let result = runner.run();
    match result {
        Ok(()) => {
            output::print_results(&runner)?;
            if runner.failed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            error!("run failed: {e}");
            std::process::exit(1);
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Load the app's config-file defaults and apply CLI flag overrides on top
fn build_options(cli: &Cli, app_root: &std::path::Path) -> Result<RunOptions> {
    let mut options = RunOptions::load(app_root)?;

    if let Some(n) = cli.requests {
        options.number_of_requests = n;
    }
    if let Some(w) = cli.warmup {
        options.warmup_requests = w;
    }
    if let Some(reference) = &cli.reference {
        options.reference = Some(reference.clone());
    }
    if cli.quick {
        options.reference = None;
    }
    if let Some(branch) = &cli.branch {
        options.branch = Some(branch.clone());
    }
    if let Some(cookie) = &cli.cookie {
        options.cookie = Some(cookie.clone());
    }
    for header in &cli.headers {
        let (key, value) = header
            .split_once(':')
            .with_context(|| format!("malformed header '{header}', expected KEY: VALUE"))?;
        options
            .headers
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    if cli.redirect_success && !options.http_statuses.contains(&302) {
        options.http_statuses.push(302);
    }
    if cli.redirect_failure {
        options.http_statuses.retain(|&status| status != 302);
    }
    if cli.compare_paths {
        options.compare_paths = true;
    }
    if cli.deployment {
        options.hard_reset = true;
    }
    if let Some(environment) = &cli.environment {
        options.environment = environment.clone();
    }
    if cli.no_caching {
        options.caching = false;
    }
    if cli.run_migrations {
        options.run_migrations = true;
    }
    if cli.brief {
        options.brief = true;
    }
    if cli.json {
        options.json = true;
    }
    if cli.verify_no_diff {
        options.verify_no_diff = true;
    }
    if cli.diff {
        options.diff_only = true;
        options.brief = true;
        options.verify_no_diff = true;
        options.number_of_requests = 1;
    }
    options.diff_options.extend(cli.diff_options.iter().cloned());
    if cli.fail_fast {
        options.fail_fast = true;
    }
    if cli.spawn_shell {
        options.spawn_shell = true;
    }
    if let Some(command) = &cli.server_command {
        options.server_command = Some(command.clone());
    }

    Ok(options)
}

fn collect_routes(cli: &Cli) -> Result<Vec<String>> {
    let mut routes = cli.routes.clone();
    if let Some(input) = &cli.input {
        let contents = fs::read_to_string(input)
            .with_context(|| format!("cannot read route file {}", input.display()))?;
        routes.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned),
        );
    }
    Ok(routes)
}
