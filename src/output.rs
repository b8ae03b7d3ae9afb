//! Report formatting: full, brief, compare-paths, and JSON summaries.

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::case::{DiffOutcome, TestCase};
use crate::error::Result;
use crate::runner::Runner;

/// Relative latency change below which two states count as "about the same"
const SAME_THRESHOLD_PERCENT: f64 = 10.0;

/// Print the report for a finished run in the configured format
pub fn print_results(runner: &Runner) -> Result<()> {
    if runner.options.diff_only {
        print_diff_only(runner);
    } else if runner.options.json {
        print_json(runner)?;
    } else if runner.options.compare_paths {
        print_compare_paths(runner)?;
    } else if runner.options.brief {
        print_brief(runner)?;
    } else {
        print_full(runner)?;
    }
    Ok(())
}

fn print_full(runner: &Runner) -> Result<()> {
    println!("==== Results ====");
    for case in &runner.test_cases {
        println!("{}", case.resource);

        if let Some(status) = &case.http_status {
            println!("{}HTTP {status}", pad("failed: "));
            if let Some(backtrace) = &case.error_backtrace {
                if let Some(first) = backtrace.lines().next() {
                    println!("{}{first}", pad("error: "));
                }
            }
            continue;
        }

        let Some(reference) = case.reference_latency() else {
            println!("{}{:.1}ms", pad("your branch: "), case.this_latency());
            continue;
        };

        println!("{}{reference:.1}ms", pad("reference: "));
        println!("{}{:.1}ms", pad("your branch: "), case.this_latency());
        println!("{}{}", pad("change: "), format_change(case.this_latency(), reference));

        if runner.options.verify_no_diff {
            print_diff(runner, case);
        }
    }
    Ok(())
}

fn print_brief(runner: &Runner) -> Result<()> {
    for case in &runner.test_cases {
        let mut codes: Vec<u16> = case
            .this_profiles
            .iter()
            .chain(case.reference_profiles.iter())
            .map(|p| p.response_code)
            .collect();
        codes.sort_unstable();
        codes.dedup();
        let codes = codes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        print!("{:<40}: (HTTP {codes}) {:.1}ms", case.resource, case.this_latency());
        if let Some(difference) = case.latency_difference() {
            print!(" ({difference:+5.1}ms)");
        }
        println!();

        if runner.options.verify_no_diff {
            print_diff(runner, case);
        }
    }
    Ok(())
}

fn print_compare_paths(runner: &Runner) -> Result<()> {
    let [first, second] = runner.test_cases.as_slice() else {
        warn!("compare-paths report needs exactly two cases");
        return Ok(());
    };

    let first_latency = first.this_latency();
    let Some(second_latency) = second.reference_latency() else {
        warn!("second path has no samples");
        return Ok(());
    };

    println!("first path:  {}", first.resource);
    println!("second path: {}", second.resource);
    println!("{}{second_latency:.1}ms", pad("second path: "));
    println!("{}{first_latency:.1}ms", pad("first path: "));
    println!("{}{}", pad("change: "), format_change(first_latency, second_latency));
    Ok(())
}

#[derive(Serialize)]
struct CaseReport<'a> {
    resource: &'a str,
    this_latency_ms: f64,
    reference_latency_ms: Option<f64>,
    latency_difference_ms: Option<f64>,
    speedup_factor: Option<f64>,
    this_query_count: f64,
    reference_query_count: Option<f64>,
    http_status: Option<&'a str>,
}

fn print_json(runner: &Runner) -> Result<()> {
    let cases: Vec<CaseReport> = runner
        .test_cases
        .iter()
        .map(|case| CaseReport {
            resource: &case.resource,
            this_latency_ms: case.this_latency(),
            reference_latency_ms: case.reference_latency(),
            latency_difference_ms: case.latency_difference(),
            speedup_factor: case.speedup_factor(),
            this_query_count: case.this_query_count(),
            reference_query_count: case.reference_query_count(),
            http_status: case.http_status.as_deref(),
        })
        .collect();

    let report = json!({
        "current_branch": runner.git.current_branch(),
        "cases": cases,
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    Ok(())
}

/// Diff-only mode suppresses the latency report entirely
fn print_diff_only(runner: &Runner) {
    for case in &runner.test_cases {
        println!("{}", case.resource);
        print_diff(runner, case);
    }
}

fn print_diff(runner: &Runner, case: &TestCase) {
    match case.response_diff(&runner.diff_dir(), &runner.options) {
        Ok(DiffOutcome::Unchanged) => println!("{}output is identical", pad("diff: ")),
        Ok(DiffOutcome::Changed(path)) => println!("{}{}", pad("diff: "), path.display()),
        Err(e) => warn!("{}: response diff failed: {e}", case.resource),
    }
}

/// Human-readable classification of a latency change: the signed difference
/// plus "about the same" under the 10% threshold, otherwise a faster/slower
/// factor.
fn format_change(this: f64, reference: f64) -> String {
    let difference = this - reference;
    let percent = 100.0 * (difference / reference).abs();
    if percent < SAME_THRESHOLD_PERCENT {
        return format!("{difference:+.1}ms (about the same)");
    }
    let factor = if difference < 0.0 {
        reference / this
    } else {
        this / reference
    };
    if difference < 0.0 {
        format!("{difference:+.1}ms ({factor:.1}x faster!)")
    } else {
        format!("{difference:+.1}ms ({factor:.1}x slower!!!)")
    }
}

fn pad(label: &str) -> String {
    format!("{label:>15}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use std::fs;

    #[test]
    fn diff_only_mode_reports_the_response_diff() {
        let dir = tempfile::tempdir().expect("temp dir");
        let options = RunOptions {
            branch: Some("main".to_string()),
            diff_only: true,
            verify_no_diff: true,
            ..RunOptions::default()
        };
        let mut runner = Runner::new(dir.path(), options).expect("runner");
        runner.add_test_case("/posts");
        runner.test_cases[0].this_response_body = Some(b"a\nb\n".to_vec());
        runner.test_cases[0].reference_response_body = Some(b"a\nc\n".to_vec());

        print_results(&runner).expect("report");

        // The diff-only path ran the comparison and wrote its artifact.
        let artifacts: Vec<_> = fs::read_dir(runner.diff_dir())
            .expect("diff dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "diff"))
            .collect();
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn small_changes_count_as_about_the_same() {
        assert_eq!(format_change(10.5, 10.0), "+0.5ms (about the same)");
        assert_eq!(format_change(9.5, 10.0), "-0.5ms (about the same)");
    }

    #[test]
    fn faster_changes_report_the_speedup_factor() {
        let formatted = format_change(5.0, 10.0);
        assert!(formatted.starts_with("-5.0ms"));
        assert!(formatted.contains("2.0x faster"));
    }

    #[test]
    fn slower_changes_report_the_slowdown_factor() {
        let formatted = format_change(30.0, 10.0);
        assert!(formatted.starts_with("+20.0ms"));
        assert!(formatted.contains("3.0x slower"));
    }
}
