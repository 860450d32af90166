mod discovery;
mod evaluator;
mod memcheck;
mod report;
mod runner;
mod scheduler;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use proctor_common::{find_project_root, Fixture, Outcome, ProjectConfig};
use tracing::{debug, info, warn};

use crate::memcheck::MemcheckConfig;
use crate::report::ReportFormat;
use crate::runner::{AwaitOutput, CaseRunner, RequireTty, Throttle};
use crate::session::{StuffMode, StuffPolicy};

#[derive(Parser)]
#[command(name = "proctor-check")]
#[command(about = "Runs fixture-defined test cases against built executables", long_about = None)]
struct Cli {
    /// Question subdirectories to check; all testable ones when omitted
    subdirs: Vec<String>,

    /// Project root; discovered upward from the working directory by default
    #[arg(long, value_name = "DIR")]
    project_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(short = 'l', long, default_value = "info", value_name = "LEVEL")]
    log_level: String,

    /// Pause between fed input lines, in seconds
    #[arg(short = 'p', long, default_value_t = 0.5, value_name = "DURATION")]
    pause: f64,

    /// Run at most N test cases per executable
    #[arg(short = 'm', long, value_name = "N")]
    max_cases: Option<usize>,

    /// Concurrency level for test cases; defaults to available parallelism
    #[arg(short = 'j', long, alias = "threads", value_name = "N")]
    jobs: Option<usize>,

    /// Log each fed input line at debug level
    #[arg(long)]
    log_input: bool,

    /// Only run test cases whose identifier matches this shell-style glob
    #[arg(long, value_name = "PATTERN")]
    filter: Option<String>,

    /// What to print for failing test cases
    #[arg(long, value_enum, default_value = "diff", value_name = "ACTION")]
    report: ReportFormat,

    /// How input lines are prepared for transmission
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    stuff: StuffMode,

    /// Whether subjects run inside a terminal session
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    require_tty: RequireTty,

    /// Send end-of-input after the last input line
    #[arg(long)]
    eof: bool,

    /// Wait for the subject to print something before the first input line
    #[arg(long)]
    await_output: bool,

    /// Memory-check specification, e.g. applicability=auto&verbosity=quiet
    #[arg(long, value_name = "SPEC")]
    valgrind: Option<String>,

    /// Per-case processing timeout, in seconds
    #[arg(long, default_value_t = 10.0, value_name = "DURATION")]
    timeout: f64,

    /// Budget for all cases of one executable, in seconds
    #[arg(long, default_value_t = 300.0, value_name = "DURATION")]
    suite_timeout: f64,
}

#[derive(Debug, Default)]
struct RunSummary {
    failed_cases: usize,
    /// Suites aborted by discovery errors; these outrank case failures when
    /// picking the process exit code.
    suite_errors: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(summary) if summary.suite_errors > 0 => ExitCode::from(2),
        Ok(summary) if summary.failed_cases > 0 => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("proctor-check: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let project_root = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => {
            let cwd = std::env::current_dir().context("cannot determine working directory")?;
            find_project_root(&cwd)?
        }
    };
    let config = ProjectConfig::load(&project_root)?;
    debug!(root = %project_root.display(), "project root located");

    let memcheck = cli
        .valgrind
        .as_deref()
        .map(MemcheckConfig::parse)
        .transpose()?;
    let filter = cli
        .filter
        .as_deref()
        .map(glob::Pattern::new)
        .transpose()
        .context("invalid --filter pattern")?;
    let jobs = cli.jobs.unwrap_or_else(default_parallelism);
    let throttle = Throttle {
        pause: Duration::from_secs_f64(cli.pause),
        poll: Duration::from_millis(100),
        processing_timeout: Duration::from_secs_f64(cli.timeout),
        await_output: cli.await_output.then(|| AwaitOutput {
            interval: Duration::from_millis(200),
            max_polls: 25,
        }),
    };

    let targets = collect_targets(&project_root, &config, &cli.subdirs)?;
    info!(suites = targets.len(), jobs, "checking executables");

    let mut summary = RunSummary::default();
    for (q_dir, executable) in targets {
        match check_suite(&cli, &throttle, &memcheck, filter.as_ref(), jobs, &q_dir, executable)
            .await
        {
            Ok(failed) => summary.failed_cases += failed,
            Err(err) => {
                // a malformed suite must not prevent the others from running
                tracing::error!(suite = %q_dir.display(), "suite aborted: {err:#}");
                summary.suite_errors += 1;
            }
        }
    }
    Ok(summary)
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

/// Resolve (question directory, executable) pairs: the requested subdirs, or
/// every direct child of the project root with a built executable.
fn collect_targets(
    project_root: &std::path::Path,
    config: &ProjectConfig,
    subdirs: &[String],
) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut targets = Vec::new();
    if !subdirs.is_empty() {
        for name in subdirs {
            let q_dir = project_root.join(name);
            let executable = config.resolve_executable(&q_dir);
            if !executable.is_file() {
                return Err(proctor_common::ProjectError::ExecutableNotFound(executable).into());
            }
            targets.push((q_dir, executable));
        }
        return Ok(targets);
    }

    let entries = std::fs::read_dir(project_root)
        .with_context(|| format!("failed to list {}", project_root.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let q_dir = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !q_dir.is_dir() {
            continue;
        }
        let executable = config.resolve_executable(&q_dir);
        if executable.is_file() {
            targets.push((q_dir, executable));
        } else {
            debug!(dir = %q_dir.display(), "no built executable; skipping");
        }
    }
    if targets.is_empty() {
        return Err(proctor_common::ProjectError::NoExecutables(project_root.to_path_buf()).into());
    }
    targets.sort();
    Ok(targets)
}

/// Keep the first `max_cases` discovered cases, then apply the name filter.
fn select_cases(
    fixtures: Vec<Fixture>,
    max_cases: Option<usize>,
    filter: Option<&glob::Pattern>,
) -> Vec<Fixture> {
    fixtures
        .into_iter()
        .enumerate()
        .take_while(|(i, _)| max_cases.map_or(true, |max| *i < max))
        .map(|(_, fixture)| fixture)
        .filter(|fixture| filter.map_or(true, |pattern| pattern.matches(&fixture.identifier())))
        .collect()
}

/// Check one executable end-to-end: discover, select, schedule, aggregate,
/// report failures. Returns the number of failing cases; `Err` means the
/// suite could not run at all (discovery contract violated).
async fn check_suite(
    cli: &Cli,
    throttle: &Throttle,
    memcheck: &Option<MemcheckConfig>,
    filter: Option<&glob::Pattern>,
    jobs: usize,
    q_dir: &std::path::Path,
    executable: PathBuf,
) -> Result<usize> {
    let suite = q_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| q_dir.display().to_string());

    let fixtures = discovery::detect_fixtures(q_dir)?;
    info!(suite = %suite, cases = fixtures.len(), "detected test cases");

    let selected = select_cases(fixtures, cli.max_cases, filter);
    if selected.is_empty() {
        warn!(suite = %suite, "all test cases were skipped");
        return Ok(0);
    }

    let runner = Arc::new(CaseRunner::new(
        executable.clone(),
        throttle.clone(),
        StuffPolicy::new(cli.stuff, cli.eof),
        cli.require_tty,
        memcheck.clone(),
        cli.log_input,
    ));
    let outcomes = scheduler::run_suite(
        move |fixture| {
            let runner = Arc::clone(&runner);
            async move { runner.run(&fixture).await }
        },
        executable,
        selected,
        jobs,
        Duration::from_secs_f64(cli.suite_timeout),
    )
    .await;

    let mut failures: Vec<&Outcome> = outcomes.values().filter(|o| !o.passed).collect();
    failures.sort_by_key(|o| o.fixture.identifier());
    if failures.is_empty() {
        info!(suite = %suite, "all {} tests pass", outcomes.len());
    } else {
        info!(suite = %suite, "{} failures among {} test cases", failures.len(), outcomes.len());
    }
    report::render_failures(&failures, cli.report, &mut std::io::stderr().lock())
        .context("failed to write failure report")?;
    Ok(failures.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures(ids: &[&str]) -> Vec<Fixture> {
        ids.iter()
            .map(|id| {
                Fixture::new(
                    Some(PathBuf::from(format!("/q/{id}-input.txt"))),
                    Some(PathBuf::from(format!("/q/{id}-expected.txt"))),
                    None,
                    Vec::new(),
                )
            })
            .collect()
    }

    #[test]
    fn select_cases_applies_count_limit_before_filter() {
        let all = fixtures(&["1", "2", "3", "4"]);
        let pattern = glob::Pattern::new("3-*").unwrap();
        // case 3 is beyond the count limit, so the filter sees it never
        let selected = select_cases(all, Some(2), Some(&pattern));
        assert!(selected.is_empty());
    }

    #[test]
    fn select_cases_count_limit_only() {
        let all = fixtures(&["1", "2", "3"]);
        let selected = select_cases(all, Some(2), None);
        let ids: Vec<String> = selected.iter().map(Fixture::identifier).collect();
        assert_eq!(ids, vec!["1-input.txt", "2-input.txt"]);
    }

    #[test]
    fn select_cases_glob_filter() {
        let all = fixtures(&["alpha", "beta", "alpine"]);
        let pattern = glob::Pattern::new("al*").unwrap();
        let selected = select_cases(all, None, Some(&pattern));
        let ids: Vec<String> = selected.iter().map(Fixture::identifier).collect();
        assert_eq!(ids, vec!["alpha-input.txt", "alpine-input.txt"]);
    }

    #[test]
    fn select_cases_no_limits_keeps_everything() {
        let all = fixtures(&["1", "2"]);
        assert_eq!(select_cases(all.clone(), None, None), all);
    }
}
