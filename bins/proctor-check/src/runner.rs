/// Single-Case Runner - one fixture end-to-end
///
/// **Core Responsibility:**
/// Drive one fixture from spawn to classified outcome: decide whether a
/// terminal session is required, run the subject (session-backed or direct),
/// apply the optional memory-check pass, compare results, classify.
///
/// **Classification order (first applicable wins):**
/// early termination, stuff failure, content rejected, screen exit,
/// bad exit code, memcheck, diff, ok.
///
/// **Resource guarantees:**
/// Every case runs in a fresh temporary working directory removed when the
/// case ends, however it ends; session teardown (quit, then kill) always
/// runs, so no subject process outlives its case.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use proctor_common::{Fixture, Outcome};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::evaluator;
use crate::memcheck::MemcheckConfig;
use crate::session::{FeedOutcome, ScreenSession, StartOutcome, StuffPolicy};

/// Pacing knobs for a case: the inter-line feed pause models a human typing
/// at realistic speed and avoids racing the subject's read loop.
#[derive(Debug, Clone)]
pub struct Throttle {
    /// Pause before each fed line, and the settle pause after spawn.
    pub pause: Duration,
    /// Liveness/termination poll interval.
    pub poll: Duration,
    /// How long to wait for natural termination after the last feed, and the
    /// budget for a direct invocation.
    pub processing_timeout: Duration,
    /// When set, wait for the subject to emit non-whitespace output before
    /// the first feed (handles slow-starting programs).
    pub await_output: Option<AwaitOutput>,
}

#[derive(Debug, Clone)]
pub struct AwaitOutput {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for Throttle {
    fn default() -> Self {
        Throttle {
            pause: Duration::from_millis(500),
            poll: Duration::from_millis(100),
            processing_timeout: Duration::from_secs(10),
            await_output: None,
        }
    }
}

/// Whether a fixture needs a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RequireTty {
    /// Session iff the fixture has recorded input.
    Auto,
    Always,
    Never,
}

/// Why a case passed or failed. Rendered into the outcome message.
#[derive(Debug)]
pub enum Classification {
    Ok,
    Diff,
    BadExitCode {
        expected: i32,
        actual: Option<i32>,
    },
    Memcheck {
        exit_code: Option<i32>,
    },
    EarlyTermination {
        fed: u32,
        total: usize,
    },
    FeedFailure {
        line: usize,
        status: i32,
        stderr: String,
    },
    ContentRejected {
        line: usize,
        offending: char,
    },
    ScreenExit {
        status: i32,
    },
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Ok => write!(f, "ok"),
            Classification::Diff => write!(f, "diff"),
            Classification::BadExitCode { expected, actual } => match actual {
                Some(actual) => write!(f, "bad exit code: expected {expected}, got {actual}"),
                None => write!(f, "bad exit code: expected {expected}, got none"),
            },
            Classification::Memcheck { exit_code } => match exit_code {
                Some(code) => write!(f, "memcheck: checker exited {code}"),
                None => write!(f, "memcheck: checker died on a signal"),
            },
            Classification::EarlyTermination { fed, total } => {
                write!(f, "early termination: subject exited after {fed} of {total} lines fed")
            }
            Classification::FeedFailure { line, status, stderr } => {
                write!(f, "stuff failure: exit {status} feeding line {line}; stderr={}", stderr.trim())
            }
            Classification::ContentRejected { line, offending } => {
                write!(f, "content rejected: line {line} contains {offending:?}")
            }
            Classification::ScreenExit { status } => {
                write!(f, "screen exit: launcher exited {status}")
            }
        }
    }
}

/// Raw results of the spawn/feed/wait phase, before classification.
struct CaseRun {
    /// A session condition that preempts every later gate.
    interrupted: Option<Classification>,
    exit_code: Option<i32>,
    /// Direct runs must produce an exit code; session runs may legitimately
    /// not (the subject never exited inside the window), in which case the
    /// exit-code gate is skipped and the case is judged on output alone.
    exit_code_required: bool,
    actual_text: Option<String>,
}

pub struct CaseRunner {
    executable: PathBuf,
    throttle: Throttle,
    stuff: StuffPolicy,
    require_tty: RequireTty,
    memcheck: Option<MemcheckConfig>,
    log_input: bool,
}

impl CaseRunner {
    pub fn new(
        executable: PathBuf,
        throttle: Throttle,
        stuff: StuffPolicy,
        require_tty: RequireTty,
        memcheck: Option<MemcheckConfig>,
        log_input: bool,
    ) -> Self {
        CaseRunner {
            executable,
            throttle,
            stuff,
            require_tty,
            memcheck,
            log_input,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Run one fixture to a classified outcome. `Err` here means something
    /// genuinely unexpected (I/O against the harness itself); subject
    /// failures of every kind come back as failing outcomes.
    pub async fn run(&self, fixture: &Fixture) -> Result<Outcome> {
        let expected_text = fixture
            .expected_file
            .as_deref()
            .map(|path| {
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read expected file {}", path.display()))
            })
            .transpose()?;

        let workdir = tempfile::Builder::new()
            .prefix("proctor-case-")
            .tempdir()
            .context("failed to create case working directory")?;

        let use_session = match self.require_tty {
            RequireTty::Always => true,
            RequireTty::Never => false,
            RequireTty::Auto => fixture.has_input(),
        };
        debug!(
            executable = %self.executable.display(),
            case = %fixture.identifier(),
            use_session,
            "running case"
        );

        let run = if use_session {
            self.run_in_session(fixture, workdir.path()).await?
        } else {
            self.run_direct(fixture, workdir.path()).await?
        };

        self.classify(fixture, expected_text, run, workdir.path())
            .await
        // workdir dropped here; the case directory is removed however the
        // run ended
    }

    /// Plain synchronous invocation for cases that need no terminal: capture
    /// stdout and exit code directly, no pacing.
    async fn run_direct(&self, fixture: &Fixture, workdir: &Path) -> Result<CaseRun> {
        let stdin_text = self.read_input(fixture)?;

        let mut cmd = Command::new(&self.executable);
        cmd.args(&fixture.args)
            .current_dir(workdir)
            .stdin(if stdin_text.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &fixture.env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.executable.display()))?;
        if let Some(text) = &stdin_text {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(text.as_bytes())
                .await
                .context("failed to pipe recorded input")?;
        }

        match tokio::time::timeout(self.throttle.processing_timeout, child.wait_with_output())
            .await
        {
            Ok(output) => {
                let output = output.context("failed to collect subject output")?;
                Ok(CaseRun {
                    interrupted: None,
                    exit_code: output.status.code(),
                    exit_code_required: true,
                    actual_text: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                })
            }
            Err(_) => {
                // the child is killed as the in-flight future drops
                warn!(
                    executable = %self.executable.display(),
                    case = %fixture.identifier(),
                    "subject did not finish within {:?}",
                    self.throttle.processing_timeout
                );
                Ok(CaseRun {
                    interrupted: None,
                    exit_code: None,
                    exit_code_required: true,
                    actual_text: None,
                })
            }
        }
    }

    /// Session-backed run: spawn under the multiplexer, pace the recorded
    /// input in as typed, wait for natural termination, read the capture log.
    async fn run_in_session(&self, fixture: &Fixture, workdir: &Path) -> Result<CaseRun> {
        let mut session = ScreenSession::new(workdir);
        let started = session
            .start(
                &self.executable,
                &fixture.args,
                fixture.env.iter().flatten(),
            )
            .await?;
        if let StartOutcome::LauncherFailed { status, stderr } = started {
            warn!(
                executable = %self.executable.display(),
                status,
                stderr = stderr.trim(),
                "session launcher failed"
            );
            return Ok(CaseRun {
                interrupted: Some(Classification::ScreenExit { status }),
                exit_code: None,
                exit_code_required: false,
                actual_text: None,
            });
        }

        // settle pause: let the subject reach its first read
        tokio::time::sleep(self.throttle.pause).await;

        let input_text = self.read_input(fixture)?.unwrap_or_default();
        let lines: Vec<&str> = input_text.split_inclusive('\n').collect();

        if let Some(await_output) = &self.throttle.await_output {
            if !lines.is_empty() {
                self.await_first_output(&session, await_output).await?;
            }
        }

        let mut interrupted = None;
        for (i, line) in lines.iter().enumerate() {
            tokio::time::sleep(self.throttle.pause).await;
            if self.log_input {
                debug!(case = %fixture.identifier(), line = i + 1, content = ?line, "feeding");
            }
            match session.feed(line, &self.stuff).await? {
                FeedOutcome::Fed => {}
                FeedOutcome::EarlyTermination => {
                    interrupted = Some(Classification::EarlyTermination {
                        fed: session.stuffs(),
                        total: lines.len(),
                    });
                    break;
                }
                FeedOutcome::ContentRejected { offending } => {
                    interrupted = Some(Classification::ContentRejected {
                        line: i + 1,
                        offending,
                    });
                    break;
                }
                FeedOutcome::TransmissionFailure { status, stderr } => {
                    interrupted = Some(Classification::FeedFailure {
                        line: i + 1,
                        status,
                        stderr,
                    });
                    break;
                }
            }
        }

        if interrupted.is_none() {
            if self.stuff.eof {
                session.send_end_of_input().await?;
            }
            let terminated = session
                .await_termination(self.throttle.processing_timeout, self.throttle.poll)
                .await?;
            if !terminated {
                warn!(
                    executable = %self.executable.display(),
                    case = %fixture.identifier(),
                    "subject did not terminate within {:?}; judging captured output",
                    self.throttle.processing_timeout
                );
            }
        }

        session.teardown().await;
        let actual_text = session.read_log(true)?;
        let exit_code = session.exit_code();
        Ok(CaseRun {
            interrupted,
            exit_code,
            exit_code_required: false,
            actual_text,
        })
    }

    /// Bounded poll for the subject's first non-whitespace output.
    async fn await_first_output(
        &self,
        session: &ScreenSession,
        await_output: &AwaitOutput,
    ) -> Result<()> {
        for _ in 0..await_output.max_polls {
            if let Some(log) = session.read_log(true)? {
                if !log.trim().is_empty() {
                    return Ok(());
                }
            }
            tokio::time::sleep(await_output.interval).await;
        }
        debug!("subject produced no output before the feed deadline; feeding anyway");
        Ok(())
    }

    fn read_input(&self, fixture: &Fixture) -> Result<Option<String>> {
        fixture
            .input_file
            .as_deref()
            .map(|path| {
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read input file {}", path.display()))
            })
            .transpose()
    }

    async fn classify(
        &self,
        fixture: &Fixture,
        expected_text: Option<String>,
        run: CaseRun,
        workdir: &Path,
    ) -> Result<Outcome> {
        let outcome = |passed: bool, actual_text: Option<String>, message: String| Outcome {
            passed,
            executable: self.executable.clone(),
            fixture: fixture.clone(),
            expected_text: expected_text.clone(),
            actual_text,
            message,
        };

        if let Some(classification) = run.interrupted {
            return Ok(outcome(false, run.actual_text, classification.to_string()));
        }

        let exit_matched = match run.exit_code {
            Some(code) => code == fixture.expected_exit_code,
            // only session runs may lack an exit code; judge on output alone
            None => !run.exit_code_required,
        };
        if !exit_matched {
            let classification = Classification::BadExitCode {
                expected: fixture.expected_exit_code,
                actual: run.exit_code,
            };
            return Ok(outcome(false, run.actual_text, classification.to_string()));
        }

        if let Some(config) = &self.memcheck {
            if config.applies_to(fixture) {
                let stdin_text = self.read_input(fixture)?;
                let checked = config
                    .run(
                        &self.executable,
                        &fixture.args,
                        &fixture.env,
                        workdir,
                        stdin_text.as_deref(),
                        self.throttle.processing_timeout * 5,
                    )
                    .await?;
                if !checked.clean(fixture.expected_exit_code) {
                    debug!(stderr = checked.stderr.trim(), "memcheck reported errors");
                    let classification = Classification::Memcheck {
                        exit_code: checked.exit_code,
                    };
                    return Ok(outcome(false, run.actual_text, classification.to_string()));
                }
            }
        }

        let Some(expected) = expected_text.as_deref() else {
            // exit-code-only fixture: output is never inspected
            return Ok(outcome(true, run.actual_text, Classification::Ok.to_string()));
        };

        let actual = run.actual_text.unwrap_or_default();
        if evaluator::texts_match(expected, &actual) {
            Ok(outcome(true, Some(actual), Classification::Ok.to_string()))
        } else {
            Ok(outcome(false, Some(actual), Classification::Diff.to_string()))
        }
    }
}
