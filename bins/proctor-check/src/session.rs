/// Terminal Session Controller - screen-backed subject execution
///
/// **Core Responsibility:**
/// Run one subject executable inside a GNU `screen` session so that
/// line-buffered interactive reads from standard input behave as they would
/// for a human at a real terminal, and capture all terminal output (prompts
/// issued without a trailing newline included) to a log file in the case
/// working directory.
///
/// **Critical Architectural Boundary:**
/// - The session knows HOW to spawn, feed, and tear down the multiplexer
/// - The session does NOT decide pass/fail
/// - The session does NOT know fixture semantics
/// - Expected-but-rare conditions (the process exited before a feed, the
///   transmission command itself failed, the formatting policy rejected a
///   line) are returned as `FeedOutcome` values for the caller to inspect,
///   never raised as errors
///
/// **Why screen:**
/// Many subject programs read stdin through formatted/line-buffered reads
/// whose buffering and prompt flushing differ between a pipe and a terminal.
/// Feeding through a pipe would silently change subject behavior; the
/// multiplexer approximates the terminal a human would use.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tokio::process::Command;
use tracing::{debug, warn};

/// Basename of the capture log `screen -L` writes in the working directory.
pub const SESSION_LOG_BASENAME: &str = "screenlog.0";

/// Basename of the file the launch wrapper writes the subject's exit code to.
pub const EXIT_CODE_BASENAME: &str = ".proctor-exit";

/// End-of-transmission control byte, the terminal equivalent of closing stdin.
const EOT: &str = "\u{0004}";

/// How input lines are prepared before transmission via `screen -X stuff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StuffMode {
    /// Escape characters the transmission mechanism interprets and append a
    /// trailing newline when the line lacks one.
    Auto,
    /// Forbid special characters outright; a line containing one fails the
    /// case instead of being silently mutated.
    Strict,
}

/// Input-line formatting policy for a session.
///
/// The same `rejected` set drives both modes: auto escapes those characters,
/// strict refuses lines containing them, so the two modes cannot drift.
#[derive(Debug, Clone)]
pub struct StuffPolicy {
    pub mode: StuffMode,
    /// Send end-of-transmission after the last input line, for subjects that
    /// read stdin to exhaustion.
    pub eof: bool,
    /// Characters `screen -X stuff` gives special meaning to.
    pub rejected: Vec<char>,
}

impl StuffPolicy {
    pub fn new(mode: StuffMode, eof: bool) -> Self {
        StuffPolicy {
            mode,
            eof,
            rejected: vec!['^', '\\'],
        }
    }

    pub fn auto() -> Self {
        StuffPolicy::new(StuffMode::Auto, false)
    }

    /// Prepare one line for transmission, or report the offending character
    /// in strict mode. The input line is never mutated on rejection.
    pub fn prepare(&self, line: &str) -> std::result::Result<String, char> {
        match self.mode {
            StuffMode::Strict => {
                if let Some(offending) = line.chars().find(|c| self.rejected.contains(c)) {
                    return Err(offending);
                }
                Ok(line.to_string())
            }
            StuffMode::Auto => {
                let mut prepared = String::with_capacity(line.len() + 1);
                for c in line.chars() {
                    if self.rejected.contains(&c) {
                        prepared.push('\\');
                    }
                    prepared.push(c);
                }
                if !prepared.ends_with('\n') {
                    prepared.push('\n');
                }
                Ok(prepared)
            }
        }
    }
}

/// Result of one feed attempt, inspected by the caller.
#[derive(Debug)]
pub enum FeedOutcome {
    /// Line transmitted.
    Fed,
    /// The subject exited before this line could be fed; no transmission was
    /// attempted and no further feeds may be.
    EarlyTermination,
    /// Strict formatting policy refused the line before transmission.
    ContentRejected { offending: char },
    /// The `stuff` command itself exited nonzero.
    TransmissionFailure { status: i32, stderr: String },
}

/// Result of spawning the session launcher.
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    /// The `screen` launcher exited nonzero; the subject never ran.
    LauncherFailed { status: i32, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running,
    /// The subject exited and the session collapsed on its own.
    Terminated,
    /// The termination wait elapsed with the session still alive.
    TimedOut,
    /// Teardown had to force the session down.
    Killed,
}

/// One screen session wrapping one subject process.
///
/// The session name is unique per case so concurrent cases never collide.
/// Dropping a session that is still alive tears it down synchronously, so a
/// panicking or erroring caller cannot leak a subject process.
pub struct ScreenSession {
    name: String,
    workdir: PathBuf,
    state: SessionState,
    stuffs: u32,
}

impl ScreenSession {
    pub fn new(workdir: &Path) -> Self {
        ScreenSession {
            name: format!("proctor-{}", uuid::Uuid::new_v4()),
            workdir: workdir.to_path_buf(),
            state: SessionState::NotStarted,
            stuffs: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of lines successfully transmitted so far.
    pub fn stuffs(&self) -> u32 {
        self.stuffs
    }

    /// Spawn the multiplexer detached with the subject command. Returns as
    /// soon as the launcher exits; the subject keeps running inside the
    /// session. Side effect: `screen -L` creates the capture log in the
    /// working directory.
    ///
    /// The subject is wrapped in `sh` so its exit code survives the session
    /// collapse, written to a file the runner reads afterward.
    pub async fn start<I, K, V>(
        &mut self,
        executable: &Path,
        args: &[String],
        env: I,
    ) -> Result<StartOutcome>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<std::ffi::OsStr>,
        V: AsRef<std::ffi::OsStr>,
    {
        let wrapper = format!("\"$0\" \"$@\"; printf '%s' \"$?\" > {}", EXIT_CODE_BASENAME);
        let output = Command::new("screen")
            .arg("-L")
            .arg("-Logfile")
            .arg(SESSION_LOG_BASENAME)
            .arg("-S")
            .arg(&self.name)
            .arg("-d")
            .arg("-m")
            .arg("sh")
            .arg("-c")
            .arg(wrapper)
            .arg(executable)
            .args(args)
            .envs(env)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn screen launcher")?;

        if !output.status.success() {
            let status = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Ok(StartOutcome::LauncherFailed { status, stderr });
        }

        self.state = SessionState::Running;
        debug!(session = %self.name, workdir = %self.workdir.display(), "session started");

        // The default log flush interval would delay capture by seconds;
        // flush every write. Tolerated if the subject already exited and
        // collapsed the session.
        let _ = self
            .screen_command(&["logfile", "flush", "0"])
            .output()
            .await;

        Ok(StartOutcome::Started)
    }

    fn screen_command(&self, command: &[&str]) -> Command {
        let mut cmd = Command::new("screen");
        cmd.arg("-S").arg(&self.name).arg("-X").args(command);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Non-blocking liveness poll: does the session still exist?
    pub async fn is_alive(&self) -> Result<bool> {
        let status = Command::new("screen")
            .arg("-S")
            .arg(&self.name)
            .arg("-Q")
            .arg("select")
            .arg(".")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("failed to query screen session")?;
        Ok(status.success())
    }

    /// Transmit one line as if typed at the controlling terminal, after
    /// applying the formatting policy. A dead session is reported as
    /// `EarlyTermination` before any transmission attempt.
    pub async fn feed(&mut self, line: &str, policy: &StuffPolicy) -> Result<FeedOutcome> {
        if self.state != SessionState::Running || !self.is_alive().await? {
            if self.state == SessionState::Running {
                self.state = SessionState::Terminated;
            }
            return Ok(FeedOutcome::EarlyTermination);
        }

        let prepared = match policy.prepare(line) {
            Ok(prepared) => prepared,
            Err(offending) => return Ok(FeedOutcome::ContentRejected { offending }),
        };

        let output = self
            .screen_command(&["stuff", prepared.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to run screen stuff")?;

        if !output.status.success() {
            let status = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Ok(FeedOutcome::TransmissionFailure { status, stderr });
        }

        self.stuffs += 1;
        Ok(FeedOutcome::Fed)
    }

    /// Transmit end-of-transmission, for subjects that read stdin until
    /// exhaustion. Best-effort: the subject may already have exited.
    pub async fn send_end_of_input(&mut self) -> Result<()> {
        if self.state != SessionState::Running {
            return Ok(());
        }
        let output = self
            .screen_command(&["stuff", EOT])
            .output()
            .await
            .context("failed to transmit end-of-input")?;
        if !output.status.success() {
            debug!(session = %self.name, "end-of-input transmission failed; session likely collapsed");
        }
        Ok(())
    }

    /// Block up to `timeout` for the subject to exit (the session collapses
    /// with it). Returns whether termination was observed; on timeout the
    /// caller decides whether to force the session down.
    pub async fn await_termination(&mut self, timeout: Duration, poll: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive().await? {
                self.state = SessionState::Terminated;
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                self.state = SessionState::TimedOut;
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Request graceful session teardown. "No such session" is a successful
    /// no-op: the subject usually exits on its own and collapses the session
    /// before we get here.
    pub async fn quit(&mut self) -> Result<()> {
        let status = self
            .screen_command(&["quit"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("failed to run screen quit")?;
        if !status.success() {
            debug!(session = %self.name, code = status.code().unwrap_or(-1), "quit returned nonzero; session probably already gone");
        }
        Ok(())
    }

    /// Force the session down, escalating if the first attempt does not take
    /// effect. Used only when `quit` left the session alive.
    pub async fn kill(&mut self) -> Result<()> {
        let _ = self
            .screen_command(&["kill"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        if self.is_alive().await.unwrap_or(false) {
            let _ = self
                .screen_command(&["quit"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.is_alive().await.unwrap_or(false) {
                warn!(session = %self.name, "session survived kill escalation");
            }
        }
        self.state = SessionState::Killed;
        Ok(())
    }

    /// Graceful-then-forceful cleanup. Always safe to call; never errors.
    pub async fn teardown(&mut self) {
        if self.state == SessionState::NotStarted {
            return;
        }
        if let Err(err) = self.quit().await {
            warn!(session = %self.name, error = %err, "quit failed during teardown");
        }
        match self.is_alive().await {
            Ok(true) => {
                warn!(session = %self.name, "session still alive after quit; killing");
                let _ = self.kill().await;
            }
            Ok(false) => {
                if self.state == SessionState::Running || self.state == SessionState::TimedOut {
                    self.state = SessionState::Terminated;
                }
            }
            Err(err) => {
                warn!(session = %self.name, error = %err, "liveness check failed during teardown");
            }
        }
    }

    /// Captured terminal output. Carriage-return/linefeed pairs the terminal
    /// writes are normalized to bare linefeeds; the text is otherwise
    /// untouched.
    pub fn read_log(&self, tolerate_missing: bool) -> Result<Option<String>> {
        let path = self.workdir.join(SESSION_LOG_BASENAME);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text.replace("\r\n", "\n"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && tolerate_missing => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read session log {}", path.display()))
            }
        }
    }

    /// The subject's exit code, recovered from the launch wrapper's record.
    /// Absent when the subject never exited inside the session window.
    pub fn exit_code(&self) -> Option<i32> {
        let path = self.workdir.join(EXIT_CODE_BASENAME);
        let text = std::fs::read_to_string(path).ok()?;
        text.trim().parse().ok()
    }
}

/// Cleanup guard: a session dropped while alive is torn down synchronously,
/// so a panicking case cannot leak a subject process.
impl Drop for ScreenSession {
    fn drop(&mut self) {
        if self.state != SessionState::Running && self.state != SessionState::TimedOut {
            return;
        }
        for command in [["quit"], ["kill"]] {
            let _ = std::process::Command::new("screen")
                .arg("-S")
                .arg(&self.name)
                .arg("-X")
                .args(command)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        }
        warn!(session = %self.name, "session torn down by drop guard");
    }
}
