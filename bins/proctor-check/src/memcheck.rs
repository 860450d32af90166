/// Memory-check pass configuration and invocation.
///
/// A secondary run of the subject under an external memory-error detector
/// (valgrind). Configured from a single query-string-like specification,
/// e.g. `applicability=auto&verbosity=quiet`; unknown keys are a
/// configuration error so typos fail fast instead of silently disabling the
/// pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use proctor_common::{Fixture, ProjectError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code the checker is told to use when it finds memory errors,
/// chosen to be distinguishable from ordinary subject exit codes.
pub const ERROR_EXIT_CODE: i32 = 99;

const DEFAULT_EXECUTABLE: &str = "valgrind";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applicability {
    /// Only fixtures without an input file; interactive subjects are not
    /// re-run under the checker.
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Normal,
    Quiet,
}

#[derive(Debug, Clone)]
pub struct MemcheckConfig {
    pub applicability: Applicability,
    pub verbosity: Verbosity,
    pub executable: Option<PathBuf>,
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        MemcheckConfig {
            applicability: Applicability::Auto,
            verbosity: Verbosity::Normal,
            executable: None,
        }
    }
}

impl MemcheckConfig {
    /// Parse a `key=value&key=value` specification. Recognized keys:
    /// `applicability`, `verbosity`, `executable`.
    pub fn parse(spec: &str) -> std::result::Result<Self, ProjectError> {
        let mut config = MemcheckConfig::default();
        for pair in spec.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let bad_value = || ProjectError::BadMemcheckValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "applicability" => {
                    config.applicability = match value {
                        "auto" => Applicability::Auto,
                        "always" => Applicability::Always,
                        "never" => Applicability::Never,
                        _ => return Err(bad_value()),
                    };
                }
                "verbosity" => {
                    config.verbosity = match value {
                        "normal" => Verbosity::Normal,
                        "quiet" => Verbosity::Quiet,
                        _ => return Err(bad_value()),
                    };
                }
                "executable" => {
                    if value.is_empty() {
                        return Err(bad_value());
                    }
                    config.executable = Some(PathBuf::from(value));
                }
                _ => return Err(ProjectError::UnknownMemcheckKey(key.to_string())),
            }
        }
        Ok(config)
    }

    pub fn applies_to(&self, fixture: &Fixture) -> bool {
        match self.applicability {
            Applicability::Always => true,
            Applicability::Never => false,
            Applicability::Auto => !fixture.has_input(),
        }
    }

    fn checker(&self) -> &Path {
        self.executable
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_EXECUTABLE))
    }

    /// Re-invoke the subject wrapped in the checker. Recorded input, when
    /// present, is piped to stdin; this pass is about memory errors, not
    /// terminal behavior.
    pub async fn run(
        &self,
        executable: &Path,
        args: &[String],
        env: &Option<BTreeMap<String, String>>,
        workdir: &Path,
        stdin_text: Option<&str>,
        timeout: Duration,
    ) -> Result<MemcheckOutcome> {
        let mut cmd = Command::new(self.checker());
        cmd.arg(format!("--error-exitcode={}", ERROR_EXIT_CODE));
        if self.verbosity == Verbosity::Quiet {
            cmd.arg("-q");
        }
        cmd.arg(executable)
            .args(args)
            .current_dir(workdir)
            .stdin(if stdin_text.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.checker().display()))?;
        if let Some(text) = stdin_text {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(text.as_bytes())
                .await
                .context("failed to pipe input to memcheck run")?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .context("memcheck run did not finish within the case timeout")?
            .context("failed to collect memcheck output")?;

        let exit_code = output.status.code();
        debug!(checker = %self.checker().display(), ?exit_code, "memcheck run finished");
        Ok(MemcheckOutcome {
            exit_code,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug)]
pub struct MemcheckOutcome {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl MemcheckOutcome {
    /// Clean iff the checker exited with the subject's expected code; memory
    /// errors surface as [`ERROR_EXIT_CODE`], signals as no code at all.
    pub fn clean(&self, expected_exit_code: i32) -> bool {
        self.exit_code == Some(expected_exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_from_empty_spec() {
        let config = MemcheckConfig::parse("").unwrap();
        assert_eq!(config.applicability, Applicability::Auto);
        assert_eq!(config.verbosity, Verbosity::Normal);
        assert!(config.executable.is_none());
    }

    #[test]
    fn parse_full_spec() {
        let config =
            MemcheckConfig::parse("applicability=always&verbosity=quiet&executable=/opt/vg")
                .unwrap();
        assert_eq!(config.applicability, Applicability::Always);
        assert_eq!(config.verbosity, Verbosity::Quiet);
        assert_eq!(config.executable.unwrap(), PathBuf::from("/opt/vg"));
    }

    #[test]
    fn parse_rejects_unknown_key() {
        let err = MemcheckConfig::parse("applicability=auto&verbose=quiet").unwrap_err();
        assert!(matches!(err, ProjectError::UnknownMemcheckKey(key) if key == "verbose"));
    }

    #[test]
    fn parse_rejects_bad_value() {
        let err = MemcheckConfig::parse("applicability=sometimes").unwrap_err();
        assert!(matches!(err, ProjectError::BadMemcheckValue { .. }));
    }

    #[test]
    fn auto_applies_only_without_input() {
        let config = MemcheckConfig::default();
        let no_input = Fixture::exit_code_only();
        let with_input = Fixture::new(
            Some(PathBuf::from("/q/1-input.txt")),
            Some(PathBuf::from("/q/1-expected.txt")),
            None,
            Vec::new(),
        );
        assert!(config.applies_to(&no_input));
        assert!(!config.applies_to(&with_input));

        let always = MemcheckConfig::parse("applicability=always").unwrap();
        assert!(always.applies_to(&with_input));
        let never = MemcheckConfig::parse("applicability=never").unwrap();
        assert!(!never.applies_to(&no_input));
    }

    #[test]
    fn clean_respects_expected_exit_code() {
        let outcome = MemcheckOutcome {
            exit_code: Some(0),
            stderr: String::new(),
        };
        assert!(outcome.clean(0));
        assert!(!outcome.clean(2));

        let errors = MemcheckOutcome {
            exit_code: Some(ERROR_EXIT_CODE),
            stderr: "definitely lost: 12 bytes".to_string(),
        };
        assert!(!errors.clean(0));
    }
}
