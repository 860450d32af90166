use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One test case's full specification: recorded input, expected output,
/// environment, CLI arguments, and expected exit code.
///
/// A fixture with no `expected_file` is an exit-code-only check: the subject
/// merely has to terminate with `expected_exit_code` and its output is never
/// inspected. Fixtures are immutable once discovered and serve as keys of the
/// per-suite outcome map, hence the `Eq + Hash` derives and the ordered
/// `BTreeMap` for the environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fixture {
    pub input_file: Option<PathBuf>,
    pub expected_file: Option<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
    pub args: Vec<String>,
    pub expected_exit_code: i32,
}

impl Fixture {
    pub fn new(
        input_file: Option<PathBuf>,
        expected_file: Option<PathBuf>,
        env: Option<BTreeMap<String, String>>,
        args: Vec<String>,
    ) -> Self {
        Fixture {
            input_file,
            expected_file,
            env,
            args,
            expected_exit_code: 0,
        }
    }

    /// A fixture that only requires the subject to exit with code 0.
    pub fn exit_code_only() -> Self {
        Fixture::new(None, None, None, Vec::new())
    }

    pub fn has_input(&self) -> bool {
        self.input_file.is_some()
    }

    /// Name used for sorting, log labels, and `--filter` glob matching:
    /// the basename of the input file if there is one, else of the expected
    /// file, else a fixed placeholder for exit-code-only fixtures.
    pub fn identifier(&self) -> String {
        self.input_file
            .as_deref()
            .or(self.expected_file.as_deref())
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<exit-code-only>".to_string())
    }
}

/// The recorded result of running one fixture: pass/fail, the texts that
/// were compared (absent for exit-code-only checks or when capture failed),
/// and a classification message (`ok`, `diff`, `bad exit code`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub passed: bool,
    pub executable: PathBuf,
    pub fixture: Fixture,
    pub expected_text: Option<String>,
    pub actual_text: Option<String>,
    pub message: String,
}

impl Outcome {
    pub fn label(&self) -> String {
        let exe = self
            .executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string());
        format!("{}: {}: {}", exe, self.fixture.identifier(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_prefers_input_basename() {
        let fixture = Fixture::new(
            Some(PathBuf::from("/q1/1-input.txt")),
            Some(PathBuf::from("/q1/1-expected.txt")),
            None,
            Vec::new(),
        );
        assert_eq!(fixture.identifier(), "1-input.txt");
    }

    #[test]
    fn identifier_falls_back_to_expected_then_placeholder() {
        let fixture = Fixture::new(
            None,
            Some(PathBuf::from("/q1/expected.txt")),
            None,
            Vec::new(),
        );
        assert_eq!(fixture.identifier(), "expected.txt");
        assert_eq!(Fixture::exit_code_only().identifier(), "<exit-code-only>");
    }

    #[test]
    fn exit_code_only_fixture_defaults() {
        let fixture = Fixture::exit_code_only();
        assert!(fixture.input_file.is_none());
        assert!(fixture.expected_file.is_none());
        assert!(fixture.env.is_none());
        assert!(fixture.args.is_empty());
        assert_eq!(fixture.expected_exit_code, 0);
    }
}
