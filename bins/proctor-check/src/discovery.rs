/// Fixture Discovery - naming-convention scan of a question directory.
///
/// An expected-output file anchors each test case; sibling input/env/args
/// files are derived from its basename and included only when present on
/// disk. Fixture naming is a contract the fixture author must honor: an
/// expected-looking basename that matches no recognized pattern aborts the
/// whole suite for that executable rather than being silently skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use proctor_common::{Fixture, ProjectError};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Sibling basenames derived from an expected-output basename.
#[derive(Debug, PartialEq, Eq)]
struct Counterparts {
    input: String,
    env: String,
    args: String,
}

/// Does this basename claim to be an expected-output file? Anything that
/// does but fails [`derive_counterparts`] is a discovery error.
fn is_expected_candidate(basename: &str) -> bool {
    basename.starts_with("expected") || basename.contains("-expected")
}

/// Map an expected-output basename to its sibling basenames.
///
/// Recognized patterns:
/// - `expected.txt`
/// - `<id>-expected.txt`
/// - `<id>-expected-output.txt`
/// - `expected-output<id>.txt` (deprecated prefix form)
fn derive_counterparts(expected_basename: &str) -> Result<Counterparts, ProjectError> {
    if expected_basename == "expected.txt" {
        return Ok(Counterparts {
            input: "input.txt".to_string(),
            env: "env.txt".to_string(),
            args: "args.txt".to_string(),
        });
    }
    if let Some(id) = expected_basename
        .strip_suffix("-expected.txt")
        .or_else(|| expected_basename.strip_suffix("-expected-output.txt"))
    {
        return Ok(Counterparts {
            input: format!("{id}-input.txt"),
            env: format!("{id}-env.txt"),
            args: format!("{id}-args.txt"),
        });
    }
    if let Some(id) = expected_basename
        .strip_prefix("expected-output")
        .and_then(|rest| rest.strip_suffix(".txt"))
    {
        warn!(
            basename = expected_basename,
            "deprecated expected-output prefix naming; prefer <id>-expected.txt"
        );
        return Ok(Counterparts {
            input: format!("input{id}.txt"),
            env: format!("env{id}.txt"),
            args: format!("args{id}.txt"),
        });
    }
    Err(ProjectError::UnrecognizedFixtureName(
        expected_basename.to_string(),
    ))
}

/// Line-oriented `KEY=VALUE` environment file. Only the first `=` splits, so
/// values may themselves contain `=`; a line with no `=` is a key with an
/// empty value.
fn read_env(path: &Path) -> Result<BTreeMap<String, String>, ProjectError> {
    let text = fs::read_to_string(path).map_err(|source| ProjectError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut env = BTreeMap::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let (key, value) = line.split_once('=').unwrap_or((line, ""));
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// One CLI argument per line, newline-stripped.
fn read_args(path: &Path) -> Result<Vec<String>, ProjectError> {
    let text = fs::read_to_string(path).map_err(|source| ProjectError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.lines().map(str::to_string).collect())
}

/// Scan a question directory for fixtures, ordered by identifier.
///
/// A directory with zero recognized expected-output files yields exactly one
/// fixture that only requires the subject to exit with code 0.
pub fn detect_fixtures(q_dir: &Path) -> Result<Vec<Fixture>, ProjectError> {
    let mut fixtures = Vec::new();
    for entry in WalkDir::new(q_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let basename = entry.file_name().to_string_lossy().into_owned();
        if !is_expected_candidate(&basename) {
            continue;
        }
        let counterparts = derive_counterparts(&basename)?;
        let dir = entry.path().parent().unwrap_or(q_dir);

        let input_file = Some(dir.join(&counterparts.input)).filter(|p| p.is_file());
        let env_file = Some(dir.join(&counterparts.env)).filter(|p| p.is_file());
        let args_file = Some(dir.join(&counterparts.args)).filter(|p| p.is_file());

        let env = env_file.as_deref().map(read_env).transpose()?;
        let args = args_file
            .as_deref()
            .map(read_args)
            .transpose()?
            .unwrap_or_default();

        fixtures.push(Fixture::new(
            input_file,
            Some(entry.path().to_path_buf()),
            env,
            args,
        ));
    }

    if fixtures.is_empty() {
        debug!(dir = %q_dir.display(), "no fixture files; requiring clean exit only");
        return Ok(vec![Fixture::exit_code_only()]);
    }

    fixtures.sort_by_key(Fixture::identifier);
    Ok(fixtures)
}
