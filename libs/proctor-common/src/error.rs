use std::path::PathBuf;

use thiserror::Error;

/// Errors a user can react to and resolve: malformed fixture definitions,
/// running outside a project, bad option syntax. These abort before (or
/// instead of) a suite and map to the configuration-error process exit code.
///
/// Failures of subject programs are never represented here; once a suite is
/// running they are captured as [`crate::Outcome`] values.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("this directory is not inside a proctor project; create {0} at the project root first")]
    RootNotFound(&'static str),

    #[error("failed to read {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed project config {path}")]
    MalformedConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("fixture file name matches no recognized pattern: {0}")]
    UnrecognizedFixtureName(String),

    #[error("executable not found: {0} (has the project been built?)")]
    ExecutableNotFound(PathBuf),

    #[error("no testable executables found under {0}")]
    NoExecutables(PathBuf),

    #[error("unknown memcheck option key: {0:?}")]
    UnknownMemcheckKey(String),

    #[error("bad memcheck option value for {key:?}: {value:?}")]
    BadMemcheckValue { key: String, value: String },
}
