use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProjectError;

/// Marker file that identifies a project root.
pub const CONFIG_FILENAME: &str = ".proctor.json";

const DEFAULT_BUILD_DIR: &str = "build";

fn default_build_dir() -> String {
    DEFAULT_BUILD_DIR.to_string()
}

/// Project-level configuration, stored as JSON at the project root.
///
/// Loaded once per run and passed by reference into the components that need
/// it; there is deliberately no process-wide cache, so a config written with
/// [`ProjectConfig::store`] is only visible to callers that reload it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Basename of the per-question build output directory; the default
    /// executable for question directory `q` is `q/<build_dir>/<q-name>`.
    #[serde(default = "default_build_dir")]
    pub build_dir: String,

    /// Overrides mapping a question name to an executable path (absolute,
    /// or relative to the question directory).
    #[serde(default)]
    pub executables: BTreeMap<String, String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            build_dir: default_build_dir(),
            executables: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    pub fn load(project_root: &Path) -> Result<Self, ProjectError> {
        let path = project_root.join(CONFIG_FILENAME);
        let content = fs::read_to_string(&path).map_err(|source| ProjectError::Unreadable {
            path: path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(ProjectConfig::default());
        }
        serde_json::from_str(&content)
            .map_err(|source| ProjectError::MalformedConfig { path, source })
    }

    pub fn store(&self, project_root: &Path) -> Result<(), ProjectError> {
        let path = project_root.join(CONFIG_FILENAME);
        let content = serde_json::to_string_pretty(self)
            .map_err(|source| ProjectError::MalformedConfig {
                path: path.clone(),
                source,
            })?;
        fs::write(&path, content).map_err(|source| ProjectError::Unwritable { path, source })
    }

    /// Resolve the executable for a question directory, honoring the
    /// `executables` override map before falling back to the conventional
    /// `<question>/<build_dir>/<question-name>` location.
    pub fn resolve_executable(&self, question_dir: &Path) -> PathBuf {
        let name = question_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.executables.get(&name) {
            Some(overridden) => {
                let overridden = Path::new(overridden);
                if overridden.is_absolute() {
                    overridden.to_path_buf()
                } else {
                    question_dir.join(overridden)
                }
            }
            None => question_dir.join(&self.build_dir).join(&name),
        }
    }
}

/// Walk upward from `start` looking for the directory that contains
/// [`CONFIG_FILENAME`].
pub fn find_project_root(start: &Path) -> Result<PathBuf, ProjectError> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(CONFIG_FILENAME).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(ProjectError::RootNotFound(CONFIG_FILENAME));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_empty_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "  \n").unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.build_dir, "build");
        assert!(config.executables.is_empty());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "{not json").unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectError::MalformedConfig { .. }));
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.build_dir = "cmake-build".to_string();
        config
            .executables
            .insert("q1".to_string(), "/usr/bin/true".to_string());
        config.store(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.build_dir, "cmake-build");
        assert_eq!(loaded.executables.get("q1").unwrap(), "/usr/bin/true");
    }

    #[test]
    fn resolve_executable_conventional_layout() {
        let config = ProjectConfig::default();
        let exe = config.resolve_executable(Path::new("/proj/q3"));
        assert_eq!(exe, PathBuf::from("/proj/q3/build/q3"));
    }

    #[test]
    fn resolve_executable_override_relative_and_absolute() {
        let mut config = ProjectConfig::default();
        config
            .executables
            .insert("q3".to_string(), "out/custom".to_string());
        assert_eq!(
            config.resolve_executable(Path::new("/proj/q3")),
            PathBuf::from("/proj/q3/out/custom")
        );

        config
            .executables
            .insert("q3".to_string(), "/opt/bin/q3".to_string());
        assert_eq!(
            config.resolve_executable(Path::new("/proj/q3")),
            PathBuf::from("/opt/bin/q3")
        );
    }

    #[test]
    fn find_project_root_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "{}").unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        let root = find_project_root(&nested).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn find_project_root_fails_outside_project() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_project_root(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectError::RootNotFound(_)));
    }
}
