pub mod config;
pub mod error;
pub mod types;

pub use config::{find_project_root, ProjectConfig, CONFIG_FILENAME};
pub use error::ProjectError;
pub use types::{Fixture, Outcome};
