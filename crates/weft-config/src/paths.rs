//! Where weft looks for configuration files.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// File name of the checked-in project configuration.
pub const PROJECT_FILE: &str = "weft.toml";

/// File name of the per-checkout override, usually gitignored.
pub const LOCAL_FILE: &str = "weft.local.toml";

/// Configuration file locations, in ascending precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Per-user defaults, when the platform has a config directory.
    pub user: Option<PathBuf>,
    /// `<project>/weft.toml`.
    pub project: PathBuf,
    /// `<project>/weft.local.toml`.
    pub local: PathBuf,
}

impl Paths {
    /// Resolves the files for `project_dir`.
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        let dir = project_dir.as_ref();
        Self {
            user: user_config_file(),
            project: dir.join(PROJECT_FILE),
            local: dir.join(LOCAL_FILE),
        }
    }

    /// Drops the per-user file.
    #[must_use]
    pub fn without_user(mut self) -> Self {
        self.user = None;
        self
    }

    /// Returns the files that exist, lowest precedence first.
    pub fn existing(&self) -> Vec<&Path> {
        self.user
            .iter()
            .map(PathBuf::as_path)
            .chain([self.project.as_path(), self.local.as_path()])
            .filter(|path| path.is_file())
            .collect()
    }
}

/// `config.toml` in the platform config directory, e.g. `~/.config/weft/`.
pub fn user_config_file() -> Option<PathBuf> {
    ProjectDirs::from("dev", "weft", "weft").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_user_file_location() {
        // Absent on platforms without a home directory.
        if let Some(file) = user_config_file() {
            assert!(file.to_string_lossy().contains("weft"));
            assert!(file.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_project_files() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let paths = Paths::for_project(temp_dir.path()).without_user();

        assert_eq!(paths.project, temp_dir.path().join("weft.toml"));
        assert_eq!(paths.local, temp_dir.path().join("weft.local.toml"));
        assert!(paths.user.is_none());
    }

    #[test]
    fn test_existing_keeps_precedence_order() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let paths = Paths::for_project(temp_dir.path()).without_user();
        assert!(paths.existing().is_empty());

        fs::write(&paths.local, "").expect("Failed to write local config");
        fs::write(&paths.project, "").expect("Failed to write project config");

        assert_eq!(
            paths.existing(),
            vec![paths.project.as_path(), paths.local.as_path()]
        );
    }
}
