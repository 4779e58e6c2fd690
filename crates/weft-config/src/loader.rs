//! Layered configuration loading.
//!
//! Sources are merged lowest precedence first: built-in defaults, the user
//! file, `weft.toml`, `weft.local.toml`, then `WEFT_*` environment variables.
//! The merged result is validated before it is returned.

use crate::{Paths, WeftConfig};
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};

/// Builder for a [`WeftConfig`] merged from every source.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Loads from the current directory with the `WEFT` prefix.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "WEFT".to_string(),
            user_config: true,
        }
    }

    #[must_use]
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Replaces the `WEFT` environment prefix.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignores the per-user config file.
    #[must_use]
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Returns the config file locations this loader consults.
    pub fn paths(&self) -> Paths {
        let paths = Paths::for_project(&self.project_dir);
        if self.user_config {
            paths
        } else {
            paths.without_user()
        }
    }

    /// Merges every source and validates the result.
    pub fn load(self) -> Result<WeftConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&WeftConfig::default())?);

        for file in self.paths().existing() {
            builder = builder.add_source(File::from(file).format(FileFormat::Toml));
        }

        // WEFT_SERVER__POOL_SIZE: keys contain underscores, so sections are
        // split on a double one.
        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let weft_config: WeftConfig = builder
            .build()
            .context("Failed to merge configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        weft_config
            .validate()
            .context("Configuration failed validation")?;
        Ok(weft_config)
    }

    /// Like [`load`](Self::load), falling back to the built-in defaults on
    /// any error.
    pub fn load_or_default(self) -> WeftConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("WEFT_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path())
            .load()
            .expect("Failed to load config");

        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
        assert_eq!(config.server.delimiter, "\r\n");
        assert_eq!(config.server.write_timeout_ms, 5000);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[server]
bind_address = "0.0.0.0:9000"
delimiter = "\n"
pool_size = 16

[logging]
level = "debug"
"#;
        fs::write(project_dir.join("weft.toml"), config_content).expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.server.bind_address, "0.0.0.0:9000");
        assert_eq!(config.server.delimiter, "\n");
        assert_eq!(config.server.pool_size, 16);
        assert_eq!(config.server.buffer_capacity, 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("weft.toml"),
            r#"
[server]
bind_address = "127.0.0.1:7000"
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("weft.local.toml"),
            r#"
[server]
bind_address = "localhost:9999"
"#,
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.server.bind_address, "localhost:9999");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(project_dir.join("weft.toml"), "[server]\ndelimiter = \"\"\n")
            .expect("Failed to write config");

        let err = loader(project_dir).load().unwrap_err();
        assert!(format!("{err:#}").contains("server.delimiter"));
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(project_dir.join("weft.toml"), "[server\nbroken").expect("Failed to write config");

        let config = loader(project_dir).load_or_default();
        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
    }

    #[test]
    fn test_paths_follow_loader_settings() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let paths = loader(temp_dir.path()).paths();

        assert!(paths.user.is_none());
        assert_eq!(paths.project, temp_dir.path().join("weft.toml"));
    }

    // Environment overrides are not exercised here: mutating the process
    // environment races with other tests. In actual usage:
    //
    // WEFT_SERVER__BIND_ADDRESS=0.0.0.0:7100
    // WEFT_SERVER__POOL_SIZE=256
    // WEFT_LOGGING__LEVEL=debug
}
