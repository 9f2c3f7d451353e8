//! Configuration loader with multi-source merging.

use crate::{Paths, Result, RoostConfig};
use std::fs;
use std::path::{Path, PathBuf};

/// Builder-style loader merging defaults, files, and environment.
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a loader using the default discovery order.
    pub fn new() -> Self {
        Self {
            config_file: None,
            env_prefix: "ROOST".to_string(),
        }
    }

    /// Load from an explicit file instead of the discovery order.
    pub fn with_config_file(mut self, file: impl AsRef<Path>) -> Self {
        self.config_file = Some(file.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "ROOST").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence:
    /// defaults, then the system (or explicit) file, then the local
    /// override, then environment variables.
    pub fn load(self) -> Result<RoostConfig> {
        let mut builder = config::Config::builder();

        let defaults = RoostConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        let config_file = match &self.config_file {
            Some(file) => file.clone(),
            None => {
                let system = Paths::system_config_file();
                if system.exists() {
                    system
                } else {
                    // Unprivileged development falls back to the user file.
                    Paths::new().user_config_file().unwrap_or(system)
                }
            }
        };

        if config_file.exists() {
            builder = builder.add_source(
                config::File::from(config_file.clone())
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        let local_file = Paths::local_override_file(&config_file);
        if local_file.exists() {
            builder = builder.add_source(
                config::File::from(local_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let mut config: RoostConfig = merged.try_deserialize()?;

        if config.node.hostname.is_empty() {
            config.node.hostname = kernel_hostname();
        }

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Short hostname as the kernel reports it.
fn kernel_hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| {
            s.trim()
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default()
}
