//! Path discovery for configuration files.

use crate::{Error, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Well-known locations of Roost configuration files.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "Roost", "roost"),
        }
    }

    /// System-wide daemon configuration (`/etc/roost/roostd.toml`).
    pub fn system_config_file() -> PathBuf {
        PathBuf::from("/etc/roost/roostd.toml")
    }

    /// Per-user config directory, used when developing unprivileged.
    pub fn user_config_dir(&self) -> Result<PathBuf> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| Error::Invalid("could not determine user config directory".into()))
    }

    /// Per-user config file (`~/.config/roost/roostd.toml`).
    pub fn user_config_file(&self) -> Result<PathBuf> {
        Ok(self.user_config_dir()?.join("roostd.toml"))
    }

    /// Machine-local override next to a given config file
    /// (`roostd.local.toml`, never packaged).
    pub fn local_override_file(config_file: impl AsRef<Path>) -> PathBuf {
        config_file.as_ref().with_file_name("roostd.local.toml")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_paths() {
        assert_eq!(
            Paths::system_config_file(),
            PathBuf::from("/etc/roost/roostd.toml")
        );
        assert_eq!(
            Paths::local_override_file("/etc/roost/roostd.toml"),
            PathBuf::from("/etc/roost/roostd.local.toml")
        );
    }

    #[test]
    fn test_user_paths() {
        let paths = Paths::new();
        if let Ok(dir) = paths.user_config_dir() {
            assert!(dir.to_string_lossy().contains("roost"));
        }
    }
}
