use crate::{NativeCodeError, Result};
use platform::RuleSpec;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "NATIVECODE_CONFIG";
pub const CACHE_DIR_ENV: &str = "NATIVECODE_CACHE_DIR";
pub const RESOURCE_PATH_ENV: &str = "NATIVECODE_RESOURCE_PATH";

/// Directory name searched next to the running executable when no root is configured.
pub const DEFAULT_RESOURCE_DIR: &str = "native";

/// Loader settings, read from an optional TOML file and then the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NativeCodeConfig {
    /// Where artifacts are extracted when a request names no directory.
    pub cache_dir: Option<PathBuf>,
    /// Bundle directories, searched in order.
    pub resource_roots: Vec<PathBuf>,
    /// Replaces the built-in platform table.
    pub platforms: Option<Vec<RuleSpec>>,
}

impl NativeCodeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| NativeCodeError::Config(format!("invalid configuration: {e}")))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NativeCodeError::Config(format!(
                "failed to read configuration {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// The file named by `NATIVECODE_CONFIG` (if any), then the other environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var_os(key))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self> {
        let config = match non_blank(&lookup, CONFIG_ENV) {
            Some(path) => Self::from_toml_file(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(config.with_overrides(lookup))
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        if let Some(dir) = non_blank(&lookup, CACHE_DIR_ENV) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(paths) = non_blank(&lookup, RESOURCE_PATH_ENV) {
            self.resource_roots = std::env::split_paths(&paths)
                .filter(|path| !path.as_os_str().is_empty())
                .collect();
        }
        self
    }

    pub fn resource_roots_or_default(&self) -> Vec<PathBuf> {
        if !self.resource_roots.is_empty() {
            return self.resource_roots.clone();
        }
        default_resource_root().into_iter().collect()
    }
}

fn non_blank(lookup: &impl Fn(&str) -> Option<OsString>, key: &str) -> Option<OsString> {
    lookup(key).filter(|value| !value.to_string_lossy().trim().is_empty())
}

/// `native/` next to the running executable.
pub fn default_resource_root() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join(DEFAULT_RESOURCE_DIR))
}
