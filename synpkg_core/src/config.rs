/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::config
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Load and validate Syn-Pkg-Core configuration from TOML,
    resolving default locations for bundles, the package
    store, and session logs.

  Security / Safety Notes:
    Reads operator-owned files only. Paths are used verbatim;
    no expansion of environment variables is attempted.

  Dependencies:
    serde + toml for parsing, dirs for platform directories.

  Operational Scope:
    Consulted once at start-up by the entry point and handed to
    the plugin facade on initialisation.

  Revision History:
    2026-10-17 COD  Authored configuration loader.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Sensible defaults with explicit overrides
    - Validation before use
    - Deterministic path resolution
============================================================*/

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PackagerError, Result};

const APP_DIR: &str = "synpkg";
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagerConfig {
    pub paths: PathsConfig,
    pub installer: InstallerConfig,
}

/// `[paths]` section. Unset entries fall back to platform directories.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub apps_dir: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub repository_index: Option<PathBuf>,
}

/// `[installer]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    /// Byte budget for all bundles; 0 leaves only the filesystem limit.
    pub quota_bytes: u64,
    pub chunk_size: usize,
    /// Download timeout in seconds.
    pub timeout: u64,
    pub user_agent: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT_SECS,
            user_agent: format!("Syn-Pkg-Core/{} (linux)", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PackagerConfig {
    /// Default configuration file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Load from an explicit path, or from the default location when present.
    pub fn load_from_optional_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(explicit) => {
                if !explicit.exists() {
                    return Err(PackagerError::Config(format!(
                        "Configuration file {} does not exist",
                        explicit.display()
                    )));
                }
                Self::load(explicit)
            }
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::load(&default),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PackagerError::Config(format!(
                "Failed to read configuration {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw).map_err(|err| match err {
            PackagerError::Config(message) => {
                PackagerError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: PackagerConfig = toml::from_str(raw)
            .map_err(|err| PackagerError::Config(format!("Invalid TOML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.installer.chunk_size == 0 {
            return Err(PackagerError::Config(
                "installer.chunk_size must be greater than zero".into(),
            ));
        }
        if self.installer.timeout == 0 {
            return Err(PackagerError::Config(
                "installer.timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding one sub-directory per installed bundle.
    pub fn apps_dir(&self) -> PathBuf {
        self.paths
            .apps_dir
            .clone()
            .unwrap_or_else(|| data_root().join("apps"))
    }

    /// JSON document listing installed packages.
    pub fn store_path(&self) -> PathBuf {
        self.paths
            .store_path
            .clone()
            .unwrap_or_else(|| data_root().join("packages.json"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths.log_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(data_root)
                .join("logs")
        })
    }

    pub fn repository_index(&self) -> Option<&Path> {
        self.paths.repository_index.as_deref()
    }
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
}
