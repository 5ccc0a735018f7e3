//! Loads `~/.pikels/config.toml`.
//!
//! ```toml
//! [bridge.analyzer]
//! command = "pike"
//! args = ["${PIKELS_HOME}/analyzer.pike"]
//! module_paths = ["${HOME}/pike/modules"]
//!
//! [bridge.cache]
//! max_entries = 500
//!
//! [bridge.restart]
//! max_restarts = 3
//!
//! [log]
//! filter = "pikels_bridge=debug"
//! ```

use std::env;
use std::path::{Path, PathBuf};

use pikels_bridge::{AnalyzerConfig, BridgeConfig};
use serde::Deserialize;

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "PIKELS_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct PikelsConfig {
    pub bridge: Option<BridgeConfig>,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace every `${VAR}` with the variable's value (empty when unset).
/// An unclosed `${` is kept verbatim.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

impl PikelsConfig {
    /// Load from `$PIKELS_CONFIG` or `~/.pikels/config.toml`.
    ///
    /// `Ok(None)` when there is no config file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load from an explicit path. A missing file is an error here.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {}: {err}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {}: {err}", path.display());
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Bridge settings with `${VAR}` references expanded.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut config = self.bridge.clone().unwrap_or_default();
        expand_analyzer(&mut config.analyzer);
        config
    }

    #[must_use]
    pub fn log_filter(&self) -> Option<&str> {
        self.log.as_ref().and_then(|log| log.filter.as_deref())
    }
}

fn expand_analyzer(analyzer: &mut AnalyzerConfig) {
    analyzer.command = expand_env_vars(&analyzer.command);
    for arg in &mut analyzer.args {
        *arg = expand_env_vars(arg);
    }
    for path in analyzer
        .module_paths
        .iter_mut()
        .chain(analyzer.include_paths.iter_mut())
    {
        *path = expand_path(path);
    }
    if let Some(dir) = &mut analyzer.working_dir {
        *dir = expand_path(dir);
    }
    for value in analyzer.env.values_mut() {
        *value = expand_env_vars(value);
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".pikels").join("config.toml"))
}
