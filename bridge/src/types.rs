//! Configuration and lifecycle types consumed by hosts.
//!
//! Hosts construct [`BridgeConfig`] (usually by deserializing the
//! `[bridge]` section of the config file) and observe
//! [`SupervisorState`] through health snapshots.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable naming extra Pike module search paths.
pub const MODULE_PATH_ENV: &str = "PIKE_MODULE_PATH";

/// Environment variable naming extra Pike include search paths.
pub const INCLUDE_PATH_ENV: &str = "PIKE_INCLUDE_PATH";

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_probe_timeout_ms() -> u64 {
    10_000
}

const fn default_stop_grace_ms() -> u64 {
    2_000
}

const fn default_sweep_interval_ms() -> u64 {
    250
}

const fn default_max_entries() -> usize {
    500
}

fn default_command() -> String {
    String::from("pike")
}

/// Configuration for the bridge subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// How to launch and talk to the analyzer process.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Executable (e.g. "pike"), resolved through `PATH`.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments, typically the path of the analyzer script.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra module search paths, exported as `PIKE_MODULE_PATH`.
    #[serde(default)]
    pub module_paths: Vec<PathBuf>,
    /// Extra include search paths, exported as `PIKE_INCLUDE_PATH`.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// Additional environment passed through to the analyzer unmodified.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the analyzer process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            module_paths: Vec::new(),
            include_paths: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            request_timeout_ms: default_request_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl AnalyzerConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Never zero; a zero interval would spin the sweeper.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Environment for the analyzer process: the search-path variables
    /// (only when paths are configured) followed by `env` entries.
    #[must_use]
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        let mut vars = Vec::new();
        for (name, paths) in [
            (MODULE_PATH_ENV, &self.module_paths),
            (INCLUDE_PATH_ENV, &self.include_paths),
        ] {
            if paths.is_empty() {
                continue;
            }
            match std::env::join_paths(paths) {
                Ok(joined) => vars.push((OsString::from(name), joined)),
                Err(e) => tracing::warn!("Ignoring {name}: {e}"),
            }
        }
        for (key, value) in &self.env {
            vars.push((OsString::from(key), OsString::from(value)));
        }
        vars
    }
}

/// Compilation cache sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entry-count bound; the least recently used entry is evicted past it.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// Restart behaviour after crashes and failed starts.
///
/// Delays grow as `initial_delay * 2^step`, capped at `max_delay`, then
/// down-jittered by up to `jitter` (0.25 = up to 25% shorter).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Crashes tolerated inside `window_ms` before automatic restarts pause.
    pub max_restarts: u32,
    pub window_ms: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window_ms: 60_000,
            initial_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter: 0.25,
        }
    }
}

impl RestartPolicy {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Delay before attempt number `step` (0 = first retry).
    #[must_use]
    pub fn delay(&self, step: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let max = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let base = initial * 2.0_f64.powi(step.min(30) as i32);
        let capped = base.min(max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - rand::random::<f64>() * jitter;
        Duration::from_secs_f64(capped * factor)
    }
}

/// Lifecycle state of the supervised analyzer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Crashed,
}

impl SupervisorState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}
