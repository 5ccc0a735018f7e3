use std::{
    fs::{self, OpenOptions},
    io::{Write, stdout},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pikels_bridge::{AnalysisResult, BridgeError, Dispatcher, Document, Operation};
use pikels_config::PikelsConfig;

fn init_tracing(config_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the JSON output; without a log file, logs are dropped.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // ~/.pikels/logs/pikels.log, next to the default config file.
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".pikels").join("logs").join("pikels.log"));
    }
    candidates.push(PathBuf::from(".pikels").join("logs").join("pikels.log"));

    candidates
}

/// Analyze Pike sources with the external analyzer and print one JSON
/// line per file, followed by a health summary.
#[derive(Parser, Debug)]
#[command(name = "pikels", version)]
struct Args {
    /// Config file to use instead of `~/.pikels/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated operations (parse, introspect, diagnostics, tokenize).
    /// Defaults to all of them.
    #[arg(long = "ops", value_name = "OPS", value_delimiter = ',', value_parser = parse_operation)]
    ops: Vec<Operation>,

    /// Pike source files.
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn operations(&self) -> Vec<Operation> {
        if self.ops.is_empty() {
            return Operation::ALL.to_vec();
        }
        self.ops.clone()
    }
}

fn parse_operation(name: &str) -> Result<Operation, String> {
    let name = name.trim();
    Operation::from_name(name).ok_or_else(|| format!("unknown operation `{name}`"))
}

fn load_config(path: Option<&PathBuf>) -> Result<PikelsConfig> {
    match path {
        Some(path) => Ok(PikelsConfig::load_from(path)?),
        None => Ok(PikelsConfig::load()?.unwrap_or_default()),
    }
}

fn report_line(path: &Path, result: &AnalysisResult) -> serde_json::Value {
    json!({
        "path": path,
        "results": result.results().keys().collect::<Vec<_>>(),
        "failures": result.failures().values().collect::<Vec<_>>(),
        "dependencies": result.dependencies(),
        "from_cache": result.from_cache(),
    })
}

async fn analyze_files(dispatcher: &Dispatcher, args: &Args) -> Result<bool> {
    let mut out = stdout();
    let mut rejected = false;
    let operations = args.operations();

    for path in &args.files {
        let document = Document::from_disk(path.clone())
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        match dispatcher.analyze(&document, operations.iter().copied()).await {
            Ok(result) => {
                for diagnostic in result.diagnostics().unwrap_or_default() {
                    eprintln!("{}", diagnostic.display_with_path(path));
                }
                writeln!(out, "{}", report_line(path, &result))?;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "Analysis rejected: {err}");
                let line = json!({ "path": path, "error": err.to_string() });
                writeln!(out, "{line}")?;
                rejected = true;
                if matches!(err, BridgeError::StartupFailure { .. }) {
                    break;
                }
            }
        }
    }

    Ok(rejected)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_tracing(config.log_filter());

    let dispatcher = Dispatcher::new(config.bridge_config());
    let outcome = analyze_files(&dispatcher, &args).await;

    let health = serde_json::to_string(&json!({ "health": dispatcher.health().await }))?;
    println!("{health}");
    dispatcher.shutdown().await;

    if outcome? {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
