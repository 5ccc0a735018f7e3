//! How an analyzer session gets its byte streams.
//!
//! Production sessions spawn the configured executable; tests hand the
//! supervisor in-memory pipes through the same [`Launcher`] seam.

use std::process::Stdio;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::BridgeError;
use crate::types::AnalyzerConfig;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The streams of one analyzer session.
pub struct Transport {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    pub(crate) stderr: Option<BoxedReader>,
    pub(crate) child: Option<Child>,
}

impl Transport {
    /// `reader` carries frames from the analyzer, `writer` carries frames to it.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stderr: None,
            child: None,
        }
    }

    #[must_use]
    pub fn with_stderr<E>(mut self, stderr: E) -> Self
    where
        E: AsyncRead + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(stderr));
        self
    }

    /// Attach the process the streams belong to, so stop and crash handling
    /// can wait for and kill it.
    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

/// Produces a fresh [`Transport`] for every session start.
pub type Launcher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Transport, BridgeError>> + Send + Sync>;

/// Launcher that spawns `config.command` with piped stdio.
#[must_use]
pub fn process_launcher(config: &AnalyzerConfig) -> Launcher {
    let config = config.clone();
    Arc::new(move || {
        let config = config.clone();
        Box::pin(async move { spawn_analyzer(&config) })
    })
}

fn spawn_analyzer(config: &AnalyzerConfig) -> Result<Transport, BridgeError> {
    let resolved = which::which(&config.command).map_err(|e| {
        BridgeError::startup(format!("{} not found in PATH: {e}", config.command))
    })?;

    let mut cmd = Command::new(&resolved);
    cmd.args(&config.args)
        .envs(config.environment())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| BridgeError::startup(format!("spawning {}: {e}", resolved.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::startup("no stdin from analyzer"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::startup("no stdout from analyzer"))?;
    let stderr = child.stderr.take();

    tracing::info!(
        command = %resolved.display(),
        pid = child.id(),
        "Spawned analyzer"
    );

    let mut transport = Transport::new(stdout, stdin);
    if let Some(stderr) = stderr {
        transport = transport.with_stderr(stderr);
    }
    Ok(transport.with_child(child))
}
