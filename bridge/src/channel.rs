//! Protocol channel: one analyzer's stdin/stdout as a stream of frames.
//!
//! A single writer task owns the analyzer's stdin and drains a bounded queue,
//! so frames never interleave no matter how many callers send at once. A
//! reader task decodes stdout and hands every frame to a [`MessageHandler`].
//! Either task closing publishes the reason on a `watch` channel.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameEvent, FrameReader, FrameWriter};
use crate::error::{BridgeError, ProtocolError};

const WRITER_CHANNEL_CAPACITY: usize = 64;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Receives decoded frames from the reader task, in arrival order.
pub(crate) trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, frame: serde_json::Value) -> impl Future<Output = ()> + Send;

    /// Called for a frame that could not be decoded. The channel stays open.
    fn on_malformed(&self, error: ProtocolError) -> impl Future<Output = ()> + Send;
}

#[derive(Clone)]
pub(crate) struct ProtocolChannel {
    writer_tx: mpsc::Sender<WriterCommand>,
    /// `None` while open; the first close reason once closed.
    closed: Arc<watch::Sender<Option<String>>>,
}

impl ProtocolChannel {
    /// Spawn the reader and writer tasks. The returned handles end on their
    /// own once the streams close.
    pub fn spawn<R, W, H>(reader: R, writer: W, handler: Arc<H>) -> (Self, Vec<JoinHandle<()>>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: MessageHandler,
    {
        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);

        let writer_handle = tokio::spawn(run_writer(writer, writer_rx, closed.clone()));
        let reader_handle = tokio::spawn(run_reader(reader, handler, closed.clone()));

        (Self { writer_tx, closed }, vec![reader_handle, writer_handle])
    }

    /// Queue one frame for writing.
    ///
    /// Fails with `ProcessTerminated` once the channel has closed.
    pub async fn send(&self, frame: serde_json::Value) -> Result<(), BridgeError> {
        if let Some(reason) = self.close_reason() {
            return Err(BridgeError::terminated(reason));
        }
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| BridgeError::terminated("analyzer input closed"))
    }

    /// Flush queued frames, then close the analyzer's stdin.
    pub async fn close(&self) {
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
    }

    pub fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Mark the channel closed without waiting for the streams. No-op if
    /// already closed.
    pub fn mark_closed(&self, reason: impl Into<String>) {
        mark_closed(&self.closed, reason.into());
    }

    pub fn subscribe_closed(&self) -> watch::Receiver<Option<String>> {
        self.closed.subscribe()
    }

    /// Resolve once the channel closes, with the close reason.
    pub async fn wait_closed(&self) -> String {
        wait_closed(self.subscribe_closed()).await
    }
}

pub(crate) async fn wait_closed(mut closed: watch::Receiver<Option<String>>) -> String {
    match closed.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or_default(),
        Err(_) => String::from("channel dropped"),
    }
}

fn mark_closed(closed: &watch::Sender<Option<String>>, reason: String) {
    closed.send_if_modified(|state| {
        if state.is_some() {
            return false;
        }
        tracing::debug!("Analyzer channel closed: {reason}");
        *state = Some(reason);
        true
    });
}

async fn run_writer<W>(
    writer: W,
    mut rx: mpsc::Receiver<WriterCommand>,
    closed: Arc<watch::Sender<Option<String>>>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = FrameWriter::new(writer);
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("Analyzer write error: {e:#}");
                    mark_closed(&closed, format!("write failed: {e:#}"));
                    return;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Closing analyzer stdin: {e:#}");
    }
}

async fn run_reader<R, H>(reader: R, handler: Arc<H>, closed: Arc<watch::Sender<Option<String>>>)
where
    R: AsyncRead + Send + Unpin,
    H: MessageHandler,
{
    let mut reader = FrameReader::new(reader);
    loop {
        match reader.read_frame().await {
            Ok(Some(FrameEvent::Message(frame))) => handler.on_message(frame).await,
            Ok(Some(FrameEvent::Malformed(err))) => {
                tracing::warn!(
                    excerpt = err.excerpt().unwrap_or_default(),
                    "Skipping malformed analyzer frame: {err}"
                );
                handler.on_malformed(err).await;
            }
            Ok(None) => {
                mark_closed(&closed, String::from("analyzer closed stdout"));
                return;
            }
            Err(e) => {
                tracing::warn!("Analyzer reader error: {e:#}");
                mark_closed(&closed, format!("read failed: {e:#}"));
                return;
            }
        }
    }
}

/// Drain the analyzer's stderr into the log, one line per event.
pub(crate) fn spawn_stderr_logger<E>(stderr: E, pid: Option<u32>) -> JoinHandle<()>
where
    E: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        tracing::debug!(target: "pikels::analyzer", pid, "{line}");
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(pid, "Analyzer stderr closed: {e}");
                    return;
                }
            }
        }
    })
}
