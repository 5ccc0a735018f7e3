//! Scriptable in-memory analyzer for tests.
//!
//! Answers `get_version` itself; every other request goes through the
//! script, which decides per request whether to answer, fail, stay silent,
//! answer late, or drop the connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::{Mutex, watch};

use crate::codec::{FrameEvent, FrameReader, FrameWriter};
use crate::error::BridgeError;
use crate::transport::{Launcher, Transport};

pub(crate) const FAKE_VERSION: &str = "Pike v8.0 release 1956 (fake)";

pub(crate) enum Reply {
    Result(Value),
    Error { code: i64, message: String },
    Ignore,
    Delayed(Duration, Value),
    /// Close the connection without answering.
    Crash,
}

type Script = dyn Fn(&str, &Value) -> Reply + Send + Sync;

struct FakeState {
    script: Box<Script>,
    launches: AtomicUsize,
    requests: std::sync::Mutex<Vec<(String, Value)>>,
    kill: watch::Sender<u64>,
    fail_launch: AtomicBool,
    answer_probe: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct FakeAnalyzer(Arc<FakeState>);

impl FakeAnalyzer {
    pub fn new(script: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static) -> Self {
        let (kill, _) = watch::channel(0);
        Self(Arc::new(FakeState {
            script: Box::new(script),
            launches: AtomicUsize::new(0),
            requests: std::sync::Mutex::new(Vec::new()),
            kill,
            fail_launch: AtomicBool::new(false),
            answer_probe: AtomicBool::new(true),
        }))
    }

    /// Answers every `analyze` with a well-formed result for each requested op.
    pub fn cooperative() -> Self {
        Self::new(|_, params| Reply::Result(success_for(params)))
    }

    pub fn launcher(&self) -> Launcher {
        let fake = self.clone();
        Arc::new(move || {
            let fake = fake.clone();
            Box::pin(async move { fake.connect() })
        })
    }

    fn connect(&self) -> Result<Transport, BridgeError> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_launch.load(Ordering::SeqCst) {
            return Err(BridgeError::startup("fake analyzer refused to launch"));
        }
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(ours);
        tokio::spawn(serve(self.0.clone(), theirs));
        Ok(Transport::new(reader, writer))
    }

    pub fn launches(&self) -> usize {
        self.0.launches.load(Ordering::SeqCst)
    }

    /// Params of every request received for `method`, oldest first.
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.0
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Drop the live connection, as if the process died.
    pub fn crash(&self) {
        self.0.kill.send_modify(|n| *n += 1);
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.0.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_answer_probe(&self, answer: bool) {
        self.0.answer_probe.store(answer, Ordering::SeqCst);
    }
}

/// A well-formed `analyze` result covering every op in `params.include`.
pub(crate) fn success_for(params: &Value) -> Value {
    let mut result = serde_json::Map::new();
    for op in params["include"].as_array().into_iter().flatten() {
        let Some(op) = op.as_str() else { continue };
        let value = match op {
            "parse" => json!({ "symbols": [{ "name": "main", "kind": "method" }] }),
            "introspect" => json!({ "symbols": [], "inherits": [] }),
            "diagnostics" => json!({ "diagnostics": [] }),
            "tokenize" => json!({ "tokens": ["int", "main"] }),
            _ => continue,
        };
        result.insert(op.to_string(), value);
    }
    json!({ "result": result, "failures": {}, "dependencies": [] })
}

type SharedWriter = Arc<Mutex<FrameWriter<WriteHalf<DuplexStream>>>>;

async fn write(writer: &SharedWriter, frame: Value) {
    let _ = writer.lock().await.write_frame(&frame).await;
}

async fn serve(state: Arc<FakeState>, stream: DuplexStream) {
    let mut kill = state.kill.subscribe();
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FrameReader::new(reader);
    let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::new(writer)));

    loop {
        let event = tokio::select! {
            event = reader.read_frame() => event,
            _ = kill.changed() => break,
        };
        let frame = match event {
            Ok(Some(FrameEvent::Message(frame))) => frame,
            Ok(Some(FrameEvent::Malformed(_))) => continue,
            Ok(None) | Err(_) => break,
        };

        let id = frame["id"].clone();
        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        state
            .requests
            .lock()
            .unwrap()
            .push((method.clone(), params.clone()));

        let reply = if method == "get_version" {
            if state.answer_probe.load(Ordering::SeqCst) {
                Reply::Result(json!({ "version": FAKE_VERSION }))
            } else {
                Reply::Ignore
            }
        } else {
            (state.script)(&method, &params)
        };

        match reply {
            Reply::Result(result) => {
                write(&writer, json!({ "jsonrpc": "2.0", "id": id, "result": result })).await;
            }
            Reply::Error { code, message } => {
                let error = json!({ "code": code, "message": message });
                write(&writer, json!({ "jsonrpc": "2.0", "id": id, "error": error })).await;
            }
            Reply::Ignore => {}
            Reply::Delayed(delay, result) => {
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write(&writer, json!({ "jsonrpc": "2.0", "id": id, "result": result })).await;
                });
            }
            Reply::Crash => break,
        }
    }

    let _ = writer.lock().await.shutdown().await;
}
