//! Wire message types for the analyzer protocol.

use serde::{Deserialize, Serialize};

use crate::analysis::{Document, Operation};
use crate::error::ProtocolError;

/// Readiness probe; also reports the analyzer's version string.
pub(crate) const METHOD_GET_VERSION: &str = "get_version";

/// Consolidated analysis request carrying an `include` list of operations.
pub(crate) const METHOD_ANALYZE: &str = "analyze";

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: serde_json::Value,
}

impl<'a> WireRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Structured error carried by a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct WireError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

#[derive(Debug)]
pub(crate) struct WireResponse {
    pub id: u64,
    pub outcome: Result<serde_json::Value, WireError>,
}

#[derive(Debug)]
pub(crate) enum Incoming {
    Response(WireResponse),
    /// A frame with a method but no id; the analyzer's own log/progress output.
    Notification { method: String },
}

/// Classify a decoded frame.
pub(crate) fn decode_incoming(frame: &serde_json::Value) -> Result<Incoming, ProtocolError> {
    let excerpt = || frame.to_string();
    let id = frame.get("id");
    let method = frame.get("method").and_then(|m| m.as_str());

    match (id, method) {
        (None, Some(method)) => Ok(Incoming::Notification {
            method: method.to_string(),
        }),
        (Some(id_val), _) => {
            let id = id_val.as_u64().ok_or_else(|| {
                ProtocolError::new("response id is not an unsigned integer")
                    .with_excerpt(&excerpt())
            })?;

            let outcome = match (frame.get("result"), frame.get("error")) {
                (_, Some(error)) if !error.is_null() => {
                    let error: WireError = serde_json::from_value(error.clone()).map_err(|e| {
                        ProtocolError::new(format!("malformed error object: {e}"))
                            .with_excerpt(&excerpt())
                    })?;
                    Err(error)
                }
                (Some(result), _) => Ok(result.clone()),
                (None, _) => {
                    return Err(ProtocolError::new("response has neither result nor error")
                        .with_excerpt(&excerpt()));
                }
            };

            Ok(Incoming::Response(WireResponse { id, outcome }))
        }
        (None, None) => {
            Err(ProtocolError::new("frame has neither id nor method").with_excerpt(&excerpt()))
        }
    }
}

/// Parameters for a consolidated `analyze` request.
pub(crate) fn analyze_params<'a>(
    document: &Document,
    operations: impl IntoIterator<Item = &'a Operation>,
) -> serde_json::Value {
    let include: Vec<&'static str> = operations.into_iter().map(|op| op.as_str()).collect();
    serde_json::json!({
        "filename": document.path().to_string_lossy(),
        "code": document.text(),
        "include": include,
    })
}
