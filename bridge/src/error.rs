//! Bridge-level error taxonomy.
//!
//! These are the only errors a caller of [`crate::Dispatcher`] ever sees.
//! Per-operation failures reported by the analyzer are data, not errors;
//! see [`crate::OperationFailure`].

use std::time::Duration;

/// A frame or response that does not have the shape the bridge expects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
    /// Leading bytes of the offending frame, for logs.
    excerpt: Option<String>,
}

/// Longest frame excerpt kept for diagnostics.
const EXCERPT_CHARS: usize = 120;

impl ProtocolError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            excerpt: None,
        }
    }

    /// Attach the leading part of the raw frame that caused the error.
    #[must_use]
    pub fn with_excerpt(mut self, raw: &str) -> Self {
        let excerpt: String = raw.chars().take(EXCERPT_CHARS).collect();
        self.excerpt = Some(excerpt);
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn excerpt(&self) -> Option<&str> {
        self.excerpt.as_deref()
    }
}

/// Errors surfaced by the bridge.
///
/// `Clone` because a single process death settles every pending waiter
/// with the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("request {id} ({method}) timed out after {elapsed:?}")]
    Timeout {
        id: u64,
        method: String,
        elapsed: Duration,
    },
    #[error("analyzer process terminated: {reason}")]
    ProcessTerminated { reason: String },
    #[error("analyzer failed to start: {reason}")]
    StartupFailure { reason: String },
    #[error("analyzer returned error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl BridgeError {
    pub(crate) fn terminated(reason: impl Into<String>) -> Self {
        Self::ProcessTerminated {
            reason: reason.into(),
        }
    }

    pub(crate) fn startup(reason: impl Into<String>) -> Self {
        Self::StartupFailure {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call later can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ProcessTerminated { .. })
    }
}
