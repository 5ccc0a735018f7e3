//! Bridge between a language server and an external Pike analyzer process.
//!
//! The analyzer speaks line-delimited JSON-RPC over stdin/stdout. The bridge
//! owns its lifetime, correlates requests with replies, validates what comes
//! back, and caches results per source fingerprint with dependency-aware
//! invalidation. [`Dispatcher`] is the whole public surface.

pub mod types;

pub(crate) mod analysis;
pub(crate) mod cache;
pub(crate) mod channel;
pub(crate) mod codec;
pub(crate) mod correlator;
pub(crate) mod deps;
pub(crate) mod error;
pub(crate) mod health;
pub(crate) mod protocol;
pub(crate) mod supervisor;
pub(crate) mod transport;
pub(crate) mod validate;

mod dispatcher;

#[cfg(test)]
mod fake;

pub use analysis::{
    AnalysisResult, AnalyzerDiagnostic, CacheKey, DiagnosticSeverity, Document, FailureKind,
    Fingerprint, Operation, OperationFailure,
};
pub use cache::CacheStats;
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, ProtocolError};
pub use health::{HealthStatus, RECENT_ERRORS};
pub use transport::{Launcher, Transport, process_launcher};
pub use types::{
    AnalyzerConfig, BridgeConfig, CacheConfig, INCLUDE_PATH_ENV, MODULE_PATH_ENV, RestartPolicy,
    SupervisorState,
};
