//! Analysis request and result types.
//!
//! A [`Document`] is what callers hand to the dispatcher; its
//! [`CacheKey`] decides whether a previous compile can be reused.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// A logical analysis operation the analyzer can perform in one `analyze` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Parse,
    Introspect,
    Diagnostics,
    Tokenize,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Parse,
        Operation::Introspect,
        Operation::Diagnostics,
        Operation::Tokenize,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Introspect => "introspect",
            Self::Diagnostics => "diagnostics",
            Self::Tokenize => "tokenize",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Changes if and only if the analyzed content changed.
///
/// Open documents use the editor's version counter; closed files use a
/// filesystem stamp. The variants never compare equal, so an in-memory edit
/// never collides with the on-disk entry for the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fingerprint {
    Version(i64),
    Stamp { modified_ns: u128, len: u64 },
}

impl Fingerprint {
    /// Stamp from file metadata. Falls back to a zero mtime on platforms
    /// without modification times; the length still participates.
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        Self::Stamp {
            modified_ns,
            len: meta.len(),
        }
    }

    /// Stat `path` and build a stamp fingerprint.
    pub async fn stat(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(&meta))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(v) => write!(f, "v{v}"),
            Self::Stamp { modified_ns, len } => write!(f, "stat:{modified_ns}:{len}"),
        }
    }
}

/// Identity of one compiled source: identical key means identical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, fingerprint: Fingerprint) -> Self {
        Self {
            path: path.into(),
            fingerprint,
        }
    }
}

/// Source handed to the analyzer.
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    fingerprint: Fingerprint,
    text: String,
}

impl Document {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, fingerprint: Fingerprint, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fingerprint,
            text: text.into(),
        }
    }

    /// A document open in the editor at `version`.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, version: i64, text: impl Into<String>) -> Self {
        Self::new(path, Fingerprint::Version(version), text)
    }

    /// A closed file: read its text and stamp it from the filesystem.
    ///
    /// The stat happens before the read so a concurrent write produces a
    /// stale stamp (forcing a later recompile) rather than a stale text
    /// under a fresh stamp.
    pub async fn from_disk(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let fingerprint = Fingerprint::stat(&path).await?;
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(Self::new(path, fingerprint, text))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.path.clone(), self.fingerprint)
    }
}

/// Why a single operation did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The analyzer ran the operation and reported an error (e.g. syntax error).
    Reported,
    /// The analyzer replied but said nothing about this operation.
    Missing,
    /// The analyzer returned a value of the wrong shape.
    InvalidShape,
    /// The whole request was answered with a wire error.
    Remote { code: i64 },
}

/// A per-operation failure inside an otherwise successful analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    operation: Operation,
    #[serde(flatten)]
    kind: FailureKind,
    message: String,
}

impl OperationFailure {
    #[must_use]
    pub fn new(operation: Operation, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    #[must_use]
    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

/// Outcome of [`crate::Dispatcher::analyze`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisResult {
    results: BTreeMap<Operation, serde_json::Value>,
    failures: BTreeMap<Operation, OperationFailure>,
    dependencies: BTreeSet<PathBuf>,
    from_cache: bool,
}

impl AnalysisResult {
    pub(crate) fn new(
        results: BTreeMap<Operation, serde_json::Value>,
        failures: BTreeMap<Operation, OperationFailure>,
        dependencies: BTreeSet<PathBuf>,
        from_cache: bool,
    ) -> Self {
        Self {
            results,
            failures,
            dependencies,
            from_cache,
        }
    }

    #[must_use]
    pub fn get(&self, operation: Operation) -> Option<&serde_json::Value> {
        self.results.get(&operation)
    }

    #[must_use]
    pub fn failure(&self, operation: Operation) -> Option<&OperationFailure> {
        self.failures.get(&operation)
    }

    #[must_use]
    pub fn results(&self) -> &BTreeMap<Operation, serde_json::Value> {
        &self.results
    }

    #[must_use]
    pub fn failures(&self) -> &BTreeMap<Operation, OperationFailure> {
        &self.failures
    }

    /// Files this compile resolved symbols from (inherit/import/include).
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<PathBuf> {
        &self.dependencies
    }

    /// Whether every requested operation was served without a round trip.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Typed view of the `diagnostics` operation, if it succeeded.
    #[must_use]
    pub fn diagnostics(&self) -> Option<Vec<AnalyzerDiagnostic>> {
        let items = self.get(Operation::Diagnostics)?.get("diagnostics")?.as_array()?;
        Some(items.iter().filter_map(AnalyzerDiagnostic::from_value).collect())
    }
}

/// Severity level for an analyzer diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Parse the analyzer's severity label or LSP-style number.
    ///
    /// Returns `None` for anything unrecognised; callers choose the fallback.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if let Some(n) = value.as_u64() {
            return match n {
                1 => Some(Self::Error),
                2 => Some(Self::Warning),
                3 => Some(Self::Information),
                4 => Some(Self::Hint),
                _ => None,
            };
        }
        match value.as_str()?.to_ascii_lowercase().as_str() {
            "error" | "fatal" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "info" | "information" => Some(Self::Information),
            "hint" => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A compiler diagnostic, as reported by the `diagnostics` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyzerDiagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 1-indexed line, as the Pike compiler reports it. 0 when unknown.
    line: u32,
    /// File the compiler attributed the message to, when it differs from
    /// the analyzed document (e.g. an included header).
    file: Option<PathBuf>,
}

impl AnalyzerDiagnostic {
    fn from_value(value: &serde_json::Value) -> Option<Self> {
        let message = value.get("message")?.as_str()?.to_string();
        let severity = value
            .get("severity")
            .and_then(DiagnosticSeverity::from_value)
            .unwrap_or(DiagnosticSeverity::Error);
        let position = value.get("position");
        let line = position
            .and_then(|p| p.get("line"))
            .or_else(|| value.get("line"))
            .and_then(serde_json::Value::as_u64)
            .and_then(|l| u32::try_from(l).ok())
            .unwrap_or(0);
        let file = position
            .and_then(|p| p.get("file"))
            .and_then(serde_json::Value::as_str)
            .map(PathBuf::from);
        Some(Self {
            severity,
            message,
            line,
            file,
        })
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Format as `path:line: severity: message`.
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        let path = self.file.as_deref().unwrap_or(path);
        format!(
            "{}:{}: {}: {}",
            path.display(),
            self.line,
            self.severity.label(),
            self.message
        )
    }
}
