//! Shape checks for analyzer replies.
//!
//! The analyzer is a dynamic program and may hand back `0` or an empty
//! mapping where a structure was expected. Nothing reaches a caller or the
//! cache without passing these checks: a bad envelope is a
//! [`ProtocolError`], a bad per-operation value is an
//! [`FailureKind::InvalidShape`] failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::analysis::{FailureKind, Operation, OperationFailure};
use crate::error::ProtocolError;

/// A validated `analyze` reply, restricted to the requested operations.
#[derive(Debug, Default)]
pub(crate) struct AnalyzeOutcome {
    pub results: BTreeMap<Operation, Value>,
    pub failures: BTreeMap<Operation, OperationFailure>,
    pub dependencies: BTreeSet<PathBuf>,
}

impl AnalyzeOutcome {
    /// Every requested operation failed because the request itself was
    /// answered with a wire error.
    pub fn remote_error(requested: &BTreeSet<Operation>, code: i64, message: &str) -> Self {
        let failures = requested
            .iter()
            .map(|op| {
                let failure = OperationFailure::new(*op, FailureKind::Remote { code }, message);
                (*op, failure)
            })
            .collect();
        Self {
            failures,
            ..Self::default()
        }
    }
}

/// Validate the envelope of an `analyze` reply and sort every requested
/// operation into a result or a failure.
///
/// An operation listed under both `result` and `failures` counts as failed.
pub(crate) fn analyze_response(
    response: &Value,
    requested: &BTreeSet<Operation>,
) -> Result<AnalyzeOutcome, ProtocolError> {
    let excerpt = || response.to_string();
    let Some(envelope) = response.as_object() else {
        return Err(ProtocolError::new("analyze reply is not an object").with_excerpt(&excerpt()));
    };

    let results = optional_object(envelope, "result").map_err(|e| e.with_excerpt(&excerpt()))?;
    let failures =
        optional_object(envelope, "failures").map_err(|e| e.with_excerpt(&excerpt()))?;
    let dependencies = dependency_list(envelope).map_err(|e| e.with_excerpt(&excerpt()))?;

    let mut outcome = AnalyzeOutcome {
        dependencies,
        ..AnalyzeOutcome::default()
    };

    for &op in requested {
        let name = op.as_str();
        if let Some(reported) = failures.and_then(|f| f.get(name)) {
            let failure = OperationFailure::new(op, FailureKind::Reported, reported_message(reported));
            outcome.failures.insert(op, failure);
            continue;
        }
        match results.and_then(|r| r.get(name)) {
            Some(value) => match check_shape(op, value) {
                Ok(()) => {
                    outcome.results.insert(op, value.clone());
                }
                Err(problem) => {
                    tracing::warn!(operation = name, "Rejecting analyzer result: {problem}");
                    let failure = OperationFailure::new(op, FailureKind::InvalidShape, problem);
                    outcome.failures.insert(op, failure);
                }
            },
            None => {
                let failure = OperationFailure::new(
                    op,
                    FailureKind::Missing,
                    format!("analyzer returned nothing for {name}"),
                );
                outcome.failures.insert(op, failure);
            }
        }
    }

    Ok(outcome)
}

/// `null` and absent are both "nothing"; anything else must be an object.
fn optional_object<'a>(
    envelope: &'a Map<String, Value>,
    field: &str,
) -> Result<Option<&'a Map<String, Value>>, ProtocolError> {
    match envelope.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(ProtocolError::new(format!(
            "analyze reply field `{field}` is {}, expected an object",
            kind_of(other)
        ))),
    }
}

fn dependency_list(envelope: &Map<String, Value>) -> Result<BTreeSet<PathBuf>, ProtocolError> {
    let items = match envelope.get("dependencies") {
        None | Some(Value::Null) => return Ok(BTreeSet::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(ProtocolError::new(format!(
                "analyze reply field `dependencies` is {}, expected an array",
                kind_of(other)
            )));
        }
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(PathBuf::from).ok_or_else(|| {
                ProtocolError::new(format!("dependency entry is {}, expected a path", kind_of(item)))
            })
        })
        .collect()
}

fn reported_message(reported: &Value) -> String {
    reported
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| reported.as_str())
        .map_or_else(|| String::from("analyzer reported a failure"), String::from)
}

/// Check that `value` has the structure callers of `op` rely on.
pub(crate) fn check_shape(op: Operation, value: &Value) -> Result<(), String> {
    let Some(object) = value.as_object() else {
        return Err(format!("{op} result is {}, expected an object", kind_of(value)));
    };

    match op {
        Operation::Parse => require_array(object, op, "symbols").map(|_| ()),
        Operation::Introspect => {
            require_array(object, op, "symbols")?;
            match object.get("inherits") {
                None | Some(Value::Array(_)) => Ok(()),
                Some(other) => Err(format!(
                    "{op} field `inherits` is {}, expected an array",
                    kind_of(other)
                )),
            }
        }
        Operation::Diagnostics => {
            let items = require_array(object, op, "diagnostics")?;
            for (i, item) in items.iter().enumerate() {
                if item.get("message").and_then(Value::as_str).is_none() {
                    return Err(format!("diagnostic {i} has no string `message`"));
                }
            }
            Ok(())
        }
        Operation::Tokenize => require_array(object, op, "tokens").map(|_| ()),
    }
}

fn require_array<'a>(
    object: &'a Map<String, Value>,
    op: Operation,
    field: &str,
) -> Result<&'a Vec<Value>, String> {
    match object.get(field) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(format!(
            "{op} field `{field}` is {}, expected an array",
            kind_of(other)
        )),
        None => Err(format!("{op} result has no `{field}`")),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
