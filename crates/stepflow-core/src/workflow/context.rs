//! Run context with step result merging and template resolution.
//!
//! `ExecutionContext` is the variable bag that flows through a run: workflow
//! defaults overlaid by caller-supplied values, plus one `<step>_result` entry
//! per completed step. Size limits keep a chatty handler from growing the
//! context (and every persisted snapshot of it) without bound.

use serde_json::{Value, json};
use stepflow_types::workflow::Variables;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Suffix appended to a step ID to form its context key.
pub const RESULT_SUFFIX: &str = "_result";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("failed to serialize context value: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Variable bag for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    values: Variables,
}

impl ExecutionContext {
    /// Build a run context: `defaults` first, then `overrides` on top.
    pub fn new(defaults: &Variables, overrides: Variables) -> Self {
        let mut values = defaults.clone();
        for (key, value) in overrides {
            values.insert(key, value);
        }
        Self { values }
    }

    /// Wrap an existing snapshot (e.g. one read back from storage).
    pub fn from_variables(values: Variables) -> Self {
        Self { values }
    }

    /// Context key under which a step's output is stored.
    pub fn result_key(step_id: &str) -> String {
        format!("{step_id}{RESULT_SUFFIX}")
    }

    /// Store the output of a completed step as `<step_id>_result`.
    ///
    /// Outputs over `MAX_STEP_OUTPUT_SIZE` are replaced by a truncation
    /// marker. Fails when the whole context would exceed `MAX_CONTEXT_SIZE`.
    pub fn merge_step_result(&mut self, step_id: &str, output: Value) -> Result<(), ContextError> {
        let size = serialized_size(&output)?;

        let stored = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
            })
        } else {
            output
        };

        self.values.insert(Self::result_key(step_id), stored);

        let total = serialized_size(&Value::Object(self.values.clone()))?;
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Output previously merged for `step_id`.
    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.values.get(&Self::result_key(step_id))
    }

    /// Look up a top-level name or a dotted path (`check_result.branch`).
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.values.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn values(&self) -> &Variables {
        &self.values
    }

    pub fn into_variables(self) -> Variables {
        self.values
    }

    /// JSON object handed to the expression evaluator.
    pub fn to_expression_context(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Resolve `{{ name }}` placeholders in a string.
    ///
    /// Names may be dotted paths. Unknown references are left as-is.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len + 2;
            let name = rest[start + 2..end - 2].trim();

            out.push_str(&rest[..start]);
            match self.lookup(name) {
                Some(value) if !name.is_empty() => out.push_str(&value_to_string(value)),
                _ => out.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }

        out.push_str(rest);
        out
    }

    /// Resolve placeholders in every string inside a JSON value.
    ///
    /// A string consisting of exactly one placeholder is replaced by the raw
    /// referenced value, so `"{{ amount }}"` stays a number.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(name) = sole_placeholder(s) {
                    if let Some(found) = self.lookup(name) {
                        return found.clone();
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let name = inner.trim();
    (!name.is_empty()).then_some(name)
}

fn serialized_size(value: &Value) -> Result<usize, ContextError> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .map_err(|e| ContextError::Serialize(e.to_string()))
}

/// Convert a JSON value to a display string for template substitution.
///
/// Strings are returned without quotes; other values are JSON-serialized.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
