use std::collections::HashSet;

use tracing::debug;

use crate::catalog::{ColumnSchema, MAX_SAMPLE_VALUES};
use crate::error::EngineError;
use crate::sanitize::sanitize_field_names;
use crate::value::{DataType, ParsePolicy, RawValue, Value};

pub const DEFAULT_THRESHOLD: f64 = 0.9;
pub const DEFAULT_UNIQUE_ROW_LIMIT: usize = 10_000;
pub const BOUNDED_TEXT_LIMIT: usize = 255;
const TEXT_LENGTH_CAP: usize = 500;

/// Structured candidates in strict priority order; text is the fallback.
const CANDIDATES: [DataType; 5] = [
    DataType::Boolean,
    DataType::Datetime,
    DataType::Date,
    DataType::Integer,
    DataType::Float,
];

const DEFAULT_NULL_TOKENS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NULL", "null", "NaN", "nan", "None", "<NA>",
];

#[derive(Debug, Clone)]
pub struct InferencePolicy {
    /// Minimum share of non-null values a candidate parser must accept.
    pub threshold: f64,
    /// Uniqueness is only detected for datasets up to this many rows.
    pub unique_row_limit: Option<usize>,
    pub parse: ParsePolicy,
    pub null_tokens: Vec<String>,
}

impl Default for InferencePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            unique_row_limit: Some(DEFAULT_UNIQUE_ROW_LIMIT),
            parse: ParsePolicy::default(),
            null_tokens: DEFAULT_NULL_TOKENS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl InferencePolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(EngineError::ConfigError {
                message: format!("inference threshold must be in (0, 1], got {}", self.threshold),
            });
        }
        Ok(())
    }

    pub fn is_missing(&self, raw: &RawValue) -> bool {
        match raw {
            RawValue::Null => true,
            RawValue::Float(f) => f.is_nan(),
            RawValue::Text(s) => {
                let trimmed = s.trim();
                self.null_tokens.iter().any(|token| token == trimmed)
            }
            _ => false,
        }
    }

    /// Converts one ingested cell into the column's type. Missing values and
    /// values the column parser rejects become null.
    pub fn convert(&self, data_type: DataType, raw: &RawValue) -> Value {
        if self.is_missing(raw) {
            return Value::Null;
        }
        self.parse.parse(data_type, raw).unwrap_or(Value::Null)
    }
}

/// Inference result for one column before its field name is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredColumn {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub unique: bool,
    pub max_length: Option<usize>,
    pub position: usize,
    pub sample_values: Vec<serde_json::Value>,
}

fn share(matches: usize, total: usize) -> f64 {
    matches as f64 / total as f64
}

fn candidate_accepts(
    policy: &InferencePolicy,
    candidate: DataType,
    values: &[&RawValue],
) -> bool {
    let total = values.len();
    match candidate {
        DataType::Integer => {
            let parsed: Vec<f64> = values
                .iter()
                .filter_map(|v| policy.parse.parse_number(v))
                .collect();
            share(parsed.len(), total) >= policy.threshold
                && parsed.iter().all(|n| n.fract() == 0.0)
                && values.iter().all(|v| {
                    policy.parse.parse_number(v).is_none()
                        || policy.parse.parse_integer(v).is_some()
                })
        }
        other => {
            let matches = values
                .iter()
                .filter(|v| policy.parse.parse(other, v).is_some())
                .count();
            share(matches, total) >= policy.threshold
        }
    }
}

/// Equality key matching the storage UNIQUE check: `-0.0` and `0.0` collide.
fn unique_key(value: &Value) -> String {
    match value {
        Value::Float(f) if *f == 0.0 => "0".to_string(),
        Value::Float(f) => f.to_bits().to_string(),
        other => other.to_json().to_string(),
    }
}

/// Picks the column type: the hint when it clears the threshold, otherwise
/// the first candidate in priority order that does, otherwise text.
pub fn select_type(
    policy: &InferencePolicy,
    values: &[&RawValue],
    hint: Option<DataType>,
) -> DataType {
    if values.is_empty() {
        return DataType::Text;
    }
    if let Some(hint) = hint {
        if hint == DataType::Text || candidate_accepts(policy, hint, values) {
            return hint;
        }
    }
    CANDIDATES
        .into_iter()
        .find(|candidate| candidate_accepts(policy, *candidate, values))
        .unwrap_or(DataType::Text)
}

pub fn infer_column(
    policy: &InferencePolicy,
    name: &str,
    position: usize,
    values: &[RawValue],
    hint: Option<DataType>,
) -> InferredColumn {
    let present: Vec<&RawValue> = values.iter().filter(|v| !policy.is_missing(v)).collect();

    if present.is_empty() {
        debug!("Column {} ({}) has no values, defaulting to text", position, name);
        return InferredColumn {
            name: name.to_string(),
            data_type: DataType::Text,
            nullable: true,
            unique: false,
            max_length: None,
            position,
            sample_values: Vec::new(),
        };
    }

    let data_type = select_type(policy, &present, hint);
    let typed: Vec<Value> = present
        .iter()
        .filter_map(|v| policy.parse.parse(data_type, v))
        .collect();

    let nullable = present.len() < values.len() || typed.len() < present.len();

    let unique = match policy.unique_row_limit {
        Some(limit) if values.len() <= limit && typed.len() >= 2 => {
            let distinct: HashSet<String> = typed.iter().map(unique_key).collect();
            distinct.len() == typed.len()
        }
        _ => false,
    };

    let max_length = if data_type == DataType::Text {
        let longest = present
            .iter()
            .filter_map(|v| v.render())
            .map(|s| s.chars().count())
            .max()
            .unwrap_or(0);
        if longest <= BOUNDED_TEXT_LIMIT {
            Some((longest * 2).clamp(1, TEXT_LENGTH_CAP))
        } else {
            None
        }
    } else {
        None
    };

    let sample_values = typed
        .iter()
        .take(MAX_SAMPLE_VALUES)
        .map(Value::to_json)
        .collect();

    debug!(
        "Column {} ({}) inferred as {} (nullable={}, unique={})",
        position, name, data_type, nullable, unique
    );

    InferredColumn {
        name: name.to_string(),
        data_type,
        nullable,
        unique,
        max_length,
        position,
        sample_values,
    }
}

/// Runs inference over every column and assigns sanitized, collision-free
/// field names.
pub fn infer_schema(
    policy: &InferencePolicy,
    headers: &[String],
    rows: &[Vec<RawValue>],
    hints: &[Option<DataType>],
) -> Vec<ColumnSchema> {
    let field_names = sanitize_field_names(headers);

    headers
        .iter()
        .zip(field_names)
        .enumerate()
        .map(|(position, (header, field_name))| {
            let column_values: Vec<RawValue> = rows
                .iter()
                .map(|row| row.get(position).cloned().unwrap_or(RawValue::Null))
                .collect();
            let hint = hints.get(position).copied().flatten();
            let inferred = infer_column(policy, header, position, &column_values, hint);

            ColumnSchema {
                name: inferred.name,
                field_name,
                data_type: inferred.data_type,
                nullable: inferred.nullable,
                unique: inferred.unique,
                max_length: inferred.max_length,
                position,
                sample_values: inferred.sample_values,
            }
        })
        .collect()
}
