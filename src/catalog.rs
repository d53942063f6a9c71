use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EngineError;
use crate::sanitize::Identifier;
use crate::value::DataType;

pub const MAX_SAMPLE_VALUES: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Processing,
    Ready,
    Error,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Processing => "processing",
            DatasetStatus::Ready => "ready",
            DatasetStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(DatasetStatus::Processing),
            "ready" => Some(DatasetStatus::Ready),
            "error" => Some(DatasetStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub field_name: Identifier,
    pub data_type: DataType,
    pub nullable: bool,
    pub unique: bool,
    pub max_length: Option<usize>,
    pub position: usize,
    pub sample_values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSchema {
    pub slug: String,
    pub name: String,
    pub original_filename: String,
    pub table_name: Identifier,
    pub columns: Vec<ColumnSchema>,
    pub row_count: i64,
    pub status: DatasetStatus,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetSchema {
    pub fn column(&self, field_name: &str) -> Option<&ColumnSchema> {
        find_column(&self.columns, field_name)
    }

    pub fn api_path(&self) -> String {
        format!("/api/v1/data/{}/", self.slug)
    }
}

/// Lightweight listing entry, newest first in [`crate::engine::DatasetEngine::list_datasets`].
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub slug: String,
    pub name: String,
    pub status: DatasetStatus,
    pub row_count: i64,
    pub created_at: DateTime<Utc>,
    pub api_path: String,
}

impl From<&DatasetSchema> for DatasetSummary {
    fn from(schema: &DatasetSchema) -> Self {
        Self {
            slug: schema.slug.clone(),
            name: schema.name.clone(),
            status: schema.status,
            row_count: schema.row_count,
            created_at: schema.created_at,
            api_path: schema.api_path(),
        }
    }
}

pub fn find_column<'a>(columns: &'a [ColumnSchema], field_name: &str) -> Option<&'a ColumnSchema> {
    columns.iter().find(|c| c.field_name.as_str() == field_name)
}

/// Checks the column invariants: non-empty unique field names and contiguous
/// positions `0..n`.
pub fn validate_columns(columns: &[ColumnSchema]) -> Result<(), EngineError> {
    let mut seen = std::collections::HashSet::new();
    for (index, column) in columns.iter().enumerate() {
        if column.position != index {
            return Err(EngineError::internal(format!(
                "column {} has position {} (expected {})",
                column.field_name, column.position, index
            )));
        }
        if !seen.insert(column.field_name.as_str()) {
            return Err(EngineError::internal(format!(
                "duplicate field name {}",
                column.field_name
            )));
        }
        if column.sample_values.len() > MAX_SAMPLE_VALUES {
            return Err(EngineError::internal(format!(
                "column {} carries {} sample values",
                column.field_name,
                column.sample_values.len()
            )));
        }
    }
    Ok(())
}
