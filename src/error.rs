use std::collections::BTreeMap;

use diesel::result::DatabaseErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Dataset already registered: {slug}")]
    AlreadyExists { slug: String },

    #[error("Table {table} conflicts with an existing table: {message}")]
    SchemaConflict { table: String, message: String },

    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Ingestion failed: {message}")]
    Ingestion { message: String },
}

/// Stable classification of [`EngineError`] for transport collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    SchemaConflict,
    Unavailable,
    Internal,
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn invalid_fields(fields: BTreeMap<String, String>) -> Self {
        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
        EngineError::Validation {
            message: format!("invalid fields: {}", names.join(", ")),
            fields,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        EngineError::NotFound {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } | EngineError::Ingestion { .. } => ErrorKind::Validation,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            EngineError::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            EngineError::Unavailable { .. } => ErrorKind::Unavailable,
            EngineError::Internal { .. } | EngineError::ConfigError { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable { .. })
    }

    /// Caller-facing message. Internal failures are replaced by a fixed
    /// string; callers log the error itself when they need the detail.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Internal { .. } | EngineError::ConfigError { .. } => {
                "internal error".to_string()
            }
            EngineError::Unavailable { .. } => {
                "storage temporarily unavailable, retry the request".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Ingestion {
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        EngineError::Ingestion {
            message: format!("Failed to parse file: {}", err),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal {
            message: format!("JSON serialization error: {}", err),
        }
    }
}

impl From<diesel::result::Error> for EngineError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => EngineError::not_found("row not found"),
            diesel::result::Error::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                match kind {
                    DatabaseErrorKind::UniqueViolation => {
                        EngineError::validation("value violates a unique constraint")
                    }
                    DatabaseErrorKind::NotNullViolation => {
                        EngineError::validation("a required field is null")
                    }
                    DatabaseErrorKind::CheckViolation => {
                        EngineError::validation("value violates a check constraint")
                    }
                    _ if message.contains("database is locked") || message.contains("busy") => {
                        EngineError::Unavailable { message }
                    }
                    _ if message.contains("no such table") => {
                        EngineError::not_found("dataset table no longer exists")
                    }
                    _ => EngineError::Internal {
                        message: format!("Database error: {}", message),
                    },
                }
            }
            other => EngineError::Internal {
                message: format!("Database error: {}", other),
            },
        }
    }
}

impl From<diesel::ConnectionError> for EngineError {
    fn from(err: diesel::ConnectionError) -> Self {
        EngineError::Unavailable {
            message: format!("Failed to connect to database: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = EngineError::internal("SELECT * FROM \"ds_secret\" failed");
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn only_unavailable_is_retryable() {
        let unavailable = EngineError::Unavailable {
            message: "timeout".to_string(),
        };
        assert!(unavailable.is_retryable());
        assert!(!EngineError::not_found("x").is_retryable());
        assert!(!EngineError::validation("x").is_retryable());
    }

    #[test]
    fn field_errors_are_listed_in_message() {
        let mut fields = BTreeMap::new();
        fields.insert("price".to_string(), "expected a number".to_string());
        fields.insert("qty".to_string(), "this field is required".to_string());
        let err = EngineError::invalid_fields(fields);
        assert_eq!(err.public_message(), "Validation failed: invalid fields: price, qty");
    }
}
