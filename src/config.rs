use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::EngineError;
use crate::inference::{InferencePolicy, DEFAULT_THRESHOLD, DEFAULT_UNIQUE_ROW_LIMIT};
use crate::parser::{DEFAULT_MAX_COLUMNS, DEFAULT_MAX_ROWS};
use crate::value::ParsePolicy;

pub const DEFAULT_DATABASE_URL: &str = "datasets.db";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub pool_size: usize,
    pub storage_timeout: Duration,
    pub busy_timeout: Duration,
    pub max_rows: usize,
    pub max_columns: usize,
    pub inference: InferencePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::for_database(DEFAULT_DATABASE_URL)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, EngineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e| EngineError::ConfigError {
                message: format!("Invalid {}={:?}: {}", key, raw, e),
            })
        }
        _ => Ok(default),
    }
}

impl ServiceConfig {
    /// Defaults for an embedded engine on the given database.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool_size: 8,
            storage_timeout: Duration::from_millis(5_000),
            busy_timeout: Duration::from_millis(5_000),
            max_rows: DEFAULT_MAX_ROWS,
            max_columns: DEFAULT_MAX_COLUMNS,
            inference: InferencePolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let unique_row_limit: usize =
            parse_var(&lookup, "INFERENCE_UNIQUE_ROW_LIMIT", DEFAULT_UNIQUE_ROW_LIMIT)?;
        let inference = InferencePolicy {
            threshold: parse_var(&lookup, "INFERENCE_THRESHOLD", DEFAULT_THRESHOLD)?,
            unique_row_limit: (unique_row_limit > 0).then_some(unique_row_limit),
            parse: ParsePolicy {
                allow_leading_zeros: parse_var(&lookup, "INFERENCE_ALLOW_LEADING_ZEROS", true)?,
                decimal_comma: parse_var(&lookup, "INFERENCE_DECIMAL_COMMA", false)?,
            },
            ..InferencePolicy::default()
        };

        let config = Self {
            database_url,
            pool_size: parse_var(&lookup, "DATABASE_POOL_SIZE", 8)?,
            storage_timeout: Duration::from_millis(parse_var(&lookup, "STORAGE_TIMEOUT_MS", 5_000)?),
            busy_timeout: Duration::from_millis(parse_var(&lookup, "SQLITE_BUSY_TIMEOUT_MS", 5_000)?),
            max_rows: parse_var(&lookup, "MAX_ROWS", DEFAULT_MAX_ROWS)?,
            max_columns: parse_var(&lookup, "MAX_COLUMNS", DEFAULT_MAX_COLUMNS)?,
            inference,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool_size == 0 {
            return Err(EngineError::ConfigError {
                message: "DATABASE_POOL_SIZE must be at least 1".to_string(),
            });
        }
        if self.storage_timeout.is_zero() {
            return Err(EngineError::ConfigError {
                message: "STORAGE_TIMEOUT_MS must be positive".to_string(),
            });
        }
        self.inference.validate()?;
        self.database_path().map(|_| ())
    }

    /// Filesystem path of the SQLite database. Accepts a bare path or a
    /// `sqlite://` / `file://` URL.
    pub fn database_path(&self) -> Result<String, EngineError> {
        if !self.database_url.contains("://") {
            return Ok(self.database_url.clone());
        }
        let url = Url::parse(&self.database_url).map_err(|e| EngineError::ConfigError {
            message: format!("Invalid DATABASE_URL: {}", e),
        })?;
        match url.scheme() {
            "sqlite" | "file" => {
                let path = format!("{}{}", url.host_str().unwrap_or(""), url.path());
                if path.is_empty() {
                    return Err(EngineError::ConfigError {
                        message: "DATABASE_URL has no database path".to_string(),
                    });
                }
                Ok(path)
            }
            scheme => Err(EngineError::ConfigError {
                message: format!("Unsupported database scheme: {}", scheme),
            }),
        }
    }

    /// Database location safe to log.
    pub fn redacted_database_url(&self) -> String {
        match Url::parse(&self.database_url) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("***"));
                url.to_string()
            }
            _ => self.database_url.clone(),
        }
    }
}
