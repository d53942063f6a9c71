pub mod catalog;
pub mod config;
pub mod crud;
pub mod database;
pub mod dataset_manager;
pub mod engine;
pub mod error;
pub mod inference;
pub mod materializer;
pub mod models;
pub mod parser;
pub mod registry;
pub mod sanitize;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod value;

pub use catalog::{ColumnSchema, DatasetSchema, DatasetStatus, DatasetSummary};
pub use config::ServiceConfig;
pub use crud::{ListQuery, Page, Payload, Record};
pub use engine::DatasetEngine;
pub use error::{EngineError, ErrorKind};
pub use parser::TabularData;
pub use value::{DataType, RawValue, Value};
