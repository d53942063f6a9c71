use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::catalog::{validate_columns, DatasetSchema, DatasetStatus};
use crate::config::ServiceConfig;
use crate::database::DatabaseManager;
use crate::error::EngineError;
use crate::inference::{infer_schema, InferencePolicy};
use crate::materializer::TableMaterializer;
use crate::parser::{FileParser, TabularData};
use crate::registry::DatasetRegistry;
use crate::sanitize::{slugify, MAX_SLUG_LEN};
use crate::value::{RawValue, Value};

/// Drives datasets through their lifecycle: ingestion, startup restore and
/// deletion. Lifecycle operations are serialized; CRUD traffic is not.
pub struct DatasetManager {
    database: DatabaseManager,
    materializer: TableMaterializer,
    registry: Arc<DatasetRegistry>,
    parser: FileParser,
    policy: InferencePolicy,
    lifecycle: Mutex<()>,
}

impl DatasetManager {
    pub fn new(
        database: DatabaseManager,
        materializer: TableMaterializer,
        registry: Arc<DatasetRegistry>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            database,
            materializer,
            registry,
            parser: FileParser::new(config.max_rows, config.max_columns),
            policy: config.inference.clone(),
            lifecycle: Mutex::new(()),
        }
    }

    pub async fn ingest_file(&self, name: &str, path: &Path) -> Result<DatasetSchema, EngineError> {
        let parser = self.parser;
        let owned: PathBuf = path.to_path_buf();
        let data = tokio::task::spawn_blocking(move || parser.parse_file(&owned))
            .await
            .map_err(|e| EngineError::internal(format!("File parsing task failed: {}", e)))??;

        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.ingest(name, &filename, data).await
    }

    /// Infers, materializes, loads and registers a dataset.
    ///
    /// Input problems are reported before anything is recorded. Once the
    /// dataset is recorded, failures leave it in `error` status with the
    /// message stored; a table conflict is returned as that error-status
    /// schema, any other failure is returned as the error itself.
    pub async fn ingest(
        &self,
        name: &str,
        original_filename: &str,
        data: TabularData,
    ) -> Result<DatasetSchema, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("dataset name is required"));
        }
        self.check_limits(&data)?;

        let _lifecycle = self.lifecycle.lock().await;
        info!("Processing dataset: {}", name);

        let slug = self.allocate_slug(name).await?;
        let reserved = self.database.table_names().await?;
        let table_name = self.materializer.allocate_table_name(&slug, &reserved).await?;

        let now = Utc::now();
        let mut schema = DatasetSchema {
            slug,
            name: name.to_string(),
            original_filename: original_filename.to_string(),
            table_name,
            columns: Vec::new(),
            row_count: 0,
            status: DatasetStatus::Processing,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.database.add_dataset(&schema).await?;

        match self.materialize(&mut schema, data).await {
            Ok(row_count) => {
                schema.row_count = row_count;
                schema.status = DatasetStatus::Ready;
                schema.updated_at = Utc::now();
                self.database.mark_ready(&schema.slug, row_count).await?;
                self.registry.register(schema.clone()).await?;
                info!(
                    "Successfully processed dataset {} at {}",
                    schema.slug,
                    schema.api_path()
                );
                Ok(schema)
            }
            Err(e) => {
                error!("Error processing dataset {}: {}", schema.slug, e);
                schema.status = DatasetStatus::Error;
                schema.error_message = e.public_message();
                schema.updated_at = Utc::now();
                if let Err(mark_err) = self
                    .database
                    .mark_error(&schema.slug, &schema.error_message)
                    .await
                {
                    warn!("Failed to record error for {}: {}", schema.slug, mark_err);
                }
                self.registry.register(schema.clone()).await?;

                match e {
                    EngineError::SchemaConflict { .. } => Ok(schema),
                    other => Err(other),
                }
            }
        }
    }

    fn check_limits(&self, data: &TabularData) -> Result<(), EngineError> {
        let (max_rows, max_columns) = self.parser.limits();
        let problem = if data.headers.is_empty() {
            Some("File contains no columns.".to_string())
        } else if data.rows.is_empty() {
            Some("File contains no data rows.".to_string())
        } else if data.column_count() > max_columns {
            Some(format!(
                "Too many columns ({}). Maximum is {}.",
                data.column_count(),
                max_columns
            ))
        } else if data.row_count() > max_rows {
            Some(format!(
                "Too many rows ({}). Maximum is {}.",
                data.row_count(),
                max_rows
            ))
        } else {
            None
        };
        match problem {
            Some(message) => Err(EngineError::Ingestion { message }),
            None => Ok(()),
        }
    }

    async fn materialize(
        &self,
        schema: &mut DatasetSchema,
        data: TabularData,
    ) -> Result<i64, EngineError> {
        info!("Detecting schema for {}", schema.slug);
        let columns = infer_schema(&self.policy, &data.headers, &data.rows, &data.hints);
        validate_columns(&columns)?;
        self.database.save_columns(&schema.slug, &columns).await?;
        schema.columns = columns;
        info!("Detected {} columns", schema.columns.len());

        let handle = self
            .materializer
            .create_table(&schema.table_name, &schema.columns)
            .await?;

        let rows: Vec<Vec<Value>> = data
            .rows
            .iter()
            .map(|row| {
                schema
                    .columns
                    .iter()
                    .map(|column| {
                        let raw = row.get(column.position).unwrap_or(&RawValue::Null);
                        self.policy.convert(column.data_type, raw)
                    })
                    .collect()
            })
            .collect();

        let loaded = async {
            self.materializer
                .load_rows(&schema.table_name, &schema.columns, rows)
                .await?;
            self.materializer.row_count(&schema.table_name).await
        }
        .await;

        if loaded.is_err() && handle.created {
            if let Err(drop_err) = self.materializer.discard_table(&schema.table_name).await {
                warn!("Failed to drop table {}: {}", schema.table_name, drop_err);
            }
        }
        loaded
    }

    /// Slug for `name`, suffixed `-1`, `-2`, ... while taken.
    async fn allocate_slug(&self, name: &str) -> Result<String, EngineError> {
        let base = slugify(name);
        let mut candidate = base.clone();
        let mut counter = 1;
        while self.database.slug_exists(&candidate).await?
            || self.registry.lookup(&candidate).await.is_some()
        {
            let suffix = format!("-{}", counter);
            let stem = &base[..base.len().min(MAX_SLUG_LEN - suffix.len())];
            candidate = format!("{}{}", stem.trim_end_matches('-'), suffix);
            counter += 1;
        }
        Ok(candidate)
    }

    /// Withdraws the binding, drops the table, then deletes the metadata.
    pub async fn delete_dataset(&self, slug: &str) -> Result<(), EngineError> {
        let _lifecycle = self.lifecycle.lock().await;
        info!("Deleting dataset {}", slug);

        match self.registry.unregister(slug).await {
            Ok(withdrawn) => self.materializer.drop_table(withdrawn).await?,
            Err(EngineError::NotFound { .. }) => {
                // left behind by an interrupted ingestion or a failed restore
                let stored = self
                    .database
                    .get_dataset(slug)
                    .await?
                    .ok_or_else(|| EngineError::not_found(format!("dataset {} not found", slug)))?;
                self.materializer.discard_table(&stored.table_name).await?;
            }
            Err(e) => return Err(e),
        }

        self.database.delete_dataset(slug).await?;
        info!("Dataset {} deleted", slug);
        Ok(())
    }

    /// Re-registers stored datasets. Returns the number that became servable.
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let _lifecycle = self.lifecycle.lock().await;
        let stored = self.database.list_datasets().await?;
        info!("Restoring {} datasets from catalog", stored.len());

        let mut servable = 0;
        for schema in stored {
            let slug = schema.slug.clone();
            match self.restore_one(schema).await {
                Ok(DatasetStatus::Ready) => servable += 1,
                Ok(status) => info!("Dataset {} restored with status {}", slug, status),
                Err(e) => warn!("Skipping dataset {} during restore: {}", slug, e),
            }
        }

        info!("Restored {} servable datasets", servable);
        Ok(servable)
    }

    async fn restore_one(&self, mut schema: DatasetSchema) -> Result<DatasetStatus, EngineError> {
        match schema.status {
            DatasetStatus::Ready => {
                let verified = if self.materializer.table_exists(&schema.table_name).await? {
                    self.materializer
                        .create_table(&schema.table_name, &schema.columns)
                        .await
                        .map(|_| ())
                } else {
                    Err(EngineError::not_found(format!(
                        "table {} is missing",
                        schema.table_name
                    )))
                };

                match verified {
                    Ok(()) => {
                        schema.row_count = self.materializer.row_count(&schema.table_name).await?;
                        self.database
                            .update_row_count(&schema.slug, schema.row_count)
                            .await?;
                    }
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        warn!("Dataset {} failed verification: {}", schema.slug, e);
                        schema.status = DatasetStatus::Error;
                        schema.error_message = e.public_message();
                        self.database
                            .mark_error(&schema.slug, &schema.error_message)
                            .await?;
                    }
                }
            }
            DatasetStatus::Processing => {
                warn!("Dataset {} was interrupted during ingestion", schema.slug);
                self.materializer.discard_table(&schema.table_name).await?;
                schema.status = DatasetStatus::Error;
                schema.error_message = "ingestion was interrupted".to_string();
                self.database
                    .mark_error(&schema.slug, &schema.error_message)
                    .await?;
            }
            DatasetStatus::Error => {}
        }

        let status = schema.status;
        self.registry.register(schema).await?;
        Ok(status)
    }
}
