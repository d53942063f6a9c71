use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::catalog::{ColumnSchema, DatasetSchema, DatasetStatus};
use crate::config::ServiceConfig;
use crate::error::EngineError;
use crate::models::*;
use crate::schema::{dataset_columns, datasets};
use crate::storage::{build_pool, TableStore};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Metadata store for datasets and their column schemas. Shares its pool
/// with the materialized tables, which live in the same database file.
#[derive(Clone)]
pub struct DatabaseManager {
    store: TableStore,
}

impl DatabaseManager {
    pub async fn new(config: &ServiceConfig) -> Result<Self, EngineError> {
        let database_path = config.database_path()?;
        Self::run_migrations(database_path.clone(), config.busy_timeout).await?;

        let pool = build_pool(&database_path, config.pool_size, config.busy_timeout)?;
        info!(
            "Database pool ready ({} connections, timeout {:?})",
            config.pool_size, config.storage_timeout
        );

        Ok(Self {
            store: TableStore::new(pool, config.storage_timeout),
        })
    }

    pub async fn run_migrations(
        database_path: String,
        busy_timeout: Duration,
    ) -> Result<(), EngineError> {
        // diesel_migrations only drives synchronous connections
        tokio::task::spawn_blocking(move || {
            let mut connection = SqliteConnection::establish(&database_path).map_err(|e| {
                EngineError::ConfigError {
                    message: format!("Failed to establish connection for migrations: {}", e),
                }
            })?;

            connection
                .batch_execute(&format!(
                    "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = {};",
                    busy_timeout.as_millis()
                ))
                .map_err(|e| EngineError::ConfigError {
                    message: format!("Failed to configure database: {}", e),
                })?;

            let applied = connection
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| EngineError::ConfigError {
                    message: format!("Failed to run migrations: {}", e),
                })?;
            info!("Applied {} pending migrations", applied.len());
            Ok(())
        })
        .await
        .map_err(|e| EngineError::internal(format!("Migration task failed: {}", e)))?
    }

    pub(crate) fn store(&self) -> &TableStore {
        &self.store
    }

    /// Records a new dataset. The slug primary key makes concurrent inserts of
    /// the same slug fail with [`EngineError::AlreadyExists`].
    pub async fn add_dataset(&self, schema: &DatasetSchema) -> Result<(), EngineError> {
        info!("Adding dataset {} to catalog", schema.slug);
        let row = NewDatasetRow::from_schema(schema);

        self.store
            .run("add dataset", move |conn| {
                Box::pin(async move {
                    diesel::insert_into(datasets::table)
                        .values(&row)
                        .execute(conn)
                        .await
                        .map_err(|e| match e {
                            diesel::result::Error::DatabaseError(
                                DatabaseErrorKind::UniqueViolation,
                                _,
                            ) => EngineError::AlreadyExists {
                                slug: schema.slug.clone(),
                            },
                            other => other.into(),
                        })?;
                    Ok(())
                })
            })
            .await
    }

    /// Replaces the stored columns of a dataset.
    pub async fn save_columns(
        &self,
        slug: &str,
        columns: &[ColumnSchema],
    ) -> Result<(), EngineError> {
        let rows = columns
            .iter()
            .map(|column| NewColumnRow::from_column(slug, column))
            .collect::<Result<Vec<_>, _>>()?;

        self.store
            .run("save columns", move |conn| {
                Box::pin(async move {
                    conn.transaction::<_, EngineError, _>(|conn| {
                        Box::pin(async move {
                            diesel::delete(
                                dataset_columns::table
                                    .filter(dataset_columns::dataset_slug.eq(slug)),
                            )
                            .execute(conn)
                            .await?;

                            for row in &rows {
                                diesel::insert_into(dataset_columns::table)
                                    .values(row)
                                    .execute(conn)
                                    .await?;
                            }
                            Ok(())
                        })
                    })
                    .await
                })
            })
            .await?;

        info!("Saved {} column definitions for {}", columns.len(), slug);
        Ok(())
    }

    pub async fn mark_ready(&self, slug: &str, row_count: i64) -> Result<(), EngineError> {
        self.update_status(slug, DatasetStatus::Ready, "", Some(row_count))
            .await
    }

    pub async fn mark_error(&self, slug: &str, message: &str) -> Result<(), EngineError> {
        self.update_status(slug, DatasetStatus::Error, message, None)
            .await
    }

    async fn update_status(
        &self,
        slug: &str,
        status: DatasetStatus,
        message: &str,
        row_count: Option<i64>,
    ) -> Result<(), EngineError> {
        let updated = self
            .store
            .run("update dataset status", move |conn| {
                Box::pin(async move {
                    let target = datasets::table.find(slug);
                    let now = format_timestamp(&Utc::now());
                    let changed = match row_count {
                        Some(count) => {
                            diesel::update(target)
                                .set((
                                    datasets::status.eq(status.as_str()),
                                    datasets::error_message.eq(message),
                                    datasets::row_count.eq(count),
                                    datasets::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                        None => {
                            diesel::update(target)
                                .set((
                                    datasets::status.eq(status.as_str()),
                                    datasets::error_message.eq(message),
                                    datasets::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                    };
                    Ok(changed)
                })
            })
            .await?;

        if updated == 0 {
            return Err(EngineError::not_found(format!("dataset {} not found", slug)));
        }
        info!("Dataset {} is now {}", slug, status);
        Ok(())
    }

    pub async fn update_row_count(&self, slug: &str, row_count: i64) -> Result<(), EngineError> {
        self.store
            .run("update row count", move |conn| {
                Box::pin(async move {
                    diesel::update(datasets::table.find(slug))
                        .set((
                            datasets::row_count.eq(row_count),
                            datasets::updated_at.eq(format_timestamp(&Utc::now())),
                        ))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    pub async fn get_dataset(&self, slug: &str) -> Result<Option<DatasetSchema>, EngineError> {
        let loaded = self
            .store
            .run("get dataset", move |conn| {
                Box::pin(async move {
                    let dataset = datasets::table
                        .find(slug)
                        .select(DatasetRow::as_select())
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(dataset) = dataset else {
                        return Ok(None);
                    };

                    let columns = dataset_columns::table
                        .filter(dataset_columns::dataset_slug.eq(slug))
                        .order(dataset_columns::position.asc())
                        .select(ColumnRow::as_select())
                        .load(conn)
                        .await?;
                    Ok(Some((dataset, columns)))
                })
            })
            .await?;

        loaded
            .map(|(dataset, columns)| dataset.into_schema(columns))
            .transpose()
    }

    /// All datasets, newest first.
    pub async fn list_datasets(&self) -> Result<Vec<DatasetSchema>, EngineError> {
        let (rows, column_rows) = self
            .store
            .run("list datasets", |conn| {
                Box::pin(async move {
                    let rows = datasets::table
                        .order((datasets::created_at.desc(), datasets::slug.asc()))
                        .select(DatasetRow::as_select())
                        .load(conn)
                        .await?;
                    let columns = dataset_columns::table
                        .order((
                            dataset_columns::dataset_slug.asc(),
                            dataset_columns::position.asc(),
                        ))
                        .select(ColumnRow::as_select())
                        .load(conn)
                        .await?;
                    Ok((rows, columns))
                })
            })
            .await?;

        let mut by_slug: HashMap<String, Vec<ColumnRow>> = HashMap::new();
        for column in column_rows {
            by_slug
                .entry(column.dataset_slug.clone())
                .or_default()
                .push(column);
        }

        rows.into_iter()
            .map(|row| {
                let columns = by_slug.remove(&row.slug).unwrap_or_default();
                row.into_schema(columns)
            })
            .collect()
    }

    /// Removes the dataset and its columns. Returns false when nothing was stored.
    pub async fn delete_dataset(&self, slug: &str) -> Result<bool, EngineError> {
        let deleted = self
            .store
            .run("delete dataset", move |conn| {
                Box::pin(async move {
                    conn.transaction::<_, EngineError, _>(|conn| {
                        Box::pin(async move {
                            diesel::delete(
                                dataset_columns::table
                                    .filter(dataset_columns::dataset_slug.eq(slug)),
                            )
                            .execute(conn)
                            .await?;
                            let deleted = diesel::delete(datasets::table.find(slug))
                                .execute(conn)
                                .await?;
                            Ok(deleted)
                        })
                    })
                    .await
                })
            })
            .await?;

        info!("Deleted dataset {} from catalog", slug);
        Ok(deleted > 0)
    }

    pub async fn slug_exists(&self, slug: &str) -> Result<bool, EngineError> {
        self.store
            .run("slug lookup", move |conn| {
                Box::pin(async move {
                    let found = datasets::table
                        .find(slug)
                        .select(datasets::slug)
                        .first::<String>(conn)
                        .await
                        .optional()?;
                    Ok(found.is_some())
                })
            })
            .await
    }

    /// Physical table names already claimed by a dataset.
    pub async fn table_names(&self) -> Result<HashSet<String>, EngineError> {
        self.store
            .run("table names", |conn| {
                Box::pin(async move {
                    let names = datasets::table
                        .select(datasets::table_name)
                        .load::<String>(conn)
                        .await?;
                    Ok(names.into_iter().collect())
                })
            })
            .await
    }
}
