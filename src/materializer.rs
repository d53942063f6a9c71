use std::collections::HashSet;

use tracing::{info, warn};

use crate::catalog::ColumnSchema;
use crate::error::EngineError;
use crate::registry::WithdrawnBinding;
use crate::sanitize::{table_name_for_slug, with_random_suffix, Identifier};
use crate::sql;
use crate::storage::{ColumnInfoRow, TableStore};
use crate::value::Value;

const MAX_NAME_ATTEMPTS: usize = 16;
const LOAD_BATCH_ROWS: usize = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TableHandle {
    pub table: Identifier,
    /// False when an identical table already existed.
    pub created: bool,
}

/// Owns the lifecycle of physical dataset tables.
#[derive(Clone)]
pub struct TableMaterializer {
    store: TableStore,
}

impl TableMaterializer {
    pub fn new(store: TableStore) -> Self {
        Self { store }
    }

    pub async fn table_exists(&self, table: &Identifier) -> Result<bool, EngineError> {
        Ok(self.store.fetch_count(sql::table_exists(table)).await? > 0)
    }

    async fn describe_table(&self, table: &Identifier) -> Result<Vec<ColumnInfoRow>, EngineError> {
        self.store.fetch_columns(sql::table_info(table)).await
    }

    /// Derives the table name from the slug and appends random suffixes until
    /// it is free both in storage and among `reserved` names.
    pub async fn allocate_table_name(
        &self,
        slug: &str,
        reserved: &HashSet<String>,
    ) -> Result<Identifier, EngineError> {
        let base = table_name_for_slug(slug);
        let mut candidate = base.clone();
        for _ in 0..MAX_NAME_ATTEMPTS {
            if !reserved.contains(candidate.as_str()) && !self.table_exists(&candidate).await? {
                return Ok(candidate);
            }
            warn!("Table name {} is taken, retrying with a suffix", candidate);
            candidate = with_random_suffix(&base);
        }
        Err(EngineError::internal(format!(
            "could not allocate a free table name for slug {}",
            slug
        )))
    }

    /// Creates the table, or accepts an existing table of the same shape.
    pub async fn create_table(
        &self,
        table: &Identifier,
        columns: &[ColumnSchema],
    ) -> Result<TableHandle, EngineError> {
        let existing = self.describe_table(table).await?;
        if !existing.is_empty() {
            ensure_compatible(table, columns, &existing)?;
            info!("Table {} already exists with a compatible schema", table);
            return Ok(TableHandle {
                table: table.clone(),
                created: false,
            });
        }

        info!("Creating dynamic table: {}", table);
        self.store.execute(sql::create_table(table, columns)).await?;

        // a concurrent creator may have won the race with another layout
        let created = self.describe_table(table).await?;
        ensure_compatible(table, columns, &created)?;

        info!("Successfully created table: {}", table);
        Ok(TableHandle {
            table: table.clone(),
            created: true,
        })
    }

    /// Drops the table of a dataset whose binding has already been withdrawn
    /// from the registry.
    pub async fn drop_table(&self, withdrawn: WithdrawnBinding) -> Result<(), EngineError> {
        match withdrawn.table() {
            Some(table) => self.discard_table(table).await,
            None => Ok(()),
        }
    }

    /// Drops a table that was never made reachable through the registry.
    pub(crate) async fn discard_table(&self, table: &Identifier) -> Result<(), EngineError> {
        info!("Dropping table: {}", table);
        self.store.execute(sql::drop_table(table)).await?;
        info!("Successfully dropped table: {}", table);
        Ok(())
    }

    /// Inserts typed rows in one transaction per batch.
    pub async fn load_rows(
        &self,
        table: &Identifier,
        columns: &[ColumnSchema],
        rows: Vec<Vec<Value>>,
    ) -> Result<usize, EngineError> {
        info!("Inserting {} rows into {}", rows.len(), table);
        let mut inserted = 0;
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<sql::Statement> = rows
                .by_ref()
                .take(LOAD_BATCH_ROWS)
                .map(|row| sql::insert_row(table, columns, row))
                .collect();
            inserted += self.store.execute_all(batch).await?;
        }
        info!("Successfully inserted {} rows into {}", inserted, table);
        Ok(inserted)
    }

    pub async fn row_count(&self, table: &Identifier) -> Result<i64, EngineError> {
        self.store.fetch_count(sql::count(table, &[])).await
    }
}

fn expected_layout(columns: &[ColumnSchema]) -> Vec<ColumnInfoRow> {
    std::iter::once(ColumnInfoRow {
        name: "id".to_string(),
        declared_type: "INTEGER".to_string(),
        not_null: 0,
        pk: 1,
    })
    .chain(columns.iter().map(|c| ColumnInfoRow {
        name: c.field_name.as_str().to_string(),
        declared_type: sql::storage_type(c.data_type).to_string(),
        not_null: i32::from(!c.nullable),
        pk: 0,
    }))
    .collect()
}

/// Compares an existing table against the layout `columns` would create.
pub fn ensure_compatible(
    table: &Identifier,
    columns: &[ColumnSchema],
    existing: &[ColumnInfoRow],
) -> Result<(), EngineError> {
    let expected = expected_layout(columns);
    if expected.len() != existing.len() {
        return Err(EngineError::SchemaConflict {
            table: table.to_string(),
            message: format!(
                "existing table has {} columns, expected {}",
                existing.len(),
                expected.len()
            ),
        });
    }
    for (want, have) in expected.iter().zip(existing) {
        let same = want.name == have.name
            && want.declared_type.eq_ignore_ascii_case(&have.declared_type)
            && want.not_null == have.not_null
            && want.pk == have.pk;
        if !same {
            return Err(EngineError::SchemaConflict {
                table: table.to_string(),
                message: format!(
                    "column {} is {} (not_null={}), expected {} {} (not_null={})",
                    have.name,
                    have.declared_type,
                    have.not_null,
                    want.name,
                    want.declared_type,
                    want.not_null
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::sanitize_field_names;
    use crate::storage::testing::temp_store;
    use crate::value::DataType;
    use std::time::Duration;

    fn columns() -> Vec<ColumnSchema> {
        sanitize_field_names(&["Price", "Note"])
            .into_iter()
            .enumerate()
            .map(|(position, field_name)| ColumnSchema {
                name: field_name.to_string(),
                field_name,
                data_type: if position == 0 { DataType::Float } else { DataType::Text },
                nullable: position == 1,
                unique: false,
                max_length: None,
                position,
                sample_values: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn identical_layout_is_compatible() {
        let cols = columns();
        let table = table_name_for_slug("t");
        let mut existing = expected_layout(&cols);
        existing[1].declared_type = "real".to_string();
        assert!(ensure_compatible(&table, &cols, &existing).is_ok());
    }

    #[test]
    fn differing_layout_is_a_conflict() {
        let cols = columns();
        let table = table_name_for_slug("t");
        let mut existing = expected_layout(&cols);
        existing[2].not_null = 1;
        let err = ensure_compatible(&table, &cols, &existing).unwrap_err();
        assert!(matches!(err, EngineError::SchemaConflict { .. }));

        let shorter = &expected_layout(&cols)[..2];
        assert!(matches!(
            ensure_compatible(&table, &cols, shorter),
            Err(EngineError::SchemaConflict { .. })
        ));
    }

    #[tokio::test]
    async fn create_table_is_idempotent_against_storage() {
        let (_dir, store) = temp_store(2, Duration::from_secs(5));
        let materializer = TableMaterializer::new(store);
        let table = table_name_for_slug("sales");
        let cols = columns();

        let first = materializer.create_table(&table, &cols).await.unwrap();
        assert!(first.created);
        let second = materializer.create_table(&table, &cols).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.table, table);

        materializer
            .load_rows(
                &table,
                &cols,
                vec![vec![Value::Float(0.1 + 0.2), Value::Null]],
            )
            .await
            .unwrap();
        assert_eq!(materializer.row_count(&table).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incompatible_existing_table_is_a_conflict() {
        let (_dir, store) = temp_store(2, Duration::from_secs(5));
        let materializer = TableMaterializer::new(store);
        let table = table_name_for_slug("sales");
        materializer.create_table(&table, &columns()).await.unwrap();

        let mut changed = columns();
        changed[0].data_type = DataType::Integer;
        let err = materializer.create_table(&table, &changed).await.unwrap_err();
        assert!(matches!(err, EngineError::SchemaConflict { .. }));

        let mut relaxed = columns();
        relaxed[0].nullable = true;
        assert!(matches!(
            materializer.create_table(&table, &relaxed).await,
            Err(EngineError::SchemaConflict { .. })
        ));
        assert!(materializer.table_exists(&table).await.unwrap());
    }

    #[tokio::test]
    async fn table_names_skip_existing_tables() {
        let (_dir, store) = temp_store(2, Duration::from_secs(5));
        let materializer = TableMaterializer::new(store);
        let base = table_name_for_slug("sales");
        materializer.create_table(&base, &columns()).await.unwrap();

        let allocated = materializer
            .allocate_table_name("sales", &HashSet::new())
            .await
            .unwrap();
        assert_ne!(allocated, base);
        assert!(allocated.as_str().starts_with("ds_sales_"));

        let reserved: HashSet<String> = [table_name_for_slug("other").as_str().to_string()].into();
        let allocated = materializer.allocate_table_name("other", &reserved).await.unwrap();
        assert_ne!(allocated.as_str(), "ds_other");
    }
}
