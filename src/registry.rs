use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::catalog::{ColumnSchema, DatasetSchema, DatasetStatus};
use crate::crud::TableView;
use crate::error::EngineError;
use crate::sanitize::Identifier;

/// Association between a slug and its physical table and column schema.
#[derive(Debug)]
pub struct Binding {
    schema: DatasetSchema,
    row_count: AtomicI64,
}

impl Binding {
    fn new(schema: DatasetSchema) -> Self {
        let row_count = AtomicI64::new(schema.row_count);
        Self { schema, row_count }
    }

    pub fn slug(&self) -> &str {
        &self.schema.slug
    }

    pub fn status(&self) -> DatasetStatus {
        self.schema.status
    }

    pub fn table(&self) -> &Identifier {
        &self.schema.table_name
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.schema.columns
    }

    pub fn view(&self) -> TableView<'_> {
        TableView {
            table: &self.schema.table_name,
            columns: &self.schema.columns,
        }
    }

    pub fn row_count(&self) -> i64 {
        self.row_count.load(Ordering::Relaxed)
    }

    pub fn set_row_count(&self, count: i64) {
        self.row_count.store(count, Ordering::Relaxed);
    }

    /// Snapshot of the bound schema carrying the current cached row count.
    pub fn schema(&self) -> DatasetSchema {
        let mut schema = self.schema.clone();
        schema.row_count = self.row_count();
        schema
    }

    fn is_servable(&self) -> bool {
        self.schema.status == DatasetStatus::Ready
    }
}

/// A binding that has been removed from the registry. Holding one is the
/// only way to ask the materializer to drop a registered table, which keeps
/// drops ordered after the binding stops being reachable.
#[derive(Debug)]
pub struct WithdrawnBinding {
    binding: Arc<Binding>,
}

impl WithdrawnBinding {
    pub fn slug(&self) -> &str {
        self.binding.slug()
    }

    /// Physical table to drop. Datasets that never became ready own none.
    pub fn table(&self) -> Option<&Identifier> {
        self.binding.is_servable().then(|| self.binding.table())
    }
}

#[derive(Debug, Default)]
pub struct DatasetRegistry {
    bindings: RwLock<HashMap<String, Arc<Binding>>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, schema: DatasetSchema) -> Result<Arc<Binding>, EngineError> {
        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(&schema.slug) {
            return Err(EngineError::AlreadyExists { slug: schema.slug });
        }
        let slug = schema.slug.clone();
        let status = schema.status;
        let binding = Arc::new(Binding::new(schema));
        bindings.insert(slug.clone(), binding.clone());
        info!("Registered dataset {} (status={})", slug, status);
        Ok(binding)
    }

    pub async fn unregister(&self, slug: &str) -> Result<WithdrawnBinding, EngineError> {
        let binding = self
            .bindings
            .write()
            .await
            .remove(slug)
            .ok_or_else(|| EngineError::not_found(format!("dataset {} not found", slug)))?;
        info!("Unregistered dataset {}", slug);
        Ok(WithdrawnBinding { binding })
    }

    pub async fn lookup(&self, slug: &str) -> Option<Arc<Binding>> {
        self.bindings.read().await.get(slug).cloned()
    }

    /// Lookup for CRUD requests: unknown slugs and datasets that are not
    /// ready are both `NotFound`.
    pub async fn lookup_servable(&self, slug: &str) -> Result<Arc<Binding>, EngineError> {
        let binding = self
            .lookup(slug)
            .await
            .ok_or_else(|| EngineError::not_found(format!("dataset {} not found", slug)))?;
        if !binding.is_servable() {
            debug!("Rejecting request for dataset {} in status {}", slug, binding.status());
            return Err(EngineError::not_found(format!(
                "dataset {} is not available (status: {})",
                slug,
                binding.status()
            )));
        }
        Ok(binding)
    }

    pub async fn set_row_count(&self, slug: &str, count: i64) {
        if let Some(binding) = self.lookup(slug).await {
            binding.set_row_count(count);
        }
    }

    pub async fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.bindings.read().await.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}
