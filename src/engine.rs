use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::{DatasetSchema, DatasetSummary};
use crate::config::ServiceConfig;
use crate::crud::{CrudExecutor, ListQuery, Page, Payload, Record};
use crate::database::DatabaseManager;
use crate::dataset_manager::DatasetManager;
use crate::error::EngineError;
use crate::materializer::TableMaterializer;
use crate::parser::TabularData;
use crate::registry::{Binding, DatasetRegistry};

/// Entry point for transports: every dataset operation, addressed by slug.
pub struct DatasetEngine {
    database: DatabaseManager,
    materializer: TableMaterializer,
    registry: Arc<DatasetRegistry>,
    crud: CrudExecutor,
    dataset_manager: DatasetManager,
}

impl DatasetEngine {
    /// Opens the database, applies migrations and restores stored datasets.
    pub async fn new(config: ServiceConfig) -> Result<Self, EngineError> {
        info!("Initializing dataset engine");
        config.validate()?;

        let database = DatabaseManager::new(&config).await?;
        let store = database.store().clone();
        let registry = Arc::new(DatasetRegistry::new());
        let materializer = TableMaterializer::new(store.clone());
        let crud = CrudExecutor::new(store, config.inference.parse.clone());
        let dataset_manager = DatasetManager::new(
            database.clone(),
            materializer.clone(),
            registry.clone(),
            &config,
        );

        let restored = dataset_manager.restore().await?;
        info!("Dataset engine initialized ({} datasets servable)", restored);

        Ok(Self {
            database,
            materializer,
            registry,
            crud,
            dataset_manager,
        })
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub async fn list(&self, slug: &str, query: &ListQuery) -> Result<Page, EngineError> {
        let binding = self.registry.lookup_servable(slug).await?;
        self.crud.list(binding.view(), query).await
    }

    pub async fn get(&self, slug: &str, id: i64) -> Result<Record, EngineError> {
        let binding = self.registry.lookup_servable(slug).await?;
        self.crud.get(binding.view(), id).await
    }

    pub async fn create(&self, slug: &str, payload: &Payload) -> Result<Record, EngineError> {
        let binding = self.registry.lookup_servable(slug).await?;
        let record = self.crud.create(binding.view(), payload).await?;
        self.refresh_row_count(&binding).await;
        Ok(record)
    }

    pub async fn replace(&self, slug: &str, id: i64, payload: &Payload) -> Result<Record, EngineError> {
        let binding = self.registry.lookup_servable(slug).await?;
        self.crud.replace(binding.view(), id, payload).await
    }

    pub async fn patch(&self, slug: &str, id: i64, payload: &Payload) -> Result<Record, EngineError> {
        let binding = self.registry.lookup_servable(slug).await?;
        self.crud.patch(binding.view(), id, payload).await
    }

    pub async fn delete(&self, slug: &str, id: i64) -> Result<(), EngineError> {
        let binding = self.registry.lookup_servable(slug).await?;
        self.crud.delete(binding.view(), id).await?;
        self.refresh_row_count(&binding).await;
        Ok(())
    }

    /// Schema of any registered dataset, including ones in `error` status.
    pub async fn describe(&self, slug: &str) -> Result<DatasetSchema, EngineError> {
        self.registry
            .lookup(slug)
            .await
            .map(|binding| binding.schema())
            .ok_or_else(|| EngineError::not_found(format!("dataset {} not found", slug)))
    }

    pub async fn list_datasets(&self) -> Result<Vec<DatasetSummary>, EngineError> {
        let datasets = self.database.list_datasets().await?;
        Ok(datasets.iter().map(DatasetSummary::from).collect())
    }

    pub async fn ingest(
        &self,
        name: &str,
        original_filename: &str,
        data: TabularData,
    ) -> Result<DatasetSchema, EngineError> {
        self.dataset_manager.ingest(name, original_filename, data).await
    }

    pub async fn ingest_file(&self, name: &str, path: &Path) -> Result<DatasetSchema, EngineError> {
        self.dataset_manager.ingest_file(name, path).await
    }

    pub async fn delete_dataset(&self, slug: &str) -> Result<(), EngineError> {
        self.dataset_manager.delete_dataset(slug).await
    }

    pub async fn health_check(&self) -> Result<(), EngineError> {
        self.database.store().health_check().await
    }

    /// Row counts are a cache; a failed refresh never fails the mutation.
    async fn refresh_row_count(&self, binding: &Binding) {
        match self.materializer.row_count(binding.table()).await {
            Ok(count) => {
                binding.set_row_count(count);
                if let Err(e) = self.database.update_row_count(binding.slug(), count).await {
                    warn!("Failed to store row count for {}: {}", binding.slug(), e);
                }
            }
            Err(e) => warn!("Failed to refresh row count for {}: {}", binding.slug(), e),
        }
    }
}
