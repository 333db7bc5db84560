// Ordered fallback across several backends
use super::composite::{BackendDescriptor, CompositeBackends};
use super::ObjectStore;
use crate::dataset::{DatasetRef, ObjectParams};
use crate::error::{ObjectStoreError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Reads search the backends by ascending order and use the first one
/// holding the dataset. New data always goes to the first backend.
pub struct HierarchicalObjectStore {
    backends: CompositeBackends,
}

impl HierarchicalObjectStore {
    pub fn new(backends: CompositeBackends) -> Self {
        tracing::info!(
            "Hierarchical store over {} backends, writing to '{}'",
            backends.len(),
            backends.first().id
        );
        Self { backends }
    }

    pub fn backends(&self) -> &CompositeBackends {
        &self.backends
    }

    async fn holder(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<&BackendDescriptor> {
        self.backends
            .find_holder(dataset, params)
            .await?
            .ok_or_else(|| {
                ObjectStoreError::NotFound(format!("dataset {} in any backend", dataset.id()))
            })
    }
}

#[async_trait]
impl ObjectStore for HierarchicalObjectStore {
    fn backend_type(&self) -> &'static str {
        "hierarchical"
    }

    async fn exists(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        Ok(self.backends.find_holder(dataset, params).await?.is_some())
    }

    async fn file_ready(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        match self.backends.find_holder(dataset, params).await? {
            Some(holder) => holder.store.file_ready(dataset, params).await,
            None => Ok(false),
        }
    }

    async fn create(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<()> {
        self.backends.first().store.create(dataset, params).await
    }

    async fn empty(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        self.holder(dataset, params)
            .await?
            .store
            .empty(dataset, params)
            .await
    }

    async fn size(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<u64> {
        match self.backends.find_holder(dataset, params).await? {
            Some(holder) => holder.store.size(dataset, params).await,
            None => Ok(0),
        }
    }

    async fn delete(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        match self.backends.find_holder(dataset, params).await? {
            Some(holder) => holder.store.delete(dataset, params).await,
            None => Ok(false),
        }
    }

    async fn get_data(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        start: u64,
        count: Option<u64>,
    ) -> Result<Vec<u8>> {
        self.holder(dataset, params)
            .await?
            .store
            .get_data(dataset, params, start, count)
            .await
    }

    async fn get_filename(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        self.holder(dataset, params)
            .await?
            .store
            .get_filename(dataset, params)
            .await
    }

    async fn update_from_file(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        file_name: &Path,
        create: bool,
    ) -> Result<()> {
        let target = if create {
            self.backends.first()
        } else {
            self.holder(dataset, params).await?
        };
        target
            .store
            .update_from_file(dataset, params, file_name, create)
            .await
    }

    async fn get_object_url(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<Option<String>> {
        match self.backends.find_holder(dataset, params).await? {
            Some(holder) => holder.store.get_object_url(dataset, params).await,
            None => Ok(None),
        }
    }

    async fn get_store_usage_percent(&self) -> Result<f64> {
        self.backends.first().store.get_store_usage_percent().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskObjectStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (HierarchicalObjectStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let files1: Arc<dyn ObjectStore> = Arc::new(DiskObjectStore::with_root(temp.path().join("files1")));
        let files2: Arc<dyn ObjectStore> = Arc::new(DiskObjectStore::with_root(temp.path().join("files2")));
        let backends = CompositeBackends::new(vec![
            BackendDescriptor::new("files2", files2).order(1),
            BackendDescriptor::new("files1", files1).order(0),
        ])
        .unwrap();
        (HierarchicalObjectStore::new(backends), temp)
    }

    fn source_file(temp: &TempDir, contents: &[u8]) -> PathBuf {
        let path = temp.path().join("job_output");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_creates_land_in_first_backend() {
        let (store, temp) = create_test_store();
        let params = ObjectParams::new();
        let files1 = std::path::absolute(temp.path().join("files1")).unwrap();

        for id in 1..=100u64 {
            let dataset = DatasetRef::new(id);
            store.create(&dataset, &params).await.unwrap();
            let path = store.get_filename(&dataset, &params).await.unwrap();
            assert!(path.starts_with(&files1), "{} not under files1", path.display());
        }
    }

    #[tokio::test]
    async fn test_reads_fall_back_in_order() {
        let (store, temp) = create_test_store();
        let dataset = DatasetRef::new(7);
        let params = ObjectParams::new();
        let files2 = store.backends().get("files2").unwrap().store.clone();
        let source = source_file(&temp, b"second tier");
        files2.update_from_file(&dataset, &params, &source, true).await.unwrap();

        assert!(store.exists(&dataset, &params).await.unwrap());
        assert!(store.file_ready(&dataset, &params).await.unwrap());
        assert_eq!(store.size(&dataset, &params).await.unwrap(), 11);
        assert!(!store.empty(&dataset, &params).await.unwrap());
        assert_eq!(store.get_data(&dataset, &params, 1, Some(6)).await.unwrap(), b"econd ");
        assert!(store
            .get_filename(&dataset, &params)
            .await
            .unwrap()
            .starts_with(std::path::absolute(temp.path().join("files2")).unwrap()));
    }

    #[tokio::test]
    async fn test_first_backend_shadows_later_ones() {
        let (store, temp) = create_test_store();
        let dataset = DatasetRef::new(8);
        let params = ObjectParams::new();
        let files2 = store.backends().get("files2").unwrap().store.clone();
        files2
            .update_from_file(&dataset, &params, &source_file(&temp, b"old"), true)
            .await
            .unwrap();

        store
            .update_from_file(&dataset, &params, &source_file(&temp, b"newer"), true)
            .await
            .unwrap();

        assert_eq!(store.get_data(&dataset, &params, 0, None).await.unwrap(), b"newer");
        assert_eq!(files2.get_data(&dataset, &params, 0, None).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_absent_dataset() {
        let (store, temp) = create_test_store();
        let dataset = DatasetRef::new(9);
        let params = ObjectParams::new();

        assert!(!store.exists(&dataset, &params).await.unwrap());
        assert!(!store.file_ready(&dataset, &params).await.unwrap());
        assert_eq!(store.size(&dataset, &params).await.unwrap(), 0);
        assert!(!store.delete(&dataset, &params).await.unwrap());
        assert!(store.empty(&dataset, &params).await.unwrap_err().is_not_found());
        assert!(store.get_data(&dataset, &params, 0, None).await.unwrap_err().is_not_found());
        assert_eq!(store.get_object_url(&dataset, &params).await.unwrap(), None);

        let err = store
            .update_from_file(&dataset, &params, &source_file(&temp, b"x"), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_from_holder() {
        let (store, temp) = create_test_store();
        let dataset = DatasetRef::new(10);
        let params = ObjectParams::new();
        let files2 = store.backends().get("files2").unwrap().store.clone();
        files2
            .update_from_file(&dataset, &params, &source_file(&temp, b"bye"), true)
            .await
            .unwrap();

        assert!(store.delete(&dataset, &params).await.unwrap());
        assert!(!files2.exists(&dataset, &params).await.unwrap());
        assert!(!store.exists(&dataset, &params).await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_reports_first_backend() {
        let (store, _temp) = create_test_store();
        let first = store.backends().first().store.get_store_usage_percent().await.unwrap();
        let usage = store.get_store_usage_percent().await.unwrap();

        assert!((0.0..=100.0).contains(&usage));
        assert!((usage - first).abs() < 1.0);
    }
}
