// Remote blob backends fronted by a staging cache
use super::cache::StagingCache;
use super::config::{
    extra_dir_pairs, AzureBlobConfig, CacheConfig, CloudConfig, ExtraDirConfig, PithosConfig,
    S3Config,
};
use super::disk::DiskObjectStore;
use super::ObjectStore;
use crate::dataset::{DatasetRef, ObjectParams};
use crate::error::{ObjectStoreError, Result};
use crate::path::PathResolver;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Network operations against one bucket or container.
///
/// Implementations own their timeout and retry policy; a returned error is
/// final for the call.
#[async_trait]
pub trait RemoteCapability: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Object size, or `None` if the key does not exist
    async fn head(&self, key: &str) -> anyhow::Result<Option<u64>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Direct URL for a key, if the service offers one
    fn url(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Remote backend family and its settings
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFamily {
    S3(S3Config),
    AzureBlob(AzureBlobConfig),
    Cloud(CloudConfig),
    Pithos(PithosConfig),
}

impl RemoteFamily {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteFamily::S3(_) => "s3",
            RemoteFamily::AzureBlob(_) => "azure_blob",
            RemoteFamily::Cloud(_) => "cloud",
            RemoteFamily::Pithos(_) => "pithos",
        }
    }

    /// Bucket or container name
    pub fn container(&self) -> &str {
        match self {
            RemoteFamily::S3(config) => &config.bucket.name,
            RemoteFamily::AzureBlob(config) => &config.container.name,
            RemoteFamily::Cloud(config) => &config.bucket.name,
            RemoteFamily::Pithos(config) => &config.container.name,
        }
    }

    pub fn cache(&self) -> &CacheConfig {
        match self {
            RemoteFamily::S3(config) => &config.cache,
            RemoteFamily::AzureBlob(config) => &config.cache,
            RemoteFamily::Cloud(config) => &config.cache,
            RemoteFamily::Pithos(config) => &config.cache,
        }
    }

    /// Staging directory of this bucket: `<cache.path>/<family>/<container>`.
    ///
    /// Adapters sharing a `cache.path` get separate directories.
    pub fn cache_root(&self) -> Result<PathBuf> {
        let container = self.container();
        let mut components = Path::new(container).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self
                .cache()
                .path
                .join(self.name())
                .join(container)),
            _ => Err(ObjectStoreError::Configuration(format!(
                "{} container name '{}' cannot be used as a cache directory",
                self.name(),
                container
            ))),
        }
    }

    pub fn extra_dirs(&self) -> &[ExtraDirConfig] {
        match self {
            RemoteFamily::S3(config) => &config.extra_dirs,
            RemoteFamily::AzureBlob(config) => &config.extra_dirs,
            RemoteFamily::Cloud(config) => &config.extra_dirs,
            RemoteFamily::Pithos(config) => &config.extra_dirs,
        }
    }
}

/// Turns a family's settings into a connected capability
pub trait CapabilityProvider: Send + Sync {
    fn connect(&self, family: &RemoteFamily) -> Result<Arc<dyn RemoteCapability>>;
}

/// Provider for builds without any network client
pub struct OfflineProvider;

impl CapabilityProvider for OfflineProvider {
    fn connect(&self, family: &RemoteFamily) -> Result<Arc<dyn RemoteCapability>> {
        Err(ObjectStoreError::Configuration(format!(
            "no client available for {} backend '{}'",
            family.name(),
            family.container()
        )))
    }
}

/// Object store over a remote capability.
///
/// Objects live remotely under keys mirroring the disk layout
/// (`000/dataset_1.dat`); reads and path requests go through the staging
/// cache. Requests with a `base_dir` role address local scratch directories
/// and never touch the remote.
pub struct RemoteObjectStore {
    family: RemoteFamily,
    remote: Arc<dyn RemoteCapability>,
    cache: Arc<StagingCache>,
    resolver: PathResolver,
    scratch: DiskObjectStore,
}

impl RemoteObjectStore {
    pub fn new(family: RemoteFamily, remote: Arc<dyn RemoteCapability>) -> Result<Self> {
        let cache = Arc::new(StagingCache::new(family.cache_root()?, family.cache().size));
        let resolver = PathResolver::new(
            cache.root().to_path_buf(),
            extra_dir_pairs(family.extra_dirs()),
        );
        let scratch = DiskObjectStore::from_resolver(resolver.clone());

        tracing::info!(
            "Remote {} store on '{}' staging in {}",
            family.name(),
            family.container(),
            cache.root().display()
        );

        Ok(Self {
            family,
            remote,
            cache,
            resolver,
            scratch,
        })
    }

    pub fn family(&self) -> &RemoteFamily {
        &self.family
    }

    pub fn cache(&self) -> &Arc<StagingCache> {
        &self.cache
    }

    fn key(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<String> {
        self.resolver.object_key(dataset, params)
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        self.remote
            .head(key)
            .await
            .map_err(|e| ObjectStoreError::capability("head", key, e))
    }

    async fn remove_remote(&self, key: &str) -> Result<bool> {
        if self.head(key).await?.is_none() {
            return Ok(false);
        }
        self.remote
            .delete(key)
            .await
            .map_err(|e| ObjectStoreError::capability("delete", key, e))?;
        Ok(true)
    }

    fn not_found(&self, dataset: &DatasetRef, key: &str) -> ObjectStoreError {
        ObjectStoreError::NotFound(format!(
            "dataset {} at {}:{}/{}",
            dataset.id(),
            self.family.name(),
            self.family.container(),
            key
        ))
    }
}

#[async_trait]
impl ObjectStore for RemoteObjectStore {
    fn backend_type(&self) -> &'static str {
        self.family.name()
    }

    async fn exists(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        if params.base_dir.is_some() {
            return self.scratch.exists(dataset, params).await;
        }

        let key = self.key(dataset, params)?;
        let cached = if params.dir_only {
            self.cache.dir_exists(&key).await?
        } else {
            self.cache.contains(&key).await?
        };
        if cached {
            return Ok(true);
        }
        Ok(self.head(&key).await?.is_some())
    }

    async fn file_ready(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        if params.base_dir.is_some() {
            return self.scratch.file_ready(dataset, params).await;
        }

        let key = self.key(dataset, params)?;
        let Some(local) = self.cache.cached_size(&key).await? else {
            return Ok(false);
        };
        let remote = self.head(&key).await?;
        if remote != Some(local) {
            tracing::debug!(
                "Cached {} is {} bytes, remote reports {:?}",
                key,
                local,
                remote
            );
        }
        Ok(remote == Some(local))
    }

    async fn create(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<()> {
        if params.base_dir.is_some() {
            return self.scratch.create(dataset, params).await;
        }
        if self.exists(dataset, params).await? {
            return Ok(());
        }

        let key = self.key(dataset, params)?;
        if params.dir_only {
            self.cache.create_dir(&key).await?;
            self.remote
                .put(&key, &[])
                .await
                .map_err(|e| ObjectStoreError::capability("put", &key, e))?;
        } else {
            self.cache.stage_out(&key, &[], self.remote.as_ref()).await?;
        }

        tracing::debug!("Created dataset {} as {}", dataset.id(), key);
        Ok(())
    }

    async fn empty(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        if params.base_dir.is_some() {
            return self.scratch.empty(dataset, params).await;
        }
        if !self.exists(dataset, params).await? {
            let key = self.key(dataset, params)?;
            return Err(self.not_found(dataset, &key));
        }
        Ok(self.size(dataset, params).await? == 0)
    }

    async fn size(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<u64> {
        if params.base_dir.is_some() {
            return self.scratch.size(dataset, params).await;
        }

        let key = self.key(dataset, params)?;
        if let Some(size) = self.cache.cached_size(&key).await? {
            return Ok(size);
        }
        Ok(self.head(&key).await?.unwrap_or(0))
    }

    async fn delete(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        if params.base_dir.is_some() {
            return self.scratch.delete(dataset, params).await;
        }

        if params.entire_extra_files_dir && params.extra_dir.is_some() {
            // keys under the directory cannot be listed through the
            // capability; drop what is staged and the directory marker
            let dir_params = ObjectParams {
                dir_only: true,
                ..params.clone()
            };
            let dir_key = self.key(dataset, &dir_params)?;
            let staged = self.cache.remove_dir(&dir_key).await?;
            let marker = self.remove_remote(&dir_key).await?;
            return Ok(staged || marker);
        }

        let key = self.key(dataset, params)?;
        let staged = self.cache.remove(&key).await?;
        let remote = self.remove_remote(&key).await?;
        if staged || remote {
            tracing::info!("Deleted dataset {}: {}", dataset.id(), key);
        }
        Ok(staged || remote)
    }

    async fn get_data(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        start: u64,
        count: Option<u64>,
    ) -> Result<Vec<u8>> {
        if params.base_dir.is_some() {
            return self.scratch.get_data(dataset, params, start, count).await;
        }
        if !self.exists(dataset, params).await? {
            let key = self.key(dataset, params)?;
            return Err(self.not_found(dataset, &key));
        }

        let key = self.key(dataset, params)?;
        self.cache
            .read_range(&key, start, count, self.remote.as_ref())
            .await
    }

    async fn get_filename(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        if params.base_dir.is_some() {
            return self.scratch.get_filename(dataset, params).await;
        }

        let key = self.key(dataset, params)?;
        if params.dir_only {
            return self.cache.create_dir(&key).await;
        }
        if !self.exists(dataset, params).await? {
            return Err(self.not_found(dataset, &key));
        }
        self.cache.stage_in(&key, self.remote.as_ref()).await
    }

    async fn update_from_file(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        file_name: &Path,
        create: bool,
    ) -> Result<()> {
        if params.base_dir.is_some() {
            return self
                .scratch
                .update_from_file(dataset, params, file_name, create)
                .await;
        }

        if create {
            self.create(dataset, params).await?;
        }
        let key = self.key(dataset, params)?;
        if !self.exists(dataset, params).await? {
            return Err(self.not_found(dataset, &key));
        }

        let data = fs::read(file_name)
            .await
            .map_err(|e| ObjectStoreError::io(file_name, e))?;
        self.cache
            .stage_out(&key, &data, self.remote.as_ref())
            .await?;

        tracing::info!(
            "Stored dataset {} from {} ({} bytes)",
            dataset.id(),
            file_name.display(),
            data.len()
        );
        Ok(())
    }

    async fn get_object_url(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<Option<String>> {
        if params.base_dir.is_some() || !self.exists(dataset, params).await? {
            return Ok(None);
        }
        let key = self.key(dataset, params)?;
        Ok(self.remote.url(&key))
    }

    async fn get_store_usage_percent(&self) -> Result<f64> {
        self.cache.usage_percent()
    }
}
