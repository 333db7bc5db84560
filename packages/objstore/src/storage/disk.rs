// Local filesystem object store
use super::config::{extra_dir_pairs, DiskConfig};
use super::ObjectStore;
use crate::dataset::{DatasetRef, DirRole, ObjectParams};
use crate::error::{ObjectStoreError, Result};
use crate::path::PathResolver;
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Local filesystem object store
///
/// Stores datasets under the main files path in hashed directories:
/// `files_dir/{hash dirs}/dataset_{id}.dat`
pub struct DiskObjectStore {
    resolver: PathResolver,
}

impl DiskObjectStore {
    /// Create a store from its configuration; `files_dir` is required
    pub fn new(config: &DiskConfig) -> Result<Self> {
        let files_dir = config.files_dir.as_ref().ok_or_else(|| {
            ObjectStoreError::Configuration("disk backend requires files_dir".to_string())
        })?;

        Ok(Self::from_resolver(PathResolver::new(
            files_dir,
            extra_dir_pairs(&config.extra_dirs),
        )))
    }

    /// Create a store rooted at one directory: `files/`, `tmp/` and
    /// `job_working_directory/` underneath it
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self::from_resolver(PathResolver::new(
            root.join("files"),
            DirRole::ALL
                .into_iter()
                .map(|role| (role, root.join(role.default_subdir()))),
        ))
    }

    pub fn from_resolver(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Get the main files directory
    pub fn files_dir(&self) -> &Path {
        self.resolver.files_dir()
    }

    /// Initialize storage directories
    ///
    /// Creates the main files path and every role directory if missing
    pub async fn initialize(&self) -> Result<()> {
        create_dir_all(self.files_dir()).await?;
        for dir in self.resolver.extra_dirs().values() {
            create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Remove the dataset's `<id>` directories under every role
    async fn remove_role_dirs(&self, dataset: &DatasetRef) -> Result<bool> {
        let mut removed = false;
        for role in DirRole::ALL {
            let params = ObjectParams::new().base_dir(role).obj_dir().dir_only();
            let dir = self.resolver.resolve(dataset, &params)?;
            removed |= remove_tree(&dir).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    fn backend_type(&self) -> &'static str {
        "disk"
    }

    async fn exists(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        let path = self.resolver.resolve(dataset, params)?;
        Ok(fs::metadata(&path).await.is_ok())
    }

    async fn file_ready(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        self.exists(dataset, params).await
    }

    async fn create(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<()> {
        let path = self.resolver.resolve(dataset, params)?;

        if params.dir_only {
            return create_dir_all(&path).await;
        }

        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        // no truncate: creating an existing dataset must keep its bytes
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| ObjectStoreError::io(&path, e))?;

        tracing::debug!("Created dataset {} at {}", dataset.id(), path.display());
        Ok(())
    }

    async fn empty(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        let path = self.resolver.resolve(dataset, params)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len() == 0),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ObjectStoreError::NotFound(
                format!("dataset {} at {}", dataset.id(), path.display()),
            )),
            Err(e) => Err(ObjectStoreError::io(&path, e)),
        }
    }

    async fn size(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<u64> {
        let path = self.resolver.resolve(dataset, params)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!("Could not stat {}: {}", path.display(), e);
                }
                Ok(0)
            }
        }
    }

    async fn delete(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        let path = self.resolver.resolve(dataset, params)?;

        if params.entire_extra_files_dir && params.extra_dir.is_some() {
            let dir = self.resolver.object_dir(dataset, params)?;
            return remove_tree(&dir).await;
        }

        // whole trees only for a dataset's own role directory
        if params.dir_only {
            return if params.base_dir.is_some() && params.obj_dir {
                remove_tree(&path).await
            } else {
                remove_empty_dir(&path).await
            };
        }

        let mut removed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(ObjectStoreError::io(&path, e)),
        };

        if params.is_default() {
            removed |= self.remove_role_dirs(dataset).await?;
        }

        if removed {
            tracing::info!("Deleted dataset {}: {}", dataset.id(), path.display());
        }
        Ok(removed)
    }

    async fn get_data(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        start: u64,
        count: Option<u64>,
    ) -> Result<Vec<u8>> {
        let path = self.resolver.resolve(dataset, params)?;
        read_range(&path, start, count).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(format!("dataset {} at {}", dataset.id(), path.display()))
            } else {
                ObjectStoreError::io(&path, e)
            }
        })
    }

    async fn get_filename(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        let path = self.resolver.resolve(dataset, params)?;
        if fs::metadata(&path).await.is_err() {
            return Err(ObjectStoreError::NotFound(format!(
                "dataset {} at {}",
                dataset.id(),
                path.display()
            )));
        }
        Ok(path)
    }

    async fn update_from_file(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        file_name: &Path,
        create: bool,
    ) -> Result<()> {
        if create {
            self.create(dataset, params).await?;
        }

        let path = self.get_filename(dataset, params).await?;
        if same_file(file_name, &path).await {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        let copied = fs::copy(file_name, &path)
            .await
            .map_err(|e| ObjectStoreError::io(file_name, e))?;

        tracing::info!(
            "Stored dataset {} from {} ({} bytes)",
            dataset.id(),
            file_name.display(),
            copied
        );
        Ok(())
    }

    async fn get_object_url(
        &self,
        _dataset: &DatasetRef,
        _params: &ObjectParams,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn get_store_usage_percent(&self) -> Result<f64> {
        filesystem_usage_percent(self.files_dir())
    }
}

/// Read `count` bytes from `start` (to the end when `count` is `None`)
pub(crate) async fn read_range(
    path: &Path,
    start: u64,
    count: Option<u64>,
) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut data = Vec::new();
    match count {
        Some(count) => {
            file.take(count).read_to_end(&mut data).await?;
        }
        None => {
            file.read_to_end(&mut data).await?;
        }
    }
    Ok(data)
}

/// Used share of the filesystem holding `path`, in percent
pub(crate) fn filesystem_usage_percent(path: &Path) -> Result<f64> {
    // statvfs needs an existing path; walk up to the nearest one
    let existing = path
        .ancestors()
        .find(|dir| dir.exists())
        .unwrap_or_else(|| Path::new("."));

    let total = fs2::total_space(existing).map_err(|e| ObjectStoreError::io(existing, e))?;
    let available = fs2::available_space(existing).map_err(|e| ObjectStoreError::io(existing, e))?;
    if total == 0 {
        return Ok(0.0);
    }

    let used = total.saturating_sub(available);
    Ok((used as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

pub(crate) async fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| ObjectStoreError::io(path, e))
}

/// Remove a directory tree; false if it was not there
pub(crate) async fn remove_tree(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ObjectStoreError::io(path, e)),
    }
}

/// Remove a directory only if it is empty; false if absent or still in use
async fn remove_empty_dir(path: &Path) -> Result<bool> {
    match fs::remove_dir(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) if fs::read_dir(path).await.is_ok() => {
            tracing::warn!("Not deleting non-empty directory {}: {}", path.display(), e);
            Ok(false)
        }
        Err(e) => Err(ObjectStoreError::io(path, e)),
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
