// Object store trait and backend implementations
use crate::dataset::{DatasetRef, ObjectParams};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub mod builder;
pub mod cache;
pub mod composite;
pub mod config;
pub mod disk;
pub mod distributed;
pub mod hierarchical;
pub mod memory;
pub mod remote;

pub use builder::{build_object_store, StoreContext};
pub use cache::StagingCache;
pub use composite::{BackendDescriptor, CompositeBackends};
pub use config::{AppConfig, BackendConfig};
pub use disk::DiskObjectStore;
pub use distributed::{AssignmentRecorder, DistributedObjectStore, InMemoryAssignments};
pub use hierarchical::HierarchicalObjectStore;
pub use memory::{MemoryBucket, MemoryBuckets};
pub use remote::{CapabilityProvider, RemoteCapability, RemoteFamily, RemoteObjectStore};

/// Operations every backend supports, leaf or composite.
///
/// Absence is not an error for `exists`, `file_ready`, `size`, `delete` and
/// `get_object_url`. Operations that need content fail with `NotFound`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend type name (`disk`, `s3`, `hierarchical`, ...)
    fn backend_type(&self) -> &'static str;

    /// Check if bytes are currently retrievable for the dataset
    async fn exists(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool>;

    /// Check if the local copy is complete and safe to read
    async fn file_ready(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool>;

    /// Make sure the storage location exists; no-op if it already does
    async fn create(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<()>;

    /// True if the dataset exists and has zero length
    async fn empty(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool>;

    /// Byte length, 0 for both absent and empty datasets
    async fn size(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<u64>;

    /// Remove persisted bytes; false when there was nothing to remove
    async fn delete(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool>;

    /// Read `count` bytes from `start`, or to the end when `count` is `None`
    async fn get_data(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        start: u64,
        count: Option<u64>,
    ) -> Result<Vec<u8>>;

    /// Local path for direct reads, staged from remote storage if needed
    async fn get_filename(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf>;

    /// Copy `file_name` into the dataset's location, creating it first if asked
    async fn update_from_file(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
        file_name: &Path,
        create: bool,
    ) -> Result<()>;

    /// URL the object can be fetched from directly, if the backend has one
    async fn get_object_url(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<Option<String>>;

    /// Fraction of configured capacity in use, in [0, 100]
    async fn get_store_usage_percent(&self) -> Result<f64>;
}
