// Build a store tree from configuration
use super::composite::{BackendDescriptor, CompositeBackends};
use super::config::{BackendConfig, CompositeConfig};
use super::disk::DiskObjectStore;
use super::distributed::{AssignmentRecorder, DistributedObjectStore, InMemoryAssignments};
use super::hierarchical::HierarchicalObjectStore;
use super::remote::{CapabilityProvider, OfflineProvider, RemoteFamily, RemoteObjectStore};
use super::ObjectStore;
use crate::error::Result;
use std::sync::Arc;

/// Collaborators injected while building a store tree
#[derive(Clone)]
pub struct StoreContext {
    pub recorder: Arc<dyn AssignmentRecorder>,
    pub capabilities: Arc<dyn CapabilityProvider>,
    /// Seed for distributed placement; random when unset
    pub seed: Option<u64>,
}

impl StoreContext {
    pub fn new(
        recorder: Arc<dyn AssignmentRecorder>,
        capabilities: Arc<dyn CapabilityProvider>,
    ) -> Self {
        Self {
            recorder,
            capabilities,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for StoreContext {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryAssignments::new()), Arc::new(OfflineProvider))
    }
}

/// Build the store described by `config`, children first
pub fn build_object_store(
    config: &BackendConfig,
    context: &StoreContext,
) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config {
        BackendConfig::Disk(disk) => Arc::new(DiskObjectStore::new(disk)?),
        BackendConfig::S3(s3) => remote(RemoteFamily::S3(s3.clone()), context)?,
        BackendConfig::AzureBlob(azure) => {
            remote(RemoteFamily::AzureBlob(azure.clone()), context)?
        }
        BackendConfig::Cloud(cloud) => remote(RemoteFamily::Cloud(cloud.clone()), context)?,
        BackendConfig::Pithos(pithos) => remote(RemoteFamily::Pithos(pithos.clone()), context)?,
        BackendConfig::Hierarchical(composite) => Arc::new(HierarchicalObjectStore::new(
            build_backends(composite, context)?,
        )),
        BackendConfig::Distributed(composite) => {
            let store = DistributedObjectStore::new(
                build_backends(composite, context)?,
                Arc::clone(&context.recorder),
            )
            .with_global_max_percent_full(composite.global_max_percent_full);
            match context.seed {
                Some(seed) => Arc::new(store.with_seed(seed)),
                None => Arc::new(store),
            }
        }
    };

    tracing::debug!("Built {} object store", config.type_name());
    Ok(store)
}

fn remote(family: RemoteFamily, context: &StoreContext) -> Result<Arc<dyn ObjectStore>> {
    let capability = context.capabilities.connect(&family)?;
    Ok(Arc::new(RemoteObjectStore::new(family, capability)?))
}

fn build_backends(config: &CompositeConfig, context: &StoreContext) -> Result<CompositeBackends> {
    let mut descriptors = Vec::with_capacity(config.backends.len());
    for (position, entry) in config.backends.iter().enumerate() {
        let store = build_object_store(&entry.backend, context)?;
        descriptors.push(BackendDescriptor {
            id: entry.id.clone(),
            weight: entry.weight,
            order: entry.order.unwrap_or(position as i64),
            max_percent_full: entry.max_percent_full,
            store,
        });
    }
    CompositeBackends::new(descriptors)
}
