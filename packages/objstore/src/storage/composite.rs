// Backend lists shared by the hierarchical and distributed stores
use super::ObjectStore;
use crate::dataset::{DatasetRef, ObjectParams};
use crate::error::{ObjectStoreError, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// One child backend of a composite store
#[derive(Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub weight: u32,
    pub order: i64,
    /// Fill limit in percent; `None` leaves the backend always eligible
    pub max_percent_full: Option<f64>,
    pub store: Arc<dyn ObjectStore>,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            id: id.into(),
            weight: 1,
            order: 0,
            max_percent_full: None,
            store,
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn max_percent_full(mut self, percent: f64) -> Self {
        self.max_percent_full = Some(percent);
        self
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("order", &self.order)
            .field("max_percent_full", &self.max_percent_full)
            .field("type", &self.store.backend_type())
            .finish()
    }
}

/// Validated descriptor list, kept sorted by ascending `order`.
///
/// Equal orders keep their configured position.
#[derive(Debug, Clone)]
pub struct CompositeBackends {
    descriptors: Vec<BackendDescriptor>,
}

impl CompositeBackends {
    pub fn new(mut descriptors: Vec<BackendDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(ObjectStoreError::Configuration(
                "a composite store needs at least one backend".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.id.as_str()) {
                return Err(ObjectStoreError::Configuration(format!(
                    "duplicate backend id '{}'",
                    descriptor.id
                )));
            }
            if descriptor.weight == 0 {
                return Err(ObjectStoreError::Configuration(format!(
                    "backend '{}' must have a positive weight",
                    descriptor.id
                )));
            }
        }

        descriptors.sort_by_key(|descriptor| descriptor.order);
        Ok(Self { descriptors })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.id == id)
    }

    pub fn in_order(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.descriptors.iter()
    }

    /// Descriptors by descending weight, ties in order
    pub fn by_weight(&self) -> Vec<&BackendDescriptor> {
        let mut ranked: Vec<&BackendDescriptor> = self.descriptors.iter().collect();
        ranked.sort_by(|a, b| b.weight.cmp(&a.weight));
        ranked
    }

    /// Lowest-order backend
    pub fn first(&self) -> &BackendDescriptor {
        // never empty after construction
        &self.descriptors[0]
    }

    /// First backend, in order, where the dataset exists
    pub async fn find_holder(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<Option<&BackendDescriptor>> {
        for descriptor in &self.descriptors {
            if descriptor.store.exists(dataset, params).await? {
                tracing::debug!(
                    "Dataset {} found in backend '{}'",
                    dataset.id(),
                    descriptor.id
                );
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }
}
