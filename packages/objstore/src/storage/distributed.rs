// Weighted random placement across several backends
use super::composite::{BackendDescriptor, CompositeBackends};
use super::ObjectStore;
use crate::dataset::{DatasetId, DatasetRef, ObjectParams};
use crate::error::{ObjectStoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Durable record of which backend holds a dataset.
///
/// `record_assignment` is called once per assignment, before the dataset
/// reference is updated; an error fails the `create` that triggered it. The
/// first assignment of an id wins and a different later one is an error.
#[async_trait]
pub trait AssignmentRecorder: Send + Sync {
    async fn record_assignment(&self, dataset: &DatasetRef, backend_id: &str) -> Result<()>;

    /// Backend recorded for `id`, if any
    async fn recorded_backend(&self, id: DatasetId) -> Result<Option<String>>;
}

/// Recorder keeping assignments in memory
#[derive(Default)]
pub struct InMemoryAssignments {
    records: Mutex<Vec<(DatasetId, String)>>,
    failing: AtomicBool,
}

impl InMemoryAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded assignment, in call order
    pub fn records(&self) -> Vec<(DatasetId, String)> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count_for(&self, backend_id: &str) -> usize {
        self.lock().iter().filter(|(_, id)| id == backend_id).count()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(DatasetId, String)>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AssignmentRecorder for InMemoryAssignments {
    async fn record_assignment(&self, dataset: &DatasetRef, backend_id: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Persistence(format!(
                "recorder rejected dataset {}",
                dataset.id()
            )));
        }
        let mut records = self.lock();
        match records.iter().find(|(id, _)| *id == dataset.id()) {
            Some((_, existing)) if existing == backend_id => Ok(()),
            Some((_, existing)) => Err(ObjectStoreError::Persistence(format!(
                "dataset {} is already assigned to '{}'",
                dataset.id(),
                existing
            ))),
            None => {
                records.push((dataset.id(), backend_id.to_string()));
                Ok(())
            }
        }
    }

    async fn recorded_backend(&self, id: DatasetId) -> Result<Option<String>> {
        Ok(self
            .lock()
            .iter()
            .find(|(recorded, _)| *recorded == id)
            .map(|(_, backend_id)| backend_id.clone()))
    }
}

/// Pick one descriptor with probability `weight / sum(weights)`.
///
/// One uniform draw over the summed weights, located with a binary search on
/// the cumulative totals.
fn pick_weighted<'a>(
    candidates: &[&'a BackendDescriptor],
    rng: &mut StdRng,
) -> Option<&'a BackendDescriptor> {
    let mut cumulative = Vec::with_capacity(candidates.len());
    let mut total = 0u64;
    for descriptor in candidates {
        total += u64::from(descriptor.weight);
        cumulative.push(total);
    }
    if total == 0 {
        return None;
    }

    let draw = rng.random_range(0..total);
    let index = cumulative.partition_point(|&bound| bound <= draw);
    candidates.get(index).copied()
}

/// Places each new dataset on a randomly drawn backend and keeps it there.
///
/// The draw is weighted by the configured backend weights and skips backends
/// above their fill limit. Later operations go straight to the assigned
/// backend; datasets without an assignment are searched for in order.
pub struct DistributedObjectStore {
    backends: CompositeBackends,
    global_max_percent_full: Option<f64>,
    recorder: Arc<dyn AssignmentRecorder>,
    rng: Mutex<StdRng>,
    /// Held while an id is being assigned; dropped once nobody waits on it
    create_locks: DashMap<DatasetId, Arc<tokio::sync::Mutex<()>>>,
}

impl DistributedObjectStore {
    pub fn new(backends: CompositeBackends, recorder: Arc<dyn AssignmentRecorder>) -> Self {
        tracing::info!(
            "Distributed store over {} backends: {}",
            backends.len(),
            backends
                .by_weight()
                .iter()
                .map(|d| format!("{}={}", d.id, d.weight))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            backends,
            global_max_percent_full: None,
            recorder,
            rng: Mutex::new(StdRng::from_os_rng()),
            create_locks: DashMap::new(),
        }
    }

    /// Fill limit for backends without their own `max_percent_full`
    pub fn with_global_max_percent_full(mut self, percent: Option<f64>) -> Self {
        self.global_max_percent_full = percent;
        self
    }

    /// Make placement reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn backends(&self) -> &CompositeBackends {
        &self.backends
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_lock(&self, id: DatasetId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            &self
                .create_locks
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn assigned_descriptor(&self, dataset: &DatasetRef, backend_id: &str) -> Result<&BackendDescriptor> {
        self.backends
            .get(backend_id)
            .ok_or_else(|| ObjectStoreError::UnknownBackend {
                dataset: dataset.id(),
                backend_id: backend_id.to_string(),
            })
    }

    /// Backends currently below their fill limit, in order
    async fn eligible(&self) -> Vec<&BackendDescriptor> {
        let mut eligible = Vec::new();
        for descriptor in self.backends.in_order() {
            let Some(limit) = descriptor.max_percent_full.or(self.global_max_percent_full) else {
                eligible.push(descriptor);
                continue;
            };

            match descriptor.store.get_store_usage_percent().await {
                Ok(usage) if usage > limit => {
                    tracing::debug!(
                        "Backend '{}' is {:.1}% full, above its {:.1}% limit",
                        descriptor.id,
                        usage,
                        limit
                    );
                }
                Ok(_) => eligible.push(descriptor),
                Err(e) => {
                    tracing::warn!("Could not read usage of backend '{}': {}", descriptor.id, e);
                }
            }
        }
        eligible
    }

    /// Assign an unassigned dataset, one caller per id at a time
    async fn assign(&self, dataset: &DatasetRef) -> Result<&BackendDescriptor> {
        let lock = self.create_lock(dataset.id());
        let assigned = {
            let _guard = lock.lock().await;
            self.draw(dataset).await
        };
        drop(lock);
        self.create_locks
            .remove_if(&dataset.id(), |_, lock| Arc::strong_count(lock) == 1);
        assigned
    }

    /// Draw, record and apply a backend assignment
    async fn draw(&self, dataset: &DatasetRef) -> Result<&BackendDescriptor> {
        // another reference with this id may have been assigned meanwhile
        if let Some(backend_id) = self.recorder.recorded_backend(dataset.id()).await? {
            dataset.assign(&backend_id);
            return self.assigned_descriptor(dataset, &backend_id);
        }

        let eligible = self.eligible().await;
        let chosen = {
            let mut rng = self.rng();
            pick_weighted(&eligible, &mut rng)
        }
        .ok_or(ObjectStoreError::StoreFull(dataset.id()))?;

        self.recorder.record_assignment(dataset, &chosen.id).await?;
        dataset.assign(&chosen.id);

        tracing::info!("Assigned dataset {} to backend '{}'", dataset.id(), chosen.id);
        Ok(chosen)
    }

    /// Backend for an operation other than `create`.
    ///
    /// Never changes the dataset's assignment.
    async fn route(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<Option<&BackendDescriptor>> {
        match dataset.assigned_backend_id() {
            Some(backend_id) => match self.backends.get(backend_id) {
                Some(descriptor) => return Ok(Some(descriptor)),
                None => tracing::warn!(
                    "Dataset {} is assigned to unknown backend '{}', searching all backends",
                    dataset.id(),
                    backend_id
                ),
            },
            None => tracing::warn!(
                "Dataset {} has no backend assignment, searching all backends",
                dataset.id()
            ),
        }
        self.backends.find_holder(dataset, params).await
    }

    fn not_found(dataset: &DatasetRef) -> ObjectStoreError {
        ObjectStoreError::NotFound(format!("dataset {} in any backend", dataset.id()))
    }
}

#[async_trait]
impl ObjectStore for DistributedObjectStore {
    fn backend_type(&self) -> &'static str {
        "distributed"
    }

    async fn exists(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.exists(dataset, params).await,
            None => Ok(false),
        }
    }

    async fn file_ready(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.file_ready(dataset, params).await,
            None => Ok(false),
        }
    }

    async fn create(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<()> {
        let target = match dataset.assigned_backend_id() {
            Some(backend_id) => self.assigned_descriptor(dataset, backend_id)?,
            None => self.assign(dataset).await?,
        };
        target.store.create(dataset, params).await
    }

    async fn empty(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.empty(dataset, params).await,
            None => Err(Self::not_found(dataset)),
        }
    }

    async fn size(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<u64> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.size(dataset, params).await,
            None => Ok(0),
        }
    }

    async fn delete(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<bool> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.delete(dataset, params).await,
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
        match self.route(dataset, params).await? {
            Some(target) => target.store.get_data(dataset, params, start, count).await,
            None => Err(Self::not_found(dataset)),
        }
    }

    async fn get_filename(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.get_filename(dataset, params).await,
            None => Err(Self::not_found(dataset)),
        }
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
        match self.route(dataset, params).await? {
            Some(target) => {
                target
                    .store
                    .update_from_file(dataset, params, file_name, false)
                    .await
            }
            None => Err(Self::not_found(dataset)),
        }
    }

    async fn get_object_url(
        &self,
        dataset: &DatasetRef,
        params: &ObjectParams,
    ) -> Result<Option<String>> {
        match self.route(dataset, params).await? {
            Some(target) => target.store.get_object_url(dataset, params).await,
            None => Ok(None),
        }
    }

    /// Highest usage among the backends
    async fn get_store_usage_percent(&self) -> Result<f64> {
        let mut highest: f64 = 0.0;
        for descriptor in self.backends.in_order() {
            highest = highest.max(descriptor.store.get_store_usage_percent().await?);
        }
        Ok(highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::StagingCache;
    use crate::storage::config::{
        AccessKeyAuth, BucketConfig, CacheConfig, ConnectionConfig, S3Config,
    };
    use crate::storage::disk::DiskObjectStore;
    use crate::storage::memory::MemoryBucket;
    use crate::storage::remote::{RemoteFamily, RemoteObjectStore};
    use tempfile::TempDir;

    fn disk(temp: &TempDir, name: &str) -> Arc<dyn ObjectStore> {
        Arc::new(DiskObjectStore::with_root(temp.path().join(name)))
    }

    /// Remote store whose zero-byte cache budget reports 100% usage
    fn full_remote(temp: &TempDir) -> Arc<dyn ObjectStore> {
        let family = RemoteFamily::S3(S3Config {
            auth: AccessKeyAuth {
                access_key: "a".to_string(),
                secret_key: "s".to_string(),
            },
            bucket: BucketConfig {
                name: "full".to_string(),
                use_reduced_redundancy: false,
            },
            connection: ConnectionConfig::default(),
            cache: CacheConfig {
                path: temp.path().join("full_cache"),
                size: Some(0),
            },
            extra_dirs: vec![],
        });
        Arc::new(RemoteObjectStore::new(family, Arc::new(MemoryBucket::new("full"))).unwrap())
    }

    fn create_test_store(seed: u64) -> (DistributedObjectStore, Arc<InMemoryAssignments>, TempDir) {
        let temp = TempDir::new().unwrap();
        let backends = CompositeBackends::new(vec![
            BackendDescriptor::new("files1", disk(&temp, "files1")).weight(2).order(0),
            BackendDescriptor::new("files2", disk(&temp, "files2")).weight(1).order(1),
        ])
        .unwrap();
        let recorder = Arc::new(InMemoryAssignments::new());
        let store = DistributedObjectStore::new(backends, recorder.clone()).with_seed(seed);
        (store, recorder, temp)
    }

    fn source_file(temp: &TempDir, contents: &[u8]) -> PathBuf {
        let path = temp.path().join("job_output");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_weighted_placement() {
        let (store, recorder, _temp) = create_test_store(1234);
        let params = ObjectParams::new();

        for id in 1..=100u64 {
            let dataset = DatasetRef::new(id);
            store.create(&dataset, &params).await.unwrap();
            let backend_id = dataset.assigned_backend_id().unwrap();
            let holder = store.backends().get(backend_id).unwrap();
            assert!(holder.store.exists(&dataset, &params).await.unwrap());
        }

        let files1 = recorder.count_for("files1");
        let files2 = recorder.count_for("files2");
        assert_eq!(files1 + files2, 100);
        assert!(files1 > files2, "files1={} files2={}", files1, files2);
        assert!(files2 > 0);
    }

    #[test]
    fn test_pick_weighted_distribution() {
        let temp = TempDir::new().unwrap();
        let heavy = BackendDescriptor::new("heavy", disk(&temp, "h")).weight(3);
        let light = BackendDescriptor::new("light", disk(&temp, "l")).weight(1);
        let candidates = vec![&heavy, &light];
        let mut rng = StdRng::seed_from_u64(7);

        let trials = 10_000;
        let heavy_count = (0..trials)
            .filter(|_| pick_weighted(&candidates, &mut rng).unwrap().id == "heavy")
            .count();
        let share = heavy_count as f64 / trials as f64;
        assert!((0.72..0.78).contains(&share), "heavy share {}", share);

        assert!(pick_weighted(&[], &mut rng).is_none());
    }

    #[tokio::test]
    async fn test_seed_makes_placement_reproducible() {
        let (first, _, _t1) = create_test_store(99);
        let (second, _, _t2) = create_test_store(99);
        let params = ObjectParams::new();

        for id in 1..=20u64 {
            let a = DatasetRef::new(id);
            let b = DatasetRef::new(id);
            first.create(&a, &params).await.unwrap();
            second.create(&b, &params).await.unwrap();
            assert_eq!(a.assigned_backend_id(), b.assigned_backend_id());
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (store, recorder, _temp) = create_test_store(5);
        let dataset = DatasetRef::new(11);
        let params = ObjectParams::new();

        store.create(&dataset, &params).await.unwrap();
        let assigned = dataset.assigned_backend_id().unwrap().to_string();
        store.create(&dataset, &params).await.unwrap();

        assert_eq!(dataset.assigned_backend_id().unwrap(), assigned);
        assert_eq!(recorder.len(), 1);

        // a fresh reference for the same id adopts the earlier draw
        let again = DatasetRef::new(11);
        store.create(&again, &params).await.unwrap();
        assert_eq!(again.assigned_backend_id().unwrap(), assigned);
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_draw_once() {
        let (store, recorder, _temp) = create_test_store(17);
        let refs: Vec<DatasetRef> = (0..8).map(|_| DatasetRef::new(77)).collect();
        let params = ObjectParams::new();

        let results = futures::future::join_all(refs.iter().map(|r| store.create(r, &params))).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(recorder.len(), 1);
        let assigned = refs[0].assigned_backend_id().unwrap();
        assert!(refs.iter().all(|r| r.assigned_backend_id() == Some(assigned)));
        assert!(store.create_locks.is_empty());
    }

    #[tokio::test]
    async fn test_create_locks_are_released() {
        let (store, recorder, _temp) = create_test_store(23);
        let params = ObjectParams::new();

        for id in 1..=1000u64 {
            let dataset = DatasetRef::new(id);
            store.create(&dataset, &params).await.unwrap();
            assert!(store.delete(&dataset, &params).await.unwrap());
        }

        assert!(store.create_locks.is_empty());
        assert_eq!(recorder.len(), 1000);
    }

    #[tokio::test]
    async fn test_adoption_uses_the_recorder() {
        let (store, recorder, _temp) = create_test_store(29);
        let dataset = DatasetRef::new(31);
        recorder.record_assignment(&dataset, "files2").await.unwrap();

        store.create(&dataset, &ObjectParams::new()).await.unwrap();
        assert_eq!(dataset.assigned_backend_id(), Some("files2"));
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_recorder_failure_fails_create() {
        let (store, recorder, _temp) = create_test_store(3);
        let dataset = DatasetRef::new(12);
        let params = ObjectParams::new();
        recorder.set_failing(true);

        let err = store.create(&dataset, &params).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Persistence(_)));
        assert_eq!(dataset.assigned_backend_id(), None);
        assert!(!store.exists(&dataset, &params).await.unwrap());

        recorder.set_failing(false);
        store.create(&dataset, &params).await.unwrap();
        assert!(dataset.assigned_backend_id().is_some());
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_assigned_dataset_round_trip() {
        let (store, _recorder, temp) = create_test_store(8);
        let dataset = DatasetRef::new(13);
        let params = ObjectParams::new();
        let source = source_file(&temp, b"distributed bytes");

        store.update_from_file(&dataset, &params, &source, true).await.unwrap();

        assert!(store.exists(&dataset, &params).await.unwrap());
        assert!(store.file_ready(&dataset, &params).await.unwrap());
        assert_eq!(store.size(&dataset, &params).await.unwrap(), 17);
        assert!(!store.empty(&dataset, &params).await.unwrap());
        assert_eq!(store.get_data(&dataset, &params, 0, Some(11)).await.unwrap(), b"distributed");

        let backend_id = dataset.assigned_backend_id().unwrap();
        let root = std::path::absolute(temp.path().join(backend_id)).unwrap();
        assert!(store.get_filename(&dataset, &params).await.unwrap().starts_with(root));

        assert!(store.delete(&dataset, &params).await.unwrap());
        assert!(!store.exists(&dataset, &params).await.unwrap());
    }

    #[tokio::test]
    async fn test_unassigned_dataset_is_searched() {
        let (store, _recorder, temp) = create_test_store(21);
        let legacy = DatasetRef::new(14);
        let params = ObjectParams::new();
        let files2 = store.backends().get("files2").unwrap().store.clone();
        files2
            .update_from_file(&legacy, &params, &source_file(&temp, b"legacy"), true)
            .await
            .unwrap();

        assert!(store.exists(&legacy, &params).await.unwrap());
        assert_eq!(store.get_data(&legacy, &params, 0, None).await.unwrap(), b"legacy");
        assert_eq!(legacy.assigned_backend_id(), None);

        let absent = DatasetRef::new(15);
        assert!(!store.exists(&absent, &params).await.unwrap());
        assert_eq!(store.size(&absent, &params).await.unwrap(), 0);
        assert!(store.get_filename(&absent, &params).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unknown_assignment() {
        let (store, _recorder, temp) = create_test_store(4);
        let params = ObjectParams::new();
        let ghost = DatasetRef::with_assignment(16, "ghost");

        let err = store.create(&ghost, &params).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::UnknownBackend { .. }));

        let files1 = store.backends().get("files1").unwrap().store.clone();
        files1
            .update_from_file(&ghost, &params, &source_file(&temp, b"found"), true)
            .await
            .unwrap();
        assert_eq!(store.get_data(&ghost, &params, 0, None).await.unwrap(), b"found");
        assert_eq!(ghost.assigned_backend_id(), Some("ghost"));
    }

    #[tokio::test]
    async fn test_full_backends_are_skipped() {
        let temp = TempDir::new().unwrap();
        let backends = CompositeBackends::new(vec![
            BackendDescriptor::new("full", full_remote(&temp))
                .weight(100)
                .max_percent_full(50.0),
            BackendDescriptor::new("roomy", disk(&temp, "roomy")).weight(1).order(1),
        ])
        .unwrap();
        let recorder = Arc::new(InMemoryAssignments::new());
        let store = DistributedObjectStore::new(backends, recorder.clone()).with_seed(0);

        for id in 1..=20u64 {
            store.create(&DatasetRef::new(id), &ObjectParams::new()).await.unwrap();
        }
        assert_eq!(recorder.count_for("roomy"), 20);
    }

    #[tokio::test]
    async fn test_store_full() {
        let temp = TempDir::new().unwrap();
        let backends = CompositeBackends::new(vec![BackendDescriptor::new("full", full_remote(&temp))]).unwrap();
        let recorder = Arc::new(InMemoryAssignments::new());
        let store = DistributedObjectStore::new(backends, recorder.clone())
            .with_global_max_percent_full(Some(90.0));
        let dataset = DatasetRef::new(18);

        let err = store.create(&dataset, &ObjectParams::new()).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::StoreFull(id) if id == DatasetId::new(18)));
        assert!(recorder.is_empty());
        assert_eq!(dataset.assigned_backend_id(), None);
    }

    #[tokio::test]
    async fn test_usage_is_highest_backend() {
        let temp = TempDir::new().unwrap();
        let backends = CompositeBackends::new(vec![
            BackendDescriptor::new("roomy", disk(&temp, "roomy")),
            BackendDescriptor::new("full", full_remote(&temp)).order(1),
        ])
        .unwrap();
        let store = DistributedObjectStore::new(backends, Arc::new(InMemoryAssignments::new()));

        assert_eq!(store.get_store_usage_percent().await.unwrap(), 100.0);
    }

    #[test]
    fn test_zero_budget_cache_reports_full() {
        let temp = TempDir::new().unwrap();
        let cache = StagingCache::new(temp.path().join("c"), Some(0));
        assert_eq!(cache.usage_percent().unwrap(), 100.0);
    }
}
