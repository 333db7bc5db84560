// Staging cache for remote backends
use super::disk::{create_dir_all, filesystem_usage_percent, read_range, remove_tree};
use super::remote::RemoteCapability;
use crate::error::{ObjectStoreError, Result};
use crate::path::contained_join;
use dashmap::DashMap;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;

const PARTIAL_SUFFIX: &str = ".partial";

/// One staged object
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub last_access: SystemTime,
    access_tick: u64,
    inserted: u64,
}

#[derive(Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    used_bytes: u64,
    clock: u64,
    next_insert: u64,
}

impl CacheIndex {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &str) -> Option<CacheEntry> {
        let tick = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.access_tick = tick;
        entry.last_access = SystemTime::now();
        Some(entry.clone())
    }

    fn insert(&mut self, key: &str, local_path: PathBuf, size_bytes: u64) -> CacheEntry {
        let tick = self.tick();
        let inserted = match self.entries.get(key) {
            Some(previous) => previous.inserted,
            None => {
                self.next_insert += 1;
                self.next_insert
            }
        };

        let entry = CacheEntry {
            key: key.to_string(),
            local_path,
            size_bytes,
            last_access: SystemTime::now(),
            access_tick: tick,
            inserted,
        };
        if let Some(previous) = self.entries.insert(key.to_string(), entry.clone()) {
            self.used_bytes -= previous.size_bytes;
        }
        self.used_bytes += size_bytes;
        entry
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.used_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Remove only if nobody touched the entry since `access_tick`
    fn remove_if_idle(&mut self, key: &str, access_tick: u64) -> Option<CacheEntry> {
        match self.entries.get(key) {
            Some(entry) if entry.access_tick == access_tick => self.remove(key),
            _ => None,
        }
    }

    /// Least recently accessed first, ties by insertion order
    fn eviction_order(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| (entry.access_tick, entry.inserted));
        entries
    }
}

type KeyLocks = DashMap<String, Arc<RwLock<()>>>;

/// A held per-key lock. The key's map slot goes away with the last holder.
struct KeyGuard<'a, G> {
    locks: &'a KeyLocks,
    key: &'a str,
    guard: Option<G>,
}

impl<G> Drop for KeyGuard<'_, G> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Bounded local copy of remote objects.
///
/// Keys are remote object keys; each maps to `root/<key>`. A per-key lock is
/// held while an entry is staged, rewritten or read, and eviction skips any
/// entry whose lock is taken.
pub struct StagingCache {
    root: PathBuf,
    budget_bytes: Option<u64>,
    index: Mutex<CacheIndex>,
    locks: KeyLocks,
}

impl StagingCache {
    /// `budget_bytes = None` means unbounded
    pub fn new(root: impl Into<PathBuf>, budget_bytes: Option<u64>) -> Self {
        Self {
            root: root.into(),
            budget_bytes,
            index: Mutex::new(CacheIndex::default()),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget_bytes(&self) -> Option<u64> {
        self.budget_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.index().used_bytes
    }

    /// Entries in eviction order
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index().eviction_order()
    }

    /// `used / budget` in percent; filesystem usage when unbounded
    pub fn usage_percent(&self) -> Result<f64> {
        match self.budget_bytes {
            Some(0) => Ok(100.0),
            Some(budget) => Ok((self.used_bytes() as f64 / budget as f64 * 100.0).clamp(0.0, 100.0)),
            None => filesystem_usage_percent(&self.root),
        }
    }

    /// Local path of a key, confined to the cache root
    pub fn local_path(&self, key: &str) -> Result<PathBuf> {
        contained_join(&self.root, key)
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key_lock(&self, key: &str) -> Arc<RwLock<()>> {
        Arc::clone(
            &self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    fn hold<'a, G>(&'a self, key: &'a str, guard: G) -> KeyGuard<'a, G> {
        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    async fn write_key<'a>(&'a self, key: &'a str) -> KeyGuard<'a, OwnedRwLockWriteGuard<()>> {
        let guard = self.key_lock(key).write_owned().await;
        self.hold(key, guard)
    }

    async fn read_key<'a>(&'a self, key: &'a str) -> KeyGuard<'a, OwnedRwLockReadGuard<()>> {
        let guard = self.key_lock(key).read_owned().await;
        self.hold(key, guard)
    }

    fn try_write_key<'a>(&'a self, key: &'a str) -> Option<KeyGuard<'a, OwnedRwLockWriteGuard<()>>> {
        let guard = self.key_lock(key).try_write_owned().ok()?;
        Some(self.hold(key, guard))
    }

    /// Find an intact cached copy, adopting files a previous process left behind
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.local_path(key)?;
        let indexed = self.index().touch(key);

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => match indexed {
                Some(entry) if entry.size_bytes == meta.len() => Ok(Some(entry)),
                _ => Ok(Some(self.index().insert(key, path, meta.len()))),
            },
            _ => {
                if indexed.is_some() {
                    self.index().remove(key);
                }
                Ok(None)
            }
        }
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key).await?.is_some())
    }

    pub async fn cached_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.lookup(key).await?.map(|entry| entry.size_bytes))
    }

    /// Return the cached copy of `key`, fetching it from `remote` if missing
    pub async fn stage_in(&self, key: &str, remote: &dyn RemoteCapability) -> Result<PathBuf> {
        let _guard = self.write_key(key).await;

        if let Some(entry) = self.lookup(key).await? {
            tracing::debug!("Staging cache hit: {}", key);
            return Ok(entry.local_path);
        }

        let data = remote
            .get(key)
            .await
            .map_err(|e| ObjectStoreError::capability("get", key, e))?;
        let entry = self.write_entry(key, &data).await?;
        tracing::debug!("Staged in {} ({} bytes)", key, entry.size_bytes);

        // still holding this key's lock, so eviction cannot pick it
        self.evict_to_budget().await?;
        Ok(entry.local_path)
    }

    /// Upload `data` to `remote`, then refresh the cached copy
    pub async fn stage_out(
        &self,
        key: &str,
        data: &[u8],
        remote: &dyn RemoteCapability,
    ) -> Result<PathBuf> {
        self.local_path(key)?;
        let _guard = self.write_key(key).await;

        remote
            .put(key, data)
            .await
            .map_err(|e| ObjectStoreError::capability("put", key, e))?;
        let entry = self.write_entry(key, data).await?;
        tracing::info!("Staged out {} ({} bytes)", key, entry.size_bytes);

        self.evict_to_budget().await?;
        Ok(entry.local_path)
    }

    /// Read a byte range of `key`, staging it in first if needed
    pub async fn read_range(
        &self,
        key: &str,
        start: u64,
        count: Option<u64>,
        remote: &dyn RemoteCapability,
    ) -> Result<Vec<u8>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let path = self.stage_in(key, remote).await?;

            let _guard = self.read_key(key).await;
            self.index().touch(key);
            match read_range(&path, start, count).await {
                Ok(data) => return Ok(data),
                // evicted between staging and reading
                Err(e) if e.kind() == ErrorKind::NotFound && attempts < 2 => continue,
                Err(e) => return Err(ObjectStoreError::io(&path, e)),
            }
        }
    }

    async fn write_entry(&self, key: &str, data: &[u8]) -> Result<CacheEntry> {
        let path = self.local_path(key)?;
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        fs::write(&partial, data)
            .await
            .map_err(|e| ObjectStoreError::io(&partial, e))?;
        fs::rename(&partial, &path)
            .await
            .map_err(|e| ObjectStoreError::io(&path, e))?;

        Ok(self.index().insert(key, path, data.len() as u64))
    }

    /// Create the local directory for a directory key
    pub async fn create_dir(&self, key: &str) -> Result<PathBuf> {
        let path = self.local_path(key)?;
        create_dir_all(&path).await?;
        Ok(path)
    }

    pub async fn dir_exists(&self, key: &str) -> Result<bool> {
        let path = self.local_path(key)?;
        Ok(fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    /// Drop the cached copy of `key`; false if there was none
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.write_key(key).await;

        let indexed = self.index().remove(key).is_some();
        let path = self.local_path(key)?;
        let on_disk = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(ObjectStoreError::io(&path, e)),
        };
        Ok(indexed || on_disk)
    }

    /// Drop every cached key under a directory key
    pub async fn remove_dir(&self, dir_key: &str) -> Result<bool> {
        let keys: Vec<String> = self
            .index()
            .entries
            .keys()
            .filter(|key| key.starts_with(dir_key))
            .cloned()
            .collect();

        for key in &keys {
            let _guard = self.write_key(key).await;
            self.index().remove(key);
        }

        let path = self.local_path(dir_key)?;
        Ok(remove_tree(&path).await? || !keys.is_empty())
    }

    /// Evict least recently used entries until usage fits the budget.
    ///
    /// Returns the number of bytes freed.
    pub async fn evict_to_budget(&self) -> Result<u64> {
        let Some(budget) = self.budget_bytes else {
            return Ok(0);
        };

        let candidates = {
            let index = self.index();
            if index.used_bytes <= budget {
                return Ok(0);
            }
            index.eviction_order()
        };

        let mut freed = 0;
        for candidate in candidates {
            if self.index().used_bytes <= budget {
                break;
            }

            let Some(_guard) = self.try_write_key(&candidate.key) else {
                tracing::debug!("Skipping in-use cache entry {}", candidate.key);
                continue;
            };

            let removed = self
                .index()
                .remove_if_idle(&candidate.key, candidate.access_tick);
            let Some(entry) = removed else {
                continue;
            };

            match fs::remove_file(&entry.local_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "Failed to remove evicted file {}: {}",
                    entry.local_path.display(),
                    e
                ),
            }
            freed += entry.size_bytes;
            tracing::info!(
                "Evicted {} from staging cache ({} bytes)",
                entry.key,
                entry.size_bytes
            );
        }

        Ok(freed)
    }

    /// Re-index the cache root from disk.
    ///
    /// Keys that are locked, or were touched after the walk started, keep
    /// their index entry as is.
    pub async fn rescan(&self) -> Result<()> {
        let scan_started = self.index().clock;
        let mut found: HashMap<String, (PathBuf, u64)> = HashMap::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(ObjectStoreError::io(&dir, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ObjectStoreError::io(&dir, e))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| ObjectStoreError::io(&path, e))?;
                if meta.is_dir() {
                    pending.push(path);
                } else if !path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                    if let Some(key) = self.key_for(&path) {
                        found.insert(key, (path, meta.len()));
                    }
                }
            }
        }

        let mut index = self.index();
        let in_flight = |index: &CacheIndex, key: &str| {
            self.locks.contains_key(key)
                || index
                    .entries
                    .get(key)
                    .is_some_and(|entry| entry.access_tick > scan_started)
        };
        let stale: Vec<String> = index
            .entries
            .keys()
            .filter(|key| !found.contains_key(*key) && !in_flight(&index, key))
            .cloned()
            .collect();
        for key in stale {
            index.remove(&key);
        }
        for (key, (path, size)) in found {
            if in_flight(&index, &key) {
                continue;
            }
            let unchanged = index
                .entries
                .get(&key)
                .is_some_and(|entry| entry.size_bytes == size);
            if !unchanged {
                index.insert(&key, path, size);
            }
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// Periodically rescan and evict, like a cache monitor thread
    pub fn spawn_monitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.rescan().await {
                    tracing::warn!("Staging cache rescan failed: {}", e);
                    continue;
                }
                match cache.evict_to_budget().await {
                    Ok(0) => {}
                    Ok(freed) => tracing::info!("Cache monitor freed {} bytes", freed),
                    Err(e) => tracing::warn!("Cache eviction failed: {}", e),
                }
            }
        })
    }
}
