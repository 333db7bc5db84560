// In-process buckets standing in for remote services
use super::remote::{CapabilityProvider, RemoteCapability, RemoteFamily};
use crate::error::Result;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A bucket held in memory.
///
/// Counts `get` calls and can be switched into a failing mode, which makes
/// it useful for exercising cache and error paths.
pub struct MemoryBucket {
    name: String,
    objects: DashMap<String, Vec<u8>>,
    gets: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            gets: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store bytes directly, bypassing failure injection
    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects.insert(key.to_string(), data.to_vec());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|data| data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of `get` calls served so far
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("bucket '{}' unavailable during {}", self.name, operation);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCapability for MemoryBucket {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.check("put")?;
        self.insert(key, data);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.check("get")?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.object(key)
            .ok_or_else(|| anyhow!("no such key '{}' in bucket '{}'", key, self.name))
    }

    async fn head(&self, key: &str) -> anyhow::Result<Option<u64>> {
        self.check("head")?;
        Ok(self.objects.get(key).map(|data| data.len() as u64))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check("delete")?;
        self.objects.remove(key);
        Ok(())
    }

    fn url(&self, key: &str) -> Option<String> {
        Some(format!("memory://{}/{}", self.name, key))
    }
}

/// Provider handing out one shared [`MemoryBucket`] per container name
#[derive(Default)]
pub struct MemoryBuckets {
    buckets: DashMap<String, Arc<MemoryBucket>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, name: &str) -> Arc<MemoryBucket> {
        Arc::clone(
            &self
                .buckets
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryBucket::new(name))),
        )
    }
}

impl CapabilityProvider for MemoryBuckets {
    fn connect(&self, family: &RemoteFamily) -> Result<Arc<dyn RemoteCapability>> {
        tracing::debug!(
            "Connecting {} backend to memory bucket '{}'",
            family.name(),
            family.container()
        );
        let bucket: Arc<dyn RemoteCapability> = self.bucket(family.container());
        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_operations() {
        let bucket = MemoryBucket::new("galaxy");
        bucket.put("000/dataset_1.dat", b"abc").await.unwrap();

        assert_eq!(bucket.head("000/dataset_1.dat").await.unwrap(), Some(3));
        assert_eq!(bucket.get("000/dataset_1.dat").await.unwrap(), b"abc");
        assert_eq!(bucket.get_count(), 1);
        assert_eq!(
            bucket.url("000/dataset_1.dat").unwrap(),
            "memory://galaxy/000/dataset_1.dat"
        );

        bucket.delete("000/dataset_1.dat").await.unwrap();
        assert_eq!(bucket.head("000/dataset_1.dat").await.unwrap(), None);
        assert!(bucket.get("000/dataset_1.dat").await.is_err());
    }

    #[tokio::test]
    async fn test_failing_bucket() {
        let bucket = MemoryBucket::new("galaxy");
        bucket.insert("k", b"v");
        bucket.set_failing(true);

        assert!(bucket.get("k").await.is_err());
        assert!(bucket.put("k", b"w").await.is_err());
        assert_eq!(bucket.object("k").unwrap(), b"v");

        bucket.set_failing(false);
        assert_eq!(bucket.get("k").await.unwrap(), b"v");
    }

    #[test]
    fn test_buckets_shared_by_name() {
        let buckets = MemoryBuckets::new();
        buckets.bucket("a").insert("k", b"v");

        assert_eq!(buckets.bucket("a").object("k").unwrap(), b"v");
        assert!(buckets.bucket("b").object("k").is_none());
    }
}
