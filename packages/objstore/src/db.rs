// SQLite ledger of distributed backend assignments
use crate::dataset::{DatasetId, DatasetRef};
use crate::error::ObjectStoreError;
use crate::storage::AssignmentRecorder;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS dataset_assignments (
    dataset_id INTEGER PRIMARY KEY,
    backend_id TEXT NOT NULL,
    assigned_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Which backend each dataset was placed on.
///
/// The first assignment of a dataset wins; a later, different one is an error.
#[derive(Debug, Clone)]
pub struct AssignmentLedger {
    pool: SqlitePool,
}

impl AssignmentLedger {
    /// Open or create the ledger at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory: {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening assignment ledger {}", path.display()))?;

        Self::from_pool(pool).await
    }

    /// In-memory ledger (for testing)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory ledger URL")?;

        // one connection that never expires, or the database goes with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("connecting to in-memory ledger")?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("creating dataset_assignments table")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record that `id` lives on `backend_id`
    pub async fn record(&self, id: DatasetId, backend_id: &str) -> Result<()> {
        let key = to_key(id)?;
        sqlx::query(
            "INSERT INTO dataset_assignments (dataset_id, backend_id) VALUES (?, ?)
             ON CONFLICT(dataset_id) DO NOTHING",
        )
        .bind(key)
        .bind(backend_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording assignment of dataset {}", id))?;

        match self.lookup(id).await? {
            Some(existing) if existing == backend_id => Ok(()),
            Some(existing) => bail!(
                "dataset {} is already assigned to '{}', refusing '{}'",
                id,
                existing,
                backend_id
            ),
            None => bail!("assignment of dataset {} was not stored", id),
        }
    }

    /// Backend a dataset was assigned to, if any
    pub async fn lookup(&self, id: DatasetId) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT backend_id FROM dataset_assignments WHERE dataset_id = ?")
            .bind(to_key(id)?)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up dataset {}", id))
    }

    /// Reference carrying the recorded assignment, if there is one
    pub async fn dataset_ref(&self, id: DatasetId) -> Result<DatasetRef> {
        Ok(match self.lookup(id).await? {
            Some(backend_id) => DatasetRef::with_assignment(id, backend_id),
            None => DatasetRef::new(id),
        })
    }

    /// Number of datasets per backend, by backend id
    pub async fn counts_by_backend(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT backend_id, COUNT(*) FROM dataset_assignments
             GROUP BY backend_id ORDER BY backend_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("counting assignments")
    }
}

fn to_key(id: DatasetId) -> Result<i64> {
    i64::try_from(id.get()).with_context(|| format!("dataset id {} does not fit the ledger", id))
}

#[async_trait]
impl AssignmentRecorder for AssignmentLedger {
    async fn record_assignment(
        &self,
        dataset: &DatasetRef,
        backend_id: &str,
    ) -> crate::error::Result<()> {
        self.record(dataset.id(), backend_id)
            .await
            .map_err(|e| ObjectStoreError::Persistence(format!("{:#}", e)))
    }

    async fn recorded_backend(&self, id: DatasetId) -> crate::error::Result<Option<String>> {
        self.lookup(id)
            .await
            .map_err(|e| ObjectStoreError::Persistence(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ObjectParams;
    use crate::storage::{
        BackendDescriptor, CompositeBackends, DiskObjectStore, DistributedObjectStore, ObjectStore,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_and_lookup() {
        let ledger = AssignmentLedger::in_memory().await.unwrap();
        let id = DatasetId::new(1);

        assert_eq!(ledger.lookup(id).await.unwrap(), None);
        ledger.record(id, "files1").await.unwrap();
        assert_eq!(ledger.lookup(id).await.unwrap(), Some("files1".to_string()));

        // repeating the same assignment is fine
        ledger.record(id, "files1").await.unwrap();
    }

    #[tokio::test]
    async fn test_open_path_with_url_characters() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("odd #1?mode=ro%20").join("assignments.db");

        let ledger = AssignmentLedger::open(&path).await.unwrap();
        ledger.record(DatasetId::new(4), "files1").await.unwrap();
        drop(ledger);
        assert!(path.exists());

        let reopened = AssignmentLedger::open(&path).await.unwrap();
        assert_eq!(
            reopened.recorded_backend(DatasetId::new(4)).await.unwrap(),
            Some("files1".to_string())
        );
    }

    #[tokio::test]
    async fn test_conflicting_assignment_rejected() {
        let ledger = AssignmentLedger::in_memory().await.unwrap();
        let dataset = DatasetRef::new(2);
        ledger.record_assignment(&dataset, "files1").await.unwrap();

        let err = ledger.record_assignment(&dataset, "files2").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Persistence(_)));
        assert_eq!(
            ledger.lookup(DatasetId::new(2)).await.unwrap(),
            Some("files1".to_string())
        );
    }

    #[tokio::test]
    async fn test_dataset_ref_restores_assignment() {
        let ledger = AssignmentLedger::in_memory().await.unwrap();
        ledger.record(DatasetId::new(3), "files2").await.unwrap();

        let restored = ledger.dataset_ref(DatasetId::new(3)).await.unwrap();
        assert_eq!(restored.assigned_backend_id(), Some("files2"));

        let fresh = ledger.dataset_ref(DatasetId::new(4)).await.unwrap();
        assert_eq!(fresh.assigned_backend_id(), None);
    }

    #[tokio::test]
    async fn test_counts_by_backend() {
        let ledger = AssignmentLedger::in_memory().await.unwrap();
        for (id, backend) in [(1, "files1"), (2, "files2"), (3, "files1")] {
            ledger.record(DatasetId::new(id), backend).await.unwrap();
        }

        assert_eq!(
            ledger.counts_by_backend().await.unwrap(),
            vec![("files1".to_string(), 2), ("files2".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db/assignments.db");

        {
            let ledger = AssignmentLedger::open(&path).await.unwrap();
            ledger.record(DatasetId::new(5), "files1").await.unwrap();
            ledger.pool().close().await;
        }

        let reopened = AssignmentLedger::open(&path).await.unwrap();
        assert_eq!(
            reopened.lookup(DatasetId::new(5)).await.unwrap(),
            Some("files1".to_string())
        );
    }

    #[tokio::test]
    async fn test_oversized_id_rejected() {
        let ledger = AssignmentLedger::in_memory().await.unwrap();
        assert!(ledger.record(DatasetId::new(u64::MAX), "files1").await.is_err());
    }

    #[tokio::test]
    async fn test_distributed_store_records_into_ledger() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(AssignmentLedger::in_memory().await.unwrap());
        let backends = CompositeBackends::new(vec![
            BackendDescriptor::new("files1", Arc::new(DiskObjectStore::with_root(temp.path().join("files1")))),
            BackendDescriptor::new("files2", Arc::new(DiskObjectStore::with_root(temp.path().join("files2"))))
                .order(1),
        ])
        .unwrap();
        let store = DistributedObjectStore::new(backends, ledger.clone()).with_seed(11);

        let dataset = DatasetRef::new(6);
        store.create(&dataset, &ObjectParams::new()).await.unwrap();

        let recorded = ledger.lookup(DatasetId::new(6)).await.unwrap();
        assert_eq!(recorded.as_deref(), dataset.assigned_backend_id());

        let restored = ledger.dataset_ref(DatasetId::new(6)).await.unwrap();
        assert!(store.exists(&restored, &ObjectParams::new()).await.unwrap());
    }
}
