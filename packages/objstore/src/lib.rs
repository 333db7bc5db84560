//! Dataset object store: disk, remote and composite backends behind one
//! async contract.

pub mod dataset;
pub mod db;
pub mod error;
pub mod path;
pub mod storage;

pub use dataset::{DatasetId, DatasetRef, DirRole, ObjectParams};
pub use db::AssignmentLedger;
pub use error::{ObjectStoreError, Result};
pub use storage::{build_object_store, AppConfig, BackendConfig, ObjectStore, StoreContext};
