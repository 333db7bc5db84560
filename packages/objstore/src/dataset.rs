// Dataset references and per-call object parameters
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Opaque numeric dataset identifier
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DatasetId(u64);

impl DatasetId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DatasetId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle passed into every store operation.
///
/// The backend assignment is write-once: the distributed store sets it on the
/// first successful `create` and nothing replaces it afterwards.
#[derive(Debug, Clone, Default)]
pub struct DatasetRef {
    id: DatasetId,
    object_store_id: OnceLock<String>,
    tags: BTreeSet<String>,
}

impl DatasetRef {
    pub fn new(id: impl Into<DatasetId>) -> Self {
        Self {
            id: id.into(),
            object_store_id: OnceLock::new(),
            tags: BTreeSet::new(),
        }
    }

    /// Reference whose assignment was recorded earlier (e.g. loaded from the ledger)
    pub fn with_assignment(id: impl Into<DatasetId>, backend_id: impl Into<String>) -> Self {
        let dataset = Self::new(id);
        let _ = dataset.object_store_id.set(backend_id.into());
        dataset
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn assigned_backend_id(&self) -> Option<&str> {
        self.object_store_id.get().map(String::as_str)
    }

    /// Set the backend assignment. Returns false if one was already present.
    pub(crate) fn assign(&self, backend_id: &str) -> bool {
        self.object_store_id.set(backend_id.to_string()).is_ok()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

/// Extra directory roles a backend can map to its own directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirRole {
    Temp,
    JobWork,
}

impl DirRole {
    pub const ALL: [DirRole; 2] = [DirRole::Temp, DirRole::JobWork];

    pub fn as_str(&self) -> &'static str {
        match self {
            DirRole::Temp => "temp",
            DirRole::JobWork => "job_work",
        }
    }

    /// Subdirectory of the main files path used when a backend leaves the role unset
    pub fn default_subdir(&self) -> &'static str {
        match self {
            DirRole::Temp => "tmp",
            DirRole::JobWork => "job_working_directory",
        }
    }
}

impl fmt::Display for DirRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional arguments accepted by every path-producing operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectParams {
    /// Address a role directory instead of the main files path
    pub base_dir: Option<DirRole>,
    /// Subdirectory relative to the dataset's hashed directory
    pub extra_dir: Option<String>,
    /// Put `extra_dir` above the hashed directories instead of below
    pub extra_dir_at_root: bool,
    /// File name to use instead of `dataset_<id>.dat`
    pub alt_name: Option<String>,
    /// Address the directory, not a file in it
    pub dir_only: bool,
    /// Add a `<id>` directory under the hashed directories
    pub obj_dir: bool,
    /// On delete, remove the whole `extra_dir` tree
    pub entire_extra_files_dir: bool,
}

impl ObjectParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_dir(mut self, role: DirRole) -> Self {
        self.base_dir = Some(role);
        self
    }

    pub fn extra_dir(mut self, dir: impl Into<String>) -> Self {
        self.extra_dir = Some(dir.into());
        self
    }

    pub fn extra_dir_at_root(mut self) -> Self {
        self.extra_dir_at_root = true;
        self
    }

    pub fn alt_name(mut self, name: impl Into<String>) -> Self {
        self.alt_name = Some(name.into());
        self
    }

    pub fn dir_only(mut self) -> Self {
        self.dir_only = true;
        self
    }

    pub fn obj_dir(mut self) -> Self {
        self.obj_dir = true;
        self
    }

    pub fn entire_extra_files_dir(mut self) -> Self {
        self.entire_extra_files_dir = true;
        self
    }

    /// True when the call addresses the dataset's primary file
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_is_write_once() {
        let dataset = DatasetRef::new(7);
        assert_eq!(dataset.assigned_backend_id(), None);

        assert!(dataset.assign("files1"));
        assert!(!dataset.assign("files2"));
        assert_eq!(dataset.assigned_backend_id(), Some("files1"));
    }

    #[test]
    fn test_with_assignment() {
        let dataset = DatasetRef::with_assignment(3, "files2").with_tags(["name:reads"]);
        assert_eq!(dataset.id(), DatasetId::new(3));
        assert_eq!(dataset.assigned_backend_id(), Some("files2"));
        assert!(dataset.tags().contains("name:reads"));
    }

    #[test]
    fn test_dir_role_serde_names() {
        let role: DirRole = serde_json::from_str("\"job_work\"").unwrap();
        assert_eq!(role, DirRole::JobWork);
        assert_eq!(serde_json::to_string(&DirRole::Temp).unwrap(), "\"temp\"");
    }

    #[test]
    fn test_params_builder() {
        let params = ObjectParams::new()
            .base_dir(DirRole::Temp)
            .extra_dir("dataset_1_files")
            .alt_name("out.txt");
        assert_eq!(params.base_dir, Some(DirRole::Temp));
        assert!(!params.is_default());
        assert!(ObjectParams::new().is_default());
    }
}
