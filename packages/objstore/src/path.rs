// Dataset path layout and containment checks
use crate::dataset::{DatasetId, DatasetRef, DirRole, ObjectParams};
use crate::error::{ObjectStoreError, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Split a dataset id into directories so no directory holds more than a
/// thousand datasets.
///
/// Ids below 1000 share `000`. Larger ids are left-padded with zeros, the last
/// three digits are dropped and the rest is cut into three-digit directories:
/// `1234 -> 001`, `123456 -> 000/123`, `1234567 -> 001/234`.
pub fn directory_hash_id(id: DatasetId) -> Vec<String> {
    let digits = id.get().to_string();
    if digits.len() < 4 {
        return vec!["000".to_string()];
    }

    let padded = format!("{}{}", "0".repeat(3 - digits.len() % 3), digits);
    let kept = &padded[..padded.len() - 3];

    kept.as_bytes()
        .chunks(3)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// File name used when the caller gives no `alt_name`
pub fn default_file_name(id: DatasetId) -> String {
    format!("dataset_{}.dat", id)
}

/// Maps datasets and object parameters to paths under one backend's directories
#[derive(Debug, Clone)]
pub struct PathResolver {
    files_dir: PathBuf,
    extra_dirs: BTreeMap<DirRole, PathBuf>,
}

impl PathResolver {
    /// Roles missing from `extra_dirs` get a subdirectory of `files_dir`.
    pub fn new<I>(files_dir: impl Into<PathBuf>, extra_dirs: I) -> Self
    where
        I: IntoIterator<Item = (DirRole, PathBuf)>,
    {
        let files_dir = files_dir.into();
        let mut dirs: BTreeMap<DirRole, PathBuf> = extra_dirs.into_iter().collect();
        for role in DirRole::ALL {
            dirs.entry(role)
                .or_insert_with(|| files_dir.join(role.default_subdir()));
        }

        Self {
            files_dir,
            extra_dirs: dirs,
        }
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn role_dir(&self, role: DirRole) -> &Path {
        // every role is filled in by `new`
        self.extra_dirs
            .get(&role)
            .map(PathBuf::as_path)
            .unwrap_or(&self.files_dir)
    }

    pub fn extra_dirs(&self) -> &BTreeMap<DirRole, PathBuf> {
        &self.extra_dirs
    }

    /// Base directory for a call: the role directory, or the main files path
    pub fn base(&self, base_dir: Option<DirRole>) -> &Path {
        match base_dir {
            Some(role) => self.role_dir(role),
            None => &self.files_dir,
        }
    }

    /// Directory holding the object, relative to its base directory
    pub fn relative_dir(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        let id = dataset.id();
        let mut rel: PathBuf = directory_hash_id(id).into_iter().collect();

        if params.obj_dir {
            rel.push(id.to_string());
        }

        if let Some(extra) = &params.extra_dir {
            let extra = validate_extra_dir(extra)?;
            rel = if params.extra_dir_at_root {
                extra.join(rel)
            } else {
                rel.join(extra)
            };
        }

        Ok(rel)
    }

    /// Absolute directory holding the object
    pub fn object_dir(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        let base = std::path::absolute(self.base(params.base_dir))
            .map_err(|e| ObjectStoreError::io(self.base(params.base_dir), e))?;
        Ok(base.join(self.relative_dir(dataset, params)?))
    }

    /// Absolute path of the object, checked against its containment directory
    pub fn resolve(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<PathBuf> {
        let dir = self.object_dir(dataset, params)?;
        if params.dir_only {
            return Ok(dir);
        }

        match &params.alt_name {
            Some(name) => contained_join(&dir, name),
            None => Ok(dir.join(default_file_name(dataset.id()))),
        }
    }

    /// Remote key for the object: the relative layout joined with `/`.
    ///
    /// Directory keys end with `/`, the way blob services mark folders.
    pub fn object_key(&self, dataset: &DatasetRef, params: &ObjectParams) -> Result<String> {
        let rel = self.relative_dir(dataset, params)?;
        if params.dir_only {
            return Ok(format!("{}/", key_from_path(&rel)));
        }

        let name = match &params.alt_name {
            Some(name) => contained_relative(&rel, name)?,
            None => rel.join(default_file_name(dataset.id())),
        };
        Ok(key_from_path(&name))
    }
}

fn key_from_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn validate_extra_dir(extra: &str) -> Result<PathBuf> {
    let path = Path::new(extra);
    // components() hides interior `.`, so check the raw segments too
    let normal = !extra.is_empty()
        && extra.split(['/', '\\']).all(|s| s != "." && s != "..")
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

    if !normal {
        return Err(ObjectStoreError::invalid_path(
            extra,
            "extra_dir must be a normalized relative path",
        ));
    }
    Ok(path.to_path_buf())
}

/// Join `name` onto a relative directory without touching the filesystem.
fn contained_relative(rel_dir: &Path, name: &str) -> Result<PathBuf> {
    let joined = normalize_lexically(&rel_dir.join(name));
    if joined.is_absolute() || joined == rel_dir || !joined.starts_with(rel_dir) {
        return Err(ObjectStoreError::invalid_path(
            name,
            format!("escapes {}", rel_dir.display()),
        ));
    }
    Ok(joined)
}

/// Join `name` onto `containment` and return the physical result.
///
/// `..` and symlinks are resolved before comparing, and the result must be a
/// strict descendant of the equally resolved containment directory.
pub fn contained_join(containment: &Path, name: &str) -> Result<PathBuf> {
    let root = resolve_physical(containment)?;
    let candidate = resolve_physical(&containment.join(name))?;

    if candidate == root || !candidate.starts_with(&root) {
        tracing::warn!(
            "Rejected path '{}' outside of {}",
            name,
            containment.display()
        );
        return Err(ObjectStoreError::invalid_path(
            name,
            format!("escapes {}", containment.display()),
        ));
    }

    Ok(candidate)
}

/// Resolve `.`/`..` textually. `..` at the root stays at the root.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-attach the remainder.
fn resolve_physical(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path).map_err(|e| ObjectStoreError::io(path, e))?;
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut suffix = Vec::new();
    loop {
        match std::fs::canonicalize(existing) {
            Ok(mut real) => {
                for name in suffix.iter().rev() {
                    real.push(name);
                }
                return Ok(real);
            }
            Err(_) if existing.symlink_metadata().is_ok() => {
                return Err(ObjectStoreError::invalid_path(
                    existing,
                    "dangling symlink",
                ));
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    suffix.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Ok(normalized),
            },
        }
    }
}
