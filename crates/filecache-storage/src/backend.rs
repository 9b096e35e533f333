//! Object store trait and on-disk naming

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::error::StorageError;

/// Identifier of a cached object, unique across all cache types
pub type ObjectId = u64;

/// Persisted configuration of a cache type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub lo_watermark: u64,
    pub hi_watermark: u64,
    #[serde(default)]
    pub default_size: u64,
}

/// Components decoded from an object path name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub type_name: String,
    pub id: ObjectId,
    pub file_name: String,
}

/// An object file found while scanning the cache tree
#[derive(Debug, Clone)]
pub struct ScannedObject {
    pub id: ObjectId,
    pub file_name: String,
    pub path: PathBuf,
    pub len: u64,
    pub modified: SystemTime,
}

/// A type directory found while scanning the cache tree
#[derive(Debug, Clone)]
pub struct ScannedType {
    pub name: String,
    /// `None` when the directory has no readable type record
    pub record: Option<TypeRecord>,
    pub objects: Vec<ScannedObject>,
}

/// Object store trait
///
/// Implementations own the bytes of cached objects. Quota accounting is
/// not their concern: the cache manager reserves and releases space and
/// only asks the store to materialize or remove files.
///
/// Objects live at `<base>/<type>/<shard>/<id:016x>-<fileName>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Root of the cache tree
    fn base_dir(&self) -> &Path;

    /// Path name for an object
    fn object_path(&self, type_name: &str, id: ObjectId, file_name: &str) -> PathBuf {
        self.base_dir()
            .join(type_name)
            .join(shard_for(id))
            .join(object_file_name(id, file_name))
    }

    /// Decode a caller-supplied path name
    fn locate(&self, path_name: &str) -> Result<ObjectLocation, StorageError> {
        parse_object_path(self.base_dir(), path_name)
    }

    /// Create the empty, writable backing file for a new object
    async fn allocate(
        &self,
        type_name: &str,
        id: ObjectId,
        file_name: &str,
    ) -> Result<PathBuf, StorageError>;

    /// Current on-disk length of an object file
    async fn object_len(&self, path: &Path) -> Result<u64, StorageError>;

    /// Copy an object file into the `destination` directory as `file_name`
    ///
    /// Either the complete file appears at the returned path or nothing
    /// is left in the destination.
    async fn copy_out(
        &self,
        source: &Path,
        destination: &Path,
        file_name: &str,
    ) -> Result<PathBuf, StorageError>;

    /// Delete an object file, returns false if it was already gone
    async fn delete(&self, path: &Path) -> Result<bool, StorageError>;

    /// Persist the configuration record of a type
    async fn save_type(&self, type_name: &str, record: &TypeRecord) -> Result<(), StorageError>;

    /// Remove a type directory with everything below it
    async fn remove_type(&self, type_name: &str) -> Result<(), StorageError>;

    /// Walk the cache tree
    async fn scan(&self) -> Result<Vec<ScannedType>, StorageError>;
}

/// Shard directory for an object id
pub fn shard_for(id: ObjectId) -> String {
    format!("{:02x}", id & 0xff)
}

/// File name of an object inside its shard directory
pub fn object_file_name(id: ObjectId, file_name: &str) -> String {
    format!("{:016x}-{}", id, file_name)
}

/// Split an object file name into its id and the caller's file name
pub fn parse_object_file_name(name: &str) -> Option<(ObjectId, &str)> {
    let (hex, file_name) = name.split_once('-')?;
    if hex.len() != 16 || file_name.is_empty() {
        return None;
    }
    let id = ObjectId::from_str_radix(hex, 16).ok()?;
    if id == 0 {
        return None;
    }
    Some((id, file_name))
}

/// Decode `<base>/<type>/<shard>/<id>-<fileName>`
pub fn parse_object_path(base: &Path, path_name: &str) -> Result<ObjectLocation, StorageError> {
    let invalid = || StorageError::InvalidPath(path_name.to_string());

    let relative = Path::new(path_name)
        .strip_prefix(base)
        .map_err(|_| invalid())?;

    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<&str>>>()
        .ok_or_else(invalid)?;

    let &[type_name, shard, file] = parts.as_slice() else {
        return Err(invalid());
    };

    let (id, file_name) = parse_object_file_name(file).ok_or_else(invalid)?;
    if shard != shard_for(id) {
        return Err(invalid());
    }

    Ok(ObjectLocation {
        type_name: type_name.to_string(),
        id,
        file_name: file_name.to_string(),
    })
}

/// Split a file name into basename and extension (extension keeps its dot)
///
/// A leading dot does not start an extension.
pub fn split_file_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}
