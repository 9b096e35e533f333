//! Local disk object store

use async_trait::async_trait;
use std::fs::File as StdFile;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::backend::{
    ObjectId, ObjectStore, ScannedObject, ScannedType, TypeRecord, parse_object_file_name,
    shard_for, split_file_name,
};
use crate::error::StorageError;

/// Name of the per-type configuration record
const TYPE_RECORD_FILE: &str = "type.toml";

/// Upper bound for the `-(N)` suffix when picking a free destination name
const MAX_UNIQUE_INDEX: u32 = 1000;

/// Local disk object store
///
/// Layout:
/// `<base_path>/<type>/type.toml` and
/// `<base_path>/<type>/<shard>/<id:016x>-<fileName>`
pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    /// Create a new local object store, creating the base directory if needed
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path.as_ref()).await?;
        // Path names handed to callers must not depend on our working directory
        let base_path = fs::canonicalize(base_path.as_ref()).await?;

        info!("Initialized object store at {:?}", base_path);

        Ok(Self { base_path })
    }

    fn type_dir(&self, type_name: &str) -> PathBuf {
        self.base_path.join(type_name)
    }

    async fn scan_type(&self, dir: &Path, name: String) -> Result<ScannedType, StorageError> {
        let record = match fs::read_to_string(dir.join(TYPE_RECORD_FILE)).await {
            Ok(content) => match toml::from_str::<TypeRecord>(&content) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Unreadable type record for '{}': {}", name, e);
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut objects = Vec::new();
        let mut shards = fs::read_dir(dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name();

            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let os_name = file.file_name();
                let Some((id, file_name)) = os_name.to_str().and_then(parse_object_file_name)
                else {
                    warn!("Skipping unrecognized file {:?}", file.path());
                    continue;
                };
                if shard_name.to_str() != Some(shard_for(id).as_str()) {
                    warn!("Skipping misplaced object file {:?}", file.path());
                    continue;
                }

                let metadata = file.metadata().await?;
                if !metadata.is_file() {
                    continue;
                }

                objects.push(ScannedObject {
                    id,
                    file_name: file_name.to_string(),
                    path: file.path(),
                    len: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        objects.sort_by_key(|o| o.id);

        debug!("Scanned type '{}': {} objects", name, objects.len());
        Ok(ScannedType {
            name,
            record,
            objects,
        })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn base_dir(&self) -> &Path {
        &self.base_path
    }

    async fn allocate(
        &self,
        type_name: &str,
        id: ObjectId,
        file_name: &str,
    ) -> Result<PathBuf, StorageError> {
        let path = self.object_path(type_name, id, file_name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        debug!("Allocated object file {:?}", path);
        Ok(path)
    }

    async fn object_len(&self, path: &Path) -> Result<u64, StorageError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| not_found_or_io(e, path))?;
        Ok(metadata.len())
    }

    async fn copy_out(
        &self,
        source: &Path,
        destination: &Path,
        file_name: &str,
    ) -> Result<PathBuf, StorageError> {
        debug!("Copying {:?} into {:?} as '{}'", source, destination, file_name);

        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let file_name = file_name.to_string();

        tokio::task::spawn_blocking(move || copy_file_atomic(&source, &destination, &file_name))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?
    }

    async fn delete(&self, path: &Path) -> Result<bool, StorageError> {
        debug!("Deleting object file {:?}", path);

        let removed = match fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::Io(e)),
        };

        // Drop the shard directory once it is empty
        if let Some(shard) = path.parent() {
            match fs::remove_dir(shard).await {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::NotFound
                    ) => {}
                Err(e) => debug!("Keeping shard directory {:?}: {}", shard, e),
            }
        }

        Ok(removed)
    }

    async fn save_type(&self, type_name: &str, record: &TypeRecord) -> Result<(), StorageError> {
        let dir = self.type_dir(type_name);
        fs::create_dir_all(&dir).await?;

        let content =
            toml::to_string(record).map_err(|e| StorageError::TypeRecord(e.to_string()))?;

        let path = dir.join(TYPE_RECORD_FILE);
        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Saved type record for '{}'", type_name);
        Ok(())
    }

    async fn remove_type(&self, type_name: &str) -> Result<(), StorageError> {
        let dir = self.type_dir(type_name);
        debug!("Removing type directory {:?}", dir);

        // Without its record a leftover directory is an orphan at the next scan
        match fs::remove_file(dir.join(TYPE_RECORD_FILE)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }

        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn scan(&self) -> Result<Vec<ScannedType>, StorageError> {
        let mut types = Vec::new();

        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 type directory {:?}", entry.path());
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            types.push(self.scan_type(&entry.path(), name).await?);
        }

        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }
}

fn not_found_or_io(e: io::Error, path: &Path) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(path.display().to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Map a failed write at the destination to the error callers act on
fn classify_write_error(e: io::Error, target: &Path) -> StorageError {
    match e.kind() {
        io::ErrorKind::StorageFull
        | io::ErrorKind::QuotaExceeded
        | io::ErrorKind::FileTooLarge => {
            StorageError::DestinationFull(format!("{}: {}", target.display(), e))
        }
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
            StorageError::InvalidDestination(format!("{}: {}", target.display(), e))
        }
        _ => StorageError::Io(e),
    }
}

fn copy_file_atomic(
    source: &Path,
    destination: &Path,
    file_name: &str,
) -> Result<PathBuf, StorageError> {
    let mut reader = StdFile::open(source).map_err(|e| not_found_or_io(e, source))?;

    prepare_destination(destination)?;
    let target = write_atomic(destination, file_name, |out| {
        io::copy(&mut reader, out).map(|_| ())
    })?;

    info!("Copied {:?} to {:?}", source, target);
    Ok(target)
}

fn prepare_destination(destination: &Path) -> Result<(), StorageError> {
    match std::fs::metadata(destination) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(StorageError::InvalidDestination(format!(
            "{} is not a directory",
            destination.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => std::fs::create_dir_all(destination)
            .map_err(|e| classify_write_error(e, destination)),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// First free name among `name`, `base-(1).ext`, `base-(2).ext`, ...
fn unique_target(dir: &Path, file_name: &str) -> Result<PathBuf, StorageError> {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (base, extension) = split_file_name(file_name);
    for i in 1..MAX_UNIQUE_INDEX {
        let candidate = dir.join(format!("{}-({}){}", base, i, extension));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(no_unique_name(dir, file_name))
}

fn no_unique_name(dir: &Path, file_name: &str) -> StorageError {
    StorageError::InvalidDestination(format!(
        "no unique name for '{}' in {}",
        file_name,
        dir.display()
    ))
}

/// Write a new file named after `file_name` in `dir` through a hidden
/// temp file, returning the path it landed at
///
/// The temp file is removed on every failure path, so a failed write
/// leaves nothing behind in `dir`. When another writer claims the chosen
/// name first, the next free name is tried.
fn write_atomic<F>(dir: &Path, file_name: &str, write: F) -> Result<PathBuf, StorageError>
where
    F: FnOnce(&mut StdFile) -> io::Result<()>,
{
    let mut temp = tempfile::Builder::new()
        .prefix(".filecache-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| classify_write_error(e, dir))?;

    write(temp.as_file_mut()).map_err(|e| classify_write_error(e, dir))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| classify_write_error(e, dir))?;

    for _ in 0..MAX_UNIQUE_INDEX {
        let target = unique_target(dir, file_name)?;
        match temp.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{:?} was claimed meanwhile, picking another name", target);
                temp = e.file;
            }
            Err(e) => return Err(classify_write_error(e.error, &target)),
        }
    }

    Err(no_unique_name(dir, file_name))
}
