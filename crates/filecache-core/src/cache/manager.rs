//! Cache manager implementation

use filecache_storage::{ObjectId, ObjectLocation, ObjectStore, StorageError};
use metrics::counter;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::eviction::{EvictedObject, Eviction, EvictionEngine};
use super::policy::EvictionPolicy;
use crate::config::{TypeDefinition, validate_file_name, validate_type_name};
use crate::error::CoreError;
use crate::registry::{CacheObject, CacheTypeState, TypeParams, TypeRegistry, TypeSlot};
use crate::subscription::Subscription;

/// Configuration for the cache manager
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Space the low watermarks of all types together may claim, in bytes
    pub total_cache_space: u64,
    /// Eviction policy
    pub eviction_policy: EvictionPolicy,
    /// Copy-out destination when the caller names none
    pub default_download_dir: PathBuf,
    /// Upper bound for a single copy-out
    pub copy_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_cache_space: 5 * 1024 * 1024 * 1024, // 5 GB
            eviction_policy: EvictionPolicy::Lru,
            default_download_dir: PathBuf::from("./data/downloads"),
            copy_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of an insert
#[derive(Debug)]
pub struct InsertedObject {
    pub path_name: String,
    pub subscription: Option<Subscription>,
}

/// Cache wide totals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub num_types: u64,
    pub size: u64,
    pub num_objects: u64,
    pub avail_space: u64,
}

/// Totals of a single type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeStatus {
    pub size: u64,
    pub num_objects: u64,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_subscriptions: u64,
    pub newly_written: u64,
    /// Written objects charged down to their real length
    pub shrunk_objects: u64,
    /// Written objects larger than their allocation, removed
    pub oversized_objects: u64,
    /// Objects whose file vanished
    pub dropped_objects: u64,
    /// Expired objects reclaimed after their subscriptions ended
    pub released_objects: u64,
}

/// Cache manager
///
/// Owns the type registry and coordinates it with the object store and
/// the eviction engine. All mutations of a type happen under that type's
/// lock; different types proceed in parallel. Operations that grow usage
/// are additionally admitted one at a time against the total cache space.
pub struct CacheManager {
    storage: Arc<dyn ObjectStore>,
    registry: TypeRegistry,
    eviction: EvictionEngine,
    config: CacheConfig,
    next_id: AtomicU64,
    /// Serializes creation and removal of types
    types_lock: Mutex<()>,
    /// Serializes inserts and resizes; taken before any type lock
    space_lock: Mutex<()>,
}

impl CacheManager {
    /// Open the cache, rebuilding types and objects from the object store
    pub async fn open(
        storage: Arc<dyn ObjectStore>,
        mut config: CacheConfig,
    ) -> Result<Self, CoreError> {
        config.default_download_dir =
            std::path::absolute(&config.default_download_dir).map_err(StorageError::from)?;

        info!(
            "Initializing cache manager (total space: {} bytes, policy: {}, root: {:?})",
            config.total_cache_space,
            config.eviction_policy.as_str(),
            storage.base_dir()
        );

        let manager = Self {
            storage,
            registry: TypeRegistry::new(),
            eviction: EvictionEngine::new(config.eviction_policy),
            config,
            next_id: AtomicU64::new(1),
            types_lock: Mutex::new(()),
            space_lock: Mutex::new(()),
        };
        manager.restore().await?;

        Ok(manager)
    }

    async fn restore(&self) -> Result<(), CoreError> {
        let scanned = self.storage.scan().await?;
        let mut max_id: ObjectId = 0;
        let mut restored_objects = 0usize;

        for scanned_type in scanned {
            let Some(record) = scanned_type.record else {
                warn!(
                    "Removing orphaned type directory '{}' without a type record",
                    scanned_type.name
                );
                self.storage.remove_type(&scanned_type.name).await?;
                continue;
            };

            let params = TypeParams::from(record);
            if let Err(e) = validate_type_name(&scanned_type.name).and(params.validate()) {
                warn!("Ignoring stored type '{}': {}", scanned_type.name, e);
                continue;
            }

            let mut state = CacheTypeState::new(params);
            let mut objects = scanned_type.objects;
            objects.sort_by_key(|o| o.modified);

            for scanned_object in objects {
                max_id = max_id.max(scanned_object.id);

                // Never written before the last shutdown
                if scanned_object.len == 0 {
                    debug!("Dropping empty object file {:?}", scanned_object.path);
                    self.storage.delete(&scanned_object.path).await?;
                    continue;
                }

                let seq = state.tick();
                let mut object = CacheObject::new(
                    scanned_object.id,
                    scanned_object.file_name,
                    scanned_object.path,
                    scanned_object.len,
                    seq,
                );
                object.written = true;
                state.insert(object);
                restored_objects += 1;
            }

            let eviction = self.eviction.select(&mut state, &scanned_type.name, None);
            let slot = self
                .registry
                .insert(TypeSlot::new(scanned_type.name.clone(), state));
            self.reap(slot.name(), eviction).await;
        }

        self.next_id.store(max_id + 1, Ordering::SeqCst);

        info!(
            "Restored {} cache types with {} objects",
            self.registry.len(),
            restored_objects
        );
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ==================== Type Operations ====================

    /// Create a type, or update the watermarks of an existing one
    ///
    /// Identical parameters are a no-op. Lowering the high watermark of a
    /// type evicts immediately.
    pub async fn define_type(
        &self,
        type_name: &str,
        lo_watermark: i64,
        hi_watermark: i64,
        default_size: i64,
    ) -> Result<(), CoreError> {
        validate_type_name(type_name)?;
        let params = TypeParams::new(lo_watermark, hi_watermark, default_size)?;

        let _types = self.types_lock.lock().await;

        if let Some(slot) = self.registry.get(type_name) {
            return self.update_type(&slot, params).await;
        }

        self.check_total_space(type_name, &params)?;
        self.storage.save_type(type_name, &params.record()).await?;
        self.registry
            .insert(TypeSlot::new(type_name, CacheTypeState::new(params)));

        info!(
            "Defined cache type '{}' (lo: {}, hi: {}, default size: {})",
            type_name, params.lo_watermark, params.hi_watermark, params.default_size
        );
        Ok(())
    }

    /// Change some parameters of an existing type
    pub async fn change_type(
        &self,
        type_name: &str,
        lo_watermark: Option<i64>,
        hi_watermark: Option<i64>,
        default_size: Option<i64>,
    ) -> Result<(), CoreError> {
        let _types = self.types_lock.lock().await;
        let slot = self.type_slot(type_name)?;

        let current = slot.params();
        let as_wire = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);
        let params = TypeParams::new(
            lo_watermark.unwrap_or(as_wire(current.lo_watermark)),
            hi_watermark.unwrap_or(as_wire(current.hi_watermark)),
            default_size.unwrap_or(as_wire(current.default_size)),
        )?;

        self.update_type(&slot, params).await
    }

    async fn update_type(&self, slot: &TypeSlot, params: TypeParams) -> Result<(), CoreError> {
        let mut state = slot
            .lock_live()
            .await
            .ok_or_else(|| CoreError::TypeNotFound(slot.name().to_string()))?;

        if state.params == params {
            debug!("Cache type '{}' unchanged", slot.name());
            return Ok(());
        }

        self.check_total_space(slot.name(), &params)?;
        self.storage.save_type(slot.name(), &params.record()).await?;
        state.params = params;

        let eviction = self.eviction.select(&mut state, slot.name(), None);
        slot.publish(&state);
        drop(state);

        info!(
            "Updated cache type '{}' (lo: {}, hi: {}, default size: {})",
            slot.name(),
            params.lo_watermark,
            params.hi_watermark,
            params.default_size
        );
        self.reap(slot.name(), eviction).await;
        Ok(())
    }

    fn check_total_space(&self, type_name: &str, params: &TypeParams) -> Result<(), CoreError> {
        let claimed = self.registry.total_lo_watermark(Some(type_name));
        if claimed.saturating_add(params.lo_watermark) > self.config.total_cache_space {
            return Err(CoreError::InsufficientSpace(format!(
                "loWatermark {} of '{}' does not fit: {} of {} bytes already claimed",
                params.lo_watermark, type_name, claimed, self.config.total_cache_space
            )));
        }
        Ok(())
    }

    /// Delete a type and every object in it, returning the bytes freed
    ///
    /// Deleting a type that does not exist frees nothing and succeeds.
    pub async fn delete_type(&self, type_name: &str) -> Result<u64, CoreError> {
        let _types = self.types_lock.lock().await;

        let Some(slot) = self.registry.remove(type_name) else {
            debug!("Delete of unknown cache type '{}'", type_name);
            return Ok(0);
        };

        let mut state = slot.lock().await;
        state.deleted = true;
        let freed = state.usage;
        let objects = state.drain();
        slot.publish(&state);
        drop(state);

        let count = objects.len() as u64;
        for object in objects {
            // Wait out in-flight copies
            let _pin = object.pin.clone().write_owned().await;
            if let Err(e) = self.storage.delete(&object.path).await {
                warn!("Failed to delete object {:?}: {}", object.path, e);
            }
        }
        // The type is gone either way; a leftover directory has no type
        // record and is cleaned up at the next start
        if let Err(e) = self.storage.remove_type(type_name).await {
            warn!("Failed to remove directory of cache type '{}': {}", type_name, e);
        }

        counter!("filecache_objects_deleted_total").increment(count);
        info!(
            "Deleted cache type '{}' ({} objects, {} bytes freed)",
            type_name, count, freed
        );
        Ok(freed)
    }

    pub fn describe_type(&self, type_name: &str) -> Result<TypeParams, CoreError> {
        Ok(self.type_slot(type_name)?.params())
    }

    pub fn type_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn type_status(&self, type_name: &str) -> Result<TypeStatus, CoreError> {
        let slot = self.type_slot(type_name)?;
        Ok(TypeStatus {
            size: slot.usage(),
            num_objects: slot.object_count(),
        })
    }

    pub fn cache_status(&self) -> CacheStatus {
        let mut status = CacheStatus {
            num_types: 0,
            size: 0,
            num_objects: 0,
            avail_space: 0,
        };
        let mut reserved = 0u64;

        for slot in self.registry.slots() {
            status.num_types += 1;
            status.size += slot.usage();
            status.num_objects += slot.object_count();
            reserved += slot.params().lo_watermark;
        }
        status.avail_space = reserved.saturating_sub(status.size);

        status
    }

    /// Define every configured type that does not exist yet
    pub async fn ensure_types(&self, definitions: &[TypeDefinition]) -> Result<(), CoreError> {
        for definition in definitions {
            if self.registry.get(&definition.name).is_some() {
                debug!("Configured cache type '{}' already exists", definition.name);
                continue;
            }
            let wire = |value: u64| {
                i64::try_from(value).map_err(|_| {
                    CoreError::InvalidArgument(format!(
                        "value {} of type '{}' out of range",
                        value, definition.name
                    ))
                })
            };
            self.define_type(
                &definition.name,
                wire(definition.lo_watermark)?,
                wire(definition.hi_watermark)?,
                wire(definition.default_size)?,
            )
            .await?;
        }
        Ok(())
    }

    // ==================== Object Operations ====================

    /// Insert an object, reserving `size` bytes against its type
    ///
    /// A size of zero selects the type's default size. The returned path
    /// name is the writable backing file.
    pub async fn insert(
        &self,
        type_name: &str,
        file_name: &str,
        size: i64,
        subscribe: bool,
    ) -> Result<InsertedObject, CoreError> {
        validate_file_name(file_name)?;
        let size = u64::try_from(size)
            .map_err(|_| CoreError::InvalidArgument("size must not be negative".to_string()))?;

        let slot = self.type_slot(type_name)?;
        let _space = self.space_lock.lock().await;

        let size = if size == 0 {
            slot.params().default_size
        } else {
            size
        };
        if size == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "size required, type '{}' has no default size",
                type_name
            )));
        }
        check_fits(type_name, &slot.params(), size)?;
        self.ensure_total_space(size, None).await?;

        let mut state = slot
            .lock_live()
            .await
            .ok_or_else(|| CoreError::TypeNotFound(type_name.to_string()))?;
        check_fits(type_name, &state.params, size)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.storage.allocate(type_name, id, file_name).await?;
        let seq = state.tick();
        let mut object = CacheObject::new(id, file_name.to_string(), path, size, seq);
        let path_name = object.path_name();

        let subscription = if subscribe {
            let (subscription, sender) = Subscription::new(path_name.clone());
            object.subscribers.push(sender);
            Some(subscription)
        } else {
            None
        };
        state.insert(object);

        let eviction = self.eviction.select(&mut state, type_name, Some(id));
        slot.publish(&state);
        drop(state);

        counter!("filecache_objects_inserted_total").increment(1);
        debug!("Inserted {} ({} bytes) into '{}'", path_name, size, type_name);

        self.reap(type_name, eviction).await;
        Ok(InsertedObject {
            path_name,
            subscription,
        })
    }

    /// Change the declared size of an object
    ///
    /// The new size may not drop below what is already on disk.
    pub async fn resize(&self, path_name: &str, new_size: i64) -> Result<u64, CoreError> {
        let new_size = u64::try_from(new_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| CoreError::InvalidArgument("newSize must be positive".to_string()))?;

        let (slot, location) = self.resolve(path_name)?;
        let _space = self.space_lock.lock().await;

        let current = {
            let state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
            let object = state.find(&location).ok_or_else(|| not_found(path_name))?;
            check_fits(slot.name(), &state.params, new_size)?;
            object.size
        };
        if new_size > current {
            self.ensure_total_space(new_size - current, Some((slot.name(), location.id)))
                .await?;
        }

        let mut state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
        let object = state.find(&location).ok_or_else(|| not_found(path_name))?;
        check_fits(slot.name(), &state.params, new_size)?;

        let on_disk = match self.storage.object_len(&object.path).await {
            Ok(len) => len,
            Err(StorageError::NotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        if new_size < on_disk {
            return Err(CoreError::InvalidArgument(format!(
                "newSize {} is below the {} bytes already written",
                new_size, on_disk
            )));
        }

        state.resize(location.id, new_size);
        state.touch(location.id);

        let eviction = self.eviction.select(&mut state, slot.name(), Some(location.id));
        slot.publish(&state);
        drop(state);

        debug!("Resized {} to {} bytes", path_name, new_size);
        self.reap(slot.name(), eviction).await;
        Ok(new_size)
    }

    /// Delete an object and release its quota
    pub async fn delete_object(&self, path_name: &str) -> Result<(), CoreError> {
        let (slot, location) = self.resolve(path_name)?;

        let object = {
            let mut state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
            state.find(&location).ok_or_else(|| not_found(path_name))?;
            let object = state
                .remove(location.id)
                .ok_or_else(|| not_found(path_name))?;
            slot.publish(&state);
            object
        };

        // Wait out in-flight copies before the file goes
        let _pin = object.pin.clone().write_owned().await;
        self.storage.delete(&object.path).await?;

        counter!("filecache_objects_deleted_total").increment(1);
        info!(
            "Deleted {} from '{}' ({} bytes)",
            path_name,
            slot.name(),
            object.size
        );
        Ok(())
    }

    /// Register or cancel eviction subscriptions on an object
    ///
    /// Subscribing also refreshes the object's recency. Cancelling drops
    /// every subscription held on the object, and reclaims it right away
    /// if it had expired meanwhile.
    pub async fn subscribe(
        &self,
        path_name: &str,
        subscribe: bool,
    ) -> Result<Option<Subscription>, CoreError> {
        let (slot, location) = self.resolve(path_name)?;
        let mut state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
        state.find(&location).ok_or_else(|| not_found(path_name))?;

        if !subscribe {
            if let Some(object) = state.objects.get_mut(&location.id) {
                object.subscribers.clear();
            }
            let eviction = self.eviction.select(&mut state, slot.name(), None);
            slot.publish(&state);
            drop(state);

            self.reap(slot.name(), eviction).await;
            return Ok(None);
        }

        state.touch(location.id);
        let (subscription, sender) = Subscription::new(path_name);
        if let Some(object) = state.objects.get_mut(&location.id) {
            object.subscribers.push(sender);
        }
        Ok(Some(subscription))
    }

    /// Mark an object as recently used
    pub async fn touch(&self, path_name: &str) -> Result<(), CoreError> {
        let (slot, location) = self.resolve(path_name)?;
        let mut state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
        state.find(&location).ok_or_else(|| not_found(path_name))?;
        state.touch(location.id);
        Ok(())
    }

    /// Copy an object out of the cache
    ///
    /// The object stays cached. `destination` defaults to the configured
    /// download directory and `file_name` to the object's own file name.
    /// The object cannot be evicted or deleted while the copy runs.
    pub async fn copy_object(
        &self,
        path_name: &str,
        destination: Option<&Path>,
        file_name: Option<&str>,
    ) -> Result<PathBuf, CoreError> {
        let (slot, location) = self.resolve(path_name)?;

        let (source, target_name, pin) = {
            let mut state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
            let object = state.find(&location).ok_or_else(|| not_found(path_name))?;
            let source = object.path.clone();
            let target_name = file_name.unwrap_or(object.file_name.as_str()).to_string();
            let pin = object.pin.clone().read_owned().await;
            state.touch(location.id);
            (source, target_name, pin)
        };
        validate_file_name(&target_name)?;

        let destination = match destination {
            Some(dir) => std::path::absolute(dir).map_err(|e| {
                CoreError::InvalidDestination(format!("{}: {}", dir.display(), e))
            })?,
            None => self.config.default_download_dir.clone(),
        };
        let destination = destination.as_path();
        let result = tokio::time::timeout(
            self.config.copy_timeout,
            self.storage.copy_out(&source, destination, &target_name),
        )
        .await;
        drop(pin);

        let copied = match result {
            Ok(Ok(copied)) => copied,
            Ok(Err(e)) => {
                counter!("filecache_copy_failures_total").increment(1);
                warn!("Copy of {} to {:?} failed: {}", path_name, destination, e);
                return Err(CoreError::from_copy(e, path_name));
            }
            Err(_) => {
                counter!("filecache_copy_failures_total").increment(1);
                warn!("Copy of {} to {:?} timed out", path_name, destination);
                return Err(CoreError::Timeout(format!(
                    "copy of {} exceeded {:?}",
                    path_name, self.config.copy_timeout
                )));
            }
        };

        counter!("filecache_copies_total").increment(1);
        Ok(copied)
    }

    pub async fn object_size(&self, path_name: &str) -> Result<u64, CoreError> {
        let (slot, location) = self.resolve(path_name)?;
        let state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
        let object = state.find(&location).ok_or_else(|| not_found(path_name))?;
        Ok(object.size)
    }

    pub async fn object_file_name(&self, path_name: &str) -> Result<String, CoreError> {
        let (slot, location) = self.resolve(path_name)?;
        let state = slot.lock_live().await.ok_or_else(|| not_found(path_name))?;
        let object = state.find(&location).ok_or_else(|| not_found(path_name))?;
        Ok(object.file_name.clone())
    }

    // ==================== Maintenance ====================

    /// Prune abandoned subscriptions and validate object files
    ///
    /// The first time an unsubscribed object's file is seen holding bytes
    /// it is checked against its allocation: a shorter file shrinks the
    /// allocation to the real length, a longer one is removed. Expired
    /// objects whose subscriptions are gone are reclaimed.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, CoreError> {
        let mut report = MaintenanceReport::default();

        for slot in self.registry.slots() {
            let Some(mut state) = slot.lock_live().await else {
                continue;
            };

            let mut vanished = Vec::new();
            let mut oversized = Vec::new();
            let mut shrunk = Vec::new();
            for object in state.objects.values_mut() {
                report.pruned_subscriptions += object.prune_subscribers() as u64;

                match self.storage.object_len(&object.path).await {
                    Ok(len) if len == 0 || object.written || object.is_subscribed() => {}
                    Ok(len) if len > object.size => {
                        warn!(
                            "Object {:?} holds {} bytes, {} allocated",
                            object.path, len, object.size
                        );
                        oversized.push(object.id);
                    }
                    Ok(len) => {
                        object.written = true;
                        report.newly_written += 1;
                        if len < object.size {
                            shrunk.push((object.id, len));
                        }
                    }
                    Err(StorageError::NotFound(_)) => vanished.push(object.id),
                    Err(e) => warn!("Cannot check object {:?}: {}", object.path, e),
                }
            }

            for id in vanished {
                if let Some(object) = state.remove(id) {
                    warn!("Object file {:?} vanished, dropping it", object.path);
                    report.dropped_objects += 1;
                }
            }
            for (id, len) in shrunk {
                if state.resize(id, len) {
                    report.shrunk_objects += 1;
                }
            }
            let removed: Vec<CacheObject> = oversized
                .into_iter()
                .filter_map(|id| state.remove(id))
                .collect();

            let eviction = self.eviction.select(&mut state, slot.name(), None);
            slot.publish(&state);
            drop(state);

            for object in removed {
                let _pin = object.pin.clone().write_owned().await;
                if let Err(e) = self.storage.delete(&object.path).await {
                    warn!("Failed to delete oversized object {:?}: {}", object.path, e);
                }
                report.oversized_objects += 1;
            }
            report.released_objects += eviction.victims.len() as u64;
            self.reap(slot.name(), eviction).await;
        }

        if report != MaintenanceReport::default() {
            debug!("Maintenance: {:?}", report);
        }
        Ok(report)
    }

    /// Delete transient objects and end every subscription
    ///
    /// Objects whose backing file never received bytes are transient, as
    /// are expired objects.
    pub async fn shutdown(&self) -> Result<u64, CoreError> {
        info!("Shutting down cache manager");
        let mut removed = 0u64;

        for slot in self.registry.slots() {
            let Some(mut state) = slot.lock_live().await else {
                continue;
            };

            let mut transient = Vec::new();
            for object in state.objects.values_mut() {
                object.subscribers.clear();
                if object.expired {
                    transient.push(object.id);
                    continue;
                }
                match self.storage.object_len(&object.path).await {
                    Ok(0) | Err(StorageError::NotFound(_)) => transient.push(object.id),
                    Ok(_) => object.written = true,
                    Err(e) => warn!("Cannot check object {:?}: {}", object.path, e),
                }
            }

            for id in transient {
                if let Some(object) = state.remove(id) {
                    self.storage.delete(&object.path).await?;
                    removed += 1;
                }
            }
            slot.publish(&state);
        }

        info!("Removed {} transient objects", removed);
        Ok(removed)
    }

    // ==================== Helpers ====================

    fn type_slot(&self, type_name: &str) -> Result<Arc<TypeSlot>, CoreError> {
        self.registry
            .get(type_name)
            .ok_or_else(|| CoreError::TypeNotFound(type_name.to_string()))
    }

    /// Decode a path name into its type slot and location
    fn resolve(&self, path_name: &str) -> Result<(Arc<TypeSlot>, ObjectLocation), CoreError> {
        let location = self
            .storage
            .locate(path_name)
            .map_err(|_| not_found(path_name))?;
        let slot = self
            .registry
            .get(&location.type_name)
            .ok_or_else(|| not_found(path_name))?;
        Ok((slot, location))
    }

    /// Make room for `needed` more bytes within the total cache space
    ///
    /// Types give up objects above their low watermark, the type furthest
    /// above it first. Called with the space lock held and no type lock.
    async fn ensure_total_space(
        &self,
        needed: u64,
        keep: Option<(&str, ObjectId)>,
    ) -> Result<(), CoreError> {
        let total = self.config.total_cache_space;
        let missing = |usage: u64| usage.saturating_add(needed).saturating_sub(total);

        let mut remaining = missing(self.registry.total_usage());
        if remaining == 0 {
            return Ok(());
        }
        debug!(
            "{} more bytes exceed the total cache space {}, reclaiming {}",
            needed, total, remaining
        );

        let mut slots = self.registry.slots();
        slots.sort_by_key(|slot| Reverse(slot.usage().saturating_sub(slot.params().lo_watermark)));
        for slot in slots {
            if remaining == 0 {
                break;
            }
            let Some(mut state) = slot.lock_live().await else {
                continue;
            };
            let spare = keep
                .filter(|(type_name, _)| *type_name == slot.name())
                .map(|(_, id)| id);
            let eviction = self.eviction.reclaim(&mut state, slot.name(), remaining, spare);
            slot.publish(&state);
            drop(state);

            self.reap(slot.name(), eviction).await;
            remaining = missing(self.registry.total_usage());
        }

        if remaining > 0 {
            return Err(CoreError::InsufficientSpace(format!(
                "{} bytes do not fit in the total cache space {} ({} in use)",
                needed,
                total,
                self.registry.total_usage()
            )));
        }
        Ok(())
    }

    /// Delete evicted objects' files
    async fn reap(&self, type_name: &str, eviction: Eviction) {
        for path_name in &eviction.expired {
            counter!("filecache_objects_expired_total").increment(1);
            info!(
                "Expired subscribed object {} in '{}', kept until released",
                path_name, type_name
            );
        }

        for EvictedObject { object, guard } in eviction.victims {
            if let Err(e) = self.storage.delete(&object.path).await {
                warn!("Failed to delete evicted object {:?}: {}", object.path, e);
            }
            drop(guard);

            counter!("filecache_objects_evicted_total").increment(1);
            info!(
                "Evicted {} from '{}' ({} bytes)",
                object.path_name(),
                type_name,
                object.size
            );
        }
    }
}

fn check_fits(type_name: &str, params: &TypeParams, size: u64) -> Result<(), CoreError> {
    if size > params.hi_watermark {
        return Err(CoreError::InsufficientSpace(format!(
            "{} bytes exceed the hiWatermark {} of '{}'",
            size, params.hi_watermark, type_name
        )));
    }
    Ok(())
}

fn not_found(path_name: &str) -> CoreError {
    CoreError::ObjectNotFound(path_name.to_string())
}

/// Spawn a background task that runs cache maintenance periodically
pub fn spawn_maintenance_task(
    cache: Arc<CacheManager>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    use tokio::time::interval;

    info!(
        "Starting background cache maintenance task (interval: {} seconds)",
        interval_secs
    );

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match cache.run_maintenance().await {
                Ok(report) => {
                    if report.dropped_objects > 0 || report.oversized_objects > 0 {
                        info!(
                            "Scheduled maintenance dropped {} vanished and {} oversized objects",
                            report.dropped_objects, report.oversized_objects
                        );
                    }
                }
                Err(e) => {
                    warn!("Error during scheduled maintenance: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::CacheEvent;
    use async_trait::async_trait;
    use filecache_storage::{LocalObjectStore, ScannedType, TypeRecord};
    use std::collections::HashSet;
    use tempfile::TempDir;

    const MB: i64 = 1024 * 1024;

    fn test_config(dir: &TempDir, total_cache_space: u64) -> CacheConfig {
        CacheConfig {
            total_cache_space,
            eviction_policy: EvictionPolicy::Lru,
            default_download_dir: dir.path().join("downloads"),
            copy_timeout: Duration::from_secs(30),
        }
    }

    async fn open_with_total(dir: &TempDir, total_cache_space: u64) -> CacheManager {
        let storage = LocalObjectStore::new(dir.path().join("cache")).await.unwrap();
        CacheManager::open(Arc::new(storage), test_config(dir, total_cache_space))
            .await
            .unwrap()
    }

    async fn open_manager(dir: &TempDir) -> CacheManager {
        open_with_total(dir, 1 << 30).await
    }

    /// Local store whose type directories cannot be removed
    struct StuckTypeDirs(LocalObjectStore);

    #[async_trait]
    impl ObjectStore for StuckTypeDirs {
        fn base_dir(&self) -> &Path {
            self.0.base_dir()
        }

        async fn allocate(
            &self,
            type_name: &str,
            id: ObjectId,
            file_name: &str,
        ) -> Result<PathBuf, StorageError> {
            self.0.allocate(type_name, id, file_name).await
        }

        async fn object_len(&self, path: &Path) -> Result<u64, StorageError> {
            self.0.object_len(path).await
        }

        async fn copy_out(
            &self,
            source: &Path,
            destination: &Path,
            file_name: &str,
        ) -> Result<PathBuf, StorageError> {
            self.0.copy_out(source, destination, file_name).await
        }

        async fn delete(&self, path: &Path) -> Result<bool, StorageError> {
            self.0.delete(path).await
        }

        async fn save_type(&self, type_name: &str, record: &TypeRecord) -> Result<(), StorageError> {
            self.0.save_type(type_name, record).await
        }

        async fn remove_type(&self, _type_name: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only directory",
            )))
        }

        async fn scan(&self) -> Result<Vec<ScannedType>, StorageError> {
            self.0.scan().await
        }
    }

    async fn setup() -> (TempDir, CacheManager) {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir).await;
        (dir, manager)
    }

    async fn insert(manager: &CacheManager, type_name: &str, size: i64) -> String {
        manager
            .insert(type_name, "f.txt", size, false)
            .await
            .unwrap()
            .path_name
    }

    #[tokio::test]
    async fn test_insert_write_and_copy_out() {
        let (dir, manager) = setup().await;
        manager
            .define_type("cacheTestType", 102400, 409600, 0)
            .await
            .unwrap();

        let inserted = manager
            .insert("cacheTestType", "f.txt", 4096, true)
            .await
            .unwrap();
        assert!(inserted.subscription.is_some());
        std::fs::write(&inserted.path_name, b"file cache test bytes").unwrap();

        let destination = dir.path().join("tmp");
        let copied = manager
            .copy_object(&inserted.path_name, Some(&destination), None)
            .await
            .unwrap();

        assert_eq!(copied, destination.join("f.txt"));
        assert_eq!(std::fs::read(&copied).unwrap(), b"file cache test bytes");
    }

    #[tokio::test]
    async fn test_copy_unknown_object() {
        let (dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();

        let err = manager
            .copy_object("foo", Some(dir.path()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ObjectNotFound(_)));

        // Well formed but never inserted
        let never = manager.storage.object_path("docs", 4242, "f.txt");
        let err = manager
            .copy_object(never.to_str().unwrap(), Some(dir.path()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_copy_is_repeatable_and_keeps_source() {
        let (dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let path_name = insert(&manager, "docs", 10).await;
        std::fs::write(&path_name, b"0123456789").unwrap();

        let destination = dir.path().join("out");
        let first = manager
            .copy_object(&path_name, Some(&destination), None)
            .await
            .unwrap();
        let second = manager
            .copy_object(&path_name, Some(&destination), None)
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"0123456789");
        assert_eq!(manager.object_size(&path_name).await.unwrap(), 10);
        assert_eq!(manager.type_status("docs").unwrap().num_objects, 1);
    }

    #[tokio::test]
    async fn test_copy_defaults_and_renames() {
        let (dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let path_name = insert(&manager, "docs", 10).await;
        std::fs::write(&path_name, b"abc").unwrap();

        let copied = manager
            .copy_object(&path_name, None, Some("renamed.bin"))
            .await
            .unwrap();
        assert_eq!(copied, dir.path().join("downloads").join("renamed.bin"));

        let err = manager
            .copy_object(&path_name, None, Some("a/b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_eviction_drains_to_low_watermark() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 100, 300, 0).await.unwrap();

        let a = insert(&manager, "docs", 100).await;
        let b = insert(&manager, "docs", 100).await;
        let c = insert(&manager, "docs", 100).await;
        assert_eq!(manager.type_status("docs").unwrap().size, 300);

        let d = insert(&manager, "docs", 100).await;
        let status = manager.type_status("docs").unwrap();
        assert_eq!(status.size, 100);
        assert_eq!(status.num_objects, 1);

        for evicted in [&a, &b, &c] {
            assert!(matches!(
                manager.object_size(evicted).await,
                Err(CoreError::ObjectNotFound(_))
            ));
            assert!(!Path::new(evicted).exists());
        }
        assert_eq!(manager.object_size(&d).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_usage_never_exceeds_high_watermark() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 200, 500, 0).await.unwrap();

        for size in [120, 80, 300, 50, 200, 499, 10, 260] {
            insert(&manager, "docs", size).await;
            let status = manager.type_status("docs").unwrap();
            assert!(status.size <= 500, "usage {} above hi", status.size);
        }
    }

    #[tokio::test]
    async fn test_touch_protects_from_eviction() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 200, 300, 0).await.unwrap();

        let a = insert(&manager, "docs", 100).await;
        let b = insert(&manager, "docs", 100).await;
        let _c = insert(&manager, "docs", 100).await;
        manager.touch(&a).await.unwrap();

        insert(&manager, "docs", 100).await;
        assert!(manager.object_size(&a).await.is_ok());
        assert!(manager.object_size(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_subscriber_notified_on_eviction() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 150, 0).await.unwrap();

        let inserted = manager.insert("docs", "a.txt", 100, true).await.unwrap();
        let mut subscription = inserted.subscription.unwrap();
        let newer = insert(&manager, "docs", 100).await;

        let event = subscription.recv().await.unwrap();
        assert_eq!(
            event,
            CacheEvent::Evicted {
                path_name: inserted.path_name.clone(),
                type_name: "docs".to_string(),
            }
        );

        // Expired but pinned until the subscription goes
        assert_eq!(manager.object_size(&inserted.path_name).await.unwrap(), 100);
        assert!(Path::new(&inserted.path_name).exists());

        drop(subscription);
        let report = manager.run_maintenance().await.unwrap();
        assert_eq!(report.pruned_subscriptions, 1);
        assert_eq!(report.released_objects, 1);
        assert!(!Path::new(&inserted.path_name).exists());
        assert!(manager.object_size(&inserted.path_name).await.is_err());
        assert_eq!(manager.object_size(&newer).await.unwrap(), 100);
        assert_eq!(manager.type_status("docs").unwrap().size, 100);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_expired_object() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 150, 0).await.unwrap();

        let inserted = manager.insert("docs", "a.txt", 100, true).await.unwrap();
        let mut subscription = inserted.subscription.unwrap();
        insert(&manager, "docs", 100).await;
        assert!(Path::new(&inserted.path_name).exists());

        manager.subscribe(&inserted.path_name, false).await.unwrap();
        assert!(!Path::new(&inserted.path_name).exists());
        assert_eq!(manager.type_status("docs").unwrap().size, 100);

        // The event sent before the release is still delivered
        assert!(matches!(
            subscription.recv().await,
            Some(CacheEvent::Evicted { .. })
        ));
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn test_delete_ends_subscription() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let path_name = insert(&manager, "docs", 10).await;

        let mut subscription = manager.subscribe(&path_name, true).await.unwrap().unwrap();
        manager.delete_object(&path_name).await.unwrap();

        assert_eq!(subscription.recv().await, None);
        assert!(!Path::new(&path_name).exists());
        assert!(matches!(
            manager.delete_object(&path_name).await,
            Err(CoreError::ObjectNotFound(_))
        ));
        assert_eq!(manager.type_status("docs").unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_subscription() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let inserted = manager.insert("docs", "f", 10, true).await.unwrap();

        assert!(manager.subscribe(&inserted.path_name, false).await.unwrap().is_none());
        assert_eq!(inserted.subscription.unwrap().recv().await, None);
    }

    #[tokio::test]
    async fn test_delete_type_cascades() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let a = insert(&manager, "docs", 10).await;
        let b = insert(&manager, "docs", 20).await;

        assert_eq!(manager.delete_type("docs").await.unwrap(), 30);
        for path_name in [&a, &b] {
            assert!(matches!(
                manager.copy_object(path_name, None, None).await,
                Err(CoreError::ObjectNotFound(_))
            ));
            assert!(!Path::new(path_name).exists());
        }
        assert!(matches!(
            manager.describe_type("docs"),
            Err(CoreError::TypeNotFound(_))
        ));
        assert!(manager.type_names().is_empty());

        // Missing types delete as a no-op
        assert_eq!(manager.delete_type("docs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_type_outlives_directory_failure() {
        let dir = TempDir::new().unwrap();
        let storage = LocalObjectStore::new(dir.path().join("cache")).await.unwrap();
        let manager = CacheManager::open(
            Arc::new(StuckTypeDirs(storage)),
            test_config(&dir, 1 << 30),
        )
        .await
        .unwrap();
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let path_name = insert(&manager, "docs", 10).await;

        assert_eq!(manager.delete_type("docs").await.unwrap(), 10);
        assert!(manager.type_names().is_empty());
        assert!(!Path::new(&path_name).exists());

        manager.define_type("docs", 0, 500, 0).await.unwrap();
        assert_eq!(manager.describe_type("docs").unwrap().hi_watermark, 500);
        assert_eq!(manager.type_status("docs").unwrap().num_objects, 0);
    }

    #[tokio::test]
    async fn test_define_type_validation() {
        let (_dir, manager) = setup().await;

        for (lo, hi) in [(500, 400), (-1, 400), (0, -1)] {
            assert!(matches!(
                manager.define_type("docs", lo, hi, 0).await,
                Err(CoreError::InvalidArgument(_))
            ));
        }
        assert!(manager.define_type(".hidden", 0, 1, 0).await.is_err());
        assert!(manager.define_type(&"x".repeat(65), 0, 1, 0).await.is_err());
        assert!(manager.type_names().is_empty());
    }

    #[tokio::test]
    async fn test_define_type_respects_total_space() {
        let (_dir, manager) = setup().await;
        let total = manager.config().total_cache_space as i64;

        manager.define_type("big", total - 10, total, 0).await.unwrap();
        assert!(matches!(
            manager.define_type("other", 20, 100, 0).await,
            Err(CoreError::InsufficientSpace(_))
        ));
        manager.define_type("other", 10, 100, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_redefine_updates_and_evicts() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 100, 1000, 0).await.unwrap();
        for _ in 0..5 {
            insert(&manager, "docs", 100).await;
        }

        // Identical parameters change nothing
        manager.define_type("docs", 100, 1000, 0).await.unwrap();
        assert_eq!(manager.type_status("docs").unwrap().size, 500);

        manager.define_type("docs", 200, 400, 0).await.unwrap();
        let params = manager.describe_type("docs").unwrap();
        assert_eq!(params.hi_watermark, 400);
        assert_eq!(manager.type_status("docs").unwrap().size, 200);
    }

    #[tokio::test]
    async fn test_change_type_merges_parameters() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 100, 1000, 0).await.unwrap();

        manager.change_type("docs", None, None, Some(64)).await.unwrap();
        let params = manager.describe_type("docs").unwrap();
        assert_eq!(params.lo_watermark, 100);
        assert_eq!(params.hi_watermark, 1000);
        assert_eq!(params.default_size, 64);

        assert!(matches!(
            manager.change_type("docs", Some(2000), None, None).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.change_type("missing", None, None, None).await,
            Err(CoreError::TypeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_validation() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        manager.define_type("sized", 0, 1000, 256).await.unwrap();

        assert!(matches!(
            manager.insert("missing", "f", 10, false).await,
            Err(CoreError::TypeNotFound(_))
        ));
        assert!(matches!(
            manager.insert("docs", "f", 0, false).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.insert("docs", "f", -5, false).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.insert("docs", "a/b", 10, false).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.insert("docs", "f", 1001, false).await,
            Err(CoreError::InsufficientSpace(_))
        ));
        assert_eq!(manager.type_status("docs").unwrap().num_objects, 0);

        let path_name = insert(&manager, "sized", 0).await;
        assert_eq!(manager.object_size(&path_name).await.unwrap(), 256);
        assert_eq!(manager.object_file_name(&path_name).await.unwrap(), "f.txt");
    }

    #[tokio::test]
    async fn test_resize() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let path_name = insert(&manager, "docs", 100).await;
        std::fs::write(&path_name, vec![0u8; 50]).unwrap();

        assert_eq!(manager.resize(&path_name, 300).await.unwrap(), 300);
        assert_eq!(manager.type_status("docs").unwrap().size, 300);

        assert!(matches!(
            manager.resize(&path_name, 40).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.resize(&path_name, 0).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.resize(&path_name, 2000).await,
            Err(CoreError::InsufficientSpace(_))
        ));
        assert!(matches!(
            manager.resize("foo", 10).await,
            Err(CoreError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_status() {
        let (_dir, manager) = setup().await;
        manager.define_type("a", 1000, 4000, 0).await.unwrap();
        manager.define_type("b", 500, 4000, 0).await.unwrap();
        insert(&manager, "a", 300).await;
        insert(&manager, "b", 200).await;
        insert(&manager, "b", 100).await;

        let status = manager.cache_status();
        assert_eq!(status.num_types, 2);
        assert_eq!(status.num_objects, 3);
        assert_eq!(status.size, 600);
        assert_eq!(status.avail_space, 900);
        assert_eq!(manager.type_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_avail_space_floors_at_zero() {
        let (_dir, manager) = setup().await;
        manager.define_type("a", 100, 4000, 0).await.unwrap();
        insert(&manager, "a", 300).await;

        assert_eq!(manager.cache_status().avail_space, 0);
    }

    #[tokio::test]
    async fn test_restart_restores_state() {
        let dir = TempDir::new().unwrap();
        let (kept, transient) = {
            let manager = open_manager(&dir).await;
            manager.define_type("docs", 10, 1000, 0).await.unwrap();
            let kept = insert(&manager, "docs", 100).await;
            std::fs::write(&kept, b"persisted").unwrap();
            let transient = insert(&manager, "docs", 100).await;
            (kept, transient)
        };

        let manager = open_manager(&dir).await;
        let params = manager.describe_type("docs").unwrap();
        assert_eq!((params.lo_watermark, params.hi_watermark), (10, 1000));

        // Restored objects are charged their on-disk length
        assert_eq!(manager.object_size(&kept).await.unwrap(), 9);
        assert!(manager.object_size(&transient).await.is_err());
        assert!(!Path::new(&transient).exists());

        let fresh = insert(&manager, "docs", 5).await;
        let location = manager.storage.locate(&fresh).unwrap();
        let previous = manager.storage.locate(&transient).unwrap();
        assert!(location.id > previous.id);
    }

    #[tokio::test]
    async fn test_maintenance_tracks_files() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let written = insert(&manager, "docs", 10).await;
        let vanished = insert(&manager, "docs", 20).await;
        let abandoned = manager.insert("docs", "s", 30, true).await.unwrap();
        drop(abandoned.subscription);

        std::fs::write(&written, b"12345").unwrap();
        std::fs::remove_file(&vanished).unwrap();

        let report = manager.run_maintenance().await.unwrap();
        assert_eq!(report.newly_written, 1);
        assert_eq!(report.shrunk_objects, 1);
        assert_eq!(report.dropped_objects, 1);
        assert_eq!(report.pruned_subscriptions, 1);
        // The written object is charged its real length
        assert_eq!(manager.object_size(&written).await.unwrap(), 5);
        assert_eq!(manager.type_status("docs").unwrap().size, 35);

        let report = manager.run_maintenance().await.unwrap();
        assert_eq!(report, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_maintenance_removes_oversized_objects() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let oversized = insert(&manager, "docs", 4).await;
        let watched = manager.insert("docs", "w", 4, true).await.unwrap();
        std::fs::write(&oversized, b"0123456789").unwrap();
        std::fs::write(&watched.path_name, b"0123456789").unwrap();

        let report = manager.run_maintenance().await.unwrap();
        assert_eq!(report.oversized_objects, 1);
        assert!(!Path::new(&oversized).exists());
        assert!(manager.object_size(&oversized).await.is_err());

        // Subscribed objects may still be growing
        assert_eq!(manager.object_size(&watched.path_name).await.unwrap(), 4);

        drop(watched.subscription);
        let report = manager.run_maintenance().await.unwrap();
        assert_eq!(report.oversized_objects, 1);
        assert_eq!(manager.type_status("docs").unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_total_space_bounds_all_types() {
        let dir = TempDir::new().unwrap();
        let manager = open_with_total(&dir, 1000).await;
        manager.define_type("a", 0, 10000, 0).await.unwrap();
        manager.define_type("b", 0, 10000, 0).await.unwrap();

        for round in 0..6 {
            let type_name = if round % 2 == 0 { "a" } else { "b" };
            let path_name = insert(&manager, type_name, 400).await;
            assert_eq!(manager.object_size(&path_name).await.unwrap(), 400);

            let status = manager.cache_status();
            assert!(status.size <= 1000, "total usage {} above 1000", status.size);
        }

        let path_name = insert(&manager, "a", 300).await;
        manager.resize(&path_name, 900).await.unwrap();
        assert!(manager.cache_status().size <= 1000);
        assert_eq!(manager.object_size(&path_name).await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_total_space_exhausted_at_low_watermarks() {
        let dir = TempDir::new().unwrap();
        let manager = open_with_total(&dir, 1000).await;
        manager.define_type("a", 500, 1000, 0).await.unwrap();
        manager.define_type("b", 500, 1000, 0).await.unwrap();
        let kept = insert(&manager, "a", 500).await;
        insert(&manager, "b", 500).await;

        assert!(matches!(
            manager.insert("a", "f", 100, false).await,
            Err(CoreError::InsufficientSpace(_))
        ));
        assert!(matches!(
            manager.resize(&kept, 600).await,
            Err(CoreError::InsufficientSpace(_))
        ));
        assert_eq!(manager.cache_status().num_objects, 2);
        assert_eq!(manager.cache_status().size, 1000);
    }

    #[tokio::test]
    async fn test_relative_download_dir_made_absolute() {
        let dir = TempDir::new().unwrap();
        let storage = LocalObjectStore::new(dir.path().join("cache")).await.unwrap();
        let config = CacheConfig {
            default_download_dir: PathBuf::from("downloads"),
            ..test_config(&dir, 1 << 30)
        };
        let manager = CacheManager::open(Arc::new(storage), config).await.unwrap();

        let download_dir = &manager.config().default_download_dir;
        assert!(download_dir.is_absolute());
        assert_eq!(
            *download_dir,
            std::env::current_dir().unwrap().join("downloads")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_copies_and_inserts() {
        let (dir, manager) = setup().await;
        let manager = Arc::new(manager);
        manager.define_type("docs", 0, 1 << 20, 0).await.unwrap();
        let source = insert(&manager, "docs", 10).await;
        std::fs::write(&source, b"0123456789").unwrap();

        let destination = dir.path().join("out");
        let copies: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let source = source.clone();
                let destination = destination.clone();
                tokio::spawn(async move {
                    manager.copy_object(&source, Some(&destination), None).await
                })
            })
            .collect();

        let mut copied = HashSet::new();
        for copy in copies {
            let path = copy.await.unwrap().unwrap();
            assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
            copied.insert(path);
        }
        assert_eq!(copied.len(), 8);

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let path_name = manager
                        .insert("docs", "f.bin", 100, false)
                        .await
                        .unwrap()
                        .path_name;
                    if i % 2 == 0 {
                        manager.delete_object(&path_name).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let status = manager.type_status("docs").unwrap();
        assert_eq!(status.num_objects, 9);
        assert_eq!(status.size, 810);
    }

    #[tokio::test]
    async fn test_shutdown_removes_transient_objects() {
        let (_dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let written = insert(&manager, "docs", 10).await;
        std::fs::write(&written, b"x").unwrap();
        let transient = manager.insert("docs", "t", 10, true).await.unwrap();

        assert_eq!(manager.shutdown().await.unwrap(), 1);
        assert!(Path::new(&written).exists());
        assert!(!Path::new(&transient.path_name).exists());
        assert_eq!(transient.subscription.unwrap().recv().await, None);
    }

    #[tokio::test]
    async fn test_copy_to_file_destination() {
        let (dir, manager) = setup().await;
        manager.define_type("docs", 0, 1000, 0).await.unwrap();
        let path_name = insert(&manager, "docs", 10).await;
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        assert!(matches!(
            manager.copy_object(&path_name, Some(&file), None).await,
            Err(CoreError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_large_objects_within_quota() {
        let (_dir, manager) = setup().await;
        manager.define_type("big", MB, 4 * MB, 0).await.unwrap();

        for _ in 0..6 {
            insert(&manager, "big", MB).await;
        }
        let status = manager.type_status("big").unwrap();
        assert!(status.size <= 4 * MB as u64);
        assert!(status.size >= MB as u64);
    }
}
