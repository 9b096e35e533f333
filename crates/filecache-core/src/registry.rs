//! Type registry and per-type cache state

use filecache_storage::{ObjectId, ObjectLocation, TypeRecord};
use metrics::gauge;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard, mpsc};

use crate::error::CoreError;
use crate::subscription::CacheEvent;

/// Watermark configuration of a cache type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeParams {
    pub lo_watermark: u64,
    pub hi_watermark: u64,
    pub default_size: u64,
}

impl TypeParams {
    /// Build parameters from wire values, rejecting negative values and
    /// `lo_watermark > hi_watermark`
    pub fn new(lo_watermark: i64, hi_watermark: i64, default_size: i64) -> Result<Self, CoreError> {
        let non_negative = |value: i64, what: &str| {
            u64::try_from(value)
                .map_err(|_| CoreError::InvalidArgument(format!("{} must not be negative", what)))
        };

        let params = Self {
            lo_watermark: non_negative(lo_watermark, "loWatermark")?,
            hi_watermark: non_negative(hi_watermark, "hiWatermark")?,
            default_size: non_negative(default_size, "size")?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.lo_watermark > self.hi_watermark {
            return Err(CoreError::InvalidArgument(format!(
                "loWatermark {} exceeds hiWatermark {}",
                self.lo_watermark, self.hi_watermark
            )));
        }
        if self.default_size > self.hi_watermark {
            return Err(CoreError::InvalidArgument(format!(
                "default size {} exceeds hiWatermark {}",
                self.default_size, self.hi_watermark
            )));
        }
        Ok(())
    }

    pub fn record(&self) -> TypeRecord {
        TypeRecord {
            lo_watermark: self.lo_watermark,
            hi_watermark: self.hi_watermark,
            default_size: self.default_size,
        }
    }
}

impl From<TypeRecord> for TypeParams {
    fn from(record: TypeRecord) -> Self {
        Self {
            lo_watermark: record.lo_watermark,
            hi_watermark: record.hi_watermark,
            default_size: record.default_size,
        }
    }
}

/// A live cached object
#[derive(Debug)]
pub struct CacheObject {
    pub id: ObjectId,
    pub file_name: String,
    pub path: PathBuf,
    /// Declared size, the amount charged against the type
    pub size: u64,
    /// Whether bytes have been observed in the backing file
    pub written: bool,
    pub inserted_seq: u64,
    pub last_touch: u64,
    pub access_count: u64,
    /// Chosen for eviction while subscribed; reclaimed once released
    pub expired: bool,
    pub subscribers: Vec<mpsc::Sender<CacheEvent>>,
    /// Held shared by in-flight copies; eviction and deletion need it exclusive
    pub pin: Arc<tokio::sync::RwLock<()>>,
}

impl CacheObject {
    pub fn new(id: ObjectId, file_name: String, path: PathBuf, size: u64, seq: u64) -> Self {
        Self {
            id,
            file_name,
            path,
            size,
            written: false,
            inserted_seq: seq,
            last_touch: seq,
            access_count: 0,
            expired: false,
            subscribers: Vec::new(),
            pin: Arc::new(tokio::sync::RwLock::new(())),
        }
    }

    pub fn path_name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribers.iter().any(|s| !s.is_closed())
    }

    /// Drop subscriptions whose receiver is gone, returning how many
    pub fn prune_subscribers(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| !s.is_closed());
        before - self.subscribers.len()
    }

    /// Deliver `event` to every open subscription
    pub fn notify(&mut self, event: &CacheEvent) -> usize {
        self.subscribers
            .iter()
            .filter(|s| s.try_send(event.clone()).is_ok())
            .count()
    }
}

/// Mutable state of one cache type, guarded by the type's lock
#[derive(Debug)]
pub struct CacheTypeState {
    pub params: TypeParams,
    pub objects: HashMap<ObjectId, CacheObject>,
    /// Sum of `size` over `objects`
    pub usage: u64,
    /// Set once the type is deleted; holders of a stale slot must bail out
    pub deleted: bool,
    clock: u64,
}

impl CacheTypeState {
    pub fn new(params: TypeParams) -> Self {
        Self {
            params,
            objects: HashMap::new(),
            usage: 0,
            deleted: false,
            clock: 0,
        }
    }

    /// Advance the recency clock
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn insert(&mut self, object: CacheObject) {
        self.usage += object.size;
        if let Some(replaced) = self.objects.insert(object.id, object) {
            self.usage -= replaced.size;
        }
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<CacheObject> {
        let object = self.objects.remove(&id)?;
        self.usage -= object.size;
        Some(object)
    }

    /// Remove every object, leaving usage at zero
    pub fn drain(&mut self) -> Vec<CacheObject> {
        self.usage = 0;
        self.objects.drain().map(|(_, object)| object).collect()
    }

    /// Find the object a decoded path name refers to
    pub fn find(&self, location: &ObjectLocation) -> Option<&CacheObject> {
        self.objects
            .get(&location.id)
            .filter(|o| o.file_name == location.file_name)
    }

    pub fn find_mut(&mut self, location: &ObjectLocation) -> Option<&mut CacheObject> {
        self.objects
            .get_mut(&location.id)
            .filter(|o| o.file_name == location.file_name)
    }

    /// Mark an object as recently used
    pub fn touch(&mut self, id: ObjectId) -> bool {
        let now = self.tick();
        match self.objects.get_mut(&id) {
            Some(object) => {
                object.last_touch = now;
                object.access_count += 1;
                true
            }
            None => false,
        }
    }

    /// Change the declared size of an object
    pub fn resize(&mut self, id: ObjectId, new_size: u64) -> bool {
        match self.objects.get_mut(&id) {
            Some(object) => {
                self.usage = self.usage - object.size + new_size;
                object.size = new_size;
                true
            }
            None => false,
        }
    }

    /// Recompute usage from the object set
    pub fn computed_usage(&self) -> u64 {
        self.objects.values().map(|o| o.size).sum()
    }
}

/// Registry entry of a cache type
///
/// The mutex serializes every mutation of the type. The atomics mirror
/// usage and object count for lock-free, eventually consistent reporting.
pub struct TypeSlot {
    name: String,
    state: Mutex<CacheTypeState>,
    params: RwLock<TypeParams>,
    usage: AtomicU64,
    count: AtomicU64,
}

impl TypeSlot {
    pub fn new(name: impl Into<String>, state: CacheTypeState) -> Self {
        let name = name.into();
        gauge!("filecache_type_usage_bytes", "type" => name.clone()).set(state.usage as f64);

        Self {
            name,
            params: RwLock::new(state.params),
            usage: AtomicU64::new(state.usage),
            count: AtomicU64::new(state.objects.len() as u64),
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, CacheTypeState> {
        self.state.lock().await
    }

    /// Lock the state unless the type has been deleted meanwhile
    pub async fn lock_live(&self) -> Option<MutexGuard<'_, CacheTypeState>> {
        let guard = self.state.lock().await;
        if guard.deleted { None } else { Some(guard) }
    }

    /// Mirror the locked state into the reporting counters
    pub fn publish(&self, state: &CacheTypeState) {
        debug_assert_eq!(state.usage, state.computed_usage());

        *self.params.write() = state.params;
        self.usage.store(state.usage, Ordering::Release);
        self.count
            .store(state.objects.len() as u64, Ordering::Release);
        gauge!("filecache_type_usage_bytes", "type" => self.name.clone()).set(state.usage as f64);
    }

    pub fn params(&self) -> TypeParams {
        *self.params.read()
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn object_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Name to type mapping
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<String, Arc<TypeSlot>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<TypeSlot>> {
        self.types.read().get(name).cloned()
    }

    pub fn insert(&self, slot: TypeSlot) -> Arc<TypeSlot> {
        let slot = Arc::new(slot);
        self.types
            .write()
            .insert(slot.name().to_string(), slot.clone());
        slot
    }

    pub fn remove(&self, name: &str) -> Option<Arc<TypeSlot>> {
        self.types.write().remove(name)
    }

    /// Type names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn slots(&self) -> Vec<Arc<TypeSlot>> {
        let mut slots: Vec<Arc<TypeSlot>> = self.types.read().values().cloned().collect();
        slots.sort_by(|a, b| a.name().cmp(b.name()));
        slots
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Bytes charged across all types
    pub fn total_usage(&self) -> u64 {
        self.types.read().values().map(|slot| slot.usage()).sum()
    }

    /// Sum of low watermarks, optionally leaving one type out
    pub fn total_lo_watermark(&self, except: Option<&str>) -> u64 {
        self.types
            .read()
            .values()
            .filter(|slot| Some(slot.name()) != except)
            .map(|slot| slot.params().lo_watermark)
            .sum()
    }
}
