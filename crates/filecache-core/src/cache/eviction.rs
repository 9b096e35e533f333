//! Watermark driven eviction

use filecache_storage::ObjectId;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;

use super::policy::EvictionPolicy;
use crate::registry::{CacheObject, CacheTypeState};
use crate::subscription::CacheEvent;

/// An object removed from its type, still holding its pin exclusively
/// until the backing file is gone
pub struct EvictedObject {
    pub object: CacheObject,
    pub guard: OwnedRwLockWriteGuard<()>,
}

/// Sort key of an eviction candidate, victims first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: ObjectId,
    pub inserted_seq: u64,
    pub last_touch: u64,
    pub access_count: u64,
}

impl From<&CacheObject> for Candidate {
    fn from(object: &CacheObject) -> Self {
        Self {
            id: object.id,
            inserted_seq: object.inserted_seq,
            last_touch: object.last_touch,
            access_count: object.access_count,
        }
    }
}

/// Sort candidates so that the first one is evicted first
pub fn order_candidates(policy: EvictionPolicy, candidates: &mut [Candidate]) {
    match policy {
        EvictionPolicy::Lru => candidates.sort_by_key(|c| (c.last_touch, c.id)),
        EvictionPolicy::Fifo => candidates.sort_by_key(|c| (c.inserted_seq, c.id)),
        EvictionPolicy::Lfu => candidates.sort_by_key(|c| (c.access_count, c.last_touch, c.id)),
    }
}

/// Outcome of an eviction pass
#[derive(Default)]
pub struct Eviction {
    /// Objects removed from the type whose files must go
    pub victims: Vec<EvictedObject>,
    /// Path names of subscribed objects marked expired and notified
    pub expired: Vec<String>,
}

/// Eviction engine
///
/// Runs under the type lock of the state it is handed. When usage is
/// above the high watermark it removes objects in policy order until
/// usage is at or below the low watermark or no evictable object is
/// left. Objects pinned by an in-flight copy are skipped. Subscribed
/// objects are marked expired and notified instead of removed; they are
/// reclaimed by a later pass once their subscriptions are gone.
#[derive(Debug, Clone, Copy)]
pub struct EvictionEngine {
    policy: EvictionPolicy,
}

impl EvictionEngine {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    /// Enforce the watermarks of `state`, sparing `keep`
    ///
    /// The caller deletes the victims' files.
    pub fn select(
        &self,
        state: &mut CacheTypeState,
        type_name: &str,
        keep: Option<ObjectId>,
    ) -> Eviction {
        let mut eviction = Eviction {
            victims: release_expired(state),
            expired: Vec::new(),
        };

        let params = state.params;
        if state.usage <= params.hi_watermark {
            return eviction;
        }

        debug!(
            "Type '{}' usage {} above high watermark {}, draining to {}",
            type_name, state.usage, params.hi_watermark, params.lo_watermark
        );
        self.drain(state, type_name, keep, u64::MAX, &mut eviction);
        eviction
    }

    /// Free up to `needed` bytes from `state` for use by another insert,
    /// never going below the low watermark
    pub fn reclaim(
        &self,
        state: &mut CacheTypeState,
        type_name: &str,
        needed: u64,
        keep: Option<ObjectId>,
    ) -> Eviction {
        let mut eviction = Eviction {
            victims: release_expired(state),
            expired: Vec::new(),
        };

        let released: u64 = eviction.victims.iter().map(|v| v.object.size).sum();
        if released < needed {
            self.drain(state, type_name, keep, needed - released, &mut eviction);
        }
        eviction
    }

    fn drain(
        &self,
        state: &mut CacheTypeState,
        type_name: &str,
        keep: Option<ObjectId>,
        budget: u64,
        eviction: &mut Eviction,
    ) {
        let lo_watermark = state.params.lo_watermark;

        let mut candidates: Vec<Candidate> = state
            .objects
            .values()
            .filter(|o| Some(o.id) != keep && !o.expired)
            .map(Candidate::from)
            .collect();
        order_candidates(self.policy, &mut candidates);

        let mut freed = 0u64;
        for candidate in candidates {
            if state.usage <= lo_watermark || freed >= budget {
                break;
            }

            let Some(object) = state.objects.get_mut(&candidate.id) else {
                continue;
            };

            if object.is_subscribed() {
                object.expired = true;
                let path_name = object.path_name();
                let event = CacheEvent::Evicted {
                    path_name: path_name.clone(),
                    type_name: type_name.to_string(),
                };
                let notified = object.notify(&event);
                debug!(
                    "Expiring subscribed object {} ({} subscribers notified)",
                    path_name, notified
                );
                eviction.expired.push(path_name);
                continue;
            }

            let Ok(guard) = object.pin.clone().try_write_owned() else {
                debug!("Skipping pinned object {}", candidate.id);
                continue;
            };

            if let Some(object) = state.remove(candidate.id) {
                freed += object.size;
                eviction.victims.push(EvictedObject { object, guard });
            }
        }
    }
}

/// Remove expired objects nobody subscribes to anymore
fn release_expired(state: &mut CacheTypeState) -> Vec<EvictedObject> {
    let released: Vec<ObjectId> = state
        .objects
        .values()
        .filter(|o| o.expired && !o.is_subscribed())
        .map(|o| o.id)
        .collect();

    let mut victims = Vec::new();
    for id in released {
        let Some(guard) = state
            .objects
            .get(&id)
            .and_then(|o| o.pin.clone().try_write_owned().ok())
        else {
            continue;
        };
        if let Some(object) = state.remove(id) {
            victims.push(EvictedObject { object, guard });
        }
    }
    victims
}
