//! Cache management module

mod eviction;
mod manager;
mod policy;

pub use eviction::{EvictedObject, Eviction, EvictionEngine, order_candidates};
pub use manager::{
    CacheConfig, CacheManager, CacheStatus, InsertedObject, MaintenanceReport, TypeStatus,
    spawn_maintenance_task,
};
pub use policy::{EvictionPolicy, ParseEvictionPolicyError};
