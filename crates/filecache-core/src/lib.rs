//! FileCache Core Business Logic
//!
//! This crate provides the core functionality of the file cache service:
//! the type registry, eviction, the cache manager facade and eviction
//! subscriptions.

pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod subscription;

pub use cache::{
    CacheConfig, CacheManager, CacheStatus, EvictionEngine, EvictionPolicy, InsertedObject,
    MaintenanceReport, TypeStatus, spawn_maintenance_task,
};
pub use config::{MAX_TYPE_NAME_LEN, TypeDefinition, validate_file_name, validate_type_name};
pub use error::CoreError;
pub use registry::{TypeParams, TypeRegistry};
pub use subscription::{CacheEvent, Subscription};
