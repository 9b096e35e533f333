//! FileCache Storage Layer
//!
//! This crate owns the bytes of cached objects on the backing filesystem:
//! allocation of object files, atomic copy-out to caller destinations,
//! deletion, and persistence of per-type configuration records.

pub mod backend;
pub mod error;
pub mod local;

pub use backend::{
    ObjectId, ObjectLocation, ObjectStore, ScannedObject, ScannedType, TypeRecord,
    split_file_name,
};
pub use error::StorageError;
pub use local::LocalObjectStore;
