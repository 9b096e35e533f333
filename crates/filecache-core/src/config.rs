//! Shared configuration types for cache types
//!
//! The service binary loads these from its TOML file and hands them to
//! the cache manager, which defines any that do not exist yet.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest accepted cache type name
pub const MAX_TYPE_NAME_LEN: usize = 64;

/// A cache type declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    /// Type name
    pub name: String,
    /// Usage eviction drains down to, in bytes
    pub lo_watermark: u64,
    /// Usage above which eviction starts, in bytes
    pub hi_watermark: u64,
    /// Size used for inserts that pass size 0
    #[serde(default)]
    pub default_size: u64,
}

/// Validate a cache type name
///
/// Names become directory names under the cache root, so they must be a
/// single, non-hidden path component.
pub fn validate_type_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::InvalidArgument(
            "type name must not be empty".to_string(),
        ));
    }

    if name.chars().count() > MAX_TYPE_NAME_LEN {
        return Err(CoreError::InvalidArgument(format!(
            "type name '{}' is longer than {} characters",
            name, MAX_TYPE_NAME_LEN
        )));
    }

    if name.starts_with('.') {
        return Err(CoreError::InvalidArgument(format!(
            "type name '{}' must not start with '.'",
            name
        )));
    }

    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(CoreError::InvalidArgument(format!(
            "type name '{}' contains a path separator",
            name
        )));
    }

    Ok(())
}

/// Validate a caller-supplied object file name
pub fn validate_file_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::InvalidArgument(
            "file name must not be empty".to_string(),
        ));
    }

    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(CoreError::InvalidArgument(format!(
            "invalid file name '{}'",
            name
        )));
    }

    Ok(())
}
