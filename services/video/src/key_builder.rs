use crate::inspector::Orientation;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Asset file name is empty")]
    EmptyFileName,

    #[error("Asset file name contains a path separator: {0}")]
    NestedFileName(String),
}

/// Object key of an uploaded video: `<orientation>/<file name>`.
///
/// Never renamed once the upload succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the object key for an inspected asset.
pub fn build_key(orientation: Orientation, file_name: &str) -> Result<StorageKey, KeyError> {
    if file_name.is_empty() {
        return Err(KeyError::EmptyFileName);
    }
    if file_name.contains('/') {
        return Err(KeyError::NestedFileName(file_name.to_string()));
    }

    Ok(StorageKey(format!("{}/{}", orientation.as_str(), file_name)))
}
