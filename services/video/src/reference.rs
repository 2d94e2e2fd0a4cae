//! Persisted pointers to stored videos.
//!
//! Two textual forms are written to the metadata store:
//!
//! - `https://cdn.example/landscape/abc.mp4`: a direct URL, handed out as is
//! - `tubely-videos,landscape/abc.mp4`: a `bucket,key` marker, signed on read

use crate::config::{Config, DeliveryMode};
use crate::key_builder::StorageKey;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SEPARATOR: char = ',';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("Malformed storage reference {0:?}: expected a URL or a single bucket,key pair")]
    Malformed(String),

    #[error("Storage reference {0:?} has an empty bucket or key")]
    EmptyComponent(String),
}

/// Where a stored video lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageReference {
    /// Publicly reachable URL
    Direct(String),
    /// Private object that must be signed before use
    Composite { bucket: String, key: String },
}

impl StorageReference {
    pub fn composite(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        StorageReference::Composite {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Direct reference for `key` under a public distribution base URL.
    pub fn under_base_url(base_url: &str, key: &str) -> Self {
        StorageReference::Direct(format!("{}/{}", base_url.trim_end_matches('/'), key))
    }

    /// Parse a persisted reference. Absolute http(s) URLs are direct (commas
    /// in their query are fine); everything else must be exactly one
    /// `bucket,key` pair.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        if is_absolute_url(raw) {
            return Ok(StorageReference::Direct(raw.to_string()));
        }

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        match parts.as_slice() {
            [bucket, key] => {
                if bucket.is_empty() || key.is_empty() {
                    return Err(ReferenceError::EmptyComponent(raw.to_string()));
                }
                Ok(StorageReference::composite(*bucket, *key))
            }
            _ => Err(ReferenceError::Malformed(raw.to_string())),
        }
    }
}

/// `scheme://rest` with an http(s) scheme and a non-empty remainder.
fn is_absolute_url(candidate: &str) -> bool {
    let Some((scheme, rest)) = candidate.split_once("://") else {
        return false;
    };
    (scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("http"))
        && !rest.is_empty()
        && !rest.chars().any(char::is_whitespace)
}

impl FromStr for StorageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageReference::Direct(url) => f.write_str(url),
            StorageReference::Composite { bucket, key } => write!(f, "{}{}{}", bucket, SEPARATOR, key),
        }
    }
}

/// Which reference form is written after a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferencePolicy {
    /// `bucket,key`, signed on every read
    Signed { bucket: String },
    /// `<base_url>/<key>` behind a public distribution
    Cdn { base_url: String },
}

impl ReferencePolicy {
    pub fn from_config(config: &Config) -> Self {
        match (config.delivery.mode, config.delivery.cdn_base_url.as_deref()) {
            (DeliveryMode::Cdn, Some(base_url)) => ReferencePolicy::Cdn {
                base_url: base_url.to_string(),
            },
            _ => ReferencePolicy::Signed {
                bucket: config.s3.bucket.clone(),
            },
        }
    }

    pub fn reference_for(&self, key: &StorageKey) -> StorageReference {
        match self {
            ReferencePolicy::Signed { bucket } => StorageReference::composite(bucket.as_str(), key.as_str()),
            ReferencePolicy::Cdn { base_url } => StorageReference::under_base_url(base_url, key.as_str()),
        }
    }
}
