//! Opaque asset names and declared media types.
//!
//! Stored objects are named by a 256-bit random identifier, base64url encoded
//! without padding, followed by an extension taken from the declared media
//! type (`video/mp4` → `.mp4`).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// Number of random bytes in an asset identifier.
const ID_BYTES: usize = 32;

/// Extension used when a media type has no usable subtype.
const FALLBACK_EXTENSION: &str = ".bin";

/// Errors parsing a declared `Content-Type`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaTypeError {
    #[error("Missing media type")]
    Missing,

    #[error("Malformed media type: {0}")]
    Malformed(String),
}

/// A declared media type with parameters stripped, lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType(String);

impl MediaType {
    /// Parse a `Content-Type` header value such as `video/mp4; codecs="avc1"`.
    pub fn parse(header: &str) -> Result<Self, MediaTypeError> {
        let essence = header.split(';').next().unwrap_or_default().trim();
        if essence.is_empty() {
            return Err(MediaTypeError::Missing);
        }

        let (kind, subtype) = essence
            .split_once('/')
            .ok_or_else(|| MediaTypeError::Malformed(header.to_string()))?;

        let valid_token = |s: &str| {
            !s.is_empty()
                && s.chars().all(|c| {
                    c.is_ascii_alphanumeric() || matches!(c, '!' | '#' | '$' | '&' | '-' | '^' | '_' | '.' | '+')
                })
        };
        if !valid_token(kind) || !valid_token(subtype) {
            return Err(MediaTypeError::Malformed(header.to_string()));
        }

        Ok(Self(essence.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File extension for a media type: `type/subtype` → `.subtype`.
///
/// Anything without exactly one `/` yields `.bin` so an unusual header never
/// blocks an upload on its own.
pub fn media_type_extension(media_type: &str) -> String {
    let parts: Vec<&str> = media_type.split('/').collect();
    match parts.as_slice() {
        [_, subtype] if !subtype.is_empty() => format!(".{}", subtype),
        _ => FALLBACK_EXTENSION.to_string(),
    }
}

/// Generates collision-resistant file names for stored assets
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetNamer;

impl AssetNamer {
    pub fn new() -> Self {
        Self
    }

    /// Random URL-safe identifier.
    ///
    /// # Panics
    ///
    /// Panics if the operating system entropy source is unavailable. That is a
    /// broken host, not a request failure.
    pub fn generate_id(&self) -> String {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Identifier plus the extension derived from `media_type`.
    pub fn file_name(&self, media_type: &str) -> String {
        format!("{}{}", self.generate_id(), media_type_extension(media_type))
    }
}
