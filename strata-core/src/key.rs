//! Key addressing shared by the cache and the update broker.
//!
//! A [`StreamKey`] names a single mutable resource (an array or a table).
//! A [`CacheKey`] names one cached *representation* of a resource: the same
//! path fetched in two cache modes, or with different query parameters,
//! produces two distinct keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Path of a single mutable resource, e.g. `raw/scan_042/primary`.
///
/// Leading and trailing slashes are stripped. Empty segments, `.` and `..`
/// are rejected so two spellings can never address the same stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(path: impl AsRef<str>) -> Result<Self, ValidationError> {
        let raw = path.as_ref();
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(ValidationError::InvalidKey {
                key: raw.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(ValidationError::InvalidKey {
                    key: raw.to_string(),
                    reason: format!("invalid path segment {segment:?}"),
                });
            }
            if segment.chars().any(char::is_control) {
                return Err(ValidationError::InvalidKey {
                    key: raw.to_string(),
                    reason: "control characters are not allowed".to_string(),
                });
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StreamKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamKey> for String {
    fn from(key: StreamKey) -> Self {
        key.0
    }
}

/// Cache key for one representation of a resource.
///
/// # Binary Format
///
/// Every component is written as a big-endian `u32` length followed by its
/// UTF-8 bytes, in this order:
///
/// - mode (e.g. a media type such as `application/json`)
/// - resource path
/// - parameter count, then each `name`, `value` pair sorted by name
///
/// Length prefixes make the encoding injective: no two distinct keys encode
/// to the same bytes, whatever characters the components contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    mode: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(path: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            path: path.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a query parameter. Parameter order never affects the key.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.mode.len() + self.path.len());
        push_component(&mut out, self.mode.as_bytes());
        push_component(&mut out, self.path.as_bytes());
        out.extend_from_slice(&(self.params.len() as u32).to_be_bytes());
        for (name, value) in &self.params {
            push_component(&mut out, name.as_bytes());
            push_component(&mut out, value.as_bytes());
        }
        out
    }

    /// Decode a key previously produced by [`CacheKey::encode`].
    ///
    /// Returns `None` on truncated input, trailing bytes or invalid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut cursor = bytes;
        let mode = take_component(&mut cursor)?;
        let path = take_component(&mut cursor)?;
        let count = take_u32(&mut cursor)?;
        let mut params = BTreeMap::new();
        for _ in 0..count {
            let name = take_component(&mut cursor)?;
            let value = take_component(&mut cursor)?;
            params.insert(name, value);
        }
        if !cursor.is_empty() {
            return None;
        }
        Some(Self { mode, path, params })
    }

    /// Hex SHA-256 of the encoded key, safe to use as a file name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.path, self.mode)?;
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

fn push_component(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_u32(cursor: &mut &[u8]) -> Option<u32> {
    if cursor.len() < 4 {
        return None;
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Some(u32::from_be_bytes(head.try_into().ok()?))
}

fn take_component(cursor: &mut &[u8]) -> Option<String> {
    let len = take_u32(cursor)? as usize;
    if cursor.len() < len {
        return None;
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    String::from_utf8(head.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stream_key_normalises_slashes() {
        let key = StreamKey::new("/raw/scan_1/").expect("valid key");
        assert_eq!(key.as_str(), "raw/scan_1");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["raw", "scan_1"]);
    }

    #[test]
    fn test_stream_key_rejects_bad_paths() {
        assert!(StreamKey::new("").is_err());
        assert!(StreamKey::new("///").is_err());
        assert!(StreamKey::new("a//b").is_err());
        assert!(StreamKey::new("a/../b").is_err());
        assert!(StreamKey::new("a/\u{0}b").is_err());
    }

    #[test]
    fn test_stream_key_serde_validates() {
        let key: StreamKey = serde_json::from_str("\"x/y\"").expect("valid");
        assert_eq!(key.to_string(), "x/y");
        assert!(serde_json::from_str::<StreamKey>("\"a//b\"").is_err());
    }

    #[test]
    fn test_cache_key_param_order_irrelevant() {
        let a = CacheKey::new("x", "application/json")
            .with_param("slice", "0:10")
            .with_param("field", "a");
        let b = CacheKey::new("x", "application/json")
            .with_param("field", "a")
            .with_param("slice", "0:10");
        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_cache_key_mode_distinguishes() {
        let json = CacheKey::new("x", "application/json");
        let octet = CacheKey::new("x", "application/octet-stream");
        assert_ne!(json.encode(), octet.encode());
        assert_ne!(json.digest(), octet.digest());
    }

    #[test]
    fn test_cache_key_decode_rejects_garbage() {
        let key = CacheKey::new("x", "m").with_param("a", "b");
        let mut bytes = key.encode();
        assert_eq!(CacheKey::decode(&bytes), Some(key));
        bytes.push(0);
        assert_eq!(CacheKey::decode(&bytes), None);
        assert_eq!(CacheKey::decode(&[0, 0]), None);
    }

    #[test]
    fn test_cache_key_display() {
        let key = CacheKey::new("a/b", "text/csv").with_param("page", "2");
        assert_eq!(key.to_string(), "a/b[text/csv]?page=2");
    }

    proptest! {
        // Separator-like characters inside components must not collide.
        #[test]
        fn prop_distinct_keys_encode_distinctly(
            p1 in ".{0,12}", m1 in ".{0,6}", p2 in ".{0,12}", m2 in ".{0,6}",
        ) {
            let a = CacheKey::new(p1.clone(), m1.clone());
            let b = CacheKey::new(p2.clone(), m2.clone());
            prop_assert_eq!(a == b, a.encode() == b.encode());
        }
    }
}
