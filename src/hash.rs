//! Content hashing used for node/task identity and change detection.
//!
//! [`Hash32`] is the stable fingerprint type threaded through the whole
//! crate: it identifies task bodies, dependency/product content, and is
//! the unit of comparison the change-detection engine (see [`crate::change`])
//! uses to decide whether a task is stale.
//!
//! Large files are treated specially to keep change detection fast without
//! giving up exactness for ordinary pipeline artifacts.

use std::fmt::Debug;
use std::path::Path;

use camino::Utf8Path;
use sha2::{Digest, Sha256};

/// Above this size a [`hash_path`] falls back to a `(len, mtime)`
/// fingerprint instead of hashing the full file contents. Hashing a few
/// hundred megabytes of pipeline data on every run would dominate the
/// runtime of an otherwise-cached build; this threshold keeps change
/// detection fast for typical pipeline artifacts while staying exact for
/// everything else.
pub const LARGE_FILE_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

/// A 32-byte SHA-256 content hash.
///
/// Used to fingerprint file contents, task bodies, and hashable in-memory
/// values. Two [`Hash32`] values are equal iff their inputs were
/// byte-identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl Hash32 {
    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Hash32(bytes))
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for Hash32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Hash32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex hash"))
    }
}

/// Hashes a byte buffer with SHA-256.
pub fn hash_bytes(buffer: impl AsRef<[u8]>) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(buffer.as_ref());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Hash32(bytes)
}

/// The outcome of hashing a file: either the exact content hash, or a
/// fallback fingerprint for files at or above [`LARGE_FILE_THRESHOLD_BYTES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFingerprint {
    Content(Hash32),
    SizeAndMtime { len: u64, mtime_nanos: i128 },
}

/// Hashes a file's contents, or falls back to `(len, mtime)` for very large
/// files. Returns `None` if the file does not exist.
pub fn hash_path(path: &Utf8Path) -> std::io::Result<Option<FileFingerprint>> {
    let meta = match std::fs::metadata(path.as_std_path()) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    if meta.len() >= LARGE_FILE_THRESHOLD_BYTES {
        let mtime_nanos = mtime_as_nanos(&meta);
        return Ok(Some(FileFingerprint::SizeAndMtime {
            len: meta.len(),
            mtime_nanos,
        }));
    }

    let bytes = std::fs::read(path.as_std_path())?;
    Ok(Some(FileFingerprint::Content(hash_bytes(bytes))))
}

fn mtime_as_nanos(meta: &std::fs::Metadata) -> i128 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0)
}

/// Extension point for hashing arbitrary in-memory values.
///
/// Scalars, tuples, vectors and maps of hashable leaves are covered by the
/// blanket impls below. Types that need custom, order-sensitive or partial
/// hashing (e.g. a struct with a "don't hash this field" exclusion) should
/// implement this trait directly. A [`crate::node::ValueNode`] whose payload
/// does not implement `HashValue` reports [`crate::node::NodeState::Random`]
/// ("always changed") rather than refusing to run.
pub trait HashValue {
    fn hash_value(&self) -> Hash32;
}

macro_rules! impl_hash_value_display {
    ($($ty:ty),*) => {
        $(
            impl HashValue for $ty {
                fn hash_value(&self) -> Hash32 {
                    hash_bytes(self.to_string())
                }
            }
        )*
    };
}

impl_hash_value_display!(bool, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128);

impl HashValue for f64 {
    fn hash_value(&self) -> Hash32 {
        // Hash the canonical printable form; NaN/−0.0 get no special
        // treatment since pipeline values are not expected to carry them.
        hash_bytes(format!("{self:?}"))
    }
}

impl HashValue for f32 {
    fn hash_value(&self) -> Hash32 {
        hash_bytes(format!("{self:?}"))
    }
}

impl HashValue for str {
    fn hash_value(&self) -> Hash32 {
        hash_bytes(self)
    }
}

impl HashValue for String {
    fn hash_value(&self) -> Hash32 {
        hash_bytes(self.as_bytes())
    }
}

impl HashValue for Path {
    fn hash_value(&self) -> Hash32 {
        hash_bytes(self.to_string_lossy().as_bytes())
    }
}

impl<T: HashValue> HashValue for Vec<T> {
    fn hash_value(&self) -> Hash32 {
        // Concatenation of leaf hashes in order; order matters for a list.
        let mut buf = Vec::with_capacity(self.len() * 32);
        for item in self {
            buf.extend_from_slice(item.hash_value().0.as_slice());
        }
        hash_bytes(buf)
    }
}

impl<T: HashValue> HashValue for Option<T> {
    fn hash_value(&self) -> Hash32 {
        match self {
            Some(value) => hash_bytes({
                let mut buf = vec![1u8];
                buf.extend_from_slice(value.hash_value().0.as_slice());
                buf
            }),
            None => hash_bytes([0u8]),
        }
    }
}

impl<T: HashValue> HashValue for std::collections::BTreeMap<String, T> {
    fn hash_value(&self) -> Hash32 {
        // BTreeMap iterates sorted by key, so insertion order never affects
        // the resulting hash.
        let mut buf = Vec::new();
        for (key, value) in self {
            buf.extend_from_slice(key.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.hash_value().0.as_slice());
        }
        hash_bytes(buf)
    }
}

/// Task-body hash: the function's source text combined with its markers'
/// canonical form. The source text and canonical marker string are supplied
/// by the frontend/task builder; this just combines them deterministically.
pub fn hash_task_body(source_text: &str, canonical_markers: &str) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(source_text.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_markers.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Hash32(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_bytes("hello"), hash_bytes("hello"));
        assert_ne!(hash_bytes("hello"), hash_bytes("world"));
    }

    #[test]
    fn hex_roundtrip() {
        let hash = hash_bytes("roundtrip");
        let hex = hash.to_hex();
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
    }

    #[test]
    fn vec_hash_value_is_order_sensitive() {
        let a = vec![1i32, 2, 3];
        let b = vec![3i32, 2, 1];
        assert_ne!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn map_hash_value_is_order_independent_of_insertion() {
        let mut a = std::collections::BTreeMap::new();
        a.insert("b".to_string(), 2i32);
        a.insert("a".to_string(), 1i32);

        let mut b = std::collections::BTreeMap::new();
        b.insert("a".to_string(), 1i32);
        b.insert("b".to_string(), 2i32);

        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn hash_path_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Utf8Path::from_path(dir.path()).unwrap().join("nope.txt");
        assert!(hash_path(&missing).unwrap().is_none());
    }

    #[test]
    fn hash_path_existing_file_is_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let fp = hash_path(&path).unwrap().unwrap();
        assert_eq!(fp, FileFingerprint::Content(hash_bytes("hello")));
    }
}
