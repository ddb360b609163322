//! Logical keys.
//!
//! A [`Key`] is an opaque byte string. Keys order lexicographically, which is
//! the order the storage engine and every cursor in this workspace rely on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An owned logical key.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

/// The smallest possible key.
pub const KEY_MIN: &[u8] = b"";

/// A key that sorts after every user key.
pub const KEY_MAX: &[u8] = b"\xff\xff";

impl Key {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    /// The minimum key.
    pub fn min() -> Self {
        Key(KEY_MIN.to_vec())
    }

    /// The maximum key.
    pub fn max() -> Self {
        Key(KEY_MAX.to_vec())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the key, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest key strictly greater than this one.
    pub fn next(&self) -> Key {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(&self.0);
        bytes.push(0);
        Key(bytes)
    }

    /// The first key that does not have this key as a prefix.
    ///
    /// Trailing `0xff` bytes are dropped before incrementing. A key made only
    /// of `0xff` bytes (or the empty key) has no such successor and maps to
    /// [`KEY_MAX`].
    pub fn prefix_end(&self) -> Key {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.pop() {
            if last < 0xff {
                bytes.push(last + 1);
                return Key(bytes);
            }
        }
        Key::max()
    }

    /// Whether this key is a prefix of `other`.
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Concatenate a suffix onto this key.
    pub fn join(&self, suffix: &[u8]) -> Key {
        let mut bytes = Vec::with_capacity(self.0.len() + suffix.len());
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(suffix);
        Key(bytes)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key(b.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key(b)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(\"{}\")", self)
    }
}
