//! Key identity.
//!
//! A [`KeyIdentity`] is the token the registry is keyed by. It wraps the
//! codec-serialized form of an application key together with a 64-bit hash
//! of those bytes.
//!
//! ## Collision acceptance
//!
//! Equality is decided by the hash alone: two keys whose byte forms hash to
//! the same value are the same registry entry. This keeps comparisons cheap
//! and is an accepted trade-off at the scale the engine targets. Ordering
//! falls back to a lexicographic comparison of the bytes when hashes differ
//! and is only used for similar-key lookups.

use crate::codec::Codec;
use crate::error::Result;
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Hashable, comparable token derived from an application key.
#[derive(Clone)]
pub struct KeyIdentity {
    bytes: Bytes,
    hash: u64,
}

impl KeyIdentity {
    /// Derives the identity of `key` through `codec`.
    pub fn of<K>(key: &K, codec: &dyn Codec<K>) -> Result<Self> {
        Ok(Self::from_bytes(codec.serialize(key)?))
    }

    /// Builds an identity straight from a key's byte form.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            bytes,
        }
    }

    #[inline]
    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True if this identity's bytes begin with `prefix`'s bytes.
    pub fn starts_with(&self, prefix: &KeyIdentity) -> bool {
        self.bytes.starts_with(&prefix.bytes)
    }

    /// Matches the byte form against a glob pattern.
    ///
    /// Supported patterns:
    /// - `*` matches everything
    /// - `h*llo` matches hello, hallo, hxllo
    /// - `h?llo` matches hello, hallo, but not hllo
    /// - `h[ae]llo` matches hello and hallo, but not hillo
    pub fn matches_glob(&self, pattern: &str) -> bool {
        glob_match(pattern, &self.bytes)
    }
}

/// Glob match of `text` against `pattern`, shared with the in-memory cache.
pub(crate) fn glob_match(pattern: &str, text: &[u8]) -> bool {
    GlobPattern::new(pattern).matches(text)
}

impl PartialEq for KeyIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for KeyIdentity {}

impl Hash for KeyIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl Ord for KeyIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.hash == other.hash {
            Ordering::Equal
        } else {
            self.bytes
                .cmp(&other.bytes)
                .then(self.hash.cmp(&other.hash))
        }
    }
}

impl PartialOrd for KeyIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIdentity")
            .field("key", &String::from_utf8_lossy(&self.bytes))
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// Simple glob pattern matcher over raw bytes.
struct GlobPattern<'a> {
    pattern: &'a [u8],
}

impl<'a> GlobPattern<'a> {
    fn new(pattern: &'a str) -> Self {
        Self {
            pattern: pattern.as_bytes(),
        }
    }

    fn matches(&self, text: &[u8]) -> bool {
        Self::matches_recursive(self.pattern, text)
    }

    fn matches_recursive(pattern: &[u8], text: &[u8]) -> bool {
        if pattern.is_empty() {
            return text.is_empty();
        }

        match pattern[0] {
            b'*' => (0..=text.len()).any(|i| Self::matches_recursive(&pattern[1..], &text[i..])),
            b'?' => !text.is_empty() && Self::matches_recursive(&pattern[1..], &text[1..]),
            b'[' => {
                if text.is_empty() {
                    return false;
                }

                let mut i = 1;
                let mut matched = false;
                let negate = pattern.get(1) == Some(&b'^');
                if negate {
                    i += 1;
                }

                while i < pattern.len() && pattern[i] != b']' {
                    if pattern[i] == text[0] {
                        matched = true;
                    }
                    // Ranges like [a-z]
                    if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
                        if text[0] >= pattern[i] && text[0] <= pattern[i + 2] {
                            matched = true;
                        }
                        i += 2;
                    }
                    i += 1;
                }

                if negate {
                    matched = !matched;
                }

                i < pattern.len() && matched && Self::matches_recursive(&pattern[i + 1..], &text[1..])
            }
            b'\\' => {
                pattern.len() > 1
                    && !text.is_empty()
                    && pattern[1] == text[0]
                    && Self::matches_recursive(&pattern[2..], &text[1..])
            }
            c => !text.is_empty() && c == text[0] && Self::matches_recursive(&pattern[1..], &text[1..]),
        }
    }
}
