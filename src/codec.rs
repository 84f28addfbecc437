//! Key and value codecs.
//!
//! A codec turns a key or value into bytes for the record envelope and back.
//! Codecs are looked up by [`Codec::name`] when a record is recovered, so the
//! name written to disk must stay stable across releases.

use crate::error::{PersistError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Serializes values of type `T` to bytes and back.
pub trait Codec<T>: Send + Sync {
    /// Stable name recorded in every envelope this codec writes.
    fn name(&self) -> &str;

    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec for any serde type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const NAME: &'static str = "json";
}

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        Self::NAME
    }

    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| PersistError::codec(Self::NAME, e))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| PersistError::codec(Self::NAME, e))
    }
}

/// Passes raw byte keys and values through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesCodec;

impl RawBytesCodec {
    pub const NAME: &'static str = "raw";
}

impl Codec<Bytes> for RawBytesCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn serialize(&self, value: &Bytes) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Utf8Codec {
    pub const NAME: &'static str = "utf8";
}

impl Codec<String> for Utf8Codec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn serialize(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| PersistError::codec(Self::NAME, e))
    }
}

/// Codecs for one type, resolved by name.
///
/// The first codec added is the primary one: it is used for every record the
/// engine writes. Additional codecs are only consulted when recovering
/// records written under a different name.
pub struct CodecSet<T> {
    primary: Arc<dyn Codec<T>>,
    by_name: HashMap<String, Arc<dyn Codec<T>>>,
}

impl<T> CodecSet<T> {
    pub fn new(primary: Arc<dyn Codec<T>>) -> Self {
        let mut by_name = HashMap::new();
        by_name.insert(primary.name().to_string(), Arc::clone(&primary));
        Self { primary, by_name }
    }

    /// Registers an additional codec for recovery. A codec with the same
    /// name as the primary does not replace it.
    pub fn register(&mut self, codec: Arc<dyn Codec<T>>) {
        if codec.name() != self.primary.name() {
            self.by_name.insert(codec.name().to_string(), codec);
        }
    }

    pub fn primary(&self) -> &Arc<dyn Codec<T>> {
        &self.primary
    }

    /// Looks a codec up by the name recorded on disk.
    pub fn resolve(&self, name: &str) -> Result<&Arc<dyn Codec<T>>> {
        self.by_name
            .get(name)
            .ok_or_else(|| PersistError::CodecNotFound(name.to_string()))
    }
}

impl<T> fmt::Debug for CodecSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("CodecSet")
            .field("primary", &self.primary.name())
            .field("codecs", &names)
            .finish()
    }
}
