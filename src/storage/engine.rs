//! Sharded In-Memory Cache with a Persistence Overlay
//!
//! This module implements the in-memory side of cache-persist: a
//! thread-safe, concurrent HashMap with TTL (Time-To-Live) support. When a
//! [`PersistSolver`] is attached, every mutation is mirrored to disk, and
//! the engine is the [`ReloadHook`] that recovery replays entries into.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Instead of one big lock, we use multiple shards to reduce contention.
//! 2. **Lazy Expiry**: Keys are checked for expiry on access, plus an explicit `cleanup_expired`.
//! 3. **Mirror After Unlock**: Shard locks are released before the solver is called,
//!    so disk I/O never blocks readers of the same shard.
//! 4. **Reload Bypasses the Mirror**: Recovered entries are already on disk.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ set / expire / touch / delete / flush
//!                            ▼
//!                    ┌───────────────┐
//!                    │ PersistSolver │ (optional)
//!                    └───────────────┘
//! ```
//!
//! Keys are distributed across shards using a hash function.
//! This allows multiple threads to read/write different keys concurrently.

use crate::persistence::identity::glob_match;
use crate::persistence::recovery::ReloadHook;
use crate::persistence::solver::PersistSolver;
use crate::time::TimeUnit;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Number of shards for the storage engine.
/// More shards = less lock contention, but more memory overhead.
const NUM_SHARDS: usize = 64;

/// Represents a stored value with optional expiry time.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// Ttl the entry was stored with, restarted by `touch`
    pub ttl: Option<Duration>,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// When this entry was created
    pub created_at: Instant,
}

impl Entry {
    /// Creates a new entry without expiry.
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            ttl: None,
            expires_at: None,
            created_at: Instant::now(),
        }
    }

    /// Creates a new entry with a TTL.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            ttl: Some(ttl),
            expires_at: Some(now + ttl),
            created_at: now,
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }

    /// Remaining time to live, `None` for entries without expiry.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()))
    }
}

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

/// The in-memory cache.
///
/// # Example
///
/// ```
/// use cache_persist::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"));
/// assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("Ariz")));
///
/// engine.set_with_ttl(Bytes::from("session"), Bytes::from("abc123"), Duration::from_secs(60));
/// assert!(engine.pttl(&Bytes::from("session")).unwrap() > 0);
/// ```
pub struct StorageEngine {
    /// Sharded storage for reduced lock contention
    shards: Vec<Shard>,

    /// Mirrors mutations to disk when attached
    persist: Option<PersistSolver<Bytes, Bytes>>,

    key_count: AtomicU64,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
    reload_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("persistent", &self.persist.is_some())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates a purely in-memory engine.
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::new()).collect();

        Self {
            shards,
            persist: None,
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            reload_count: AtomicU64::new(0),
        }
    }

    /// Creates an engine whose mutations are mirrored through `solver`.
    pub fn with_persistence(solver: PersistSolver<Bytes, Bytes>) -> Self {
        Self {
            persist: Some(solver),
            ..Self::new()
        }
    }

    pub fn solver(&self) -> Option<&PersistSolver<Bytes, Bytes>> {
        self.persist.as_ref()
    }

    /// Determines which shard a key belongs to.
    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Inserts without touching the mirror. Returns true if the key is new.
    fn insert(&self, key: Bytes, entry: Entry) -> bool {
        let mut data = self.get_shard(&key).data.write();
        let is_new = data.insert(key, entry).is_none();
        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Sets a key-value pair without expiry.
    ///
    /// Returns `true` if a new key was created, `false` if an existing key was updated.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let is_new = self.insert(key.clone(), Entry::new(value.clone()));

        if let Some(solver) = &self.persist {
            solver.put(key, value, None, None);
        }
        is_new
    }

    /// Sets a key-value pair with a TTL.
    ///
    /// Returns `true` if a new key was created, `false` if an existing key was updated.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let is_new = self.insert(key.clone(), Entry::with_ttl(value.clone(), ttl));

        if let Some(solver) = &self.persist {
            solver.put(key, value, Some(millis(ttl)), Some(TimeUnit::Milliseconds));
        }
        is_new
    }

    /// Replaces the value of a live key, keeping its expiry.
    ///
    /// The persisted record is rebuilt with its original ttl, so its
    /// deadline restarts from now and can outlive the in-memory entry.
    ///
    /// Returns `false` if the key doesn't exist.
    pub fn replace(&self, key: &Bytes, value: Bytes) -> bool {
        {
            let mut data = self.get_shard(key).data.write();
            match data.get_mut(key) {
                Some(entry) if !entry.is_expired() => entry.value = value.clone(),
                _ => return false,
            }
        }

        if let Some(solver) = &self.persist {
            solver.replace(key.clone(), value);
        }
        true
    }

    /// Deletes a key.
    ///
    /// Returns `true` if the key was deleted, `false` if it didn't exist.
    pub fn delete(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let removed = self.get_shard(key).data.write().remove(key).is_some();
        if !removed {
            return false;
        }
        self.key_count.fetch_sub(1, Ordering::Relaxed);

        if let Some(solver) = &self.persist {
            solver.remove(key.clone());
        }
        true
    }

    /// Deletes every key matching a glob pattern.
    ///
    /// Returns the number of keys that were deleted.
    pub fn delete_matching(&self, pattern: &str) -> u64 {
        let mut deleted = 0u64;
        for shard in &self.shards {
            let mut data = shard.data.write();
            let before = data.len();
            data.retain(|key, _| !glob_match(pattern, key));
            deleted += (before - data.len()) as u64;
        }

        if deleted > 0 {
            self.key_count.fetch_sub(deleted, Ordering::Relaxed);
            self.del_count.fetch_add(deleted, Ordering::Relaxed);
        }

        if let Some(solver) = &self.persist {
            solver.remove_similar(Bytes::copy_from_slice(pattern.as_bytes()), |candidate, probe| {
                candidate.matches_glob(&String::from_utf8_lossy(probe.bytes()))
            });
        }
        deleted
    }

    /// Sets a new TTL on an existing key.
    ///
    /// Returns `true` if the expiry was set, `false` if the key doesn't exist.
    pub fn expire(&self, key: &Bytes, ttl: Duration) -> bool {
        {
            let mut data = self.get_shard(key).data.write();
            match data.get_mut(key) {
                Some(entry) if !entry.is_expired() => {
                    entry.ttl = Some(ttl);
                    entry.expires_at = Some(Instant::now() + ttl);
                }
                _ => return false,
            }
        }

        if let Some(solver) = &self.persist {
            solver.extend(key.clone(), millis(ttl), TimeUnit::Milliseconds);
        }
        true
    }

    /// Restarts the TTL of a key from now.
    ///
    /// Returns `false` if the key doesn't exist or has no TTL.
    pub fn touch(&self, key: &Bytes) -> bool {
        {
            let mut data = self.get_shard(key).data.write();
            match data.get_mut(key) {
                Some(entry) if !entry.is_expired() => match entry.ttl {
                    Some(ttl) => entry.expires_at = Some(Instant::now() + ttl),
                    None => return false,
                },
                _ => return false,
            }
        }

        if let Some(solver) = &self.persist {
            solver.reset(key.clone());
        }
        true
    }

    /// Clears all data, on disk too when persistence is attached.
    pub fn flush(&self) {
        for shard in &self.shards {
            shard.data.write().clear();
        }
        self.key_count.store(0, Ordering::Relaxed);

        if let Some(solver) = &self.persist {
            solver.remove_all();
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    /// Expired keys are detected and removed on access.
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Gets the full entry for a key (including metadata).
    pub fn get_entry(&self, key: &Bytes) -> Option<Entry> {
        let shard = self.get_shard(key);

        // Fast path under the read lock
        {
            let data = shard.data.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: take the write lock to remove it
        let mut data = shard.data.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            // Race: another thread may have updated the key
            other => other.cloned(),
        }
    }

    /// Checks if a key exists (and is not expired).
    pub fn exists(&self, key: &Bytes) -> bool {
        self.get_shard(key)
            .data
            .read()
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Gets the remaining TTL for a key in milliseconds.
    ///
    /// - `Some(ms)` if the key exists and has an expiry
    /// - `Some(-1)` if the key exists but has no expiry
    /// - `None` if the key doesn't exist
    pub fn pttl(&self, key: &Bytes) -> Option<i64> {
        self.get_entry(key).map(|entry| {
            entry
                .remaining()
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or(-1)
        })
    }

    /// Returns all live keys matching a glob pattern.
    ///
    /// Supported patterns: `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes.
    pub fn keys(&self, pattern: &str) -> Vec<Bytes> {
        let mut result = Vec::new();
        for shard in &self.shards {
            let data = shard.data.read();
            result.extend(
                data.iter()
                    .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
                    .map(|(key, _)| key.clone()),
            );
        }
        result
    }

    /// Returns the approximate number of keys.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
            reloaded: self.reload_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired keys from all shards.
    ///
    /// Returns the number of keys that were cleaned up.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.data.write();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired());
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }
}

impl ReloadHook<Bytes, Bytes> for StorageEngine {
    fn reload(&self, key: Bytes, value: Bytes, ttl: u64, unit: TimeUnit) {
        trace!(key = %String::from_utf8_lossy(&key), ttl, unit = %unit, "Reloading entry");
        self.reload_count.fetch_add(1, Ordering::Relaxed);
        self.insert(key, Entry::with_ttl(value, unit.to_duration(ttl)));
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Storage statistics.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    pub expired: u64,
    /// Entries inserted by recovery
    pub reloaded: u64,
}
