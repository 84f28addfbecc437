//! The persistence registry.
//!
//! [`Persistence`] is the process-wide index from key identity to live
//! handle, and the factory that creates handles. It guarantees that at most
//! one handle is registered per identity: creation goes through the sharded
//! map's atomic entry API, so two threads racing to persist the same key end
//! up sharing one handle.
//!
//! ## Persistence policy
//!
//! Not every cache entry is worth a file. `of_set` rejects:
//! - everything, with `Disabled`, while persistence is switched off
//! - entries without a ttl, with `UndatedEntry`, unless undated entries are allowed
//! - entries whose ttl is shorter than the configured minimum, with `BelowPersistenceThreshold`
//!
//! ## Key-level operations
//!
//! `of_set_persistence`, [`remove`](Persistence::remove),
//! [`extend_expiry`](Persistence::extend_expiry),
//! [`reset_expiry`](Persistence::reset_expiry) and
//! [`replace_value`](Persistence::replace_value) resolve the handle for a key
//! and retry against the new one whenever the handle they resolved is
//! superseded before they get its lock. Same-key operations therefore apply
//! in lock acquisition order and none of them is dropped.

use crate::codec::{Codec, CodecSet};
use crate::config::PersistConfig;
use crate::error::{PersistError, Result};
use crate::persistence::file::{FileManager, RECORD_EXTENSION};
use crate::persistence::handle::PersistHandle;
use crate::persistence::identity::KeyIdentity;
use crate::persistence::record::{DefaultTtl, Record};
use crate::time::TimeUnit;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by the registry and every handle it created.
pub(crate) struct Shared<K, V> {
    pub(crate) config: PersistConfig,
    pub(crate) files: FileManager,
    pub(crate) keys: CodecSet<K>,
    pub(crate) values: CodecSet<V>,
    pub(crate) handles: DashMap<KeyIdentity, Arc<PersistHandle<K, V>>>,
}

impl<K, V> Shared<K, V> {
    pub(crate) fn defaults(&self) -> DefaultTtl {
        DefaultTtl {
            duration: self.config.default_duration,
            unit: self.config.default_duration_unit,
        }
    }
}

/// Builder for a [`Persistence`] engine.
pub struct PersistenceBuilder<K, V> {
    config: PersistConfig,
    keys: CodecSet<K>,
    values: CodecSet<V>,
}

impl<K, V> PersistenceBuilder<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Registers an extra key codec, used only to read records written with it.
    pub fn key_codec(mut self, codec: impl Codec<K> + 'static) -> Self {
        self.keys.register(Arc::new(codec));
        self
    }

    /// Registers an extra value codec, used only to read records written with it.
    pub fn value_codec(mut self, codec: impl Codec<V> + 'static) -> Self {
        self.values.register(Arc::new(codec));
        self
    }

    pub fn build(self) -> Persistence<K, V> {
        let files = FileManager::new(&self.config.root, &self.config.file_prefix);
        Persistence {
            shared: Arc::new(Shared {
                config: self.config,
                files,
                keys: self.keys,
                values: self.values,
                handles: DashMap::new(),
            }),
        }
    }
}

/// Registry and factory of persistence handles.
///
/// Cloning is cheap and every clone shares the same registry.
pub struct Persistence<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Persistence<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Persistence<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an engine that writes keys and values with the given codecs.
    pub fn new(
        config: PersistConfig,
        key_codec: impl Codec<K> + 'static,
        value_codec: impl Codec<V> + 'static,
    ) -> Self {
        Self::builder(config, key_codec, value_codec).build()
    }

    pub fn builder(
        config: PersistConfig,
        key_codec: impl Codec<K> + 'static,
        value_codec: impl Codec<V> + 'static,
    ) -> PersistenceBuilder<K, V> {
        PersistenceBuilder {
            config,
            keys: CodecSet::new(Arc::new(key_codec)),
            values: CodecSet::new(Arc::new(value_codec)),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared<K, V>>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.shared.config
    }

    pub fn files(&self) -> &FileManager {
        &self.shared.files
    }

    pub(crate) fn key_codecs(&self) -> &CodecSet<K> {
        &self.shared.keys
    }

    pub(crate) fn value_codecs(&self) -> &CodecSet<V> {
        &self.shared.values
    }

    pub(crate) fn defaults(&self) -> DefaultTtl {
        self.shared.defaults()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    /// Identity of `key` under the primary key codec.
    pub fn identity(&self, key: &K) -> Result<KeyIdentity> {
        KeyIdentity::of(key, self.shared.keys.primary().as_ref())
    }

    // ========================================================================
    // FACTORY
    // ========================================================================

    /// Returns the handle for `key`, creating it if needed.
    ///
    /// If a handle already exists for the key it is returned untouched: the
    /// new value and ttl are ignored. Nothing is written to disk.
    pub fn of_set(
        &self,
        key: K,
        value: V,
        duration: Option<u64>,
        unit: Option<TimeUnit>,
    ) -> Result<Arc<PersistHandle<K, V>>> {
        self.get_or_create(key, value, duration, unit)
            .map(|(handle, _)| handle)
    }

    /// Persists `key`: creates the handle if needed, otherwise rebuilds the
    /// existing handle's record around the new value and ttl. Either way the
    /// record is written.
    pub fn of_set_persistence(
        &self,
        key: K,
        value: V,
        duration: Option<u64>,
        unit: Option<TimeUnit>,
    ) -> Result<Arc<PersistHandle<K, V>>> {
        loop {
            let (handle, created) = self.get_or_create(key.clone(), value.clone(), duration, unit)?;
            let written = if created {
                handle.write()
            } else {
                handle.overwrite(value.clone(), duration, unit)
            };
            match written {
                Ok(()) => return Ok(handle),
                Err(PersistError::Superseded(_)) => {
                    debug!(key = %handle.identity(), "Handle superseded during write, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_or_create(
        &self,
        key: K,
        value: V,
        duration: Option<u64>,
        unit: Option<TimeUnit>,
    ) -> Result<(Arc<PersistHandle<K, V>>, bool)> {
        self.ensure_enabled()?;
        self.ensure_persistable(duration, unit)?;
        let identity = self.identity(&key)?;

        // The entry guard holds one shard lock for check-create-insert only.
        match self.shared.handles.entry(identity) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let record = Record::new(
                    key,
                    value,
                    duration,
                    unit,
                    self.shared.defaults(),
                    self.shared.keys.primary().name(),
                    self.shared.values.primary().name(),
                );
                let (file_name, path) = self.shared.files.path_for(entry.key());
                let handle = self.new_handle(entry.key().clone(), file_name, path, record);
                debug!(key = %entry.key(), file = %handle.file_name(), "Persistence handle created");
                entry.insert(Arc::clone(&handle));
                Ok((handle, true))
            }
        }
    }

    /// Builds a handle without registering it.
    pub(crate) fn new_handle(
        &self,
        identity: KeyIdentity,
        file_name: String,
        path: PathBuf,
        record: Record<K, V>,
    ) -> Arc<PersistHandle<K, V>> {
        Arc::new(PersistHandle::new(
            identity,
            file_name,
            path,
            record,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Registers `handle` unless its key already has one; returns the winner.
    pub(crate) fn register(&self, handle: Arc<PersistHandle<K, V>>) -> Arc<PersistHandle<K, V>> {
        Arc::clone(
            self.shared
                .handles
                .entry(handle.identity().clone())
                .or_insert(handle)
                .value(),
        )
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.shared.config.enabled {
            Ok(())
        } else {
            Err(PersistError::Disabled)
        }
    }

    fn ensure_persistable(&self, duration: Option<u64>, unit: Option<TimeUnit>) -> Result<()> {
        let config = &self.shared.config;
        match duration {
            None if config.persist_undated => Ok(()),
            None => Err(PersistError::UndatedEntry),
            Some(duration) => {
                let duration_ms = unit
                    .unwrap_or(config.default_duration_unit)
                    .to_millis(duration);
                let minimum_ms = config.min_duration_millis();
                if duration_ms >= minimum_ms {
                    Ok(())
                } else {
                    Err(PersistError::BelowPersistenceThreshold {
                        duration_ms,
                        minimum_ms,
                    })
                }
            }
        }
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn of_get(&self, key: &K) -> Result<Arc<PersistHandle<K, V>>> {
        self.ensure_enabled()?;
        let identity = self.identity(key)?;
        self.shared
            .handles
            .get(&identity)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PersistError::NotFound(identity.to_string()))
    }

    /// Handles whose identity satisfies `predicate(candidate, probe)`, where
    /// `probe` is the identity of `key`. Sorted by identity.
    ///
    /// ```ignore
    /// // Every key in the "user:" family.
    /// let family = engine.of_get_similar(&"user:".into(), |c, p| c.starts_with(p))?;
    /// ```
    pub fn of_get_similar<F>(&self, key: &K, predicate: F) -> Result<Vec<Arc<PersistHandle<K, V>>>>
    where
        F: Fn(&KeyIdentity, &KeyIdentity) -> bool,
    {
        self.ensure_enabled()?;
        let probe = self.identity(key)?;

        let mut found: Vec<_> = self
            .shared
            .handles
            .iter()
            .filter(|entry| predicate(entry.key(), &probe))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if found.is_empty() {
            return Err(PersistError::NoneFound(probe.to_string()));
        }
        found.sort_by(|a, b| a.identity().cmp(b.identity()));
        Ok(found)
    }

    /// The handle currently registered for `identity`, if any.
    fn current(&self, identity: &KeyIdentity) -> Option<Arc<PersistHandle<K, V>>> {
        self.shared
            .handles
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    // ========================================================================
    // KEY-LEVEL OPERATIONS
    // ========================================================================

    /// Runs `op` on the handle registered for `key`, following successors
    /// until one is still current when `op` takes its lock.
    fn on_current<T, F>(&self, key: &K, op: F) -> Result<T>
    where
        F: Fn(&PersistHandle<K, V>) -> Result<T>,
    {
        let mut handle = self.of_get(key)?;
        loop {
            match op(&*handle) {
                Err(PersistError::Superseded(_)) => {
                    debug!(key = %handle.identity(), "Handle superseded, retrying");
                    handle = self.of_get(key)?;
                }
                other => return other,
            }
        }
    }

    /// Removes the record for `key`, whichever handle currently owns it.
    pub fn remove(&self, key: &K) -> Result<()> {
        self.on_current(key, |handle| handle.remove())
    }

    /// Extends the expiry of the record for `key`. See
    /// [`PersistHandle::extend_expiry`].
    pub fn extend_expiry(&self, key: &K, duration: u64, unit: TimeUnit) -> Result<Arc<PersistHandle<K, V>>> {
        self.on_current(key, |handle| handle.extend_expiry(duration, unit))
    }

    /// Restarts the ttl of the record for `key`.
    pub fn reset_expiry(&self, key: &K) -> Result<Arc<PersistHandle<K, V>>> {
        self.on_current(key, |handle| handle.reset_expiry())
    }

    /// Replaces the value of the record for `key`.
    pub fn replace_value(&self, key: &K, value: V) -> Result<Arc<PersistHandle<K, V>>> {
        self.on_current(key, |handle| handle.replace_value(value.clone()))
    }

    /// Removes `handle`, or whichever handle superseded it. A key that is
    /// gone by the time the handle is resolved counts as removed.
    pub(crate) fn remove_handle(&self, handle: Arc<PersistHandle<K, V>>) -> Result<()> {
        let mut handle = handle;
        loop {
            match handle.remove() {
                Err(PersistError::Superseded(_)) => match self.current(handle.identity()) {
                    Some(next) => handle = next,
                    None => return Ok(()),
                },
                other => return other,
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.identity(key)
            .map(|identity| self.shared.handles.contains_key(&identity))
            .unwrap_or(false)
    }

    /// Snapshot of every registered handle.
    pub fn handles(&self) -> Vec<Arc<PersistHandle<K, V>>> {
        self.shared
            .handles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.handles.is_empty()
    }

    // ========================================================================
    // BULK REMOVAL
    // ========================================================================

    /// Removes every registered handle, then clears the registry.
    ///
    /// A handle that fails to remove is logged and skipped; it does not stop
    /// the others. Returns the number of handles removed.
    pub fn remove_all(&self) -> Result<usize> {
        self.ensure_enabled()?;

        let mut removed = 0;
        for handle in self.handles() {
            let file = handle.file_name().to_string();
            match self.remove_handle(handle) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %file, error = %e, "Failed to remove record"),
            }
        }
        self.shared.handles.clear();

        info!(removed, "Removed all persisted records");
        Ok(removed)
    }

    /// [`remove_all`](Self::remove_all), then deletes any record file left in
    /// the root that no handle owned (expired or never recovered).
    pub fn clean_all(&self) -> Result<usize> {
        let mut removed = self.remove_all()?;

        let stray = match self.shared.files.list(RECORD_EXTENSION) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Failed to list persistence root");
                return Ok(removed);
            }
        };
        for path in stray {
            match self.shared.files.delete(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete record file"),
            }
        }
        Ok(removed)
    }
}

impl<K, V> fmt::Debug for Persistence<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("enabled", &self.shared.config.enabled)
            .field("root", &self.shared.config.root)
            .field("handles", &self.shared.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, RawBytesCodec, Utf8Codec};
    use bytes::Bytes;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn engine_with(config: PersistConfig) -> Persistence<String, String> {
        Persistence::new(config, Utf8Codec, JsonCodec)
    }

    fn engine(dir: &TempDir) -> Persistence<String, String> {
        engine_with(PersistConfig::enabled_at(dir.path()))
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn test_scenario_put_then_get() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        engine
            .of_set_persistence(s("a"), s("b"), Some(10), Some(TimeUnit::Minutes))
            .unwrap();

        let handle = engine.of_get(&s("a")).unwrap();
        assert!(handle.expire_of_cache());
        assert_eq!(handle.value(), "b");

        let expected = dir.path().join(engine.files().file_name(handle.identity()));
        assert_eq!(handle.path(), expected);
        assert!(handle.file_name().starts_with('$'));
        assert!(handle.file_name().ends_with(".aof"));

        let content = std::fs::read_to_string(&expected).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!((lines[0], lines[2]), ("@", "@"));
        assert!(lines[1].contains("\"expire\":"));
    }

    #[test]
    fn test_of_set_is_idempotent_per_key() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let first = engine.of_set(s("a"), s("b"), Some(1), Some(TimeUnit::Minutes)).unwrap();
        let second = engine.of_set(s("a"), s("other"), Some(5), Some(TimeUnit::Minutes)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.value(), "b");
        assert_eq!(engine.len(), 1);
        // of_set alone never touches the disk.
        assert!(!first.exists());
    }

    #[test]
    fn test_of_set_persistence_overwrites() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let first = engine
            .of_set_persistence(s("a"), s("b"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();
        let second = engine
            .of_set_persistence(s("a"), s("c"), Some(5), Some(TimeUnit::Minutes))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.value(), "c");
        assert!(first.remaining(TimeUnit::Minutes) >= 4);
    }

    #[test]
    fn test_concurrent_of_set_creates_one_handle() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let barrier = Arc::new(Barrier::new(16));

        let workers: Vec<_> = (0..16)
            .map(|i| {
                let engine = engine.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine
                        .of_set(s("shared"), format!("v{}", i), Some(1), Some(TimeUnit::Minutes))
                        .unwrap()
                })
            })
            .collect();

        let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(engine.len(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[test]
    fn test_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = PersistConfig::enabled_at(dir.path());
        config.enabled = false;
        let engine = engine_with(config);

        assert!(matches!(
            engine.of_set(s("a"), s("b"), Some(1), Some(TimeUnit::Minutes)),
            Err(PersistError::Disabled)
        ));
        assert!(matches!(engine.of_get(&s("a")), Err(PersistError::Disabled)));
        assert!(matches!(engine.remove_all(), Err(PersistError::Disabled)));
    }

    #[test]
    fn test_threshold_boundary() {
        let dir = TempDir::new().unwrap();
        let mut config = PersistConfig::enabled_at(dir.path());
        config.min_duration = 1;
        config.min_duration_unit = TimeUnit::Seconds;
        let engine = engine_with(config);

        assert!(engine
            .of_set(s("at"), s("v"), Some(1_000), Some(TimeUnit::Milliseconds))
            .is_ok());
        match engine.of_set(s("below"), s("v"), Some(999), Some(TimeUnit::Milliseconds)) {
            Err(PersistError::BelowPersistenceThreshold {
                duration_ms,
                minimum_ms,
            }) => {
                assert_eq!(duration_ms, 999);
                assert_eq!(minimum_ms, 1_000);
            }
            other => panic!("expected BelowPersistenceThreshold, got {:?}", other),
        }
    }

    #[test]
    fn test_undated_policy() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let handle = engine.of_set(s("a"), s("b"), None, None).unwrap();
        // 30 minute default
        assert!(handle.remaining(TimeUnit::Minutes) >= 29);

        let mut config = PersistConfig::enabled_at(dir.path());
        config.persist_undated = false;
        let strict = engine_with(config);
        assert!(matches!(
            strict.of_set(s("a"), s("b"), None, None),
            Err(PersistError::UndatedEntry)
        ));
    }

    #[test]
    fn test_of_get_missing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(matches!(engine.of_get(&s("nope")), Err(PersistError::NotFound(_))));
        assert!(!engine.contains(&s("nope")));
    }

    #[test]
    fn test_of_get_similar() {
        let dir = TempDir::new().unwrap();
        let engine: Persistence<Bytes, String> = Persistence::new(
            PersistConfig::enabled_at(dir.path()),
            RawBytesCodec,
            JsonCodec,
        );
        for key in ["user:2", "user:1", "session:1"] {
            engine
                .of_set(Bytes::from(key), s("v"), Some(1), Some(TimeUnit::Minutes))
                .unwrap();
        }

        let family = engine
            .of_get_similar(&Bytes::from("user:"), |c, p| c.starts_with(p))
            .unwrap();
        let keys: Vec<_> = family.iter().map(|h| h.key()).collect();
        assert_eq!(keys, vec![Bytes::from("user:1"), Bytes::from("user:2")]);

        let globbed = engine
            .of_get_similar(&Bytes::from("*:1"), |c, p| c.matches_glob(&String::from_utf8_lossy(p.bytes())))
            .unwrap();
        assert_eq!(globbed.len(), 2);

        assert!(matches!(
            engine.of_get_similar(&Bytes::from("order:"), |c, p| c.starts_with(p)),
            Err(PersistError::NoneFound(_))
        ));
    }

    #[test]
    fn test_distinct_keys_same_value_get_distinct_files() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let a = engine
            .of_set_persistence(s("k1"), s("same"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();
        let b = engine
            .of_set_persistence(s("k2"), s("same"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();

        assert_ne!(a.path(), b.path());
        assert_eq!(engine.files().list(RECORD_EXTENSION).unwrap().len(), 2);
    }

    #[test]
    fn test_remove_all_and_clean_all() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        for key in ["a", "b", "c"] {
            engine
                .of_set_persistence(s(key), s("v"), Some(1), Some(TimeUnit::Minutes))
                .unwrap();
        }

        assert_eq!(engine.remove_all().unwrap(), 3);
        assert!(engine.is_empty());
        assert!(engine.files().list(RECORD_EXTENSION).unwrap().is_empty());

        engine
            .of_set_persistence(s("d"), s("v"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();
        std::fs::write(dir.path().join("$orphan.aof"), "@\n{}\n@\n").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        assert_eq!(engine.clean_all().unwrap(), 2);
        assert!(engine.files().list(RECORD_EXTENSION).unwrap().is_empty());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_remove_follows_a_renewed_handle() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine
            .of_set_persistence(s("k"), s("v"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();

        // A remover resolved the handle, then an extension renewed it first.
        let seen = engine.of_get(&s("k")).unwrap();
        let renewed = engine.extend_expiry(&s("k"), 2, TimeUnit::Minutes).unwrap();
        assert!(!Arc::ptr_eq(&seen, &renewed));

        engine.remove_handle(seen).unwrap();
        assert!(!engine.contains(&s("k")));
        assert!(!renewed.exists());
        assert!(engine.files().list(RECORD_EXTENSION).unwrap().is_empty());
    }

    #[test]
    fn test_put_follows_a_replaced_handle() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine
            .of_set_persistence(s("k"), s("v1"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();

        let seen = engine.of_get(&s("k")).unwrap();
        engine.replace_value(&s("k"), s("v2")).unwrap();
        assert!(matches!(
            seen.overwrite(s("stale"), Some(1), Some(TimeUnit::Minutes)),
            Err(PersistError::Superseded(_))
        ));

        let written = engine
            .of_set_persistence(s("k"), s("v3"), Some(1), Some(TimeUnit::Minutes))
            .unwrap();
        assert!(Arc::ptr_eq(&written, &engine.of_get(&s("k")).unwrap()));

        // Disk agrees with the registry.
        let restarted = engine_with(PersistConfig::enabled_at(dir.path()));
        crate::persistence::RecoveryPipeline::new(restarted.clone()).run();
        assert_eq!(restarted.of_get(&s("k")).unwrap().value(), "v3");
    }

    #[test]
    fn test_concurrent_extend_and_remove_never_resurrect() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        for round in 0..200 {
            let key = format!("k{}", round % 4);
            engine
                .of_set_persistence(key.clone(), s("v"), Some(1), Some(TimeUnit::Minutes))
                .unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let extender = {
                let (engine, barrier, key) = (engine.clone(), Arc::clone(&barrier), key.clone());
                thread::spawn(move || {
                    barrier.wait();
                    // Loses to the remover with NotFound, which is fine.
                    let _ = engine.extend_expiry(&key, 2, TimeUnit::Minutes);
                })
            };
            let remover = {
                let (engine, barrier, key) = (engine.clone(), Arc::clone(&barrier), key.clone());
                thread::spawn(move || {
                    barrier.wait();
                    engine.remove(&key)
                })
            };

            extender.join().unwrap();
            remover.join().unwrap().unwrap();
            assert!(!engine.contains(&key), "round {}", round);
        }
        assert!(engine.files().list(RECORD_EXTENSION).unwrap().is_empty());
    }
}
