//! Per-key persistence handles.
//!
//! A [`PersistHandle`] owns one record, the path of its file and the lock
//! that orders every operation on that key. Readers (existence and expiry
//! checks, accessors) share the lock; anything that touches the record or
//! its file takes it exclusively.
//!
//! ## Lock order
//!
//! A handle's lock may be taken while holding nothing, or while holding
//! another handle's lock (a handle installing its successor). Registry shard
//! locks are only ever taken *after* a handle lock and are never held while
//! waiting on one.
//!
//! ## Superseded handles
//!
//! Every mutation checks, under the handle's write lock, that the registry
//! still points at this handle. If a newer handle took over while the caller
//! was waiting, the mutation fails with `Superseded` and touches nothing.
//! The key-level operations on [`Persistence`] re-resolve the handle and
//! retry, so an operation is never lost to a concurrent renewal.

use crate::error::{PersistError, Result};
use crate::persistence::identity::KeyIdentity;
use crate::persistence::record::Record;
use crate::persistence::registry::{Persistence, Shared};
use crate::time::{now_millis, TimeUnit};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::debug;

/// The live persistence state of one key.
pub struct PersistHandle<K, V> {
    identity: KeyIdentity,
    file_name: String,
    path: PathBuf,
    record: RwLock<Record<K, V>>,
    shared: Weak<Shared<K, V>>,
}

impl<K, V> PersistHandle<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        identity: KeyIdentity,
        file_name: String,
        path: PathBuf,
        record: Record<K, V>,
        shared: Weak<Shared<K, V>>,
    ) -> Self {
        Self {
            identity,
            file_name,
            path,
            record: RwLock::new(record),
            shared,
        }
    }

    /// The engine is gone once the last `Persistence` clone is dropped.
    fn shared(&self) -> Result<Arc<Shared<K, V>>> {
        self.shared.upgrade().ok_or(PersistError::Disabled)
    }

    // ========================================================================
    // WRITE-LOCKED OPERATIONS
    // ========================================================================

    /// Serializes the record and overwrites the file.
    pub fn write(&self) -> Result<()> {
        let shared = self.shared()?;
        let record = self.record.write();
        self.ensure_registered(&shared)?;
        self.write_locked(&shared, &record)
    }

    /// Pushes the deadline to `now + duration` and installs a fresh handle
    /// for the key. The file path does not change.
    ///
    /// Fails with `AlreadyExpired` if the record has already expired.
    pub fn extend_expiry(&self, duration: u64, unit: TimeUnit) -> Result<Arc<Self>> {
        let shared = self.shared()?;
        let mut record = self.record.write();
        self.ensure_current(&shared, &record)?;

        shared.files.delete(&self.path)?;
        record.extend(duration, unit);
        self.install_successor(&shared, record.clone())
    }

    /// Like [`extend_expiry`](Self::extend_expiry) with the record's own ttl.
    pub fn reset_expiry(&self) -> Result<Arc<Self>> {
        let shared = self.shared()?;
        let mut record = self.record.write();
        self.ensure_current(&shared, &record)?;

        shared.files.delete(&self.path)?;
        record.reset(shared.defaults());
        self.install_successor(&shared, record.clone())
    }

    /// Replaces the value. The old handle is evicted and a new one is
    /// created through the registry, so nothing keeps serving the old value.
    ///
    /// Fails with `AlreadyExpired` if the record has already expired.
    pub fn replace_value(&self, value: V) -> Result<Arc<Self>> {
        let shared = self.shared()?;
        let record = self.record.write();
        self.ensure_current(&shared, &record)?;

        shared.files.delete(&self.path)?;
        self.evict(&shared);

        let persistence = Persistence::from_shared(Arc::clone(&shared));
        let successor =
            persistence.of_set_persistence(record.key.clone(), value, record.duration, record.unit)?;
        debug!(file = %self.file_name, "Record value replaced");
        Ok(successor)
    }

    /// Deletes the file and evicts this handle from the registry.
    /// Removing an already removed record is not an error.
    ///
    /// A handle that has been superseded by a newer one for the same key
    /// leaves the file alone, since it now belongs to the successor, and
    /// fails with `Superseded`.
    pub fn remove(&self) -> Result<()> {
        let shared = self.shared()?;
        let _record = self.record.write();

        if self.is_superseded(&shared) {
            debug!(file = %self.file_name, "Superseded handle, nothing removed");
            return Err(PersistError::Superseded(self.identity.to_string()));
        }

        let deleted = shared.files.delete(&self.path)?;
        self.evict(&shared);
        debug!(file = %self.file_name, deleted, "Record removed");
        Ok(())
    }

    /// Rebuilds the record around a new value and ttl and writes it.
    pub(crate) fn overwrite(&self, value: V, duration: Option<u64>, unit: Option<TimeUnit>) -> Result<()> {
        let shared = self.shared()?;
        let mut record = self.record.write();
        self.ensure_registered(&shared)?;

        *record = Record::new(
            record.key.clone(),
            value,
            duration,
            unit,
            shared.defaults(),
            shared.keys.primary().name(),
            shared.values.primary().name(),
        );
        self.write_locked(&shared, &record)
    }

    fn write_locked(&self, shared: &Shared<K, V>, record: &Record<K, V>) -> Result<()> {
        let content = record.encode(&shared.keys, &shared.values)?;
        let mut file = shared.files.touch(&self.path)?;
        shared.files.append_line(&content, &mut file)?;
        debug!(file = %self.file_name, expire_at = record.expire_at, "Record written");
        Ok(())
    }

    /// Mutations are only valid on the handle the registry currently holds
    /// for the key, and only while the record is live.
    fn ensure_current(&self, shared: &Shared<K, V>, record: &Record<K, V>) -> Result<()> {
        self.ensure_registered(shared)?;
        self.ensure_live(record)
    }

    fn ensure_registered(&self, shared: &Shared<K, V>) -> Result<()> {
        let registered = shared
            .handles
            .get(&self.identity)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current.value()), self));
        if registered {
            Ok(())
        } else {
            Err(PersistError::Superseded(self.identity.to_string()))
        }
    }

    fn ensure_live(&self, record: &Record<K, V>) -> Result<()> {
        if record.is_expired() {
            return Err(PersistError::AlreadyExpired {
                file: self.file_name.clone(),
                expire_at: record.expire_at,
            });
        }
        Ok(())
    }

    /// The successor's file is written before it is published, so nothing
    /// can reach it between registration and the write.
    fn install_successor(&self, shared: &Arc<Shared<K, V>>, record: Record<K, V>) -> Result<Arc<Self>> {
        self.write_locked(shared, &record)?;
        let successor = Arc::new(Self::new(
            self.identity.clone(),
            self.file_name.clone(),
            self.path.clone(),
            record,
            Arc::downgrade(shared),
        ));
        shared
            .handles
            .insert(self.identity.clone(), Arc::clone(&successor));
        debug!(file = %self.file_name, "Record expiry renewed");
        Ok(successor)
    }

    fn is_superseded(&self, shared: &Shared<K, V>) -> bool {
        shared
            .handles
            .get(&self.identity)
            .is_some_and(|current| !std::ptr::eq(Arc::as_ptr(current.value()), self))
    }

    /// Evicts the registry entry only if it still points at this handle.
    fn evict(&self, shared: &Shared<K, V>) {
        shared
            .handles
            .remove_if(&self.identity, |_, current| std::ptr::eq(Arc::as_ptr(current), self));
    }

    // ========================================================================
    // READ-LOCKED OPERATIONS
    // ========================================================================

    pub fn exists(&self) -> bool {
        let _record = self.record.read();
        self.path.is_file()
    }

    /// True once the deadline has been reached. Checking never deletes.
    pub fn is_expired(&self) -> bool {
        self.record.read().is_expired()
    }

    /// True while the record is still live.
    pub fn expire_of_cache(&self) -> bool {
        !self.is_expired()
    }

    pub fn key(&self) -> K {
        self.record.read().key.clone()
    }

    pub fn value(&self) -> V {
        self.record.read().value.clone()
    }

    pub fn expire_at(&self) -> i64 {
        self.record.read().expire_at
    }

    /// Time left before expiry, expressed in `unit` (truncated).
    pub fn remaining(&self, unit: TimeUnit) -> u64 {
        unit.from_millis(self.record.read().remaining_millis_at(now_millis()))
    }

    /// Snapshot of the record.
    pub fn record(&self) -> Record<K, V> {
        self.record.read().clone()
    }
}

impl<K, V> PersistHandle<K, V> {
    pub fn identity(&self) -> &KeyIdentity {
        &self.identity
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<K, V> fmt::Debug for PersistHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistHandle")
            .field("identity", &self.identity)
            .field("file_name", &self.file_name)
            .field("expire_at", &self.record.read().expire_at)
            .finish()
    }
}
