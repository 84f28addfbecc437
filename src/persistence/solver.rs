//! Cache-facing entry point.
//!
//! [`PersistSolver`] is what the cache calls when an entry changes. Each
//! operation goes through the key-level operations of [`Persistence`], which
//! follow a key's handle across concurrent renewals, and runs on the
//! configured [`Runner`], so persistence failures are logged and never reach
//! the cache.

use crate::config::PersistConfig;
use crate::persistence::identity::KeyIdentity;
use crate::persistence::registry::Persistence;
use crate::persistence::runner::Runner;
use crate::time::TimeUnit;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct PersistSolver<K, V> {
    persistence: Persistence<K, V>,
    runner: Runner,
}

impl<K, V> Clone for PersistSolver<K, V> {
    fn clone(&self) -> Self {
        Self {
            persistence: self.persistence.clone(),
            runner: self.runner.clone(),
        }
    }
}

impl<K, V> PersistSolver<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a solver whose run mode follows the engine configuration.
    pub fn new(persistence: Persistence<K, V>) -> Self {
        let runner = Runner::from_config(persistence.config());
        Self::with_runner(persistence, runner)
    }

    pub fn with_runner(persistence: Persistence<K, V>, runner: Runner) -> Self {
        Self { persistence, runner }
    }

    pub fn persistence(&self) -> &Persistence<K, V> {
        &self.persistence
    }

    pub fn config(&self) -> &PersistConfig {
        self.persistence.config()
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Entry written to the cache.
    pub fn put(&self, key: K, value: V, duration: Option<u64>, unit: Option<TimeUnit>) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("put", move || {
            persistence.of_set_persistence(key, value, duration, unit)?;
            Ok(())
        })
    }

    /// Value of an existing entry replaced.
    pub fn replace(&self, key: K, value: V) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("replace", move || {
            persistence.replace_value(&key, value)?;
            Ok(())
        })
    }

    /// Entry ttl changed.
    pub fn extend(&self, key: K, duration: u64, unit: TimeUnit) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("extend", move || {
            persistence.extend_expiry(&key, duration, unit)?;
            Ok(())
        })
    }

    /// Entry touched, restarting its ttl.
    pub fn reset(&self, key: K) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("reset", move || {
            persistence.reset_expiry(&key)?;
            Ok(())
        })
    }

    /// Entry removed or evicted from the cache.
    pub fn remove(&self, key: K) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("remove", move || persistence.remove(&key))
    }

    /// Removes every entry whose identity satisfies `predicate(candidate, probe)`.
    /// A record that fails to remove is logged and does not stop the rest.
    pub fn remove_similar<F>(&self, key: K, predicate: F) -> Option<JoinHandle<()>>
    where
        F: Fn(&KeyIdentity, &KeyIdentity) -> bool + Send + 'static,
    {
        let persistence = self.persistence.clone();
        self.runner.run("remove_similar", move || {
            let mut removed = 0;
            for handle in persistence.of_get_similar(&key, predicate)? {
                let file = handle.file_name().to_string();
                match persistence.remove_handle(handle) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(file = %file, error = %e, "Failed to remove similar record"),
                }
            }
            debug!(removed, "Similar records removed");
            Ok(())
        })
    }

    /// Cache cleared.
    pub fn remove_all(&self) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("remove_all", move || persistence.remove_all().map(|_| ()))
    }

    /// Cache cleared, including record files no handle owns.
    pub fn clean_all(&self) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone();
        self.runner.run("clean_all", move || persistence.clean_all().map(|_| ()))
    }
}
