//! Startup recovery.
//!
//! Rebuilds the registry from the record files in the persistence root and
//! replays every live entry into the in-memory cache and the recovery
//! listeners.
//!
//! ## Per-file state machine
//!
//! ```text
//! Discovered ──> Parsed ──┬──> Expired ──> file deleted, entry discarded
//!                         │
//!                         └──> Live ──> handle registered
//!                                       reload(key, value, ttl, unit)
//!                                       listeners notified
//! ```
//!
//! Every step is isolated per file: a malformed file, an unknown codec or a
//! failing listener is logged and recorded in the [`RecoveryReport`], and the
//! pass carries on with the next file. Running recovery twice is safe; the
//! second pass replays the same entries again.

use crate::error::{PersistError, Result};
use crate::persistence::file::RECORD_EXTENSION;
use crate::persistence::record::RecordEnvelope;
use crate::persistence::registry::Persistence;
use crate::time::{now_millis, TimeUnit};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// The in-memory cache that recovered entries are pushed back into.
pub trait ReloadHook<K, V>: Send + Sync {
    /// Inserts `key` with `ttl` (in `unit`) left to live.
    fn reload(&self, key: K, value: V, ttl: u64, unit: TimeUnit);
}

/// Application callback notified of every recovered entry.
pub trait RecoveryListener<K, V>: Send + Sync {
    fn recovery(&self, _key: &K, _value: &V) -> anyhow::Result<()> {
        Ok(())
    }

    fn recovery_with_ttl(&self, _key: &K, _value: &V, _ttl: u64, _unit: TimeUnit) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A file that could not be recovered.
#[derive(Debug)]
pub struct RecoveryFailure {
    pub path: PathBuf,
    pub error: PersistError,
}

/// Outcome of one recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Record files found in the root.
    pub scanned: usize,
    /// Live entries replayed.
    pub restored: usize,
    /// Expired entries whose files were deleted.
    pub expired: usize,
    /// Files that could not be recovered.
    pub failures: Vec<RecoveryFailure>,
    /// Listener invocations that returned an error.
    pub listener_failures: usize,
}

impl RecoveryReport {
    /// Number of files rejected as malformed.
    pub fn malformed(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, PersistError::MalformedRecord { .. }))
            .count()
    }
}

enum Outcome {
    Restored,
    Expired,
}

type NamedListener<K, V> = (String, Arc<dyn RecoveryListener<K, V>>);

/// Reconstructs persisted state at startup.
pub struct RecoveryPipeline<K, V> {
    persistence: Persistence<K, V>,
    hook: Option<Arc<dyn ReloadHook<K, V>>>,
    listeners: Vec<NamedListener<K, V>>,
}

impl<K, V> RecoveryPipeline<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(persistence: Persistence<K, V>) -> Self {
        Self {
            persistence,
            hook: None,
            listeners: Vec::new(),
        }
    }

    /// Sets the cache recovered entries are reloaded into.
    pub fn with_hook(mut self, hook: Arc<dyn ReloadHook<K, V>>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Adds a listener under `name`. Listeners whose name does not start with
    /// one of the configured listener paths are skipped.
    pub fn with_listener(mut self, name: impl Into<String>, listener: Arc<dyn RecoveryListener<K, V>>) -> Self {
        self.listeners.push((name.into(), listener));
        self
    }

    /// Runs recovery on a dedicated thread so it does not hold up startup.
    pub fn spawn(self) -> std::io::Result<JoinHandle<RecoveryReport>> {
        std::thread::Builder::new()
            .name("cache-persist-recovery".to_string())
            .spawn(move || self.run())
    }

    /// Runs one recovery pass over the persistence root.
    pub fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        if !self.persistence.is_enabled() {
            debug!("Persistence disabled, skipping recovery");
            return report;
        }

        let files = match self.persistence.files().list(RECORD_EXTENSION) {
            Ok(files) => files,
            Err(error) => {
                warn!(error = %error, "Cannot list persistence root, recovery aborted");
                report.failures.push(RecoveryFailure {
                    path: self.persistence.files().root().to_path_buf(),
                    error,
                });
                return report;
            }
        };

        for path in files {
            report.scanned += 1;
            match self.recover_file(&path, &mut report) {
                Ok(Outcome::Restored) => report.restored += 1,
                Ok(Outcome::Expired) => report.expired += 1,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Failed to recover record");
                    report.failures.push(RecoveryFailure { path, error });
                }
            }
        }

        info!(
            scanned = report.scanned,
            restored = report.restored,
            expired = report.expired,
            failed = report.failures.len(),
            "Recovery complete"
        );
        report
    }

    fn recover_file(&self, path: &Path, report: &mut RecoveryReport) -> Result<Outcome> {
        let persistence = &self.persistence;
        let malformed = |reason: String| PersistError::MalformedRecord {
            path: path.to_path_buf(),
            reason,
        };
        let content = String::from_utf8(persistence.files().read(path)?)
            .map_err(|e| malformed(e.to_string()))?;

        let record = RecordEnvelope::parse(&content)
            .and_then(|envelope| envelope.decode(persistence.key_codecs(), persistence.value_codecs()))
            .map_err(|e| match e {
                PersistError::CodecNotFound(_) => e,
                other => malformed(other.to_string()),
            })?;

        let identity = persistence.identity(&record.key)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let now = now_millis();
        let remaining_ms = record.remaining_millis_at(now);
        let unit = record.effective_unit(persistence.defaults());
        let expired = record.is_expired_at(now);

        if expired {
            persistence.files().delete(path)?;
            debug!(file = %file_name, expire_at = record.expire_at, "Discarded expired record");
            return Ok(Outcome::Expired);
        }

        let (key, value) = (record.key.clone(), record.value.clone());
        let handle = persistence.new_handle(identity, file_name, path.to_path_buf(), record);
        persistence.register(handle);

        let ttl = unit.from_millis(remaining_ms);
        if let Some(hook) = &self.hook {
            hook.reload(key.clone(), value.clone(), ttl, unit);
        }
        self.notify_listeners(&key, &value, ttl, unit, report);

        debug!(path = %path.display(), ttl, unit = %unit, "Record recovered");
        Ok(Outcome::Restored)
    }

    fn notify_listeners(&self, key: &K, value: &V, ttl: u64, unit: TimeUnit, report: &mut RecoveryReport) {
        let config = self.persistence.config();
        for (name, listener) in &self.listeners {
            if !config.listener_enabled(name) {
                continue;
            }
            if let Err(e) = listener.recovery(key, value) {
                warn!(listener = %name, error = %e, "Recovery listener failed");
                report.listener_failures += 1;
            }
            if let Err(e) = listener.recovery_with_ttl(key, value, ttl, unit) {
                warn!(listener = %name, error = %e, "Recovery listener failed");
                report.listener_failures += 1;
            }
        }
    }
}

impl<K, V> fmt::Debug for RecoveryPipeline<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.listeners.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("RecoveryPipeline")
            .field("persistence", &self.persistence)
            .field("hook", &self.hook.is_some())
            .field("listeners", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, Utf8Codec};
    use crate::config::PersistConfig;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    type Engine = Persistence<String, String>;

    fn engine(dir: &TempDir) -> Engine {
        Persistence::new(PersistConfig::enabled_at(dir.path()), Utf8Codec, JsonCodec)
    }

    fn put(engine: &Engine, key: &str, value: &str, ms: u64) {
        engine
            .of_set_persistence(
                key.to_string(),
                value.to_string(),
                Some(ms),
                Some(TimeUnit::Milliseconds),
            )
            .unwrap();
    }

    #[derive(Default)]
    struct Cache {
        reloaded: Mutex<Vec<(String, String, u64, TimeUnit)>>,
    }

    impl ReloadHook<String, String> for Cache {
        fn reload(&self, key: String, value: String, ttl: u64, unit: TimeUnit) {
            self.reloaded.lock().push((key, value, ttl, unit));
        }
    }

    #[derive(Default)]
    struct Recorder {
        plain: Mutex<Vec<String>>,
        with_ttl: Mutex<Vec<String>>,
    }

    impl RecoveryListener<String, String> for Recorder {
        fn recovery(&self, key: &String, _value: &String) -> anyhow::Result<()> {
            self.plain.lock().push(key.clone());
            Ok(())
        }

        fn recovery_with_ttl(&self, key: &String, _value: &String, _ttl: u64, _unit: TimeUnit) -> anyhow::Result<()> {
            self.with_ttl.lock().push(key.clone());
            Ok(())
        }
    }

    struct Failing;

    impl RecoveryListener<String, String> for Failing {
        fn recovery(&self, _key: &String, _value: &String) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    #[test]
    fn test_round_trip_through_fresh_engine() {
        let dir = TempDir::new().unwrap();
        put(&engine(&dir), "a", "b", 600_000);

        let restarted = engine(&dir);
        let cache = Arc::new(Cache::default());
        let report = RecoveryPipeline::new(restarted.clone())
            .with_hook(cache.clone())
            .run();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.restored, 1);
        let reloaded = cache.reloaded.lock();
        let (key, value, ttl, unit) = &reloaded[0];
        assert_eq!((key.as_str(), value.as_str()), ("a", "b"));
        assert_eq!(*unit, TimeUnit::Milliseconds);
        assert!(*ttl > 590_000 && *ttl <= 600_000);

        let handle = restarted.of_get(&"a".to_string()).unwrap();
        assert_eq!(handle.value(), "b");
    }

    #[test]
    fn test_expired_files_are_deleted() {
        let dir = TempDir::new().unwrap();
        let writer = engine(&dir);
        put(&writer, "short", "v", 30);
        put(&writer, "long", "v", 600_000);
        std::thread::sleep(std::time::Duration::from_millis(60));

        let restarted = engine(&dir);
        let report = RecoveryPipeline::new(restarted.clone()).run();

        assert_eq!(report.restored, 1);
        assert_eq!(report.expired, 1);
        assert!(!restarted.contains(&"short".to_string()));
        assert_eq!(restarted.files().list(RECORD_EXTENSION).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_expire_counts_as_expired() {
        let dir = TempDir::new().unwrap();
        let json = r#"{"payload":{"key":"YQ==","value":"ImIi"},"keyCodec":"utf8","valueCodec":"json"}"#;
        let path = dir.path().join("$manual.aof");
        std::fs::write(&path, format!("@\n{}\n@\n", json)).unwrap();

        let report = RecoveryPipeline::new(engine(&dir)).run();
        assert_eq!(report.expired, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_file_does_not_stop_recovery() {
        let dir = TempDir::new().unwrap();
        let writer = engine(&dir);
        for i in 0..4 {
            put(&writer, &format!("k{}", i), "v", 600_000);
        }
        std::fs::write(dir.path().join("$corrupt.aof"), "@\n{not json\n@\n").unwrap();

        let restarted = engine(&dir);
        let report = RecoveryPipeline::new(restarted.clone()).run();

        assert_eq!(report.scanned, 5);
        assert_eq!(report.restored, 4);
        assert_eq!(report.malformed(), 1);
        assert_eq!(restarted.len(), 4);
    }

    #[test]
    fn test_binary_garbage_counts_as_malformed() {
        let dir = TempDir::new().unwrap();
        put(&engine(&dir), "a", "b", 600_000);
        std::fs::write(dir.path().join("$bad.aof"), b"@\n\xff\xfe\n@\n").unwrap();

        let report = RecoveryPipeline::new(engine(&dir)).run();
        assert_eq!(report.restored, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.malformed(), 1);
        assert!(matches!(
            report.failures[0].error,
            PersistError::MalformedRecord { ref path, .. } if path.ends_with("$bad.aof")
        ));
    }

    #[test]
    fn test_unknown_codec_is_reported() {
        let dir = TempDir::new().unwrap();
        let json = r#"{"payload":{"key":"YQ==","value":"Yg=="},"expire":99999999999999,"keyCodec":"protobuf","valueCodec":"json"}"#;
        std::fs::write(dir.path().join("$x.aof"), format!("@\n{}\n@\n", json)).unwrap();

        let report = RecoveryPipeline::new(engine(&dir)).run();
        assert_eq!(report.restored, 0);
        assert!(matches!(
            report.failures[0].error,
            PersistError::CodecNotFound(ref name) if name == "protobuf"
        ));
    }

    #[test]
    fn test_listeners_called_twice_and_isolated() {
        let dir = TempDir::new().unwrap();
        let writer = engine(&dir);
        put(&writer, "a", "1", 600_000);
        put(&writer, "b", "2", 600_000);

        let recorder = Arc::new(Recorder::default());
        let report = RecoveryPipeline::new(engine(&dir))
            .with_listener("app.failing", Arc::new(Failing))
            .with_listener("app.recorder", recorder.clone())
            .run();

        assert_eq!(report.restored, 2);
        assert_eq!(report.listener_failures, 2);
        let mut plain = recorder.plain.lock().clone();
        plain.sort();
        assert_eq!(plain, vec!["a", "b"]);
        assert_eq!(recorder.with_ttl.lock().len(), 2);
    }

    #[test]
    fn test_listener_paths_filter() {
        let dir = TempDir::new().unwrap();
        put(&engine(&dir), "a", "1", 600_000);

        let mut config = PersistConfig::enabled_at(dir.path());
        config.listener_paths = vec!["app.session".to_string()];
        let restarted: Engine = Persistence::new(config, Utf8Codec, JsonCodec);

        let selected = Arc::new(Recorder::default());
        let skipped = Arc::new(Recorder::default());
        RecoveryPipeline::new(restarted)
            .with_listener("app.session.Audit", selected.clone())
            .with_listener("app.user.Audit", skipped.clone())
            .run();

        assert_eq!(selected.plain.lock().len(), 1);
        assert!(skipped.plain.lock().is_empty());
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let dir = TempDir::new().unwrap();
        put(&engine(&dir), "a", "1", 600_000);

        let restarted = engine(&dir);
        let pipeline = RecoveryPipeline::new(restarted.clone());
        let first = pipeline.run();
        let handle = restarted.of_get(&"a".to_string()).unwrap();
        let second = pipeline.run();

        assert_eq!((first.restored, second.restored), (1, 1));
        assert_eq!(restarted.len(), 1);
        // The handle registered by the first pass is kept.
        assert!(Arc::ptr_eq(&handle, &restarted.of_get(&"a".to_string()).unwrap()));
    }

    #[test]
    fn test_disabled_skips_everything() {
        let dir = TempDir::new().unwrap();
        put(&engine(&dir), "a", "1", 600_000);

        let mut config = PersistConfig::enabled_at(dir.path());
        config.enabled = false;
        let report = RecoveryPipeline::new(Persistence::<String, String>::new(config, Utf8Codec, JsonCodec)).run();
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn test_spawn_runs_in_background() {
        let dir = TempDir::new().unwrap();
        put(&engine(&dir), "a", "1", 600_000);

        let handle = RecoveryPipeline::new(engine(&dir)).spawn().unwrap();
        let report = handle.join().unwrap();
        assert_eq!(report.restored, 1);
    }
}
