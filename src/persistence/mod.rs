//! Persistence Module
//!
//! Disk-backed overlay for a TTL cache: every persisted entry lives in one
//! small file, and the files are replayed into the cache on the next start.
//!
//! ## Architecture
//!
//! ```text
//!      cache mutation                         startup
//!            │                                   │
//!            ▼                                   ▼
//!   ┌─────────────────┐                ┌──────────────────┐
//!   │  PersistSolver  │──> Runner      │ RecoveryPipeline │──> ReloadHook
//!   └────────┬────────┘  (sync/async)  └────────┬─────────┘──> listeners
//!            │                                  │
//!            ▼                                  ▼
//!   ┌──────────────────────────────────────────────────────┐
//!   │               Persistence (registry)                 │
//!   │   DashMap<KeyIdentity, Arc<PersistHandle<K, V>>>     │
//!   └────────────────────────┬─────────────────────────────┘
//!                            │ one handle per key, RwLock<Record>
//!                            ▼
//!   ┌──────────────────────────────────────────────────────┐
//!   │   FileManager: <root>/<prefix><sha256(key)>.aof      │
//!   └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use cache_persist::codec::{JsonCodec, Utf8Codec};
//! use cache_persist::config::PersistConfig;
//! use cache_persist::persistence::Persistence;
//! use cache_persist::time::TimeUnit;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let engine: Persistence<String, String> =
//!     Persistence::new(PersistConfig::enabled_at(dir.path()), Utf8Codec, JsonCodec);
//!
//! let handle = engine
//!     .of_set_persistence("a".into(), "b".into(), Some(10), Some(TimeUnit::Minutes))
//!     .unwrap();
//! assert!(handle.exists());
//! assert_eq!(engine.of_get(&"a".into()).unwrap().value(), "b");
//! ```

pub mod file;
pub mod handle;
pub mod identity;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod runner;
pub mod solver;

pub use file::{FileManager, RECORD_EXTENSION};
pub use handle::PersistHandle;
pub use identity::KeyIdentity;
pub use record::{DefaultTtl, Record, RecordEnvelope};
pub use recovery::{RecoveryFailure, RecoveryListener, RecoveryPipeline, RecoveryReport, ReloadHook};
pub use registry::{Persistence, PersistenceBuilder};
pub use runner::Runner;
pub use solver::PersistSolver;
