//! Storage Engine Module
//!
//! The in-memory cache that cache-persist overlays. It is a thread-safe,
//! sharded key-value store with TTL support that can mirror its mutations
//! through a [`PersistSolver`](crate::persistence::PersistSolver) and accepts
//! recovered entries as a [`ReloadHook`](crate::persistence::ReloadHook).
//!
//! ## Example
//!
//! ```
//! use cache_persist::codec::RawBytesCodec;
//! use cache_persist::config::PersistConfig;
//! use cache_persist::persistence::{PersistSolver, Persistence};
//! use cache_persist::storage::StorageEngine;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let persistence = Persistence::new(
//!     PersistConfig::enabled_at(dir.path()),
//!     RawBytesCodec,
//!     RawBytesCodec,
//! );
//! let engine = StorageEngine::with_persistence(PersistSolver::new(persistence));
//!
//! engine.set_with_ttl(
//!     Bytes::from("session"),
//!     Bytes::from("token123"),
//!     Duration::from_secs(3600)
//! );
//! assert_eq!(engine.get(&Bytes::from("session")), Some(Bytes::from("token123")));
//! ```

pub mod engine;

pub use engine::{Entry, StorageEngine, StorageStats};
