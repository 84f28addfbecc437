//! # cache-persist - A Disk-Backed Overlay for In-Memory TTL Caches
//!
//! cache-persist keeps selected entries of an in-memory cache on disk, one
//! small file per key, so they survive a process restart. On the next start
//! the files are read back, expired entries are discarded and the live ones
//! are pushed into the cache with their remaining time to live.
//!
//! ## Features
//!
//! - **One File per Key**: `<root>/<prefix><sha256(key)>.aof`, rewritten in place
//! - **Absolute Deadlines**: records store when they expire, not how long they live
//! - **Pluggable Codecs**: keys and values are serialized by named codecs
//! - **Contained Failures**: persistence problems are logged, never surfaced to the cache
//! - **Sync or Async Writes**: mutations run inline or on the Tokio blocking pool
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            cache-persist                                │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────────┐ │
//! │  │StorageEngine│───>│PersistSolver│───>│ Persistence (registry)       │ │
//! │  │ (in-memory) │    │  + Runner   │    │ DashMap<KeyIdentity, Handle> │ │
//! │  └──────▲──────┘    └─────────────┘    └──────────────┬───────────────┘ │
//! │         │ reload                                      │                 │
//! │  ┌──────┴───────────┐                   ┌─────────────▼───────────────┐ │
//! │  │ RecoveryPipeline │<──────────────────│ FileManager (one .aof/key)  │ │
//! │  │  (startup)       │    read records   └─────────────────────────────┘ │
//! │  └──────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cache_persist::codec::RawBytesCodec;
//! use cache_persist::config::PersistConfig;
//! use cache_persist::persistence::{PersistSolver, Persistence, RecoveryPipeline};
//! use cache_persist::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let config = PersistConfig::from_env()?;
//! let persistence = Persistence::new(config, RawBytesCodec, RawBytesCodec);
//! let cache = Arc::new(StorageEngine::with_persistence(PersistSolver::new(persistence.clone())));
//!
//! // Replay what the previous run left on disk
//! let report = RecoveryPipeline::new(persistence).with_hook(cache.clone()).run();
//! println!("restored {} entries", report.restored);
//! ```
//!
//! ## Module Overview
//!
//! - [`persistence`]: identity, files, records, handles, registry, recovery and execution policy
//! - [`storage`]: sharded in-memory cache with TTL support
//! - [`codec`]: key and value codecs
//! - [`config`]: engine configuration, loadable from the environment
//! - [`error`]: the crate error type
//! - [`time`]: time units and the wall clock

pub mod codec;
pub mod config;
pub mod error;
pub mod persistence;
pub mod storage;
pub mod time;

// Re-export commonly used types for convenience
pub use codec::{Codec, JsonCodec, RawBytesCodec, Utf8Codec};
pub use config::PersistConfig;
pub use error::{PersistError, Result};
pub use persistence::{
    PersistHandle, PersistSolver, Persistence, RecoveryListener, RecoveryPipeline, ReloadHook,
};
pub use storage::StorageEngine;
pub use time::TimeUnit;

/// Version of cache-persist
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
