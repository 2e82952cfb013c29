//! tether-core - offline cache and delta sync for backend collections
//!
//! Entities live in a local libSQL store. Local writes are recorded in a
//! mutation log, pushed to the remote by the [`SyncEngine`], and remote
//! changes are pulled back with delta queries when a fresh cursor allows.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod query;
pub mod services;
pub mod sync;
pub mod util;

pub use config::{ClientConfig, SyncSettings};
pub use error::{Error, Result};
pub use models::{ConflictResolution, Entity, PendingMarker, PendingMutation, SyncConflict};
pub use network::{AppCredentials, Gateway, HttpGateway, MemoryGateway, Remote};
pub use query::Query;
pub use services::{CacheUpdate, DataStore, LocalStore, StoreMode};
pub use sync::{
    ConflictPolicy, PullMode, PullOptions, PullResult, PushResult, SyncEngine, SyncResult,
};
