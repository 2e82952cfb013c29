//! Services shared by every client of the crate.

mod data_store;
mod local_store;

pub use data_store::{DataStore, StoreMode};
pub use local_store::{CacheUpdate, LocalStore};
pub(crate) use local_store::PullChanges;
