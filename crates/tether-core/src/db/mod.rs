//! Database layer for Tether

mod conflicts;
mod connection;
mod migrations;
mod mutation_log;
mod query_cache;
mod repository;

pub use connection::Database;
pub use query_cache::QueryCacheEntry;

pub(crate) use conflicts::{insert_conflict, list_conflicts};
pub(crate) use mutation_log::{
    clear_collection as clear_mutations, collections_with_pending, delete_entries, delete_entry,
    load_entry, load_pending, pending_count, record as record_mutation, rebase_entry,
};
pub(crate) use query_cache::{
    clear_collection as clear_query_cache, forget_ids as forget_cached_ids, load_aggregation,
    load_entry as load_query_cache, store_aggregation, store_entry as store_query_cache,
};
pub(crate) use repository::{
    delete_collection, delete_entity, load_collection, load_entities, load_entity,
    load_modified_at, upsert_entity,
};
