pub mod cache;
pub mod config;
pub mod counters;
pub mod deferred;
pub mod hooks;
pub mod memory_store;
pub mod migrate;
pub mod runtime;
pub mod sampling;
pub mod sqlite_store;
pub mod store;
