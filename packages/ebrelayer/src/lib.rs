//! Peggy ebrelayer - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod bounded_cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod metrics;
pub mod retry;
pub mod rpc;
pub mod settlement;
pub mod sink;
pub mod watchers;
