//! Cache & shell layer.
//!
//! A versioned worker sits in front of the application's outbound requests.
//! It eagerly caches the application shell when installed, serves pages and
//! assets through per-class strategies, and evicts every older cache
//! generation when a new version activates.

mod fetch;
mod gateway;
mod request;
mod storage;
mod strategy;
mod worker;

pub use fetch::HttpFetcher;
pub use gateway::router;
pub use request::ShellResponse;
pub use storage::{CacheStorage, SqliteCacheStorage};
pub use worker::{ShellHost, ShellWorker, ACTIVE_VERSION_KEY};
