//! Background synchronization of queued tasks.
//!
//! The engine drains the task queue when the device is online: embedded
//! payloads are uploaded to blob storage and the owning remote record is
//! patched to point at the hosted copies. Several trigger sources feed one
//! drain loop; a single-flight guard discards overlapping drains.

mod engine;
mod http;
mod payload;
mod remote;
mod triggers;

pub use engine::{device_time_zone, Backends, DrainOutcome, SkipReason, SyncEngine, SyncState};
pub use http::{RestBlobStore, RestDocumentStore};
pub use triggers::{spawn_connectivity_probe, spawn_drain_loop, DrainTrigger, SyncHandle};
