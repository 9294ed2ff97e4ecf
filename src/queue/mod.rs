//! Persistent queue of deferred upload-and-patch work.
//!
//! Producers enqueue a task when a payload could not be uploaded inline; the
//! sync engine drains the queue later. The queue itself knows nothing about
//! network state.

mod storage;
mod task;

pub use storage::{SqliteQueue, TaskQueue};
pub use task::{EmbeddedPayload, NewTask, Scope, Task, TaskId};
