//! Queue storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

use super::task::{NewTask, StoredTask, Task, TaskId};

/// Trait for task queue backends.
///
/// Every operation is atomic: it is either fully applied or not at all.
pub trait TaskQueue: Send + Sync {
  /// Durably persist a task and return its id.
  fn enqueue(&self, task: &NewTask) -> Result<TaskId>;

  /// Persist a producer's raw JSON in whichever schema generation it uses.
  fn enqueue_json(&self, value: Value) -> Result<TaskId>;

  /// Every pending task, in id order. Rows that cannot be decoded are
  /// left in place and reported, never returned.
  fn list_all(&self) -> Result<Vec<Task>>;

  /// Delete a task. Deleting an absent id is not an error.
  fn remove(&self, id: TaskId) -> Result<()>;

  fn count(&self) -> Result<usize>;

  fn clear(&self) -> Result<()>;

  /// Every pending task, oldest first (FIFO processing order).
  fn take_all(&self) -> Result<Vec<Task>> {
    let mut tasks = self.list_all()?;
    tasks.sort_by_key(|t| (t.created_at, t.id));
    Ok(tasks)
  }
}

/// SQLite-backed task queue.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

impl SqliteQueue {
  /// Open the queue stored in the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = crate::db::open(path)?;
    Ok(Self::from_connection(conn))
  }

  pub fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn insert(&self, stored: &StoredTask) -> Result<TaskId> {
    stored.validate()?;
    let conn = self.conn()?;
    let body = stored.encode()?;
    let created_at = stored.created_at();

    conn
      .execute(
        "INSERT INTO task_queue (schema_version, body, created_at) VALUES (?, ?, ?)",
        params![stored.schema_version(), body, created_at],
      )
      .map_err(|e| eyre!("Failed to enqueue task: {}", e))?;

    let id = conn.last_insert_rowid();
    debug!(id, schema = stored.schema_version(), "task enqueued");
    Ok(id)
  }
}

impl TaskQueue for SqliteQueue {
  fn enqueue(&self, task: &NewTask) -> Result<TaskId> {
    self.insert(&StoredTask::Current(task.clone()))
  }

  fn enqueue_json(&self, value: Value) -> Result<TaskId> {
    let stored = StoredTask::detect(value)?;
    self.insert(&stored)
  }

  fn list_all(&self) -> Result<Vec<Task>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT id, schema_version, body, created_at FROM task_queue ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(TaskId, i64, String, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    let mut tasks = Vec::with_capacity(rows.len());
    for (id, schema_version, body, created_at) in rows {
      match StoredTask::decode(schema_version, &body) {
        Ok(stored) => tasks.push(stored.into_task(id, created_at)),
        Err(e) => error!(id, schema_version, error = %e, "undecodable task kept in queue"),
      }
    }

    Ok(tasks)
  }

  fn remove(&self, id: TaskId) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM task_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove task {}: {}", id, e))?;
    Ok(())
  }

  fn count(&self) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count tasks: {}", e))?;
    Ok(count as usize)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM task_queue", [])
      .map_err(|e| eyre!("Failed to clear queue: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{EmbeddedPayload, Scope};
  use serde_json::json;
  use std::sync::Arc;

  fn scope() -> Scope {
    Scope {
      client: "ACME".to_string(),
      unit: "North".to_string(),
    }
  }

  fn memory_queue() -> SqliteQueue {
    SqliteQueue::from_connection(crate::db::open_in_memory().unwrap())
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids() {
    let queue = memory_queue();
    let a = queue
      .enqueue(&NewTask::new("logbook-upload", "logbook/1", scope()))
      .unwrap();
    let b = queue
      .enqueue(&NewTask::new("logbook-upload", "logbook/2", scope()))
      .unwrap();
    assert!(b > a);
    assert_eq!(queue.count().unwrap(), 2);
  }

  #[test]
  fn test_take_all_orders_by_created_at() {
    let queue = memory_queue();
    queue
      .enqueue(&NewTask::new("k", "late", scope()).with_created_at(300))
      .unwrap();
    queue
      .enqueue(&NewTask::new("k", "early", scope()).with_created_at(100))
      .unwrap();
    queue
      .enqueue_json(json!({
        "type": "cuaderno-upload",
        "docPath": "middle",
        "cliente": "ACME",
        "unidad": "North",
        "createdAt": 200
      }))
      .unwrap();

    let paths: Vec<_> = queue
      .take_all()
      .unwrap()
      .into_iter()
      .map(|t| t.target_record_path.unwrap())
      .collect();
    assert_eq!(paths, vec!["early", "middle", "late"]);
  }

  #[test]
  fn test_remove_missing_is_noop() {
    let queue = memory_queue();
    let id = queue.enqueue(&NewTask::new("k", "p", scope())).unwrap();
    queue.remove(id).unwrap();
    queue.remove(id).unwrap();
    queue.remove(9999).unwrap();
    assert_eq!(queue.count().unwrap(), 0);
  }

  #[test]
  fn test_clear() {
    let queue = memory_queue();
    queue.enqueue(&NewTask::new("k", "a", scope())).unwrap();
    queue.enqueue(&NewTask::new("k", "b", scope())).unwrap();
    queue.clear().unwrap();
    assert_eq!(queue.count().unwrap(), 0);
    assert!(queue.list_all().unwrap().is_empty());
  }

  #[test]
  fn test_tasks_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let removed;
    {
      let queue = SqliteQueue::open(&path).unwrap();
      queue
        .enqueue(
          &NewTask::new("incident-upload", "incidents/1", scope())
            .with_payload(EmbeddedPayload::new("photo", "AAAA"))
            .with_created_at(1),
        )
        .unwrap();
      removed = queue
        .enqueue(&NewTask::new("incident-upload", "incidents/2", scope()).with_created_at(2))
        .unwrap();
      queue
        .enqueue(&NewTask::new("incident-upload", "incidents/3", scope()).with_created_at(3))
        .unwrap();
      queue.remove(removed).unwrap();
    }

    let queue = SqliteQueue::open(&path).unwrap();
    let tasks = queue.take_all().unwrap();
    let paths: Vec<_> = tasks
      .iter()
      .map(|t| t.target_record_path.clone().unwrap())
      .collect();
    assert_eq!(paths, vec!["incidents/1", "incidents/3"]);
    assert!(tasks.iter().all(|t| t.id != removed));
    assert_eq!(tasks[0].embedded_payloads[0].data, "AAAA");
  }

  #[test]
  fn test_concurrent_producers_lose_nothing() {
    let queue = Arc::new(memory_queue());
    let handles: Vec<_> = (0..4)
      .map(|worker| {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
          for i in 0..25 {
            queue
              .enqueue(&NewTask::new("k", format!("w{}/{}", worker, i), scope()))
              .unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    let tasks = queue.list_all().unwrap();
    assert_eq!(tasks.len(), 100);
    let mut ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 100);
  }

  #[test]
  fn test_duplicate_payload_names_are_not_enqueued() {
    let queue = memory_queue();
    let task = NewTask::new("incident-upload", "incidents/1", scope())
      .with_payload(EmbeddedPayload::new("photo", "AAAA"))
      .with_payload(EmbeddedPayload::new("photo", "BBBB"));
    assert!(queue.enqueue(&task).is_err());
    assert_eq!(queue.count().unwrap(), 0);
  }

  #[test]
  fn test_undecodable_row_is_kept_but_not_listed() {
    let queue = memory_queue();
    {
      let conn = queue.conn().unwrap();
      conn
        .execute(
          "INSERT INTO task_queue (schema_version, body, created_at) VALUES (2, 'not json', 0)",
          [],
        )
        .unwrap();
    }
    queue
      .enqueue(&NewTask::new("k", "a/1", scope()))
      .unwrap();

    let tasks = queue.list_all().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].target_record_path.as_deref(), Some("a/1"));
    assert_eq!(queue.count().unwrap(), 2);
  }
}
