//! Handlers for the one-shot CLI subcommands.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::daemon;
use crate::queue::{EmbeddedPayload, NewTask, Scope, TaskId, TaskQueue};
use crate::shell::{CacheStorage, ACTIVE_VERSION_KEY};
use crate::sync::DrainOutcome;

/// MIME type for a payload file, from its extension.
fn content_type_for(path: &Path) -> &'static str {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_ascii_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    "webp" => "image/webp",
    "gif" => "image/gif",
    "pdf" => "application/pdf",
    _ => "application/octet-stream",
  }
}

/// Parse a `name=path` payload argument.
fn parse_payload_arg(arg: &str) -> Result<(String, PathBuf)> {
  let (name, path) = arg
    .split_once('=')
    .ok_or_else(|| eyre!("Payload must look like name=path, got {}", arg))?;
  if name.is_empty() || path.is_empty() {
    return Err(eyre!("Payload must look like name=path, got {}", arg));
  }
  Ok((name.to_string(), PathBuf::from(path)))
}

pub struct AddTask {
  pub kind: String,
  pub path: String,
  pub client: String,
  pub unit: String,
  pub payloads: Vec<String>,
}

pub fn queue_add(config: &Config, args: AddTask) -> Result<TaskId> {
  let mut task = NewTask::new(
    args.kind,
    args.path,
    Scope {
      client: args.client,
      unit: args.unit,
    },
  );
  for arg in &args.payloads {
    let (name, path) = parse_payload_arg(arg)?;
    let bytes = std::fs::read(&path)
      .map_err(|e| eyre!("Failed to read payload {}: {}", path.display(), e))?;
    task = task.with_payload(EmbeddedPayload::from_bytes(
      name,
      &bytes,
      content_type_for(&path),
    ));
  }

  let id = daemon::open_queue(config)?.enqueue(&task)?;
  println!("{}", id);
  Ok(id)
}

/// Enqueue raw producer JSON: one object or an array of objects, from a
/// file or stdin (`-`).
pub fn queue_import(config: &Config, source: &Path) -> Result<Vec<TaskId>> {
  let contents = if source == Path::new("-") {
    let mut buf = String::new();
    std::io::stdin()
      .read_to_string(&mut buf)
      .map_err(|e| eyre!("Failed to read stdin: {}", e))?;
    buf
  } else {
    std::fs::read_to_string(source)
      .map_err(|e| eyre!("Failed to read {}: {}", source.display(), e))?
  };

  let value: Value =
    serde_json::from_str(&contents).map_err(|e| eyre!("Failed to parse task JSON: {}", e))?;
  let items = match value {
    Value::Array(items) => items,
    other => vec![other],
  };

  let queue = daemon::open_queue(config)?;
  let mut ids = Vec::with_capacity(items.len());
  for item in items {
    ids.push(queue.enqueue_json(item)?);
  }
  println!("imported {} task(s)", ids.len());
  Ok(ids)
}

pub fn queue_list(config: &Config, json: bool) -> Result<()> {
  let tasks = daemon::open_queue(config)?.take_all()?;

  if json {
    let out = serde_json::to_string_pretty(&tasks)
      .map_err(|e| eyre!("Failed to serialize tasks: {}", e))?;
    println!("{}", out);
    return Ok(());
  }

  for task in &tasks {
    let scope = task
      .scope
      .as_ref()
      .map(|s| format!("{}/{}", s.client, s.unit))
      .unwrap_or_else(|| "-".to_string());
    let payloads: Vec<&str> = task
      .embedded_payloads
      .iter()
      .map(|p| p.name.as_str())
      .collect();
    println!(
      "{:>6}  {:<20} {:<30} {:<24} [{}]{}",
      task.id,
      task.kind,
      task.target_record_path.as_deref().unwrap_or("-"),
      scope,
      payloads.join(","),
      if task.is_well_formed() { "" } else { "  malformed" }
    );
  }
  Ok(())
}

pub fn queue_remove(config: &Config, id: TaskId) -> Result<()> {
  daemon::open_queue(config)?.remove(id)
}

pub fn queue_count(config: &Config) -> Result<usize> {
  let count = daemon::open_queue(config)?.count()?;
  println!("{}", count);
  Ok(count)
}

pub fn queue_clear(config: &Config) -> Result<()> {
  daemon::open_queue(config)?.clear()
}

pub async fn flush(config: &Config) -> Result<()> {
  match daemon::flush_once(config).await? {
    DrainOutcome::Completed(report) => println!(
      "processed {}, discarded {}, failed {}",
      report.processed, report.discarded, report.failed
    ),
    DrainOutcome::Skipped(reason) => println!("skipped: {:?}", reason),
  }
  Ok(())
}

pub fn status(config: &Config) -> Result<()> {
  let pending = daemon::open_queue(config)?.count()?;
  let storage = daemon::open_cache_storage(config)?;
  let active = storage.get_meta(ACTIVE_VERSION_KEY)?;

  println!("database:     {}", config.database_path()?.display());
  println!("pending:      {}", pending);
  println!(
    "sync:         {}",
    if config.sync.document_store_url.is_some() && config.sync.blob_store_url.is_some() {
      "configured"
    } else {
      "not configured"
    }
  );
  println!("shell:        {}", active.as_deref().unwrap_or("never activated"));
  println!("caches:       {}", storage.cache_names()?.join(", "));
  Ok(())
}

pub fn shell_purge(config: &Config) -> Result<usize> {
  let removed = daemon::open_cache_storage(config)?.delete_all()?;
  println!("removed {} cached response(s)", removed);
  Ok(removed)
}

pub fn shell_caches(config: &Config) -> Result<()> {
  for name in daemon::open_cache_storage(config)?.cache_names()? {
    println!("{}", name);
  }
  Ok(())
}

/// Print a remote record, e.g. to check a task's patch landed.
pub async fn record(config: &Config, path: &str) -> Result<()> {
  let backends =
    daemon::build_backends(config)?.ok_or_else(|| eyre!("Backends are not configured"))?;
  match backends.documents.get(path).await? {
    Some(record) => {
      let out = serde_json::to_string_pretty(&record)
        .map_err(|e| eyre!("Failed to serialize record: {}", e))?;
      println!("{}", out);
    }
    None => println!("{} not found", path),
  }
  Ok(())
}
