//! Boundary to the remote document store and blob store.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// A single field change in a merge patch.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
  Set(Value),
  Delete,
  /// Replaced by the store's own clock when the patch is applied
  ServerTimestamp,
}

/// A partial update to a remote record. Fields not mentioned are untouched.
///
/// Applying the same patch twice yields the same field values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
  fields: BTreeMap<String, PatchValue>,
}

impl RecordPatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
    self.fields.insert(field.into(), PatchValue::Set(value));
    self
  }

  pub fn delete(&mut self, field: impl Into<String>) -> &mut Self {
    self.fields.insert(field.into(), PatchValue::Delete);
    self
  }

  pub fn server_timestamp(&mut self, field: impl Into<String>) -> &mut Self {
    self.fields.insert(field.into(), PatchValue::ServerTimestamp);
    self
  }

  #[cfg(test)]
  pub fn get(&self, field: &str) -> Option<&PatchValue> {
    self.fields.get(field)
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn fields(&self) -> impl Iterator<Item = (&String, &PatchValue)> {
    self.fields.iter()
  }

  /// Stamp the reconnection metadata written alongside every upload patch.
  pub fn stamp_reconnection(&mut self, local_at: &str, device_time_zone: &str) -> &mut Self {
    self.set("reconnected", Value::Bool(true));
    self.server_timestamp("reconnectedAt");
    self.set("reconnectedLocalAt", Value::String(local_at.to_string()));
    self.set(
      "reconnectedDeviceTz",
      Value::String(device_time_zone.to_string()),
    );
    self
  }

  /// Encode as a JSON merge-patch body: `null` deletes a field and
  /// `{".sv": "timestamp"}` asks the server for its own timestamp.
  pub fn to_merge_body(&self) -> Value {
    let mut body = Map::new();
    for (field, value) in &self.fields {
      let encoded = match value {
        PatchValue::Set(v) => v.clone(),
        PatchValue::Delete => Value::Null,
        PatchValue::ServerTimestamp => json!({ ".sv": "timestamp" }),
      };
      body.insert(field.clone(), encoded);
    }
    Value::Object(body)
  }
}

/// Remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
  /// Fetch a record, `None` if it does not exist.
  async fn get(&self, path: &str) -> Result<Option<Value>>;

  /// Merge `patch` into the record at `path`, creating it if needed.
  async fn merge_patch(&self, path: &str, patch: &RecordPatch) -> Result<()>;
}

/// Remote blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
  async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

  /// A retrievable address for the blob stored at `path`.
  async fn download_url(&self, path: &str) -> Result<String>;
}
