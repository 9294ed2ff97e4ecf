//! Task types and the normalization of both stored schema generations.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TaskId = i64;

const DEFAULT_KIND: &str = "generic";

/// Tenant/unit identifiers under which uploaded blobs are filed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
  pub client: String,
  pub unit: String,
}

/// A named payload embedded in a record because it could not be uploaded.
///
/// `data` is either a `data:` URL or bare base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedPayload {
  pub name: String,
  pub data: String,
  /// Remote field currently holding the embedded data
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub embedded_field: Option<String>,
  /// Remote field that receives the hosted reference
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hosted_field: Option<String>,
}

impl EmbeddedPayload {
  pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      data: data.into(),
      embedded_field: None,
      hosted_field: None,
    }
  }

  /// Embed raw bytes as a `data:` URL.
  pub fn from_bytes(name: impl Into<String>, bytes: &[u8], content_type: &str) -> Self {
    let data = format!("data:{};base64,{}", content_type, BASE64_STANDARD.encode(bytes));
    Self::new(name, data)
  }

  pub fn embedded_field(&self) -> String {
    self
      .embedded_field
      .clone()
      .unwrap_or_else(|| format!("{}Embedded", self.name))
  }

  pub fn hosted_field(&self) -> String {
    self
      .hosted_field
      .clone()
      .unwrap_or_else(|| format!("{}Url", self.name))
  }
}

/// A task as written by a producer (current schema).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
  #[serde(default)]
  pub kind: Option<String>,
  #[serde(default)]
  pub target_record_path: Option<String>,
  #[serde(default)]
  pub scope: Option<Scope>,
  #[serde(default)]
  pub embedded_payloads: Vec<EmbeddedPayload>,
  #[serde(default)]
  pub created_at: Option<i64>,
}

impl NewTask {
  pub fn new(kind: impl Into<String>, target_record_path: impl Into<String>, scope: Scope) -> Self {
    Self {
      kind: Some(kind.into()),
      target_record_path: Some(target_record_path.into()),
      scope: Some(scope),
      embedded_payloads: Vec::new(),
      created_at: None,
    }
  }

  pub fn with_payload(mut self, payload: EmbeddedPayload) -> Self {
    self.embedded_payloads.push(payload);
    self
  }

  pub fn with_created_at(mut self, created_at: i64) -> Self {
    self.created_at = Some(created_at);
    self
  }
}

/// Older producers flattened the scope and named payloads by field.
///
/// The queue stamped `kind` onto these records too, usually as the
/// `generic` placeholder, so it is kept next to `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTask {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(default, rename = "type")]
  pub task_type: Option<String>,
  #[serde(default, rename = "docPath")]
  pub doc_path: Option<String>,
  #[serde(default)]
  pub cliente: Option<String>,
  #[serde(default)]
  pub unidad: Option<String>,
  #[serde(default, rename = "fotoEmbedded")]
  pub foto_embedded: Option<String>,
  #[serde(default)]
  pub foto_base64: Option<String>,
  #[serde(default, rename = "firmaEmbedded")]
  pub firma_embedded: Option<String>,
  #[serde(default)]
  pub firma_base64: Option<String>,
  #[serde(default, rename = "createdAt")]
  pub created_at: Option<i64>,
}

/// Keys that carry data only in the current shape. `kind` is not one of
/// them: legacy records carry it as well.
const CURRENT_KEYS: &[&str] = &["targetRecordPath", "scope", "embeddedPayloads"];

/// A task body as persisted, tagged with its schema generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredTask {
  Legacy(LegacyTask),
  Current(NewTask),
}

impl StoredTask {
  pub const LEGACY_VERSION: i64 = 1;
  pub const CURRENT_VERSION: i64 = 2;

  pub fn schema_version(&self) -> i64 {
    match self {
      Self::Legacy(_) => Self::LEGACY_VERSION,
      Self::Current(_) => Self::CURRENT_VERSION,
    }
  }

  /// Classify a producer's raw JSON object by the field names it uses.
  ///
  /// Only a record naming its target, scope or payloads the current way is
  /// current; anything else is read through the legacy field names.
  pub fn detect(value: Value) -> Result<Self> {
    let obj = value
      .as_object()
      .ok_or_else(|| eyre!("Task must be a JSON object"))?;

    if CURRENT_KEYS.iter().any(|k| obj.contains_key(*k)) {
      let task =
        serde_json::from_value(value).map_err(|e| eyre!("Failed to parse task: {}", e))?;
      Ok(Self::Current(task))
    } else {
      let task = serde_json::from_value(value)
        .map_err(|e| eyre!("Failed to parse legacy task: {}", e))?;
      Ok(Self::Legacy(task))
    }
  }

  /// Rows tagged current are re-detected, so mixed records stored before
  /// detection ignored `kind` still surface their legacy fields.
  pub fn decode(schema_version: i64, body: &str) -> Result<Self> {
    match schema_version {
      Self::LEGACY_VERSION => serde_json::from_str(body)
        .map(Self::Legacy)
        .map_err(|e| eyre!("Failed to decode legacy task: {}", e)),
      Self::CURRENT_VERSION => {
        let value: Value =
          serde_json::from_str(body).map_err(|e| eyre!("Failed to decode task: {}", e))?;
        Self::detect(value)
      }
      other => Err(eyre!("Unknown task schema version {}", other)),
    }
  }

  /// Payload names pick the blob path and the record fields, so they must
  /// be unique within a task.
  pub fn validate(&self) -> Result<()> {
    if let Self::Current(t) = self {
      let mut seen = std::collections::HashSet::new();
      for payload in &t.embedded_payloads {
        if !seen.insert(payload.name.as_str()) {
          return Err(eyre!("Duplicate payload name {}", payload.name));
        }
      }
    }
    Ok(())
  }

  pub fn encode(&self) -> Result<String> {
    match self {
      Self::Legacy(t) => serde_json::to_string(t),
      Self::Current(t) => serde_json::to_string(t),
    }
    .map_err(|e| eyre!("Failed to serialize task: {}", e))
  }

  /// Producer-supplied creation time, or now.
  pub fn created_at(&self) -> i64 {
    let explicit = match self {
      Self::Legacy(t) => t.created_at,
      Self::Current(t) => t.created_at,
    };
    explicit.unwrap_or_else(|| Utc::now().timestamp_millis())
  }

  /// Normalize into the canonical task.
  pub fn into_task(self, id: TaskId, created_at: i64) -> Task {
    match self {
      Self::Current(t) => Task {
        id,
        kind: non_empty(t.kind).unwrap_or_else(|| DEFAULT_KIND.to_string()),
        target_record_path: non_empty(t.target_record_path),
        scope: t
          .scope
          .filter(|s| !s.client.trim().is_empty() && !s.unit.trim().is_empty()),
        embedded_payloads: t
          .embedded_payloads
          .into_iter()
          .filter(|p| !p.data.is_empty())
          .collect(),
        created_at,
      },
      Self::Legacy(t) => {
        let scope = match (non_empty(t.cliente), non_empty(t.unidad)) {
          (Some(client), Some(unit)) => Some(Scope { client, unit }),
          _ => None,
        };

        let mut embedded_payloads = Vec::new();
        if let Some(data) = non_empty(t.foto_embedded).or(non_empty(t.foto_base64)) {
          embedded_payloads.push(EmbeddedPayload {
            name: "photo".to_string(),
            data,
            embedded_field: Some("fotoEmbedded".to_string()),
            hosted_field: Some("fotoURL".to_string()),
          });
        }
        if let Some(data) = non_empty(t.firma_embedded).or(non_empty(t.firma_base64)) {
          embedded_payloads.push(EmbeddedPayload {
            name: "signature".to_string(),
            data,
            embedded_field: Some("firmaEmbedded".to_string()),
            hosted_field: Some("firmaURL".to_string()),
          });
        }

        Task {
          id,
          kind: non_empty(t.kind)
            .filter(|k| k.as_str() != DEFAULT_KIND)
            .or(non_empty(t.task_type))
            .unwrap_or_else(|| DEFAULT_KIND.to_string()),
          target_record_path: non_empty(t.doc_path),
          scope,
          embedded_payloads,
          created_at,
        }
      }
    }
  }
}

fn non_empty(s: Option<String>) -> Option<String> {
  s.filter(|v| !v.trim().is_empty())
}

/// A pending unit of deferred work, normalized from either schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: TaskId,
  pub kind: String,
  pub target_record_path: Option<String>,
  pub scope: Option<Scope>,
  pub embedded_payloads: Vec<EmbeddedPayload>,
  /// Epoch milliseconds
  pub created_at: i64,
}

impl Task {
  /// A task can only be processed if it names its record and scope.
  pub fn is_well_formed(&self) -> bool {
    self.target_record_path.is_some() && self.scope.is_some()
  }
}
