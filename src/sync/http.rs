//! HTTP clients for the remote document store and blob store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::remote::{BlobStore, DocumentStore, RecordPatch};

fn build_client(token: &str, timeout: Duration) -> Result<reqwest::Client> {
  let mut headers = HeaderMap::new();
  let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
    .map_err(|e| eyre!("Invalid API token: {}", e))?;
  auth.set_sensitive(true);
  headers.insert(AUTHORIZATION, auth);

  reqwest::Client::builder()
    .default_headers(headers)
    .timeout(timeout)
    .build()
    .map_err(|e| eyre!("Failed to create HTTP client: {}", e))
}

/// Join `base`, a fixed collection segment and a slash-separated record path.
fn endpoint(base: &Url, collection: &str, path: &str) -> Result<Url> {
  let mut url = base.clone();
  {
    let mut segments = url
      .path_segments_mut()
      .map_err(|_| eyre!("Base URL {} cannot hold a path", base))?;
    segments.pop_if_empty().push(collection);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
      segments.push(segment);
    }
  }
  Ok(url)
}

/// Document store client speaking JSON merge-patch.
#[derive(Clone)]
pub struct RestDocumentStore {
  client: reqwest::Client,
  base: Url,
}

impl RestDocumentStore {
  pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
    let base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid document store URL {}: {}", base_url, e))?;
    Ok(Self {
      client: build_client(token, timeout)?,
      base,
    })
  }
}

#[async_trait]
impl DocumentStore for RestDocumentStore {
  async fn get(&self, path: &str) -> Result<Option<Value>> {
    let url = endpoint(&self.base, "documents", path)?;

    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get record {}: {}", path, e))?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }

    let record = response
      .error_for_status()
      .map_err(|e| eyre!("Failed to get record {}: {}", path, e))?
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse record {}: {}", path, e))?;

    Ok(Some(record))
  }

  async fn merge_patch(&self, path: &str, patch: &RecordPatch) -> Result<()> {
    let url = endpoint(&self.base, "documents", path)?;
    let body = serde_json::to_vec(&patch.to_merge_body())
      .map_err(|e| eyre!("Failed to serialize patch: {}", e))?;

    self
      .client
      .patch(url)
      .header(CONTENT_TYPE, "application/merge-patch+json")
      .body(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to patch record {}: {}", path, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to patch record {}: {}", path, e))?;

    Ok(())
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobMetadata {
  download_url: String,
}

/// Blob store client.
#[derive(Clone)]
pub struct RestBlobStore {
  client: reqwest::Client,
  base: Url,
}

impl RestBlobStore {
  pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
    let base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid blob store URL {}: {}", base_url, e))?;
    Ok(Self {
      client: build_client(token, timeout)?,
      base,
    })
  }
}

#[async_trait]
impl BlobStore for RestBlobStore {
  async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
    let url = endpoint(&self.base, "o", path)?;

    self
      .client
      .put(url)
      .header(CONTENT_TYPE, content_type)
      .body(bytes)
      .send()
      .await
      .map_err(|e| eyre!("Failed to upload blob {}: {}", path, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to upload blob {}: {}", path, e))?;

    Ok(())
  }

  async fn download_url(&self, path: &str) -> Result<String> {
    let url = endpoint(&self.base, "o", path)?;

    let metadata: BlobMetadata = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get blob metadata {}: {}", path, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to get blob metadata {}: {}", path, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse blob metadata {}: {}", path, e))?;

    Ok(metadata.download_url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_joins_segments() {
    let base = Url::parse("https://store.example.com/v1/").unwrap();
    let url = endpoint(&base, "documents", "incidents/42").unwrap();
    assert_eq!(url.as_str(), "https://store.example.com/v1/documents/incidents/42");
  }

  #[test]
  fn test_endpoint_escapes_segments() {
    let base = Url::parse("https://blobs.example.com").unwrap();
    let url = endpoint(&base, "o", "logbook/ACME Corp/North/1_photo.jpg").unwrap();
    assert_eq!(
      url.as_str(),
      "https://blobs.example.com/o/logbook/ACME%20Corp/North/1_photo.jpg"
    );
  }

  #[test]
  fn test_rejects_invalid_base() {
    assert!(RestDocumentStore::new("not a url", "t", Duration::from_secs(1)).is_err());
  }
}
