//! Decoding of embedded payloads into uploadable bytes.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use color_eyre::{eyre::eyre, Result};

/// Raw bytes of an embedded payload plus its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
  pub bytes: Vec<u8>,
  pub content_type: String,
}

impl DecodedPayload {
  /// Decode a `data:<mime>;base64,<data>` URL or bare base64.
  ///
  /// Bare base64 carries no MIME type, so one is guessed from the payload
  /// name ("signature" payloads are PNG, anything else JPEG).
  pub fn parse(name: &str, data: &str) -> Result<Self> {
    let data = data.trim();

    let (content_type, encoded) = match data.strip_prefix("data:") {
      Some(rest) => {
        let (header, encoded) = rest
          .split_once(',')
          .ok_or_else(|| eyre!("Invalid {} payload: data URL has no comma", name))?;
        let mut parts = header.split(';');
        let mime = parts.next().unwrap_or_default();
        if !parts.any(|p| p.eq_ignore_ascii_case("base64")) {
          return Err(eyre!("Invalid {} payload: data URL is not base64", name));
        }
        let mime = if mime.is_empty() {
          default_content_type(name)
        } else {
          mime
        };
        (mime.to_string(), encoded)
      }
      None => (default_content_type(name).to_string(), data),
    };

    let bytes = BASE64_STANDARD
      .decode(encoded)
      .map_err(|e| eyre!("Invalid {} payload: {}", name, e))?;

    if bytes.is_empty() {
      return Err(eyre!("Invalid {} payload: empty", name));
    }

    Ok(Self {
      bytes,
      content_type,
    })
  }

  /// File extension used in the blob path.
  pub fn extension(&self) -> &'static str {
    match self.content_type.to_ascii_lowercase().as_str() {
      "image/jpeg" | "image/jpg" => "jpg",
      "image/png" => "png",
      "image/webp" => "webp",
      "image/gif" => "gif",
      "application/pdf" => "pdf",
      _ => "bin",
    }
  }
}

fn default_content_type(name: &str) -> &'static str {
  match name {
    "signature" => "image/png",
    _ => "image/jpeg",
  }
}
