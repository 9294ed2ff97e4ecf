//! HTTP front for the shell host: control routes plus a catch-all proxy.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use super::request::{CacheResult, ShellRequest};
use super::worker::{ShellHost, ShellMessage, ShellStatus};

/// Upper bound on a proxied request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Response header naming where the body came from (network, cache, offline).
pub const SOURCE_HEADER: &str = "x-fieldpost-source";

#[derive(Clone)]
struct GatewayState {
  host: Arc<ShellHost>,
  origin: Url,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
  code: String,
  message: String,
}

fn internal_error(err: color_eyre::Report) -> (StatusCode, Json<ErrorBody>) {
  (
    StatusCode::INTERNAL_SERVER_ERROR,
    Json(ErrorBody {
      code: "internal".to_string(),
      message: err.to_string(),
    }),
  )
}

/// Build the shell router. Requests outside the control routes are served
/// through the active worker; relative URIs resolve against `origin`.
pub fn router(host: Arc<ShellHost>, origin: Url) -> Router {
  Router::new()
    .route("/__shell/skip-waiting", post(skip_waiting))
    .route("/__shell/purge", post(purge))
    .route("/__shell/status", get(status))
    .fallback(proxy)
    .with_state(GatewayState { host, origin })
}

async fn skip_waiting(
  State(state): State<GatewayState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
  let promoted = state.host.skip_waiting().map_err(internal_error)?;
  Ok(Json(serde_json::json!({ "promoted": promoted })))
}

async fn purge(
  State(state): State<GatewayState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
  state
    .host
    .post_message(ShellMessage::PurgeAll)
    .map_err(internal_error)?;
  Ok(Json(serde_json::json!({ "purged": true })))
}

async fn status(
  State(state): State<GatewayState>,
) -> Result<Json<ShellStatus>, (StatusCode, Json<ErrorBody>)> {
  state.host.status().map(Json).map_err(internal_error)
}

/// Absolute-form URIs (forward proxy) are used as-is.
fn request_url(uri: &Uri, origin: &Url) -> Result<Url> {
  if uri.scheme().is_some() {
    return Url::parse(&uri.to_string()).map_err(|e| eyre!("Invalid request URI {}: {}", uri, e));
  }
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  origin
    .join(path)
    .map_err(|e| eyre!("Invalid request path {}: {}", path, e))
}

async fn into_shell_request(request: Request, origin: &Url) -> Result<ShellRequest> {
  let (parts, body) = request.into_parts();
  let url = request_url(&parts.uri, origin)?;

  let mut shell_request = ShellRequest::new(parts.method, url);
  for (name, value) in &parts.headers {
    if let Ok(value) = value.to_str() {
      shell_request.set_header(name.as_str(), value);
    }
  }
  shell_request.body = to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?
    .to_vec();
  Ok(shell_request)
}

fn into_response(result: CacheResult) -> Response {
  let status = StatusCode::from_u16(result.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = Response::new(Body::from(result.response.body));
  *response.status_mut() = status;

  let headers = response.headers_mut();
  for (name, value) in &result.response.headers {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(
    HeaderName::from_static(SOURCE_HEADER),
    HeaderValue::from_static(result.source.as_str()),
  );
  response
}

async fn proxy(State(state): State<GatewayState>, request: Request) -> Response {
  let shell_request = match into_shell_request(request, &state.origin).await {
    Ok(r) => r,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  let url = shell_request.url.clone();
  match state.host.handle(shell_request).await {
    Ok(result) => into_response(result),
    Err(e) => {
      warn!(url = %url, error = %e, "request failed with no cached fallback");
      (StatusCode::BAD_GATEWAY, "offline and not cached").into_response()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::shell::storage::SqliteCacheStorage;
  use crate::shell::strategy::tests::FakeNetwork;
  use crate::shell::worker::ShellWorker;
  use std::sync::atomic::Ordering;

  fn origin() -> Url {
    Url::parse("https://app.test/").unwrap()
  }

  async fn state(network: Arc<FakeNetwork>) -> GatewayState {
    let storage = Arc::new(SqliteCacheStorage::from_connection(
      crate::db::open_in_memory().unwrap(),
    ));
    let host = Arc::new(ShellHost::new(storage.clone(), network.clone()));
    host
      .register(
        ShellWorker::new("v1", storage, network)
          .with_manifest(vec![origin().join("/menu.html").unwrap()])
          .with_fallback_pages(vec![origin().join("/menu.html").unwrap()]),
      )
      .await
      .unwrap();
    GatewayState {
      host,
      origin: origin(),
    }
  }

  async fn body_of(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), MAX_BODY_BYTES)
      .await
      .unwrap()
      .to_vec()
  }

  #[test]
  fn test_request_url_resolution() {
    let relative: Uri = "/salida.html?v=51".parse().unwrap();
    assert_eq!(
      request_url(&relative, &origin()).unwrap().as_str(),
      "https://app.test/salida.html?v=51"
    );

    let absolute: Uri = "http://cdn.test/lib.js".parse().unwrap();
    assert_eq!(
      request_url(&absolute, &origin()).unwrap().as_str(),
      "http://cdn.test/lib.js"
    );
  }

  #[tokio::test]
  async fn test_proxy_marks_source() {
    let network = Arc::new(FakeNetwork::default());
    network.serve("https://app.test/menu.html", "menu");
    let state = state(network.clone()).await;

    let request = axum::http::Request::builder()
      .uri("/menu.html")
      .header("accept", "text/html")
      .body(Body::empty())
      .unwrap();
    let response = proxy(State(state.clone()), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[SOURCE_HEADER], "network");
    assert_eq!(body_of(response).await, b"menu");

    network.offline.store(true, Ordering::SeqCst);
    let request = axum::http::Request::builder()
      .uri("/registros.html")
      .header("accept", "text/html")
      .body(Body::empty())
      .unwrap();
    let response = proxy(State(state), request).await;
    assert_eq!(response.headers()[SOURCE_HEADER], "offline");
    assert_eq!(body_of(response).await, b"menu");
  }

  #[tokio::test]
  async fn test_proxy_returns_bad_gateway_when_nothing_matches() {
    let network = Arc::new(FakeNetwork::default());
    let state = state(network.clone()).await;
    state.host.purge_all().unwrap();
    network.offline.store(true, Ordering::SeqCst);

    let request = axum::http::Request::builder()
      .uri("/menu.html")
      .header("sec-fetch-mode", "navigate")
      .body(Body::empty())
      .unwrap();
    let response = proxy(State(state), request).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  }

  #[tokio::test]
  async fn test_control_routes() {
    let network = Arc::new(FakeNetwork::default());
    network.serve("https://app.test/menu.html", "menu");
    let state = state(network).await;

    let Json(promoted) = skip_waiting(State(state.clone())).await.unwrap();
    assert_eq!(promoted["promoted"], false);

    let Json(before) = status(State(state.clone())).await.unwrap();
    assert_eq!(before.active_version.as_deref(), Some("v1"));
    assert_eq!(before.caches, vec!["shell-v1"]);

    purge(State(state.clone())).await.unwrap();
    let Json(after) = status(State(state)).await.unwrap();
    assert!(after.caches.is_empty());
  }
}
