//! Request classification and the per-class caching strategies.
//!
//! Every strategy has the same shape: given a request and the current cache
//! generation, produce a response or fail.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::fetch::Fetcher;
use super::request::{CacheResult, ShellRequest, ShellResponse};
use super::storage::CacheStorage;

const IMAGE_AND_FONT_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "webp", "gif", "svg", "ico", "avif", "bmp", "ttf", "otf", "woff", "woff2",
];

const SCRIPT_DESTINATIONS: &[&str] = &["script", "style", "worker", "sharedworker", "serviceworker"];

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Not intercepted: straight to the network, never cached
  Passthrough,
  /// HTML documents: network-first with timeout, shell cache fallback
  Navigation,
  /// Cache-first
  ImageOrFont,
  /// Scripts, styles and workers: stale-while-revalidate
  Script,
  /// Network-first with runtime cache fallback
  Other,
}

/// Host lists used by [`classify`].
#[derive(Debug, Clone, Default)]
pub struct ClassifyRules {
  /// Backend and platform hosts that are never intercepted
  pub bypass_hosts: BTreeSet<String>,
  /// Hosts that only serve user images
  pub image_hosts: BTreeSet<String>,
}

/// True if `host` is `domain` or one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
  host == domain
    || host
      .strip_suffix(domain)
      .is_some_and(|prefix| prefix.ends_with('.'))
}

fn path_extension(url: &Url) -> Option<String> {
  let last = url.path_segments()?.last()?;
  let (_, ext) = last.rsplit_once('.')?;
  Some(ext.to_ascii_lowercase())
}

pub fn classify(request: &ShellRequest, rules: &ClassifyRules) -> RequestClass {
  if !request.is_cacheable() {
    return RequestClass::Passthrough;
  }

  let host = request
    .url
    .host_str()
    .map(|h| h.to_ascii_lowercase())
    .unwrap_or_default();
  if rules.bypass_hosts.iter().any(|d| host_matches(&host, d)) {
    return RequestClass::Passthrough;
  }

  let is_navigation = request
    .header("sec-fetch-mode")
    .is_some_and(|m| m.eq_ignore_ascii_case("navigate"))
    || request
      .header("accept")
      .is_some_and(|a| a.contains("text/html"));
  if is_navigation {
    return RequestClass::Navigation;
  }

  let extension = path_extension(&request.url);

  let is_image_or_font = extension
    .as_deref()
    .is_some_and(|ext| IMAGE_AND_FONT_EXTENSIONS.contains(&ext))
    || rules.image_hosts.iter().any(|d| host_matches(&host, d));
  if is_image_or_font {
    return RequestClass::ImageOrFont;
  }

  let is_script = request
    .header("sec-fetch-dest")
    .is_some_and(|d| SCRIPT_DESTINATIONS.contains(&d.to_ascii_lowercase().as_str()))
    || matches!(extension.as_deref(), Some("js") | Some("css"));
  if is_script {
    return RequestClass::Script;
  }

  RequestClass::Other
}

/// Names of the shell and runtime caches for one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: String,
  pub shell: String,
  pub runtime: String,
}

impl Generation {
  pub fn new(version: &str) -> Self {
    Self {
      version: version.to_string(),
      shell: format!("shell-{}", version),
      runtime: format!("runtime-{}", version),
    }
  }

  pub fn owns(&self, cache: &str) -> bool {
    cache == self.shell || cache == self.runtime
  }
}

/// Everything a strategy needs to serve one request.
#[derive(Clone)]
pub struct StrategyContext {
  pub storage: Arc<dyn CacheStorage>,
  pub fetcher: Arc<dyn Fetcher>,
  pub generation: Generation,
  pub navigation_timeout: Duration,
  /// Pages tried in order when a navigation has no cached match
  pub fallback_pages: Vec<Url>,
}

impl StrategyContext {
  /// Write a successful response to `cache`; failures only log.
  fn store(&self, cache: &str, request: &ShellRequest, response: &ShellResponse) {
    store_in(&*self.storage, cache, request, response);
  }

  fn lookup(&self, cache: &str, url: &Url, ignore_query: bool) -> Option<CacheResult> {
    match self.storage.get(cache, url, ignore_query) {
      Ok(entry) => entry.map(|e| CacheResult::from_cache(e.response, e.cached_at)),
      Err(e) => {
        warn!(cache, url = %url, error = %e, "cache lookup failed");
        None
      }
    }
  }
}

fn store_in(
  storage: &dyn CacheStorage,
  cache: &str,
  request: &ShellRequest,
  response: &ShellResponse,
) {
  if !request.is_cacheable() || !response.is_success() {
    return;
  }
  if let Err(e) = storage.put(cache, &request.url, response) {
    warn!(cache, url = %request.url, error = %e, "cache write failed");
  }
}

fn offline(hit: CacheResult) -> CacheResult {
  match hit.cached_at {
    Some(at) => CacheResult::offline(hit.response, at),
    None => hit,
  }
}

/// Network-first with a timeout; a fresh page refreshes the shell cache.
///
/// On failure: best cached match ignoring the query string, then the
/// fallback pages, then an error.
pub async fn navigation(ctx: &StrategyContext, request: &ShellRequest) -> Result<CacheResult> {
  let fetched = tokio::time::timeout(ctx.navigation_timeout, ctx.fetcher.fetch(request)).await;

  let failure = match fetched {
    Ok(Ok(response)) => {
      ctx.store(&ctx.generation.shell, request, &response);
      return Ok(CacheResult::from_network(response));
    }
    Ok(Err(e)) => e.to_string(),
    Err(_) => format!("timed out after {:?}", ctx.navigation_timeout),
  };
  debug!(url = %request.url, reason = %failure, "navigation falling back to cache");

  if let Some(hit) = ctx.lookup(&ctx.generation.shell, &request.url, true) {
    return Ok(offline(hit));
  }
  for page in &ctx.fallback_pages {
    if let Some(hit) = ctx.lookup(&ctx.generation.shell, page, false) {
      return Ok(offline(hit));
    }
  }

  Err(eyre!(
    "Navigation to {} failed ({}) and no cached page exists",
    request.url,
    failure
  ))
}

/// Cache-first; a miss is fetched and stored.
pub async fn cache_first(ctx: &StrategyContext, request: &ShellRequest) -> Result<CacheResult> {
  if let Some(hit) = ctx.lookup(&ctx.generation.runtime, &request.url, false) {
    return Ok(hit);
  }

  let response = ctx.fetcher.fetch(request).await?;
  ctx.store(&ctx.generation.runtime, request, &response);
  Ok(CacheResult::from_network(response))
}

/// Serve the cached entry immediately and refresh it in the background.
///
/// With nothing cached the caller waits on the network fetch.
pub async fn stale_while_revalidate(
  ctx: &StrategyContext,
  request: &ShellRequest,
) -> Result<CacheResult> {
  let cached = ctx.lookup(&ctx.generation.runtime, &request.url, false);

  let refresh = {
    let storage = Arc::clone(&ctx.storage);
    let fetcher = Arc::clone(&ctx.fetcher);
    let cache = ctx.generation.runtime.clone();
    let request = request.clone();
    tokio::spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) => {
          store_in(&*storage, &cache, &request, &response);
          Ok(response)
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "background refresh failed");
          Err(e)
        }
      }
    })
  };

  if let Some(hit) = cached {
    return Ok(hit);
  }

  let response = refresh
    .await
    .map_err(|e| eyre!("Refresh task for {} failed: {}", request.url, e))??;
  Ok(CacheResult::from_network(response))
}

/// Network-first with the runtime cache as fallback.
pub async fn network_first(ctx: &StrategyContext, request: &ShellRequest) -> Result<CacheResult> {
  match ctx.fetcher.fetch(request).await {
    Ok(response) => {
      ctx.store(&ctx.generation.runtime, request, &response);
      Ok(CacheResult::from_network(response))
    }
    Err(e) => match ctx.lookup(&ctx.generation.runtime, &request.url, false) {
      Some(hit) => Ok(offline(hit)),
      None => Err(e),
    },
  }
}
