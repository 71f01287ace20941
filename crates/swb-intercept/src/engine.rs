//! Interception engine
//!
//! The single object the embedding surface talks to. Wires the
//! classifier, the controlled fetch path, the redirect resolver and
//! error recovery around one shared fallback-window map.

use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use swb_network::{
    AllowlistOracle, FetchClient, FetchRequest, ForwardingProxy, ProxyOverrideController,
};

use crate::classifier::{Classifier, Disposition, ResourceRequest};
use crate::recovery::{ErrorRecovery, FallbackWindows, RecoveryAction, RecoveryConfig, TransportError};
use crate::redirect::{self, RedirectResolver};

/// Hatched placeholder served for blocked images so page layout holds.
const BLOCKED_MEDIA_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="150" viewBox="0 0 200 150" preserveAspectRatio="none">
  <defs>
    <pattern id="p" width="24" height="24" patternUnits="userSpaceOnUse" patternTransform="rotate(45)">
      <rect width="24" height="24" fill="#fafbfa"/>
      <line x1="0" y1="0" x2="0" y2="24" stroke="#f1f3f2" stroke-width="3"/>
    </pattern>
  </defs>
  <rect width="100%" height="100%" fill="url(#p)"/>
</svg>"##;

/// Response the surface renders instead of performing the request.
#[derive(Debug, Clone)]
pub struct SubstituteResponse {
    pub status: u16,
    pub mime: String,
    pub charset: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SubstituteResponse {
    pub fn empty() -> Self {
        Self {
            status: 200,
            mime: "text/plain".to_string(),
            charset: "utf-8".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn placeholder_image() -> Self {
        Self {
            status: 200,
            mime: "image/svg+xml".to_string(),
            charset: "utf-8".to_string(),
            headers: Vec::new(),
            body: BLOCKED_MEDIA_SVG.as_bytes().to_vec(),
        }
    }
}

pub struct InterceptEngine {
    classifier: Classifier,
    fetch: Arc<FetchClient>,
    redirects: RedirectResolver,
    recovery: ErrorRecovery,
}

impl InterceptEngine {
    pub fn new(
        allowlist: Arc<dyn AllowlistOracle>,
        fetch: Arc<FetchClient>,
        proxy: Arc<ForwardingProxy>,
        overrides: Arc<dyn ProxyOverrideController>,
        recovery_config: RecoveryConfig,
    ) -> Self {
        let fallback = FallbackWindows::new();
        Self {
            classifier: Classifier::new(allowlist, fallback.clone()),
            redirects: RedirectResolver::new(fetch.clone()),
            recovery: ErrorRecovery::new(
                fetch.clone(),
                proxy,
                overrides,
                fallback,
                recovery_config,
            ),
            fetch,
        }
    }

    /// Called at the start of every top-level navigation.
    pub fn navigation_started(&self, url: &str) {
        self.classifier.navigation_started(url);
    }

    /// Called per resource request. `None` defers to the surface's
    /// native handling.
    pub async fn should_intercept(&self, request: &ResourceRequest) -> Option<SubstituteResponse> {
        match self.classifier.classify(request) {
            Disposition::PassUnconditional | Disposition::NativeAllow => None,
            Disposition::BlockEmpty => Some(SubstituteResponse::empty()),
            Disposition::BlockPlaceholder => Some(SubstituteResponse::placeholder_image()),
            Disposition::DirectFetch => self.direct_fetch(request).await,
        }
    }

    /// Called per main-frame navigation, before the load starts. AMP
    /// viewer URLs are rewritten to their canonical target and Google
    /// searches are forced to SafeSearch.
    pub fn should_override_navigation(&self, url: &str) -> Option<String> {
        unwrap_amp(url).or_else(|| ensure_safe_search(url))
    }

    /// Pre-resolve a plain `http://` link the user opens; returns the
    /// URL to load.
    pub async fn resolve_link(&self, url: &str) -> String {
        if redirect::should_resolve(url) {
            self.redirects.resolve(url).await
        } else {
            url.to_string()
        }
    }

    pub async fn on_transport_error(
        &self,
        error: TransportError,
        url: &str,
    ) -> Option<RecoveryAction> {
        self.recovery.on_transport_error(error, url).await
    }

    async fn direct_fetch(&self, request: &ResourceRequest) -> Option<SubstituteResponse> {
        let outbound = FetchRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
        };
        match self.fetch.fetch(&outbound).await {
            Ok(response) if response.is_success() => {
                debug!(
                    "direct_fetch code={} url={} final={}",
                    response.status, request.url, response.final_url
                );
                let headers = response
                    .headers
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                Some(SubstituteResponse {
                    status: response.status,
                    mime: response.mime,
                    charset: response.charset,
                    headers,
                    body: response.body.to_vec(),
                })
            }
            Ok(response) => {
                // Non-success falls back to the native stack so the
                // surface shows its own error page.
                debug!("direct_fetch deferred code={} url={}", response.status, request.url);
                None
            }
            Err(e) => {
                warn!("direct_fetch failed url={}: {e}", request.url);
                None
            }
        }
    }
}

/// Canonical target of a Google AMP viewer or AMP cache URL; `None`
/// when no rewrite applies.
pub fn unwrap_amp(url: &str) -> Option<String> {
    unwrap_google_amp(url).or_else(|| unwrap_amp_cache(url))
}

/// Google `/search` URLs without SafeSearch get `safe=active`
/// appended; used from the navigation rewrite so in-page navigation
/// cannot bypass it. `None` when no rewrite is needed.
pub fn ensure_safe_search(url: &str) -> Option<String> {
    let lower = url.to_lowercase();
    if !lower.contains("google.") || !lower.contains("/search") {
        return None;
    }
    if lower.contains("safe=active") || lower.contains("safe=strict") {
        return None;
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    Some(format!("{url}{separator}safe=active"))
}

fn unwrap_google_amp(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !host.contains("google.") {
        return None;
    }
    let path = parsed.path();
    if let Some(rest) = path.strip_prefix("/amp/s/") {
        return Some(format!("https://{}", rest.trim_start_matches('/')));
    }
    if let Some(rest) = path.strip_prefix("/amp/") {
        return Some(format!("http://{}", rest.trim_start_matches('/')));
    }
    None
}

fn unwrap_amp_cache(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !host.ends_with("cdn.ampproject.org") {
        return None;
    }
    let path = parsed.path();
    if let Some(rest) = path.strip_prefix("/c/s/") {
        return Some(format!("https://{}", rest.trim_start_matches('/')));
    }
    if let Some(rest) = path.strip_prefix("/c/") {
        return Some(format!("http://{}", rest.trim_start_matches('/')));
    }
    None
}
