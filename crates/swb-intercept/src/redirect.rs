//! Redirect Resolver
//!
//! Walks a redirect chain one controlled GET at a time before the
//! surface opens a plain `http://` link, so tracking hops collapse
//! into the final destination. Sites without a `Location` header get
//! their body scanned for meta-refresh and script redirects.
//!
//! This path never surfaces an error; any failure returns the original
//! URL unchanged.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use swb_network::{FetchClient, FetchError, FetchRequest};

const MAX_STEPS: usize = 6;
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Only explicitly insecure links are pre-resolved; https links load
/// directly.
pub fn should_resolve(url: &str) -> bool {
    url.starts_with("http://")
}

pub struct RedirectResolver {
    fetch: Arc<FetchClient>,
    meta_refresh: Regex,
    script_location: Regex,
    anchor_href: Regex,
}

impl RedirectResolver {
    pub fn new(fetch: Arc<FetchClient>) -> Self {
        // The patterns are fixed literals; compilation cannot fail.
        Self {
            fetch,
            meta_refresh: Regex::new(
                r#"(?i)<meta[^>]*http-equiv=["']?refresh["']?[^>]*content=["'][^"']*url=([^"'>]+)"#,
            )
            .unwrap(),
            script_location: Regex::new(r#"(?i)(?:window\.)?location(?:\.href)?\s*=\s*['"]([^'"]+)"#)
                .unwrap(),
            anchor_href: Regex::new(r#"(?i)<a[^>]*href=["']([^"']+)"#).unwrap(),
        }
    }

    pub async fn resolve(&self, original: &str) -> String {
        match self.resolve_inner(original).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("resolve_failed url={original}: {e}");
                original.to_string()
            }
        }
    }

    async fn resolve_inner(&self, original: &str) -> Result<String, FetchError> {
        let mut current = original.to_string();
        for step in 0..MAX_STEPS {
            let mut request = FetchRequest::get(&current);
            request
                .headers
                .push(("Accept".to_string(), ACCEPT_HTML.to_string()));
            let response = self.fetch.fetch_once(&request).await?;
            debug!("resolve_get step={step} url={current} code={}", response.status);

            if let Some(location) = response.headers.get("location").and_then(|v| v.to_str().ok())
            {
                if let Some(resolved) = resolve_relative(&current, location) {
                    if should_stop(original, &resolved) {
                        debug!("resolve_stop step={step} final={resolved}");
                        return Ok(resolved);
                    }
                    current = resolved;
                    continue;
                }
            }

            let body = String::from_utf8_lossy(&response.body);
            if let Some(extracted) = self.extract_from_html(&current, &body) {
                if should_stop(original, &extracted) {
                    debug!("resolve_stop_html step={step} final={extracted}");
                    return Ok(extracted);
                }
                current = extracted;
                continue;
            }

            // Neither a redirect header nor a body hint.
            return Ok(current);
        }
        Ok(current)
    }

    /// Meta refresh wins over a script assignment; a lone anchor is the
    /// last resort for interstitial "click to continue" pages.
    fn extract_from_html(&self, base: &str, html: &str) -> Option<String> {
        let decoded = html.replace("&amp;", "&");
        let raw = self
            .meta_refresh
            .captures(&decoded)
            .or_else(|| self.script_location.captures(&decoded))
            .or_else(|| self.anchor_href.captures(&decoded))
            .and_then(|c| c.get(1))?
            .as_str();
        resolve_relative(base, raw)
    }
}

fn resolve_relative(base: &str, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(trimmed.to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    Url::parse(base)
        .ok()?
        .join(trimmed)
        .ok()
        .map(|u| u.to_string())
}

/// Early-stop heuristic: an authorization-code-shaped parameter, or a
/// hop to a different host that already carries query parameters, is
/// the destination itself.
fn should_stop(original: &str, resolved: &str) -> bool {
    if resolved.to_lowercase().contains("code=") {
        return true;
    }
    let orig_host = host_of(original);
    let resolved_host = host_of(resolved);
    if let (Some(a), Some(b)) = (orig_host, resolved_host) {
        if a != b && resolved.contains('?') {
            return true;
        }
    }
    false
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
