//! Request Classifier
//!
//! One decision per navigation or subresource request. Rules are
//! evaluated in a fixed order; the first match wins. Verification
//! traffic passes before everything else, including the ad rules and
//! the allow-list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use url::Url;

use swb_network::AllowlistOracle;

use crate::patterns;
use crate::recovery::FallbackWindows;

/// What the embedding surface should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Never block; let the native stack handle it untouched.
    PassUnconditional,
    /// Fetch through the controlled DoH path and substitute the result.
    DirectFetch,
    /// Full native behavior, no interception.
    NativeAllow,
    /// Substitute an empty body.
    BlockEmpty,
    /// Substitute a minimal placeholder image so layout holds.
    BlockPlaceholder,
}

/// Descriptor of one resource request as reported by the surface.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub url: String,
    pub method: String,
    pub is_main_frame: bool,
    pub headers: Vec<(String, String)>,
}

impl ResourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            is_main_frame: false,
            headers: Vec::new(),
        }
    }

    pub fn main_frame(url: impl Into<String>) -> Self {
        Self {
            is_main_frame: true,
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// State scoped to the current page; replaced at navigation start.
#[derive(Default)]
struct PageState {
    url: Option<String>,
    is_verification: bool,
    /// Allow-list lookups cached for the page lifetime only, so a list
    /// edit takes effect at the next navigation.
    allowlist_cache: HashMap<String, bool>,
}

pub struct Classifier {
    allowlist: Arc<dyn AllowlistOracle>,
    fallback: FallbackWindows,
    page: Mutex<PageState>,
}

impl Classifier {
    pub fn new(allowlist: Arc<dyn AllowlistOracle>, fallback: FallbackWindows) -> Self {
        Self {
            allowlist,
            fallback,
            page: Mutex::new(PageState::default()),
        }
    }

    /// Reset page-scoped state for a new top-level navigation.
    pub fn navigation_started(&self, url: &str) {
        let mut page = self.page.lock().unwrap();
        *page = PageState {
            is_verification: is_verification_url(url),
            url: Some(url.to_string()),
            allowlist_cache: HashMap::new(),
        };
        debug!("page_start url={url}");
    }

    pub fn classify(&self, request: &ResourceRequest) -> Disposition {
        let Some((host, path)) = host_and_path(&request.url) else {
            return Disposition::NativeAllow;
        };
        let url = &request.url;

        let mut page = self.page.lock().unwrap();
        if request.is_main_frame {
            page.url = Some(url.clone());
            page.is_verification = patterns::is_verification_request(&host, url);
        }

        // Rule 1: verification traffic always passes.
        if patterns::is_verification_request(&host, url)
            || page.is_verification
            || page.url.as_deref().is_some_and(is_verification_url)
        {
            return Disposition::PassUnconditional;
        }

        // Recovery hook: hosts that recently served an empty main
        // document get their subresources forced through the
        // controlled path for a short window.
        if !request.is_main_frame && request.is_get() && self.fallback.is_active(&host) {
            debug!("fallback_window host={host} url={url}");
            return Disposition::DirectFetch;
        }

        let page_host = page.url.as_deref().and_then(|u| host_of(u));
        let page_allowlisted = page_host
            .as_deref()
            .is_some_and(|h| allowlisted_cached(&self.allowlist, &mut page, h));

        // Rule 2: non-allow-listed main documents are always fetched
        // through the controlled path.
        if request.is_main_frame {
            let allowlisted = allowlisted_cached(&self.allowlist, &mut page, &host);
            if !allowlisted && request.is_get() {
                debug!("intercept_main url={url}");
                return Disposition::DirectFetch;
            }
            // Allow-listed main frames load natively unless the target
            // is plainly a media file.
            if patterns::path_has_blocked_extension(&path) {
                return if patterns::is_image_url(&path, url) {
                    Disposition::BlockPlaceholder
                } else {
                    Disposition::BlockEmpty
                };
            }
            return Disposition::NativeAllow;
        }

        // Rule 3: subresources of an allow-listed page are untouched.
        if page_allowlisted {
            return Disposition::NativeAllow;
        }

        // Rule 4: media and image blocking.
        if request.header("Range").is_some()
            || request.header("Accept").is_some_and(patterns::accept_indicates_video)
        {
            return Disposition::BlockEmpty;
        }
        if patterns::is_blocked_resource(&path, url) {
            return if patterns::is_image_url(&path, url) {
                Disposition::BlockPlaceholder
            } else {
                Disposition::BlockEmpty
            };
        }

        // Rule 5: ad networks.
        if patterns::is_ad_request(&host, url) {
            return Disposition::BlockEmpty;
        }

        // Rule 6: residual blocking on non-allow-listed pages. Images
        // without an extension still announce themselves via Accept;
        // anything else that is not CSS/JS/JSON is conservatively
        // treated as media.
        if page_host.is_some() && !page_allowlisted {
            let accept = request.header("Accept").unwrap_or("");
            if accept.to_lowercase().contains("image/") {
                return Disposition::BlockPlaceholder;
            }
            if request.is_get() && !patterns::accept_indicates_css_js_json(accept) {
                return Disposition::BlockEmpty;
            }
        }

        Disposition::NativeAllow
    }
}

fn allowlisted_cached(
    allowlist: &Arc<dyn AllowlistOracle>,
    page: &mut PageState,
    host: &str,
) -> bool {
    if let Some(&cached) = page.allowlist_cache.get(host) {
        return cached;
    }
    let allowed = allowlist.is_allowed(host);
    page.allowlist_cache.insert(host.to_string(), allowed);
    allowed
}

fn host_and_path(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some((host, parsed.path().to_string()))
}

fn host_of(url: &str) -> Option<String> {
    host_and_path(url).map(|(host, _)| host)
}

fn is_verification_url(url: &str) -> bool {
    match host_of(url) {
        Some(host) => patterns::is_verification_request(&host, url),
        None => false,
    }
}
