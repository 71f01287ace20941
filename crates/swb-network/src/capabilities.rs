//! Capabilities injected by the embedding product.
//!
//! The network core never owns allow-list state, cookies, or the host
//! toolkit's proxy override; it consumes them through these seams. The
//! in-memory implementations back tests and simple embedders.

use std::collections::HashMap;
use std::sync::Mutex;

/// Externally-owned set of hosts permitted full, unfiltered access.
pub trait AllowlistOracle: Send + Sync {
    fn is_allowed(&self, host: &str) -> bool;
}

/// Cookie storage shared with the embedding browsing surface.
pub trait CookieStore: Send + Sync {
    /// `Cookie` header value for a URL, if any cookies apply.
    fn get(&self, url: &str) -> Option<String>;
    /// Record one `Set-Cookie` header value against a URL.
    fn set(&self, url: &str, set_cookie: &str);
}

/// Host-toolkit hook routing the embedding surface's traffic through
/// the local forwarding proxy.
pub trait ProxyOverrideController: Send + Sync {
    fn set_override(&self, port: u16);
    fn clear_override(&self);
}

/// Fixed allow-list with the same suffix semantics the product uses:
/// a host is allowed when it equals an entry or is a subdomain of one.
pub struct StaticAllowlist {
    hosts: Vec<String>,
}

impl StaticAllowlist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(|h| h.into().to_lowercase()).collect(),
        }
    }
}

impl AllowlistOracle for StaticAllowlist {
    fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.hosts
            .iter()
            .any(|entry| host == *entry || host.ends_with(&format!(".{entry}")))
    }
}

/// Per-host cookie jar. Keeps the latest value per cookie name; enough
/// for session cookies set mid-redirect, which is what the fetch path
/// needs to preserve.
#[derive(Default)]
pub struct MemoryCookieStore {
    jar: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_of(url: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }
}

impl CookieStore for MemoryCookieStore {
    fn get(&self, url: &str) -> Option<String> {
        let host = Self::host_of(url)?;
        let jar = self.jar.lock().unwrap();
        let cookies = jar.get(&host)?;
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn set(&self, url: &str, set_cookie: &str) {
        let Some(host) = Self::host_of(url) else {
            return;
        };
        // "name=value; Path=/; ..." -> keep the name=value pair.
        let Some(pair) = set_cookie.split(';').next() else {
            return;
        };
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let (name, value) = (name.trim().to_string(), value.trim().to_string());
        if name.is_empty() {
            return;
        }
        let mut jar = self.jar.lock().unwrap();
        let cookies = jar.entry(host).or_default();
        if let Some(existing) = cookies.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            cookies.push((name, value));
        }
    }
}
