//! Error Recovery
//!
//! Reacts to transport-failure callbacks from the embedding surface.
//! Every action is rate-limited per URL; exhausting an attempt leaves
//! the original failure visible rather than retrying forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use url::Url;

use swb_network::{FetchClient, FetchRequest, ForwardingProxy, ProxyOverrideController};

/// Failure kinds the embedding surface reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The server closed the connection without a response.
    EmptyResponse { main_frame: bool },
    /// The surface could not reach the local forwarding proxy.
    ProxyConnectionFailed,
}

/// What the surface should do next, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    LoadUrl(String),
    Reload,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Per-URL bound on empty-response refetch attempts
    pub empty_retry_cooldown: Duration,
    /// Per-URL bound on http -> https upgrade retries
    pub https_upgrade_cooldown: Duration,
    /// Per-URL bound on proxy restarts
    pub proxy_restart_cooldown: Duration,
    /// How long a failing host's subresources are forced through the
    /// controlled fetch path
    pub fallback_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            empty_retry_cooldown: Duration::from_secs(8),
            https_upgrade_cooldown: Duration::from_secs(10),
            proxy_restart_cooldown: Duration::from_secs(10),
            fallback_window: Duration::from_secs(60),
        }
    }
}

/// Hosts whose main document recently came back empty. While a host's
/// window is open the classifier forces its subresources through the
/// controlled fetch path.
#[derive(Clone, Default)]
pub struct FallbackWindows {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl FallbackWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, host: &str, window: Duration) {
        let mut map = self.inner.lock().unwrap();
        map.insert(host.to_lowercase(), Instant::now() + window);
    }

    pub fn is_active(&self, host: &str) -> bool {
        let map = self.inner.lock().unwrap();
        map.get(&host.to_lowercase())
            .is_some_and(|until| Instant::now() < *until)
    }
}

pub struct ErrorRecovery {
    fetch: Arc<FetchClient>,
    proxy: Arc<ForwardingProxy>,
    overrides: Arc<dyn ProxyOverrideController>,
    fallback: FallbackWindows,
    config: RecoveryConfig,
    https_upgrade_at: Mutex<HashMap<String, Instant>>,
    empty_retry_at: Mutex<HashMap<String, Instant>>,
    last_proxy_error: Mutex<Option<(String, Instant)>>,
}

impl ErrorRecovery {
    pub fn new(
        fetch: Arc<FetchClient>,
        proxy: Arc<ForwardingProxy>,
        overrides: Arc<dyn ProxyOverrideController>,
        fallback: FallbackWindows,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            fetch,
            proxy,
            overrides,
            fallback,
            config,
            https_upgrade_at: Mutex::new(HashMap::new()),
            empty_retry_at: Mutex::new(HashMap::new()),
            last_proxy_error: Mutex::new(None),
        }
    }

    pub async fn on_transport_error(
        &self,
        error: TransportError,
        url: &str,
    ) -> Option<RecoveryAction> {
        match error {
            TransportError::EmptyResponse { main_frame } => {
                self.recover_empty_response(url, main_frame).await
            }
            TransportError::ProxyConnectionFailed => self.restart_proxy(url).await,
        }
    }

    async fn recover_empty_response(&self, url: &str, main_frame: bool) -> Option<RecoveryAction> {
        if main_frame {
            if let Some(rest) = url.strip_prefix("http://") {
                if claim(
                    &self.https_upgrade_at,
                    url,
                    self.config.https_upgrade_cooldown,
                ) {
                    let upgraded = format!("https://{rest}");
                    info!("empty_response retry_https url={upgraded}");
                    return Some(RecoveryAction::LoadUrl(upgraded));
                }
            }
            if let Some(host) = host_of(url) {
                info!("empty_response fallback_window host={host}");
                self.fallback.mark(&host, self.config.fallback_window);
            }
        }
        self.refetch_for_redirect(url).await
    }

    /// One controlled refetch; the failed URL often resolves through a
    /// redirect to somewhere the surface can actually load.
    async fn refetch_for_redirect(&self, url: &str) -> Option<RecoveryAction> {
        if !claim(&self.empty_retry_at, url, self.config.empty_retry_cooldown) {
            return None;
        }
        match self.fetch.fetch(&FetchRequest::get(url)).await {
            Ok(response) if response.final_url != url => {
                info!("empty_response retry_redirect to={}", response.final_url);
                Some(RecoveryAction::LoadUrl(response.final_url))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("empty_response refetch failed url={url}: {e}");
                None
            }
        }
    }

    async fn restart_proxy(&self, url: &str) -> Option<RecoveryAction> {
        {
            let mut last = self.last_proxy_error.lock().unwrap();
            if let Some((failed_url, at)) = last.as_ref() {
                if failed_url == url && at.elapsed() < self.config.proxy_restart_cooldown {
                    return None;
                }
            }
            *last = Some((url.to_string(), Instant::now()));
        }

        info!("proxy_connection_failed url={url}, restarting proxy");
        self.overrides.clear_override();
        self.proxy.stop().await;
        match self.proxy.start().await {
            Ok(port) => {
                self.overrides.set_override(port);
                Some(RecoveryAction::Reload)
            }
            Err(e) => {
                warn!("proxy restart failed: {e}");
                None
            }
        }
    }
}

/// True when `key` is outside its cooldown; records the attempt.
fn claim(map: &Mutex<HashMap<String, Instant>>, key: &str, cooldown: Duration) -> bool {
    let mut map = map.lock().unwrap();
    let now = Instant::now();
    if let Some(last) = map.get(key) {
        if now.duration_since(*last) < cooldown {
            return false;
        }
    }
    map.insert(key.to_string(), now);
    true
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
