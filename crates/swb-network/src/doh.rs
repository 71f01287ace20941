//! DNS-over-HTTPS Resolver with Shared Caching
//!
//! Resolves hostnames through a filtered DoH endpoint:
//! - A and AAAA sub-queries race on concurrent tasks and are merged
//! - Records present when the primary window closes win; stragglers
//!   are awaited up to a max deadline only while the result is empty
//! - One shared cache per resolver; the proxy and the fetch client see
//!   a single DoH lookup per host
//! - Bootstrap addresses for the endpoint's own hostname avoid circular
//!   resolution

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}: no A/AAAA records")]
    NotFound(String),

    #[error("hostname is empty")]
    EmptyHostname,
}

/// DNS record types the resolver queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
        }
    }
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct DohConfig {
    /// Hostname of the DoH endpoint
    pub endpoint_host: String,
    /// Fixed addresses used to reach the endpoint itself
    pub bootstrap_addrs: Vec<IpAddr>,
    /// Return as soon as either record type has data within this window
    pub primary_wait: Duration,
    /// Hard deadline for the whole lookup
    pub max_wait: Duration,
    /// Timeout for a single DoH HTTP call
    pub query_timeout: Duration,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            endpoint_host: "family.cloudflare-dns.com".to_string(),
            bootstrap_addrs: vec!["1.1.1.3".parse().unwrap(), "1.0.0.3".parse().unwrap()],
            primary_wait: Duration::from_millis(1200),
            max_wait: Duration::from_millis(6000),
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// Hostname-to-addresses seam used by everything that dials outbound.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// A single DoH sub-query. Errors are swallowed into an empty list; only
/// the aggregate deadline decides whether the lookup fails.
#[async_trait]
pub trait DohEndpoint: Send + Sync {
    async fn lookup(&self, hostname: &str, rtype: RecordType) -> Vec<IpAddr>;
}

/// DoH resolver with a shared, append-only cache.
///
/// Cache entries live for the process lifetime; they are never mutated
/// after insertion, so readers need no coordination beyond the initial
/// miss-then-populate step.
pub struct DohResolver {
    endpoint: Arc<dyn DohEndpoint>,
    config: DohConfig,
    cache: Mutex<HashMap<String, Arc<Vec<IpAddr>>>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DohResolver {
    pub fn new(config: DohConfig) -> Self {
        let endpoint = Arc::new(HttpsDohEndpoint::new(
            config.endpoint_host.clone(),
            config.bootstrap_addrs.clone(),
            config.query_timeout,
        ));
        Self::with_endpoint(endpoint, config)
    }

    pub fn with_endpoint(endpoint: Arc<dyn DohEndpoint>, config: DohConfig) -> Self {
        Self {
            endpoint,
            config,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cached addresses for a host, if a lookup already succeeded.
    pub fn cached(&self, hostname: &str) -> Option<Arc<Vec<IpAddr>>> {
        self.cache.lock().unwrap().get(hostname).cloned()
    }

    /// Fire-and-forget cache warm-up; called before CONNECT traffic is
    /// expected for a host. No-op on a cache hit.
    pub fn prefetch(self: &Arc<Self>, hostname: &str) {
        if hostname.is_empty() || self.cached(hostname).is_some() {
            return;
        }
        let resolver = Arc::clone(self);
        let host = hostname.to_string();
        tokio::spawn(async move {
            if let Err(e) = resolver.resolve(&host).await {
                debug!("prefetch failed for {host}: {e}");
            }
        });
    }

    /// Per-hostname lock preventing duplicate concurrent lookups.
    fn marker(&self, hostname: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.entry(hostname.to_string()).or_default().clone()
    }

    /// Race both record types. The primary window waits for both
    /// sub-queries and returns their union; records present at the
    /// window's close win over a straggler, which is then awaited up
    /// to the max deadline only while the result is still empty.
    async fn query(&self, hostname: &str) -> Vec<IpAddr> {
        let mut set = JoinSet::new();
        for rtype in [RecordType::A, RecordType::Aaaa] {
            let endpoint = Arc::clone(&self.endpoint);
            let host = hostname.to_string();
            set.spawn(async move { (rtype, endpoint.lookup(&host, rtype).await) });
        }

        let start = tokio::time::Instant::now();
        let primary_deadline = start + self.config.primary_wait;
        let max_deadline = start + self.config.max_wait;
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        while !set.is_empty() {
            match tokio::time::timeout_at(primary_deadline, set.join_next()).await {
                Ok(Some(Ok((_, addrs)))) => store(addrs, &mut v4, &mut v6),
                Ok(Some(Err(_))) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if !v4.is_empty() || !v6.is_empty() {
            set.abort_all();
            return merged(v4, v6);
        }

        while !set.is_empty() {
            match tokio::time::timeout_at(max_deadline, set.join_next()).await {
                Ok(Some(Ok((_, addrs)))) => {
                    store(addrs, &mut v4, &mut v6);
                    if !v4.is_empty() || !v6.is_empty() {
                        // A simultaneous completion still merges.
                        while let Some(joined) = set.try_join_next() {
                            if let Ok((_, addrs)) = joined {
                                store(addrs, &mut v4, &mut v6);
                            }
                        }
                        set.abort_all();
                        break;
                    }
                }
                Ok(Some(Err(_))) => {}
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }
        merged(v4, v6)
    }
}

fn store(addrs: Vec<IpAddr>, v4: &mut Vec<IpAddr>, v6: &mut Vec<IpAddr>) {
    for addr in addrs {
        match addr {
            IpAddr::V4(_) => v4.push(addr),
            IpAddr::V6(_) => v6.push(addr),
        }
    }
}

/// IPv4 before IPv6.
fn merged(mut v4: Vec<IpAddr>, v6: Vec<IpAddr>) -> Vec<IpAddr> {
    v4.extend(v6);
    v4
}

#[async_trait]
impl HostResolver for DohResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if hostname.is_empty() {
            return Err(ResolveError::EmptyHostname);
        }
        if let Some(cached) = self.cached(hostname) {
            debug!("DNS cache hit for {hostname}");
            return Ok(cached.as_ref().clone());
        }

        let marker = self.marker(hostname);
        let _guard = marker.lock().await;

        // Another caller may have populated the cache while we waited.
        if let Some(cached) = self.cached(hostname) {
            return Ok(cached.as_ref().clone());
        }

        debug!("DoH lookup for {hostname}");
        let addrs = self.query(hostname).await;
        if addrs.is_empty() {
            self.in_flight.lock().unwrap().remove(hostname);
            return Err(ResolveError::NotFound(hostname.to_string()));
        }
        // The cache must be populated before the marker goes away, or
        // a caller minting a fresh marker would re-query.
        self.cache
            .lock()
            .unwrap()
            .insert(hostname.to_string(), Arc::new(addrs.clone()));
        self.in_flight.lock().unwrap().remove(hostname);
        Ok(addrs)
    }
}

/// The DoH JSON wire format: `{"Answer": [{"data": "<ip>"}, ...]}`.
#[derive(Debug, Deserialize)]
struct DnsJsonReply {
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsJsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct DnsJsonAnswer {
    #[serde(default)]
    data: String,
}

/// Production endpoint speaking `GET /dns-query?name=<host>&type=<t>`
/// with `Accept: application/dns-json` over TLS, dialed via the fixed
/// bootstrap addresses.
pub struct HttpsDohEndpoint {
    host: String,
    bootstrap: Vec<IpAddr>,
    query_timeout: Duration,
    tls: TlsConnector,
}

impl HttpsDohEndpoint {
    pub fn new(host: String, bootstrap: Vec<IpAddr>, query_timeout: Duration) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            host,
            bootstrap,
            query_timeout,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    async fn query_once(&self, hostname: &str, rtype: RecordType) -> anyhow::Result<Vec<IpAddr>> {
        let mut stream = None;
        for addr in &self.bootstrap {
            match TcpStream::connect((*addr, 443)).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => debug!("DoH bootstrap {addr} unreachable: {e}"),
            }
        }
        let stream = stream.ok_or_else(|| anyhow::anyhow!("no reachable DoH bootstrap address"))?;

        let server_name = rustls::pki_types::ServerName::try_from(self.host.clone())?;
        let tls_stream = self.tls.connect(server_name, stream).await?;
        let io = TokioIo::new(tls_stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let encoded: String = url::form_urlencoded::byte_serialize(hostname.as_bytes()).collect();
        let uri = format!("/dns-query?name={}&type={}", encoded, rtype.as_str());
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, &self.host)
            .header(ACCEPT, "application/dns-json")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        let body = response.into_body().collect().await?.to_bytes();
        Ok(parse_answers(&body))
    }
}

fn parse_answers(body: &[u8]) -> Vec<IpAddr> {
    let reply: DnsJsonReply = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            debug!("unparseable DoH reply: {e}");
            return Vec::new();
        }
    };
    reply
        .answer
        .iter()
        .filter_map(|a| a.data.trim().parse::<IpAddr>().ok())
        .collect()
}

#[async_trait]
impl DohEndpoint for HttpsDohEndpoint {
    async fn lookup(&self, hostname: &str, rtype: RecordType) -> Vec<IpAddr> {
        match tokio::time::timeout(self.query_timeout, self.query_once(hostname, rtype)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                warn!("DoH {} query for {hostname} failed: {e}", rtype.as_str());
                Vec::new()
            }
            Err(_) => {
                warn!("DoH {} query for {hostname} timed out", rtype.as_str());
                Vec::new()
            }
        }
    }
}
