//! Fetch-and-Relay HTTP Client
//!
//! Executes a single controlled fetch: hostnames resolve through the
//! filtered DoH path, the cookie capability is attached outbound and
//! every `Set-Cookie` in the redirect chain is written back before the
//! result is returned. Backs both the classifier's direct-fetch
//! disposition and recovery refetches.
//!
//! Failure policy: any network or parsing error surfaces as a
//! `FetchError`; interception callers treat it as "defer to the
//! embedding surface's native handling", never as fatal.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, COOKIE, HOST, HeaderMap, LOCATION, SET_COOKIE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::capabilities::CookieStore;
use crate::dial::{DialError, connect_first};
use crate::doh::HostResolver;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("tls: {0}")]
    Tls(String),

    #[error("http: {0}")]
    Http(String),

    #[error("request timed out")]
    Timeout,

    #[error("too many redirects for {0}")]
    TooManyRedirects(String),
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-address connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout, per hop
    pub request_timeout: Duration,
    /// Redirect hops followed by `fetch`
    pub max_redirects: usize,
    /// Applied when the caller supplies no User-Agent
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            request_timeout: Duration::from_secs(20),
            max_redirects: 10,
            user_agent: "swb/0.1".to_string(),
        }
    }
}

/// Outbound request descriptor from the embedding surface. The `Host`
/// header, if present, is dropped and rebuilt from the URL.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
        }
    }
}

/// Normalized fetch result.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Parsed out of `Content-Type`, `application/octet-stream` default
    pub mime: String,
    /// Parsed out of `Content-Type`, `UTF-8` default
    pub charset: String,
    pub body: Bytes,
    /// URL after redirects; equals the request URL when none followed
    pub final_url: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct FetchClient {
    resolver: Arc<dyn HostResolver>,
    cookies: Arc<dyn CookieStore>,
    config: FetchConfig,
    tls: TlsConnector,
}

impl FetchClient {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        cookies: Arc<dyn CookieStore>,
        config: FetchConfig,
    ) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            resolver,
            cookies,
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Fetch following redirects. Cookies from every hop are persisted
    /// before the final response is returned.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.run(request, true).await
    }

    /// Exactly one hop, no redirect following; the redirect resolver
    /// walks chains itself. Cookie write-back still applies.
    pub async fn fetch_once(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.run(request, false).await
    }

    async fn run(&self, request: &FetchRequest, follow: bool) -> Result<FetchResponse, FetchError> {
        let mut current =
            Url::parse(&request.url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let mut method = request.method.to_ascii_uppercase();
        let mut hops = 0usize;

        loop {
            let (status, headers, body) = tokio::time::timeout(
                self.config.request_timeout,
                self.send_one(&method, &current, &request.headers),
            )
            .await
            .map_err(|_| FetchError::Timeout)??;

            // Session cookies frequently arrive on the redirect hop;
            // persist them against the URL that set them.
            for value in headers.get_all(SET_COOKIE) {
                if let Ok(v) = value.to_str() {
                    self.cookies.set(current.as_str(), v);
                }
            }

            if follow && status.is_redirection() {
                if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    if hops >= self.config.max_redirects {
                        return Err(FetchError::TooManyRedirects(request.url.clone()));
                    }
                    hops += 1;
                    current = current
                        .join(location)
                        .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
                    method = "GET".to_string();
                    debug!("following redirect to {current}");
                    continue;
                }
            }

            let (mime, charset) = parse_content_type(&headers);
            return Ok(FetchResponse {
                status: status.as_u16(),
                headers,
                mime,
                charset,
                body,
                final_url: current.to_string(),
            });
        }
    }

    async fn send_one(
        &self,
        method: &str,
        url: &Url,
        caller_headers: &[(String, String)],
    ) -> Result<(StatusCode, HeaderMap, Bytes), FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(format!("no host in {url}")))?;
        let https = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| FetchError::Http(e.to_string()))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host_header = match url.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, host_header);
        let mut has_user_agent = false;
        for (name, value) in caller_headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            if name.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_user_agent {
            builder = builder.header(USER_AGENT, &self.config.user_agent);
        }
        if let Some(cookie) = self.cookies.get(url.as_str()) {
            if !cookie.is_empty() {
                builder = builder.header(COOKIE, cookie);
            }
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let stream = connect_first(
            self.resolver.as_ref(),
            host,
            port,
            self.config.connect_timeout,
        )
        .await?;

        let response = if https {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| FetchError::Tls(format!("invalid server name {host}")))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| FetchError::Tls(e.to_string()))?;
            send_collect(tls_stream, request).await?
        } else {
            send_collect(stream, request).await?
        };
        Ok(response)
    }
}

async fn send_collect<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<(StatusCode, HeaderMap, Bytes), FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| FetchError::Http(e.to_string()))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response: hyper::Response<Incoming> = sender
        .send_request(request)
        .await
        .map_err(|e| FetchError::Http(e.to_string()))?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| FetchError::Http(e.to_string()))?
        .to_bytes();
    Ok((status, headers, body))
}

fn parse_content_type(headers: &HeaderMap) -> (String, String) {
    let Some(value) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return ("application/octet-stream".to_string(), "UTF-8".to_string());
    };
    let mut parts = value.split(';');
    let mime = parts
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| m.contains('/'))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut charset = "UTF-8".to_string();
    for param in parts {
        if let Some((key, val)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("charset") {
                charset = val.trim().trim_matches('"').to_string();
            }
        }
    }
    (mime, charset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryCookieStore;
    use crate::doh::ResolveError;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Loopback;

    #[async_trait]
    impl HostResolver for Loopback {
        async fn resolve(&self, _hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
            Ok(vec!["127.0.0.1".parse().unwrap()])
        }
    }

    struct NoRoute;

    #[async_trait]
    impl HostResolver for NoRoute {
        async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
            Err(ResolveError::NotFound(hostname.to_string()))
        }
    }

    /// Serves each canned response on a fresh connection, capturing
    /// the raw request head.
    fn spawn_origin(
        listener: TcpListener,
        responses: Vec<String>,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&head).to_string());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        rx
    }

    fn client() -> (FetchClient, Arc<MemoryCookieStore>) {
        let cookies = Arc::new(MemoryCookieStore::new());
        let client = FetchClient::new(Arc::new(Loopback), cookies.clone(), FetchConfig::default());
        (client, cookies)
    }

    #[tokio::test]
    async fn normalizes_status_mime_charset_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _rx = spawn_origin(
            listener,
            vec![
                "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=iso-8859-1\r\nContent-Length: 5\r\n\r\nhello"
                    .to_string(),
            ],
        );

        let (client, _) = client();
        let resp = client
            .fetch(&FetchRequest::get(&format!("http://origin.test:{port}/page")))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.mime, "text/html");
        assert_eq!(resp.charset, "iso-8859-1");
        assert_eq!(&resp.body[..], b"hello");
    }

    #[tokio::test]
    async fn host_header_is_rebuilt_and_present_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut rx = spawn_origin(
            listener,
            vec!["HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n".to_string()],
        );

        let (client, _) = client();
        let mut request = FetchRequest::get(&format!("http://origin.test:{port}/x"));
        request
            .headers
            .push(("Host".to_string(), "evil.example".to_string()));
        client.fetch(&request).await.unwrap();

        let head = rx.recv().await.unwrap();
        let hosts: Vec<_> = head
            .lines()
            .filter(|l| l.to_ascii_lowercase().starts_with("host:"))
            .collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0], format!("host: origin.test:{port}"));
    }

    #[tokio::test]
    async fn cookies_persist_across_the_redirect_chain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut rx = spawn_origin(
            listener,
            vec![
                format!(
                    "HTTP/1.1 302 Found\r\nLocation: http://origin.test:{port}/next\r\nSet-Cookie: session=abc; Path=/\r\nContent-Length: 0\r\n\r\n"
                ),
                "HTTP/1.1 200 OK\r\nSet-Cookie: theme=dark\r\nContent-Length: 2\r\n\r\nok".to_string(),
            ],
        );

        let (client, cookies) = client();
        let resp = client
            .fetch(&FetchRequest::get(&format!("http://origin.test:{port}/start")))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.final_url.ends_with("/next"));

        // Both hops' cookies survive, and the redirect-set cookie was
        // already attached to the second request.
        let header = cookies
            .get(&format!("http://origin.test:{port}/"))
            .unwrap();
        assert!(header.contains("session=abc"));
        assert!(header.contains("theme=dark"));
        let _first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.contains("session=abc"));
    }

    #[tokio::test]
    async fn fetch_once_returns_the_redirect_itself() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _rx = spawn_origin(
            listener,
            vec![
                "HTTP/1.1 302 Found\r\nLocation: https://elsewhere.test/\r\nSet-Cookie: s=1\r\nContent-Length: 0\r\n\r\n"
                    .to_string(),
            ],
        );

        let (client, cookies) = client();
        let resp = client
            .fetch_once(&FetchRequest::get(&format!("http://origin.test:{port}/r")))
            .await
            .unwrap();
        assert_eq!(resp.status, 302);
        assert_eq!(
            resp.headers.get(LOCATION).unwrap(),
            "https://elsewhere.test/"
        );
        assert!(
            cookies
                .get(&format!("http://origin.test:{port}/"))
                .unwrap()
                .contains("s=1")
        );
    }

    #[tokio::test]
    async fn resolution_failure_is_reported_not_panicked() {
        let client = FetchClient::new(
            Arc::new(NoRoute),
            Arc::new(MemoryCookieStore::new()),
            FetchConfig::default(),
        );
        let err = client
            .fetch(&FetchRequest::get("http://missing.test/"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Dial(_)));
    }
}
