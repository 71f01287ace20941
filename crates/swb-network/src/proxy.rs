//! Local Forwarding Proxy
//!
//! Loopback HTTP proxy the embedding surface is pointed at so every
//! request it makes, including CONNECT tunnels the surface cannot
//! intercept itself, resolves hostnames through the filtered DoH path.
//!
//! ```text
//! Browsing surface → 127.0.0.1:<ephemeral> → DoH-resolved remote
//! ```
//!
//! One accept task; one task per connection; two relay tasks per
//! CONNECT tunnel. Timeouts are the only cancellation mechanism.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

use crate::dial::connect_first;
use crate::doh::HostResolver;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Per-address outbound connect timeout
    pub connect_timeout: Duration,
    /// Bound on joining tunnel relay tasks after either side ends
    pub relay_join_timeout: Duration,
    /// Idle bound while streaming a remote's response back
    pub remote_read_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            relay_join_timeout: Duration::from_secs(60),
            remote_read_timeout: Duration::from_secs(30),
        }
    }
}

struct Running {
    port: u16,
    accept_task: JoinHandle<()>,
}

/// Loopback proxy server. `start` is idempotent; `stop` closes the
/// listener and terminates every connection task.
pub struct ForwardingProxy {
    resolver: Arc<dyn HostResolver>,
    config: ProxyConfig,
    state: tokio::sync::Mutex<Option<Running>>,
}

impl ForwardingProxy {
    pub fn new(resolver: Arc<dyn HostResolver>, config: ProxyConfig) -> Self {
        Self {
            resolver,
            config,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind an ephemeral loopback port and start accepting. Returns the
    /// existing port when already running.
    pub async fn start(&self) -> std::io::Result<u16> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            if !running.accept_task.is_finished() {
                return Ok(running.port);
            }
        }
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        let resolver = Arc::clone(&self.resolver);
        let config = self.config.clone();
        let accept_task = tokio::spawn(accept_loop(listener, resolver, config));
        info!("forwarding proxy listening on 127.0.0.1:{port}");
        *state = Some(Running { port, accept_task });
        Ok(port)
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.take() {
            info!("stopping forwarding proxy on port {}", running.port);
            running.accept_task.abort();
            let _ = running.accept_task.await;
        }
    }

    pub async fn port(&self) -> Option<u16> {
        self.state.lock().await.as_ref().map(|r| r.port)
    }
}

async fn accept_loop(listener: TcpListener, resolver: Arc<dyn HostResolver>, config: ProxyConfig) {
    // Connection tasks live in the set so aborting the accept task
    // tears them all down with it.
    let mut connections = JoinSet::new();
    loop {
        while connections.try_join_next().is_some() {}
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("proxy connection from {peer}");
                let resolver = Arc::clone(&resolver);
                let config = config.clone();
                connections.spawn(async move {
                    if let Err(e) = serve_connection(stream, resolver, config).await {
                        debug!("proxy connection closed: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("proxy accept error: {e}");
            }
        }
    }
}

async fn serve_connection(
    client: TcpStream,
    resolver: Arc<dyn HostResolver>,
    config: ProxyConfig,
) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(client);
    let Some(line) = read_crlf_line(&mut reader).await? else {
        return Ok(());
    };
    let mut tokens = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) =
        (tokens.next(), tokens.next(), tokens.next())
    else {
        // Fewer than 3 tokens: close without a response.
        return Err(ProxyError::MalformedRequestLine(line.clone()));
    };
    let method = method.to_ascii_uppercase();
    debug!("proxy request {method} {target} {version}");

    if method == "CONNECT" {
        handle_connect(reader, target, &resolver, &config).await
    } else {
        handle_http(reader, &method, target, version, &resolver, &config).await
    }
}

async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    target: &str,
    resolver: &Arc<dyn HostResolver>,
    config: &ProxyConfig,
) -> Result<(), ProxyError> {
    // Drain the header lines that follow the CONNECT line. Leaving them
    // buffered would relay them into the tunnel ahead of the TLS client
    // hello and corrupt the stream.
    while let Some(line) = read_crlf_line(&mut reader).await? {
        if line.is_empty() {
            break;
        }
    }

    let (host, port) = split_connect_target(target, 443);
    if host.is_empty() {
        return reply_bad_gateway(reader.into_inner()).await;
    }
    let mut remote = match connect_first(resolver.as_ref(), &host, port, config.connect_timeout)
        .await
    {
        Ok(remote) => remote,
        Err(e) => {
            warn!("CONNECT {host}:{port} failed: {e}");
            return reply_bad_gateway(reader.into_inner()).await;
        }
    };

    // Bytes the client pipelined past the header block belong to the
    // tunnel, not the proxy.
    let leftover = reader.buffer().to_vec();
    let mut client = reader.into_inner();
    client.write_all(CONNECT_ESTABLISHED).await?;
    if !leftover.is_empty() {
        remote.write_all(&leftover).await?;
    }
    relay(client, remote, config.relay_join_timeout).await;
    Ok(())
}

async fn handle_http(
    mut reader: BufReader<TcpStream>,
    method: &str,
    target: &str,
    version: &str,
    resolver: &Arc<dyn HostResolver>,
    config: &ProxyConfig,
) -> Result<(), ProxyError> {
    let (headers, body) = read_headers_and_body(&mut reader).await?;

    let host_header = headers
        .iter()
        .find(|h| h.to_ascii_lowercase().starts_with("host:"))
        .map(|h| h["host:".len()..].trim().to_string())
        .filter(|h| !h.is_empty());

    let mut host: Option<String> = None;
    let mut port: u16 = 80;
    let mut target_url: Option<Url> = None;
    if let Some(value) = &host_header {
        let (h, p) = split_connect_target(value, 80);
        host = Some(h);
        port = p;
    } else if target.contains("://") {
        match Url::parse(target) {
            Ok(u) => {
                host = u.host_str().map(|h| h.to_string());
                port = u
                    .port_or_known_default()
                    .unwrap_or(if u.scheme() == "https" { 443 } else { 80 });
                target_url = Some(u);
            }
            Err(e) => warn!("bad proxy target {target}: {e}"),
        }
    }
    let Some(host) = host else {
        warn!("missing host for target {target}");
        return reply_bad_gateway(reader.into_inner()).await;
    };

    let mut remote = match connect_first(resolver.as_ref(), &host, port, config.connect_timeout)
        .await
    {
        Ok(remote) => remote,
        Err(e) => {
            warn!("forward connect {host}:{port} failed: {e}");
            return reply_bad_gateway(reader.into_inner()).await;
        }
    };

    // Absolute-URI targets are rewritten to origin-form before
    // forwarding; proxy-specific headers are stripped.
    let path = if target.contains("://") {
        let url = match target_url {
            Some(u) => Some(u),
            None => Url::parse(target).ok(),
        };
        match url {
            Some(u) => {
                let mut p = if u.path().is_empty() {
                    "/".to_string()
                } else {
                    u.path().to_string()
                };
                if let Some(q) = u.query() {
                    p.push('?');
                    p.push_str(q);
                }
                p
            }
            None => target.to_string(),
        }
    } else {
        target.to_string()
    };

    let mut request = Vec::with_capacity(256 + body.len());
    request.extend_from_slice(format!("{method} {path} {version}\r\n").as_bytes());
    if host_header.is_none() {
        let line = if port == 80 {
            format!("Host: {host}\r\n")
        } else {
            format!("Host: {host}:{port}\r\n")
        };
        request.extend_from_slice(line.as_bytes());
    }
    for header in &headers {
        if header.to_ascii_lowercase().starts_with("proxy-") {
            continue;
        }
        request.extend_from_slice(header.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    request.extend_from_slice(&body);
    remote.write_all(&request).await?;

    // Byte-transparent response relay; no re-parsing.
    let mut client = reader.into_inner();
    let mut buf = [0u8; 8192];
    loop {
        match tokio::time::timeout(config.remote_read_timeout, remote.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => client.write_all(&buf[..n]).await?,
            Ok(Err(e)) => {
                debug!("remote read error: {e}");
                break;
            }
            Err(_) => {
                debug!("remote read timed out");
                break;
            }
        }
    }
    let _ = client.shutdown().await;
    Ok(())
}

/// Bidirectional byte relay. Runs inside the connection task so
/// stopping the proxy tears established tunnels down with it. Either
/// direction reaching EOF or error starts the bounded join on the
/// other; a stalled peer cannot leak the tunnel.
async fn relay(client: TcpStream, remote: TcpStream, join_timeout: Duration) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = remote.into_split();
    let up = async {
        let _ = tokio::io::copy(&mut client_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
    };
    let down = async {
        let _ = tokio::io::copy(&mut remote_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    };
    tokio::pin!(up, down);
    tokio::select! {
        _ = &mut up => {
            if tokio::time::timeout(join_timeout, &mut down).await.is_err() {
                debug!("tunnel relay join timed out");
            }
        }
        _ = &mut down => {
            if tokio::time::timeout(join_timeout, &mut up).await.is_err() {
                debug!("tunnel relay join timed out");
            }
        }
    }
}

async fn read_headers_and_body(
    reader: &mut BufReader<TcpStream>,
) -> Result<(Vec<String>, Vec<u8>), ProxyError> {
    let mut headers = Vec::new();
    let mut content_length = 0usize;
    while let Some(line) = read_crlf_line(reader).await? {
        if line.is_empty() {
            break;
        }
        if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push(line);
    }

    let mut body = vec![0u8; content_length];
    let mut read_so_far = 0;
    while read_so_far < content_length {
        let n = reader.read(&mut body[read_so_far..]).await?;
        if n == 0 {
            // Short read: the client sent less than it declared.
            body.truncate(read_so_far);
            break;
        }
        read_so_far += n;
    }
    Ok((headers, body))
}

async fn read_crlf_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = tokio::io::AsyncBufReadExt::read_until(reader, b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// `host:port` with an optional `[v6]` host; `default_port` when the
/// port is absent or unparseable.
fn split_connect_target(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        _ => (target.to_string(), default_port),
    }
}

async fn reply_bad_gateway(mut client: TcpStream) -> Result<(), ProxyError> {
    client.write_all(BAD_GATEWAY).await?;
    let _ = client.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doh::ResolveError;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::sync::oneshot;

    struct TestResolver;

    #[async_trait]
    impl HostResolver for TestResolver {
        async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
            if hostname == "origin.test" {
                Ok(vec!["127.0.0.1".parse().unwrap()])
            } else {
                Err(ResolveError::NotFound(hostname.to_string()))
            }
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_proxy() -> ForwardingProxy {
        init_tracing();
        ForwardingProxy::new(
            Arc::new(TestResolver),
            ProxyConfig {
                connect_timeout: Duration::from_millis(500),
                relay_join_timeout: Duration::from_secs(5),
                remote_read_timeout: Duration::from_secs(2),
            },
        )
    }

    async fn read_response_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            if n == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    #[tokio::test]
    async fn connect_tunnel_relays_bytes_both_ways() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping!");
            stream.write_all(b"pong!").await.unwrap();
            let _ = done_tx.send(());
        });

        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!(
                    "CONNECT origin.test:{origin_port} HTTP/1.1\r\nHost: origin.test:{origin_port}\r\nProxy-Connection: keep-alive\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        client.write_all(b"ping!").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong!");
        done_rx.await.unwrap();
        proxy.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_established_tunnels() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let _ = seen_tx.send(buf[..n].to_vec());
        });

        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!("CONNECT origin.test:{origin_port} HTTP/1.1\r\n\r\n").as_bytes(),
            )
            .await
            .unwrap();
        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        proxy.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Bytes written after stop must not cross the dead tunnel.
        let _ = client.write_all(b"hello").await;
        let seen = seen_rx.await.unwrap();
        assert!(seen.is_empty(), "tunnel still relayed after stop: {seen:?}");

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn connect_to_unresolvable_host_replies_502() {
        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"CONNECT missing.test:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 502"), "got: {head}");
        proxy.stop().await;
    }

    async fn capture_origin() -> (u16, oneshot::Receiver<String>) {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut captured = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                captured.extend_from_slice(&buf[..n]);
                if captured.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            let _ = stream.shutdown().await;
            let _ = tx.send(String::from_utf8_lossy(&captured).into_owned());
        });
        (port, rx)
    }

    #[tokio::test]
    async fn relative_target_forwards_with_single_host_header() {
        let (origin_port, captured) = capture_origin().await;
        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!(
                    "GET /path HTTP/1.1\r\nHost: origin.test:{origin_port}\r\nAccept: */*\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));

        let forwarded = captured.await.unwrap();
        assert!(forwarded.starts_with("GET /path HTTP/1.1\r\n"), "got: {forwarded}");
        let host_lines = forwarded
            .lines()
            .filter(|l| l.to_ascii_lowercase().starts_with("host:"))
            .count();
        assert_eq!(host_lines, 1);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn absolute_target_is_rewritten_to_origin_form() {
        let (origin_port, captured) = capture_origin().await;
        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!(
                    "GET http://origin.test:{origin_port}/abs?q=1 HTTP/1.1\r\nProxy-Connection: keep-alive\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let forwarded = captured.await.unwrap();
        assert!(
            forwarded.starts_with("GET /abs?q=1 HTTP/1.1\r\n"),
            "got: {forwarded}"
        );
        // Host injected from the absolute URI, proxy headers stripped.
        assert!(forwarded.contains(&format!("Host: origin.test:{origin_port}\r\n")));
        assert!(!forwarded.to_ascii_lowercase().contains("proxy-connection"));
        proxy.stop().await;
    }

    #[tokio::test]
    async fn post_body_is_forwarded_verbatim() {
        let (origin_port, captured) = capture_origin().await;
        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!(
                    "POST /submit HTTP/1.1\r\nHost: origin.test:{origin_port}\r\nContent-Length: 4\r\n\r\ndata"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let forwarded = captured.await.unwrap();
        assert!(forwarded.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(forwarded.ends_with("\r\n\r\ndata"), "got: {forwarded}");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn missing_host_replies_502() {
        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"GET /nohost HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 502"), "got: {head}");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn malformed_request_line_closes_without_reply() {
        let proxy = test_proxy();
        let port = proxy.start().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        proxy.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_closes_the_listener() {
        let proxy = test_proxy();
        let first = proxy.start().await.unwrap();
        let second = proxy.start().await.unwrap();
        assert_eq!(first, second);

        proxy.stop().await;
        assert!(proxy.port().await.is_none());
        assert!(TcpStream::connect(("127.0.0.1", first)).await.is_err());

        // Restart binds a fresh port and serves again.
        let third = proxy.start().await.unwrap();
        assert!(TcpStream::connect(("127.0.0.1", third)).await.is_ok());
        proxy.stop().await;
    }

    #[test]
    fn connect_target_parsing() {
        assert_eq!(
            split_connect_target("example.com:8443", 443),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            split_connect_target("example.com", 443),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_connect_target("[::1]:8443", 443),
            ("::1".to_string(), 8443)
        );
        assert_eq!(split_connect_target("[::1]", 443), ("::1".to_string(), 443));
    }
}
