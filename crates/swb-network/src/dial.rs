//! Outbound dialing through the filtered resolver.
//!
//! Every outbound TCP connection the proxy or the fetch client opens
//! goes through `connect_first`, so hostnames never touch the system
//! resolver.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::doh::{HostResolver, ResolveError};

#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("no reachable address for {host}:{port}")]
    ConnectFailed { host: String, port: u16 },
}

/// Resolve `host` and connect to the first reachable address, IPv4
/// before IPv6, each attempt bounded by `per_addr_timeout`. Literal IP
/// hosts bypass the resolver.
pub async fn connect_first(
    resolver: &dyn HostResolver,
    host: &str,
    port: u16,
    per_addr_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs: Vec<IpAddr> = match literal.parse::<IpAddr>() {
        Ok(addr) => vec![addr],
        Err(_) => resolver.resolve(host).await?,
    };
    addrs.sort_by_key(|a| a.is_ipv6());

    for addr in addrs {
        match tokio::time::timeout(per_addr_timeout, TcpStream::connect((addr, port))).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => debug!("connect {addr}:{port} failed: {e}"),
            Err(_) => debug!("connect {addr}:{port} timed out"),
        }
    }
    Err(DialError::ConnectFailed {
        host: host.to_string(),
        port,
    })
}
