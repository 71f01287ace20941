//! swb Network Layer
//!
//! Filtered transport for the restricted browsing core.
//!
//! Architecture:
//! 1. Hostname → DNS-over-HTTPS against a filtering resolver
//! 2. Outbound dialing only through resolved addresses, IPv4 first
//! 3. Loopback forwarding proxy for traffic the surface sends itself
//! 4. Fetch-and-relay client for responses the core substitutes

mod capabilities;
mod dial;
mod doh;
mod fetch;
mod proxy;

pub use capabilities::{
    AllowlistOracle, CookieStore, MemoryCookieStore, ProxyOverrideController, StaticAllowlist,
};
pub use dial::{connect_first, DialError};
pub use doh::{DohConfig, DohEndpoint, DohResolver, HostResolver, RecordType, ResolveError};
pub use fetch::{FetchClient, FetchConfig, FetchError, FetchRequest, FetchResponse};
pub use proxy::{ForwardingProxy, ProxyConfig, ProxyError};
