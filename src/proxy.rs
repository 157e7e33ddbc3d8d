//! Proxy resolution policy, per §4.1/§4.4.
//!
//! The resolver abstraction and the policy enum mirror libsoup's
//! `proxy_use_default` / `proxy_resolver` pair (see `new_socket_client` in
//! `soup-connection.c`). The CONNECT request/response exchange itself is
//! not here: per §1, the Connection "does not itself parse HTTP beyond
//! recognizing success of a CONNECT response," and even that recognition
//! is the message codec's job — the Connection only reacts to it via
//! `Message::is_connect`/`on_body_end` (see `connection::setup_message_io`).

use std::fmt;
use std::sync::Arc;

use url::Url;

/// Describes the endpoint a [`crate::connection::Connection`] is being
/// asked to reach. Resolution to a concrete socket address has already
/// happened by the time a `Connectable` reaches this crate (DNS
/// resolution is explicitly out of scope here).
pub trait Connectable: fmt::Debug + Send + Sync {
    /// The already-resolved remote address to dial.
    fn socket_addr(&self) -> std::net::SocketAddr;

    /// Hostname used for SNI / certificate verification and as the
    /// CONNECT request's authority.
    fn host(&self) -> &str;

    /// Port used as the CONNECT request's authority.
    fn port(&self) -> u16;
}

/// A plain `host:port` endpoint with a pre-resolved address.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub addr: std::net::SocketAddr,
    pub host: String,
    pub port: u16,
}

impl Connectable for Endpoint {
    fn socket_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// A proxy to dial instead of the real target, discovered via
/// [`ProxyResolver`].
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub addr: std::net::SocketAddr,
    /// Proxy protocol, e.g. `"http"`. Only `"http"` proxies are recorded
    /// as `proxy_uri` on the connection; anything else is treated as a
    /// transparent tunnel the socket layer already handled.
    pub protocol: String,
    pub uri: Url,
}

/// Resolves a proxy for a given target, analogous to `GProxyResolver`.
pub trait ProxyResolver: fmt::Debug + Send + Sync {
    fn resolve(&self, target: &dyn Connectable) -> Option<ProxyTarget>;
}

/// Selects how (or whether) outbound connections are proxied.
///
/// Mirrors `new_socket_client`'s handling of `props->proxy_use_default`:
/// when default proxying is declined, an explicit resolver can still be
/// installed, otherwise proxying is disabled outright.
#[derive(Clone, Default)]
pub enum ProxyResolverPolicy {
    /// Use the system/default proxy resolution (no resolver installed
    /// here; the socket layer dials the target directly).
    #[default]
    UseDefault,
    /// Use the supplied resolver, registering "http" as an
    /// application-level proxy protocol.
    Resolver(Arc<dyn ProxyResolver>),
    /// Proxying is disabled outright.
    Disabled,
}

impl ProxyResolverPolicy {
    pub(crate) fn resolve(&self, target: &dyn Connectable) -> Option<ProxyTarget> {
        match self {
            ProxyResolverPolicy::Resolver(resolver) => resolver.resolve(target),
            ProxyResolverPolicy::UseDefault | ProxyResolverPolicy::Disabled => None,
        }
    }
}

