//! Socket-level configuration shared (immutably) across connections.
//!
//! Grounded in the teacher's `TlsConfig`/`Config` (plain `serde`-deserializable
//! records) and in `knassar702-slinger`'s `ConnectorBuilder` fluent setters.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::proxy::ProxyResolverPolicy;
use crate::tls::{TlsDatabase, TlsInteraction};

/// Socket-level configuration consumed (not owned) by a
/// [`crate::connection::Connection`]. Shared immutably across every
/// connection created by a session.
#[derive(Clone, Deserialize)]
pub struct SocketProperties {
    /// Local address to bind outbound sockets to, if any.
    pub local_addr: Option<IpAddr>,

    /// I/O timeout applied to both the connector and the established
    /// socket. `None` disables the timeout.
    #[serde(with = "duration_secs_opt", default)]
    pub io_timeout: Option<Duration>,

    /// Idle timeout after which an unused, reusable connection is closed.
    /// `None`/`Some(0)` disables the idle timer entirely.
    #[serde(with = "duration_secs_opt", default)]
    pub idle_timeout: Option<Duration>,

    /// Proxy resolution policy for outbound connections.
    #[serde(skip, default)]
    pub proxy_policy: ProxyResolverPolicy,

    /// Client-certificate / interaction material offered during the TLS
    /// handshake, if any (mTLS).
    #[serde(skip, default)]
    pub tls_interaction: Option<Arc<TlsInteraction>>,

    /// Which root-of-trust database to validate the peer certificate
    /// against.
    #[serde(skip, default)]
    pub tls_database: TlsDatabase,
}

impl Default for SocketProperties {
    fn default() -> Self {
        SocketProperties {
            local_addr: None,
            io_timeout: None,
            idle_timeout: None,
            proxy_policy: ProxyResolverPolicy::UseDefault,
            tls_interaction: None,
            tls_database: TlsDatabase::UseDefault,
        }
    }
}

impl SocketProperties {
    pub fn builder() -> SocketPropertiesBuilder {
        SocketPropertiesBuilder::default()
    }

    /// Whether the idle timer should ever be armed for connections using
    /// these properties.
    pub fn idle_timeout_enabled(&self) -> bool {
        matches!(self.idle_timeout, Some(d) if !d.is_zero())
    }
}

/// Fluent builder for [`SocketProperties`], in the style of
/// `knassar702-slinger`'s `ConnectorBuilder`.
#[derive(Default, Clone)]
pub struct SocketPropertiesBuilder {
    inner: SocketProperties,
}

impl SocketPropertiesBuilder {
    pub fn local_addr(mut self, addr: Option<IpAddr>) -> Self {
        self.inner.local_addr = addr;
        self
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inner.io_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inner.idle_timeout = timeout;
        self
    }

    pub fn proxy_policy(mut self, policy: ProxyResolverPolicy) -> Self {
        self.inner.proxy_policy = policy;
        self
    }

    pub fn tls_interaction(mut self, interaction: Option<Arc<TlsInteraction>>) -> Self {
        self.inner.tls_interaction = interaction;
        self
    }

    pub fn tls_database(mut self, database: TlsDatabase) -> Self {
        self.inner.tls_database = database;
        self
    }

    pub fn build(self) -> SocketProperties {
        self.inner
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_disables_idle_timer() {
        let props = SocketProperties::default();
        assert!(!props.idle_timeout_enabled());
    }

    #[test]
    fn builder_enables_idle_timer() {
        let props = SocketProperties::builder()
            .idle_timeout(Some(Duration::from_secs(30)))
            .build();
        assert!(props.idle_timeout_enabled());
    }

    #[test]
    fn zero_idle_timeout_stays_disabled() {
        let props = SocketProperties::builder()
            .idle_timeout(Some(Duration::from_secs(0)))
            .build();
        assert!(!props.idle_timeout_enabled());
    }
}
