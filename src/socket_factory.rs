//! Socket Factory: dials the remote endpoint (optionally through a proxy),
//! emitting the transport breadcrumbs the Connection re-exposes as its
//! own `event` signal.
//!
//! Grounded in the teacher's `connect_upstream`/`with_timeout` (TCP dial
//! wrapped in a hard deadline) and `knassar702-slinger`'s
//! `ConnectorBuilder` for the timeout/proxy configuration surface.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ConnectionError;
use crate::events::{EventKind, Signals};
use crate::proxy::{Connectable, ProxyResolverPolicy, ProxyTarget};
use crate::socket_props::SocketProperties;

/// Result of a successful [`SocketFactory::connect`].
pub struct ConnectOutcome {
    pub stream: TcpStream,
    pub remote_address: SocketAddr,
    pub proxy_target: Option<ProxyTarget>,
}

/// Produces outbound TCP connectors configured from a connection's
/// [`SocketProperties`], per §4.1.
pub(crate) struct SocketFactory<'a> {
    props: &'a SocketProperties,
}

impl<'a> SocketFactory<'a> {
    pub(crate) fn new(props: &'a SocketProperties) -> Self {
        SocketFactory { props }
    }

    /// Dials `target`, applying the configured proxy policy, local bind
    /// address, and I/O timeout. Emits `resolving`/`connecting`/`proxying`
    /// events through `signals` but never `complete` — the Connection
    /// synthesizes that event itself once any TLS layer is also up.
    pub(crate) async fn connect(
        &self,
        target: &dyn Connectable,
        signals: &Signals,
    ) -> Result<ConnectOutcome, ConnectionError> {
        signals.emit_event(EventKind::Resolving);

        let proxy_target = match &self.props.proxy_policy {
            ProxyResolverPolicy::UseDefault | ProxyResolverPolicy::Disabled => None,
            ProxyResolverPolicy::Resolver(_) => self.props.proxy_policy.resolve(target),
        };

        let dial_addr = proxy_target
            .as_ref()
            .map(|p| p.addr)
            .unwrap_or_else(|| target.socket_addr());

        signals.emit_event(EventKind::Connecting);
        if proxy_target.is_some() {
            signals.emit_event(EventKind::Proxying);
        }

        let connect_fut = self.dial(dial_addr);
        let stream = match self.props.io_timeout {
            Some(dur) => apply_timeout(dur, connect_fut).await?,
            None => connect_fut.await?,
        };

        debug!(remote = %dial_addr, "tcp established");

        Ok(ConnectOutcome {
            stream,
            remote_address: dial_addr,
            proxy_target,
        })
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, ConnectionError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(ConnectionError::tcp)?;

        if let Some(local) = self.props.local_addr {
            socket
                .bind(SocketAddr::new(local, 0))
                .map_err(ConnectionError::tcp)?;
        }

        socket.connect(addr).await.map_err(ConnectionError::tcp)
    }
}

async fn apply_timeout<T>(
    dur: Duration,
    fut: impl std::future::Future<Output = Result<T, ConnectionError>>,
) -> Result<T, ConnectionError> {
    match timeout(dur, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(ConnectionError::tcp(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect timed out after {dur:?}"),
        ))),
    }
}
