//! Client-side HTTP/1.x connection core: TCP establishment, optional HTTP
//! proxying (including CONNECT tunnels), TLS handshake, idle-connection
//! liveness probing, and the finite lifecycle state machine that governs
//! reuse of a single transport-level endpoint.
//!
//! This crate is deliberately narrow: it does not parse HTTP headers or
//! bodies, does not multiplex many connections, and does not resolve
//! DNS. Those are the session/message-codec's job, built on top of the
//! [`Connection`] this crate exposes.
//!
//! A [`Connection`] is `!Send` and must be constructed and driven from
//! within a single [`tokio::task::LocalSet`] — see the module docs on
//! `connection` for why.

mod connection;
mod error;
mod events;
mod idle_timer;
mod message;
mod proxy;
mod socket_factory;
mod socket_props;
mod state;
mod tls;

pub use connection::{Connection, ConnStream, ConnectionIo, SocketRef, StolenStream};
pub use error::ConnectionError;
pub use events::{CertificateErrors, EventKind, Property, Signals};
pub use message::{CodecHandle, Message, SessionFeature};
pub use proxy::{Connectable, Endpoint, ProxyResolver, ProxyResolverPolicy, ProxyTarget};
pub use socket_props::{SocketProperties, SocketPropertiesBuilder};
pub use state::ConnectionState;
pub use tls::{load_root_store_from_pem, TlsDatabase, TlsInteraction};
