//! Connection Object: the public façade of the core (~50% of it, per
//! §2), composing the Socket Factory, TLS Client Builder, Idle Timer and
//! Connection State Machine behind the operations and accessors of §4.5.
//!
//! Mirrors `linkerd-linkerd-tcp`'s `Rc<RefCell<Socket>>` shape: the
//! Connection is reference-counted and interior-mutable rather than
//! `&mut`-threaded, since its timer and certificate-verifier callbacks
//! must hold a handle back to it without becoming its owner.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use rustls_pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::error::{usage_violation, ConnectionError};
use crate::events::{CertificateErrors, EventKind, Property, Signals};
use crate::idle_timer::IdleTimer;
use crate::message::{CodecHandle, Message};
use crate::proxy::Connectable;
use crate::socket_factory::SocketFactory;
use crate::socket_props::SocketProperties;
use crate::state::{ConnectionState, StateMachine, Transition};
use crate::tls;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Either leg of the byte stream a Connection may own: plain TCP before
/// any TLS layer, or a completed TLS client stream (direct or tunneled).
pub enum ConnStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ConnStream {
    fn tcp_ref(&self) -> &TcpStream {
        match self {
            ConnStream::Plain(tcp) => tcp,
            ConnStream::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            // require-close-notify is effectively disabled: a peer that
            // closes the TCP connection without sending a TLS
            // close_notify surfaces here as `UnexpectedEof`, which we
            // treat as a clean, zero-byte read rather than an error.
            ConnStream::Tls(tls) => match Pin::new(tls.as_mut()).poll_read(cx, buf) {
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Poll::Ready(Ok(())),
                other => other,
            },
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            ConnStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            ConnStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            ConnStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The byte stream handed back by `steal_iostream`, carrying the last
/// known remote address as a stand-in for GIO's "back-reference to the
/// socket" (Rust has no `g_object_set_data` analogue — see DESIGN.md).
pub struct StolenStream {
    pub stream: ConnStream,
    pub remote_address: Option<SocketAddr>,
}

/// Borrowed access to the raw TCP socket underneath a [`Connection`],
/// peeled through any TLS layer. Returned by [`Connection::socket`].
pub struct SocketRef<'a> {
    stream: std::cell::Ref<'a, Option<ConnStream>>,
}

impl<'a> SocketRef<'a> {
    fn tcp(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .map(ConnStream::tcp_ref)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection has no stream installed"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp()?.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp()?.local_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.tcp()?.set_nodelay(nodelay)
    }
}

/// A non-owning handle to a [`Connection`]'s byte stream, returned by
/// [`Connection::iostream`] (and, via [`crate::message::CodecHandle`], to
/// the message codec). Reads and writes go through any TLS layer
/// installed at the time of the call.
pub struct ConnectionIo(Rc<Inner>);

impl AsyncRead for ConnectionIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.0.stream.borrow_mut();
        match stream.as_mut() {
            Some(s) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "connection has no stream installed"))),
        }
    }
}

impl AsyncWrite for ConnectionIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut stream = self.0.stream.borrow_mut();
        match stream.as_mut() {
            Some(s) => Pin::new(s).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "connection has no stream installed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.0.stream.borrow_mut();
        match stream.as_mut() {
            Some(s) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.0.stream.borrow_mut();
        match stream.as_mut() {
            Some(s) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

struct Inner {
    id: u64,
    target: Rc<dyn Connectable>,
    props: Rc<SocketProperties>,
    ssl_requested: bool,
    signals: Signals,
    state: RefCell<StateMachine>,
    idle_timer: IdleTimer,
    stream: RefCell<Option<ConnStream>>,
    remote_address: Cell<Option<SocketAddr>>,
    proxy_uri: RefCell<Option<Url>>,
    tls_certificate: RefCell<Option<CertificateDer<'static>>>,
    tls_certificate_errors: RefCell<Option<CertificateErrors>>,
    current_msg: RefCell<Option<Box<dyn Message>>>,
}

/// A single transport-level endpoint: TCP establishment, optional HTTP
/// proxying, TLS, idle probing, and the lifecycle state machine, per §1.
///
/// Deliberately `!Send`: all mutation happens through `Rc<RefCell<_>>`
/// interior state, so a Connection must be constructed and driven from
/// within a single `tokio::task::LocalSet` (see §5).
#[derive(Clone)]
pub struct Connection(Rc<Inner>);

impl Connection {
    pub fn new(
        target: Rc<dyn Connectable>,
        props: Rc<SocketProperties>,
        ssl_requested: bool,
    ) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Connection(Rc::new(Inner {
            id,
            target,
            props,
            ssl_requested,
            signals: Signals::new(),
            state: RefCell::new(StateMachine::new()),
            idle_timer: IdleTimer::new(),
            stream: RefCell::new(None),
            remote_address: Cell::new(None),
            proxy_uri: RefCell::new(None),
            tls_certificate: RefCell::new(None),
            tls_certificate_errors: RefCell::new(None),
            current_msg: RefCell::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn signals(&self) -> &Signals {
        &self.0.signals
    }

    pub fn state(&self) -> ConnectionState {
        self.0.state.borrow().state()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.0.remote_address.get()
    }

    pub fn proxy_uri(&self) -> Option<Url> {
        self.0.proxy_uri.borrow().clone()
    }

    pub fn is_via_proxy(&self) -> bool {
        self.0.proxy_uri.borrow().is_some()
    }

    /// `ssl_requested ∧ proxy_uri present`, per §4.5.
    pub fn is_tunnelled(&self) -> bool {
        self.0.ssl_requested && self.is_via_proxy()
    }

    pub fn ever_used(&self) -> bool {
        self.0.state.borrow().ever_used()
    }

    pub fn tls_certificate(&self) -> Option<CertificateDer<'static>> {
        self.0.tls_certificate.borrow().clone()
    }

    pub fn tls_certificate_errors(&self) -> Option<CertificateErrors> {
        self.0.tls_certificate_errors.borrow().clone()
    }

    /// The underlying TCP socket, peeled through any TLS layer, per
    /// §4.5's accessor table. Intended for socket-level inspection and
    /// tuning (peer/local address, `TCP_NODELAY`), not for driving
    /// application I/O — use [`Connection::iostream`] for that.
    pub fn socket(&self) -> SocketRef<'_> {
        SocketRef {
            stream: self.0.stream.borrow(),
        }
    }

    /// The byte stream the message codec drives one request at a time,
    /// TLS-aware where applicable, per §4.5's accessor table and §2's
    /// "the message codec obtains the byte stream and drives one request
    /// at a time". Unlike `steal_iostream`, this does not transfer
    /// ownership: any number of handles may be obtained, though only one
    /// may be read from or written to at a time (the codec's own
    /// contract, matching the state machine's "one message at a time").
    pub fn iostream(&self) -> ConnectionIo {
        ConnectionIo(self.0.clone())
    }

    /// Connect operation, §4.5. Precondition: `state == New`.
    pub async fn connect(&self, cancel: Option<CancellationToken>) -> Result<(), ConnectionError> {
        let token = self.0.state.borrow_mut().begin_connect(cancel);
        self.0.signals.notify(Property::State);

        let factory = SocketFactory::new(&self.0.props);
        let connect_result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ConnectionError::Cancelled),
            res = factory.connect(self.0.target.as_ref(), &self.0.signals) => res,
        };

        let outcome = match connect_result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.0.state.borrow_mut().fail_connect();
                self.0.signals.notify(Property::State);
                return Err(err);
            }
        };

        self.0.remote_address.set(Some(outcome.remote_address));
        self.0.signals.notify(Property::RemoteAddress);

        if let Some(target_proxy) = &outcome.proxy_target {
            if target_proxy.protocol.eq_ignore_ascii_case("http") {
                *self.0.proxy_uri.borrow_mut() = Some(target_proxy.uri.clone());
            } else {
                warn!(protocol = %target_proxy.protocol, "proxy protocol is not an HTTP CONNECT candidate; proxy_uri left unset");
            }
        }

        // A CONNECT tunnel candidate defers its "complete" event to the
        // later tunnel_handshake(); see §4.4's transition-table note.
        let tunnel_candidate = self.0.ssl_requested && self.0.proxy_uri.borrow().is_some();

        let stream = if self.0.ssl_requested && self.0.proxy_uri.borrow().is_none() {
            match self.run_tls_handshake(outcome.stream, &token).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.0.state.borrow_mut().fail_connect();
                    self.0.signals.notify(Property::State);
                    return Err(err);
                }
            }
        } else {
            ConnStream::Plain(outcome.stream)
        };

        *self.0.stream.borrow_mut() = Some(stream);
        self.0.state.borrow_mut().complete_connect();
        if !tunnel_candidate {
            self.0.signals.emit_event(EventKind::Complete);
        }
        self.0.signals.notify(Property::State);
        info!(id = self.0.id, "connection established");
        Ok(())
    }

    /// Upgrades a plain-TCP, tunnel-candidate connection to TLS, §4.5.
    /// Precondition: `state == InUse`, stream is plain TCP, no
    /// cancellation token outstanding.
    pub async fn tunnel_handshake(&self, cancel: Option<CancellationToken>) -> Result<(), ConnectionError> {
        {
            let stream_ref = self.0.stream.borrow();
            if !matches!(stream_ref.as_ref(), Some(ConnStream::Plain(_))) {
                usage_violation("tunnel_handshake() called without an established plain-TCP stream");
            }
        }
        let token = self.0.state.borrow_mut().begin_tunnel_handshake(cancel);

        let tcp = match self.0.stream.borrow_mut().take() {
            Some(ConnStream::Plain(tcp)) => tcp,
            _ => unreachable!("checked above"),
        };

        match self.run_tls_handshake(tcp, &token).await {
            Ok(stream) => {
                *self.0.stream.borrow_mut() = Some(stream);
                self.0.state.borrow_mut().complete_tunnel_handshake();
                self.0.signals.emit_event(EventKind::Complete);
                self.0.signals.notify(Property::State);
                Ok(())
            }
            Err(err) => {
                self.0.state.borrow_mut().fail_tunnel_handshake();
                self.0.signals.notify(Property::State);
                Err(err)
            }
        }
    }

    async fn run_tls_handshake(
        &self,
        tcp: TcpStream,
        token: &CancellationToken,
    ) -> Result<ConnStream, ConnectionError> {
        let server_name = server_name_for(self.0.target.as_ref())?;
        self.0.signals.emit_event(EventKind::TlsHandshaking);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ConnectionError::Cancelled),
            res = tls::handshake(tcp, server_name, &self.0.props, &self.0.signals) => res,
        };

        match result {
            Ok(tls_stream) => {
                self.0.signals.emit_event(EventKind::TlsHandshaked);
                *self.0.tls_certificate.borrow_mut() = tls::peer_certificate(&tls_stream);
                Ok(ConnStream::Tls(Box::new(tls_stream)))
            }
            Err(err) => Err(err),
        }
    }

    /// Attaches `msg` as the current message, per §4.5: subscribes to its
    /// body-end event and clears the idle timer (the connection is about
    /// to carry traffic, not sit idle). Replacing an already-attached
    /// message is only permitted when that message is a CONNECT (§4.5).
    ///
    /// CONNECT tunnel negotiation (§4.4's "CONNECT tunnel specifics") is
    /// driven entirely off `msg.is_connect()` and the same body-end
    /// subscription: the codec is the one that writes the CONNECT request
    /// and recognizes a 2xx response (the Connection never parses HTTP
    /// itself, per §1), so for a CONNECT message the body-end callback's
    /// `bool` means "the tunnel was established" instead of "reusable".
    pub fn setup_message_io(&self, mut msg: Box<dyn Message>) -> CodecHandle {
        let state = self.0.state.borrow().state();
        if matches!(state, ConnectionState::New | ConnectionState::Disconnected) {
            usage_violation(format_args!("setup_message_io() called while state={state:?}"));
        }
        if let Some(existing) = self.0.current_msg.borrow().as_ref() {
            if !existing.is_connect() {
                usage_violation(
                    "setup_message_io() called with a message already attached; only replacing a CONNECT message is permitted",
                );
            }
        }
        self.0.idle_timer.stop();

        let negotiating_tunnel = msg.is_connect() && self.is_tunnelled();
        if negotiating_tunnel {
            self.0.signals.emit_event(EventKind::ProxyNegotiating);
        }

        let weak = Rc::downgrade(&self.0);
        msg.on_body_end(Box::new(move |ok| {
            if let Some(inner) = weak.upgrade() {
                let conn = Connection(inner);
                if negotiating_tunnel {
                    conn.complete_proxy_negotiation(ok);
                } else {
                    conn.record_body_end(ok);
                }
            }
        }));

        *self.0.current_msg.borrow_mut() = Some(msg);
        CodecHandle {
            connection_id: self.0.id,
            connection: self.clone(),
        }
    }

    fn record_body_end(&self, reusable: bool) {
        self.0.state.borrow_mut().record_body_end(reusable);
    }

    /// Reacts to the CONNECT message's body-end (headers-only, per
    /// §1 — a CONNECT response carries no body): on success emits
    /// `proxy-negotiated` and clears `proxy_uri`, the tunnel being a
    /// transparent relay from this point on. On failure the proxy
    /// refused the tunnel; the session is expected to disconnect.
    fn complete_proxy_negotiation(&self, tunnel_established: bool) {
        if tunnel_established {
            self.0.signals.emit_event(EventKind::ProxyNegotiated);
            *self.0.proxy_uri.borrow_mut() = None;
        } else {
            warn!(id = self.0.id, "proxy refused CONNECT tunnel");
        }
    }

    /// `set_in_use(true)`: borrow. `set_in_use(false)`: release, which may
    /// enter Idle (arming the idle timer) or Disconnected.
    pub fn set_in_use(&self, in_use: bool) {
        let transition = if in_use {
            self.0.state.borrow_mut().borrow()
        } else {
            *self.0.current_msg.borrow_mut() = None;
            self.0.state.borrow_mut().release()
        };

        match transition {
            Transition::EnteredIdle => {
                self.arm_idle_timer();
                self.0.signals.notify(Property::State);
            }
            Transition::EnteredDisconnected => {
                self.teardown(true);
            }
            Transition::Unchanged => {
                self.0.signals.notify(Property::State);
            }
        }
    }

    fn arm_idle_timer(&self) {
        let idle_timeout = match self.0.props.idle_timeout {
            Some(d) if !d.is_zero() => d,
            _ => return,
        };
        let weak = Rc::downgrade(&self.0);
        self.0.idle_timer.start(idle_timeout, move || async move {
            if let Some(inner) = weak.upgrade() {
                let conn = Connection(inner);
                if conn.0.state.borrow_mut().idle_timer_fired() == Transition::EnteredDisconnected {
                    conn.teardown(true);
                }
            }
        });
    }

    /// Always sets `reusable = true`; see §9's Open Questions resolution.
    pub fn set_reusable(&self) {
        self.0.state.borrow_mut().set_reusable();
    }

    /// Precondition: `state == Idle`. Non-destructively probes for
    /// peer-initiated disconnection, §4.5/§8.
    ///
    /// A TLS connection is probed through its record layer rather than
    /// the raw socket: a stray post-handshake record (session ticket,
    /// alert) sitting in the kernel socket buffer is not application
    /// data, and raw `try_read` cannot tell the difference — exactly the
    /// false-positive `libsoup`'s `soup-connection.c` avoids by reading
    /// through its `iostream`, not the bare `GSocket`.
    pub fn is_idle_open(&self) -> bool {
        let state = self.0.state.borrow().state();
        if state != ConnectionState::Idle {
            usage_violation(format_args!("is_idle_open() called while state={state:?}, expected Idle"));
        }
        if let Some(deadline) = self.0.state.borrow().unused_timeout() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
        }
        let mut stream_ref = self.0.stream.borrow_mut();
        match stream_ref.as_mut() {
            Some(ConnStream::Plain(tcp)) => {
                let mut probe = [0u8; 1];
                matches!(tcp.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
            }
            Some(ConnStream::Tls(tls)) => {
                let waker = noop_waker();
                let mut cx = Context::from_waker(&waker);
                let mut probe = [0u8; 1];
                let mut buf = ReadBuf::new(&mut probe);
                matches!(Pin::new(tls.as_mut()).poll_read(&mut cx, &mut buf), Poll::Pending)
            }
            None => false,
        }
    }

    /// Transfers ownership of the byte stream to the caller, detaching
    /// the codec and disarming the idle timer. Any further operation on
    /// the Connection other than `disconnect` is a contract violation.
    pub fn steal_iostream(&self) -> StolenStream {
        let state = self.0.state.borrow().state();
        if matches!(state, ConnectionState::New | ConnectionState::Disconnected) {
            usage_violation(format_args!("steal_iostream() called while state={state:?}"));
        }
        self.0.idle_timer.stop();
        if let Some(msg) = self.0.current_msg.borrow_mut().as_mut() {
            msg.mark_stolen();
        }
        *self.0.current_msg.borrow_mut() = None;

        let stream = self
            .0
            .stream
            .borrow_mut()
            .take()
            .unwrap_or_else(|| usage_violation("steal_iostream() called with no stream installed"));

        let sock_ref = socket2::SockRef::from(stream.tcp_ref());
        let _ = sock_ref.set_read_timeout(None);
        let _ = sock_ref.set_write_timeout(None);

        StolenStream {
            stream,
            remote_address: self.remote_address(),
        }
    }

    /// Idempotent; safe from any state. Emits `disconnected` only if the
    /// connection ever reached a connected state and was not already
    /// Disconnected.
    pub fn disconnect(&self) {
        let transition = self.0.state.borrow_mut().disconnect();
        self.teardown(transition == Transition::EnteredDisconnected);
    }

    /// Closes the stream and, if `just_entered` and the connection ever
    /// connected, emits `disconnected` exactly once.
    fn teardown(&self, just_entered: bool) {
        self.0.idle_timer.stop();
        *self.0.current_msg.borrow_mut() = None;
        self.0.stream.borrow_mut().take();
        if just_entered {
            self.0.signals.notify(Property::State);
            if self.0.state.borrow().should_emit_disconnected() {
                info!(id = self.0.id, "connection disconnected");
                self.0.signals.emit_disconnected_once();
            }
        }
    }
}

fn server_name_for(target: &dyn Connectable) -> Result<ServerName<'static>, ConnectionError> {
    ServerName::try_from(target.host().to_string())
        .map_err(|e| ConnectionError::TlsInit(format!("invalid server name {:?}: {e}", target.host())))
}

/// A `Waker` that does nothing, for polling a future exactly once to see
/// whether it would block — used by `is_idle_open`'s TLS probe, which
/// has no reactor registration to wait on anyway (a `false`/`Pending`
/// result is read immediately, never awaited).
fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn no_op(_: *const ()) {}
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}
