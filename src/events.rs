//! Observer-style signal surface: transport events, the accept-certificate
//! accumulator, and the once-only disconnected notification.
//!
//! The Connection is confined to a single thread (see §5), so these are
//! plain `Rc<RefCell<Vec<_>>>` callback registries rather than anything
//! needing `Send`/`Sync` — the idiomatic shape for a single-threaded
//! reactor-bound object, the way `linkerd-linkerd-tcp` keeps per-connection
//! state in `Rc<RefCell<_>>` rather than behind a lock.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustls_pki_types::CertificateDer;

/// Named transport-establishment breadcrumbs, bit-exact per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Resolving,
    Connecting,
    Proxying,
    ProxyNegotiating,
    ProxyNegotiated,
    TlsHandshaking,
    TlsHandshaked,
    Complete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Resolving => "resolving",
            EventKind::Connecting => "connecting",
            EventKind::Proxying => "proxying",
            EventKind::ProxyNegotiating => "proxy-negotiating",
            EventKind::ProxyNegotiated => "proxy-negotiated",
            EventKind::TlsHandshaking => "tls-handshaking",
            EventKind::TlsHandshaked => "tls-handshaked",
            EventKind::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Verification errors accompanying an untrusted peer certificate, passed
/// to `accept-certificate` observers.
#[derive(Debug, Clone)]
pub struct CertificateErrors {
    pub message: String,
}

/// Value-typed properties that change during a Connection's lifetime and
/// carry their own change notification, distinct from the `event` signal
/// (see §9, "Object properties with change notifications").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    State,
    RemoteAddress,
    TlsCertificate,
    TlsCertificateErrors,
}

type EventObserver = Box<dyn FnMut(EventKind)>;
type AcceptCertObserver = Box<dyn FnMut(&CertificateDer<'static>, &CertificateErrors) -> bool>;
type DisconnectedObserver = Box<dyn FnMut()>;
type PropertyObserver = Box<dyn FnMut(Property)>;

#[derive(Default)]
struct SignalsInner {
    event: Vec<EventObserver>,
    accept_certificate: Vec<AcceptCertObserver>,
    disconnected: Vec<DisconnectedObserver>,
    disconnected_emitted: bool,
    notify: Vec<PropertyObserver>,
}

/// The Connection's signal surface. Cheaply cloneable (`Rc`-backed) so it
/// can be shared with the TLS builder's certificate-verifier callback
/// without the Connection itself needing to outlive the handshake.
#[derive(Clone, Default)]
pub struct Signals {
    inner: Rc<RefCell<SignalsInner>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an `event` observer. Fires for every breadcrumb in
    /// establishment order; never fires for `Complete` from the socket
    /// layer directly (the Connection synthesizes that event itself,
    /// see §4.1).
    pub fn on_event(&self, observer: impl FnMut(EventKind) + 'static) {
        self.inner.borrow_mut().event.push(Box::new(observer));
    }

    /// Register an `accept-certificate` observer. The first observer to
    /// return `true` short-circuits the accumulator and accepts the
    /// certificate; if none return `true`, the certificate is rejected.
    pub fn on_accept_certificate(
        &self,
        observer: impl FnMut(&CertificateDer<'static>, &CertificateErrors) -> bool + 'static,
    ) {
        self.inner
            .borrow_mut()
            .accept_certificate
            .push(Box::new(observer));
    }

    /// Register a `disconnected` observer. Fires at most once per
    /// Connection lifetime.
    pub fn on_disconnected(&self, observer: impl FnMut() + 'static) {
        self.inner.borrow_mut().disconnected.push(Box::new(observer));
    }

    /// Register a property-change observer (state, remote-address,
    /// tls-certificate, tls-certificate-errors).
    pub fn on_notify(&self, observer: impl FnMut(Property) + 'static) {
        self.inner.borrow_mut().notify.push(Box::new(observer));
    }

    pub(crate) fn notify(&self, property: Property) {
        for observer in self.inner.borrow_mut().notify.iter_mut() {
            observer(property);
        }
    }

    pub(crate) fn emit_event(&self, kind: EventKind) {
        for observer in self.inner.borrow_mut().event.iter_mut() {
            observer(kind);
        }
    }

    /// True-handled accumulator: returns as soon as an observer accepts.
    pub(crate) fn emit_accept_certificate(
        &self,
        cert: &CertificateDer<'static>,
        errors: &CertificateErrors,
    ) -> bool {
        for observer in self.inner.borrow_mut().accept_certificate.iter_mut() {
            if observer(cert, errors) {
                return true;
            }
        }
        false
    }

    /// Emits `disconnected` exactly once across the Connection's
    /// lifetime; subsequent calls are no-ops.
    pub(crate) fn emit_disconnected_once(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.disconnected_emitted {
            return;
        }
        inner.disconnected_emitted = true;
        for observer in inner.disconnected.iter_mut() {
            observer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn accept_certificate_short_circuits_on_true() {
        let signals = Signals::new();
        let calls = Rc::new(Cell::new(0));

        let calls_a = calls.clone();
        signals.on_accept_certificate(move |_, _| {
            calls_a.set(calls_a.get() + 1);
            true
        });
        let calls_b = calls.clone();
        signals.on_accept_certificate(move |_, _| {
            calls_b.set(calls_b.get() + 1);
            true
        });

        let cert = CertificateDer::from(vec![0u8; 4]);
        let errors = CertificateErrors { message: "untrusted".into() };
        assert!(signals.emit_accept_certificate(&cert, &errors));
        assert_eq!(calls.get(), 1, "second observer must not run once the first accepted");
    }

    #[test]
    fn accept_certificate_rejects_when_all_decline() {
        let signals = Signals::new();
        signals.on_accept_certificate(|_, _| false);
        signals.on_accept_certificate(|_, _| false);

        let cert = CertificateDer::from(vec![0u8; 4]);
        let errors = CertificateErrors { message: "untrusted".into() };
        assert!(!signals.emit_accept_certificate(&cert, &errors));
    }

    #[test]
    fn disconnected_fires_at_most_once() {
        let signals = Signals::new();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        signals.on_disconnected(move || count_clone.set(count_clone.get() + 1));

        signals.emit_disconnected_once();
        signals.emit_disconnected_once();

        assert_eq!(count.get(), 1);
    }
}
