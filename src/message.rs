//! The boundary traits to the two external collaborators named in §6: the
//! HTTP/1 message codec (`Message`) and the session-feature contract
//! (`SessionFeature`, a marker the core documents but never calls).

use crate::connection::{Connection, ConnectionIo};

/// What the Connection needs from an in-flight HTTP message to do its own
/// bookkeeping — reusability and CONNECT-tunnel detection — without
/// parsing HTTP itself. The real header/body framing lives in the message
/// codec, out of this crate's scope (§1).
pub trait Message {
    /// Whether this message is a CONNECT request, which drives the
    /// `proxy-negotiating`/`proxy-negotiated` event pair in §4.4.
    fn is_connect(&self) -> bool;

    /// Subscribes `on_body_end` to this message's body-completion event.
    ///
    /// For an ordinary message, `on_body_end` receives whether the
    /// connection may be reused per HTTP/1.1 persistence rules
    /// (`Connection: close` disables it; HTTP/1.0 enables it only with an
    /// explicit `keep-alive`). For a CONNECT message on a tunnel
    /// candidate, the Connection instead interprets it as whether the
    /// proxy returned a 2xx — the codec is the one recognizing success,
    /// per §1 ("it does not itself parse HTTP beyond recognizing success
    /// of a CONNECT response") — and reacts with `proxy-negotiated` /
    /// clearing `proxy_uri` rather than ordinary reuse bookkeeping.
    ///
    /// Implementations call this exactly once per message; a second call
    /// (replacing an earlier CONNECT message, per §4.5) drops the first
    /// subscription.
    fn on_body_end(&mut self, on_body_end: Box<dyn FnOnce(bool)>);

    /// Notifies the message it was detached by `steal_iostream` and
    /// should release any buffered state rather than waiting for a body
    /// that will never arrive.
    fn mark_stolen(&mut self);
}

/// A handle returned by `setup_message_io` for the caller to drive I/O
/// through. The core hands this out but never reads or writes through it
/// itself — the framing loop lives in the message codec.
pub struct CodecHandle {
    pub(crate) connection_id: u64,
    pub(crate) connection: Connection,
}

impl CodecHandle {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The byte stream to drive this message's framing over; see
    /// [`Connection::iostream`].
    pub fn iostream(&self) -> ConnectionIo {
        self.connection.iostream()
    }
}

/// The session-feature contract from §6: five hooks a feature plug-in
/// (logger, cookie jar, auth manager) implements against the session that
/// owns a Connection. The Connection core never calls these — they are
/// declared here purely so downstream crates share one vocabulary for
/// "wraps a Connection" plug-ins.
pub trait SessionFeature {
    fn attach(&mut self, session: &dyn std::any::Any);
    fn detach(&mut self, session: &dyn std::any::Any);

    /// Suppressed when the message has explicitly disabled this feature.
    fn request_queued(&mut self, session: &dyn std::any::Any, msg: &dyn Message);
    fn request_unqueued(&mut self, session: &dyn std::any::Any, msg: &dyn Message);

    fn add_feature(&mut self, _feature_type: std::any::TypeId) {}
    fn remove_feature(&mut self, _feature_type: std::any::TypeId) {}
    fn has_feature(&self, _feature_type: std::any::TypeId) -> bool {
        false
    }
}
