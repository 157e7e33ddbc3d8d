//! Connection State Machine: the finite-state controller from §4.4.
//!
//! Sole owner of `in_use_count`, `reusable`, `unused_timeout`, and the
//! cancellation token. The idle timer itself (`idle_timer::IdleTimer`) is
//! owned alongside it but armed/disarmed by the Connection, since arming
//! requires a disconnect callback only the Connection can provide.
//!
//! No raw state setter is public: every mutation goes through one of the
//! named transition operations below, matching the transition table in
//! §4.4 exactly.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::usage_violation;

/// The post-connect grace window before a never-used connection may be
/// reaped, per §9 ("the 3-second post-connect unused-grace window is
/// hard-coded"). Mirrors libsoup's `SOUP_CONNECTION_UNUSED_TIMEOUT`.
pub(crate) const UNUSED_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Idle,
    InUse,
    Disconnected,
}

/// What a transition requires the caller (the Connection) to additionally
/// do, since the state machine itself does not own I/O, timers that need
/// a disconnect callback, or signal emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// The operation was a no-op with respect to externally visible state.
    Unchanged,
    /// The connection just became idle: the caller should arm the idle
    /// timer if `idle_timeout > 0`.
    EnteredIdle,
    /// The connection just became disconnected: the caller should close
    /// the stream and emit `disconnected` (see `should_emit_disconnected`).
    EnteredDisconnected,
}

pub(crate) struct StateMachine {
    state: ConnectionState,
    in_use_count: u32,
    reusable: bool,
    unused_timeout: Option<Instant>,
    cancel: Option<CancellationToken>,
    ever_connected: bool,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        StateMachine {
            state: ConnectionState::New,
            in_use_count: 0,
            reusable: false,
            unused_timeout: None,
            cancel: None,
            ever_connected: false,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn in_use_count(&self) -> u32 {
        self.in_use_count
    }

    pub(crate) fn reusable(&self) -> bool {
        self.reusable
    }

    /// `ever_used` per §4.5's accessor: the unused-grace window has been
    /// cleared by a first body-end, i.e. the connection has carried at
    /// least one full message.
    pub(crate) fn ever_used(&self) -> bool {
        self.unused_timeout.is_none() && self.ever_connected
    }

    pub(crate) fn unused_timeout(&self) -> Option<Instant> {
        self.unused_timeout
    }

    pub(crate) fn cancellation_token(&self) -> Option<CancellationToken> {
        self.cancel.clone()
    }

    /// New → Connecting. Returns the cancellation token the caller should
    /// pass down to the socket/TLS layers: either `external` (inherited)
    /// or a freshly allocated one.
    pub(crate) fn begin_connect(&mut self, external: Option<CancellationToken>) -> CancellationToken {
        if self.state != ConnectionState::New {
            usage_violation(format_args!(
                "connect() called while state={:?}, expected New",
                self.state
            ));
        }
        let token = external.unwrap_or_default();
        self.cancel = Some(token.clone());
        self.state = ConnectionState::Connecting;
        token
    }

    /// Connecting → InUse on TCP (+ optional TLS) success. Sets
    /// `unused_timeout` to the 3-second grace deadline and starts the
    /// connection at a single borrow, matching "connect succeeds... (InUse
    /// with unused-timeout grace)" in §2's data-flow summary.
    pub(crate) fn complete_connect(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.cancel = None;
        self.ever_connected = true;
        self.unused_timeout = Some(Instant::now() + UNUSED_GRACE);
        self.in_use_count = 1;
        self.state = ConnectionState::InUse;
    }

    /// Connecting → Disconnected on TCP/TLS failure.
    pub(crate) fn fail_connect(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.cancel = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Precondition for `tunnel_handshake`: InUse and no cancellation
    /// token outstanding. The caller is additionally responsible for
    /// checking "underlying stream is plain TCP" since this type has no
    /// visibility into the stream.
    pub(crate) fn begin_tunnel_handshake(&mut self, external: Option<CancellationToken>) -> CancellationToken {
        if self.state != ConnectionState::InUse {
            usage_violation(format_args!(
                "tunnel_handshake() called while state={:?}, expected InUse",
                self.state
            ));
        }
        if self.cancel.is_some() {
            usage_violation("tunnel_handshake() called with a cancellation token already outstanding");
        }
        let token = external.unwrap_or_default();
        self.cancel = Some(token.clone());
        token
    }

    pub(crate) fn complete_tunnel_handshake(&mut self) {
        self.cancel = None;
    }

    pub(crate) fn fail_tunnel_handshake(&mut self) {
        self.cancel = None;
        self.state = ConnectionState::Disconnected;
    }

    /// `set_in_use(true)`: Idle → InUse (count=1) or InUse → InUse
    /// (count++).
    pub(crate) fn borrow(&mut self) -> Transition {
        match self.state {
            ConnectionState::Idle => {
                self.in_use_count = 1;
                self.state = ConnectionState::InUse;
                Transition::Unchanged
            }
            ConnectionState::InUse => {
                self.in_use_count += 1;
                Transition::Unchanged
            }
            other => usage_violation(format_args!(
                "set_in_use(true) called while state={other:?}, expected Idle or InUse"
            )),
        }
    }

    /// `set_in_use(false)`: decrements the borrow count; at zero, enters
    /// Idle (if `reusable`) or Disconnected.
    pub(crate) fn release(&mut self) -> Transition {
        if self.state != ConnectionState::InUse {
            usage_violation(format_args!(
                "set_in_use(false) called while state={:?}, expected InUse",
                self.state
            ));
        }
        self.in_use_count = self.in_use_count.saturating_sub(1);
        if self.in_use_count > 0 {
            return Transition::Unchanged;
        }
        if self.reusable {
            self.state = ConnectionState::Idle;
            Transition::EnteredIdle
        } else {
            self.state = ConnectionState::Disconnected;
            Transition::EnteredDisconnected
        }
    }

    /// Always sets `reusable = true`; there is no supported path to
    /// `false` (see §9's Open Questions — the source unconditionally sets
    /// true regardless of the caller's argument).
    pub(crate) fn set_reusable(&mut self) {
        self.reusable = true;
    }

    /// The first body-end clears the unused-timeout grace: the connection
    /// is now "ever-used" and reasoned about purely via `reusable`.
    pub(crate) fn record_body_end(&mut self, reusable: bool) {
        self.unused_timeout = None;
        self.reusable = reusable;
    }

    /// Idle → Disconnected on idle-timer expiry. A no-op if the
    /// connection already left Idle by the time the timer fired (the
    /// timer is aborted on every state leave, but a fire can still be
    /// in-flight on the executor).
    pub(crate) fn idle_timer_fired(&mut self) -> Transition {
        if self.state != ConnectionState::Idle {
            return Transition::Unchanged;
        }
        self.state = ConnectionState::Disconnected;
        Transition::EnteredDisconnected
    }

    /// Any non-Disconnected state → Disconnected. Idempotent.
    pub(crate) fn disconnect(&mut self) -> Transition {
        if self.state == ConnectionState::Disconnected {
            return Transition::Unchanged;
        }
        self.cancel = None;
        self.state = ConnectionState::Disconnected;
        Transition::EnteredDisconnected
    }

    /// Whether a `disconnect`-triggered transition should emit the
    /// `disconnected` signal: only if the connection ever reached a
    /// connected state (see §7, "the Connection emits no disconnected
    /// signal if it never reached a connected state").
    pub(crate) fn should_emit_disconnected(&self) -> bool {
        self.ever_connected
    }
}
