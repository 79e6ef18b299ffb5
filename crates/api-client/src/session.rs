//! Session state machine
//!
//! Pure transition function plus a small holder that publishes the current
//! status over a `watch` channel (for UI gating) and outward auth events over
//! a `broadcast` channel (for "redirect to login" handling).
//!
//! Transitions:
//! - any + LoginSucceeded → Authenticated
//! - any + Logout → Anonymous
//! - Authenticated + RefreshStarted → Refreshing
//! - Authenticated/Refreshing + RefreshSucceeded → Authenticated
//! - any + RefreshFailed → Expired
//!
//! Anything else leaves the state unchanged.

use tokio::sync::{broadcast, watch};
use tracing::info;

/// Capacity of the auth event channel. Slow subscribers miss old events
/// rather than blocking the pipeline.
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionStatus {
    /// Status label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Anonymous => "anonymous",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Refreshing => "refreshing",
            SessionStatus::Expired => "expired",
        }
    }

    /// Whether the credential store is expected to hold a token pair.
    pub fn has_credential(&self) -> bool {
        matches!(
            self,
            SessionStatus::Authenticated | SessionStatus::Refreshing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoginSucceeded,
    Logout,
    RefreshStarted,
    RefreshSucceeded,
    RefreshFailed,
}

/// Outward signals for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    LoggedIn,
    Refreshed,
    /// Refresh was impossible; the UI must navigate to the login entry point.
    SessionExpired { reason: String },
    LoggedOut,
}

/// Handle a state transition. Pure function: no I/O.
pub fn transition(state: SessionStatus, event: SessionEvent) -> SessionStatus {
    match (state, event) {
        (_, SessionEvent::LoginSucceeded) => SessionStatus::Authenticated,
        (_, SessionEvent::Logout) => SessionStatus::Anonymous,
        (SessionStatus::Authenticated, SessionEvent::RefreshStarted) => SessionStatus::Refreshing,
        (
            SessionStatus::Authenticated | SessionStatus::Refreshing,
            SessionEvent::RefreshSucceeded,
        ) => SessionStatus::Authenticated,
        (_, SessionEvent::RefreshFailed) => SessionStatus::Expired,
        (state, _) => state,
    }
}

/// Process-wide session status holder. One per pipeline instance.
pub struct SessionState {
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<AuthEvent>,
}

impl SessionState {
    pub fn new(initial: SessionStatus) -> Self {
        let (status, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { status, events }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Apply an event and return the resulting status.
    pub fn apply(&self, event: SessionEvent) -> SessionStatus {
        let mut from = None;
        self.status.send_if_modified(|current| {
            let next = transition(*current, event);
            if next == *current {
                return false;
            }
            from = Some(*current);
            *current = next;
            true
        });
        let now = self.status();
        if let Some(from) = from {
            info!(from = from.label(), to = now.label(), ?event, "session transition");
        }
        now
    }

    /// Receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Receiver for outward auth events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: AuthEvent) {
        // No subscribers is fine: headless callers don't listen.
        let _ = self.events.send(event);
    }
}
