//! Session lifecycle.
//!
//! ```text
//! Pending --Authenticated--> Active
//! Pending | Active --CloseRequested--> Closing --Finished--> Closed
//! ```
//!
//! Every state change goes through [`Lifecycle::apply`], which also cancels
//! the session's token on entry to `Closing` so that blocked waiters wake.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// ECDH done, PSK not yet proven.
    Pending,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Authenticated,
    CloseRequested,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub event: LifecycleEvent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid lifecycle transition from {0:?} via {1:?}")]
pub struct InvalidTransition(pub SessionState, pub LifecycleEvent);

impl SessionState {
    /// The state `event` leads to, if it is legal from `self`.
    pub fn next(self, event: LifecycleEvent) -> Option<SessionState> {
        use LifecycleEvent::*;
        use SessionState::*;

        match (self, event) {
            (Pending, Authenticated) => Some(Active),
            (Pending | Active, CloseRequested) => Some(Closing),
            (Closing, Finished) => Some(Closed),
            _ => None,
        }
    }

    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

pub(crate) struct Lifecycle {
    state: Mutex<SessionState>,
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new(initial: SessionState) -> Self {
        Self {
            state: Mutex::new(initial),
            token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn apply(&self, event: LifecycleEvent) -> Result<LifecycleTransition, InvalidTransition> {
        let transition = {
            let mut state = self.state.lock();
            let from = *state;
            let to = from.next(event).ok_or(InvalidTransition(from, event))?;
            *state = to;
            LifecycleTransition { from, to, event }
        };

        if transition.to == SessionState::Closing {
            self.token.cancel();
        }
        Ok(transition)
    }
}
