// SPDX-License-Identifier: AGPL-3.0-only

//! Explicit connection lifecycle. State only moves through the permitted
//! transition table; every attempt, accepted or rejected, lands in a bounded
//! history ring so a support log can reconstruct what happened.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::ClockPort;
use crate::app::types::{ConnectionState, SessionInfo, StateTransition};

const HISTORY_CAP: usize = 50;
const OBSERVER_CAP: usize = 16;

/// Event delivered to observers on every accepted transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
}

struct Inner {
    state: ConnectionState,
    history: VecDeque<StateTransition>,
    retry_count: u32,
    last_error: Option<String>,
    last_activity: time::OffsetDateTime,
    session: Option<SessionInfo>,
}

pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateChange>,
    clock: Arc<dyn ClockPort>,
}

impl ConnectionStateMachine {
    pub fn new(clock: Arc<dyn ClockPort>) -> Self {
        let now = clock.now_utc();
        let (events, _) = broadcast::channel(OBSERVER_CAP);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                history: VecDeque::with_capacity(HISTORY_CAP),
                retry_count: 0,
                last_error: None,
                last_activity: now,
                session: None,
            }),
            events,
            clock,
        }
    }

    pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (from, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Expired)
                | (Expired, Connecting)
                | (Expired, Disconnected)
        )
    }

    fn legal_targets(from: ConnectionState) -> String {
        use ConnectionState::*;
        [Disconnected, Connecting, Connected, Expired]
            .into_iter()
            .filter(|to| Self::can_transition(from, *to))
            .map(|to| to.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Attempt a transition. A rejected transition leaves the state untouched
    /// but is still recorded in the history with `success = false`.
    pub fn transition_to(&self, to: ConnectionState, reason: &str) -> AppResult<()> {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        let from = inner.state;
        let allowed = Self::can_transition(from, to);

        push_history(
            &mut inner.history,
            StateTransition {
                from,
                to,
                at: now,
                reason: reason.to_string(),
                success: allowed,
            },
        );

        if !allowed {
            return Err(AppError::validation(format!(
                "invalid connection transition {from} -> {to}; from {from} only [{}] are permitted",
                Self::legal_targets(from)
            )));
        }

        inner.state = to;
        inner.last_activity = now;
        if to == ConnectionState::Connected {
            inner.retry_count = 0;
            inner.last_error = None;
        }
        if to == ConnectionState::Disconnected {
            inner.session = None;
        }
        drop(inner);

        tracing::info!(%from, %to, reason, "connection state changed");
        // No receivers is fine.
        let _ = self.events.send(StateChange {
            from,
            to,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Observers subscribe here; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn record_connect_failure(&self, error: &str) {
        let mut inner = self.lock();
        inner.retry_count += 1;
        inner.last_error = Some(error.to_string());
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn set_session(&self, session: SessionInfo) {
        self.lock().session = Some(session);
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.lock().session.clone()
    }

    /// Note remote activity so idle detection stays accurate.
    pub fn touch_activity(&self) {
        let now = self.clock.now_utc();
        self.lock().last_activity = now;
    }

    /// Pull-based idle check; callers decide when to ask and what to do.
    /// There is no background timer in here.
    pub fn is_idle_too_long(&self, max_idle: Duration) -> bool {
        let now = self.clock.now_utc();
        let inner = self.lock();
        inner.state == ConnectionState::Connected && now - inner.last_activity >= max_idle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn push_history(history: &mut VecDeque<StateTransition>, entry: StateTransition) {
    if history.len() == HISTORY_CAP {
        history.pop_front();
    }
    history.push_back(entry);
}
