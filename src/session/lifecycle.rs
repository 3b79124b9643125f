//! # Session Lifecycle
//!
//! The per-connection state machine as a pure function of (state, event).
//!
//! ## States:
//! 1. **Connecting**: accepted, background tasks not spawned yet
//! 2. **Active**: receiving audio and control messages
//! 3. **Draining**: shutdown signalled; the worker finishes queued audio and
//!    the sender flushes pending events
//! 4. **Closed**: every task joined or cancelled, removed from the registry,
//!    transport closed (terminal)
//!
//! `transition` never performs side effects; it returns the next state and the
//! effects the owning session must carry out.

use crate::session::events::SessionMeta;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    EndRequested,
    PeerDisconnected,
    TransportError,
    SendFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    TasksSpawned,
    Start(SessionMeta),
    End,
    PeerDisconnected,
    TransportError,
    SendFailed,
    /// Teardown finished joining tasks and closing the transport
    DrainComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    UpdateMetadata(SessionMeta),
    SignalShutdown(ShutdownReason),
}

pub fn transition(state: SessionState, event: LifecycleEvent) -> (SessionState, Vec<Effect>) {
    use LifecycleEvent as E;
    use SessionState as S;

    let shutdown_reason = match &event {
        E::End => Some(ShutdownReason::EndRequested),
        E::PeerDisconnected => Some(ShutdownReason::PeerDisconnected),
        E::TransportError => Some(ShutdownReason::TransportError),
        E::SendFailed => Some(ShutdownReason::SendFailed),
        _ => None,
    };

    match (state, event) {
        (S::Connecting, E::TasksSpawned) => (S::Active, vec![]),
        (S::Connecting | S::Active, E::Start(meta)) => (state, vec![Effect::UpdateMetadata(meta)]),
        (S::Connecting | S::Active, _) if shutdown_reason.is_some() => (
            S::Draining,
            shutdown_reason
                .map(Effect::SignalShutdown)
                .into_iter()
                .collect(),
        ),
        (S::Draining, E::DrainComplete) => (S::Closed, vec![]),
        // Everything else (late control messages, repeated disconnects) is ignored
        (state, _) => (state, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(meeting: &str) -> SessionMeta {
        SessionMeta {
            meeting_id: meeting.to_string(),
            speaker: "pat".to_string(),
        }
    }

    #[test]
    fn test_happy_path() {
        let (state, effects) = transition(SessionState::Connecting, LifecycleEvent::TasksSpawned);
        assert_eq!(state, SessionState::Active);
        assert!(effects.is_empty());

        let (state, effects) = transition(state, LifecycleEvent::Start(meta("m1")));
        assert_eq!(state, SessionState::Active);
        assert_eq!(effects, vec![Effect::UpdateMetadata(meta("m1"))]);

        let (state, effects) = transition(state, LifecycleEvent::End);
        assert_eq!(state, SessionState::Draining);
        assert_eq!(effects, vec![Effect::SignalShutdown(ShutdownReason::EndRequested)]);

        let (state, effects) = transition(state, LifecycleEvent::DrainComplete);
        assert_eq!(state, SessionState::Closed);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_every_termination_cause_drains() {
        for (event, reason) in [
            (LifecycleEvent::End, ShutdownReason::EndRequested),
            (LifecycleEvent::PeerDisconnected, ShutdownReason::PeerDisconnected),
            (LifecycleEvent::TransportError, ShutdownReason::TransportError),
            (LifecycleEvent::SendFailed, ShutdownReason::SendFailed),
        ] {
            let (state, effects) = transition(SessionState::Active, event);
            assert_eq!(state, SessionState::Draining);
            assert_eq!(effects, vec![Effect::SignalShutdown(reason)]);
        }
    }

    #[test]
    fn test_shutdown_signalled_once() {
        let (state, _) = transition(SessionState::Active, LifecycleEvent::End);
        let (state, effects) = transition(state, LifecycleEvent::PeerDisconnected);
        assert_eq!(state, SessionState::Draining);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_late_start_is_ignored() {
        let (state, effects) = transition(SessionState::Draining, LifecycleEvent::Start(meta("x")));
        assert_eq!(state, SessionState::Draining);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_closed_is_terminal() {
        for event in [
            LifecycleEvent::TasksSpawned,
            LifecycleEvent::End,
            LifecycleEvent::DrainComplete,
            LifecycleEvent::Start(meta("y")),
        ] {
            let (state, effects) = transition(SessionState::Closed, event);
            assert_eq!(state, SessionState::Closed);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn test_drain_complete_requires_draining() {
        let (state, _) = transition(SessionState::Active, LifecycleEvent::DrainComplete);
        assert_eq!(state, SessionState::Active);
    }
}
