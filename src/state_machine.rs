//! State machine for a live call
//!
//! This module implements the call lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.

use std::time::Instant;
use uuid::Uuid;

use crate::call::CallError;

/// Lifecycle of one call.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    Idle,
    Connecting {
        call_id: Uuid,
    },
    Active {
        call_id: Uuid,
        started_at: Instant,
    },
    Ending {
        call_id: Uuid,
    },
    /// Terminal. `call_id` is `None` when the call never started.
    Ended {
        call_id: Option<Uuid>,
    },
    /// Terminal. Teardown may still be running.
    Failed {
        call_id: Uuid,
        error: CallError,
    },
}

impl Default for CallState {
    fn default() -> Self {
        CallState::Idle
    }
}

impl CallState {
    /// Id of the call this state belongs to
    pub fn call_id(&self) -> Option<Uuid> {
        match self {
            CallState::Idle => None,
            CallState::Connecting { call_id }
            | CallState::Active { call_id, .. }
            | CallState::Ending { call_id }
            | CallState::Failed { call_id, .. } => Some(*call_id),
            CallState::Ended { call_id } => *call_id,
        }
    }

    /// Ended or Failed: the session cannot be reused.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended { .. } | CallState::Failed { .. })
    }
}

/// Events that can trigger state transitions.
/// These are sent from the UI (start/hang up), the setup routine and the
/// transport reader.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// UI asked to start the call
    Start,
    /// UI asked to end the call
    HangUp,

    // Setup events
    ResourcesReady {
        id: Uuid,
    },
    SetupFailed {
        id: Uuid,
        error: CallError,
    },

    // Transport events
    TransportError {
        id: Uuid,
        error: CallError,
    },
    RemoteClosed {
        id: Uuid,
        reason: Option<String>,
    },

    // Teardown
    TeardownComplete {
        id: Uuid,
    },
}

/// Effects to be executed after a state transition.
/// The session's effect loop runs these in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire contexts, microphone and transport
    Acquire { id: Uuid },
    /// Open the outbound slot so captured frames reach the transport
    ArmInput { id: Uuid },
    /// Release every acquired resource in reverse order
    Teardown { id: Uuid },
    /// Signal to publish a new snapshot to the UI
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale call IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &CallState, event: CallEvent) -> (CallState, Vec<Effect>) {
    use CallEvent::*;
    use CallState::*;
    use Effect::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Start) => {
            let id = Uuid::new_v4();
            (Connecting { call_id: id }, vec![Acquire { id }, EmitUi])
        }
        // Hang up before start: nothing to release
        (Idle, HangUp) => (Ended { call_id: None }, vec![EmitUi]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { call_id }, ResourcesReady { id }) if *call_id == id => (
            Active {
                call_id: id,
                started_at: Instant::now(),
            },
            vec![ArmInput { id }, EmitUi],
        ),
        (Connecting { call_id }, SetupFailed { id, error }) if *call_id == id => {
            (Failed { call_id: id, error }, vec![Teardown { id }, EmitUi])
        }
        // A transport failure can race the setup result
        (Connecting { call_id }, TransportError { id, error }) if *call_id == id => {
            (Failed { call_id: id, error }, vec![Teardown { id }, EmitUi])
        }
        (Connecting { call_id }, HangUp) => (
            Ending { call_id: *call_id },
            vec![Teardown { id: *call_id }, EmitUi],
        ),

        // -----------------
        // Active
        // -----------------
        (Active { call_id, .. }, TransportError { id, error }) if *call_id == id => {
            (Failed { call_id: id, error }, vec![Teardown { id }, EmitUi])
        }
        (Active { call_id, started_at }, RemoteClosed { id, reason }) if *call_id == id => {
            log::info!(
                "Call {} closed by remote after {:?} ({})",
                call_id,
                started_at.elapsed(),
                reason.as_deref().unwrap_or("no reason")
            );
            (Ending { call_id: id }, vec![Teardown { id }, EmitUi])
        }
        (Active { call_id, started_at }, HangUp) => {
            log::info!("Call {} hung up after {:?}", call_id, started_at.elapsed());
            (
                Ending { call_id: *call_id },
                vec![Teardown { id: *call_id }, EmitUi],
            )
        }

        // -----------------
        // Ending
        // -----------------
        (Ending { call_id }, TeardownComplete { id }) if *call_id == id => (
            Ended {
                call_id: Some(*call_id),
            },
            vec![EmitUi],
        ),

        // -----------------
        // Unhandled (terminal states, stale ids, late setup results):
        // no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(id: Uuid) -> CallState {
        CallState::Active {
            call_id: id,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn idle_start_transitions_to_connecting() {
        let (next, effects) = reduce(&CallState::Idle, CallEvent::Start);
        let id = match next {
            CallState::Connecting { call_id } => call_id,
            other => panic!("expected Connecting, got {:?}", other),
        };
        assert_eq!(effects, vec![Effect::Acquire { id }, Effect::EmitUi]);
    }

    #[test]
    fn connecting_resources_ready_transitions_to_active() {
        let id = Uuid::new_v4();
        let state = CallState::Connecting { call_id: id };
        let (next, effects) = reduce(&state, CallEvent::ResourcesReady { id });

        assert!(matches!(next, CallState::Active { call_id, .. } if call_id == id));
        assert_eq!(effects, vec![Effect::ArmInput { id }, Effect::EmitUi]);
    }

    #[test]
    fn setup_failure_fails_and_tears_down() {
        let id = Uuid::new_v4();
        let state = CallState::Connecting { call_id: id };
        let error = CallError::DeviceAccessDenied("refused".to_string());
        let (next, effects) = reduce(
            &state,
            CallEvent::SetupFailed {
                id,
                error: error.clone(),
            },
        );

        assert_eq!(next, CallState::Failed { call_id: id, error });
        assert_eq!(effects, vec![Effect::Teardown { id }, Effect::EmitUi]);
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        let state = CallState::Connecting { call_id: id };
        let (next, effects) = reduce(&state, CallEvent::ResourcesReady { id: stale_id });

        // Should stay in Connecting, no effects
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_transport_error_does_not_fail_active_call() {
        let id = Uuid::new_v4();
        let state = active(id);
        let (next, effects) = reduce(
            &state,
            CallEvent::TransportError {
                id: Uuid::new_v4(),
                error: CallError::TransportRuntimeError("old".to_string()),
            },
        );

        assert!(matches!(next, CallState::Active { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn hang_up_during_connecting_tears_down() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&CallState::Connecting { call_id: id }, CallEvent::HangUp);

        assert_eq!(next, CallState::Ending { call_id: id });
        assert!(effects.contains(&Effect::Teardown { id }));
    }

    #[test]
    fn setup_result_after_hang_up_is_ignored() {
        let id = Uuid::new_v4();
        let state = CallState::Ending { call_id: id };
        let (next, effects) = reduce(&state, CallEvent::ResourcesReady { id });

        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn active_hang_up_ends_after_teardown() {
        let id = Uuid::new_v4();
        let (ending, effects) = reduce(&active(id), CallEvent::HangUp);
        assert_eq!(ending, CallState::Ending { call_id: id });
        assert!(effects.contains(&Effect::Teardown { id }));

        let (ended, effects) = reduce(&ending, CallEvent::TeardownComplete { id });
        assert_eq!(ended, CallState::Ended { call_id: Some(id) });
        assert_eq!(effects, vec![Effect::EmitUi]);
    }

    #[test]
    fn active_transport_error_fails() {
        let id = Uuid::new_v4();
        let error = CallError::TransportRuntimeError("reset".to_string());
        let (next, effects) = reduce(
            &active(id),
            CallEvent::TransportError {
                id,
                error: error.clone(),
            },
        );

        assert_eq!(next, CallState::Failed { call_id: id, error });
        assert!(effects.contains(&Effect::Teardown { id }));
    }

    #[test]
    fn remote_close_ends_call() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &active(id),
            CallEvent::RemoteClosed {
                id,
                reason: Some("bye".to_string()),
            },
        );

        assert_eq!(next, CallState::Ending { call_id: id });
        assert!(effects.contains(&Effect::Teardown { id }));
    }

    // =========================================================================
    // Terminal state tests
    // =========================================================================

    #[test]
    fn hang_up_before_start_ends_without_teardown() {
        let (next, effects) = reduce(&CallState::Idle, CallEvent::HangUp);

        assert_eq!(next, CallState::Ended { call_id: None });
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::Teardown { .. })));
    }

    #[test]
    fn terminal_states_ignore_everything() {
        let id = Uuid::new_v4();
        let terminals = [
            CallState::Ended { call_id: Some(id) },
            CallState::Failed {
                call_id: id,
                error: CallError::MissingApiKey,
            },
        ];

        for state in terminals {
            for event in [
                CallEvent::Start,
                CallEvent::HangUp,
                CallEvent::TeardownComplete { id },
            ] {
                let (next, effects) = reduce(&state, event);
                assert_eq!(next, state);
                assert!(effects.is_empty());
            }
        }
    }

    #[test]
    fn failed_keeps_its_error_through_teardown_complete() {
        let id = Uuid::new_v4();
        let state = CallState::Failed {
            call_id: id,
            error: CallError::TransportOpenFailed("401".to_string()),
        };
        let (next, _) = reduce(&state, CallEvent::TeardownComplete { id });

        assert_eq!(next, state);
        assert!(next.is_terminal());
    }
}
