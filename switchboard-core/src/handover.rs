//! Handover of a call between two backends
//!
//! A handover pairs a source call with a newly created destination call:
//!
//! ```text
//!   source: None ─► FromStarted ─► Accepted ─► Complete
//!   dest:   None ─► ToStarted   ─► Accepted ─► Complete
//!                        │
//!                        └──► Failed (both)
//! ```
//!
//! The pair always moves together; no function here leaves the two calls
//! in different handover states.

use crate::accounts::{PhoneAccountHandle, PhoneAccountRegistry};
use crate::registry::CallRegistry;
use crate::types::{CallId, CallState, HandoverFailureReason, HandoverState};

/// Event name sent to the source backend when the handover completes
pub const EVENT_HANDOVER_COMPLETE: &str = "switchboard.event.HANDOVER_COMPLETE";

/// Event name sent to the source backend when the handover fails
pub const EVENT_HANDOVER_FAILED: &str = "switchboard.event.HANDOVER_FAILED";

/// Follow-up work produced by a handover transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoverEffect {
    /// Ask the source's backend to disconnect the source call
    DisconnectSource(CallId),
    /// Disconnect the destination call
    DisconnectDestination(CallId),
    /// Deliver an event to the source call's backend
    NotifySource {
        /// Source call
        source: CallId,
        /// Event name
        event: &'static str,
    },
    /// Announce a failed handover
    Failed {
        /// Source call
        source: CallId,
        /// Why it failed
        reason: HandoverFailureReason,
    },
    /// Announce a completed handover
    Completed {
        /// Source call
        source: CallId,
        /// Destination call
        destination: CallId,
    },
}

/// Check whether `source` may be handed over to `destination_account`
///
/// # Errors
///
/// Returns the reason the request must be refused.
pub fn validate_request(
    registry: &CallRegistry,
    accounts: &PhoneAccountRegistry,
    source: CallId,
    destination_account: &PhoneAccountHandle,
) -> Result<(), HandoverFailureReason> {
    let call = registry
        .get(source)
        .filter(|call| call.is_alive())
        .ok_or(HandoverFailureReason::Unknown)?;

    if registry.is_in_emergency_call() {
        return Err(HandoverFailureReason::OngoingEmergencyCall);
    }
    if call.handover_state().is_in_progress()
        || call.handover_source().is_some()
        || call.handover_destination().is_some()
    {
        return Err(HandoverFailureReason::Unknown);
    }

    let from_supported = call
        .target_account()
        .and_then(|handle| accounts.get(handle))
        .is_some_and(|account| account.supports_handover_from);
    let to_supported = accounts
        .get(destination_account)
        .is_some_and(|account| account.supports_handover_to && account.enabled);
    if !from_supported || !to_supported {
        return Err(HandoverFailureReason::NotSupported);
    }
    Ok(())
}

/// Link `source` and `destination` and mark the handover started
///
/// Returns `false`, changing nothing, if either call is unknown.
pub fn begin(registry: &mut CallRegistry, source: CallId, destination: CallId) -> bool {
    if !registry.contains(source) || !registry.contains(destination) {
        return false;
    }
    let linked = registry
        .get_mut(source)
        .is_some_and(|call| call.set_handover_destination(Some(destination)))
        && registry
            .get_mut(destination)
            .is_some_and(|call| call.set_handover_source(Some(source)));
    if !linked {
        unlink(registry, source, destination);
        return false;
    }
    set_pair_state(
        registry,
        source,
        destination,
        HandoverState::FromStarted,
        HandoverState::ToStarted,
    );
    tracing::info!(source = %source, destination = %destination, "Handover started");
    true
}

fn set_pair_state(
    registry: &mut CallRegistry,
    source: CallId,
    destination: CallId,
    source_state: HandoverState,
    destination_state: HandoverState,
) {
    if let Some(call) = registry.get_mut(source) {
        call.set_handover_state(source_state);
    }
    if let Some(call) = registry.get_mut(destination) {
        call.set_handover_state(destination_state);
    }
}

fn unlink(registry: &mut CallRegistry, source: CallId, destination: CallId) {
    if let Some(call) = registry.get_mut(source) {
        call.set_handover_destination(None);
    }
    if let Some(call) = registry.get_mut(destination) {
        call.set_handover_source(None);
    }
}

/// Fail a handover that has not completed
pub fn fail(
    registry: &mut CallRegistry,
    source: CallId,
    destination: CallId,
    reason: HandoverFailureReason,
) -> Vec<HandoverEffect> {
    tracing::warn!(source = %source, destination = %destination, reason = ?reason, "Handover failed");
    set_pair_state(
        registry,
        source,
        destination,
        HandoverState::Failed,
        HandoverState::Failed,
    );
    unlink(registry, source, destination);
    vec![
        HandoverEffect::NotifySource {
            source,
            event: EVENT_HANDOVER_FAILED,
        },
        HandoverEffect::Failed { source, reason },
    ]
}

/// React to a committed state change of `call_id`
pub fn on_state_changed(
    registry: &mut CallRegistry,
    call_id: CallId,
    new_state: CallState,
) -> Vec<HandoverEffect> {
    let Some(call) = registry.get(call_id) else {
        return Vec::new();
    };
    let handover_state = call.handover_state();
    let source_link = call.handover_source();
    let destination_link = call.handover_destination();

    if let Some(source) = source_link {
        return match (new_state, handover_state) {
            (CallState::Active, HandoverState::ToStarted) => {
                tracing::info!(source = %source, destination = %call_id, "Handover accepted");
                set_pair_state(
                    registry,
                    source,
                    call_id,
                    HandoverState::Accepted,
                    HandoverState::Accepted,
                );
                vec![
                    HandoverEffect::NotifySource {
                        source,
                        event: EVENT_HANDOVER_COMPLETE,
                    },
                    HandoverEffect::DisconnectSource(source),
                ]
            }
            (state, HandoverState::ToStarted) if state.is_terminal() => fail(
                registry,
                source,
                call_id,
                HandoverFailureReason::DestinationRejected,
            ),
            _ => Vec::new(),
        };
    }

    if let Some(destination) = destination_link {
        if !new_state.is_terminal() {
            return Vec::new();
        }
        return match handover_state {
            HandoverState::Accepted => {
                tracing::info!(source = %call_id, destination = %destination, "Handover complete");
                set_pair_state(
                    registry,
                    call_id,
                    destination,
                    HandoverState::Complete,
                    HandoverState::Complete,
                );
                unlink(registry, call_id, destination);
                vec![HandoverEffect::Completed {
                    source: call_id,
                    destination,
                }]
            }
            HandoverState::FromStarted => {
                let mut effects = fail(
                    registry,
                    call_id,
                    destination,
                    HandoverFailureReason::SourceDisconnected,
                );
                effects.retain(|effect| !matches!(effect, HandoverEffect::NotifySource { .. }));
                effects.insert(0, HandoverEffect::DisconnectDestination(destination));
                effects
            }
            _ => Vec::new(),
        };
    }

    Vec::new()
}
