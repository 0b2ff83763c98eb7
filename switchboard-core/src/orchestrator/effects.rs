//! The serialized mutation step and the effects it records

use super::OrchestratorError;
use crate::accounts::{PhoneAccountHandle, PhoneAccountRegistry};
use crate::admission::RoomAction;
use crate::audio::coordinator::CallAudioCoordinator;
use crate::backend::{BackendCommand, ConnectionRequest, ConnectionService};
use crate::call::{Call, StateTransition};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::handover::{self, HandoverEffect};
use crate::registry::CallRegistry;
use crate::types::{
    CallDirection, CallEvent, CallId, CallState, CallerInfo, DisconnectCause, DisconnectCode,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Work deferred until the state lock is released
pub(super) enum Effect {
    /// Deliver an event to listeners and subscribers
    Publish(CallEvent),
    /// Send a one-way command to a backend
    Backend {
        call_id: CallId,
        service: Arc<dyn ConnectionService>,
        command: BackendCommand,
    },
    /// Attempt the backend connection for a call in the background
    Connect(CallId),
    /// Tear down a pending-disconnect call once the grace period passes,
    /// unless `token` is cancelled first
    ScheduleTeardown {
        call_id: CallId,
        token: CancellationToken,
    },
}

/// A user prompt waiting for its answer
pub(super) enum PendingPrompt {
    AccountSelection(oneshot::Sender<PhoneAccountHandle>),
    DropOngoingCall(oneshot::Sender<bool>),
    Redirection(oneshot::Sender<bool>),
}

/// Unanswered prompts and parked pre-connection calls
#[derive(Default)]
pub(super) struct Pending {
    pub(super) prompts: HashMap<CallId, PendingPrompt>,
    /// Calls ended before reaching a backend, kept briefly for redial reuse
    pub(super) disconnects: HashSet<CallId>,
}

impl PendingPrompt {
    fn kind(&self) -> &'static str {
        match self {
            Self::AccountSelection(_) => "account selection",
            Self::DropOngoingCall(_) => "drop confirmation",
            Self::Redirection(_) => "redirection confirmation",
        }
    }
}

/// Mutable view of the orchestrator state for one critical section
pub(super) struct Step<'a> {
    pub(super) registry: &'a mut CallRegistry,
    pub(super) coordinator: &'a mut CallAudioCoordinator,
    pub(super) accounts: &'a PhoneAccountRegistry,
    pub(super) clock: &'a dyn Clock,
    pub(super) config: &'a OrchestratorConfig,
    pub(super) pending: &'a mut Pending,
    effects: Vec<Effect>,
}

impl<'a> Step<'a> {
    pub(super) fn new(
        registry: &'a mut CallRegistry,
        coordinator: &'a mut CallAudioCoordinator,
        pending: &'a mut Pending,
        accounts: &'a PhoneAccountRegistry,
        clock: &'a dyn Clock,
        config: &'a OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            coordinator,
            accounts,
            clock,
            config,
            pending,
            effects: Vec::new(),
        }
    }

    pub(super) fn into_effects(self) -> Vec<Effect> {
        self.effects
    }

    pub(super) fn call(&self, call_id: CallId) -> Result<&Call, OrchestratorError> {
        self.registry
            .get(call_id)
            .ok_or(OrchestratorError::CallNotFound(call_id))
    }

    pub(super) fn call_mut(&mut self, call_id: CallId) -> Result<&mut Call, OrchestratorError> {
        self.registry
            .get_mut(call_id)
            .ok_or(OrchestratorError::CallNotFound(call_id))
    }

    /// The call, if it is in one of `states`
    pub(super) fn call_in(
        &self,
        call_id: CallId,
        states: &[CallState],
    ) -> Result<&Call, OrchestratorError> {
        let call = self.call(call_id)?;
        if states.contains(&call.state()) {
            Ok(call)
        } else {
            Err(OrchestratorError::InvalidState {
                call_id,
                state: call.state(),
            })
        }
    }

    pub(super) fn publish(&mut self, event: CallEvent) {
        self.effects.push(Effect::Publish(event));
    }

    pub(super) fn announce_added(&mut self, call_id: CallId) {
        if let Some(call) = self.registry.snapshot(call_id, self.clock) {
            tracing::info!(call_id = %call_id, direction = ?call.direction, "Call added");
            self.publish(CallEvent::CallAdded { call });
        }
    }

    pub(super) fn details_changed(&mut self, call_id: CallId) {
        if let Some(call) = self.registry.snapshot(call_id, self.clock) {
            self.publish(CallEvent::CallDetailsChanged { call });
        }
    }

    /// Queue a one-way command for the backend owning `call_id`
    pub(super) fn command(&mut self, call_id: CallId, command: BackendCommand) {
        let service = self
            .registry
            .get(call_id)
            .and_then(Call::delegate_account)
            .and_then(|account| self.accounts.service_for(account));
        match service {
            Some(service) => self.effects.push(Effect::Backend {
                call_id,
                service,
                command,
            }),
            None => {
                tracing::warn!(call_id = %call_id, command = ?command, "No backend for call, dropping command");
            }
        }
    }

    /// Commit a state change and everything that follows from it
    ///
    /// Returns `None` for an unknown call.
    pub(super) fn set_state(
        &mut self,
        call_id: CallId,
        new_state: CallState,
    ) -> Option<StateTransition> {
        let transition = self.registry.set_state(call_id, new_state, self.clock)?;
        match transition {
            StateTransition::Changed { old } => {
                self.publish(CallEvent::CallStateChanged {
                    call_id,
                    old_state: old,
                    new_state,
                });
                for effect in handover::on_state_changed(self.registry, call_id, new_state) {
                    self.apply_handover_effect(effect);
                }
                if new_state.is_terminal() {
                    self.remove(call_id);
                }
            }
            StateTransition::DeferredToFallback => self.continue_with_next_candidate(call_id),
            StateTransition::Unchanged | StateTransition::RejectedRedundant => {}
        }
        Some(transition)
    }

    fn continue_with_next_candidate(&mut self, call_id: CallId) {
        let next = self
            .registry
            .get_mut(call_id)
            .and_then(Call::advance_to_next_candidate);
        let Some(next) = next else {
            return;
        };
        tracing::info!(call_id = %call_id, account = %next, "Trying next backend candidate");
        self.set_state(call_id, CallState::Connecting);
        self.details_changed(call_id);
        self.effects.push(Effect::Connect(call_id));
    }

    fn apply_handover_effect(&mut self, effect: HandoverEffect) {
        match effect {
            HandoverEffect::DisconnectSource(source) => {
                self.command(source, BackendCommand::Disconnect);
            }
            HandoverEffect::DisconnectDestination(destination) => {
                self.request_disconnect(destination, None);
            }
            HandoverEffect::NotifySource { source, event } => {
                self.command(
                    source,
                    BackendCommand::SendEvent {
                        event: event.to_string(),
                        extras: serde_json::Value::Null,
                    },
                );
            }
            HandoverEffect::Failed { source, reason } => {
                self.publish(CallEvent::HandoverFailed {
                    call_id: source,
                    reason,
                });
            }
            HandoverEffect::Completed {
                source,
                destination,
            } => {
                self.publish(CallEvent::HandoverComplete {
                    source,
                    destination,
                });
            }
        }
    }

    fn remove(&mut self, call_id: CallId) {
        let snapshot = self.registry.snapshot(call_id, self.clock);
        self.pending.prompts.remove(&call_id);
        self.pending.disconnects.remove(&call_id);
        if self.registry.remove(call_id).is_none() {
            return;
        }
        if let Some(call) = snapshot {
            tracing::info!(
                call_id = %call_id,
                cause = ?call.disconnect_cause.code,
                age_ms = call.age_millis,
                "Call removed"
            );
            self.publish(CallEvent::CallRemoved { call });
        }
    }

    /// End a call that has no backend connection yet
    pub(super) fn disconnect_locally(&mut self, call_id: CallId, cause: DisconnectCause) {
        let Some(call) = self.registry.get_mut(call_id) else {
            return;
        };
        call.set_connection_candidates(Vec::new());
        call.set_disconnect_cause(cause);
        self.set_state(call_id, CallState::Disconnected);
    }

    /// Ask for a call to end, through its backend when it has one
    ///
    /// `cause` overrides whatever cause the backend reports later.
    pub(super) fn request_disconnect(&mut self, call_id: CallId, cause: Option<DisconnectCause>) {
        let Some(call) = self.registry.get_mut(call_id) else {
            return;
        };
        if !call.is_alive() || call.is_locally_disconnecting() {
            return;
        }
        if cause.is_some() {
            call.set_override_disconnect_cause(cause);
        }
        let state = call.state();
        tracing::debug!(call_id = %call_id, state = %state, "Disconnect requested");

        match state {
            CallState::New | CallState::SelectPhoneAccount => {
                self.disconnect_locally(call_id, DisconnectCause::new(DisconnectCode::Local));
            }
            CallState::Connecting => {
                self.command(call_id, BackendCommand::Abort);
                self.disconnect_locally(call_id, DisconnectCause::new(DisconnectCode::Local));
            }
            CallState::Ringing | CallState::SimulatedRinging => {
                call.set_locally_disconnecting(true);
                self.command(call_id, BackendCommand::Reject(None));
                self.set_state(call_id, CallState::Disconnecting);
            }
            _ => {
                call.set_locally_disconnecting(true);
                self.command(call_id, BackendCommand::Disconnect);
                self.set_state(call_id, CallState::Disconnecting);
            }
        }
    }

    /// Carry out the holds and disconnects admission control asked for
    pub(super) fn apply_room_actions(&mut self, actions: &[RoomAction]) {
        for action in actions {
            match action {
                RoomAction::Hold(call_id) => {
                    tracing::info!(call_id = %call_id, "Holding call to make room");
                    self.command(*call_id, BackendCommand::Hold);
                }
                RoomAction::Disconnect { call_id, cause } => {
                    tracing::info!(call_id = %call_id, "Disconnecting call to make room");
                    self.request_disconnect(*call_id, cause.clone());
                }
                RoomAction::Reject { call_id, cause } => {
                    tracing::info!(call_id = %call_id, cause = ?cause.code, "Rejecting ringing call to make room");
                    if let Some(call) = self.registry.get_mut(*call_id) {
                        call.set_override_disconnect_cause(Some(cause.clone()));
                        call.set_locally_disconnecting(true);
                    }
                    self.command(*call_id, BackendCommand::Reject(None));
                    self.set_state(*call_id, CallState::Disconnecting);
                }
            }
        }
    }

    /// Build the connection request for `call_id`
    ///
    /// A missing backend counts as a failed attempt.
    pub(super) fn prepare_connection(
        &mut self,
        call_id: CallId,
    ) -> Option<(Arc<dyn ConnectionService>, ConnectionRequest, CancellationToken)> {
        let call = self.registry.get(call_id).filter(|call| call.is_alive())?;
        let Some(account) = call.target_account().cloned() else {
            tracing::warn!(call_id = %call_id, "No account to connect on");
            self.disconnect_locally(
                call_id,
                DisconnectCause::with_reason(DisconnectCode::Error, "no account selected"),
            );
            return None;
        };
        let request = ConnectionRequest {
            call_id,
            account: account.clone(),
            address: call.address().map(str::to_string),
            video_state: call.video_state(),
            is_incoming: call.direction() == CallDirection::Incoming,
            is_emergency: call.is_emergency(),
            handover_from: call.handover_source(),
        };
        let token = call.cancel_token();

        match self.accounts.service_for(&account) {
            Some(service) => Some((service, request, token)),
            None => {
                tracing::error!(call_id = %call_id, account = %account, "No backend bound to account");
                self.fail_connection(
                    call_id,
                    DisconnectCause::with_reason(DisconnectCode::Error, "backend unavailable"),
                );
                None
            }
        }
    }

    /// Record a failed connection attempt; emergency calls move on to the
    /// next candidate
    pub(super) fn fail_connection(&mut self, call_id: CallId, cause: DisconnectCause) {
        let Some(call) = self.registry.get_mut(call_id) else {
            return;
        };
        call.set_disconnect_cause(cause);
        self.set_state(call_id, CallState::Disconnected);
    }

    /// Finish a pending-disconnect call whose grace period ran out
    pub(super) fn teardown_pending(&mut self, call_id: CallId) {
        if self.pending.disconnects.remove(&call_id) {
            tracing::debug!(call_id = %call_id, "Tearing down pending-disconnect call");
            self.set_state(call_id, CallState::Disconnected);
        }
    }

    /// Park a pre-connection call in `Disconnecting` so a quick redial of the
    /// same address can reuse it
    pub(super) fn begin_pending_disconnect(&mut self, call_id: CallId) {
        let Some(call) = self.registry.get_mut(call_id) else {
            return;
        };
        call.reset_cancellation();
        call.set_locally_disconnecting(true);
        call.set_disconnect_cause(DisconnectCause::new(DisconnectCode::Local));
        let token = call.cancel_token();
        self.pending.prompts.remove(&call_id);
        self.pending.disconnects.insert(call_id);
        self.set_state(call_id, CallState::Disconnecting);
        self.effects
            .push(Effect::ScheduleTeardown { call_id, token });
    }

    pub(super) fn schedule_connect(&mut self, call_id: CallId) {
        self.effects.push(Effect::Connect(call_id));
    }

    pub(super) fn register_prompt(&mut self, call_id: CallId, prompt: PendingPrompt) {
        if let Some(previous) = self.pending.prompts.insert(call_id, prompt) {
            tracing::warn!(call_id = %call_id, prompt = previous.kind(), "Replacing unanswered prompt");
        }
    }

    pub(super) fn take_prompt(&mut self, call_id: CallId) -> Option<PendingPrompt> {
        self.pending.prompts.remove(&call_id)
    }

    /// Put back a prompt taken by a response of the wrong kind
    pub(super) fn restore_prompt(&mut self, call_id: CallId, prompt: PendingPrompt) {
        tracing::debug!(call_id = %call_id, waiting_for = prompt.kind(), "Ignoring response to a different prompt");
        self.pending.prompts.insert(call_id, prompt);
    }

    /// Store looked-up caller information unless a newer lookup superseded it
    pub(super) fn complete_caller_info(&mut self, call_id: CallId, token: Uuid, info: CallerInfo) {
        let accepted = self
            .registry
            .get_mut(call_id)
            .is_some_and(|call| call.complete_caller_info_lookup(token, info.clone()));
        if accepted {
            self.publish(CallEvent::CallerInfoUpdated { call_id, info });
        } else {
            tracing::debug!(call_id = %call_id, "Discarding stale caller info");
        }
    }
}
