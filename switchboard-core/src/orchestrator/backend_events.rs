//! Signals reported by backends
//!
//! Backends are untrusted. Signals for unknown calls, or signals that make
//! no sense for the call's direction, are logged and dropped rather than
//! failing anything.

use super::effects::Step;
use super::{CallOrchestrator, OrchestratorError};
use crate::accounts::PhoneAccountHandle;
use crate::types::{
    CallDirection, CallEvent, CallId, CallKind, CallState, Capabilities, DisconnectCause,
    Presentation, Properties, VerificationStatus, VideoState,
};
use serde::{Deserialize, Serialize};

/// A backend's report about one of its calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendEvent {
    /// Outgoing call started dialing
    SetDialing,
    /// Incoming call is ringing
    SetRinging,
    /// Call is active
    SetActive,
    /// Call is on hold
    SetOnHold,
    /// External call is being pulled
    SetPulling,
    /// Call audio is routed to a screening process
    SetAudioProcessing,
    /// Call rings after audio processing
    SetSimulatedRinging,
    /// Call ended
    SetDisconnected(DisconnectCause),
    /// Connection could not be established
    ConnectionFailed(DisconnectCause),
    /// A hold request failed
    HoldFailed,
    /// Capabilities changed
    SetCapabilities(Capabilities),
    /// Properties changed
    SetProperties(Properties),
    /// Video state changed
    SetVideoState(VideoState),
    /// Remote address changed
    SetAddress {
        /// New address
        address: Option<String>,
        /// Presentation of the address
        presentation: Presentation,
    },
    /// Caller display name changed
    SetCallerDisplayName {
        /// New name
        name: Option<String>,
        /// Presentation of the name
        presentation: Presentation,
    },
    /// Caller verification finished
    SetVerificationStatus(VerificationStatus),
    /// Call joined or left a conference
    SetConferenceParent(Option<CallId>),
    /// Backend-specific event for listeners
    ConnectionEvent {
        /// Event name
        event: String,
        /// Event payload
        extras: serde_json::Value,
    },
    /// Remote party asked to start real-time text
    RttRequested {
        /// Backend request identifier
        request_id: u32,
    },
}

/// A conference the backend assembled on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceCallRequest {
    /// Account hosting the conference
    pub account: PhoneAccountHandle,
    /// Calls already merged into it
    pub children: Vec<CallId>,
    /// Conference capabilities
    pub capabilities: Capabilities,
    /// Conference properties
    pub properties: Properties,
}

impl CallOrchestrator {
    /// Apply a backend signal to a call
    #[tracing::instrument(skip_all, fields(call_id = %call_id))]
    pub fn handle_backend_event(&self, call_id: CallId, event: BackendEvent) {
        let address_changed = self.run(|step| {
            if step.registry.get(call_id).is_none() {
                tracing::warn!(event = ?event, "Backend event for unknown call");
                return false;
            }
            step.apply_backend_event(call_id, event)
        });
        if address_changed {
            self.spawn_caller_info_lookup(call_id);
        }
    }

    /// Track a conference created by a backend
    ///
    /// # Errors
    ///
    /// `AccountNotFound` for an unregistered account.
    pub fn add_conference_call(
        &self,
        request: ConferenceCallRequest,
    ) -> Result<CallId, OrchestratorError> {
        let account = self
            .inner
            .accounts
            .get(&request.account)
            .ok_or_else(|| OrchestratorError::AccountNotFound(request.account.clone()))?;

        Ok(self.run(|step| {
            let call_id = step.registry.create(CallDirection::Undefined, step.clock);
            if let Some(call) = step.registry.get_mut(call_id) {
                call.set_kind(CallKind::ConferenceHost);
                call.set_target_account(Some(account.handle.clone()));
                call.set_self_managed(account.self_managed);
                call.set_capabilities(request.capabilities);
                call.set_properties(request.properties.with(Properties::CONFERENCE));
            }
            tracing::info!(call_id = %call_id, children = request.children.len(), "Backend conference added");
            step.announce_added(call_id);
            step.set_state(call_id, CallState::Active);
            for child in &request.children {
                step.set_conference_parent(*child, Some(call_id));
            }
            call_id
        }))
    }
}

impl Step<'_> {
    /// Returns `true` when the address changed and caller info must be
    /// looked up again
    fn apply_backend_event(&mut self, call_id: CallId, event: BackendEvent) -> bool {
        match event {
            BackendEvent::SetDialing => self.backend_state(call_id, CallState::Dialing),
            BackendEvent::SetPulling => self.backend_state(call_id, CallState::Pulling),
            BackendEvent::SetRinging => self.backend_state(call_id, CallState::Ringing),
            BackendEvent::SetActive => self.backend_state(call_id, CallState::Active),
            BackendEvent::SetOnHold => self.backend_state(call_id, CallState::OnHold),
            BackendEvent::SetAudioProcessing => {
                self.backend_state(call_id, CallState::AudioProcessing);
            }
            BackendEvent::SetSimulatedRinging => {
                self.backend_state(call_id, CallState::SimulatedRinging);
            }
            BackendEvent::SetDisconnected(cause) => {
                tracing::info!(call_id = %call_id, cause = ?cause.code, "Backend disconnected call");
                if let Ok(call) = self.call_mut(call_id) {
                    call.set_disconnect_cause(cause);
                }
                self.set_state(call_id, CallState::Disconnected);
            }
            BackendEvent::ConnectionFailed(cause) => {
                tracing::error!(call_id = %call_id, cause = ?cause, "Backend reported connection failure");
                self.fail_connection(call_id, cause);
            }
            BackendEvent::HoldFailed => {
                tracing::warn!(call_id = %call_id, "Hold failed");
                self.publish(CallEvent::HoldFailed { call_id });
            }
            BackendEvent::SetCapabilities(capabilities) => {
                if let Ok(call) = self.call_mut(call_id) {
                    call.set_capabilities(capabilities);
                }
                self.details_changed(call_id);
            }
            BackendEvent::SetProperties(properties) => {
                if let Ok(call) = self.call_mut(call_id) {
                    call.set_properties(properties);
                }
                self.details_changed(call_id);
            }
            BackendEvent::SetVideoState(video_state) => {
                if let Ok(call) = self.call_mut(call_id) {
                    call.set_video_state(video_state);
                }
                self.details_changed(call_id);
            }
            BackendEvent::SetAddress {
                address,
                presentation,
            } => {
                let changed = self
                    .call_mut(call_id)
                    .is_ok_and(|call| call.set_address(address, presentation));
                if changed {
                    self.details_changed(call_id);
                }
                return changed;
            }
            BackendEvent::SetCallerDisplayName { name, presentation } => {
                if let Ok(call) = self.call_mut(call_id) {
                    call.set_caller_display_name(name, presentation);
                }
                self.details_changed(call_id);
            }
            BackendEvent::SetVerificationStatus(status) => {
                if let Ok(call) = self.call_mut(call_id) {
                    call.set_verification_status(status);
                }
                self.details_changed(call_id);
            }
            BackendEvent::SetConferenceParent(parent) => {
                self.set_conference_parent(call_id, parent);
            }
            BackendEvent::ConnectionEvent { event, extras } => {
                self.publish(CallEvent::ConnectionEvent {
                    call_id,
                    event,
                    extras,
                });
            }
            BackendEvent::RttRequested { request_id } => {
                self.publish(CallEvent::RttRequested {
                    call_id,
                    request_id,
                });
            }
        }
        false
    }

    /// A state signal from the backend, dropped when it contradicts the
    /// call's direction or arrives after a local disconnect
    fn backend_state(&mut self, call_id: CallId, new_state: CallState) {
        let Ok(call) = self.call(call_id) else {
            return;
        };
        let direction = call.direction();
        let out_of_order = match new_state {
            CallState::Dialing | CallState::Pulling => direction == CallDirection::Incoming,
            CallState::Ringing => direction == CallDirection::Outgoing,
            _ => false,
        };
        if out_of_order {
            tracing::warn!(call_id = %call_id, direction = ?direction, new_state = %new_state, "Ignoring out-of-order backend signal");
            return;
        }
        if call.is_locally_disconnecting() {
            tracing::warn!(call_id = %call_id, new_state = %new_state, "Ignoring backend signal while disconnecting");
            return;
        }
        self.set_state(call_id, new_state);
    }

    fn set_conference_parent(&mut self, call_id: CallId, parent: Option<CallId>) {
        let old_parent = self.registry.get(call_id).and_then(|call| call.parent());
        if !self.registry.set_parent(call_id, parent) {
            tracing::warn!(call_id = %call_id, parent = ?parent, "Conference parent refused");
            return;
        }
        if old_parent == parent {
            return;
        }
        self.publish(CallEvent::ParentChanged { call_id, parent });
        for host in [old_parent, parent].into_iter().flatten() {
            self.details_changed(host);
        }
        self.details_changed(call_id);
    }
}
