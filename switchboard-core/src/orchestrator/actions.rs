//! User actions on tracked calls
//!
//! Every action validates the call's state and capabilities, records the
//! backend command and returns. Outcomes arrive later as backend events.

use super::effects::{PendingPrompt, Step};
use super::{until_cancelled, CallOrchestrator, OrchestratorError};
use crate::accounts::PhoneAccountHandle;
use crate::admission::{Admission, RoomDecision};
use crate::audio::focus::FocusMessage;
use crate::backend::{BackendCommand, ConferenceRequest};
use crate::handover;
use crate::types::{
    CallDirection, CallEvent, CallId, CallKind, CallState, Capabilities, DisconnectCause,
    DisconnectCode, Presentation, Properties, VideoState,
};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

const RINGING: &[CallState] = &[CallState::Ringing, CallState::SimulatedRinging];
const CONNECTED: &[CallState] = &[CallState::Active, CallState::OnHold];

impl CallOrchestrator {
    /// Answer a ringing call
    ///
    /// Makes room first: the foreground call is held, or disconnected when
    /// it belongs to another backend and cannot be held.
    ///
    /// # Errors
    ///
    /// `CallNotFound`, `InvalidState` unless ringing, or `PolicyRejected`
    /// when room cannot be made.
    pub fn answer_call(&self, call_id: CallId, video_state: VideoState) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let call = step.call_in(call_id, RINGING)?;
            let simulated = call.state() == CallState::SimulatedRinging;
            let decision =
                Admission::new(step.registry, step.accounts, &step.config.admission).make_room_for_answer(call);
            match decision {
                RoomDecision::Blocked { reason, .. } => {
                    tracing::warn!(call_id = %call_id, reason, "Cannot answer call");
                    return Err(OrchestratorError::PolicyRejected(reason.to_string()));
                }
                RoomDecision::Proceed { actions } => step.apply_room_actions(&actions),
            }

            tracing::info!(call_id = %call_id, "Answering call");
            step.call_mut(call_id)?.set_video_state(video_state);
            if simulated {
                step.set_state(call_id, CallState::Active);
            } else {
                step.command(call_id, BackendCommand::Answer(video_state));
                step.set_state(call_id, CallState::Answered);
            }
            Ok(())
        })
    }

    /// Reject a ringing call, optionally with a text reply
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `InvalidState` unless ringing.
    pub fn reject_call(&self, call_id: CallId, message: Option<String>) -> Result<(), OrchestratorError> {
        self.run(|step| {
            step.call_in(call_id, RINGING)?;
            tracing::info!(call_id = %call_id, "Rejecting call");
            let call = step.call_mut(call_id)?;
            call.set_override_disconnect_cause(Some(DisconnectCause::new(DisconnectCode::Rejected)));
            call.set_locally_disconnecting(true);
            step.command(call_id, BackendCommand::Reject(message));
            step.set_state(call_id, CallState::Disconnecting);
            Ok(())
        })
    }

    /// End a call
    ///
    /// An outgoing call that has not reached a backend yet is parked for a
    /// short grace period so an immediate redial of the same address can
    /// reuse it.
    ///
    /// # Errors
    ///
    /// `CallNotFound` for an unknown call.
    pub fn disconnect_call(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let call = step.call(call_id)?;
            if call.is_locally_disconnecting() {
                tracing::debug!(call_id = %call_id, "Disconnect already in progress");
                return Ok(());
            }
            tracing::info!(call_id = %call_id, state = %call.state(), "Disconnecting call");
            if call.direction() == CallDirection::Outgoing && call.state().is_pre_connection() {
                step.begin_pending_disconnect(call_id);
            } else {
                step.request_disconnect(call_id, None);
            }
            Ok(())
        })
    }

    /// Put an active call on hold
    ///
    /// # Errors
    ///
    /// `CallNotFound`, `InvalidState` unless active, or `PolicyRejected`
    /// when the backend cannot hold it.
    pub fn hold_call(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let call = step.call_in(call_id, &[CallState::Active])?;
            if !call.can_hold() {
                return Err(OrchestratorError::PolicyRejected("call cannot be held".to_string()));
            }
            step.command(call_id, BackendCommand::Hold);
            Ok(())
        })
    }

    /// Resume a held call
    ///
    /// Any other live call is held first, or disconnected when it cannot be
    /// held and belongs to another backend.
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `InvalidState` unless on hold.
    pub fn unhold_call(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let call = step.call_in(call_id, &[CallState::OnHold])?;
            let package = call.delegate_account().map(|a| a.package.clone());
            let foreground = step.registry.first_live_call(call_id).map(|other| {
                let same_backend = other.delegate_account().map(|a| &a.package) == package.as_ref();
                (other.id(), other.can_hold() || (same_backend && other.supports_hold()), same_backend)
            });

            match foreground {
                Some((other, true, _)) => {
                    tracing::debug!(call_id = %call_id, holding = %other, "Holding foreground call before unhold");
                    step.command(other, BackendCommand::Hold);
                }
                Some((other, false, false)) => {
                    tracing::info!(call_id = %call_id, dropping = %other, "Disconnecting un-holdable foreground call");
                    step.request_disconnect(other, None);
                }
                Some((_, false, true)) | None => {}
            }
            step.command(call_id, BackendCommand::Unhold);
            Ok(())
        })
    }

    /// Merge `call_id` with `other` into a conference
    ///
    /// # Errors
    ///
    /// `CallNotFound`, `InvalidState` unless both calls are connected, or
    /// `PolicyRejected` when either is already a conference leg.
    pub fn conference(&self, call_id: CallId, other: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let first = step.call_in(call_id, CONNECTED)?;
            let second = step.call_in(other, CONNECTED)?;
            if call_id == other || first.parent().is_some() || second.parent().is_some() {
                return Err(OrchestratorError::PolicyRejected(
                    "calls cannot be conferenced".to_string(),
                ));
            }
            step.command(call_id, BackendCommand::Conference(other));
            Ok(())
        })
    }

    /// Split a leg out of its conference
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `PolicyRejected` unless the call is a conference
    /// leg that may be separated.
    pub fn split_from_conference(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let call = step.call(call_id)?;
            if call.parent().is_none() {
                return Err(OrchestratorError::PolicyRejected("call is not in a conference".to_string()));
            }
            require(call.capabilities(), Capabilities::SEPARATE_FROM_CONFERENCE, "split")?;
            step.command(call_id, BackendCommand::SplitFromConference);
            Ok(())
        })
    }

    /// Merge the legs of a conference
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `PolicyRejected` without merge support.
    pub fn merge_conference(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            require(step.call(call_id)?.capabilities(), Capabilities::MERGE_CONFERENCE, "merge")?;
            step.command(call_id, BackendCommand::MergeConference);
            Ok(())
        })
    }

    /// Swap the active leg of a conference
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `PolicyRejected` without swap support.
    pub fn swap_conference(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            require(step.call(call_id)?.capabilities(), Capabilities::SWAP_CONFERENCE, "swap")?;
            step.command(call_id, BackendCommand::SwapConference);
            let active_child = step.call_mut(call_id)?.swap_conference_level_active_child();
            step.publish(CallEvent::ConferenceSwapped {
                conference_id: call_id,
                active_child,
            });
            Ok(())
        })
    }

    /// Transfer a connected call to `target`
    ///
    /// # Errors
    ///
    /// `CallNotFound`, `InvalidState` unless connected, or `PolicyRejected`
    /// without transfer support.
    pub fn transfer_call(&self, call_id: CallId, target: &str, confirm: bool) -> Result<(), OrchestratorError> {
        self.run(|step| {
            let call = step.call_in(call_id, CONNECTED)?;
            require(call.capabilities(), Capabilities::TRANSFER, "transfer")?;
            tracing::info!(call_id = %call_id, confirm, "Transferring call");
            step.command(
                call_id,
                BackendCommand::Transfer {
                    target: target.to_string(),
                    confirm,
                },
            );
            Ok(())
        })
    }

    /// Deliver an application event to the call's backend
    ///
    /// # Errors
    ///
    /// `CallNotFound` for an unknown call.
    pub fn send_call_event(
        &self,
        call_id: CallId,
        event: &str,
        extras: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        self.run(|step| {
            step.call(call_id)?;
            step.command(
                call_id,
                BackendCommand::SendEvent {
                    event: event.to_string(),
                    extras,
                },
            );
            Ok(())
        })
    }

    /// Start a real-time text session and return the user's end
    ///
    /// The backend's end is collected with [`CallOrchestrator::take_rtt_remote`].
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `InvalidState` once the call is ending.
    pub fn request_rtt(&self, call_id: CallId) -> Result<DuplexStream, OrchestratorError> {
        self.run(|step| step.open_rtt(call_id))
    }

    /// Answer a remote request to start real-time text
    ///
    /// Returns the user's end of the new session when accepted.
    ///
    /// # Errors
    ///
    /// `CallNotFound`, or `InvalidState` once the call is ending.
    pub fn respond_to_rtt_request(
        &self,
        call_id: CallId,
        request_id: u32,
        accept: bool,
    ) -> Result<Option<DuplexStream>, OrchestratorError> {
        self.run(|step| {
            let local = if accept { Some(step.open_rtt(call_id)?) } else { None };
            step.command(call_id, BackendCommand::RespondToRttRequest { request_id, accept });
            Ok(local)
        })
    }

    /// Take the backend's end of the call's RTT session
    #[must_use]
    pub fn take_rtt_remote(&self, call_id: CallId) -> Option<DuplexStream> {
        self.run(|step| {
            step.registry
                .get_mut(call_id)?
                .rtt_mut()?
                .take_remote()
        })
    }

    /// Close the call's RTT session
    ///
    /// # Errors
    ///
    /// `CallNotFound` for an unknown call.
    pub fn stop_rtt(&self, call_id: CallId) -> Result<(), OrchestratorError> {
        self.run(|step| {
            step.call_mut(call_id)?.close_rtt();
            step.details_changed(call_id);
            Ok(())
        })
    }

    /// Hand a call over to another backend
    ///
    /// Creates the destination call on `destination_account` and links the
    /// pair. The source keeps running until the destination goes active.
    ///
    /// # Errors
    ///
    /// `HandoverRefused` during an emergency call, when either backend lacks
    /// handover support, or when the source is already part of a handover.
    #[tracing::instrument(skip_all, fields(source = %source, destination = %destination_account))]
    pub fn request_handover(
        &self,
        source: CallId,
        destination_account: &PhoneAccountHandle,
        video_state: VideoState,
    ) -> Result<CallId, OrchestratorError> {
        self.run(|step| step.begin_handover(source, destination_account, video_state))
    }

    /// Create an ad-hoc conference with `participants` on `account`
    ///
    /// # Errors
    ///
    /// `AccountNotFound` or `BackendUnavailable` for the account; the
    /// backend's own refusal ends the conference call instead.
    #[tracing::instrument(skip_all, fields(account = %account))]
    pub async fn start_conference(
        &self,
        account: &PhoneAccountHandle,
        participants: Vec<String>,
    ) -> Result<CallId, OrchestratorError> {
        let registered = self
            .inner
            .accounts
            .get(account)
            .ok_or_else(|| OrchestratorError::AccountNotFound(account.clone()))?;
        let service = self
            .inner
            .accounts
            .service_for(account)
            .ok_or_else(|| OrchestratorError::BackendUnavailable(account.clone()))?;

        let (call_id, token) = self.run(|step| {
            let call_id = step.registry.create(CallDirection::Undefined, step.clock);
            let mut token = None;
            if let Some(call) = step.registry.get_mut(call_id) {
                call.set_kind(CallKind::ConferenceHost);
                call.set_target_account(Some(account.clone()));
                call.set_self_managed(registered.self_managed);
                call.set_properties(Properties::CONFERENCE | Properties::IS_ADHOC_CONFERENCE);
                token = Some(call.cancel_token());
            }
            step.announce_added(call_id);
            step.set_state(call_id, CallState::Connecting);
            (call_id, token.unwrap_or_else(CancellationToken::new))
        });

        let request = ConferenceRequest {
            call_id,
            account: account.clone(),
            participants,
        };
        if let Some(Err(cause)) = until_cancelled(&token, service.create_conference(request)).await {
            tracing::error!(call_id = %call_id, cause = ?cause, "Conference creation failed");
            self.run(|step| step.fail_connection(call_id, cause));
        }
        Ok(call_id)
    }

    /// Answer the account picker for `call_id`
    ///
    /// A response for a call that is not waiting for an account is ignored.
    ///
    /// # Errors
    ///
    /// `AccountNotFound` for an unregistered account.
    pub fn select_phone_account(
        &self,
        call_id: CallId,
        account: PhoneAccountHandle,
    ) -> Result<(), OrchestratorError> {
        if self.inner.accounts.get(&account).is_none() {
            return Err(OrchestratorError::AccountNotFound(account));
        }
        self.run(|step| match step.take_prompt(call_id) {
            Some(PendingPrompt::AccountSelection(answer)) => {
                if answer.send(account).is_err() {
                    tracing::debug!(call_id = %call_id, "Account selection arrived after setup ended");
                }
            }
            Some(other) => step.restore_prompt(call_id, other),
            None => tracing::debug!(call_id = %call_id, "No account selection pending"),
        });
        Ok(())
    }

    /// Answer the drop-ongoing-call confirmation for `call_id`
    pub fn confirm_drop_ongoing_call(&self, call_id: CallId, confirmed: bool) {
        self.run(|step| match step.take_prompt(call_id) {
            Some(PendingPrompt::DropOngoingCall(answer)) => {
                let _ = answer.send(confirmed);
            }
            Some(other) => step.restore_prompt(call_id, other),
            None => tracing::debug!(call_id = %call_id, "No drop confirmation pending"),
        });
    }

    /// Answer the redirection confirmation for `call_id`
    ///
    /// `true` dials the redirected address, `false` the original one.
    pub fn confirm_redirection(&self, call_id: CallId, use_redirected: bool) {
        self.run(|step| match step.take_prompt(call_id) {
            Some(PendingPrompt::Redirection(answer)) => {
                let _ = answer.send(use_redirected);
            }
            Some(other) => step.restore_prompt(call_id, other),
            None => tracing::debug!(call_id = %call_id, "No redirection confirmation pending"),
        });
    }

    /// Report whether an in-call tone is playing
    pub fn set_tone_playing(&self, playing: bool) {
        self.run(|step| step.coordinator.set_tone_playing(playing));
    }

    /// Tell the focus arbiter the audio route settled
    pub fn audio_operations_complete(&self) {
        self.notify_audio_focus(FocusMessage::AudioOperationsComplete);
    }

    /// Tell the focus arbiter the ringer mode or volume changed
    pub fn ringer_mode_changed(&self) {
        self.notify_audio_focus(FocusMessage::RingerModeChange);
    }

    fn notify_audio_focus(&self, message: FocusMessage) {
        let state = self.inner.state.lock();
        let facts = state.coordinator.facts(&state.registry);
        self.inner.audio_focus.send(message, facts);
    }
}

fn require(capabilities: Capabilities, needed: Capabilities, verb: &str) -> Result<(), OrchestratorError> {
    if capabilities.contains(needed) {
        Ok(())
    } else {
        Err(OrchestratorError::PolicyRejected(format!("backend does not support {verb}")))
    }
}

impl Step<'_> {
    fn open_rtt(&mut self, call_id: CallId) -> Result<DuplexStream, OrchestratorError> {
        let buffer = self.config.rtt_buffer_bytes;
        let call = self.call_mut(call_id)?;
        if !call.is_alive() || call.state() == CallState::Disconnecting {
            return Err(OrchestratorError::InvalidState {
                call_id,
                state: call.state(),
            });
        }
        let local = call
            .open_rtt(buffer)
            .take_local()
            .ok_or(OrchestratorError::InvalidState {
                call_id,
                state: call.state(),
            })?;
        tracing::debug!(call_id = %call_id, "RTT session opened");
        self.details_changed(call_id);
        Ok(local)
    }

    fn begin_handover(
        &mut self,
        source: CallId,
        destination_account: &PhoneAccountHandle,
        video_state: VideoState,
    ) -> Result<CallId, OrchestratorError> {
        if let Err(reason) =
            handover::validate_request(self.registry, self.accounts, source, destination_account)
        {
            tracing::warn!(source = %source, reason = ?reason, "Handover refused");
            self.publish(CallEvent::HandoverFailed {
                call_id: source,
                reason,
            });
            return Err(OrchestratorError::HandoverRefused(reason));
        }
        let address = self.call(source)?.address().map(str::to_string);

        let destination = self.registry.create(CallDirection::Outgoing, self.clock);
        let self_managed = self.accounts.is_self_managed(destination_account);
        if let Some(call) = self.registry.get_mut(destination) {
            call.set_address(address, Presentation::Allowed);
            call.set_target_account(Some(destination_account.clone()));
            call.set_self_managed(self_managed);
            call.set_video_state(video_state);
        }
        handover::begin(self.registry, source, destination);
        self.announce_added(destination);
        self.details_changed(source);

        self.set_state(destination, CallState::Connecting);
        self.schedule_connect(destination);
        Ok(destination)
    }
}
