//! Incoming call intake

use super::effects::Step;
use super::{until_cancelled, CallOrchestrator, OrchestratorError};
use crate::accounts::PhoneAccountHandle;
use crate::admission::{Admission, IncomingAdmission};
use crate::backend::BackendCommand;
use crate::collaborators::{FilterVerdict, IncomingCallDetails};
use crate::types::{
    CallDirection, CallId, CallState, DisconnectCause, DisconnectCode, Presentation, VideoState,
};
use std::sync::Arc;

/// A backend's report of a new incoming call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallRequest {
    /// Account the call arrived on
    pub account: PhoneAccountHandle,
    /// Caller address, if presented
    pub address: Option<String>,
    /// Offered video state
    pub video_state: VideoState,
}

impl IncomingCallRequest {
    /// Audio call from `address` on `account`
    #[must_use]
    pub fn new(account: PhoneAccountHandle, address: Option<String>) -> Self {
        Self {
            account,
            address,
            video_state: VideoState::AUDIO_ONLY,
        }
    }

    /// Offered video state
    #[must_use]
    pub fn with_video_state(mut self, video_state: VideoState) -> Self {
        self.video_state = video_state;
        self
    }
}

impl CallOrchestrator {
    /// Take in a new incoming call
    ///
    /// The call is admitted, connected, filtered and then left ringing (or
    /// screening via audio). Returns `None` when it was turned away or ended
    /// before it could ring.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::AccountNotFound` for an unregistered account.
    #[tracing::instrument(skip_all, fields(account = %request.account))]
    pub async fn add_incoming_call(
        &self,
        request: IncomingCallRequest,
    ) -> Result<Option<CallId>, OrchestratorError> {
        let account = self
            .inner
            .accounts
            .get(&request.account)
            .ok_or_else(|| OrchestratorError::AccountNotFound(request.account.clone()))?;

        let Some((call_id, token)) = self.run(|step| step.open_incoming_call(&request, account.self_managed))
        else {
            return Ok(None);
        };

        if !self.connect(call_id).await {
            return Ok(None);
        }
        self.spawn_caller_info_lookup(call_id);

        let verdict = if account.self_managed {
            FilterVerdict::Allow
        } else {
            let details = IncomingCallDetails {
                call_id,
                address: request.address.clone(),
                account: request.account.clone(),
            };
            let filter = Arc::clone(&self.inner.collaborators.filter);
            let limit = self.inner.config.timeouts.filter();
            match until_cancelled(&token, tokio::time::timeout(limit, filter.filter(&details))).await {
                None => return Ok(self.is_alive(call_id).then_some(call_id)),
                Some(Ok(verdict)) => verdict,
                Some(Err(_)) => {
                    tracing::warn!(call_id = %call_id, "Incoming call filter timed out, allowing call");
                    FilterVerdict::Allow
                }
            }
        };

        self.run(|step| step.apply_filter_verdict(call_id, verdict));
        Ok(self.is_alive(call_id).then_some(call_id))
    }

    /// Leave background audio processing
    ///
    /// With `should_ring` the call starts ringing as if it had just arrived;
    /// otherwise it goes straight to active.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`, or `InvalidState` unless the call is in
    /// `AudioProcessing`.
    pub fn exit_audio_processing(
        &self,
        call_id: CallId,
        should_ring: bool,
    ) -> Result<(), OrchestratorError> {
        self.run(|step| {
            step.call_in(call_id, &[CallState::AudioProcessing])?;
            let next = if should_ring {
                CallState::SimulatedRinging
            } else {
                CallState::Active
            };
            tracing::info!(call_id = %call_id, next = %next, "Leaving audio processing");
            step.set_state(call_id, next);
            Ok(())
        })
    }
}

impl Step<'_> {
    fn open_incoming_call(
        &mut self,
        request: &IncomingCallRequest,
        self_managed: bool,
    ) -> Option<(CallId, tokio_util::sync::CancellationToken)> {
        let call_id = self.registry.create(CallDirection::Incoming, self.clock);
        let call = self.registry.get_mut(call_id)?;
        call.set_address(request.address.clone(), Presentation::Allowed);
        call.set_target_account(Some(request.account.clone()));
        call.set_self_managed(self_managed);
        call.set_video_state(request.video_state);
        let token = call.cancel_token();
        self.announce_added(call_id);

        let call = self.registry.get(call_id)?;
        let admission = Admission::new(self.registry, self.accounts, &self.config.admission);
        if let IncomingAdmission::Reject { cause, reason } = admission.admit_incoming_call(call) {
            tracing::info!(call_id = %call_id, reason, "Turning away incoming call");
            self.disconnect_locally(call_id, cause);
            return None;
        }
        Some((call_id, token))
    }

    fn apply_filter_verdict(&mut self, call_id: CallId, verdict: FilterVerdict) {
        let Ok(call) = self.call_mut(call_id) else {
            return;
        };
        if call.state() != CallState::New {
            tracing::debug!(call_id = %call_id, state = %call.state(), "Call moved on before filtering finished");
            return;
        }
        tracing::info!(call_id = %call_id, verdict = ?verdict, "Incoming call filtered");

        match verdict {
            FilterVerdict::Allow => {
                self.set_state(call_id, CallState::Ringing);
            }
            FilterVerdict::Silence => {
                call.set_silenced(true);
                self.set_state(call_id, CallState::Ringing);
            }
            FilterVerdict::ScreenViaAudio => {
                self.set_state(call_id, CallState::AudioProcessing);
            }
            FilterVerdict::RejectAsMissed => {
                call.set_override_disconnect_cause(Some(DisconnectCause::with_reason(
                    DisconnectCode::Missed,
                    "blocked by call filter",
                )));
                self.command(call_id, BackendCommand::Reject(None));
                self.disconnect_locally(call_id, DisconnectCause::new(DisconnectCode::Missed));
            }
        }
    }
}
