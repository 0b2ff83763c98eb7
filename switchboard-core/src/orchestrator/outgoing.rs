//! Outgoing call pipeline
//!
//! ```text
//!   open (or reuse) ─► redirect ─► candidates ─► suggestion ─► admission
//!                                                                 │
//!        create_connection ◄── Connecting ◄── account picker ◄────┘
//! ```
//!
//! Every await is raced against the call's cancellation token, so a
//! disconnect at any stage ends the pipeline with no call. User prompts
//! that time out count as the user cancelling.

use super::effects::{PendingPrompt, Step};
use super::{until_cancelled, CallOrchestrator, OrchestratorError};
use crate::accounts::{PhoneAccount, PhoneAccountHandle};
use crate::admission::{Admission, RoomDecision};
use crate::call::Call;
use crate::collaborators::AccountSuggestion;
use crate::types::{
    CallDirection, CallEvent, CallId, CallState, DisconnectCause, DisconnectCode, Presentation,
    VideoState,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A request to place an outgoing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingCallRequest {
    /// Address to dial, e.g. `tel:555-1234`
    pub address: String,
    /// Account to place the call on; chosen by the pipeline when `None`
    pub account: Option<PhoneAccountHandle>,
    /// Requested video state
    pub video_state: VideoState,
}

impl OutgoingCallRequest {
    /// Audio call to `address` on an account chosen by the pipeline
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            account: None,
            video_state: VideoState::AUDIO_ONLY,
        }
    }

    /// Place the call on `account`
    #[must_use]
    pub fn on_account(mut self, account: PhoneAccountHandle) -> Self {
        self.account = Some(account);
        self
    }

    /// Request a video state
    #[must_use]
    pub fn with_video_state(mut self, video_state: VideoState) -> Self {
        self.video_state = video_state;
        self
    }
}

/// What admission control decided for the new call
enum Admitted {
    Proceed,
    Refused,
    NeedsConfirmation { blocking: CallId, label: String },
}

impl CallOrchestrator {
    /// Place an outgoing call
    ///
    /// Returns the call once its backend connection has been requested, or
    /// `None` when a stage ended the call: no account can dial the address,
    /// admission control refused it, or the user cancelled or did not
    /// answer a prompt.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::AccountNotFound` when `request.account`
    /// is not registered.
    #[tracing::instrument(skip_all, fields(address = %request.address))]
    pub async fn place_outgoing_call(
        &self,
        request: OutgoingCallRequest,
    ) -> Result<Option<CallId>, OrchestratorError> {
        let is_emergency = self.inner.config.is_emergency_address(&request.address);
        if let Some(account) = &request.account {
            if self.inner.accounts.get(account).is_none() {
                return Err(OrchestratorError::AccountNotFound(account.clone()));
            }
        }
        if is_emergency {
            tracing::info!("Placing emergency call");
        }

        let (call_id, token) = self.run(|step| step.open_outgoing_call(&request, is_emergency));
        self.spawn_caller_info_lookup(call_id);

        if !is_emergency && !self.redirect(call_id, &token, request.account.as_ref()).await {
            return Ok(None);
        }

        let candidates = self.run(|step| {
            step.resolve_candidates(call_id, request.account.as_ref(), is_emergency)
        });
        let Some(candidates) = candidates else {
            return Ok(None);
        };

        let mut suggestions = Vec::new();
        if !is_emergency && !self.run(|step| step.has_target(call_id)) {
            let Some(ranked) = self.rank_candidates(call_id, &token, &candidates).await else {
                return Ok(None);
            };
            suggestions = ranked;
            if let Some(auto) = suggestions.iter().find(|s| s.should_auto_select) {
                let handle = auto.handle.clone();
                tracing::debug!(call_id = %call_id, account = %handle, "Suggestion auto-selected");
                self.run(|step| step.select_target(call_id, handle));
            }
        }

        if !self.admit(call_id, &token).await {
            return Ok(None);
        }

        if !self.run(|step| step.has_target(call_id)) {
            let (tx, rx) = oneshot::channel();
            let waiting = self.run(|step| {
                if step.call(call_id).is_err() || token.is_cancelled() {
                    return false;
                }
                step.set_state(call_id, CallState::SelectPhoneAccount);
                step.register_prompt(call_id, PendingPrompt::AccountSelection(tx));
                true
            });
            if !waiting {
                return Ok(None);
            }
            if suggestions.is_empty() {
                suggestions = candidates
                    .iter()
                    .map(|account| AccountSuggestion::unranked(account.handle.clone()))
                    .collect();
            }
            self.inner
                .collaborators
                .prompts
                .show_account_picker(call_id, &suggestions);

            let Some(chosen) = self.await_prompt(call_id, &token, rx).await else {
                self.abandon(
                    call_id,
                    &token,
                    DisconnectCause::with_reason(DisconnectCode::Canceled, "no account selected"),
                );
                return Ok(None);
            };
            tracing::info!(call_id = %call_id, account = %chosen, "Account selected");
            self.run(|step| step.select_target(call_id, chosen));
            if !self.admit(call_id, &token).await {
                return Ok(None);
            }
        }

        if !self.run(|step| step.finalize_outgoing(call_id, &token)) {
            return Ok(None);
        }
        self.connect(call_id).await;
        Ok(self.is_alive(call_id).then_some(call_id))
    }

    /// Run admission control, asking the user to drop a blocking call when
    /// that is allowed
    ///
    /// Without a chosen account only the setup ceilings apply; the full
    /// check runs again once the account is known. Returns `false` when the
    /// pipeline must stop.
    async fn admit(&self, call_id: CallId, token: &CancellationToken) -> bool {
        let (blocking, label) = match self.run(|step| step.admit_outgoing(call_id, token)) {
            Admitted::Proceed => return true,
            Admitted::Refused => return false,
            Admitted::NeedsConfirmation { blocking, label } => (blocking, label),
        };

        let (tx, rx) = oneshot::channel();
        self.run(|step| step.register_prompt(call_id, PendingPrompt::DropOngoingCall(tx)));
        self.inner
            .collaborators
            .prompts
            .confirm_drop_ongoing_call(call_id, blocking, &label);

        if self.await_prompt(call_id, token, rx).await == Some(true) {
            tracing::info!(call_id = %call_id, dropped = %blocking, "User dropped the ongoing call");
            self.run(|step| step.request_disconnect(blocking, None));
            true
        } else {
            self.abandon(
                call_id,
                token,
                DisconnectCause::with_reason(DisconnectCode::Canceled, "ongoing call kept"),
            );
            false
        }
    }

    /// Offer the address to the redirection service
    ///
    /// Returns `false` when the pipeline must stop.
    async fn redirect(
        &self,
        call_id: CallId,
        token: &CancellationToken,
        account: Option<&PhoneAccountHandle>,
    ) -> bool {
        let Some(service) = self.inner.collaborators.redirection.clone() else {
            return true;
        };
        let address = self.run(|step| {
            step.call(call_id)
                .ok()
                .and_then(|call| call.address().map(str::to_string))
        });
        let Some(address) = address else {
            return true;
        };

        let limit = self.inner.config.timeouts.lookup();
        let redirected = match until_cancelled(
            token,
            tokio::time::timeout(limit, service.redirect(&address, account)),
        )
        .await
        {
            None => return false,
            Some(Ok(Some(redirected))) if redirected != address => redirected,
            Some(Ok(_)) => return true,
            Some(Err(_)) => {
                tracing::warn!(call_id = %call_id, "Redirection service timed out, dialing original address");
                return true;
            }
        };

        if self.inner.config.confirm_redirection {
            let (tx, rx) = oneshot::channel();
            self.run(|step| step.register_prompt(call_id, PendingPrompt::Redirection(tx)));
            self.inner
                .collaborators
                .prompts
                .confirm_redirection(call_id, &address, &redirected);
            match self.await_prompt(call_id, token, rx).await {
                Some(true) => {}
                Some(false) => {
                    tracing::info!(call_id = %call_id, "Keeping original address");
                    return true;
                }
                None => {
                    self.abandon(
                        call_id,
                        token,
                        DisconnectCause::with_reason(DisconnectCode::Canceled, "redirection not confirmed"),
                    );
                    return false;
                }
            }
        }

        tracing::info!(call_id = %call_id, "Dialing redirected address");
        self.run(|step| {
            if let Ok(call) = step.call_mut(call_id) {
                call.set_address(Some(redirected), Presentation::Allowed);
                step.details_changed(call_id);
            }
        });
        self.spawn_caller_info_lookup(call_id);
        true
    }

    /// Ask the suggestion service to rank the candidates
    ///
    /// Falls back to the unranked list on timeout. Returns `None` when the
    /// call was cancelled meanwhile.
    async fn rank_candidates(
        &self,
        call_id: CallId,
        token: &CancellationToken,
        candidates: &[PhoneAccount],
    ) -> Option<Vec<AccountSuggestion>> {
        let handles: Vec<PhoneAccountHandle> =
            candidates.iter().map(|account| account.handle.clone()).collect();
        let address = self.run(|step| {
            step.call(call_id)
                .ok()
                .and_then(|call| call.address().map(str::to_string))
        })?;

        let service = Arc::clone(&self.inner.collaborators.suggestions);
        let limit = self.inner.config.timeouts.suggestion();
        let ranked = match until_cancelled(
            token,
            tokio::time::timeout(limit, service.suggest(&address, &handles)),
        )
        .await?
        {
            Ok(ranked) => ranked,
            Err(_) => {
                tracing::warn!(call_id = %call_id, "Suggestion service timed out, using unranked accounts");
                Vec::new()
            }
        };

        let mut suggestions: Vec<AccountSuggestion> = ranked
            .into_iter()
            .filter(|suggestion| handles.contains(&suggestion.handle))
            .collect();
        for handle in handles {
            if !suggestions.iter().any(|s| s.handle == handle) {
                suggestions.push(AccountSuggestion::unranked(handle));
            }
        }
        Some(suggestions)
    }

    /// Wait for a prompt answer, bounded by the user prompt timeout
    async fn await_prompt<T>(
        &self,
        call_id: CallId,
        token: &CancellationToken,
        answer: oneshot::Receiver<T>,
    ) -> Option<T> {
        let limit = self.inner.config.timeouts.user_prompt();
        match until_cancelled(token, tokio::time::timeout(limit, answer)).await? {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(call_id = %call_id, "User prompt timed out");
                None
            }
        }
    }
}

impl Step<'_> {
    /// Create the call, or reuse a pending-disconnect call to the same address
    fn open_outgoing_call(
        &mut self,
        request: &OutgoingCallRequest,
        is_emergency: bool,
    ) -> (CallId, CancellationToken) {
        let mut reused = None;
        let parked: Vec<CallId> = self.pending.disconnects.iter().copied().collect();
        for parked_id in parked {
            let same_address = self
                .registry
                .get(parked_id)
                .is_some_and(|call| call.address() == Some(request.address.as_str()));
            if same_address && reused.is_none() {
                reused = Some(parked_id);
            } else {
                self.teardown_pending(parked_id);
            }
        }

        let call_id = match reused.and_then(|id| self.reuse_pending(id)) {
            Some(call_id) => call_id,
            None => {
                let call_id = self.registry.create(CallDirection::Outgoing, self.clock);
                if let Some(call) = self.registry.get_mut(call_id) {
                    call.set_address(Some(request.address.clone()), Presentation::Allowed);
                }
                call_id
            }
        };

        let mut token = CancellationToken::new();
        if let Some(call) = self.registry.get_mut(call_id) {
            call.set_video_state(request.video_state);
            if is_emergency {
                call.mark_emergency();
            }
            token = call.cancel_token();
        }
        if reused == Some(call_id) {
            self.details_changed(call_id);
        } else {
            self.announce_added(call_id);
        }
        (call_id, token)
    }

    fn reuse_pending(&mut self, call_id: CallId) -> Option<CallId> {
        self.pending.disconnects.remove(&call_id);
        let call = self.registry.get_mut(call_id)?;
        let old_state = call.state();
        call.reset_for_redial(self.clock);
        tracing::info!(call_id = %call_id, "Reusing pending-disconnect call for redial");
        self.publish(CallEvent::CallStateChanged {
            call_id,
            old_state,
            new_state: CallState::New,
        });
        Some(call_id)
    }

    /// Work out which accounts may carry the call
    ///
    /// Emergency calls get every emergency-capable account, SIM first; the
    /// first becomes the target and the rest are kept for fallback.
    fn resolve_candidates(
        &mut self,
        call_id: CallId,
        requested: Option<&PhoneAccountHandle>,
        is_emergency: bool,
    ) -> Option<Vec<PhoneAccount>> {
        let address = self.call(call_id).ok()?.address()?.to_string();

        let candidates: Vec<PhoneAccount> = if is_emergency {
            let mut accounts = self.accounts.emergency_accounts();
            if let Some(position) = requested
                .and_then(|handle| accounts.iter().position(|a| &a.handle == handle))
            {
                let preferred = accounts.remove(position);
                accounts.insert(0, preferred);
            }
            accounts
        } else if let Some(handle) = requested {
            self.accounts
                .get(handle)
                .filter(|account| account.enabled)
                .into_iter()
                .collect()
        } else {
            self.accounts.callable_accounts(&address)
        };

        if candidates.is_empty() {
            tracing::warn!(call_id = %call_id, "No account can place this call");
            self.disconnect_locally(
                call_id,
                DisconnectCause::with_reason(DisconnectCode::Error, "no account can place this call"),
            );
            return None;
        }

        if is_emergency {
            let mut handles: Vec<PhoneAccountHandle> =
                candidates.iter().map(|account| account.handle.clone()).collect();
            let first = handles.remove(0);
            self.select_target(call_id, first);
            if let Ok(call) = self.call_mut(call_id) {
                call.set_connection_candidates(handles);
            }
            return Some(candidates);
        }

        let preselected = requested
            .cloned()
            .or_else(|| {
                self.accounts
                    .default_outgoing()
                    .filter(|default| candidates.iter().any(|a| &a.handle == default))
            })
            .or_else(|| match candidates.as_slice() {
                [only] => Some(only.handle.clone()),
                _ => None,
            });
        if let Some(handle) = preselected {
            self.select_target(call_id, handle);
        }
        Some(candidates)
    }

    fn has_target(&self, call_id: CallId) -> bool {
        self.call(call_id)
            .is_ok_and(|call| call.target_account().is_some())
    }

    fn select_target(&mut self, call_id: CallId, handle: PhoneAccountHandle) {
        let self_managed = self.accounts.is_self_managed(&handle);
        if let Ok(call) = self.call_mut(call_id) {
            call.set_target_account(Some(handle));
            call.set_self_managed(self_managed);
        }
    }

    fn admit_outgoing(&mut self, call_id: CallId, token: &CancellationToken) -> Admitted {
        if token.is_cancelled() {
            return Admitted::Refused;
        }
        let Some(call) = self.registry.get(call_id).filter(|call| call.is_alive()) else {
            return Admitted::Refused;
        };
        let admission = Admission::new(self.registry, self.accounts, &self.config.admission);
        let self_managed = call.is_self_managed();
        let decision = if call.is_emergency() {
            admission.make_room_for_outgoing_emergency_call(call)
        } else if self_managed {
            admission.check_outgoing_self_managed(call)
        } else {
            admission.make_room_for_outgoing_call(call)
        };

        match decision {
            RoomDecision::Proceed { actions } => {
                self.apply_room_actions(&actions);
                Admitted::Proceed
            }
            RoomDecision::Blocked { blocking, reason } => {
                tracing::warn!(call_id = %call_id, blocking = ?blocking, reason, "Outgoing call blocked");
                let confirmable = blocking.filter(|blocking| {
                    self_managed || self.registry.get(*blocking).is_some_and(Call::is_self_managed)
                });
                match confirmable {
                    Some(blocking) => Admitted::NeedsConfirmation {
                        blocking,
                        label: self.describe(blocking),
                    },
                    None => {
                        self.disconnect_locally(
                            call_id,
                            DisconnectCause::with_reason(DisconnectCode::Error, "too many calls"),
                        );
                        Admitted::Refused
                    }
                }
            }
        }
    }

    /// A label for the user: the call's account label, else its address
    fn describe(&self, call_id: CallId) -> String {
        let Some(call) = self.registry.get(call_id) else {
            return call_id.to_string();
        };
        call.target_account()
            .and_then(|handle| self.accounts.get(handle))
            .map(|account| account.label)
            .or_else(|| call.address().map(str::to_string))
            .unwrap_or_else(|| call_id.to_string())
    }

    fn finalize_outgoing(&mut self, call_id: CallId, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        let ready = self
            .registry
            .get(call_id)
            .is_some_and(|call| call.is_alive() && call.target_account().is_some());
        if !ready {
            return false;
        }
        self.set_state(call_id, CallState::Connecting);
        self.details_changed(call_id);
        true
    }
}
