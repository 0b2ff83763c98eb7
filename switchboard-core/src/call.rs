//! Call entity
//!
//! A [`Call`] is the record of one call's identity, lifecycle state,
//! capabilities and relationships. It performs no I/O: every mutator only
//! keeps the entity's own invariants, and the orchestrator turns the results
//! into events and backend commands.
//!
//! # Lifecycle
//!
//! ```text
//!   New ──► SelectPhoneAccount ──► Connecting ──► Dialing / Pulling ───┐
//!    │                                                                 ▼
//!    └──► Ringing / SimulatedRinging / AudioProcessing ──► Answered ──► Active ⇄ OnHold
//!                                                                        │
//!                                               Disconnecting ◄──────────┘
//!                                                     │
//!                                                     ▼
//!                                          Disconnected / Aborted
//! ```
//!
//! Backend signaling is untrusted, so [`Call::set_state`] accepts any pair of
//! states and only guards the two cases that must not be committed.

use crate::accounts::PhoneAccountHandle;
use crate::clock::Clock;
use crate::types::{
    CallDirection, CallId, CallKind, CallSnapshot, CallState, CallerInfo, Capabilities,
    DisconnectCause, HandoverState, Presentation, Properties, VerificationStatus, VideoState,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// The state changed
    Changed {
        /// State before the change
        old: CallState,
    },
    /// The call was already in the requested state
    Unchanged,
    /// `Answered` was requested for a call that is already `Active`
    RejectedRedundant,
    /// `Disconnected` was refused because another backend candidate
    /// should be attempted first
    DeferredToFallback,
}

impl StateTransition {
    /// Whether the call now has the requested state
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Changed { .. } | Self::Unchanged)
    }
}

/// Both ends of a real-time text session
///
/// One end is handed to the UI, the other to the backend. Dropping the pair
/// closes the session.
#[derive(Debug)]
pub struct RttStreams {
    local: Option<DuplexStream>,
    remote: Option<DuplexStream>,
}

impl RttStreams {
    /// Open a connected pair with `buffer` bytes of capacity per direction
    #[must_use]
    pub fn open(buffer: usize) -> Self {
        let (local, remote) = tokio::io::duplex(buffer);
        Self {
            local: Some(local),
            remote: Some(remote),
        }
    }

    /// Take the end read and written by the user interface
    pub fn take_local(&mut self) -> Option<DuplexStream> {
        self.local.take()
    }

    /// Take the end read and written by the backend
    pub fn take_remote(&mut self) -> Option<DuplexStream> {
        self.remote.take()
    }
}

/// One tracked call
#[derive(Debug)]
pub struct Call {
    id: CallId,
    direction: CallDirection,
    kind: CallKind,
    state: CallState,

    address: Option<String>,
    address_presentation: Presentation,
    caller_display_name: Option<String>,
    caller_display_name_presentation: Presentation,
    verification_status: VerificationStatus,

    target_account: Option<PhoneAccountHandle>,
    connection_manager_account: Option<PhoneAccountHandle>,
    remote_account: Option<PhoneAccountHandle>,
    self_managed: bool,

    capabilities: Capabilities,
    properties: Properties,
    video_state: VideoState,
    video_state_history: VideoState,

    created_at: DateTime<Utc>,
    connect_time: Option<DateTime<Utc>>,
    connect_elapsed: Option<Duration>,
    disconnect_time: Option<DateTime<Utc>>,
    disconnect_elapsed: Option<Duration>,

    parent: Option<CallId>,
    children: Vec<CallId>,
    conference_level_active_child: Option<CallId>,

    handover_source: Option<CallId>,
    handover_destination: Option<CallId>,
    handover_state: HandoverState,

    disconnect_cause: DisconnectCause,
    override_disconnect_cause: Option<DisconnectCause>,

    is_emergency: bool,
    locally_disconnecting: bool,
    silenced: bool,
    connection_candidates: VecDeque<PhoneAccountHandle>,

    rtt: Option<RttStreams>,
    caller_info: Option<CallerInfo>,
    caller_info_token: Option<Uuid>,
    cancel_token: CancellationToken,
}

impl Call {
    /// Create a call in state `New`
    pub fn new(id: CallId, direction: CallDirection, clock: &dyn Clock) -> Self {
        Self {
            id,
            direction,
            kind: CallKind::Regular,
            state: CallState::New,
            address: None,
            address_presentation: Presentation::Allowed,
            caller_display_name: None,
            caller_display_name_presentation: Presentation::Allowed,
            verification_status: VerificationStatus::NotVerified,
            target_account: None,
            connection_manager_account: None,
            remote_account: None,
            self_managed: false,
            capabilities: Capabilities::NONE,
            properties: Properties::NONE,
            video_state: VideoState::AUDIO_ONLY,
            video_state_history: VideoState::AUDIO_ONLY,
            created_at: clock.wall_now(),
            connect_time: None,
            connect_elapsed: None,
            disconnect_time: None,
            disconnect_elapsed: None,
            parent: None,
            children: Vec::new(),
            conference_level_active_child: None,
            handover_source: None,
            handover_destination: None,
            handover_state: HandoverState::None,
            disconnect_cause: DisconnectCause::unknown(),
            override_disconnect_cause: None,
            is_emergency: false,
            locally_disconnecting: false,
            silenced: false,
            connection_candidates: VecDeque::new(),
            rtt: None,
            caller_info: None,
            caller_info_token: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Call identifier
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Call direction
    #[must_use]
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Conference role
    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Set the conference role
    pub fn set_kind(&mut self, kind: CallKind) {
        self.kind = kind;
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Request a state change
    ///
    /// Any state may follow any other. Side effects depend only on the new
    /// state: entering `Active`/`OnHold` stamps the connect time once, and
    /// entering `Disconnected` stamps the disconnect time and detaches the
    /// call from its conference.
    pub fn set_state(&mut self, new_state: CallState, clock: &dyn Clock) -> StateTransition {
        if let Some(refused) = self.check_transition(new_state) {
            return refused;
        }
        self.apply_state(new_state, clock)
    }

    /// Evaluate the guards of [`Call::set_state`] without mutating
    ///
    /// Returns `None` when the change would be committed.
    #[must_use]
    pub fn check_transition(&self, new_state: CallState) -> Option<StateTransition> {
        if self.state == new_state {
            return Some(StateTransition::Unchanged);
        }
        if new_state == CallState::Disconnected && self.should_continue_after_disconnect() {
            tracing::warn!(call_id = %self.id, "Continuing disconnected call with another backend");
            return Some(StateTransition::DeferredToFallback);
        }
        if new_state == CallState::Answered && self.state == CallState::Active {
            tracing::warn!(call_id = %self.id, "Ignoring answered signal for an active call");
            return Some(StateTransition::RejectedRedundant);
        }
        None
    }

    fn apply_state(&mut self, new_state: CallState, clock: &dyn Clock) -> StateTransition {
        let old = self.state;
        tracing::debug!(call_id = %self.id, old_state = %old, new_state = %new_state, "Call state transition");

        self.update_video_history(old, new_state);
        self.state = new_state;

        match new_state {
            CallState::Active | CallState::OnHold => {
                if self.connect_elapsed.is_none() {
                    self.connect_time = Some(clock.wall_now());
                    self.connect_elapsed = Some(clock.monotonic_now());
                }
                self.disconnect_time = None;
                self.disconnect_elapsed = None;
            }
            CallState::Disconnected => {
                self.disconnect_time = Some(clock.wall_now());
                self.disconnect_elapsed = Some(clock.monotonic_now());
                self.locally_disconnecting = false;
                self.parent = None;
                self.children.clear();
                self.conference_level_active_child = None;
            }
            _ => {}
        }

        StateTransition::Changed { old }
    }

    fn update_video_history(&mut self, old: CallState, new: CallState) {
        let resets = matches!(
            (old, new),
            (CallState::Dialing, CallState::Active) | (CallState::Ringing, CallState::Answered)
        );
        if resets {
            self.video_state_history = self.video_state;
        }
        self.video_state_history |= self.video_state;
    }

    fn should_continue_after_disconnect(&self) -> bool {
        self.is_being_placed()
            && self.is_emergency
            && !self.connection_candidates.is_empty()
            && self.disconnect_cause.is_error()
    }

    /// Whether this outgoing call has not yet connected or failed
    #[must_use]
    pub fn is_being_placed(&self) -> bool {
        self.direction == CallDirection::Outgoing && self.state.is_being_placed()
    }

    /// Whether the call has not reached a terminal state
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether the call may own audio focus or foreground UI
    #[must_use]
    pub fn is_focusable(&self) -> bool {
        self.parent.is_none() && !self.is_external()
    }

    /// Whether the call lives on another device
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.properties.contains(Properties::IS_EXTERNAL_CALL)
    }

    /// Whether the call can be put on hold right now
    #[must_use]
    pub fn can_hold(&self) -> bool {
        self.capabilities.contains(Capabilities::HOLD) && self.state != CallState::OnHold
    }

    /// Whether the backend supports hold for this call at all
    #[must_use]
    pub fn supports_hold(&self) -> bool {
        self.capabilities.contains(Capabilities::SUPPORT_HOLD)
            || self.capabilities.contains(Capabilities::HOLD)
    }

    /// Whether the backend asked for VoIP audio handling
    #[must_use]
    pub fn is_voip_audio(&self) -> bool {
        self.self_managed || self.properties.contains(Properties::VOIP_AUDIO_MODE)
    }

    /// Connected duration from monotonic stamps, zero if never connected
    #[must_use]
    pub fn age(&self, clock: &dyn Clock) -> Duration {
        let Some(connected) = self.connect_elapsed else {
            return Duration::ZERO;
        };
        let end = self
            .disconnect_elapsed
            .unwrap_or_else(|| clock.monotonic_now());
        end.saturating_sub(connected)
    }

    /// Wall-clock connect time in milliseconds since the epoch, 0 if never connected
    #[must_use]
    pub fn connect_time_millis(&self) -> i64 {
        self.connect_time.map_or(0, |time| time.timestamp_millis())
    }

    /// Wall-clock creation time
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wall-clock disconnect time, if disconnected
    #[must_use]
    pub fn disconnect_time(&self) -> Option<DateTime<Utc>> {
        self.disconnect_time
    }

    /// Address of the remote party
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Address presentation
    #[must_use]
    pub fn address_presentation(&self) -> Presentation {
        self.address_presentation
    }

    /// Set the remote address
    ///
    /// Returns `true` when the address changed, which invalidates any
    /// in-flight caller-info lookup.
    pub fn set_address(&mut self, address: Option<String>, presentation: Presentation) -> bool {
        let changed = self.address != address || self.address_presentation != presentation;
        if self.address != address {
            self.caller_info = None;
            self.caller_info_token = None;
        }
        self.address = address;
        self.address_presentation = presentation;
        changed
    }

    /// Caller display name
    #[must_use]
    pub fn caller_display_name(&self) -> Option<&str> {
        self.caller_display_name.as_deref()
    }

    /// Set the caller display name
    pub fn set_caller_display_name(&mut self, name: Option<String>, presentation: Presentation) {
        self.caller_display_name = name;
        self.caller_display_name_presentation = presentation;
    }

    /// Caller verification status
    #[must_use]
    pub fn verification_status(&self) -> VerificationStatus {
        self.verification_status
    }

    /// Set the caller verification status
    pub fn set_verification_status(&mut self, status: VerificationStatus) {
        self.verification_status = status;
    }

    /// Account the call is placed on
    #[must_use]
    pub fn target_account(&self) -> Option<&PhoneAccountHandle> {
        self.target_account.as_ref()
    }

    /// Set the account the call is placed on
    pub fn set_target_account(&mut self, account: Option<PhoneAccountHandle>) {
        self.target_account = account;
    }

    /// Set the connection-manager account
    pub fn set_connection_manager_account(&mut self, account: Option<PhoneAccountHandle>) {
        self.connection_manager_account = account;
    }

    /// Set the account the remote connection was placed on
    pub fn set_remote_account(&mut self, account: Option<PhoneAccountHandle>) {
        self.remote_account = account;
    }

    /// The account whose backend carries the call: remote, then connection
    /// manager, then target
    #[must_use]
    pub fn delegate_account(&self) -> Option<&PhoneAccountHandle> {
        self.remote_account
            .as_ref()
            .or(self.connection_manager_account.as_ref())
            .or(self.target_account.as_ref())
    }

    /// Whether the owning backend is self-managed
    #[must_use]
    pub fn is_self_managed(&self) -> bool {
        self.self_managed
    }

    /// Mark the call as owned by a self-managed backend
    pub fn set_self_managed(&mut self, self_managed: bool) {
        self.self_managed = self_managed;
        self.properties = if self_managed {
            self.properties.with(Properties::SELF_MANAGED)
        } else {
            self.properties.without(Properties::SELF_MANAGED)
        };
    }

    /// Raw capabilities
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Capabilities as shown to observers; pulling is hidden while an
    /// emergency call is in progress
    #[must_use]
    pub fn exposed_capabilities(&self, emergency_in_progress: bool) -> Capabilities {
        if emergency_in_progress {
            self.capabilities.without(Capabilities::CAN_PULL_CALL)
        } else {
            self.capabilities
        }
    }

    /// Replace capabilities
    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// Properties
    #[must_use]
    pub fn properties(&self) -> Properties {
        self.properties
    }

    /// Replace properties; the self-managed bit follows the owning backend
    /// and a network emergency flag makes the call an emergency call
    pub fn set_properties(&mut self, properties: Properties) {
        self.properties = if self.self_managed {
            properties.with(Properties::SELF_MANAGED)
        } else {
            properties.without(Properties::SELF_MANAGED)
        };
        if properties.contains(Properties::NETWORK_IDENTIFIED_EMERGENCY_CALL) {
            self.mark_emergency();
        }
    }

    /// Current video state
    #[must_use]
    pub fn video_state(&self) -> VideoState {
        self.video_state
    }

    /// Accumulated video state
    #[must_use]
    pub fn video_state_history(&self) -> VideoState {
        self.video_state_history
    }

    /// Set the video state, folding it into the history
    pub fn set_video_state(&mut self, video_state: VideoState) {
        self.video_state = video_state;
        self.video_state_history |= video_state;
    }

    /// Whether this is an emergency call
    #[must_use]
    pub fn is_emergency(&self) -> bool {
        self.is_emergency
    }

    /// Mark as an emergency call; this cannot be undone
    pub fn mark_emergency(&mut self) {
        self.is_emergency = true;
    }

    /// Whether a local disconnect is waiting for the backend
    #[must_use]
    pub fn is_locally_disconnecting(&self) -> bool {
        self.locally_disconnecting
    }

    /// Set the local-disconnect flag
    pub fn set_locally_disconnecting(&mut self, value: bool) {
        self.locally_disconnecting = value;
    }

    /// Whether ringing was silenced
    #[must_use]
    pub fn is_silenced(&self) -> bool {
        self.silenced
    }

    /// Silence ringing for this call
    pub fn set_silenced(&mut self, silenced: bool) {
        self.silenced = silenced;
    }

    /// Effective disconnect cause
    #[must_use]
    pub fn disconnect_cause(&self) -> &DisconnectCause {
        &self.disconnect_cause
    }

    /// Record the backend's disconnect cause, merged under any override
    pub fn set_disconnect_cause(&mut self, cause: DisconnectCause) {
        self.disconnect_cause = match &self.override_disconnect_cause {
            Some(override_cause) => cause.overridden_by(override_cause),
            None => cause,
        };
    }

    /// Force fields of the cause the backend will report later
    pub fn set_override_disconnect_cause(&mut self, cause: Option<DisconnectCause>) {
        self.override_disconnect_cause = cause;
    }

    /// Replace the remaining backend candidates used for fallback
    pub fn set_connection_candidates(&mut self, candidates: Vec<PhoneAccountHandle>) {
        self.connection_candidates = candidates.into();
    }

    /// Whether untried candidates remain
    #[must_use]
    pub fn has_more_candidates(&self) -> bool {
        !self.connection_candidates.is_empty()
    }

    /// Pop the next candidate and make it the target account
    pub fn advance_to_next_candidate(&mut self) -> Option<PhoneAccountHandle> {
        let next = self.connection_candidates.pop_front()?;
        self.target_account = Some(next.clone());
        self.connection_manager_account = None;
        self.remote_account = None;
        self.disconnect_cause = DisconnectCause::unknown();
        Some(next)
    }

    /// Conference parent
    #[must_use]
    pub fn parent(&self) -> Option<CallId> {
        self.parent
    }

    /// Conference children in join order
    #[must_use]
    pub fn children(&self) -> &[CallId] {
        &self.children
    }

    /// Child marked active at conference level
    #[must_use]
    pub fn conference_level_active_child(&self) -> Option<CallId> {
        self.conference_level_active_child
    }

    pub(crate) fn set_parent_link(&mut self, parent: Option<CallId>) {
        self.parent = parent;
        self.kind = if parent.is_some() {
            CallKind::ConferenceChild
        } else if self.kind == CallKind::ConferenceChild {
            CallKind::Regular
        } else {
            self.kind
        };
    }

    pub(crate) fn add_child_link(&mut self, child: CallId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
        self.kind = CallKind::ConferenceHost;
    }

    pub(crate) fn remove_child_link(&mut self, child: CallId) {
        self.children.retain(|id| *id != child);
        if self.conference_level_active_child == Some(child) {
            self.conference_level_active_child = None;
        }
    }

    /// Swap which child is active at conference level
    ///
    /// One child makes it the active one; two children alternate; any other
    /// number clears the marker.
    pub fn swap_conference_level_active_child(&mut self) -> Option<CallId> {
        self.conference_level_active_child = match self.children.as_slice() {
            [only] => Some(*only),
            [first, second] => {
                if self.conference_level_active_child == Some(*first) {
                    Some(*second)
                } else {
                    Some(*first)
                }
            }
            _ => None,
        };
        self.conference_level_active_child
    }

    /// Handover source of this call
    #[must_use]
    pub fn handover_source(&self) -> Option<CallId> {
        self.handover_source
    }

    /// Handover destination of this call
    #[must_use]
    pub fn handover_destination(&self) -> Option<CallId> {
        self.handover_destination
    }

    /// Handover state
    #[must_use]
    pub fn handover_state(&self) -> HandoverState {
        self.handover_state
    }

    /// Link a handover source; refused while a destination is linked
    pub fn set_handover_source(&mut self, source: Option<CallId>) -> bool {
        if source.is_some() && self.handover_destination.is_some() {
            tracing::warn!(call_id = %self.id, "Call already has a handover destination");
            return false;
        }
        self.handover_source = source;
        true
    }

    /// Link a handover destination; refused while a source is linked
    pub fn set_handover_destination(&mut self, destination: Option<CallId>) -> bool {
        if destination.is_some() && self.handover_source.is_some() {
            tracing::warn!(call_id = %self.id, "Call already has a handover source");
            return false;
        }
        self.handover_destination = destination;
        true
    }

    pub(crate) fn set_handover_state(&mut self, state: HandoverState) {
        self.handover_state = state;
    }

    /// Open an RTT session, replacing any previous one
    pub fn open_rtt(&mut self, buffer: usize) -> &mut RttStreams {
        self.properties = self.properties.with(Properties::RTT);
        self.rtt.insert(RttStreams::open(buffer))
    }

    /// The RTT session, if open
    pub fn rtt_mut(&mut self) -> Option<&mut RttStreams> {
        self.rtt.as_mut()
    }

    /// Close the RTT session
    pub fn close_rtt(&mut self) {
        self.properties = self.properties.without(Properties::RTT);
        self.rtt = None;
    }

    /// Resolved caller information
    #[must_use]
    pub fn caller_info(&self) -> Option<&CallerInfo> {
        self.caller_info.as_ref()
    }

    /// Start a caller-info lookup; only the returned token may complete it
    pub fn begin_caller_info_lookup(&mut self) -> Uuid {
        let token = Uuid::new_v4();
        self.caller_info_token = Some(token);
        token
    }

    /// Complete a caller-info lookup
    ///
    /// Returns `false` and discards `info` when `token` is stale.
    pub fn complete_caller_info_lookup(&mut self, token: Uuid, info: CallerInfo) -> bool {
        if self.caller_info_token != Some(token) {
            return false;
        }
        self.caller_info_token = None;
        self.caller_info = Some(info);
        true
    }

    /// Cancellation token tied to the call's pending pipeline stages
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Cancel every pending stage and arm a fresh token
    pub fn reset_cancellation(&mut self) {
        self.cancel_token.cancel();
        self.cancel_token = CancellationToken::new();
    }

    /// Prepare a pending-disconnect call for reuse by a new dial
    pub(crate) fn reset_for_redial(&mut self, clock: &dyn Clock) {
        self.reset_cancellation();
        self.locally_disconnecting = false;
        self.disconnect_cause = DisconnectCause::unknown();
        self.override_disconnect_cause = None;
        self.connection_candidates.clear();
        self.target_account = None;
        self.self_managed = false;
        self.video_state = VideoState::AUDIO_ONLY;
        self.video_state_history = VideoState::AUDIO_ONLY;
        self.apply_state(CallState::New, clock);
    }

    /// Release held resources when the call leaves the registry
    pub(crate) fn release(&mut self) {
        self.cancel_token.cancel();
        self.rtt = None;
        self.caller_info_token = None;
    }

    /// Read-only view for listeners
    #[must_use]
    pub fn snapshot(&self, clock: &dyn Clock, emergency_in_progress: bool) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            state: self.state,
            direction: self.direction,
            kind: self.kind,
            address: self.address.clone(),
            target_account: self.target_account.clone(),
            parent: self.parent,
            children: self.children.clone(),
            capabilities: self.exposed_capabilities(emergency_in_progress),
            properties: self.properties,
            video_state: self.video_state,
            video_state_history: self.video_state_history,
            is_emergency: self.is_emergency,
            is_self_managed: self.self_managed,
            disconnect_cause: self.disconnect_cause.clone(),
            connect_time_millis: self.connect_time_millis(),
            age_millis: u64::try_from(self.age(clock).as_millis()).unwrap_or(u64::MAX),
            handover_state: self.handover_state,
            caller_info: self.caller_info.clone(),
        }
    }
}
