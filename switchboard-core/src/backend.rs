//! Binding to call-handling backends

use crate::accounts::PhoneAccountHandle;
use crate::types::{CallId, DisconnectCause, VideoState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request to create a connection for a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Call the connection belongs to
    pub call_id: CallId,
    /// Account to place or receive the call on
    pub account: PhoneAccountHandle,
    /// Remote address
    pub address: Option<String>,
    /// Requested video state
    pub video_state: VideoState,
    /// Whether the connection is for an incoming call
    pub is_incoming: bool,
    /// Whether the call is an emergency call
    pub is_emergency: bool,
    /// Source call when this connection is a handover destination
    pub handover_from: Option<CallId>,
}

/// Request to create an ad-hoc conference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceRequest {
    /// Conference host call
    pub call_id: CallId,
    /// Account hosting the conference
    pub account: PhoneAccountHandle,
    /// Addresses to invite
    pub participants: Vec<String>,
}

/// A call-handling backend
///
/// Connection creation reports failure as a [`DisconnectCause`]. Per-call
/// verbs are one-way: outcomes come back as backend events.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    /// Create a connection for an outgoing, incoming or handover call
    async fn create_connection(&self, request: ConnectionRequest) -> Result<(), DisconnectCause>;

    /// Create an ad-hoc conference
    async fn create_conference(&self, request: ConferenceRequest) -> Result<(), DisconnectCause>;

    /// Abandon a connection that is still being created
    fn abort(&self, call_id: CallId);

    /// Answer a ringing call
    fn answer(&self, call_id: CallId, video_state: VideoState);

    /// Reject a ringing call
    fn reject(&self, call_id: CallId, message: Option<&str>);

    /// Disconnect a call
    fn disconnect(&self, call_id: CallId);

    /// Put a call on hold
    fn hold(&self, call_id: CallId);

    /// Resume a held call
    fn unhold(&self, call_id: CallId);

    /// Transfer a call to `target`
    fn transfer(&self, call_id: CallId, target: &str, confirm: bool);

    /// Merge `call_id` with `other` into a conference
    fn conference(&self, call_id: CallId, other: CallId);

    /// Split a leg out of its conference
    fn split_from_conference(&self, call_id: CallId);

    /// Merge the legs of a conference
    fn merge_conference(&self, call_id: CallId);

    /// Swap the active leg of a conference
    fn swap_conference(&self, call_id: CallId);

    /// Deliver an application event to the backend
    fn send_event(&self, call_id: CallId, event: &str, extras: &serde_json::Value);

    /// Accept or decline a remote real-time text request
    fn respond_to_rtt_request(&self, call_id: CallId, request_id: u32, accept: bool);
}

/// One-way command queued for a backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    /// See [`ConnectionService::abort`]
    Abort,
    /// See [`ConnectionService::answer`]
    Answer(VideoState),
    /// See [`ConnectionService::reject`]
    Reject(Option<String>),
    /// See [`ConnectionService::disconnect`]
    Disconnect,
    /// See [`ConnectionService::hold`]
    Hold,
    /// See [`ConnectionService::unhold`]
    Unhold,
    /// See [`ConnectionService::transfer`]
    Transfer {
        /// Transfer target
        target: String,
        /// Consultative transfer
        confirm: bool,
    },
    /// See [`ConnectionService::conference`]
    Conference(CallId),
    /// See [`ConnectionService::split_from_conference`]
    SplitFromConference,
    /// See [`ConnectionService::merge_conference`]
    MergeConference,
    /// See [`ConnectionService::swap_conference`]
    SwapConference,
    /// See [`ConnectionService::send_event`]
    SendEvent {
        /// Event name
        event: String,
        /// Event payload
        extras: serde_json::Value,
    },
    /// See [`ConnectionService::respond_to_rtt_request`]
    RespondToRttRequest {
        /// Backend request identifier
        request_id: u32,
        /// Whether the request was accepted
        accept: bool,
    },
}

impl BackendCommand {
    /// Invoke the command on `service`
    pub fn dispatch(&self, service: &Arc<dyn ConnectionService>, call_id: CallId) {
        tracing::debug!(call_id = %call_id, command = ?self, "Dispatching backend command");
        match self {
            Self::Abort => service.abort(call_id),
            Self::Answer(video_state) => service.answer(call_id, *video_state),
            Self::Reject(message) => service.reject(call_id, message.as_deref()),
            Self::Disconnect => service.disconnect(call_id),
            Self::Hold => service.hold(call_id),
            Self::Unhold => service.unhold(call_id),
            Self::Transfer { target, confirm } => service.transfer(call_id, target, *confirm),
            Self::Conference(other) => service.conference(call_id, *other),
            Self::SplitFromConference => service.split_from_conference(call_id),
            Self::MergeConference => service.merge_conference(call_id),
            Self::SwapConference => service.swap_conference(call_id),
            Self::SendEvent { event, extras } => service.send_event(call_id, event, extras),
            Self::RespondToRttRequest { request_id, accept } => {
                service.respond_to_rtt_request(call_id, *request_id, *accept);
            }
        }
    }
}
