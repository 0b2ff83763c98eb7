//! In-process stand-ins for every collaborator
//!
//! The loopback backend and the recording fakes let the orchestrator run
//! without real backends, audio hardware or users. Tests and the CLI demos
//! drive them and inspect what they recorded.

use crate::audio::{AudioManager, AudioMode, FocusType, Ringer};
use crate::backend::{BackendCommand, ConferenceRequest, ConnectionRequest, ConnectionService};
use crate::collaborators::{
    AccountSuggestion, DirectoryLookup, FilterVerdict, IncomingCallDetails, IncomingCallFilter,
    RedirectionService, SuggestionService, UserPrompts,
};
use crate::accounts::PhoneAccountHandle;
use crate::listener::CallsListener;
use crate::types::{CallEvent, CallId, CallState, CallerInfo, DisconnectCause, VideoState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Something the orchestrator asked the loopback backend to do
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRequest {
    /// `create_connection` was called
    CreateConnection(ConnectionRequest),
    /// `create_conference` was called
    CreateConference(ConferenceRequest),
    /// A one-way verb was called
    Command {
        /// Target call
        call_id: CallId,
        /// The verb
        command: BackendCommand,
    },
}

/// Backend that records every request and answers connection attempts
/// from a script
#[derive(Debug, Default)]
pub struct LoopbackConnectionService {
    requests: Mutex<Vec<BackendRequest>>,
    connection_results: Mutex<VecDeque<Result<(), DisconnectCause>>>,
    connection_delay: Mutex<Option<Duration>>,
}

impl LoopbackConnectionService {
    /// Backend whose connection attempts all succeed immediately
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next connection attempt
    pub fn push_connection_result(&self, result: Result<(), DisconnectCause>) {
        self.connection_results.lock().push_back(result);
    }

    /// Delay every connection attempt
    pub fn set_connection_delay(&self, delay: Option<Duration>) {
        *self.connection_delay.lock() = delay;
    }

    /// Every request so far
    #[must_use]
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }

    /// Connection requests so far
    #[must_use]
    pub fn connection_requests(&self) -> Vec<ConnectionRequest> {
        self.requests
            .lock()
            .iter()
            .filter_map(|request| match request {
                BackendRequest::CreateConnection(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Verbs sent for one call
    #[must_use]
    pub fn commands_for(&self, call_id: CallId) -> Vec<BackendCommand> {
        self.requests
            .lock()
            .iter()
            .filter_map(|request| match request {
                BackendRequest::Command {
                    call_id: id,
                    command,
                } if *id == call_id => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call_id: CallId, command: BackendCommand) {
        self.requests
            .lock()
            .push(BackendRequest::Command { call_id, command });
    }
}

#[async_trait]
impl ConnectionService for LoopbackConnectionService {
    async fn create_connection(&self, request: ConnectionRequest) -> Result<(), DisconnectCause> {
        self.requests
            .lock()
            .push(BackendRequest::CreateConnection(request));
        let delay = *self.connection_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.connection_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn create_conference(&self, request: ConferenceRequest) -> Result<(), DisconnectCause> {
        self.requests
            .lock()
            .push(BackendRequest::CreateConference(request));
        Ok(())
    }

    fn abort(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::Abort);
    }

    fn answer(&self, call_id: CallId, video_state: VideoState) {
        self.record(call_id, BackendCommand::Answer(video_state));
    }

    fn reject(&self, call_id: CallId, message: Option<&str>) {
        self.record(call_id, BackendCommand::Reject(message.map(str::to_string)));
    }

    fn disconnect(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::Disconnect);
    }

    fn hold(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::Hold);
    }

    fn unhold(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::Unhold);
    }

    fn transfer(&self, call_id: CallId, target: &str, confirm: bool) {
        self.record(
            call_id,
            BackendCommand::Transfer {
                target: target.to_string(),
                confirm,
            },
        );
    }

    fn conference(&self, call_id: CallId, other: CallId) {
        self.record(call_id, BackendCommand::Conference(other));
    }

    fn split_from_conference(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::SplitFromConference);
    }

    fn merge_conference(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::MergeConference);
    }

    fn swap_conference(&self, call_id: CallId) {
        self.record(call_id, BackendCommand::SwapConference);
    }

    fn send_event(&self, call_id: CallId, event: &str, extras: &serde_json::Value) {
        self.record(
            call_id,
            BackendCommand::SendEvent {
                event: event.to_string(),
                extras: extras.clone(),
            },
        );
    }

    fn respond_to_rtt_request(&self, call_id: CallId, request_id: u32, accept: bool) {
        self.record(
            call_id,
            BackendCommand::RespondToRttRequest { request_id, accept },
        );
    }
}

/// One operation performed on the audio manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOp {
    /// `request_focus`
    RequestFocus(FocusType),
    /// `abandon_focus`
    AbandonFocus,
    /// `set_mode`
    SetMode(AudioMode),
}

/// Audio manager that records operations
#[derive(Debug, Default)]
pub struct RecordingAudioManager {
    ops: Mutex<Vec<AudioOp>>,
}

impl RecordingAudioManager {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain recorded operations
    pub fn take(&self) -> Vec<AudioOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Recorded operations, leaving them in place
    #[must_use]
    pub fn ops(&self) -> Vec<AudioOp> {
        self.ops.lock().clone()
    }
}

impl AudioManager for RecordingAudioManager {
    fn request_focus(&self, focus: FocusType) {
        self.ops.lock().push(AudioOp::RequestFocus(focus));
    }

    fn abandon_focus(&self) {
        self.ops.lock().push(AudioOp::AbandonFocus);
    }

    fn set_mode(&self, mode: AudioMode) {
        self.ops.lock().push(AudioOp::SetMode(mode));
    }
}

/// Ringer with a fixed audibility
#[derive(Debug, Default)]
pub struct ScriptedRinger {
    audible: bool,
    ringing: AtomicBool,
    call_waiting: AtomicBool,
}

impl ScriptedRinger {
    /// Ringer whose ringtone is audible or silent
    #[must_use]
    pub fn new(audible: bool) -> Self {
        Self {
            audible,
            ..Self::default()
        }
    }

    /// Whether the call-waiting tone is playing
    #[must_use]
    pub fn is_call_waiting(&self) -> bool {
        self.call_waiting.load(Ordering::SeqCst)
    }
}

impl Ringer for ScriptedRinger {
    fn start_ringing(&self) -> bool {
        self.ringing.store(self.audible, Ordering::SeqCst);
        self.audible
    }

    fn stop_ringing(&self) {
        self.ringing.store(false, Ordering::SeqCst);
    }

    fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }

    fn start_call_waiting(&self) {
        self.call_waiting.store(true, Ordering::SeqCst);
    }

    fn stop_call_waiting(&self) {
        self.call_waiting.store(false, Ordering::SeqCst);
    }
}

/// A prompt shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptRequest {
    /// Account picker
    AccountPicker {
        /// Call waiting for an account
        call_id: CallId,
        /// Offered accounts
        suggestions: Vec<AccountSuggestion>,
    },
    /// Drop-call confirmation
    DropOngoingCall {
        /// Call waiting to proceed
        call_id: CallId,
        /// Call that would be dropped
        ongoing: CallId,
    },
    /// Redirection confirmation
    Redirection {
        /// Call being redirected
        call_id: CallId,
        /// Dialed address
        original: String,
        /// Proposed address
        redirected: String,
    },
}

impl PromptRequest {
    /// Call the prompt is about
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::AccountPicker { call_id, .. }
            | Self::DropOngoingCall { call_id, .. }
            | Self::Redirection { call_id, .. } => *call_id,
        }
    }
}

/// Prompt surface that forwards every prompt to a channel
#[derive(Debug)]
pub struct RecordingPrompts {
    sender: mpsc::UnboundedSender<PromptRequest>,
}

impl RecordingPrompts {
    /// Create the surface and the receiving end a test or demo answers from
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PromptRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, request: PromptRequest) {
        let _ = self.sender.send(request);
    }
}

impl UserPrompts for RecordingPrompts {
    fn show_account_picker(&self, call_id: CallId, suggestions: &[AccountSuggestion]) {
        self.forward(PromptRequest::AccountPicker {
            call_id,
            suggestions: suggestions.to_vec(),
        });
    }

    fn confirm_drop_ongoing_call(&self, call_id: CallId, ongoing: CallId, _ongoing_label: &str) {
        self.forward(PromptRequest::DropOngoingCall { call_id, ongoing });
    }

    fn confirm_redirection(&self, call_id: CallId, original: &str, redirected: &str) {
        self.forward(PromptRequest::Redirection {
            call_id,
            original: original.to_string(),
            redirected: redirected.to_string(),
        });
    }
}

/// Suggestion service returning a fixed ranking after an optional delay
#[derive(Debug, Default)]
pub struct StaticSuggestions {
    ranking: Vec<AccountSuggestion>,
    delay: Option<Duration>,
}

impl StaticSuggestions {
    /// Rank accounts in the order given
    #[must_use]
    pub fn new(ranking: Vec<AccountSuggestion>) -> Self {
        Self {
            ranking,
            delay: None,
        }
    }

    /// Answer only after `delay`
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl SuggestionService for StaticSuggestions {
    async fn suggest(
        &self,
        _address: &str,
        accounts: &[PhoneAccountHandle],
    ) -> Vec<AccountSuggestion> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.ranking
            .iter()
            .filter(|suggestion| accounts.contains(&suggestion.handle))
            .cloned()
            .collect()
    }
}

/// Directory backed by a map
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, CallerInfo>,
    delay: Option<Duration>,
}

impl StaticDirectory {
    /// Directory knowing `entries`
    #[must_use]
    pub fn new(entries: HashMap<String, CallerInfo>) -> Self {
        Self {
            entries,
            delay: None,
        }
    }

    /// Answer only after `delay`
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl DirectoryLookup for StaticDirectory {
    async fn lookup(&self, address: &str) -> Option<CallerInfo> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.entries.get(address).cloned()
    }
}

/// Incoming-call filter with a fixed verdict
#[derive(Debug)]
pub struct FixedVerdictFilter(pub FilterVerdict);

#[async_trait]
impl IncomingCallFilter for FixedVerdictFilter {
    async fn filter(&self, _call: &IncomingCallDetails) -> FilterVerdict {
        self.0
    }
}

/// Redirection service rewriting every address to one target
#[derive(Debug)]
pub struct FixedRedirection(pub String);

#[async_trait]
impl RedirectionService for FixedRedirection {
    async fn redirect(&self, address: &str, _account: Option<&PhoneAccountHandle>) -> Option<String> {
        (address != self.0).then(|| self.0.clone())
    }
}

/// Listener that keeps every event
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingListener {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far
    #[must_use]
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    /// States `call_id` moved through, in order
    #[must_use]
    pub fn states_of(&self, call_id: CallId) -> Vec<CallState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallEvent::CallStateChanged {
                    call_id: id,
                    new_state,
                    ..
                } if *id == call_id => Some(*new_state),
                _ => None,
            })
            .collect()
    }

    /// Final snapshot of a removed call
    #[must_use]
    pub fn removed(&self, call_id: CallId) -> Option<crate::types::CallSnapshot> {
        self.events.lock().iter().find_map(|event| match event {
            CallEvent::CallRemoved { call } if call.call_id == call_id => Some(call.clone()),
            _ => None,
        })
    }
}

impl CallsListener for RecordingListener {
    fn on_call_event(&self, event: &CallEvent) {
        self.events.lock().push(event.clone());
    }
}
