//! Call orchestration
//!
//! [`CallOrchestrator`] owns every tracked call and is the only place call
//! state changes. Each mutation runs inside one critical section that
//! records an ordered list of effects (events, backend commands, spawned
//! work); the effects are carried out after the lock is released, so
//! backends and listeners may call straight back into the orchestrator.
//!
//! Audio focus messages are the exception: they are queued on the arbiter's
//! unbounded mailbox while the lock is still held, which keeps them in the
//! same order as the mutations that produced them.

mod actions;
mod backend_events;
mod effects;
mod incoming;
mod outgoing;

pub use backend_events::{BackendEvent, ConferenceCallRequest};
pub use incoming::IncomingCallRequest;
pub use outgoing::OutgoingCallRequest;

use crate::accounts::{PhoneAccountHandle, PhoneAccountRegistry};
use crate::audio::coordinator::CallAudioCoordinator;
use crate::audio::focus::{ArbiterError, AudioFocusArbiter, AudioFocusHandle, FocusState};
use crate::audio::{AudioManager, NullAudioManager, Ringer, SilentRinger};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    AllowAllFilter, CallerIdScreening, DirectoryLookup, HeadlessPrompts, IncomingCallFilter,
    NoDirectory, NoSuggestions, RedirectionService, SuggestionService, UserPrompts,
};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::listener::{CallsListener, EventBus};
use crate::registry::CallRegistry;
use crate::types::{
    CallDirection, CallEvent, CallId, CallSnapshot, CallState, CallerInfo, DisconnectCause,
    HandoverFailureReason,
};
use effects::{Effect, Pending, Step};
use futures::future;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No tracked call has this id
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// The call is not in a state that allows the operation
    #[error("Call {call_id} cannot do this while {state}")]
    InvalidState {
        /// Call the operation targeted
        call_id: CallId,
        /// State it was in
        state: CallState,
    },

    /// Admission control or a capability check refused the operation
    #[error("Rejected by policy: {0}")]
    PolicyRejected(String),

    /// No registered account has this handle
    #[error("Account not found: {0}")]
    AccountNotFound(PhoneAccountHandle),

    /// The account has no backend bound to it
    #[error("No backend bound to account {0}")]
    BackendUnavailable(PhoneAccountHandle),

    /// A handover request was refused
    #[error("Handover refused: {0:?}")]
    HandoverRefused(HandoverFailureReason),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The audio focus arbiter has stopped
    #[error(transparent)]
    AudioFocus(#[from] ArbiterError),
}

struct Collaborators {
    suggestions: Arc<dyn SuggestionService>,
    directory: Arc<dyn DirectoryLookup>,
    screening: Option<Arc<dyn CallerIdScreening>>,
    filter: Arc<dyn IncomingCallFilter>,
    redirection: Option<Arc<dyn RedirectionService>>,
    prompts: Arc<dyn UserPrompts>,
}

struct State {
    registry: CallRegistry,
    coordinator: CallAudioCoordinator,
    pending: Pending,
}

struct Inner {
    state: Mutex<State>,
    accounts: Arc<PhoneAccountRegistry>,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    audio_focus: AudioFocusHandle,
    collaborators: Collaborators,
    runtime: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.audio_focus.cancel();
    }
}

/// The call session orchestrator
///
/// Cheap to clone; every clone drives the same set of calls.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    /// Start building an orchestrator over `accounts`
    #[must_use]
    pub fn builder(accounts: Arc<PhoneAccountRegistry>) -> CallOrchestratorBuilder {
        CallOrchestratorBuilder::new(accounts)
    }

    /// Run one serialized mutation step and then carry out its effects
    fn run<R>(&self, f: impl FnOnce(&mut Step<'_>) -> R) -> R {
        let (result, effects) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut step = Step::new(
                &mut state.registry,
                &mut state.coordinator,
                &mut state.pending,
                &self.inner.accounts,
                self.inner.clock.as_ref(),
                &self.inner.config,
            );
            let result = f(&mut step);
            let effects = step.into_effects();

            for (message, facts) in state.coordinator.update(&state.registry) {
                self.inner.audio_focus.send(message, facts);
            }
            (result, effects)
        };
        self.execute(effects);
        result
    }

    fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => self.inner.events.publish(event),
                Effect::Backend {
                    call_id,
                    service,
                    command,
                } => command.dispatch(&service, call_id),
                Effect::Connect(call_id) => {
                    let this = self.clone();
                    self.inner.runtime.spawn(async move {
                        this.connect(call_id).await;
                    });
                }
                Effect::ScheduleTeardown { call_id, token } => {
                    let this = self.clone();
                    let grace = self.inner.config.timeouts.pending_disconnect_grace();
                    self.inner.runtime.spawn(async move {
                        tokio::select! {
                            () = token.cancelled() => {
                                tracing::debug!(call_id = %call_id, "Pending disconnect superseded");
                            }
                            () = tokio::time::sleep(grace) => {
                                this.run(|step| step.teardown_pending(call_id));
                            }
                        }
                    });
                }
            }
        }
    }

    /// Create the backend connection for a call already in `Connecting` (or
    /// `New` for incoming calls)
    ///
    /// Returns `true` when the backend accepted the request.
    async fn connect(&self, call_id: CallId) -> bool {
        let Some((service, request, token)) = self.run(|step| step.prepare_connection(call_id))
        else {
            return false;
        };
        tracing::debug!(call_id = %call_id, account = %request.account, "Creating connection");

        let result = until_cancelled(&token, service.create_connection(request)).await;
        match result {
            None => {
                tracing::debug!(call_id = %call_id, "Connection attempt cancelled");
                false
            }
            Some(Ok(())) => true,
            Some(Err(cause)) => {
                tracing::error!(call_id = %call_id, cause = ?cause, "Connection failed");
                self.run(|step| step.fail_connection(call_id, cause));
                false
            }
        }
    }

    /// Resolve display metadata for a call's address in the background
    ///
    /// Never blocks or fails the call; a newer lookup makes this one stale.
    fn spawn_caller_info_lookup(&self, call_id: CallId) {
        let started = self.run(|step| {
            let call = step.registry.get_mut(call_id)?;
            let address = call.address()?.to_string();
            let outgoing = call.direction() == CallDirection::Outgoing;
            Some((call.begin_caller_info_lookup(), address, outgoing, call.cancel_token()))
        });
        let Some((lookup_token, address, outgoing, cancel)) = started else {
            return;
        };

        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let limit = this.inner.config.timeouts.lookup();
            let directory = Arc::clone(&this.inner.collaborators.directory);
            let screening = this
                .inner
                .collaborators
                .screening
                .clone()
                .filter(|_| outgoing);

            let lookup = async {
                tokio::time::timeout(limit, directory.lookup(&address))
                    .await
                    .unwrap_or_else(|_| {
                        tracing::debug!(call_id = %call_id, "Directory lookup timed out");
                        None
                    })
            };
            let screen = async {
                match &screening {
                    Some(screening) => tokio::time::timeout(limit, screening.screen_outgoing(call_id, &address))
                        .await
                        .ok()
                        .flatten(),
                    None => None,
                }
            };
            let Some((found, screened)) = until_cancelled(&cancel, future::join(lookup, screen)).await
            else {
                return;
            };

            let info = match (found, screened) {
                (found, Some(screened)) => Some(merge_caller_info(found, screened)),
                (found, None) => found,
            };
            if let Some(info) = info {
                this.run(|step| step.complete_caller_info(call_id, lookup_token, info));
            }
        });
    }

    /// Disconnect a call whose pipeline stage failed, unless a disconnect
    /// or redial already cancelled the stage
    fn abandon(&self, call_id: CallId, token: &CancellationToken, cause: DisconnectCause) {
        if token.is_cancelled() {
            return;
        }
        tracing::info!(call_id = %call_id, cause = ?cause, "Abandoning call setup");
        self.run(|step| step.disconnect_locally(call_id, cause));
    }

    fn is_alive(&self, call_id: CallId) -> bool {
        self.run(|step| step.registry.get(call_id).is_some_and(|call| call.is_alive()))
    }

    /// Snapshot of one call
    #[must_use]
    pub fn call(&self, call_id: CallId) -> Option<CallSnapshot> {
        let state = self.inner.state.lock();
        state.registry.snapshot(call_id, self.inner.clock.as_ref())
    }

    /// Snapshots of every tracked call in creation order
    #[must_use]
    pub fn calls(&self) -> Vec<CallSnapshot> {
        let state = self.inner.state.lock();
        state.registry.snapshots(self.inner.clock.as_ref())
    }

    /// Whether an emergency call is in progress
    #[must_use]
    pub fn is_in_emergency_call(&self) -> bool {
        self.inner.state.lock().registry.is_in_emergency_call()
    }

    /// Current audio focus state
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::AudioFocus` if the arbiter has stopped.
    pub async fn audio_focus_state(&self) -> Result<FocusState, OrchestratorError> {
        Ok(self.inner.audio_focus.current_state().await?)
    }

    /// Subscribe to the event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Register a synchronous listener
    pub fn add_listener(&self, listener: Arc<dyn CallsListener>) {
        self.inner.events.add_listener(listener);
    }

    /// Unregister a listener
    pub fn remove_listener(&self, listener: &Arc<dyn CallsListener>) {
        self.inner.events.remove_listener(listener);
    }

    /// Account registry
    #[must_use]
    pub fn accounts(&self) -> &Arc<PhoneAccountRegistry> {
        &self.inner.accounts
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Stop the audio focus arbiter
    ///
    /// Calls keep working; audio focus is no longer driven.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down call orchestrator");
        self.inner.audio_focus.cancel();
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("calls", &self.inner.state.lock().registry.len())
            .field("audio_focus", &self.inner.audio_focus)
            .finish()
    }
}

/// Directory results win; screening fills the gaps
fn merge_caller_info(directory: Option<CallerInfo>, screened: CallerInfo) -> CallerInfo {
    match directory {
        None => screened,
        Some(found) => CallerInfo {
            name: found.name.or(screened.name),
            number_label: found.number_label.or(screened.number_label),
            is_contact: found.is_contact,
        },
    }
}

/// Wait for `future` unless `token` is cancelled first
async fn until_cancelled<F: Future>(token: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        () = token.cancelled() => None,
        output = future => Some(output),
    }
}

/// Builder for [`CallOrchestrator`]
pub struct CallOrchestratorBuilder {
    accounts: Arc<PhoneAccountRegistry>,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    audio: Arc<dyn AudioManager>,
    ringer: Arc<dyn Ringer>,
    suggestions: Arc<dyn SuggestionService>,
    directory: Arc<dyn DirectoryLookup>,
    screening: Option<Arc<dyn CallerIdScreening>>,
    filter: Arc<dyn IncomingCallFilter>,
    redirection: Option<Arc<dyn RedirectionService>>,
    prompts: Arc<dyn UserPrompts>,
}

impl CallOrchestratorBuilder {
    /// Builder with default configuration and inert collaborators
    #[must_use]
    pub fn new(accounts: Arc<PhoneAccountRegistry>) -> Self {
        Self {
            accounts,
            config: OrchestratorConfig::default(),
            clock: Arc::new(SystemClock::new()),
            audio: Arc::new(NullAudioManager),
            ringer: Arc::new(SilentRinger),
            suggestions: Arc::new(NoSuggestions),
            directory: Arc::new(NoDirectory),
            screening: None,
            filter: Arc::new(AllowAllFilter),
            redirection: None,
            prompts: Arc::new(HeadlessPrompts),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the audio hardware driven by the focus arbiter
    #[must_use]
    pub fn with_audio(mut self, audio: Arc<dyn AudioManager>, ringer: Arc<dyn Ringer>) -> Self {
        self.audio = audio;
        self.ringer = ringer;
        self
    }

    /// Set the account suggestion service
    #[must_use]
    pub fn with_suggestions(mut self, suggestions: Arc<dyn SuggestionService>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Set the directory used for caller information
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DirectoryLookup>) -> Self {
        self.directory = directory;
        self
    }

    /// Set the outgoing caller-ID screening service
    #[must_use]
    pub fn with_screening(mut self, screening: Arc<dyn CallerIdScreening>) -> Self {
        self.screening = Some(screening);
        self
    }

    /// Set the incoming-call filter
    #[must_use]
    pub fn with_incoming_filter(mut self, filter: Arc<dyn IncomingCallFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Set the outgoing address redirection service
    #[must_use]
    pub fn with_redirection(mut self, redirection: Arc<dyn RedirectionService>) -> Self {
        self.redirection = Some(redirection);
        self
    }

    /// Set the user prompt surface
    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<dyn UserPrompts>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Build the orchestrator and start its audio focus arbiter
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` when the configuration is invalid.
    pub fn build(self) -> Result<CallOrchestrator, OrchestratorError> {
        self.config.validate()?;
        let runtime = Handle::current();
        let (audio_focus, _task) =
            AudioFocusArbiter::spawn(self.audio, self.ringer, CancellationToken::new());

        tracing::info!(
            accounts = self.accounts.len(),
            max_live_calls = self.config.admission.max_live_calls,
            "Call orchestrator started"
        );

        Ok(CallOrchestrator {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    registry: CallRegistry::new(),
                    coordinator: CallAudioCoordinator::new(),
                    pending: Pending::default(),
                }),
                events: EventBus::new(self.config.event_channel_capacity),
                accounts: self.accounts,
                config: self.config,
                clock: self.clock,
                audio_focus,
                collaborators: Collaborators {
                    suggestions: self.suggestions,
                    directory: self.directory,
                    screening: self.screening,
                    filter: self.filter,
                    redirection: self.redirection,
                    prompts: self.prompts,
                },
                runtime,
            }),
        })
    }
}

impl std::fmt::Debug for CallOrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestratorBuilder")
            .field("config", &self.config)
            .field("screening", &self.screening.is_some())
            .field("redirection", &self.redirection.is_some())
            .finish()
    }
}
