//! Audio focus state machine
//!
//! One [`FocusStateMachine`] per device decides which audio mode is in use
//! and who holds audio focus. Every message carries a [`FocusFacts`]
//! snapshot of the call population taken when the message was produced, so
//! the machine never reads call state itself.
//!
//! ```text
//!                    ┌──────────── NewRingingCall ────────────┐
//!                    │                                        ▼
//!   Unfocused ◄──► AudioProcessing                         Ringing
//!      ▲  │                                                   │
//!      │  └── NewActiveOrDialingCall ──► SimCall ⇄ VoipCall ◄──┘
//!      │                                    │
//!      └────────── NoMore* (proper state) ── Other (holding / tone)
//! ```
//!
//! [`AudioFocusArbiter`] runs the machine on its own task behind an
//! unbounded mailbox.

use super::{AudioManager, AudioMode, FocusType, Ringer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Audio focus state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusState {
    /// No call needs audio
    Unfocused,
    /// A call's audio is routed to a screening process
    AudioProcessing,
    /// An incoming call is ringing
    Ringing,
    /// A cellular call is active or dialing
    SimCall,
    /// A VoIP call is active or dialing
    VoipCall,
    /// Calls are held or a tone is playing
    Other,
}

/// Population facts delivered with every message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusFacts {
    /// Some call is active, dialing, connecting or pulling
    pub has_active_or_dialing: bool,
    /// Some call is ringing
    pub has_ringing: bool,
    /// Some call is on hold
    pub has_holding: bool,
    /// Some call is in audio processing
    pub has_audio_processing: bool,
    /// An in-call tone is playing
    pub is_tone_playing: bool,
    /// The foreground call wants VoIP audio handling
    pub foreground_call_is_voip: bool,
}

/// Input to the focus state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusMessage {
    /// Last active or dialing call left that category
    NoMoreActiveOrDialingCalls,
    /// Last ringing call left that category
    NoMoreRingingCalls,
    /// Last held call left that category
    NoMoreHoldingCalls,
    /// Last audio-processing call left that category
    NoMoreAudioProcessingCalls,
    /// A call became active or started dialing
    NewActiveOrDialingCall,
    /// A call started ringing
    NewRingingCall,
    /// A call was put on hold
    NewHoldingCall,
    /// A call entered audio processing
    NewAudioProcessingCall,
    /// An in-call tone started
    ToneStartedPlaying,
    /// The in-call tone stopped
    ToneStoppedPlaying,
    /// The foreground call switched between VoIP and cellular audio
    ForegroundVoipModeChange,
    /// The ringer volume or mode changed
    RingerModeChange,
    /// The audio route finished reacting to the last change
    AudioOperationsComplete,
    /// Enable enter actions of the unfocused state
    Initialize,
}

/// The state the facts call for
///
/// Active or dialing calls win, then held calls, then ringing, then a
/// playing tone, then audio processing.
#[must_use]
pub fn calculate_proper_state(facts: &FocusFacts) -> FocusState {
    if facts.has_active_or_dialing {
        active_call_state(facts)
    } else if facts.has_holding {
        FocusState::Other
    } else if facts.has_ringing {
        FocusState::Ringing
    } else if facts.is_tone_playing {
        FocusState::Other
    } else if facts.has_audio_processing {
        FocusState::AudioProcessing
    } else {
        FocusState::Unfocused
    }
}

fn active_call_state(facts: &FocusFacts) -> FocusState {
    if facts.foreground_call_is_voip {
        FocusState::VoipCall
    } else {
        FocusState::SimCall
    }
}

/// Synchronous audio focus state machine
pub struct FocusStateMachine {
    state: FocusState,
    most_recent_mode: AudioMode,
    initialized: bool,
    ringing_focus_held: bool,
    abandon_pending: bool,
    audio: Arc<dyn AudioManager>,
    ringer: Arc<dyn Ringer>,
}

impl FocusStateMachine {
    /// Create an uninitialized machine in `Unfocused`
    pub fn new(audio: Arc<dyn AudioManager>, ringer: Arc<dyn Ringer>) -> Self {
        Self {
            state: FocusState::Unfocused,
            most_recent_mode: AudioMode::Normal,
            initialized: false,
            ringing_focus_held: false,
            abandon_pending: false,
            audio,
            ringer,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> FocusState {
        self.state
    }

    /// Whether a focus release is waiting for `AudioOperationsComplete`
    #[must_use]
    pub fn is_abandon_pending(&self) -> bool {
        self.abandon_pending
    }

    /// Process one message
    pub fn handle(&mut self, message: FocusMessage, facts: &FocusFacts) {
        use FocusMessage as M;
        use FocusState as S;

        if !Self::facts_agree(message, facts) {
            tracing::warn!(message = ?message, facts = ?facts, state = ?self.state, "Audio focus message contradicts facts");
            self.transition_to(calculate_proper_state(facts));
            return;
        }

        match (message, self.state) {
            (M::Initialize, _) => {
                self.initialized = true;
            }

            (M::AudioOperationsComplete, S::Unfocused | S::AudioProcessing) => {
                if self.abandon_pending {
                    tracing::debug!(state = ?self.state, "Releasing audio focus");
                    self.audio.abandon_focus();
                    self.abandon_pending = false;
                }
            }
            (M::AudioOperationsComplete, _) => {}

            (M::NewActiveOrDialingCall, S::SimCall | S::VoipCall) => {}
            (M::NewActiveOrDialingCall, _) => self.transition_to(active_call_state(facts)),

            (M::NewRingingCall, S::Ringing) | (M::RingerModeChange, S::Ringing) => {
                self.try_start_ringing();
            }
            (M::NewRingingCall, S::SimCall | S::VoipCall | S::Other) => {
                self.ringer.start_call_waiting();
            }
            (M::NewRingingCall, S::Unfocused | S::AudioProcessing) => {
                self.transition_to(S::Ringing);
            }
            (M::RingerModeChange, _) => {}

            (M::NewHoldingCall, S::SimCall | S::VoipCall | S::Other) => {}
            (M::NewHoldingCall, _) => self.transition_to(S::Other),

            (M::NewAudioProcessingCall, S::AudioProcessing) => {
                tracing::warn!("Duplicate audio processing call notification");
            }
            (M::NewAudioProcessingCall, S::Unfocused) => self.transition_to(S::AudioProcessing),
            (M::NewAudioProcessingCall, _) => {}

            (M::NoMoreRingingCalls, S::SimCall | S::VoipCall | S::Other) => {
                self.ringer.stop_call_waiting();
                self.transition_to(calculate_proper_state(facts));
            }
            (
                M::NoMoreActiveOrDialingCalls
                | M::NoMoreRingingCalls
                | M::NoMoreHoldingCalls
                | M::NoMoreAudioProcessingCalls,
                _,
            ) => self.transition_to(calculate_proper_state(facts)),

            (M::ToneStartedPlaying, S::Unfocused | S::AudioProcessing) => {
                self.transition_to(S::Other);
            }
            (M::ToneStartedPlaying, _) => {}
            (M::ToneStoppedPlaying, S::Other) => {
                self.transition_to(calculate_proper_state(facts));
            }
            (M::ToneStoppedPlaying, _) => {}

            (M::ForegroundVoipModeChange, S::SimCall | S::VoipCall) => {
                self.transition_to(active_call_state(facts));
            }
            (M::ForegroundVoipModeChange, _) => {}
        }
    }

    fn facts_agree(message: FocusMessage, facts: &FocusFacts) -> bool {
        match message {
            FocusMessage::NewActiveOrDialingCall => facts.has_active_or_dialing,
            FocusMessage::NewRingingCall => facts.has_ringing,
            FocusMessage::NewHoldingCall => facts.has_holding,
            FocusMessage::NewAudioProcessingCall => facts.has_audio_processing,
            FocusMessage::NoMoreActiveOrDialingCalls => !facts.has_active_or_dialing,
            FocusMessage::NoMoreRingingCalls => !facts.has_ringing,
            FocusMessage::NoMoreHoldingCalls => !facts.has_holding,
            FocusMessage::NoMoreAudioProcessingCalls => !facts.has_audio_processing,
            FocusMessage::ToneStartedPlaying => facts.is_tone_playing,
            FocusMessage::ToneStoppedPlaying => !facts.is_tone_playing,
            _ => true,
        }
    }

    fn transition_to(&mut self, target: FocusState) {
        if target == self.state {
            return;
        }
        tracing::debug!(old_state = ?self.state, new_state = ?target, "Audio focus transition");
        if self.state == FocusState::Ringing {
            self.ringer.stop_ringing();
            self.ringing_focus_held = false;
        }
        self.state = target;
        self.enter();
    }

    fn enter(&mut self) {
        match self.state {
            FocusState::Unfocused => {
                if self.initialized {
                    self.ringer.stop_ringing();
                    self.ringer.stop_call_waiting();
                    self.set_mode(AudioMode::Normal);
                    self.abandon_pending = true;
                }
            }
            FocusState::AudioProcessing => {
                self.ringer.stop_ringing();
                self.ringer.stop_call_waiting();
                self.set_mode(AudioMode::CallScreening);
                self.abandon_pending = true;
            }
            FocusState::Ringing => {
                self.ringer.stop_call_waiting();
                self.try_start_ringing();
            }
            FocusState::SimCall => self.enter_call_state(AudioMode::InCall),
            FocusState::VoipCall => self.enter_call_state(AudioMode::InCommunication),
            FocusState::Other => {
                self.request_focus(FocusType::VoiceCall);
                self.audio.set_mode(self.most_recent_mode);
            }
        }
    }

    fn enter_call_state(&mut self, mode: AudioMode) {
        self.ringer.stop_ringing();
        self.ringer.stop_call_waiting();
        self.request_focus(FocusType::VoiceCall);
        self.set_mode(mode);
    }

    fn try_start_ringing(&mut self) {
        if self.ringing_focus_held && self.ringer.is_ringing() {
            tracing::debug!("Already ringing with focus held");
            return;
        }
        if self.ringer.start_ringing() {
            self.request_focus(FocusType::Ring);
            self.set_mode(AudioMode::Ringtone);
            self.ringing_focus_held = true;
        } else {
            tracing::debug!("Ringtone is silent, not requesting focus");
        }
    }

    fn request_focus(&mut self, focus: FocusType) {
        self.abandon_pending = false;
        self.audio.request_focus(focus);
    }

    fn set_mode(&mut self, mode: AudioMode) {
        self.most_recent_mode = mode;
        self.audio.set_mode(mode);
    }
}

impl std::fmt::Debug for FocusStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocusStateMachine")
            .field("state", &self.state)
            .field("most_recent_mode", &self.most_recent_mode)
            .field("initialized", &self.initialized)
            .field("ringing_focus_held", &self.ringing_focus_held)
            .field("abandon_pending", &self.abandon_pending)
            .finish()
    }
}

/// Audio focus arbiter errors
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// The arbiter task has stopped
    #[error("Audio focus arbiter stopped")]
    Stopped,
}

enum ArbiterMessage {
    Focus {
        message: FocusMessage,
        facts: FocusFacts,
    },
    GetState {
        respond_to: oneshot::Sender<FocusState>,
    },
}

/// Handle to a running [`AudioFocusArbiter`]
#[derive(Clone)]
pub struct AudioFocusHandle {
    sender: mpsc::UnboundedSender<ArbiterMessage>,
    cancel_token: CancellationToken,
}

impl AudioFocusHandle {
    /// Queue a message with its fact snapshot
    ///
    /// Never blocks. Returns `false` if the arbiter has stopped.
    pub fn send(&self, message: FocusMessage, facts: FocusFacts) -> bool {
        let sent = self
            .sender
            .send(ArbiterMessage::Focus { message, facts })
            .is_ok();
        if !sent {
            tracing::warn!(message = ?message, "Audio focus arbiter is gone");
        }
        sent
    }

    /// Current focus state, after every message queued before this call
    ///
    /// # Errors
    ///
    /// Returns `ArbiterError::Stopped` if the arbiter task has exited.
    pub async fn current_state(&self) -> Result<FocusState, ArbiterError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ArbiterMessage::GetState { respond_to: tx })
            .map_err(|_| ArbiterError::Stopped)?;
        rx.await.map_err(|_| ArbiterError::Stopped)
    }

    /// Stop the arbiter
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Whether the arbiter was stopped
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl std::fmt::Debug for AudioFocusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFocusHandle")
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

/// Task running the focus state machine
pub struct AudioFocusArbiter {
    machine: FocusStateMachine,
    receiver: mpsc::UnboundedReceiver<ArbiterMessage>,
    cancel_token: CancellationToken,
}

impl AudioFocusArbiter {
    /// Spawn an initialized arbiter and return its handle and task
    pub fn spawn(
        audio: Arc<dyn AudioManager>,
        ringer: Arc<dyn Ringer>,
        cancel_token: CancellationToken,
    ) -> (AudioFocusHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut machine = FocusStateMachine::new(audio, ringer);
        machine.handle(FocusMessage::Initialize, &FocusFacts::default());

        let arbiter = Self {
            machine,
            receiver,
            cancel_token: cancel_token.clone(),
        };
        let task = tokio::spawn(arbiter.run());

        (
            AudioFocusHandle {
                sender,
                cancel_token,
            },
            task,
        )
    }

    async fn run(mut self) {
        tracing::debug!("Audio focus arbiter started");
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    tracing::debug!("Audio focus arbiter cancelled");
                    break;
                }
                msg = self.receiver.recv() => {
                    match msg {
                        Some(ArbiterMessage::Focus { message, facts }) => {
                            self.machine.handle(message, &facts);
                        }
                        Some(ArbiterMessage::GetState { respond_to }) => {
                            let _ = respond_to.send(self.machine.state());
                        }
                        None => {
                            tracing::debug!("Audio focus arbiter channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
