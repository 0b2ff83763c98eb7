//! Audio focus arbitration
//!
//! [`coordinator::CallAudioCoordinator`] watches the call population and
//! turns changes into [`focus::FocusMessage`]s; [`focus::AudioFocusArbiter`]
//! consumes them on its own task and drives the [`AudioManager`] and
//! [`Ringer`].

pub mod coordinator;
pub mod focus;

use serde::{Deserialize, Serialize};

/// Kind of audio focus requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusType {
    /// Focus for playing a ringtone
    Ring,
    /// Focus for a voice call
    VoiceCall,
}

/// Platform audio mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioMode {
    /// No call audio
    Normal,
    /// Ringtone playing
    Ringtone,
    /// Cellular call audio
    InCall,
    /// VoIP call audio
    InCommunication,
    /// Call audio routed to a screening process
    CallScreening,
}

/// Audio hardware control surface
pub trait AudioManager: Send + Sync {
    /// Request audio focus
    fn request_focus(&self, focus: FocusType);

    /// Release audio focus
    fn abandon_focus(&self);

    /// Switch the audio mode
    fn set_mode(&self, mode: AudioMode);
}

/// Ringtone and call-waiting tone player
pub trait Ringer: Send + Sync {
    /// Start the ringtone
    ///
    /// Returns `true` when the ringtone is audible and needs focus; a silent
    /// or vibrate-only ringtone returns `false`.
    fn start_ringing(&self) -> bool;

    /// Stop the ringtone
    fn stop_ringing(&self);

    /// Whether the ringtone is playing
    fn is_ringing(&self) -> bool;

    /// Start the call-waiting tone
    fn start_call_waiting(&self);

    /// Stop the call-waiting tone
    fn stop_call_waiting(&self);
}

/// Audio manager for hosts without audio hardware
#[derive(Debug, Default)]
pub struct NullAudioManager;

impl AudioManager for NullAudioManager {
    fn request_focus(&self, _focus: FocusType) {}

    fn abandon_focus(&self) {}

    fn set_mode(&self, _mode: AudioMode) {}
}

/// Ringer that never makes a sound
#[derive(Debug, Default)]
pub struct SilentRinger;

impl Ringer for SilentRinger {
    fn start_ringing(&self) -> bool {
        false
    }

    fn stop_ringing(&self) {}

    fn is_ringing(&self) -> bool {
        false
    }

    fn start_call_waiting(&self) {}

    fn stop_call_waiting(&self) {}
}
