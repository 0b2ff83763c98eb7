//! Translates call population changes into audio focus messages

use super::focus::{FocusFacts, FocusMessage};
use crate::registry::CallRegistry;
use crate::types::{CallId, CallState};
use std::collections::BTreeSet;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Categories {
    active_or_dialing: BTreeSet<CallId>,
    ringing: BTreeSet<CallId>,
    holding: BTreeSet<CallId>,
    audio_processing: BTreeSet<CallId>,
}

impl Categories {
    fn from_registry(registry: &CallRegistry) -> Self {
        let mut categories = Self::default();
        for call in registry.iter().filter(|c| c.is_alive() && c.is_focusable()) {
            let bucket = match call.state() {
                CallState::Connecting
                | CallState::Dialing
                | CallState::Pulling
                | CallState::Active => &mut categories.active_or_dialing,
                CallState::Ringing | CallState::SimulatedRinging => &mut categories.ringing,
                CallState::OnHold => &mut categories.holding,
                CallState::AudioProcessing => &mut categories.audio_processing,
                _ => continue,
            };
            bucket.insert(call.id());
        }
        categories
    }
}

/// Tracks per-category call sets and reports changes as focus messages
///
/// Each message carries the facts of the population after the whole change,
/// so a call moving from ringing to active yields `NoMoreRingingCalls`
/// followed by `NewActiveOrDialingCall`, both seeing the active call.
#[derive(Debug, Default)]
pub struct CallAudioCoordinator {
    categories: Categories,
    tone_playing: bool,
    reported_tone_playing: bool,
    foreground_voip: bool,
}

impl CallAudioCoordinator {
    /// Create a coordinator that has seen no calls
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether an in-call tone is playing; reported on the next update
    pub fn set_tone_playing(&mut self, playing: bool) {
        self.tone_playing = playing;
    }

    /// Facts describing the registry right now
    #[must_use]
    pub fn facts(&self, registry: &CallRegistry) -> FocusFacts {
        self.facts_for(&Categories::from_registry(registry), registry)
    }

    fn facts_for(&self, categories: &Categories, registry: &CallRegistry) -> FocusFacts {
        FocusFacts {
            has_active_or_dialing: !categories.active_or_dialing.is_empty(),
            has_ringing: !categories.ringing.is_empty(),
            has_holding: !categories.holding.is_empty(),
            has_audio_processing: !categories.audio_processing.is_empty(),
            is_tone_playing: self.tone_playing,
            foreground_call_is_voip: registry
                .foreground_call()
                .is_some_and(|call| call.is_voip_audio()),
        }
    }

    /// Compare the registry to the last update and produce messages
    pub fn update(&mut self, registry: &CallRegistry) -> Vec<(FocusMessage, FocusFacts)> {
        let next = Categories::from_registry(registry);
        let facts = self.facts_for(&next, registry);
        let foreground_voip = facts.foreground_call_is_voip;

        let previous = &self.categories;
        let pairs = [
            (
                &previous.active_or_dialing,
                &next.active_or_dialing,
                FocusMessage::NoMoreActiveOrDialingCalls,
                FocusMessage::NewActiveOrDialingCall,
            ),
            (
                &previous.ringing,
                &next.ringing,
                FocusMessage::NoMoreRingingCalls,
                FocusMessage::NewRingingCall,
            ),
            (
                &previous.holding,
                &next.holding,
                FocusMessage::NoMoreHoldingCalls,
                FocusMessage::NewHoldingCall,
            ),
            (
                &previous.audio_processing,
                &next.audio_processing,
                FocusMessage::NoMoreAudioProcessingCalls,
                FocusMessage::NewAudioProcessingCall,
            ),
        ];

        let mut messages = Vec::new();
        for (old, new, no_more, _) in &pairs {
            if !old.is_empty() && new.is_empty() {
                messages.push(*no_more);
            }
        }
        for (old, new, _, added) in &pairs {
            if new.difference(old).next().is_some() {
                messages.push(*added);
            }
        }
        if self.tone_playing != self.reported_tone_playing {
            messages.push(if self.tone_playing {
                FocusMessage::ToneStartedPlaying
            } else {
                FocusMessage::ToneStoppedPlaying
            });
        }
        if foreground_voip != self.foreground_voip && facts.has_active_or_dialing {
            messages.push(FocusMessage::ForegroundVoipModeChange);
        }

        self.categories = next;
        self.reported_tone_playing = self.tone_playing;
        self.foreground_voip = foreground_voip;

        messages.into_iter().map(|m| (m, facts)).collect()
    }
}
