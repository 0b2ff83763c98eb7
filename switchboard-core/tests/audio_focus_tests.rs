//! Audio focus decisions driven by call population changes

mod common;

use common::{app, register, sim};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use switchboard_core::loopback::{AudioOp, RecordingAudioManager, ScriptedRinger};
use switchboard_core::{
    AudioMode, BackendEvent, CallOrchestrator, FocusState, FocusType, IncomingCallRequest,
    OutgoingCallRequest, PhoneAccount, PhoneAccountRegistry, VideoState,
};

struct Bench {
    orchestrator: CallOrchestrator,
    audio: Arc<RecordingAudioManager>,
    ringer: Arc<ScriptedRinger>,
}

fn bench(audible: bool) -> Bench {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    register(&accounts, PhoneAccount::self_managed(app("chat"), "Chat"));
    let audio = Arc::new(RecordingAudioManager::new());
    let ringer = Arc::new(ScriptedRinger::new(audible));
    let orchestrator = CallOrchestrator::builder(accounts)
        .with_audio(audio.clone(), ringer.clone())
        .build()
        .unwrap();
    Bench {
        orchestrator,
        audio,
        ringer,
    }
}

impl Bench {
    async fn focus(&self) -> FocusState {
        self.orchestrator.audio_focus_state().await.unwrap()
    }

    async fn ring(&self) -> switchboard_core::CallId {
        self.orchestrator
            .add_incoming_call(IncomingCallRequest::new(
                sim("sim1"),
                Some("tel:555-0000".to_string()),
            ))
            .await
            .unwrap()
            .unwrap()
    }

    async fn dial(&self) -> switchboard_core::CallId {
        let id = self
            .orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
            .await
            .unwrap()
            .unwrap();
        self.orchestrator
            .handle_backend_event(id, BackendEvent::SetActive);
        id
    }
}

#[tokio::test]
async fn ringing_call_takes_ring_focus() {
    let b = bench(true);
    b.ring().await;

    assert_eq!(b.focus().await, FocusState::Ringing);
    assert_eq!(
        b.audio.take(),
        vec![
            AudioOp::RequestFocus(FocusType::Ring),
            AudioOp::SetMode(AudioMode::Ringtone),
        ]
    );
}

#[tokio::test]
async fn silent_ringer_skips_ring_focus() {
    let b = bench(false);
    b.ring().await;

    assert_eq!(b.focus().await, FocusState::Ringing);
    assert!(b.audio.ops().is_empty());
}

#[tokio::test]
async fn answered_call_moves_to_in_call_mode() {
    let b = bench(true);
    let id = b.ring().await;
    b.orchestrator.answer_call(id, VideoState::AUDIO_ONLY).unwrap();
    b.orchestrator.handle_backend_event(id, BackendEvent::SetActive);

    assert_eq!(b.focus().await, FocusState::SimCall);
    let ops = b.audio.ops();
    assert_eq!(
        &ops[ops.len() - 2..],
        &[
            AudioOp::RequestFocus(FocusType::VoiceCall),
            AudioOp::SetMode(AudioMode::InCall),
        ]
    );
}

#[tokio::test]
async fn second_ringing_call_plays_call_waiting() {
    let b = bench(true);
    b.dial().await;
    assert_eq!(b.focus().await, FocusState::SimCall);

    let waiting = b.ring().await;
    assert_eq!(b.focus().await, FocusState::SimCall);
    assert!(b.ringer.is_call_waiting());

    b.orchestrator.reject_call(waiting, None).unwrap();
    assert_eq!(b.focus().await, FocusState::SimCall);
    assert!(!b.ringer.is_call_waiting());
}

#[tokio::test]
async fn focus_is_released_after_audio_settles() {
    let b = bench(true);
    let id = b.dial().await;
    b.orchestrator.disconnect_call(id).unwrap();

    assert_eq!(b.focus().await, FocusState::Unfocused);
    assert!(!b.audio.ops().contains(&AudioOp::AbandonFocus));

    b.orchestrator.audio_operations_complete();
    assert_eq!(b.focus().await, FocusState::Unfocused);
    assert_eq!(b.audio.ops().last(), Some(&AudioOp::AbandonFocus));
}

#[tokio::test]
async fn self_managed_call_uses_communication_mode() {
    let b = bench(true);
    b.orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("sip:alice@example.com").on_account(app("chat")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(b.focus().await, FocusState::VoipCall);
    assert_eq!(
        b.audio.ops().last(),
        Some(&AudioOp::SetMode(AudioMode::InCommunication))
    );
}

#[tokio::test]
async fn tone_without_calls_holds_focus() {
    let b = bench(true);
    b.orchestrator.set_tone_playing(true);
    assert_eq!(b.focus().await, FocusState::Other);

    b.orchestrator.set_tone_playing(false);
    assert_eq!(b.focus().await, FocusState::Unfocused);
}
