//! Handover of a live call between backends

mod common;

use common::{eventually, register, sim, voip};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use switchboard_core::handover::{EVENT_HANDOVER_COMPLETE, EVENT_HANDOVER_FAILED};
use switchboard_core::loopback::{LoopbackConnectionService, RecordingListener};
use switchboard_core::{
    BackendCommand, BackendEvent, CallEvent, CallId, CallOrchestrator, CallState,
    DisconnectCause, DisconnectCode, HandoverFailureReason, HandoverState, OrchestratorError,
    OutgoingCallRequest, PhoneAccount, PhoneAccountRegistry, VideoState,
};

struct Bench {
    orchestrator: CallOrchestrator,
    listener: Arc<RecordingListener>,
    sim_backend: Arc<LoopbackConnectionService>,
    wifi_backend: Arc<LoopbackConnectionService>,
    source: CallId,
}

async fn bench_with(wifi: PhoneAccount) -> Bench {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let sim_backend = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1").with_handover());
    let wifi_backend = register(&accounts, wifi);
    let orchestrator = CallOrchestrator::builder(accounts).build().unwrap();
    let listener = Arc::new(RecordingListener::new());
    orchestrator.add_listener(listener.clone());

    let source = orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap()
        .unwrap();
    orchestrator.handle_backend_event(source, BackendEvent::SetActive);

    Bench {
        orchestrator,
        listener,
        sim_backend,
        wifi_backend,
        source,
    }
}

async fn bench() -> Bench {
    bench_with(PhoneAccount::managed(voip("wifi"), "Wi-Fi calling").with_handover()).await
}

fn handover_state(bench: &Bench, call_id: CallId) -> HandoverState {
    bench.orchestrator.call(call_id).unwrap().handover_state
}

fn notify(event: &str) -> BackendCommand {
    BackendCommand::SendEvent {
        event: event.to_string(),
        extras: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn handover_completes_when_destination_goes_active() {
    let b = bench().await;
    let destination = b
        .orchestrator
        .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY)
        .unwrap();

    let wifi = b.wifi_backend.clone();
    eventually("destination connection", || wifi.connection_requests().len() == 1).await;
    let request = &b.wifi_backend.connection_requests()[0];
    assert_eq!(request.handover_from, Some(b.source));
    assert_eq!(request.address.as_deref(), Some("tel:555-1234"));
    assert_eq!(handover_state(&b, b.source), HandoverState::FromStarted);
    assert_eq!(handover_state(&b, destination), HandoverState::ToStarted);

    b.orchestrator
        .handle_backend_event(destination, BackendEvent::SetActive);
    assert_eq!(handover_state(&b, b.source), HandoverState::Accepted);
    assert_eq!(handover_state(&b, destination), HandoverState::Accepted);
    assert_eq!(
        b.sim_backend.commands_for(b.source),
        vec![notify(EVENT_HANDOVER_COMPLETE), BackendCommand::Disconnect]
    );

    b.orchestrator.handle_backend_event(
        b.source,
        BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Local)),
    );
    assert_eq!(
        b.listener.removed(b.source).unwrap().handover_state,
        HandoverState::Complete
    );
    assert_eq!(handover_state(&b, destination), HandoverState::Complete);
    assert!(b.listener.events().iter().any(|event| matches!(
        event,
        CallEvent::HandoverComplete { source, destination: d } if *source == b.source && *d == destination
    )));
    assert_eq!(
        b.orchestrator.call(destination).unwrap().state,
        CallState::Active
    );
}

#[tokio::test]
async fn rejected_destination_fails_both_calls() {
    let b = bench().await;
    b.wifi_backend.push_connection_result(Err(DisconnectCause::new(DisconnectCode::Error)));
    let destination = b
        .orchestrator
        .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY)
        .unwrap();

    let listener = b.listener.clone();
    eventually("destination removal", || listener.removed(destination).is_some()).await;

    assert_eq!(
        b.listener.removed(destination).unwrap().handover_state,
        HandoverState::Failed
    );
    assert_eq!(handover_state(&b, b.source), HandoverState::Failed);
    assert_eq!(b.orchestrator.call(b.source).unwrap().state, CallState::Active);
    assert_eq!(
        b.sim_backend.commands_for(b.source),
        vec![notify(EVENT_HANDOVER_FAILED)]
    );
    assert!(b.listener.events().iter().any(|event| matches!(
        event,
        CallEvent::HandoverFailed { call_id, reason: HandoverFailureReason::DestinationRejected }
            if *call_id == b.source
    )));
}

#[tokio::test]
async fn source_disconnect_abandons_destination() {
    let b = bench().await;
    let destination = b
        .orchestrator
        .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY)
        .unwrap();
    let wifi = b.wifi_backend.clone();
    eventually("destination connection", || wifi.connection_requests().len() == 1).await;

    b.orchestrator.handle_backend_event(
        b.source,
        BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Remote)),
    );

    assert!(b.listener.events().iter().any(|event| matches!(
        event,
        CallEvent::HandoverFailed { reason: HandoverFailureReason::SourceDisconnected, .. }
    )));
    assert!(b.orchestrator.call(destination).is_none());
    assert_eq!(
        b.wifi_backend.commands_for(destination),
        vec![BackendCommand::Abort]
    );
}

#[tokio::test]
async fn unsupported_destination_is_refused() {
    let b = bench_with(PhoneAccount::managed(voip("wifi"), "Wi-Fi calling")).await;
    let before = b.orchestrator.calls().len();

    let err = b
        .orchestrator
        .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY)
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::HandoverRefused(HandoverFailureReason::NotSupported)
    ));
    assert_eq!(b.orchestrator.calls().len(), before);
    assert_eq!(handover_state(&b, b.source), HandoverState::None);
    assert!(b.listener.events().iter().any(|event| matches!(
        event,
        CallEvent::HandoverFailed { reason: HandoverFailureReason::NotSupported, .. }
    )));
}

#[tokio::test]
async fn handover_is_refused_during_emergency() {
    let b = bench().await;
    b.orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:911"))
        .await
        .unwrap()
        .unwrap();

    let err = b
        .orchestrator
        .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY)
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::HandoverRefused(HandoverFailureReason::OngoingEmergencyCall)
    ));
}

#[tokio::test]
async fn second_handover_of_same_call_is_refused() {
    let b = bench().await;
    b.orchestrator
        .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY)
        .unwrap();

    assert!(matches!(
        b.orchestrator
            .request_handover(b.source, &voip("wifi"), VideoState::AUDIO_ONLY),
        Err(OrchestratorError::HandoverRefused(_))
    ));
}
