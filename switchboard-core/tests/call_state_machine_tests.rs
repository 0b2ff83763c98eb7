//! Call lifecycle tests driven through the orchestrator
//!
//! Covers outgoing and incoming flows, answer/reject, incoming filter
//! verdicts and how untrusted backend signals are absorbed.

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::loopback::{FixedVerdictFilter, LoopbackConnectionService, RecordingListener};
use switchboard_core::{
    BackendCommand, BackendEvent, CallEvent, CallId, CallOrchestrator, CallState, Capabilities,
    DisconnectCause, DisconnectCode, FilterVerdict, IncomingCallRequest, OrchestratorError,
    OutgoingCallRequest, PhoneAccount, PhoneAccountHandle, PhoneAccountRegistry, VideoState,
};

struct Harness {
    orchestrator: CallOrchestrator,
    backend: Arc<LoopbackConnectionService>,
    listener: Arc<RecordingListener>,
    sim: PhoneAccountHandle,
}

fn harness_with_filter(verdict: FilterVerdict) -> Harness {
    common::init_tracing();
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let backend = Arc::new(LoopbackConnectionService::new());
    let sim = PhoneAccountHandle::new("com.example.telephony", "sim1");
    accounts.register(PhoneAccount::sim(sim.clone(), "SIM 1"), backend.clone());

    let orchestrator = CallOrchestrator::builder(accounts)
        .with_incoming_filter(Arc::new(FixedVerdictFilter(verdict)))
        .build()
        .unwrap();
    let listener = Arc::new(RecordingListener::new());
    orchestrator.add_listener(listener.clone());

    Harness {
        orchestrator,
        backend,
        listener,
        sim,
    }
}

fn harness() -> Harness {
    harness_with_filter(FilterVerdict::Allow)
}

async fn dial(h: &Harness, address: &str) -> CallId {
    h.orchestrator
        .place_outgoing_call(OutgoingCallRequest::new(address).on_account(h.sim.clone()))
        .await
        .unwrap()
        .unwrap()
}

async fn ring(h: &Harness, address: &str) -> CallId {
    h.orchestrator
        .add_incoming_call(IncomingCallRequest::new(
            h.sim.clone(),
            Some(address.to_string()),
        ))
        .await
        .unwrap()
        .unwrap()
}

fn state(h: &Harness, call_id: CallId) -> Option<CallState> {
    h.orchestrator.call(call_id).map(|call| call.state)
}

#[tokio::test]
async fn outgoing_call_reaches_active() {
    let h = harness();
    let id = dial(&h, "tel:555-1234").await;
    assert_eq!(state(&h, id), Some(CallState::Connecting));

    let requests = h.backend.connection_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].address.as_deref(), Some("tel:555-1234"));
    assert!(!requests[0].is_incoming);

    h.orchestrator.handle_backend_event(id, BackendEvent::SetDialing);
    h.orchestrator.handle_backend_event(id, BackendEvent::SetActive);

    assert_eq!(
        h.listener.states_of(id),
        vec![CallState::Connecting, CallState::Dialing, CallState::Active]
    );
}

#[tokio::test]
async fn incoming_call_rings_then_answers() {
    let h = harness();
    let id = ring(&h, "tel:555-0000").await;
    assert_eq!(state(&h, id), Some(CallState::Ringing));
    assert!(h.backend.connection_requests()[0].is_incoming);

    tokio_test::assert_ok!(h.orchestrator.answer_call(id, VideoState::AUDIO_ONLY));
    assert_eq!(state(&h, id), Some(CallState::Answered));
    assert_eq!(
        h.backend.commands_for(id),
        vec![BackendCommand::Answer(VideoState::AUDIO_ONLY)]
    );

    h.orchestrator.handle_backend_event(id, BackendEvent::SetActive);
    assert_eq!(state(&h, id), Some(CallState::Active));
}

#[tokio::test]
async fn rejected_call_keeps_zero_connect_time() {
    let h = harness();
    let id = ring(&h, "tel:555-0000").await;

    h.orchestrator.reject_call(id, None).unwrap();
    assert_eq!(state(&h, id), Some(CallState::Disconnecting));
    assert_eq!(h.backend.commands_for(id), vec![BackendCommand::Reject(None)]);

    h.orchestrator.handle_backend_event(
        id,
        BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Remote)),
    );

    assert!(h.orchestrator.call(id).is_none());
    let removed = h.listener.removed(id).unwrap();
    assert_eq!(removed.state, CallState::Disconnected);
    assert_eq!(removed.disconnect_cause.code, DisconnectCode::Rejected);
    assert_eq!(removed.connect_time_millis, 0);
    assert_eq!(removed.age_millis, 0);
}

#[tokio::test]
async fn answer_requires_ringing_call() {
    let h = harness();
    let id = dial(&h, "tel:555-1234").await;

    let err = tokio_test::assert_err!(h.orchestrator.answer_call(id, VideoState::AUDIO_ONLY));
    assert!(matches!(
        err,
        OrchestratorError::InvalidState {
            state: CallState::Connecting,
            ..
        }
    ));
    assert!(matches!(
        h.orchestrator.answer_call(CallId(999), VideoState::AUDIO_ONLY),
        Err(OrchestratorError::CallNotFound(CallId(999)))
    ));
}

#[tokio::test]
async fn out_of_order_backend_signals_are_absorbed() {
    let h = harness();
    let outgoing = dial(&h, "tel:555-1234").await;
    h.orchestrator.handle_backend_event(outgoing, BackendEvent::SetRinging);
    assert_eq!(state(&h, outgoing), Some(CallState::Connecting));

    h.orchestrator.handle_backend_event(outgoing, BackendEvent::SetActive);
    let incoming = ring(&h, "tel:555-0000").await;
    h.orchestrator.handle_backend_event(incoming, BackendEvent::SetDialing);
    assert_eq!(state(&h, incoming), Some(CallState::Ringing));

    let before = h.listener.events().len();
    h.orchestrator
        .handle_backend_event(CallId(4242), BackendEvent::SetActive);
    assert_eq!(h.listener.events().len(), before);
}

#[tokio::test]
async fn signals_after_local_disconnect_are_ignored() {
    let h = harness();
    let id = dial(&h, "tel:555-1234").await;
    h.orchestrator.handle_backend_event(id, BackendEvent::SetActive);

    h.orchestrator.disconnect_call(id).unwrap();
    assert_eq!(state(&h, id), Some(CallState::Disconnecting));
    assert_eq!(h.backend.commands_for(id), vec![BackendCommand::Disconnect]);

    h.orchestrator.handle_backend_event(id, BackendEvent::SetOnHold);
    assert_eq!(state(&h, id), Some(CallState::Disconnecting));

    h.orchestrator.handle_backend_event(
        id,
        BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Local)),
    );
    assert!(h.orchestrator.call(id).is_none());
}

#[tokio::test]
async fn hold_and_unhold_follow_capabilities() {
    let h = harness();
    let id = dial(&h, "tel:555-1234").await;
    h.orchestrator.handle_backend_event(id, BackendEvent::SetActive);

    assert!(matches!(
        h.orchestrator.hold_call(id),
        Err(OrchestratorError::PolicyRejected(_))
    ));

    h.orchestrator.handle_backend_event(
        id,
        BackendEvent::SetCapabilities(Capabilities::HOLD | Capabilities::SUPPORT_HOLD),
    );
    h.orchestrator.hold_call(id).unwrap();
    h.orchestrator.handle_backend_event(id, BackendEvent::SetOnHold);
    h.orchestrator.unhold_call(id).unwrap();

    assert_eq!(
        h.backend.commands_for(id),
        vec![BackendCommand::Hold, BackendCommand::Unhold]
    );
}

#[tokio::test]
async fn hold_failure_is_reported() {
    let h = harness();
    let id = dial(&h, "tel:555-1234").await;
    h.orchestrator.handle_backend_event(id, BackendEvent::HoldFailed);

    assert!(h
        .listener
        .events()
        .iter()
        .any(|event| matches!(event, CallEvent::HoldFailed { call_id } if *call_id == id)));
}

#[tokio::test]
async fn audio_processing_then_simulated_ringing_answers_directly() {
    let h = harness_with_filter(FilterVerdict::ScreenViaAudio);
    let id = ring(&h, "tel:555-0000").await;
    assert_eq!(state(&h, id), Some(CallState::AudioProcessing));

    h.orchestrator.exit_audio_processing(id, true).unwrap();
    assert_eq!(state(&h, id), Some(CallState::SimulatedRinging));

    h.orchestrator.answer_call(id, VideoState::AUDIO_ONLY).unwrap();
    assert_eq!(state(&h, id), Some(CallState::Active));
    assert!(h.backend.commands_for(id).is_empty());
}

#[tokio::test]
async fn exit_audio_processing_requires_that_state() {
    let h = harness();
    let id = ring(&h, "tel:555-0000").await;
    assert!(matches!(
        h.orchestrator.exit_audio_processing(id, false),
        Err(OrchestratorError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn filter_reject_logs_missed_call() {
    let h = harness_with_filter(FilterVerdict::RejectAsMissed);
    let result = h
        .orchestrator
        .add_incoming_call(IncomingCallRequest::new(
            h.sim.clone(),
            Some("tel:555-6666".to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(result, None);

    let added = h
        .listener
        .events()
        .iter()
        .find_map(|event| match event {
            CallEvent::CallAdded { call } => Some(call.call_id),
            _ => None,
        })
        .unwrap();
    let removed = h.listener.removed(added).unwrap();
    assert_eq!(removed.disconnect_cause.code, DisconnectCode::Missed);
    assert_eq!(
        h.backend.commands_for(added),
        vec![BackendCommand::Reject(None)]
    );
}

#[tokio::test]
async fn second_ringing_call_is_turned_away_busy() {
    let h = harness();
    ring(&h, "tel:555-0000").await;

    let second = h
        .orchestrator
        .add_incoming_call(IncomingCallRequest::new(
            h.sim.clone(),
            Some("tel:555-0001".to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(second, None);
    assert_eq!(h.orchestrator.calls().len(), 1);

    let busy = h
        .listener
        .events()
        .iter()
        .find_map(|event| match event {
            CallEvent::CallRemoved { call } => Some(call.disconnect_cause.code),
            _ => None,
        });
    assert_eq!(busy, Some(DisconnectCode::Busy));
}

#[tokio::test]
async fn failed_incoming_connection_removes_call() {
    let h = harness();
    h.backend.push_connection_result(Err(DisconnectCause::with_reason(
        DisconnectCode::Error,
        "modem busy",
    )));
    let result = h
        .orchestrator
        .add_incoming_call(IncomingCallRequest::new(h.sim.clone(), None))
        .await
        .unwrap();

    assert_eq!(result, None);
    assert!(h.orchestrator.calls().is_empty());
}

#[tokio::test]
async fn unknown_account_is_an_error() {
    let h = harness();
    let stranger = PhoneAccountHandle::new("com.unknown", "x");
    let err = h
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(stranger.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AccountNotFound(handle) if handle == stranger));
}

#[tokio::test]
async fn conference_parent_links_are_tracked() {
    let h = harness();
    let first = dial(&h, "tel:555-0001").await;
    h.orchestrator.handle_backend_event(first, BackendEvent::SetActive);

    let host = h
        .orchestrator
        .add_conference_call(switchboard_core::ConferenceCallRequest {
            account: h.sim.clone(),
            children: vec![first],
            capabilities: Capabilities::SWAP_CONFERENCE | Capabilities::MERGE_CONFERENCE,
            properties: switchboard_core::Properties::NONE,
        })
        .unwrap();

    let host_view = h.orchestrator.call(host).unwrap();
    assert_eq!(host_view.children, vec![first]);
    assert_eq!(h.orchestrator.call(first).unwrap().parent, Some(host));

    h.orchestrator.swap_conference(host).unwrap();
    assert!(h.listener.events().iter().any(|event| matches!(
        event,
        CallEvent::ConferenceSwapped { conference_id, active_child: Some(child) }
            if *conference_id == host && *child == first
    )));

    h.orchestrator
        .handle_backend_event(first, BackendEvent::SetConferenceParent(None));
    assert!(h.orchestrator.call(host).unwrap().children.is_empty());
}

#[tokio::test]
async fn rtt_session_is_connected_end_to_end() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let h = harness();
    let id = dial(&h, "tel:555-1234").await;
    h.orchestrator.handle_backend_event(id, BackendEvent::SetActive);

    let mut local = h.orchestrator.request_rtt(id).unwrap();
    let mut remote = h.orchestrator.take_rtt_remote(id).unwrap();
    remote.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(1), local.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    h.orchestrator.stop_rtt(id).unwrap();
    assert!(h.orchestrator.take_rtt_remote(id).is_none());
}
