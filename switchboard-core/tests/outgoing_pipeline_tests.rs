//! Outgoing call pipeline: account selection, redirection, admission and
//! pending-disconnect reuse

mod common;

use common::{app, eventually, fast_config, register, sim, voip};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::loopback::{
    FixedRedirection, LoopbackConnectionService, PromptRequest, RecordingListener,
    RecordingPrompts, StaticSuggestions,
};
use switchboard_core::{
    AccountSuggestion, BackendCommand, BackendEvent, CallId, CallOrchestrator, CallState,
    Capabilities, DisconnectCode, OrchestratorConfig, OutgoingCallRequest, PhoneAccount,
    PhoneAccountHandle, PhoneAccountRegistry, SuggestionReason,
};
use tokio::sync::mpsc::UnboundedReceiver;

struct TwoSims {
    orchestrator: CallOrchestrator,
    listener: Arc<RecordingListener>,
    prompts: UnboundedReceiver<PromptRequest>,
    first: Arc<LoopbackConnectionService>,
    second: Arc<LoopbackConnectionService>,
}

fn two_sims(config: OrchestratorConfig, suggestions: Option<StaticSuggestions>) -> TwoSims {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let first = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let second = register(&accounts, PhoneAccount::sim(sim("sim2"), "SIM 2"));
    let (prompts, rx) = RecordingPrompts::new();

    let mut builder = CallOrchestrator::builder(accounts)
        .with_config(config)
        .with_prompts(Arc::new(prompts));
    if let Some(suggestions) = suggestions {
        builder = builder.with_suggestions(Arc::new(suggestions));
    }
    let orchestrator = builder.build().unwrap();
    let listener = Arc::new(RecordingListener::new());
    orchestrator.add_listener(listener.clone());

    TwoSims {
        orchestrator,
        listener,
        prompts: rx,
        first,
        second,
    }
}

async fn active_call(orchestrator: &CallOrchestrator, account: PhoneAccountHandle, address: &str) -> CallId {
    let id = orchestrator
        .place_outgoing_call(OutgoingCallRequest::new(address).on_account(account))
        .await
        .unwrap()
        .unwrap();
    orchestrator.handle_backend_event(id, BackendEvent::SetActive);
    id
}

#[tokio::test]
async fn same_backend_call_is_not_held() {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let backend = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let orchestrator = CallOrchestrator::builder(accounts).build().unwrap();
    let listener = Arc::new(RecordingListener::new());
    orchestrator.add_listener(listener.clone());

    let existing = active_call(&orchestrator, sim("sim1"), "tel:555-0001").await;
    let new_call = orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(listener.states_of(new_call), vec![CallState::Connecting]);
    assert!(backend.commands_for(existing).is_empty());
    assert_eq!(orchestrator.call(existing).unwrap().state, CallState::Active);
    assert_eq!(orchestrator.call(new_call).unwrap().state, CallState::Connecting);
}

#[tokio::test]
async fn account_picker_selects_backend() {
    let mut bench = two_sims(fast_config(), None);
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });

    let PromptRequest::AccountPicker {
        call_id,
        suggestions,
    } = bench.prompts.recv().await.unwrap()
    else {
        panic!("expected the account picker");
    };
    let offered: Vec<PhoneAccountHandle> = suggestions.into_iter().map(|s| s.handle).collect();
    assert_eq!(offered, vec![sim("sim1"), sim("sim2")]);
    assert_eq!(
        bench.orchestrator.call(call_id).unwrap().state,
        CallState::SelectPhoneAccount
    );

    bench
        .orchestrator
        .select_phone_account(call_id, sim("sim2"))
        .unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert!(bench.first.connection_requests().is_empty());
    assert_eq!(bench.second.connection_requests()[0].account, sim("sim2"));
}

#[tokio::test]
async fn default_account_skips_picker() {
    let mut bench = two_sims(fast_config(), None);
    bench
        .orchestrator
        .accounts()
        .set_default_outgoing(Some(sim("sim2")));

    let id = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
        .await
        .unwrap();
    assert!(id.is_some());
    assert_eq!(bench.second.connection_requests().len(), 1);
    assert!(bench.prompts.try_recv().is_err());
}

#[tokio::test]
async fn auto_selected_suggestion_skips_picker() {
    let suggestions = StaticSuggestions::new(vec![AccountSuggestion {
        handle: sim("sim2"),
        reason: SuggestionReason::Frequent,
        should_auto_select: true,
    }]);
    let mut bench = two_sims(fast_config(), Some(suggestions));

    let id = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
        .await
        .unwrap();

    assert!(id.is_some());
    assert_eq!(bench.second.connection_requests().len(), 1);
    assert!(bench.first.connection_requests().is_empty());
    assert!(bench.prompts.try_recv().is_err());
}

#[tokio::test]
async fn slow_suggestions_fall_back_to_unranked_picker() {
    let suggestions = StaticSuggestions::new(vec![AccountSuggestion {
        handle: sim("sim2"),
        reason: SuggestionReason::UserSet,
        should_auto_select: true,
    }])
    .with_delay(Duration::from_secs(10));
    let mut bench = two_sims(fast_config(), Some(suggestions));
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });

    let prompt = tokio::time::timeout(Duration::from_secs(2), bench.prompts.recv())
        .await
        .unwrap()
        .unwrap();
    let PromptRequest::AccountPicker {
        call_id,
        suggestions,
    } = prompt
    else {
        panic!("expected the account picker");
    };
    assert_eq!(
        suggestions,
        vec![
            AccountSuggestion::unranked(sim("sim1")),
            AccountSuggestion::unranked(sim("sim2")),
        ]
    );

    bench
        .orchestrator
        .select_phone_account(call_id, sim("sim1"))
        .unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert_eq!(bench.first.connection_requests().len(), 1);
}

#[tokio::test]
async fn unanswered_picker_cancels_call() {
    let mut bench = two_sims(fast_config(), None);

    let result = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
        .await
        .unwrap();
    assert_eq!(result, None);

    let call_id = bench.prompts.recv().await.unwrap().call_id();
    let removed = bench.listener.removed(call_id).unwrap();
    assert_eq!(removed.disconnect_cause.code, DisconnectCode::Canceled);
    assert!(bench.first.connection_requests().is_empty());
    assert!(bench.second.connection_requests().is_empty());
}

#[tokio::test]
async fn wrong_prompt_answer_is_ignored() {
    let mut bench = two_sims(fast_config(), None);
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let call_id = bench.prompts.recv().await.unwrap().call_id();

    bench.orchestrator.confirm_redirection(call_id, true);
    bench.orchestrator.confirm_drop_ongoing_call(call_id, true);
    assert_eq!(
        bench.orchestrator.call(call_id).unwrap().state,
        CallState::SelectPhoneAccount
    );

    bench
        .orchestrator
        .select_phone_account(call_id, sim("sim1"))
        .unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
}

#[tokio::test]
async fn disconnect_during_selection_parks_call_for_redial() {
    let mut bench = two_sims(fast_config(), None);
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let call_id = bench.prompts.recv().await.unwrap().call_id();

    bench.orchestrator.disconnect_call(call_id).unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), None);
    assert_eq!(
        bench.orchestrator.call(call_id).unwrap().state,
        CallState::Disconnecting
    );

    let redial = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap();

    assert_eq!(redial, Some(call_id));
    assert_eq!(
        bench.listener.states_of(call_id),
        vec![
            CallState::SelectPhoneAccount,
            CallState::Disconnecting,
            CallState::New,
            CallState::Connecting,
        ]
    );
    assert!(bench.listener.removed(call_id).is_none());
    assert_eq!(bench.first.connection_requests().len(), 1);
}

#[tokio::test]
async fn parked_call_is_torn_down_after_grace() {
    let mut config = fast_config();
    config.timeouts.pending_disconnect_grace_ms = 30;
    let mut bench = two_sims(config, None);
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let call_id = bench.prompts.recv().await.unwrap().call_id();

    bench.orchestrator.disconnect_call(call_id).unwrap();
    placing.await.unwrap().unwrap();

    let listener = bench.listener.clone();
    eventually("parked call removal", || listener.removed(call_id).is_some()).await;
    let removed = bench.listener.removed(call_id).unwrap();
    assert_eq!(removed.disconnect_cause.code, DisconnectCode::Local);
}

#[tokio::test]
async fn redial_of_other_address_tears_down_parked_call() {
    let mut bench = two_sims(fast_config(), None);
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let parked = bench.prompts.recv().await.unwrap().call_id();
    bench.orchestrator.disconnect_call(parked).unwrap();
    placing.await.unwrap().unwrap();

    let other = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-9876").on_account(sim("sim2")))
        .await
        .unwrap()
        .unwrap();

    assert_ne!(other, parked);
    assert!(bench.listener.removed(parked).is_some());
}

fn redirecting(confirm: bool) -> (CallOrchestrator, Arc<LoopbackConnectionService>, UnboundedReceiver<PromptRequest>) {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let backend = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let (prompts, rx) = RecordingPrompts::new();
    let mut config = fast_config();
    config.confirm_redirection = confirm;
    let orchestrator = CallOrchestrator::builder(accounts)
        .with_config(config)
        .with_redirection(Arc::new(FixedRedirection("tel:555-9999".to_string())))
        .with_prompts(Arc::new(prompts))
        .build()
        .unwrap();
    (orchestrator, backend, rx)
}

#[tokio::test]
async fn confirmed_redirection_dials_new_address() {
    let (orchestrator, backend, mut prompts) = redirecting(true);
    let placer = orchestrator.clone();
    let placing = tokio::spawn(async move {
        placer
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
            .await
    });

    let prompt = prompts.recv().await.unwrap();
    let call_id = prompt.call_id();
    assert_eq!(
        prompt,
        PromptRequest::Redirection {
            call_id,
            original: "tel:555-1234".to_string(),
            redirected: "tel:555-9999".to_string(),
        }
    );
    orchestrator.confirm_redirection(call_id, true);

    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert_eq!(
        backend.connection_requests()[0].address.as_deref(),
        Some("tel:555-9999")
    );
}

#[tokio::test]
async fn declined_redirection_keeps_original_address() {
    let (orchestrator, backend, mut prompts) = redirecting(true);
    let placer = orchestrator.clone();
    let placing = tokio::spawn(async move {
        placer
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
            .await
    });

    let call_id = prompts.recv().await.unwrap().call_id();
    orchestrator.confirm_redirection(call_id, false);

    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert_eq!(
        backend.connection_requests()[0].address.as_deref(),
        Some("tel:555-1234")
    );
}

#[tokio::test]
async fn unconfirmed_redirection_applies_directly() {
    let (orchestrator, backend, mut prompts) = redirecting(false);
    orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap()
        .unwrap();

    assert!(prompts.try_recv().is_err());
    assert_eq!(
        backend.connection_requests()[0].address.as_deref(),
        Some("tel:555-9999")
    );
}

#[tokio::test]
async fn unholdable_call_elsewhere_blocks_new_call() {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    register(&accounts, PhoneAccount::managed(voip("work"), "Work"));
    let sim_backend = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let orchestrator = CallOrchestrator::builder(accounts).build().unwrap();
    let listener = Arc::new(RecordingListener::new());
    orchestrator.add_listener(listener.clone());

    let ongoing = active_call(&orchestrator, voip("work"), "tel:555-0001").await;
    let result = orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap();

    assert_eq!(result, None);
    assert!(sim_backend.connection_requests().is_empty());
    assert_eq!(orchestrator.call(ongoing).unwrap().state, CallState::Active);

    let blocked = listener
        .events()
        .iter()
        .find_map(|event| match event {
            switchboard_core::CallEvent::CallRemoved { call } => Some(call.disconnect_cause.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(blocked.code, DisconnectCode::Error);
    assert_eq!(blocked.reason.as_deref(), Some("too many calls"));
}

#[tokio::test]
async fn holdable_call_elsewhere_is_held() {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let voip_backend = register(&accounts, PhoneAccount::managed(voip("work"), "Work"));
    register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let orchestrator = CallOrchestrator::builder(accounts).build().unwrap();

    let ongoing = active_call(&orchestrator, voip("work"), "tel:555-0001").await;
    orchestrator.handle_backend_event(
        ongoing,
        BackendEvent::SetCapabilities(Capabilities::HOLD | Capabilities::SUPPORT_HOLD),
    );

    let placed = orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap();

    assert!(placed.is_some());
    assert_eq!(voip_backend.commands_for(ongoing), vec![BackendCommand::Hold]);
}

struct SelfManagedBench {
    orchestrator: CallOrchestrator,
    listener: Arc<RecordingListener>,
    prompts: UnboundedReceiver<PromptRequest>,
    sim_backend: Arc<LoopbackConnectionService>,
    app_backend: Arc<LoopbackConnectionService>,
    ongoing: CallId,
}

async fn self_managed_bench() -> SelfManagedBench {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let sim_backend = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let app_backend = register(&accounts, PhoneAccount::self_managed(app("chat"), "Chat"));
    let (prompts, rx) = RecordingPrompts::new();
    let orchestrator = CallOrchestrator::builder(accounts)
        .with_config(fast_config())
        .with_prompts(Arc::new(prompts))
        .build()
        .unwrap();
    let listener = Arc::new(RecordingListener::new());
    orchestrator.add_listener(listener.clone());
    let ongoing = active_call(&orchestrator, sim("sim1"), "tel:555-0001").await;

    SelfManagedBench {
        orchestrator,
        listener,
        prompts: rx,
        sim_backend,
        app_backend,
        ongoing,
    }
}

#[tokio::test]
async fn self_managed_call_drops_ongoing_call_when_confirmed() {
    let mut bench = self_managed_bench().await;
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("sip:alice@example.com").on_account(app("chat")))
            .await
    });

    let prompt = bench.prompts.recv().await.unwrap();
    let call_id = prompt.call_id();
    assert_eq!(
        prompt,
        PromptRequest::DropOngoingCall {
            call_id,
            ongoing: bench.ongoing,
        }
    );
    bench.orchestrator.confirm_drop_ongoing_call(call_id, true);

    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert_eq!(
        bench.sim_backend.commands_for(bench.ongoing),
        vec![BackendCommand::Disconnect]
    );
    assert_eq!(bench.app_backend.connection_requests().len(), 1);
    assert!(bench.orchestrator.call(call_id).unwrap().is_self_managed);
}

#[tokio::test]
async fn keeping_ongoing_call_cancels_self_managed_call() {
    let mut bench = self_managed_bench().await;
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("sip:alice@example.com").on_account(app("chat")))
            .await
    });

    let call_id = bench.prompts.recv().await.unwrap().call_id();
    bench.orchestrator.confirm_drop_ongoing_call(call_id, false);

    assert_eq!(placing.await.unwrap().unwrap(), None);
    assert!(bench.sim_backend.commands_for(bench.ongoing).is_empty());
    assert_eq!(
        bench.listener.removed(call_id).unwrap().disconnect_cause.code,
        DisconnectCode::Canceled
    );
    assert!(bench.app_backend.connection_requests().is_empty());
}

#[tokio::test]
async fn address_without_capable_account_fails() {
    let bench = two_sims(fast_config(), None);
    let result = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("sip:bob@example.com"))
        .await
        .unwrap();

    assert_eq!(result, None);
    let removed = bench
        .listener
        .events()
        .iter()
        .find_map(|event| match event {
            switchboard_core::CallEvent::CallRemoved { call } => Some(call.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(removed.disconnect_cause.code, DisconnectCode::Error);
}

#[tokio::test]
async fn backend_failure_ends_regular_call() {
    let bench = two_sims(fast_config(), None);
    bench.first.push_connection_result(Err(
        switchboard_core::DisconnectCause::new(DisconnectCode::Error),
    ));

    let result = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim("sim1")))
        .await
        .unwrap();

    assert_eq!(result, None);
    assert!(bench.orchestrator.calls().is_empty());
    assert!(bench.second.connection_requests().is_empty());
}

async fn wait_for_picker(prompts: &mut UnboundedReceiver<PromptRequest>) -> CallId {
    let prompt = tokio::time::timeout(Duration::from_secs(2), prompts.recv())
        .await
        .unwrap()
        .unwrap();
    match prompt {
        PromptRequest::AccountPicker { call_id, .. } => call_id,
        other => panic!("expected the account picker, got {other:?}"),
    }
}

#[tokio::test]
async fn live_call_is_left_alone_until_account_is_chosen() {
    let mut bench = two_sims(fast_config(), None);
    let existing = active_call(&bench.orchestrator, sim("sim1"), "tel:555-0001").await;
    bench.orchestrator.handle_backend_event(
        existing,
        BackendEvent::SetCapabilities(Capabilities::HOLD | Capabilities::SUPPORT_HOLD),
    );

    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let call_id = wait_for_picker(&mut bench.prompts).await;
    assert!(bench.first.commands_for(existing).is_empty());

    bench
        .orchestrator
        .select_phone_account(call_id, sim("sim1"))
        .unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert!(bench.first.commands_for(existing).is_empty());
    assert_eq!(
        bench.orchestrator.call(existing).unwrap().state,
        CallState::Active
    );
}

#[tokio::test]
async fn unholdable_call_on_same_package_still_offers_picker() {
    let mut bench = two_sims(fast_config(), None);
    let existing = active_call(&bench.orchestrator, sim("sim1"), "tel:555-0001").await;

    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let call_id = wait_for_picker(&mut bench.prompts).await;

    bench
        .orchestrator
        .select_phone_account(call_id, sim("sim2"))
        .unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert_eq!(bench.second.connection_requests().len(), 1);
    assert_eq!(
        bench.orchestrator.call(existing).unwrap().state,
        CallState::Active
    );
}

struct SimAndWork {
    orchestrator: CallOrchestrator,
    prompts: UnboundedReceiver<PromptRequest>,
    sim_backend: Arc<LoopbackConnectionService>,
    work_backend: Arc<LoopbackConnectionService>,
    ongoing: CallId,
}

/// SIM and work line, with a holdable call already active on the work line
async fn sim_and_work(config: OrchestratorConfig, suggestions: Option<StaticSuggestions>) -> SimAndWork {
    let accounts = Arc::new(PhoneAccountRegistry::new());
    let sim_backend = register(&accounts, PhoneAccount::sim(sim("sim1"), "SIM 1"));
    let work_backend = register(&accounts, PhoneAccount::managed(voip("work"), "Work"));
    let (prompts, rx) = RecordingPrompts::new();
    let mut builder = CallOrchestrator::builder(accounts)
        .with_config(config)
        .with_prompts(Arc::new(prompts));
    if let Some(suggestions) = suggestions {
        builder = builder.with_suggestions(Arc::new(suggestions));
    }
    let orchestrator = builder.build().unwrap();

    let ongoing = active_call(&orchestrator, voip("work"), "tel:555-0001").await;
    orchestrator.handle_backend_event(
        ongoing,
        BackendEvent::SetCapabilities(Capabilities::HOLD | Capabilities::SUPPORT_HOLD),
    );
    SimAndWork {
        orchestrator,
        prompts: rx,
        sim_backend,
        work_backend,
        ongoing,
    }
}

#[tokio::test]
async fn call_elsewhere_is_held_once_account_is_chosen() {
    let mut bench = sim_and_work(fast_config(), None).await;
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let call_id = wait_for_picker(&mut bench.prompts).await;
    assert!(bench.work_backend.commands_for(bench.ongoing).is_empty());

    bench
        .orchestrator
        .select_phone_account(call_id, sim("sim1"))
        .unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), Some(call_id));
    assert_eq!(
        bench.work_backend.commands_for(bench.ongoing),
        vec![BackendCommand::Hold]
    );
    assert_eq!(bench.sim_backend.connection_requests().len(), 1);
}

#[tokio::test]
async fn disconnect_between_stages_leaves_other_calls_alone() {
    let mut config = fast_config();
    config.timeouts.suggestion_ms = 5_000;
    let suggestions = StaticSuggestions::new(vec![AccountSuggestion {
        handle: sim("sim1"),
        reason: SuggestionReason::Frequent,
        should_auto_select: true,
    }])
    .with_delay(Duration::from_millis(300));
    let bench = sim_and_work(config, Some(suggestions)).await;

    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234"))
            .await
    });
    let watched = bench.orchestrator.clone();
    eventually("new call", || watched.calls().len() == 2).await;
    let call_id = bench
        .orchestrator
        .calls()
        .into_iter()
        .find(|call| call.call_id != bench.ongoing)
        .unwrap()
        .call_id;

    bench.orchestrator.disconnect_call(call_id).unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), None);
    assert!(bench.work_backend.commands_for(bench.ongoing).is_empty());
    assert!(bench.sim_backend.connection_requests().is_empty());
    assert_eq!(
        bench.orchestrator.call(bench.ongoing).unwrap().state,
        CallState::Active
    );
}

#[tokio::test]
async fn redial_of_parked_call_forgets_previous_account() {
    let mut bench = self_managed_bench().await;
    let orchestrator = bench.orchestrator.clone();
    let placing = tokio::spawn(async move {
        orchestrator
            .place_outgoing_call(OutgoingCallRequest::new("tel:555-0202").on_account(app("chat")))
            .await
    });
    let parked = bench.prompts.recv().await.unwrap().call_id();
    bench.orchestrator.disconnect_call(parked).unwrap();
    assert_eq!(placing.await.unwrap().unwrap(), None);

    let redial = bench
        .orchestrator
        .place_outgoing_call(OutgoingCallRequest::new("tel:555-0202"))
        .await
        .unwrap();

    assert_eq!(redial, Some(parked));
    let call = bench.orchestrator.call(parked).unwrap();
    assert_eq!(call.target_account, Some(sim("sim1")));
    assert!(!call.is_self_managed);
    assert!(bench.app_backend.connection_requests().is_empty());
    assert_eq!(bench.sim_backend.connection_requests().len(), 2);
    assert!(bench.prompts.try_recv().is_err());
}
