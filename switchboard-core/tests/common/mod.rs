//! Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use switchboard_core::loopback::LoopbackConnectionService;
use switchboard_core::{
    OrchestratorConfig, PhoneAccount, PhoneAccountHandle, PhoneAccountRegistry,
};

pub fn sim(id: &str) -> PhoneAccountHandle {
    PhoneAccountHandle::new("com.example.telephony", id)
}

pub fn voip(id: &str) -> PhoneAccountHandle {
    PhoneAccountHandle::new("com.example.voip", id)
}

pub fn app(id: &str) -> PhoneAccountHandle {
    PhoneAccountHandle::new("com.example.messenger", id)
}

/// Route test logs through `RUST_LOG` once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Register `account` on its own loopback backend
pub fn register(
    accounts: &PhoneAccountRegistry,
    account: PhoneAccount,
) -> Arc<LoopbackConnectionService> {
    init_tracing();
    let backend = Arc::new(LoopbackConnectionService::new());
    accounts.register(account, backend.clone());
    backend
}

/// Config with timeouts short enough for tests to hit them
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.timeouts.suggestion_ms = 20;
    config.timeouts.user_prompt_ms = 200;
    config.timeouts.lookup_ms = 50;
    config.timeouts.filter_ms = 50;
    config.timeouts.pending_disconnect_grace_ms = 3_000;
    config
}

/// Poll `check` until it holds; work spawned by the orchestrator settles
/// asynchronously
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
