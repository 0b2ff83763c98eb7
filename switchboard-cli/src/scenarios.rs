//! Simulated device and scripted call scenarios

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::loopback::{FixedVerdictFilter, LoopbackConnectionService};
use switchboard_core::prelude::*;
use switchboard_core::{
    Capabilities, DisconnectCode, FilterVerdict, OrchestratorConfig, PhoneAccount, PhoneAccountHandle,
    PhoneAccountRegistry, VideoState,
};

/// Scripted scenarios for `switchboard demo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Second call on the same SIM while the first stays active
    SameBackend,
    /// Emergency call turning away a ringing call as missed
    EmergencyPreemption,
    /// Active SIM call handed over to the work line
    Handover,
    /// Call-waiting tone, then answering the waiting call
    CallWaiting,
}

/// Incoming-call filter verdicts selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliVerdict {
    /// Ring normally
    Allow,
    /// Ring silently
    Silence,
    /// Route audio to a screening process first
    Screen,
    /// Turn the call away and log it as missed
    Reject,
}

impl From<CliVerdict> for FilterVerdict {
    fn from(verdict: CliVerdict) -> Self {
        match verdict {
            CliVerdict::Allow => FilterVerdict::Allow,
            CliVerdict::Silence => FilterVerdict::Silence,
            CliVerdict::Screen => FilterVerdict::ScreenViaAudio,
            CliVerdict::Reject => FilterVerdict::RejectAsMissed,
        }
    }
}

/// Resolve the configuration: an explicit file, else the per-user config
/// file when present, else defaults. `SWITCHBOARD_*` variables apply last.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let file = path.map(Path::to_path_buf).or_else(default_config_path);
    let base = match file {
        Some(file) if path.is_some() || file.exists() => {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            OrchestratorConfig::from_file(&file)
                .with_context(|| format!("reading {}", file.display()))?
        }
        _ => OrchestratorConfig::default(),
    };
    Ok(base.with_overrides(&std::env::vars().collect())?)
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "switchboard", "switchboard")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// A simulated handset: two SIMs of one carrier and a work VoIP line, all
/// served by loopback backends
pub struct Device {
    /// The orchestrator under test
    pub orchestrator: CallOrchestrator,
    /// Backend of both SIMs
    pub carrier: Arc<LoopbackConnectionService>,
    /// Backend of the work line
    pub work: Arc<LoopbackConnectionService>,
}

impl Device {
    /// Build the device with `verdict` applied to every incoming call
    pub fn new(config: OrchestratorConfig, verdict: FilterVerdict) -> Result<Self> {
        let accounts = Arc::new(PhoneAccountRegistry::new());
        let carrier = Arc::new(LoopbackConnectionService::new());
        let work = Arc::new(LoopbackConnectionService::new());
        accounts.register(
            PhoneAccount::sim(Self::sim1(), "SIM 1").with_handover(),
            carrier.clone(),
        );
        accounts.register(PhoneAccount::sim(Self::sim2(), "SIM 2"), carrier.clone());
        accounts.register(
            PhoneAccount::managed(Self::work_line(), "Work").with_handover(),
            work.clone(),
        );
        accounts.set_default_outgoing(Some(Self::sim1()));

        let orchestrator = CallOrchestrator::builder(accounts)
            .with_config(config)
            .with_incoming_filter(Arc::new(FixedVerdictFilter(verdict)))
            .build()?;
        Ok(Self {
            orchestrator,
            carrier,
            work,
        })
    }

    /// First SIM
    pub fn sim1() -> PhoneAccountHandle {
        PhoneAccountHandle::new("com.example.carrier", "sim1")
    }

    /// Second SIM
    pub fn sim2() -> PhoneAccountHandle {
        PhoneAccountHandle::new("com.example.carrier", "sim2")
    }

    /// Work VoIP line
    pub fn work_line() -> PhoneAccountHandle {
        PhoneAccountHandle::new("com.example.work", "line")
    }

    /// Map a command-line account name to its handle
    pub fn account(name: &str) -> Result<PhoneAccountHandle> {
        match name {
            "sim1" => Ok(Self::sim1()),
            "sim2" => Ok(Self::sim2()),
            "work" => Ok(Self::work_line()),
            other => bail!("unknown account '{other}' (expected sim1, sim2 or work)"),
        }
    }

    async fn place(&self, address: &str, account: Option<PhoneAccountHandle>) -> Result<CallId> {
        let mut request = OutgoingCallRequest::new(address);
        if let Some(account) = account {
            request = request.on_account(account);
        }
        self.orchestrator
            .place_outgoing_call(request)
            .await?
            .with_context(|| format!("call to {address} did not go through"))
    }

    async fn ring(&self, account: PhoneAccountHandle, from: &str) -> Result<Option<CallId>> {
        Ok(self
            .orchestrator
            .add_incoming_call(IncomingCallRequest::new(account, Some(from.to_string())))
            .await?)
    }

    /// Dial and let the far end pick up
    pub async fn dial(&self, address: &str, account: Option<PhoneAccountHandle>) -> Result<CallId> {
        let call_id = self.place(address, account).await?;
        self.orchestrator
            .handle_backend_event(call_id, BackendEvent::SetDialing);
        self.orchestrator
            .handle_backend_event(call_id, BackendEvent::SetActive);
        Ok(call_id)
    }

    /// Take an incoming call from `from` on SIM 1
    pub async fn receive(&self, from: &str, auto_answer: bool) -> Result<Option<CallId>> {
        let Some(call_id) = self.ring(Self::sim1(), from).await? else {
            return Ok(None);
        };
        if auto_answer && self.state(call_id) == Some(CallState::Ringing) {
            self.orchestrator.answer_call(call_id, VideoState::AUDIO_ONLY)?;
            self.orchestrator
                .handle_backend_event(call_id, BackendEvent::SetActive);
        }
        Ok(Some(call_id))
    }

    /// Hang up and confirm the disconnect from the backend side
    pub fn hang_up(&self, call_id: CallId) -> Result<()> {
        self.orchestrator.disconnect_call(call_id)?;
        self.orchestrator.handle_backend_event(
            call_id,
            BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Local)),
        );
        Ok(())
    }

    /// End a call the far end never picked up
    pub fn release(&self, call_id: CallId) {
        self.orchestrator.handle_backend_event(
            call_id,
            BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Remote)),
        );
    }

    /// Current state of a call, `None` once it is gone
    pub fn state(&self, call_id: CallId) -> Option<CallState> {
        self.orchestrator.call(call_id).map(|call| call.state)
    }
}

/// Run a scripted scenario to completion
pub async fn run(device: &Device, scenario: Scenario) -> Result<()> {
    tracing::info!(scenario = ?scenario, "Running scenario");
    match scenario {
        Scenario::SameBackend => same_backend(device).await,
        Scenario::EmergencyPreemption => emergency_preemption(device).await,
        Scenario::Handover => handover(device).await,
        Scenario::CallWaiting => call_waiting(device).await,
    }
}

async fn same_backend(device: &Device) -> Result<()> {
    let first = device.dial("tel:555-0100", Some(Device::sim1())).await?;
    let second = device.place("tel:555-0101", Some(Device::sim1())).await?;
    println!(
        "first call {first} is {:?}, second call {second} is {:?}",
        device.state(first),
        device.state(second)
    );
    device.release(second);
    device.hang_up(first)
}

async fn emergency_preemption(device: &Device) -> Result<()> {
    let ringing = device
        .ring(Device::work_line(), "tel:555-0199")
        .await?
        .context("incoming call was turned away")?;
    let emergency = device.dial("tel:911", None).await?;
    println!(
        "emergency call {emergency} is {:?}, ringing call {ringing} is gone: {}",
        device.state(emergency),
        device.state(ringing).is_none()
    );
    device.hang_up(emergency)
}

async fn handover(device: &Device) -> Result<()> {
    let source = device.dial("tel:555-0142", Some(Device::sim1())).await?;
    let destination =
        device
            .orchestrator
            .request_handover(source, &Device::work_line(), VideoState::AUDIO_ONLY)?;

    wait_until(|| !device.work.connection_requests().is_empty()).await?;
    device
        .orchestrator
        .handle_backend_event(destination, BackendEvent::SetActive);
    device.orchestrator.handle_backend_event(
        source,
        BackendEvent::SetDisconnected(DisconnectCause::new(DisconnectCode::Local)),
    );
    println!(
        "call {source} moved to {destination}, now {:?} on the work line",
        device.state(destination)
    );
    device.hang_up(destination)
}

async fn call_waiting(device: &Device) -> Result<()> {
    let first = device.dial("tel:555-0150", Some(Device::sim1())).await?;
    device.orchestrator.handle_backend_event(
        first,
        BackendEvent::SetCapabilities(Capabilities::HOLD | Capabilities::SUPPORT_HOLD),
    );
    let waiting = device
        .ring(Device::sim1(), "tel:555-0151")
        .await?
        .context("waiting call was turned away")?;
    println!(
        "audio focus with a waiting call: {:?}",
        device.orchestrator.audio_focus_state().await?
    );

    device
        .orchestrator
        .answer_call(waiting, VideoState::AUDIO_ONLY)?;
    device
        .orchestrator
        .handle_backend_event(first, BackendEvent::SetOnHold);
    device
        .orchestrator
        .handle_backend_event(waiting, BackendEvent::SetActive);
    println!(
        "answered {waiting}; {first} is {:?}; audio focus {:?}",
        device.state(first),
        device.orchestrator.audio_focus_state().await?
    );
    device.hang_up(waiting)?;
    device.hang_up(first)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bail!("timed out waiting for the backend")
}

/// One line of human-readable output per event
pub fn describe_event(event: &CallEvent) -> String {
    match event {
        CallEvent::CallAdded { call } => format!(
            "call {} added ({:?}, {})",
            call.call_id,
            call.direction,
            call.address.as_deref().unwrap_or("unknown")
        ),
        CallEvent::CallStateChanged {
            call_id,
            old_state,
            new_state,
        } => format!("call {call_id}: {old_state} -> {new_state}"),
        CallEvent::CallDetailsChanged { call } => format!("call {} details changed", call.call_id),
        CallEvent::ParentChanged { call_id, parent } => match parent {
            Some(parent) => format!("call {call_id} joined conference {parent}"),
            None => format!("call {call_id} left its conference"),
        },
        CallEvent::ConferenceSwapped {
            conference_id,
            active_child,
        } => format!("conference {conference_id} swapped to {active_child:?}"),
        CallEvent::CallerInfoUpdated { call_id, info } => format!(
            "call {call_id} identified as {}",
            info.name.as_deref().unwrap_or("unknown caller")
        ),
        CallEvent::HoldFailed { call_id } => format!("call {call_id} could not be held"),
        CallEvent::ConnectionEvent { call_id, event, .. } => {
            format!("call {call_id} backend event {event}")
        }
        CallEvent::RttRequested {
            call_id,
            request_id,
        } => format!("call {call_id} remote asked for RTT (request {request_id})"),
        CallEvent::HandoverFailed { call_id, reason } => {
            format!("handover of call {call_id} failed: {reason:?}")
        }
        CallEvent::HandoverComplete {
            source,
            destination,
        } => format!("handover of call {source} to {destination} complete"),
        CallEvent::CallRemoved { call } => format!(
            "call {} removed ({:?}, connected {} ms)",
            call.call_id, call.disconnect_cause.code, call.age_millis
        ),
    }
}

#[cfg(test)]
#[path = "scenarios_tests.rs"]
mod tests;
