//! Switchboard - call session orchestration engine
//!
//! This library tracks every voice or video call on a device, whichever
//! backend carries it, and keeps the set consistent while backends, the user
//! and the audio hardware act on it concurrently. It features:
//!
//! - **Call lifecycle**: an open state machine that accepts untrusted backend
//!   signaling, with monotonic durations and conference/handover links
//! - **Audio focus arbitration**: a message-driven state machine on its own
//!   task deciding ringing, call-waiting tones and audio modes
//! - **Admission control**: call-count ceilings, cross-backend hold and
//!   emergency-call pre-emption
//! - **Outgoing pipeline**: redirection, account selection, admission and
//!   backend fallback as one cancellable async flow
//! - **Handover**: paired migration of a live call between backends
//!
//! # Examples
//!
//! ```rust,no_run
//! use switchboard_core::loopback::LoopbackConnectionService;
//! use switchboard_core::{
//!     CallOrchestrator, OutgoingCallRequest, PhoneAccount, PhoneAccountHandle,
//!     PhoneAccountRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let accounts = Arc::new(PhoneAccountRegistry::new());
//! let sim = PhoneAccountHandle::new("com.example.telephony", "sim1");
//! accounts.register(
//!     PhoneAccount::sim(sim.clone(), "SIM 1"),
//!     Arc::new(LoopbackConnectionService::new()),
//! );
//!
//! let orchestrator = CallOrchestrator::builder(accounts).build()?;
//! let mut events = orchestrator.subscribe();
//!
//! let call_id = orchestrator
//!     .place_outgoing_call(OutgoingCallRequest::new("tel:555-1234").on_account(sim))
//!     .await?;
//! println!("placed {call_id:?}, first event {:?}", events.recv().await?);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Wall-clock and monotonic time sources
pub mod clock;

/// Phone accounts and their backends
pub mod accounts;

/// The call entity and its state machine
pub mod call;

/// Arena of tracked calls
pub mod registry;

/// Call event fan-out
pub mod listener;

/// Backend binding
pub mod backend;

/// Interfaces to suggestion, directory, filter and prompt services
pub mod collaborators;

/// Orchestrator configuration
pub mod config;

/// Admission control policy
pub mod admission;

/// Audio focus arbitration
pub mod audio;

/// Call handover between backends
pub mod handover;

/// The call session orchestrator
pub mod orchestrator;

/// In-process backend and recording fakes
pub mod loopback;

// Re-export main types at crate root
pub use accounts::{PhoneAccount, PhoneAccountHandle, PhoneAccountRegistry};
pub use admission::{AdmissionLimits, IncomingAdmission, RoomAction, RoomDecision};
pub use audio::focus::{AudioFocusArbiter, AudioFocusHandle, FocusFacts, FocusMessage, FocusState};
pub use audio::{AudioManager, AudioMode, FocusType, Ringer};
pub use backend::{BackendCommand, ConferenceRequest, ConnectionRequest, ConnectionService};
pub use call::{Call, StateTransition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    AccountSuggestion, CallerIdScreening, DirectoryLookup, FilterVerdict, IncomingCallDetails,
    IncomingCallFilter, RedirectionService, SuggestionReason, SuggestionService, UserPrompts,
};
pub use config::{ConfigError, OrchestratorConfig, PipelineTimeouts};
pub use listener::{CallsListener, EventBus};
pub use orchestrator::{
    BackendEvent, CallOrchestrator, CallOrchestratorBuilder, ConferenceCallRequest,
    IncomingCallRequest, OrchestratorError, OutgoingCallRequest,
};
pub use registry::CallRegistry;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accounts::{PhoneAccount, PhoneAccountHandle, PhoneAccountRegistry};
    pub use crate::orchestrator::{
        BackendEvent, CallOrchestrator, IncomingCallRequest, OrchestratorError,
        OutgoingCallRequest,
    };
    pub use crate::types::{CallEvent, CallId, CallSnapshot, CallState, DisconnectCause};
}
