//! Admission control
//!
//! Stateless policy deciding whether a new call may proceed and what has to
//! yield for it. Every function reads a population snapshot and returns a
//! decision value; the orchestrator carries out the holds and disconnects.

use crate::accounts::PhoneAccountRegistry;
use crate::call::Call;
use crate::registry::{CallFilter, CallRegistry};
use crate::types::{CallId, CallState, DisconnectCause, DisconnectCode};
use serde::{Deserialize, Serialize};

const LIVE_STATES: &[CallState] = &[
    CallState::Connecting,
    CallState::Dialing,
    CallState::Pulling,
    CallState::Active,
    CallState::AudioProcessing,
];
const HELD_STATES: &[CallState] = &[CallState::OnHold];
const RINGING_STATES: &[CallState] = &[CallState::Ringing, CallState::SimulatedRinging];
const OUTGOING_SETUP_STATES: &[CallState] = &[
    CallState::SelectPhoneAccount,
    CallState::Connecting,
    CallState::Dialing,
    CallState::Pulling,
];

/// Call-count ceilings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionLimits {
    /// Active, dialing, connecting or pulling calls
    pub max_live_calls: usize,
    /// Held calls
    pub max_held_calls: usize,
    /// Ringing calls
    pub max_ringing_calls: usize,
    /// Outgoing calls still being set up
    pub max_outgoing_calls: usize,
    /// Top-level managed calls
    pub max_top_level_calls: usize,
    /// Calls per self-managed account
    pub max_self_managed_calls: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_live_calls: 1,
            max_held_calls: 1,
            max_ringing_calls: 1,
            max_outgoing_calls: 1,
            max_top_level_calls: 2,
            max_self_managed_calls: 10,
        }
    }
}

/// Something that has to happen before a new call may proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAction {
    /// Put the call on hold
    Hold(CallId),
    /// Disconnect the call, forcing `cause` over whatever the backend reports
    Disconnect {
        /// Call to disconnect
        call_id: CallId,
        /// Override cause, if any
        cause: Option<DisconnectCause>,
    },
    /// Reject a ringing call, forcing `cause` over whatever the backend reports
    Reject {
        /// Call to reject
        call_id: CallId,
        /// Override cause
        cause: DisconnectCause,
    },
}

/// Outcome of a make-room check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomDecision {
    /// The call may proceed once `actions` are carried out
    Proceed {
        /// Holds and disconnects to perform, in order
        actions: Vec<RoomAction>,
    },
    /// The call may not proceed
    Blocked {
        /// Call standing in the way, if one can be named
        blocking: Option<CallId>,
        /// Diagnostic reason
        reason: &'static str,
    },
}

impl RoomDecision {
    fn proceed() -> Self {
        Self::Proceed {
            actions: Vec::new(),
        }
    }

    fn proceed_with(action: RoomAction) -> Self {
        Self::Proceed {
            actions: vec![action],
        }
    }

    /// Whether the call may proceed
    #[must_use]
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed { .. })
    }

    /// Actions to carry out, empty when blocked
    #[must_use]
    pub fn actions(&self) -> &[RoomAction] {
        match self {
            Self::Proceed { actions } => actions,
            Self::Blocked { .. } => &[],
        }
    }
}

/// Outcome of the incoming-call check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingAdmission {
    /// The call may ring
    Allow,
    /// The call must be turned away with `cause`
    Reject {
        /// Cause recorded on the rejected call
        cause: DisconnectCause,
        /// Diagnostic reason
        reason: &'static str,
    },
}

/// Population queries shared by the policy functions
pub struct Admission<'a> {
    registry: &'a CallRegistry,
    accounts: &'a PhoneAccountRegistry,
    limits: &'a AdmissionLimits,
}

impl<'a> Admission<'a> {
    /// Bind the policy to a population snapshot
    #[must_use]
    pub fn new(
        registry: &'a CallRegistry,
        accounts: &'a PhoneAccountRegistry,
        limits: &'a AdmissionLimits,
    ) -> Self {
        Self {
            registry,
            accounts,
            limits,
        }
    }

    fn count_managed(&self, states: &[CallState], exclude: CallId) -> usize {
        self.registry
            .count(&CallFilter::states(states).managed().excluding(exclude))
    }

    fn has_max_live(&self, call: &Call) -> bool {
        self.count_managed(LIVE_STATES, call.id()) >= self.limits.max_live_calls
    }

    fn has_max_held(&self, call: &Call) -> bool {
        self.count_managed(HELD_STATES, call.id()) >= self.limits.max_held_calls
    }

    fn has_max_ringing(&self, call: &Call) -> bool {
        self.count_managed(RINGING_STATES, call.id()) >= self.limits.max_ringing_calls
    }

    fn has_max_outgoing(&self, call: &Call) -> bool {
        self.count_managed(OUTGOING_SETUP_STATES, call.id()) >= self.limits.max_outgoing_calls
    }

    fn has_max_top_level(&self, call: &Call) -> bool {
        self.count_managed(&[], call.id()) >= self.limits.max_top_level_calls
    }

    fn first_managed(&self, states: &[CallState], exclude: CallId) -> Option<&'a Call> {
        self.registry
            .first(&CallFilter::states(states).managed().excluding(exclude))
    }

    fn same_package(a: &Call, b: &Call) -> bool {
        match (a.target_account(), b.target_account()) {
            (Some(a), Some(b)) => a.same_package(b),
            _ => false,
        }
    }

    fn lacks_emergency_capability(&self, call: &Call) -> bool {
        call.target_account()
            .and_then(|handle| self.accounts.get(handle))
            .map_or(true, |account| !account.emergency_capable)
    }

    /// Find the un-holdable, focus-eligible call on another backend that
    /// would stand in the way of `call`
    fn unholdable_call_elsewhere(&self, call: &Call) -> Option<&'a Call> {
        self.registry.iter().find(|other| {
            other.id() != call.id()
                && other.is_alive()
                && other.is_focusable()
                && matches!(
                    other.state(),
                    CallState::Active | CallState::Dialing | CallState::Connecting | CallState::Pulling
                )
                && !other.can_hold()
                && !Self::same_package(other, call)
        })
    }

    /// Make room for a managed outgoing call
    #[must_use]
    pub fn make_room_for_outgoing_call(&self, call: &Call) -> RoomDecision {
        if !self.has_max_live(call) {
            return RoomDecision::proceed();
        }
        let Some(live) = self.first_managed(LIVE_STATES, call.id()) else {
            return RoomDecision::proceed();
        };

        if self.has_max_outgoing(call) {
            if let Some(outgoing) = self.first_managed(OUTGOING_SETUP_STATES, call.id()) {
                if outgoing.state() == CallState::SelectPhoneAccount {
                    tracing::info!(call_id = %call.id(), orphan = %outgoing.id(), "Dropping call stuck in account selection");
                    return RoomDecision::proceed_with(RoomAction::Disconnect {
                        call_id: outgoing.id(),
                        cause: None,
                    });
                }
                return RoomDecision::Blocked {
                    blocking: Some(outgoing.id()),
                    reason: "another outgoing call is being set up",
                };
            }
        }

        if call.target_account().is_none() {
            // Package and hold decisions wait until an account is chosen
            return RoomDecision::proceed();
        }

        if Self::same_package(live, call) {
            // The backend arbitrates between its own calls
            return RoomDecision::proceed();
        }

        if self.has_max_held(call) {
            return RoomDecision::Blocked {
                blocking: Some(live.id()),
                reason: "held call ceiling reached",
            };
        }

        if live.can_hold() {
            return RoomDecision::proceed_with(RoomAction::Hold(live.id()));
        }

        RoomDecision::Blocked {
            blocking: Some(live.id()),
            reason: "live call cannot be held",
        }
    }

    /// Make room for an outgoing emergency call
    ///
    /// Ringing calls are always dropped first and logged as missed.
    #[must_use]
    pub fn make_room_for_outgoing_emergency_call(&self, call: &Call) -> RoomDecision {
        // Every ringing call goes, whichever account it arrived on, so
        // nothing competes with the emergency call for audio or the user
        let mut actions: Vec<RoomAction> = self
            .registry
            .matching(&CallFilter::states(RINGING_STATES).excluding(call.id()))
            .into_iter()
            .map(|call_id| RoomAction::Reject {
                call_id,
                cause: DisconnectCause::with_reason(
                    DisconnectCode::Missed,
                    "dropped for emergency call",
                ),
            })
            .collect();
        let dropped: Vec<CallId> = actions
            .iter()
            .filter_map(|action| match action {
                RoomAction::Reject { call_id, .. } => Some(*call_id),
                _ => None,
            })
            .collect();

        if !self.has_max_live(call) {
            return RoomDecision::Proceed { actions };
        }

        if self.has_max_outgoing(call) {
            if let Some(outgoing) = self.first_managed(OUTGOING_SETUP_STATES, call.id()) {
                if outgoing.is_emergency() && outgoing.state() != CallState::SelectPhoneAccount {
                    return RoomDecision::Blocked {
                        blocking: Some(outgoing.id()),
                        reason: "another emergency call is being set up",
                    };
                }
                actions.push(RoomAction::Disconnect {
                    call_id: outgoing.id(),
                    cause: None,
                });
                return RoomDecision::Proceed { actions };
            }
        }

        let live = self
            .first_managed(LIVE_STATES, call.id())
            .filter(|live| !dropped.contains(&live.id()));
        let Some(live) = live else {
            return RoomDecision::Proceed { actions };
        };

        if live.state() == CallState::AudioProcessing {
            actions.push(RoomAction::Disconnect {
                call_id: live.id(),
                cause: None,
            });
            return RoomDecision::Proceed { actions };
        }

        if self.lacks_emergency_capability(live) {
            tracing::info!(call_id = %call.id(), live = %live.id(), "Disconnecting live call on a backend without emergency support");
            actions.push(RoomAction::Disconnect {
                call_id: live.id(),
                cause: None,
            });
            return RoomDecision::Proceed { actions };
        }

        let same_backend = match (live.target_account(), call.target_account()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if same_backend {
            if live.can_hold() {
                actions.push(RoomAction::Hold(live.id()));
            }
            return RoomDecision::Proceed { actions };
        }

        if live.can_hold() {
            if let Some(held) = self.first_managed(HELD_STATES, call.id()) {
                if self.has_max_held(call) {
                    actions.push(RoomAction::Disconnect {
                        call_id: held.id(),
                        cause: None,
                    });
                }
            }
            actions.push(RoomAction::Hold(live.id()));
        } else {
            actions.push(RoomAction::Disconnect {
                call_id: live.id(),
                cause: None,
            });
        }
        RoomDecision::Proceed { actions }
    }

    /// Whether an incoming call may ring
    #[must_use]
    pub fn admit_incoming_call(&self, call: &Call) -> IncomingAdmission {
        let busy = |reason: &'static str| IncomingAdmission::Reject {
            cause: DisconnectCause::with_reason(DisconnectCode::Busy, reason),
            reason,
        };

        if call.is_self_managed() {
            return match self.check_self_managed(call) {
                Some(reason) => busy(reason),
                None => IncomingAdmission::Allow,
            };
        }

        if self.has_max_ringing(call) {
            return busy("ringing call ceiling reached");
        }
        if self.has_max_outgoing(call) {
            return busy("outgoing call being set up");
        }
        if self.has_max_top_level(call) {
            return busy("top-level call ceiling reached");
        }
        IncomingAdmission::Allow
    }

    fn check_self_managed(&self, call: &Call) -> Option<&'static str> {
        if self.registry.is_in_emergency_call() {
            return Some("emergency call in progress");
        }
        if let Some(account) = call.target_account() {
            let on_account = self.registry.count(
                &CallFilter {
                    self_managed: Some(true),
                    ..CallFilter::default()
                }
                .excluding(call.id())
                .on_account(account),
            );
            if on_account >= self.limits.max_self_managed_calls {
                return Some("self-managed call ceiling reached");
            }
        }
        if self.unholdable_call_elsewhere(call).is_some() {
            return Some("un-holdable call on another backend");
        }
        None
    }

    /// Whether a self-managed outgoing call may be placed
    ///
    /// A blocking managed call that cannot be held is reported as
    /// `Blocked` with its id so the user can be asked to drop it.
    #[must_use]
    pub fn check_outgoing_self_managed(&self, call: &Call) -> RoomDecision {
        if self.registry.is_in_emergency_call() {
            return RoomDecision::Blocked {
                blocking: None,
                reason: "emergency call in progress",
            };
        }
        if let Some(account) = call.target_account() {
            let on_account = self.registry.count(
                &CallFilter {
                    self_managed: Some(true),
                    ..CallFilter::default()
                }
                .excluding(call.id())
                .on_account(account),
            );
            if on_account >= self.limits.max_self_managed_calls {
                return RoomDecision::Blocked {
                    blocking: None,
                    reason: "self-managed call ceiling reached",
                };
            }
        }
        if let Some(other) = self.unholdable_call_elsewhere(call) {
            return RoomDecision::Blocked {
                blocking: Some(other.id()),
                reason: "un-holdable call on another backend",
            };
        }
        let holdable_elsewhere: Vec<RoomAction> = self
            .registry
            .iter()
            .filter(|other| {
                other.id() != call.id()
                    && other.is_focusable()
                    && other.state() == CallState::Active
                    && other.can_hold()
                    && !Self::same_package(other, call)
            })
            .map(|other| RoomAction::Hold(other.id()))
            .collect();
        RoomDecision::Proceed {
            actions: holdable_elsewhere,
        }
    }

    /// Make room to answer `call`
    #[must_use]
    pub fn make_room_for_answer(&self, call: &Call) -> RoomDecision {
        let foreground = self.registry.iter().find(|other| {
            other.id() != call.id()
                && other.is_focusable()
                && other.state() == CallState::Active
                && !other.is_locally_disconnecting()
        });
        let Some(foreground) = foreground else {
            return RoomDecision::proceed();
        };

        let held = self.first_managed(HELD_STATES, call.id());
        if foreground.can_hold() {
            let mut actions = Vec::new();
            if let Some(held) = held.filter(|_| self.has_max_held(call)) {
                actions.push(RoomAction::Disconnect {
                    call_id: held.id(),
                    cause: None,
                });
            }
            actions.push(RoomAction::Hold(foreground.id()));
            return RoomDecision::Proceed { actions };
        }

        let same_package = Self::same_package(foreground, call);
        if foreground.supports_hold() && same_package {
            let mut actions = Vec::new();
            if let Some(held) = held {
                actions.push(RoomAction::Disconnect {
                    call_id: held.id(),
                    cause: None,
                });
            }
            actions.push(RoomAction::Hold(foreground.id()));
            return RoomDecision::Proceed { actions };
        }

        if !same_package {
            if foreground.is_emergency() {
                return RoomDecision::Blocked {
                    blocking: Some(foreground.id()),
                    reason: "emergency call cannot be dropped",
                };
            }
            return RoomDecision::proceed_with(RoomAction::Disconnect {
                call_id: foreground.id(),
                cause: None,
            });
        }

        // Same backend without hold support: the backend decides
        RoomDecision::proceed()
    }
}
