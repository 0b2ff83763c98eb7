//! Arena of tracked calls
//!
//! Calls reference each other (conference parent/children, handover
//! source/destination) by [`CallId`] only. The registry keeps both sides of
//! every link consistent and answers the population questions asked by
//! admission control and audio focus.

use crate::accounts::PhoneAccountHandle;
use crate::call::{Call, StateTransition};
use crate::clock::Clock;
use crate::types::{CallDirection, CallId, CallIdGenerator, CallSnapshot, CallState};
use std::collections::HashMap;

/// Filter for counting calls
///
/// Only top-level (no parent), non-external calls are ever counted.
#[derive(Debug, Clone, Default)]
pub struct CallFilter<'a> {
    /// States to match; empty matches every alive state
    pub states: &'a [CallState],
    /// Restrict to self-managed (`Some(true)`) or managed (`Some(false)`) calls
    pub self_managed: Option<bool>,
    /// Call to leave out of the count
    pub exclude: Option<CallId>,
    /// Restrict to calls whose delegate account is this one
    pub account: Option<&'a PhoneAccountHandle>,
}

impl<'a> CallFilter<'a> {
    /// Match calls in any of `states`
    #[must_use]
    pub fn states(states: &'a [CallState]) -> Self {
        Self {
            states,
            ..Self::default()
        }
    }

    /// Restrict to managed calls
    #[must_use]
    pub fn managed(mut self) -> Self {
        self.self_managed = Some(false);
        self
    }

    /// Leave out `call_id`
    #[must_use]
    pub fn excluding(mut self, call_id: CallId) -> Self {
        self.exclude = Some(call_id);
        self
    }

    /// Restrict to one account
    #[must_use]
    pub fn on_account(mut self, account: &'a PhoneAccountHandle) -> Self {
        self.account = Some(account);
        self
    }

    fn matches(&self, call: &Call) -> bool {
        call.is_alive()
            && call.parent().is_none()
            && !call.is_external()
            && self.exclude != Some(call.id())
            && (self.states.is_empty() || self.states.contains(&call.state()))
            && self.self_managed.map_or(true, |sm| call.is_self_managed() == sm)
            && self
                .account
                .map_or(true, |account| call.delegate_account() == Some(account))
    }
}

/// All calls tracked by one orchestrator
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: HashMap<CallId, Call>,
    order: Vec<CallId>,
    ids: CallIdGenerator,
}

impl CallRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and track a new call
    pub fn create(&mut self, direction: CallDirection, clock: &dyn Clock) -> CallId {
        let id = self.ids.next_id();
        self.insert(Call::new(id, direction, clock));
        id
    }

    /// Track an existing call
    pub fn insert(&mut self, call: Call) {
        let id = call.id();
        if self.calls.insert(id, call).is_none() {
            self.order.push(id);
        }
    }

    /// Stop tracking a call and release its resources
    ///
    /// Any remaining links to the call are cleared on the other side.
    pub fn remove(&mut self, call_id: CallId) -> Option<Call> {
        self.sever_links(call_id);
        let mut call = self.calls.remove(&call_id)?;
        self.order.retain(|id| *id != call_id);
        for other in self.calls.values_mut() {
            if other.handover_source() == Some(call_id) {
                other.set_handover_source(None);
            }
            if other.handover_destination() == Some(call_id) {
                other.set_handover_destination(None);
            }
        }
        call.release();
        Some(call)
    }

    /// Look up a call
    #[must_use]
    pub fn get(&self, call_id: CallId) -> Option<&Call> {
        self.calls.get(&call_id)
    }

    /// Look up a call for mutation
    pub fn get_mut(&mut self, call_id: CallId) -> Option<&mut Call> {
        self.calls.get_mut(&call_id)
    }

    /// Whether the call is tracked
    #[must_use]
    pub fn contains(&self, call_id: CallId) -> bool {
        self.calls.contains_key(&call_id)
    }

    /// Number of tracked calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Calls in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Call> {
        self.order.iter().filter_map(|id| self.calls.get(id))
    }

    /// Change a call's state
    ///
    /// A committed transition into `Disconnected` first severs the call's
    /// conference links so no parent or child ever points at a terminal call.
    /// Returns `None` for an unknown call.
    pub fn set_state(
        &mut self,
        call_id: CallId,
        new_state: CallState,
        clock: &dyn Clock,
    ) -> Option<StateTransition> {
        let refused = self.calls.get(&call_id)?.check_transition(new_state);
        if let Some(refused) = refused {
            return Some(refused);
        }
        if new_state == CallState::Disconnected {
            self.sever_links(call_id);
        }
        self.calls
            .get_mut(&call_id)
            .map(|call| call.set_state(new_state, clock))
    }

    fn sever_links(&mut self, call_id: CallId) {
        let Some(call) = self.calls.get(&call_id) else {
            return;
        };
        let parent = call.parent();
        let children = call.children().to_vec();

        if let Some(parent) = parent.and_then(|id| self.calls.get_mut(&id)) {
            parent.remove_child_link(call_id);
        }
        for child in children {
            if let Some(child) = self.calls.get_mut(&child) {
                child.set_parent_link(None);
            }
        }
        if let Some(call) = self.calls.get_mut(&call_id) {
            call.set_parent_link(None);
            for child in call.children().to_vec() {
                call.remove_child_link(child);
            }
        }
    }

    /// Attach `child` to `parent`, or detach it when `parent` is `None`
    ///
    /// Conference trees are two levels deep: a call that has a parent cannot
    /// become a parent, and a parent cannot be attached under another call.
    /// Returns `false` when the change was refused.
    pub fn set_parent(&mut self, child: CallId, parent: Option<CallId>) -> bool {
        if parent == Some(child) || !self.calls.contains_key(&child) {
            return false;
        }
        if let Some(parent_id) = parent {
            let Some(parent_call) = self.calls.get(&parent_id) else {
                return false;
            };
            let child_has_children = self
                .calls
                .get(&child)
                .is_some_and(|call| !call.children().is_empty());
            if parent_call.parent().is_some() || child_has_children {
                tracing::warn!(call_id = %child, parent = %parent_id, "Refusing nested conference");
                return false;
            }
            if !parent_call.is_alive() {
                return false;
            }
        }

        let old_parent = self.calls.get(&child).and_then(Call::parent);
        if old_parent == parent {
            return true;
        }
        if let Some(old) = old_parent.and_then(|id| self.calls.get_mut(&id)) {
            old.remove_child_link(child);
        }
        if let Some(new_parent) = parent.and_then(|id| self.calls.get_mut(&id)) {
            new_parent.add_child_link(child);
        }
        if let Some(call) = self.calls.get_mut(&child) {
            call.set_parent_link(parent);
        }
        true
    }

    /// Count top-level calls matching `filter`
    #[must_use]
    pub fn count(&self, filter: &CallFilter<'_>) -> usize {
        self.iter().filter(|call| filter.matches(call)).count()
    }

    /// First top-level call matching `filter`, in creation order
    #[must_use]
    pub fn first(&self, filter: &CallFilter<'_>) -> Option<&Call> {
        self.iter().find(|call| filter.matches(call))
    }

    /// All top-level calls matching `filter`, in creation order
    #[must_use]
    pub fn matching(&self, filter: &CallFilter<'_>) -> Vec<CallId> {
        self.iter()
            .filter(|call| filter.matches(call))
            .map(Call::id)
            .collect()
    }

    /// First live top-level call other than `exclude`
    #[must_use]
    pub fn first_live_call(&self, exclude: CallId) -> Option<&Call> {
        self.iter().find(|call| {
            call.id() != exclude
                && call.state().is_live()
                && call.parent().is_none()
                && !call.is_external()
        })
    }

    /// The call currently in the foreground: the first live call, or failing
    /// that the first held call
    #[must_use]
    pub fn foreground_call(&self) -> Option<&Call> {
        let top_level = |call: &&Call| call.is_focusable() && call.is_alive();
        self.iter()
            .filter(top_level)
            .find(|call| matches!(call.state(), CallState::Active | CallState::Dialing | CallState::Pulling | CallState::Connecting))
            .or_else(|| {
                self.iter()
                    .filter(top_level)
                    .find(|call| call.state() == CallState::OnHold)
            })
    }

    /// Whether any alive call is an emergency call
    #[must_use]
    pub fn is_in_emergency_call(&self) -> bool {
        self.iter().any(|call| call.is_alive() && call.is_emergency())
    }

    /// Snapshot of one call
    #[must_use]
    pub fn snapshot(&self, call_id: CallId, clock: &dyn Clock) -> Option<CallSnapshot> {
        let emergency = self.is_in_emergency_call();
        self.get(call_id)
            .map(|call| call.snapshot(clock, emergency))
    }

    /// Snapshots of every call in creation order
    #[must_use]
    pub fn snapshots(&self, clock: &dyn Clock) -> Vec<CallSnapshot> {
        let emergency = self.is_in_emergency_call();
        self.iter()
            .map(|call| call.snapshot(clock, emergency))
            .collect()
    }
}
