//! Property tests for call timing and conference links

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use std::time::Duration;
use switchboard_core::{
    Call, CallDirection, CallId, CallRegistry, CallState, Clock, ManualClock,
};

fn state_strategy() -> impl Strategy<Value = CallState> {
    prop_oneof![
        Just(CallState::New),
        Just(CallState::Connecting),
        Just(CallState::Dialing),
        Just(CallState::Ringing),
        Just(CallState::AudioProcessing),
        Just(CallState::Answered),
        Just(CallState::Active),
        Just(CallState::OnHold),
        Just(CallState::Disconnecting),
        Just(CallState::Disconnected),
    ]
}

/// One step: a state change after some elapsed time, with an optional
/// wall-clock jump in seconds
fn step_strategy() -> impl Strategy<Value = (CallState, u64, Option<i64>)> {
    (
        state_strategy(),
        0u64..5_000,
        proptest::option::of(-86_400i64..86_400),
    )
}

fn epoch_plus(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(seconds)
}

proptest! {
    #[test]
    fn prop_age_ignores_wall_clock(steps in proptest::collection::vec(step_strategy(), 1..40)) {
        let steady = ManualClock::new(epoch_plus(1_000_000));
        let jumpy = ManualClock::new(epoch_plus(1_000_000));
        let mut steady_call = Call::new(CallId(1), CallDirection::Outgoing, &steady);
        let mut jumpy_call = Call::new(CallId(1), CallDirection::Outgoing, &jumpy);
        let mut elapsed = Duration::ZERO;

        for (state, advance_ms, jump) in steps {
            let by = Duration::from_millis(advance_ms);
            steady.advance(by);
            jumpy.advance(by);
            elapsed += by;
            if let Some(seconds) = jump {
                jumpy.set_wall(jumpy.wall_now() + chrono::Duration::seconds(seconds));
            }
            steady_call.set_state(state, &steady);
            jumpy_call.set_state(state, &jumpy);

            prop_assert_eq!(steady_call.age(&steady), jumpy_call.age(&jumpy));
            prop_assert!(steady_call.age(&steady) <= elapsed);
        }
    }

    #[test]
    fn prop_never_connected_call_has_no_age(
        states in proptest::collection::vec(
            prop_oneof![
                Just(CallState::Ringing),
                Just(CallState::AudioProcessing),
                Just(CallState::Disconnecting),
            ],
            0..10,
        ),
        advance_ms in 0u64..60_000,
    ) {
        let clock = ManualClock::default();
        let mut call = Call::new(CallId(7), CallDirection::Incoming, &clock);
        for state in states {
            clock.advance(Duration::from_millis(advance_ms));
            call.set_state(state, &clock);
        }
        call.set_state(CallState::Disconnected, &clock);

        prop_assert_eq!(call.age(&clock), Duration::ZERO);
        prop_assert_eq!(call.connect_time_millis(), 0);
    }

    #[test]
    fn prop_disconnect_freezes_age(connected_ms in 0u64..10_000, after_ms in 0u64..10_000) {
        let clock = ManualClock::default();
        let mut call = Call::new(CallId(3), CallDirection::Outgoing, &clock);
        call.set_state(CallState::Active, &clock);
        clock.advance(Duration::from_millis(connected_ms));
        call.set_state(CallState::Disconnected, &clock);
        clock.advance(Duration::from_millis(after_ms));

        prop_assert_eq!(call.age(&clock), Duration::from_millis(connected_ms));
    }

    #[test]
    fn prop_conference_links_stay_two_levels(
        ops in proptest::collection::vec((0usize..6, proptest::option::of(0usize..6)), 1..60),
    ) {
        let clock = ManualClock::default();
        let mut registry = CallRegistry::new();
        let ids: Vec<CallId> = (0..6)
            .map(|_| registry.create(CallDirection::Outgoing, &clock))
            .collect();

        for (child, parent) in ops {
            registry.set_parent(ids[child], parent.map(|index| ids[index]));

            for call in registry.iter() {
                if call.parent().is_some() {
                    prop_assert!(call.children().is_empty());
                }
                if let Some(parent) = call.parent() {
                    let host = registry.get(parent).unwrap();
                    prop_assert!(host.children().contains(&call.id()));
                    prop_assert!(host.parent().is_none());
                }
                for child in call.children() {
                    prop_assert_eq!(registry.get(*child).unwrap().parent(), Some(call.id()));
                }
            }
        }
    }
}
