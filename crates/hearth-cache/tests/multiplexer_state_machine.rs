//! Stateful property testing for multiplexer refcounting and teardown.
//!
//! Random interleavings of observe, detach, invalidate, and clock advances
//! are checked against a reference model of which entries should be live
//! and how many listeners should have been opened.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use hearth_cache::{CacheConfig, Multiplexer, StateStore, Subscription, TeardownDelay};
use hearth_core::CacheKey;

/// Teardown delay under test. Clock advances are multiples of 20ms, so no
/// advance ever lands exactly on a deadline.
const TEARDOWN_MS: u64 = 90;

const KEYS: [&str; 3] = ["flights/a", "flights|l:3", "|cg:legs|l:1"];

#[derive(Debug, Clone)]
pub enum MuxOperation {
    /// Subscribe to `KEYS[key]`.
    Observe { key: usize },
    /// Drop the open subscription at `which` modulo their count.
    Detach { which: usize },
    /// Let the paused clock run forward.
    Advance { ms: u64 },
    /// Remove `KEYS[key]` from the live map.
    Invalidate { key: usize },
}

#[derive(Clone, Debug)]
pub struct ModelEntry {
    generation: u64,
    refcount: usize,
    teardown_at: Option<u64>,
}

/// Reference model for the multiplexer.
#[derive(Clone, Debug, Default)]
pub struct MuxModel {
    now: u64,
    entries: BTreeMap<usize, ModelEntry>,
    /// Open subscriptions as (key, generation of the entry they joined).
    subs: Vec<(usize, u64)>,
    next_generation: u64,
    opened: u64,
}

impl ReferenceStateMachine for MuxModel {
    type State = Self;
    type Transition = MuxOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            4 => (0..KEYS.len()).prop_map(|key| MuxOperation::Observe { key }),
            3 => any::<usize>().prop_map(|which| MuxOperation::Detach { which }),
            2 => prop::sample::select(vec![20u64, 60, 200])
                .prop_map(|ms| MuxOperation::Advance { ms }),
            1 => (0..KEYS.len()).prop_map(|key| MuxOperation::Invalidate { key }),
        ]
        .boxed()
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            MuxOperation::Detach { .. } => !state.subs.is_empty(),
            _ => true,
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            MuxOperation::Observe { key } => {
                let generation = match state.entries.get_mut(key) {
                    Some(entry) => {
                        entry.refcount += 1;
                        entry.teardown_at = None;
                        entry.generation
                    }
                    None => {
                        state.next_generation += 1;
                        state.opened += 1;
                        state.entries.insert(
                            *key,
                            ModelEntry {
                                generation: state.next_generation,
                                refcount: 1,
                                teardown_at: None,
                            },
                        );
                        state.next_generation
                    }
                };
                state.subs.push((*key, generation));
            }
            MuxOperation::Detach { which } => {
                let (key, generation) = state.subs.remove(which % state.subs.len());
                let now = state.now;
                if let Some(entry) = state.entries.get_mut(&key) {
                    if entry.generation == generation {
                        entry.refcount -= 1;
                        if entry.refcount == 0 {
                            entry.teardown_at = Some(now + TEARDOWN_MS);
                        }
                    }
                }
            }
            MuxOperation::Advance { ms } => {
                state.now += ms;
                let now = state.now;
                state
                    .entries
                    .retain(|_, entry| !entry.teardown_at.is_some_and(|at| at <= now));
            }
            MuxOperation::Invalidate { key } => {
                state.entries.remove(key);
            }
        }
        state
    }
}

/// Test harness owning a multiplexer and a paused-clock runtime.
pub struct MuxHarness {
    subs: Vec<Subscription>,
    mux: Multiplexer,
    runtime: Runtime,
}

impl MuxHarness {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("failed to build runtime");
        let config = CacheConfig::default()
            .with_teardown(TeardownDelay::After(Duration::from_millis(TEARDOWN_MS)));
        let mux = Multiplexer::new(Arc::new(StateStore::new()), &config);
        Self {
            subs: Vec::new(),
            mux,
            runtime,
        }
    }

    fn apply_operation(&mut self, op: &MuxOperation) {
        match op {
            MuxOperation::Observe { key } => {
                let _guard = self.runtime.enter();
                let sub = self
                    .mux
                    .observe(CacheKey::from(KEYS[*key]), || stream::pending().boxed());
                self.subs.push(sub);
            }
            MuxOperation::Detach { which } => {
                let _guard = self.runtime.enter();
                let sub = self.subs.remove(which % self.subs.len());
                drop(sub);
            }
            MuxOperation::Advance { ms } => {
                let _guard = self.runtime.enter();
                self.runtime
                    .block_on(tokio::time::sleep(Duration::from_millis(*ms)));
            }
            MuxOperation::Invalidate { key } => {
                let _guard = self.runtime.enter();
                self.mux.remove(KEYS[*key]);
            }
        }
    }
}

impl StateMachineTest for MuxHarness {
    type SystemUnderTest = Self;
    type Reference = MuxModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        assert_eq!(state.subs.len(), ref_state.subs.len());
        assert_eq!(state.mux.listeners_opened(), ref_state.opened);
        assert_eq!(state.mux.len(), ref_state.entries.len());

        for (index, key) in KEYS.iter().enumerate() {
            let expected = ref_state.entries.get(&index);
            assert_eq!(
                state.mux.is_live(key),
                expected.is_some(),
                "liveness of {key}"
            );
            assert_eq!(
                state.mux.refcount(key),
                expected.map_or(0, |entry| entry.refcount),
                "refcount of {key}"
            );
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn multiplexer_refcount_state_machine(sequential 1..40 => MuxHarness);
}

#[test]
fn test_detach_after_invalidate_leaves_new_entry_alone() {
    let mut harness = MuxHarness::new();
    harness.apply_operation(&MuxOperation::Observe { key: 0 });
    harness.apply_operation(&MuxOperation::Invalidate { key: 0 });
    harness.apply_operation(&MuxOperation::Observe { key: 0 });
    assert_eq!(harness.mux.listeners_opened(), 2);

    // Dropping the orphaned subscription tears down only the old listener.
    harness.apply_operation(&MuxOperation::Detach { which: 0 });
    harness.apply_operation(&MuxOperation::Advance { ms: 200 });
    assert!(harness.mux.is_live(KEYS[0]));
    assert_eq!(harness.mux.refcount(KEYS[0]), 1);
}
