//! Property-based tests for the bitmask state machine
//!
//! The transition logic on the event aggregate is pure, so it can be driven
//! with arbitrary component layouts and action sequences. These properties
//! pin the invariants that must hold regardless of the specific sequence -
//! exactly the edge cases manual test selection tends to miss.

use approval_flow::{
    binary, ApprovalEvent, EventComponent, EventContributor, EventStatus, FlowKind, StepRule,
    TimeStamp,
};
use proptest::prelude::*;

/// A component layout: aggregation rule plus number of direct contributors.
/// Contributor user ids are deterministic (`user_<step>_<n>`).
fn build_event(layouts: Vec<(bool, usize)>) -> ApprovalEvent {
    let now = TimeStamp::new();
    let mut target = 0u64;
    let mut step = 0u64;
    let mut components = Vec::with_capacity(layouts.len());

    for (index, (is_and, contributor_count)) in layouts.iter().enumerate() {
        let bit = binary::bit(index as u8);
        target |= bit;
        let contributors: Vec<EventContributor> = (0..*contributor_count)
            .map(|n| {
                EventContributor::new(format!("act_{index}_{n}"), format!("user_{index}_{n}"))
            })
            .collect();
        let mut component = EventComponent {
            id: format!("aec_{index}"),
            name: format!("step {index}"),
            step: bit,
            rule: if *is_and { StepRule::And } else { StepRule::Or },
            color: None,
            approved_at: None,
            rejected_at: None,
            cancelled_at: None,
            rollback_at: None,
            deleted_at: None,
            contributors,
        };
        if component.contributors.is_empty() {
            component.approved_at = Some(now.clone());
            step |= bit;
        }
        components.push(component);
    }

    let mut event = ApprovalEvent {
        id: "aev_prop".to_string(),
        approval_id: Some("apr_prop".to_string()),
        requestable_type: "document".to_string(),
        requestable_id: "doc-1".to_string(),
        step,
        target,
        kind: FlowKind::Sequential,
        status: EventStatus::Draft,
        approved_at: None,
        rejected_at: None,
        cancelled_at: None,
        rollback_at: None,
        deleted_at: None,
        components,
    };
    if binary::is_complete(event.step, event.target) {
        event.status = EventStatus::Approved;
        event.approved_at = Some(now);
    }
    event
}

fn event_strategy() -> impl Strategy<Value = ApprovalEvent> {
    prop::collection::vec((any::<bool>(), 0usize..=3), 1..=6).prop_map(build_event)
}

/// Arbitrary actors matching the deterministic contributor naming, including
/// users that sit on no component at all.
fn actor_strategy() -> impl Strategy<Value = String> {
    (0usize..=6, 0usize..=3).prop_map(|(c, n)| format!("user_{c}_{n}"))
}

proptest! {
    /// After any sequence of approvals, the status is approved exactly when
    /// the progress mask covers the target mask.
    #[test]
    fn prop_approved_iff_step_covers_target(
        event in event_strategy(),
        actors in prop::collection::vec(actor_strategy(), 0..=24),
    ) {
        let mut event = event;
        let now = TimeStamp::new();
        for actor in &actors {
            event.apply_approve(actor, None, &now);

            prop_assert_eq!(
                event.status == EventStatus::Approved,
                binary::is_complete(event.step, event.target),
                "status and bitmask disagree: status={:?} step={:b} target={:b}",
                event.status, event.step, event.target
            );
        }
    }

    /// Approvals never set bits outside the target mask.
    #[test]
    fn prop_step_stays_a_submask_of_target(
        event in event_strategy(),
        actors in prop::collection::vec(actor_strategy(), 0..=24),
    ) {
        let mut event = event;
        let now = TimeStamp::new();
        for actor in &actors {
            event.apply_approve(actor, None, &now);
            prop_assert_eq!(event.step & !event.target, 0);
        }
    }

    /// A terminal event is stable under further approvals: the aggregate is
    /// returned unchanged, timestamps included.
    #[test]
    fn prop_approve_is_idempotent_once_terminal(
        event in event_strategy(),
        actors in prop::collection::vec(actor_strategy(), 1..=24),
        late_actors in prop::collection::vec(actor_strategy(), 1..=8),
    ) {
        let mut event = event;
        let now = TimeStamp::new();
        for actor in &actors {
            event.apply_approve(actor, None, &now);
        }
        // walk the remaining pending components to a guaranteed terminal state
        while event.status == EventStatus::Draft {
            let members: Vec<String> = match event.pending_component() {
                Some(c) => c.contributors.iter().map(|u| u.user_id.clone()).collect(),
                None => vec!["user_finalizer".to_string()],
            };
            for member in members {
                event.apply_approve(&member, None, &now);
            }
        }

        let frozen_step = event.step;
        let frozen_approved_at = event.approved_at.clone();
        let later = TimeStamp::new();
        for actor in &late_actors {
            let changed = event.apply_approve(actor, None, &later);
            prop_assert!(!changed);
        }
        prop_assert_eq!(event.step, frozen_step);
        prop_assert_eq!(event.approved_at, frozen_approved_at);
    }

    /// A settled rejection rejects the whole event, never a partial state.
    #[test]
    fn prop_rejection_is_whole_event(
        event in event_strategy(),
        approvers in prop::collection::vec(actor_strategy(), 0..=12),
        rejector in actor_strategy(),
    ) {
        let mut event = event;
        let now = TimeStamp::new();
        for actor in &approvers {
            event.apply_approve(actor, None, &now);
        }
        prop_assume!(event.status == EventStatus::Draft);

        event.apply_reject(&rejector, &now);

        // either the vote did not settle the component, or the event as a
        // whole flipped to rejected - no in-between
        let pending_rejected = event
            .components
            .iter()
            .any(|c| c.rejected_at.is_some());
        prop_assert_eq!(pending_rejected, event.status == EventStatus::Rejected);
    }

    /// Force with an arbitrary submask stamps exactly the covered components
    /// and merges exactly those bits.
    #[test]
    fn prop_force_partial_marks_submask_components(
        event in event_strategy(),
        raw_mask in any::<u64>(),
    ) {
        let mut event = event;
        let mask = raw_mask & event.target;
        let before_step = event.step;
        let now = TimeStamp::new();

        event.apply_force(Some(mask), None, &now);

        prop_assert_eq!(event.step, before_step | mask);
        prop_assert_eq!(event.status, EventStatus::Approved);
        for component in &event.components {
            if (component.step & mask) == component.step || event.step == event.target {
                prop_assert!(component.approved_at.is_some());
            }
        }
    }

    /// The encoder primitives agree with each other.
    #[test]
    fn prop_bit_masks_are_disjoint_and_pending(index_a in 0u8..=63, index_b in 0u8..=63) {
        let a = binary::bit(index_a);
        let b = binary::bit(index_b);

        prop_assert_eq!(a.count_ones(), 1);
        if index_a != index_b {
            prop_assert_eq!(a & b, 0);
            prop_assert!(binary::is_pending(a, b));
        }
        prop_assert!(binary::is_complete(a | b, b));
    }
}
