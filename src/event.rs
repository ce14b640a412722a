//! Runtime approval event aggregate and its state machine
//!
//! An [`ApprovalEvent`] is the per-entity snapshot of a configured approval:
//! one event per requestable, holding the event components (one per
//! configured step, each a single bit) and the resolved contributors per
//! component. The transition functions here are pure - they mutate the
//! in-memory aggregate and take the clock as a parameter. Persistence and
//! transactional serialization live in the service layer.

use crate::binary;
use crate::config::{FlowKind, StepRule};
use chrono::{DateTime, TimeZone, Utc};

/// Event lifecycle status. `Draft` is the only non-terminal state; `rollback`
/// reopens terminal events and `force` can override them.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Canceled,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Resolved contributor on an event component. The four decision timestamps
/// record this contributor's own actions, distinct from the component's
/// aggregate decision.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct EventContributor {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub rejected_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
    #[n(5)]
    pub rollback_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub deleted_at: Option<TimeStamp<Utc>>,
}

impl EventContributor {
    pub fn new(id: String, user_id: String) -> Self {
        Self {
            id,
            user_id,
            approved_at: None,
            rejected_at: None,
            cancelled_at: None,
            rollback_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Clear all decision timestamps, keeping the row itself.
    pub fn reset(&mut self) {
        self.approved_at = None;
        self.rejected_at = None;
        self.cancelled_at = None;
        self.rollback_at = None;
    }
}

/// Runtime snapshot of one configured step. `step` holds the single bit
/// `1 << configured index`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct EventComponent {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub step: u64,
    #[n(3)]
    pub rule: StepRule,
    #[n(4)]
    pub color: Option<String>,
    #[n(5)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub rejected_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub rollback_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub deleted_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub contributors: Vec<EventContributor>,
}

impl EventComponent {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Live (not soft-deleted) contributors.
    pub fn live_contributors(&self) -> impl Iterator<Item = &EventContributor> {
        self.contributors.iter().filter(|c| !c.is_deleted())
    }

    pub fn has_contributors(&self) -> bool {
        self.live_contributors().next().is_some()
    }

    pub fn has_contributor(&self, user_id: &str) -> bool {
        self.live_contributors().any(|c| c.user_id == user_id)
    }

    /// Whether the component's aggregation rule is satisfied by the recorded
    /// contributor approvals. A component with no contributors is trivially
    /// satisfied.
    pub fn is_satisfied(&self) -> bool {
        if !self.has_contributors() {
            return true;
        }
        match self.rule {
            StepRule::Or => self.live_contributors().any(|c| c.approved_at.is_some()),
            StepRule::And => self.live_contributors().all(|c| c.approved_at.is_some()),
        }
    }

    /// Whether the recorded rejections settle the component as rejected.
    /// OR: a single rejection rejects. AND: rejected once rejections reach
    /// the approval count - ties go to reject.
    pub fn is_rejected_by_votes(&self) -> bool {
        if !self.has_contributors() {
            return true;
        }
        match self.rule {
            StepRule::Or => self.live_contributors().any(|c| c.rejected_at.is_some()),
            StepRule::And => {
                let approvals = self
                    .live_contributors()
                    .filter(|c| c.approved_at.is_some())
                    .count();
                let rejections = self
                    .live_contributors()
                    .filter(|c| c.rejected_at.is_some())
                    .count();
                rejections > 0 && rejections >= approvals
            }
        }
    }
}

/// The per-requestable approval event. Identity is the unique
/// `(requestable_type, requestable_id)` pair; `approval_id` is `None` when no
/// flow was configured for the type (auto-passed event).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct ApprovalEvent {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub approval_id: Option<String>,
    #[n(2)]
    pub requestable_type: String,
    #[n(3)]
    pub requestable_id: String,
    #[n(4)]
    pub step: u64,
    #[n(5)]
    pub target: u64,
    #[n(6)]
    pub kind: FlowKind,
    #[n(7)]
    pub status: EventStatus,
    #[n(8)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub rejected_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub rollback_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub deleted_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub components: Vec<EventComponent>,
}

impl ApprovalEvent {
    // Derived read-only views. These are pure functions of the persisted
    // timestamps and bitmasks, never stored fields.

    pub fn is_approved(&self) -> bool {
        self.approved_at.is_some()
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected_at.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback_at.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status != EventStatus::Draft
    }

    fn live_components(&self) -> impl Iterator<Item = &EventComponent> {
        self.components.iter().filter(|c| !c.is_deleted())
    }

    /// The current pending component: lowest bit not yet set in `step`.
    pub fn pending_component(&self) -> Option<&EventComponent> {
        self.live_components()
            .filter(|c| binary::is_pending(self.step, c.step))
            .min_by_key(|c| c.step)
    }

    /// The latest completed step: most recently created component whose bit
    /// is already covered by `step`.
    pub fn current_component(&self) -> Option<&EventComponent> {
        self.components
            .iter()
            .rev()
            .find(|c| !c.is_deleted() && c.step != 0 && binary::is_complete(self.step, c.step))
    }

    /// Whether `user_id` may act on the current pending component. Requires
    /// the acting user explicitly - there is no ambient current-user lookup.
    pub fn can_approve(&self, user_id: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.pending_component() {
            Some(component) => {
                !component.has_contributors() || component.has_contributor(user_id)
            }
            // nothing pending: the next approve finalizes the event
            None => true,
        }
    }

    fn component_index(&self, bit: u64) -> Option<usize> {
        self.components
            .iter()
            .position(|c| c.step == bit && !c.is_deleted())
    }

    fn mark_event_approved(&mut self, now: &TimeStamp<Utc>) {
        self.status = EventStatus::Approved;
        self.approved_at = Some(now.clone());
    }

    /// Record an approval by `user_id`. Terminal events are left untouched
    /// (idempotent no-op). Returns `true` when the aggregate changed.
    pub fn apply_approve(
        &mut self,
        user_id: &str,
        binary_override: Option<u64>,
        now: &TimeStamp<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }

        let bit = match binary_override {
            // per-step flows target an exact component by its bit; an
            // override naming no live component must not touch the event
            Some(mask) => match self.live_components().find(|c| c.step == mask) {
                Some(component) => component.step,
                None => return false,
            },
            None => match self.pending_component() {
                Some(component) => component.step,
                None => {
                    // every component is already satisfied: finalize
                    self.step |= self.target;
                    self.mark_event_approved(now);
                    return true;
                }
            },
        };
        let Some(idx) = self.component_index(bit) else {
            return false;
        };

        let component = &mut self.components[idx];
        if let Some(own) = component
            .contributors
            .iter_mut()
            .find(|c| c.user_id == user_id && !c.is_deleted())
        {
            own.approved_at = Some(now.clone());
        }

        if component.is_satisfied() {
            component.approved_at = Some(now.clone());
            self.step |= bit;
            if binary::is_complete(self.step, self.target) {
                self.mark_event_approved(now);
            }
        }
        true
    }

    /// Record a rejection by `user_id`. A settled component rejection
    /// terminates the whole event - no partial-rejection state exists.
    pub fn apply_reject(&mut self, user_id: &str, now: &TimeStamp<Utc>) -> bool {
        let Some(bit) = self.pending_component().map(|c| c.step) else {
            self.status = EventStatus::Rejected;
            self.rejected_at = Some(now.clone());
            return true;
        };
        let Some(idx) = self.component_index(bit) else {
            return false;
        };

        let component = &mut self.components[idx];
        if let Some(own) = component
            .contributors
            .iter_mut()
            .find(|c| c.user_id == user_id && !c.is_deleted())
        {
            own.rejected_at = Some(now.clone());
        }

        if component.is_rejected_by_votes() {
            component.rejected_at = Some(now.clone());
            self.status = EventStatus::Rejected;
            self.rejected_at = Some(now.clone());
        }
        true
    }

    /// Cancel the currently pending component only: reset its contributors
    /// and its own decision, clear its bit from `step`, and funnel the event
    /// into the rejected terminal state. Earlier approved components keep
    /// their state.
    pub fn apply_cancel(&mut self, now: &TimeStamp<Utc>) -> bool {
        let Some(bit) = self.pending_component().map(|c| c.step) else {
            self.status = EventStatus::Rejected;
            self.cancelled_at = Some(now.clone());
            return true;
        };
        let Some(idx) = self.component_index(bit) else {
            return false;
        };

        let component = &mut self.components[idx];
        for contributor in component.contributors.iter_mut() {
            contributor.reset();
            contributor.cancelled_at = Some(now.clone());
        }
        component.approved_at = None;
        component.cancelled_at = Some(now.clone());

        self.step &= !bit;
        self.status = EventStatus::Rejected;
        self.cancelled_at = Some(now.clone());
        true
    }

    /// Administrative override. `binary` defaults to the full target, status
    /// to approved. Components whose bit is a submask of `binary` are stamped
    /// approved even when the event as a whole is not fully forced.
    pub fn apply_force(
        &mut self,
        binary_override: Option<u64>,
        status_override: Option<EventStatus>,
        now: &TimeStamp<Utc>,
    ) {
        let mask = binary_override.unwrap_or(self.target);
        self.step |= mask;
        self.status = status_override.unwrap_or(EventStatus::Approved);

        if self.step == self.target {
            self.approved_at = Some(now.clone());
            for component in self.components.iter_mut().filter(|c| !c.is_deleted()) {
                component.approved_at = Some(now.clone());
            }
        } else {
            for component in self
                .components
                .iter_mut()
                .filter(|c| !c.is_deleted() && (c.step & mask) == c.step)
            {
                component.approved_at = Some(now.clone());
            }
        }
    }
}
