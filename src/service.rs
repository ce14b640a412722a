//! Service layer for approval workflow operations
//!
//! `ApprovalService` owns the sled instance and implements the transition
//! operations. Every mutation runs inside a single sled transaction on the
//! event tree, so the read-decide-write sequence on an event aggregate is
//! serialized per requestable: two concurrent approvals of an AND component
//! cannot lose an update, and a failed operation leaves the stored aggregate
//! untouched. Different requestables live under different keys and are fully
//! independent.

use crate::binary;
use crate::builder::Transition;
use crate::config::{Approval, ConfigStore, FlowKind, StepRule};
use crate::error::ApprovalError;
use crate::event::{ApprovalEvent, EventComponent, EventContributor, EventStatus, TimeStamp};
use crate::requestable::{FlowMode, Requestable};
use crate::resolver::ContributorResolver;
use crate::utils;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::sync::Arc;
use tracing::{debug, info};

/// Separates the requestable type from its id in event keys. Neither side
/// may contain this byte; bech32 ids never do.
const KEY_SEPARATOR: char = '\x1f';

fn event_key(kind: &str, id: &str) -> String {
    format!("{kind}{KEY_SEPARATOR}{id}")
}

pub struct ApprovalService {
    instance: Arc<sled::Db>,
    config: ConfigStore,
    events: sled::Tree,
}

impl ApprovalService {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        let config = ConfigStore::open(&instance)?;
        let events = instance.open_tree("approval_events")?;
        Ok(Self {
            instance,
            config,
            events,
        })
    }

    /// The configuration store backing this service. Admin CRUD goes through
    /// here; the engine itself only reads it.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// The underlying sled instance.
    pub fn instance(&self) -> &Arc<sled::Db> {
        &self.instance
    }

    /// Select a requestable by its `(type, id)` pair. Missing flow
    /// configuration auto-passes.
    pub fn requestable(&self, kind: &str, id: &str) -> Transition<'_> {
        Transition::new(self, kind, id, FlowMode::AutoPass)
    }

    /// Select an outsider requestable: a pure `(type, id)` pair with no
    /// backing record. The flow and approval configuration must exist.
    pub fn outsider(&self, kind: &str, id: &str) -> Transition<'_> {
        Transition::new(self, kind, id, FlowMode::Required)
    }

    /// Select a concrete business entity. Lifecycle hooks fire after each
    /// transition commits.
    pub fn entity<'a>(&'a self, entity: &'a dyn Requestable) -> Transition<'a> {
        Transition::new(self, entity.requestable_type(), &entity.requestable_id(), FlowMode::AutoPass)
            .hooks(entity)
    }

    // Internal operations, called by the transition builder.

    pub(crate) fn load_event(&self, kind: &str, id: &str) -> anyhow::Result<Option<ApprovalEvent>> {
        let key = event_key(kind, id);
        match self.events.get(key.as_bytes())? {
            Some(raw) => Ok(Some(decode_event(raw.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Idempotent ensure-created. An existing event is returned unchanged.
    pub(crate) fn store(&self, kind: &str, id: &str, mode: FlowMode) -> anyhow::Result<ApprovalEvent> {
        self.mutate(kind, id, mode, |_, _| Ok(()))
    }

    pub(crate) fn approve(
        &self,
        kind: &str,
        id: &str,
        mode: FlowMode,
        user: Option<&str>,
        binary_override: Option<u64>,
    ) -> anyhow::Result<ApprovalEvent> {
        let user = self.require_actor(user)?;
        debug!(kind, id, user, "approve");
        let event = self.mutate(kind, id, mode, |event, now| {
            event.apply_approve(&user, binary_override, now);
            Ok(())
        })?;
        if event.status == EventStatus::Approved {
            info!(kind, id, event_id = %event.id, "approval event fully approved");
        }
        Ok(event)
    }

    pub(crate) fn reject(
        &self,
        kind: &str,
        id: &str,
        mode: FlowMode,
        user: Option<&str>,
    ) -> anyhow::Result<ApprovalEvent> {
        let user = self.require_actor(user)?;
        debug!(kind, id, user, "reject");
        let event = self.mutate(kind, id, mode, |event, now| {
            event.apply_reject(&user, now);
            Ok(())
        })?;
        if event.status == EventStatus::Rejected {
            info!(kind, id, event_id = %event.id, "approval event rejected");
        }
        Ok(event)
    }

    pub(crate) fn cancel(
        &self,
        kind: &str,
        id: &str,
        mode: FlowMode,
        user: Option<&str>,
    ) -> anyhow::Result<ApprovalEvent> {
        let user = self.require_actor(user)?;
        debug!(kind, id, user, "cancel");
        self.mutate(kind, id, mode, |event, now| {
            event.apply_cancel(now);
            Ok(())
        })
    }

    pub(crate) fn force(
        &self,
        kind: &str,
        id: &str,
        mode: FlowMode,
        user: Option<&str>,
        binary_override: Option<u64>,
        status_override: Option<EventStatus>,
    ) -> anyhow::Result<ApprovalEvent> {
        // the actor is optional on force, but when given it must exist
        if let Some(user) = user {
            self.config.require_user(user)?;
        }
        debug!(kind, id, ?binary_override, ?status_override, "force");
        self.mutate(kind, id, mode, |event, now| {
            event.apply_force(binary_override, status_override, now);
            Ok(())
        })
    }

    /// Re-synchronize the event against the live configuration and reset it
    /// to draft. Components are upserted by step bit, contributors are
    /// synchronized rather than rebuilt, and the target is recomputed from
    /// the union of the current components' bits.
    pub(crate) fn rollback(
        &self,
        kind: &str,
        id: &str,
        mode: FlowMode,
        user: Option<&str>,
    ) -> anyhow::Result<ApprovalEvent> {
        let user = self.require_actor(user)?;
        debug!(kind, id, user, "rollback");

        // approval_id is fixed at creation, so the resync plan can be built
        // from the live configuration before entering the transaction
        let approval_id = match self.load_event(kind, id)? {
            Some(event) => event.approval_id,
            None => self.materialize(kind, id, mode)?.approval_id,
        };
        let approval = match &approval_id {
            Some(id) => self.config.approval(id)?,
            None => None,
        };
        let plan = self.plan_resync(approval.as_ref())?;

        self.mutate(kind, id, mode, move |event, now| {
            apply_resync(event, &plan, now);
            Ok(())
        })
    }

    /// Soft-delete the event row. The key (and history) stays in place.
    pub(crate) fn delete(&self, kind: &str, id: &str) -> anyhow::Result<Option<ApprovalEvent>> {
        let key = event_key(kind, id);
        let result = self.events.transaction(|tx| {
            let Some(raw) = tx.get(key.as_bytes())? else {
                return Ok(None);
            };
            let mut event = decode_event(raw.as_ref()).map_err(abort)?;
            event.deleted_at = Some(TimeStamp::new());
            tx.insert(key.as_bytes(), encode_event(&event).map_err(abort)?)?;
            Ok(Some(event))
        });
        unwrap_tx(result)
    }

    /// Physically remove the event row.
    pub(crate) fn destroy(&self, kind: &str, id: &str) -> anyhow::Result<()> {
        let key = event_key(kind, id);
        self.events.remove(key.as_bytes())?;
        Ok(())
    }

    fn require_actor(&self, user: Option<&str>) -> anyhow::Result<String> {
        let user = user.ok_or(ApprovalError::MissingActor)?;
        self.config.require_user(user)?;
        Ok(user.to_string())
    }

    /// Run `op` against the event aggregate inside one atomic transaction,
    /// creating the event from configuration first if it does not exist.
    fn mutate<F>(&self, kind: &str, id: &str, mode: FlowMode, op: F) -> anyhow::Result<ApprovalEvent>
    where
        F: Fn(&mut ApprovalEvent, &TimeStamp<Utc>) -> Result<(), ApprovalError>,
    {
        let key = event_key(kind, id);
        // materialize only when the event does not exist yet: an existing
        // event must be returned unchanged even if configuration is broken
        let template = if self.events.contains_key(key.as_bytes())? {
            None
        } else {
            Some(self.materialize(kind, id, mode)?)
        };

        let result = self.events.transaction(|tx| {
            let (mut event, created) = match tx.get(key.as_bytes())? {
                Some(raw) => (decode_event(raw.as_ref()).map_err(abort)?, false),
                None => match &template {
                    Some(template) => (template.clone(), true),
                    None => {
                        // the row was destroyed between the existence check
                        // and the transaction; abort rather than retry, since
                        // retrying cannot change the template computed outside
                        return Err(abort(ApprovalError::EventVanished(key.clone())));
                    }
                },
            };
            let now = TimeStamp::new();
            op(&mut event, &now).map_err(abort)?;
            tx.insert(key.as_bytes(), encode_event(&event).map_err(abort)?)?;
            Ok((event, created))
        });
        let (event, created) = unwrap_tx(result)?;
        if created {
            info!(
                kind,
                id,
                event_id = %event.id,
                target = event.target,
                ?event.status,
                "approval event created"
            );
        }
        Ok(event)
    }

    /// Build a fresh event aggregate from the current configuration: resolve
    /// the flow via the dictionary, snapshot the approval's components, and
    /// fan contributors out to concrete users. Steps that resolve to zero
    /// contributors auto-approve immediately.
    fn materialize(&self, kind: &str, id: &str, mode: FlowMode) -> anyhow::Result<ApprovalEvent> {
        let now = TimeStamp::new();

        let Some(flow_id) = self.config.flow_for_key(kind)? else {
            return match mode {
                FlowMode::Required => Err(ApprovalError::FlowNotConfigured(kind.to_string()).into()),
                FlowMode::AutoPass => Ok(auto_passed_event(kind, id, now)?),
            };
        };
        let Some(approval) = self.config.approval_for_flow(&flow_id)? else {
            return match mode {
                FlowMode::Required => Err(ApprovalError::ApprovalNotConfigured(flow_id).into()),
                FlowMode::AutoPass => Ok(auto_passed_event(kind, id, now)?),
            };
        };

        let resolver = ContributorResolver::new(&self.config);
        let mut configured = approval.components.clone();
        configured.sort_by_key(|c| c.step);

        let mut target = 0u64;
        let mut auto_bits = 0u64;
        let mut any_contributor = false;
        let mut components = Vec::with_capacity(configured.len());

        for component in &configured {
            if component.step > binary::MAX_STEP_INDEX {
                return Err(ApprovalError::StepOverflow(component.step).into());
            }
            let bit = binary::bit(component.step);
            target |= bit;

            let users = resolver.resolve_all(&component.contributors)?;
            let contributors = users
                .into_iter()
                .map(|user_id| {
                    Ok(EventContributor::new(
                        utils::new_uuid_to_bech32("act_")?,
                        user_id,
                    ))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut snapshot = EventComponent {
                id: utils::new_uuid_to_bech32("aec_")?,
                name: component.name.clone(),
                step: bit,
                rule: component.rule,
                color: component.color.clone(),
                approved_at: None,
                rejected_at: None,
                cancelled_at: None,
                rollback_at: None,
                deleted_at: None,
                contributors,
            };
            if snapshot.contributors.is_empty() {
                // a step with nobody assigned auto-approves
                snapshot.approved_at = Some(now.clone());
                auto_bits |= bit;
            } else {
                any_contributor = true;
            }
            components.push(snapshot);
        }

        let mut event = ApprovalEvent {
            id: utils::new_uuid_to_bech32("aev_")?,
            approval_id: Some(approval.id.clone()),
            requestable_type: kind.to_string(),
            requestable_id: id.to_string(),
            step: auto_bits,
            target,
            kind: approval.kind,
            status: EventStatus::Draft,
            approved_at: None,
            rejected_at: None,
            cancelled_at: None,
            rollback_at: None,
            deleted_at: None,
            components,
        };
        if !any_contributor {
            event.step = event.target;
        }
        if binary::is_complete(event.step, event.target) {
            event.status = EventStatus::Approved;
            event.approved_at = Some(now);
        }
        Ok(event)
    }

    /// Snapshot the live configuration into a resync plan for rollback.
    /// Contributor resolution here is identical to event creation.
    fn plan_resync(&self, approval: Option<&Approval>) -> anyhow::Result<Vec<PlannedComponent>> {
        let Some(approval) = approval else {
            return Ok(vec![]);
        };
        let resolver = ContributorResolver::new(&self.config);
        let mut configured = approval.components.clone();
        configured.sort_by_key(|c| c.step);

        let mut plan = Vec::with_capacity(configured.len());
        for component in &configured {
            if component.step > binary::MAX_STEP_INDEX {
                return Err(ApprovalError::StepOverflow(component.step).into());
            }
            let users = resolver.resolve_all(&component.contributors)?;
            let contributors = users
                .into_iter()
                .map(|user_id| Ok((utils::new_uuid_to_bech32("act_")?, user_id)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            plan.push(PlannedComponent {
                component_id: utils::new_uuid_to_bech32("aec_")?,
                name: component.name.clone(),
                bit: binary::bit(component.step),
                rule: component.rule,
                color: component.color.clone(),
                contributors,
            });
        }
        Ok(plan)
    }
}

/// One step of a rollback resync plan. Ids are pre-minted and only used for
/// rows that turn out to be missing on the event.
struct PlannedComponent {
    component_id: String,
    name: String,
    bit: u64,
    rule: StepRule,
    color: Option<String>,
    /// `(contributor id, user id)` pairs resolved from live configuration.
    contributors: Vec<(String, String)>,
}

/// Upsert the planned components onto the event, synchronize contributors,
/// soft-delete what is no longer configured, and reset the event to draft.
fn apply_resync(event: &mut ApprovalEvent, plan: &[PlannedComponent], now: &TimeStamp<Utc>) {
    let mut target = 0u64;
    let mut auto_bits = 0u64;

    for planned in plan {
        target |= planned.bit;
        match event.components.iter_mut().find(|c| c.step == planned.bit) {
            Some(component) => {
                component.name = planned.name.clone();
                component.rule = planned.rule;
                component.color = planned.color.clone();
                component.approved_at = None;
                component.rejected_at = None;
                component.cancelled_at = None;
                component.rollback_at = Some(now.clone());
                component.deleted_at = None;

                for contributor in component.contributors.iter_mut() {
                    if planned.contributors.iter().any(|(_, u)| *u == contributor.user_id) {
                        contributor.reset();
                        contributor.rollback_at = Some(now.clone());
                        contributor.deleted_at = None;
                    } else {
                        contributor.deleted_at = Some(now.clone());
                    }
                }
                for (contributor_id, user_id) in &planned.contributors {
                    let known = component
                        .contributors
                        .iter()
                        .any(|c| c.user_id == *user_id && !c.is_deleted());
                    if !known {
                        let mut fresh =
                            EventContributor::new(contributor_id.clone(), user_id.clone());
                        fresh.rollback_at = Some(now.clone());
                        component.contributors.push(fresh);
                    }
                }
            }
            None => {
                let contributors = planned
                    .contributors
                    .iter()
                    .map(|(contributor_id, user_id)| {
                        let mut fresh =
                            EventContributor::new(contributor_id.clone(), user_id.clone());
                        fresh.rollback_at = Some(now.clone());
                        fresh
                    })
                    .collect();
                event.components.push(EventComponent {
                    id: planned.component_id.clone(),
                    name: planned.name.clone(),
                    step: planned.bit,
                    rule: planned.rule,
                    color: planned.color.clone(),
                    approved_at: None,
                    rejected_at: None,
                    cancelled_at: None,
                    rollback_at: Some(now.clone()),
                    deleted_at: None,
                    contributors,
                });
            }
        }

        // a step with nobody assigned auto-approves, exactly as at creation
        if planned.contributors.is_empty() {
            auto_bits |= planned.bit;
            if let Some(component) = event.components.iter_mut().find(|c| c.step == planned.bit) {
                component.approved_at = Some(now.clone());
            }
        }
    }

    // steps dropped from configuration are soft-deleted, never removed
    for component in event.components.iter_mut() {
        if !plan.iter().any(|p| p.bit == component.step) {
            component.deleted_at = Some(now.clone());
        }
    }

    event.target = target;
    event.step = auto_bits;
    event.status = EventStatus::Draft;
    event.approved_at = None;
    event.rejected_at = None;
    event.cancelled_at = None;
    event.rollback_at = Some(now.clone());
    if binary::is_complete(event.step, event.target) {
        event.status = EventStatus::Approved;
        event.approved_at = Some(now.clone());
    }
}

fn auto_passed_event(kind: &str, id: &str, now: TimeStamp<Utc>) -> anyhow::Result<ApprovalEvent> {
    Ok(ApprovalEvent {
        id: utils::new_uuid_to_bech32("aev_")?,
        approval_id: None,
        requestable_type: kind.to_string(),
        requestable_id: id.to_string(),
        step: 0,
        target: 0,
        // no approval to copy the kind from on an auto-passed event
        kind: FlowKind::Sequential,
        status: EventStatus::Approved,
        approved_at: Some(now),
        rejected_at: None,
        cancelled_at: None,
        rollback_at: None,
        deleted_at: None,
        components: vec![],
    })
}

fn encode_event(event: &ApprovalEvent) -> Result<Vec<u8>, ApprovalError> {
    minicbor::to_vec(event).map_err(|e| ApprovalError::Codec(e.to_string()))
}

fn decode_event(raw: &[u8]) -> Result<ApprovalEvent, ApprovalError> {
    minicbor::decode(raw).map_err(|e| ApprovalError::Codec(e.to_string()))
}

fn abort(error: ApprovalError) -> ConflictableTransactionError<ApprovalError> {
    ConflictableTransactionError::Abort(error)
}

fn unwrap_tx<T>(result: Result<T, TransactionError<ApprovalError>>) -> anyhow::Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(error)) => Err(error.into()),
        Err(TransactionError::Storage(error)) => Err(ApprovalError::Storage(error).into()),
    }
}
