//! Fluent transition builder
//!
//! A `Transition` selects a target requestable, collects the acting user and
//! the optional overrides, then executes exactly one terminal operation.
//! Terminal operations return the mutated event; when the transition was
//! built from a concrete entity, the matching lifecycle hook fires after the
//! transaction commits.

use crate::event::{ApprovalEvent, EventStatus};
use crate::requestable::{FlowMode, Requestable};
use crate::service::ApprovalService;

pub struct Transition<'a> {
    service: &'a ApprovalService,
    kind: String,
    id: String,
    mode: FlowMode,
    entity: Option<&'a dyn Requestable>,
    user: Option<String>,
    binary: Option<u64>,
    status: Option<EventStatus>,
}

impl<'a> Transition<'a> {
    pub(crate) fn new(service: &'a ApprovalService, kind: &str, id: &str, mode: FlowMode) -> Self {
        Self {
            service,
            kind: kind.to_string(),
            id: id.to_string(),
            mode,
            entity: None,
            user: None,
            binary: None,
            status: None,
        }
    }

    pub(crate) fn hooks(mut self, entity: &'a dyn Requestable) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Set the acting user. Required for approve, reject, cancel and
    /// rollback; optional audit actor for force.
    pub fn user(mut self, user_id: &str) -> Self {
        self.user = Some(user_id.to_string());
        self
    }

    /// Target an exact component bit instead of the lowest pending one
    /// (approve), or override the forced mask (force).
    pub fn binary(mut self, mask: u64) -> Self {
        self.binary = Some(mask);
        self
    }

    /// Override the status a force sets. Defaults to approved.
    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Read the current event, components and contributors. Does not create.
    pub fn get(self) -> anyhow::Result<Option<ApprovalEvent>> {
        self.service.load_event(&self.kind, &self.id)
    }

    /// Idempotent ensure-created.
    pub fn store(self) -> anyhow::Result<ApprovalEvent> {
        self.service.store(&self.kind, &self.id, self.mode)
    }

    pub fn approve(self) -> anyhow::Result<ApprovalEvent> {
        let event =
            self.service
                .approve(&self.kind, &self.id, self.mode, self.user.as_deref(), self.binary)?;
        if let Some(entity) = self.entity {
            entity.on_approve(&event);
        }
        Ok(event)
    }

    pub fn reject(self) -> anyhow::Result<ApprovalEvent> {
        let event = self
            .service
            .reject(&self.kind, &self.id, self.mode, self.user.as_deref())?;
        if let Some(entity) = self.entity {
            entity.on_reject(&event);
        }
        Ok(event)
    }

    pub fn cancel(self) -> anyhow::Result<ApprovalEvent> {
        let event = self
            .service
            .cancel(&self.kind, &self.id, self.mode, self.user.as_deref())?;
        if let Some(entity) = self.entity {
            entity.on_cancel(&event);
        }
        Ok(event)
    }

    pub fn rollback(self) -> anyhow::Result<ApprovalEvent> {
        let event = self
            .service
            .rollback(&self.kind, &self.id, self.mode, self.user.as_deref())?;
        if let Some(entity) = self.entity {
            entity.on_rollback(&event);
        }
        Ok(event)
    }

    pub fn force(self) -> anyhow::Result<ApprovalEvent> {
        let event = self.service.force(
            &self.kind,
            &self.id,
            self.mode,
            self.user.as_deref(),
            self.binary,
            self.status,
        )?;
        if let Some(entity) = self.entity {
            entity.on_force(&event);
        }
        Ok(event)
    }

    /// Soft-delete the event row; returns the marked event if one existed.
    pub fn delete(self) -> anyhow::Result<Option<ApprovalEvent>> {
        self.service.delete(&self.kind, &self.id)
    }

    /// Physically remove the event row.
    pub fn destroy(self) -> anyhow::Result<()> {
        self.service.destroy(&self.kind, &self.id)
    }
}
