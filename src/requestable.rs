//! Adapter contract for business entities that carry approval behavior
//!
//! The engine never needs a concrete entity type: it identifies a requestable
//! by its `(type, id)` pair and calls back through the lifecycle hooks after
//! a transition commits. Hooks default to no-ops; entities override them to
//! chain side effects (stock movements, follow-up documents, and so on).

use crate::event::ApprovalEvent;

/// Implemented by any business document that wants approval behavior.
pub trait Requestable {
    /// Type discriminator matched against the configuration dictionary keys.
    fn requestable_type(&self) -> &str;

    /// Primary key of the entity instance.
    fn requestable_id(&self) -> String;

    fn on_approve(&self, _event: &ApprovalEvent) {}
    fn on_reject(&self, _event: &ApprovalEvent) {}
    fn on_cancel(&self, _event: &ApprovalEvent) {}
    fn on_rollback(&self, _event: &ApprovalEvent) {}
    fn on_force(&self, _event: &ApprovalEvent) {}
}

/// How the engine resolves a flow for a requestable at event creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// Normal mode: a type with no configured flow auto-passes - undefined
    /// workflows never block document creation.
    AutoPass,
    /// Outsider mode, for pure `(type, id)` pairs with no backing record:
    /// a missing flow or approval configuration is an error.
    Required,
}
