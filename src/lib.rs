//! Bitmask-driven multi-step approval workflow engine
//!
//! Business documents progress through configured approval steps tracked as
//! bits in an integer mask. Configuration (flows, approvals, step components,
//! contributor assignments) lives in [`config`]; per-entity runtime state is
//! the [`event::ApprovalEvent`] aggregate; transitions run through
//! [`service::ApprovalService`] and its fluent [`builder::Transition`].

pub mod binary;
pub mod builder;
pub mod config;
pub mod error;
pub mod event;
pub mod requestable;
pub mod resolver;
pub mod service;
pub mod utils;

pub use builder::Transition;
pub use config::{Approvable, Approval, ApprovalComponent, ApprovalGroup, Flow, FlowKind, Role, StepRule, User};
pub use error::ApprovalError;
pub use event::{ApprovalEvent, EventComponent, EventContributor, EventStatus, TimeStamp};
pub use requestable::{FlowMode, Requestable};
pub use service::ApprovalService;
