use thiserror::Error;

/// Domain errors surfaced by the approval engine.
///
/// Idempotent no-ops (re-storing an existing event, approving an already
/// terminal event) are deliberately NOT represented here - they return the
/// current state silently.
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("no flow is mapped to requestable type '{0}'")]
    FlowNotConfigured(String),

    #[error("flow '{0}' has no approval attached")]
    ApprovalNotConfigured(String),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("an acting user is required for this transition")]
    MissingActor,

    #[error("step index {0} exceeds the bitmask width")]
    StepOverflow(u8),

    #[error("approval event '{0}' was removed by a concurrent destroy")]
    EventVanished(String),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error(transparent)]
    Storage(#[from] sled::Error),
}
