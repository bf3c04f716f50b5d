//! Error taxonomy of the execution core.
//!
//! Provider SPIs return `anyhow::Result` (like the store traits); the core
//! wraps those failures as [`EngineError::ProviderFailure`] so actors can tell
//! a side-effect failure apart from a structural one.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::FlowNodeId;

/// Malformed ISO 8601 duration, date or cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed timer spec '{spec}': {reason}")]
pub struct TimerSpecError {
    pub spec: String,
    pub reason: String,
}

impl TimerSpecError {
    pub fn new(spec: &str, reason: impl Into<String>) -> Self {
        Self {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// Expression parse or evaluation failure. Never collapsed into `false`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("'{0}' is not a known data object")]
    UnknownObject(String),

    #[error("data object '{0}' is not available for this instance")]
    MissingObject(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// Fault classes recorded in the runtime event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ProtocolViolation,
    UnsatisfiedGateway,
    MalformedTimerSpec,
    MalformedExpression,
    ProviderFailure,
    DuplicateTrigger,
    Unroutable,
    CorruptAuditChain,
    Internal,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolViolation => "protocol_violation",
            Self::UnsatisfiedGateway => "unsatisfied_gateway",
            Self::MalformedTimerSpec => "malformed_timer_spec",
            Self::MalformedExpression => "malformed_expression",
            Self::ProviderFailure => "provider_failure",
            Self::DuplicateTrigger => "duplicate_trigger",
            Self::Unroutable => "unroutable",
            Self::CorruptAuditChain => "corrupt_audit_chain",
            Self::Internal => "internal",
        }
    }

    /// Structural faults leave the node instance visibly stuck.
    pub fn leaves_instance_stuck(&self) -> bool {
        matches!(
            self,
            Self::UnsatisfiedGateway | Self::MalformedTimerSpec | Self::MalformedExpression
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol violation at node {node} for instance {instance_id}: {reason}")]
    ProtocolViolation {
        node: FlowNodeId,
        instance_id: Uuid,
        reason: String,
    },

    #[error("no outgoing flow of node {node} matched for instance {instance_id} and no default flow is defined")]
    UnsatisfiedGateway { node: FlowNodeId, instance_id: Uuid },

    #[error(transparent)]
    MalformedTimerSpec(#[from] TimerSpecError),

    #[error(transparent)]
    MalformedExpression(#[from] ExpressionError),

    #[error("{provider} provider failed: {source:#}")]
    ProviderFailure {
        provider: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("duplicate trigger at node {node} for instance {instance_id}")]
    DuplicateTrigger { node: FlowNodeId, instance_id: Uuid },

    #[error("no integration route registered for node {0}")]
    Unroutable(FlowNodeId),

    #[error("unknown flow node {0}")]
    UnknownNode(FlowNodeId),

    #[error("unknown process '{0}'")]
    UnknownProcess(String),

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("audit chain revisits node {node} for instance {instance_id}")]
    CorruptAuditChain { node: FlowNodeId, instance_id: Uuid },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn provider(provider: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::ProviderFailure { provider, source }
    }

    pub fn protocol(node: &FlowNodeId, instance_id: Uuid, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            node: node.clone(),
            instance_id,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ProtocolViolation { .. } => FaultKind::ProtocolViolation,
            Self::UnsatisfiedGateway { .. } => FaultKind::UnsatisfiedGateway,
            Self::MalformedTimerSpec(_) => FaultKind::MalformedTimerSpec,
            Self::MalformedExpression(_) => FaultKind::MalformedExpression,
            Self::ProviderFailure { .. } => FaultKind::ProviderFailure,
            Self::DuplicateTrigger { .. } => FaultKind::DuplicateTrigger,
            Self::Unroutable(_) => FaultKind::Unroutable,
            Self::CorruptAuditChain { .. } => FaultKind::CorruptAuditChain,
            Self::UnknownNode(_)
            | Self::UnknownProcess(_)
            | Self::InvalidDefinition(_)
            | Self::Config(_) => FaultKind::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        let node = FlowNodeId::from("n1");
        let err = EngineError::protocol(&node, Uuid::nil(), "stale");
        assert_eq!(err.kind(), FaultKind::ProtocolViolation);
        assert!(!err.kind().leaves_instance_stuck());

        let err: EngineError = TimerSpecError::new("PX", "bad designator").into();
        assert_eq!(err.kind(), FaultKind::MalformedTimerSpec);
        assert!(err.kind().leaves_instance_stuck());

        let err: EngineError = ExpressionError::DivisionByZero.into();
        assert_eq!(err.kind(), FaultKind::MalformedExpression);
    }

    #[test]
    fn provider_failure_keeps_source() {
        let err = EngineError::provider("timer_store")(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), FaultKind::ProviderFailure);
        assert!(err.to_string().contains("connection reset"));
        assert!(err.to_string().contains("timer_store"));
    }
}
