use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::CompletionPolicy;
use crate::error::FaultKind;
use crate::types::{FlowNodeId, Timestamp};

/// Runtime events, the append-only audit trail of every process instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        process_id: String,
        version: u32,
        start_node: FlowNodeId,
    },
    NodeActivated {
        node_id: FlowNodeId,
        element_id: String,
        pass_count: u32,
    },
    NodePassed {
        node_id: FlowNodeId,
        element_id: String,
    },
    NodeDeactivated {
        node_id: FlowNodeId,
        element_id: String,
    },
    JoinArrived {
        node_id: FlowNodeId,
        from: FlowNodeId,
        arrived: u32,
        threshold: u32,
    },
    JoinFired {
        node_id: FlowNodeId,
        arrived: u32,
    },
    /// A branch arrived after the join fired, or was redelivered.
    JoinAbsorbed {
        node_id: FlowNodeId,
        from: FlowNodeId,
        duplicate: bool,
    },
    FlowTaken {
        node_id: FlowNodeId,
        flow_id: String,
        target: FlowNodeId,
    },
    TimerScheduled {
        node_id: FlowNodeId,
        fire_at: Timestamp,
    },
    TimerFired {
        node_id: FlowNodeId,
        fire_at: Timestamp,
    },
    MessageDispatched {
        node_id: FlowNodeId,
        route: String,
    },
    MessageReceived {
        node_id: FlowNodeId,
    },
    InstanceCompleted {
        at: Timestamp,
    },
    InstanceCancelled {
        at: Timestamp,
    },
    CompletionRequested {
        policy: CompletionPolicy,
        data_object_ids: BTreeSet<String>,
    },
    FaultReported {
        node_id: Option<FlowNodeId>,
        element_id: Option<String>,
        kind: FaultKind,
        message: String,
    },
}

impl RuntimeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeEvent::InstanceCompleted { .. } | RuntimeEvent::InstanceCancelled { .. }
        )
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            RuntimeEvent::FaultReported { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
