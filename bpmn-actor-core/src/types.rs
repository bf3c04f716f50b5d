use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::events::RuntimeEvent;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ─── Flow node identity ───────────────────────────────────────

/// Stable address of one deployed flow node (and of its actor).
///
/// Derived from the client id, process id/version, the enclosing sub-process
/// path and the BPMN element id, so it survives restarts unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowNodeId(String);

impl FlowNodeId {
    pub fn derive(
        client_id: &str,
        process_id: &str,
        version: u32,
        path: &[String],
        element_id: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        for part in [client_id, process_id, &version.to_string()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for segment in path {
            hasher.update(segment.as_bytes());
            hasher.update([0x1fu8]);
        }
        hasher.update([0u8]);
        hasher.update(element_id.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FlowNodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FlowNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a FlowNodeInstance: one record per (node, process instance).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeInstanceKey {
    pub node_id: FlowNodeId,
    pub instance_id: Uuid,
}

impl NodeInstanceKey {
    pub fn new(node_id: FlowNodeId, instance_id: Uuid) -> Self {
        Self {
            node_id,
            instance_id,
        }
    }
}

impl fmt::Display for NodeInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.instance_id)
    }
}

// ─── Timers ───────────────────────────────────────────────────

/// ISO 8601 timer specification attached to a timer event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerDefinition {
    /// `PT30S`, `P1DT2H`, ...
    Duration(String),
    /// `2013-04-09T16:34:08Z`
    Date(String),
    /// `R5/PT1M`, `R/PT1M`, `R/PT1M/2030-01-01T00:00:00Z`
    Cycle(String),
}

/// A scheduled timer, stored outside the actor so it survives restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub fire_at: Timestamp,
    /// FlowNodeId string of the owning actor.
    pub actor_address: String,
    pub instance_id: Uuid,
}

// ─── Node kinds ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    TimerStartEvent {
        timer: TimerDefinition,
    },
    EndEvent,
    Task,
    IntermediateThrowEvent,
    MessageCatchEvent,
    TimerCatchEvent {
        timer: TimerDefinition,
    },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway {
        /// N of M; defaults to all incoming flows.
        #[serde(default)]
        join_threshold: Option<u32>,
    },
    ComplexGateway {
        join_threshold: u32,
    },
}

impl NodeKind {
    pub fn is_start(&self) -> bool {
        matches!(self, NodeKind::StartEvent | NodeKind::TimerStartEvent { .. })
    }

    /// Gateways whose activation goes through the join synchronizer.
    pub fn is_join(&self) -> bool {
        matches!(
            self,
            NodeKind::ParallelGateway
                | NodeKind::InclusiveGateway { .. }
                | NodeKind::ComplexGateway { .. }
        )
    }

    pub fn timer(&self) -> Option<&TimerDefinition> {
        match self {
            NodeKind::TimerStartEvent { timer } | NodeKind::TimerCatchEvent { timer } => {
                Some(timer)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "start_event",
            NodeKind::TimerStartEvent { .. } => "timer_start_event",
            NodeKind::EndEvent => "end_event",
            NodeKind::Task => "task",
            NodeKind::IntermediateThrowEvent => "intermediate_throw_event",
            NodeKind::MessageCatchEvent => "message_catch_event",
            NodeKind::TimerCatchEvent { .. } => "timer_catch_event",
            NodeKind::ExclusiveGateway => "exclusive_gateway",
            NodeKind::ParallelGateway => "parallel_gateway",
            NodeKind::InclusiveGateway { .. } => "inclusive_gateway",
            NodeKind::ComplexGateway { .. } => "complex_gateway",
        }
    }
}

// ─── Message integration ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationDirection {
    Catch,
    Throw,
}

/// Maps a provider-supplied header path (JSON pointer) to a named value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub path: String,
}

/// Message-integration extension of a flow node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationSpec {
    pub route: String,
    pub direction: IntegrationDirection,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// Provider-side handle of an opened integration route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationHandle {
    pub node_id: FlowNodeId,
    pub route: String,
    pub direction: IntegrationDirection,
    /// Opaque provider channel identifier.
    pub channel: String,
}

// ─── Deployed flow node ───────────────────────────────────────

/// Named output binding of a node. Tasks compute `expression`; events copy
/// the same-named payload field or metadata value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataOutput {
    pub object_id: String,
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingFlow {
    pub flow_id: String,
    pub target: FlowNodeId,
    pub condition: Option<String>,
}

/// Static, deployed flow node. Immutable after deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: FlowNodeId,
    pub element_id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Source node of every structurally incoming sequence flow.
    pub incoming: Vec<FlowNodeId>,
    /// Declaration order is routing order for exclusive gateways.
    pub outgoing: Vec<OutgoingFlow>,
    pub default_flow: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<DataOutput>,
    pub integration: Option<IntegrationSpec>,
}

impl FlowNode {
    /// All data-object ids this node is associated with.
    pub fn data_object_ids(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .map(String::as_str)
            .chain(self.outputs.iter().map(|o| o.object_id.as_str()))
    }

    pub fn throws(&self) -> Option<&IntegrationSpec> {
        self.integration
            .as_ref()
            .filter(|spec| spec.direction == IntegrationDirection::Throw)
    }

    pub fn catches(&self) -> Option<&IntegrationSpec> {
        self.integration
            .as_ref()
            .filter(|spec| spec.direction == IntegrationDirection::Catch)
    }
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Completed { at: Timestamp },
    Cancelled { at: Timestamp },
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// One execution of a process definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub process_id: String,
    pub version: u32,
    pub instance_id: Uuid,
    pub state: ProcessState,
    pub created_at: Timestamp,
}

// ─── Flow node instance ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Inactive,
    Active,
    Passed,
    Deactivated,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Passed | NodeState::Deactivated)
    }

    pub const NON_TERMINAL: [NodeState; 2] = [NodeState::Inactive, NodeState::Active];
}

/// What a non-terminal node instance is parked on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// Join gateway waiting for more incoming branches.
    Branches,
    /// Timer catch event waiting for its due timer.
    Timer,
    /// Message catch event holding the token, waiting for the message.
    Message,
    /// Message catch event holding the message, waiting for the token.
    Token,
}

/// Join counter of one gateway pass. Lives inside the gateway's own
/// FlowNodeInstance, so only the gateway actor ever writes it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCounter {
    /// Distinct incoming branches (source node ids) seen in this pass.
    pub arrived: Vec<FlowNodeId>,
    pub fired: bool,
    /// Redelivered branches absorbed without counting.
    pub duplicates: u32,
}

/// The record of one flow node's execution within one process instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    pub node_id: FlowNodeId,
    pub element_id: String,
    pub process_id: String,
    pub instance_id: Uuid,
    pub state: NodeState,
    pub waiting_for: Option<WaitReason>,
    pub created_at: Timestamp,
    pub passed_at: Option<Timestamp>,
    /// Number of loop re-entries of this record.
    pub pass_count: u32,
    pub join: Option<JoinCounter>,
    /// Highest predecessor pass accepted per incoming branch. A token whose
    /// pass is not above the mark is a redelivery.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accepted: BTreeMap<FlowNodeId, u32>,
    /// Successors activated by the latest pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routed_to: Vec<FlowNodeId>,
    /// A deactivation was already forwarded from the latest pass.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub propagated: bool,
}

impl FlowNodeInstance {
    pub fn new(node: &FlowNode, process_id: &str, instance_id: Uuid, state: NodeState) -> Self {
        Self {
            node_id: node.id.clone(),
            element_id: node.element_id.clone(),
            process_id: process_id.to_string(),
            instance_id,
            state,
            waiting_for: None,
            created_at: now_ms(),
            passed_at: None,
            pass_count: 0,
            join: None,
            accepted: BTreeMap::new(),
            routed_to: Vec::new(),
            propagated: false,
        }
    }

    pub fn key(&self) -> NodeInstanceKey {
        NodeInstanceKey::new(self.node_id.clone(), self.instance_id)
    }

    /// Record a token from `from` at its `pass`. False for a redelivery.
    pub fn accept_token(&mut self, from: &FlowNodeId, pass: u32) -> bool {
        match self.accepted.get(from) {
            Some(mark) if pass <= *mark => false,
            _ => {
                self.accepted.insert(from.clone(), pass);
                true
            }
        }
    }

    pub fn is_redelivery(&self, from: &FlowNodeId, pass: u32) -> bool {
        self.accepted.get(from).is_some_and(|mark| pass <= *mark)
    }

    /// Whether the token `source` sent here in its latest pass was consumed.
    /// A deactivated record swallows late tokens.
    pub fn consumed_token_of(&self, source: &FlowNodeInstance) -> bool {
        self.state == NodeState::Deactivated
            || self
                .accepted
                .get(&source.node_id)
                .is_some_and(|mark| *mark >= source.pass_count)
    }
}

// ─── Archive ──────────────────────────────────────────────────

/// Snapshot of a finished instance's subtree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedInstance {
    pub process_id: String,
    pub instance_id: Uuid,
    pub completed_at: Timestamp,
    pub process: Option<ProcessInstance>,
    pub nodes: Vec<FlowNodeInstance>,
    pub links: Vec<(NodeInstanceKey, NodeInstanceKey)>,
    /// Last values of the instance's data objects.
    #[serde(default)]
    pub data_objects: BTreeMap<String, serde_json::Value>,
    /// The instance's runtime event log up to the archive.
    #[serde(default)]
    pub events: Vec<RuntimeEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_node_id_is_stable_and_scoped() {
        let a = FlowNodeId::derive("acme", "order", 1, &[], "task_a");
        let b = FlowNodeId::derive("acme", "order", 1, &[], "task_a");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);

        let other_version = FlowNodeId::derive("acme", "order", 2, &[], "task_a");
        let nested = FlowNodeId::derive("acme", "order", 1, &["sub_1".to_string()], "task_a");
        assert_ne!(a, other_version);
        assert_ne!(a, nested);
    }

    #[test]
    fn flow_node_id_fields_do_not_run_together() {
        let a = FlowNodeId::derive("ab", "c", 1, &[], "x");
        let b = FlowNodeId::derive("a", "bc", 1, &[], "x");
        assert_ne!(a, b);
    }

    #[test]
    fn node_kind_serde_uses_type_tag() {
        let yaml = "type: inclusive_gateway\njoin_threshold: 2\n";
        let kind: NodeKind = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            kind,
            NodeKind::InclusiveGateway {
                join_threshold: Some(2)
            }
        );

        let timer: NodeKind =
            serde_json::from_str(r#"{"type":"timer_catch_event","timer":{"duration":"PT5S"}}"#)
                .unwrap();
        assert_eq!(
            timer.timer(),
            Some(&TimerDefinition::Duration("PT5S".to_string()))
        );
    }

    #[test]
    fn terminal_states() {
        assert!(NodeState::Passed.is_terminal());
        assert!(NodeState::Deactivated.is_terminal());
        assert!(!NodeState::Active.is_terminal());
        assert!(!NodeState::Inactive.is_terminal());
        assert!(ProcessState::Completed { at: 1 }.is_terminal());
        assert!(!ProcessState::Running.is_terminal());
    }

    #[test]
    fn tokens_at_or_below_the_mark_are_redeliveries() {
        let node = FlowNode {
            id: FlowNodeId::from("task"),
            element_id: "task".into(),
            name: "task".into(),
            kind: NodeKind::Task,
            incoming: vec![FlowNodeId::from("a"), FlowNodeId::from("b")],
            outgoing: vec![],
            default_flow: None,
            inputs: vec![],
            outputs: vec![],
            integration: None,
        };
        let mut record = FlowNodeInstance::new(&node, "p", Uuid::nil(), NodeState::Active);
        let a = FlowNodeId::from("a");
        let b = FlowNodeId::from("b");
        assert!(record.accept_token(&a, 0));
        assert!(!record.accept_token(&a, 0));
        assert!(record.is_redelivery(&a, 0));
        // Other branch and later loop passes are fresh.
        assert!(!record.is_redelivery(&b, 0));
        assert!(record.accept_token(&a, 1));
    }
}
