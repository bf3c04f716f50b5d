//! Wire contract between the trigger layer, the node actors and the
//! cleansing service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::types::{FlowNodeId, Timestamp};

/// Named values extracted from integration headers.
pub type Metadata = BTreeMap<String, Value>;

/// An external event at a start or catch node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub instance_id: Uuid,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationSource {
    /// A predecessor passed. `pass` is the predecessor's pass count when it
    /// sent the token.
    Token { from: FlowNodeId, pass: u32 },
    /// An inbound integration message for an existing instance.
    Integration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationMessage {
    pub instance_id: Uuid,
    pub source: ActivationSource,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ActivationMessage {
    pub fn token(instance_id: Uuid, from: FlowNodeId, pass: u32) -> Self {
        Self {
            instance_id,
            source: ActivationSource::Token { from, pass },
            payload: Value::Null,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationMessage {
    pub instance_id: Uuid,
    /// Nodes already deactivated by this cascade, oldest first.
    #[serde(default)]
    pub trail: Vec<FlowNodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerDueMessage {
    pub instance_id: Uuid,
    pub fire_at: Timestamp,
}

/// Mailbox message of a node actor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeMessage {
    Trigger(TriggerMessage),
    Activation(ActivationMessage),
    Deactivation(DeactivationMessage),
    TimerDue(TimerDueMessage),
    /// Schedule the timers of a timer start event.
    Arm,
}

impl NodeMessage {
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            NodeMessage::Trigger(m) => Some(m.instance_id),
            NodeMessage::Activation(m) => Some(m.instance_id),
            NodeMessage::Deactivation(m) => Some(m.instance_id),
            NodeMessage::TimerDue(m) => Some(m.instance_id),
            NodeMessage::Arm => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::Trigger(_) => "trigger",
            NodeMessage::Activation(_) => "activation",
            NodeMessage::Deactivation(_) => "deactivation",
            NodeMessage::TimerDue(_) => "timer_due",
            NodeMessage::Arm => "arm",
        }
    }
}

// ── Cleansing ──

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMessage {
    pub process_id: String,
    pub instance_id: Uuid,
    pub completed_at: Timestamp,
    /// Snapshotted into the archive, then released.
    pub data_object_ids: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMessage {
    pub process_id: String,
    pub instance_id: Uuid,
    pub data_object_ids: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionMessage {
    Archive(ArchiveMessage),
    Deletion(DeletionMessage),
}

impl CompletionMessage {
    pub fn instance_id(&self) -> Uuid {
        match self {
            CompletionMessage::Archive(m) => m.instance_id,
            CompletionMessage::Deletion(m) => m.instance_id,
        }
    }

    pub fn data_object_ids(&self) -> &BTreeSet<String> {
        match self {
            CompletionMessage::Archive(m) => &m.data_object_ids,
            CompletionMessage::Deletion(m) => &m.data_object_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_message_wire_shape() {
        let msg = NodeMessage::Activation(ActivationMessage::token(
            Uuid::nil(),
            FlowNodeId::from("a1"),
            2,
        ));
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["kind"], "activation");
        assert_eq!(wire["source"], json!({"type": "token", "from": "a1", "pass": 2}));

        let arm: NodeMessage = serde_json::from_value(json!({"kind": "arm"})).unwrap();
        assert_eq!(arm, NodeMessage::Arm);
        assert_eq!(arm.instance_id(), None);
    }

    #[test]
    fn trigger_defaults_payload_and_metadata() {
        let msg: TriggerMessage = serde_json::from_value(json!({
            "instance_id": "00000000-0000-0000-0000-000000000000"
        }))
        .unwrap();
        assert_eq!(msg.payload, Value::Null);
        assert!(msg.metadata.is_empty());
    }
}
