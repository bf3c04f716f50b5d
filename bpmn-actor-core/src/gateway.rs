//! N-of-M join synchronization.
//!
//! The counter lives in the gateway's own FlowNodeInstance, so the gateway
//! actor is its only writer. Branches are counted by distinct source node,
//! which makes arrival order irrelevant.

use crate::types::{FlowNode, FlowNodeId, FlowNodeInstance, JoinCounter, NodeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinDecision {
    /// Threshold reached by this arrival; route to successors once.
    Fire { arrived: u32 },
    Wait { arrived: u32, threshold: u32 },
    /// Counted for the pass, but the join already fired.
    AfterFire { arrived: u32 },
    /// Branch already counted in this pass.
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatewaySynchronizer {
    /// M: distinct structurally incoming branches.
    incoming: u32,
    /// N: arrivals needed to fire.
    threshold: u32,
}

impl GatewaySynchronizer {
    pub fn for_node(node: &FlowNode) -> Self {
        let incoming = (node.incoming.len() as u32).max(1);
        let threshold = match &node.kind {
            NodeKind::InclusiveGateway {
                join_threshold: Some(n),
            }
            | NodeKind::ComplexGateway { join_threshold: n } => *n,
            _ => incoming,
        };
        Self {
            incoming,
            threshold: threshold.clamp(1, incoming),
        }
    }

    pub fn incoming(&self) -> u32 {
        self.incoming
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether the record is between passes (no counter, or a fresh one).
    pub fn is_idle(record: &FlowNodeInstance) -> bool {
        record.join.is_none()
    }

    /// Count one branch arrival in `record`'s current pass.
    ///
    /// The counter is removed once all M branches of the pass have arrived,
    /// so the next arrival starts a new pass from zero.
    pub fn arrive(&self, record: &mut FlowNodeInstance, from: &FlowNodeId) -> JoinDecision {
        let counter = record.join.get_or_insert_with(JoinCounter::default);
        if counter.arrived.contains(from) {
            counter.duplicates += 1;
            return JoinDecision::Duplicate;
        }
        counter.arrived.push(from.clone());
        let arrived = counter.arrived.len() as u32;

        let decision = if counter.fired {
            JoinDecision::AfterFire { arrived }
        } else if arrived >= self.threshold {
            counter.fired = true;
            JoinDecision::Fire { arrived }
        } else {
            JoinDecision::Wait {
                arrived,
                threshold: self.threshold,
            }
        };

        if arrived >= self.incoming {
            record.join = None;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeState;
    use uuid::Uuid;

    fn gateway(kind: NodeKind, sources: &[&str]) -> FlowNode {
        FlowNode {
            id: FlowNodeId::from("join"),
            element_id: "join".into(),
            name: "join".into(),
            kind,
            incoming: sources.iter().map(|s| FlowNodeId::from(*s)).collect(),
            outgoing: vec![],
            default_flow: None,
            inputs: vec![],
            outputs: vec![],
            integration: None,
        }
    }

    fn record(node: &FlowNode) -> FlowNodeInstance {
        FlowNodeInstance::new(node, "p", Uuid::nil(), NodeState::Inactive)
    }

    #[test]
    fn and_join_fires_once_for_any_arrival_order() {
        let node = gateway(NodeKind::ParallelGateway, &["a", "b", "c"]);
        let sync = GatewaySynchronizer::for_node(&node);
        let orders = [["a", "b", "c"], ["c", "a", "b"], ["b", "c", "a"]];
        for order in orders {
            let mut rec = record(&node);
            let fires = order
                .iter()
                .map(|s| sync.arrive(&mut rec, &FlowNodeId::from(*s)))
                .filter(|d| matches!(d, JoinDecision::Fire { .. }))
                .count();
            assert_eq!(fires, 1);
            // Counter consumed at firing.
            assert!(GatewaySynchronizer::is_idle(&rec));
        }
    }

    #[test]
    fn redelivered_branch_does_not_count() {
        let node = gateway(NodeKind::ParallelGateway, &["a", "b"]);
        let sync = GatewaySynchronizer::for_node(&node);
        let mut rec = record(&node);
        let a = FlowNodeId::from("a");
        assert_eq!(
            sync.arrive(&mut rec, &a),
            JoinDecision::Wait {
                arrived: 1,
                threshold: 2
            }
        );
        assert_eq!(sync.arrive(&mut rec, &a), JoinDecision::Duplicate);
        assert_eq!(rec.join.as_ref().map(|c| c.duplicates), Some(1));
        assert_eq!(
            sync.arrive(&mut rec, &FlowNodeId::from("b")),
            JoinDecision::Fire { arrived: 2 }
        );
    }

    #[test]
    fn n_of_m_fires_at_threshold_and_absorbs_the_rest() {
        let node = gateway(
            NodeKind::ComplexGateway { join_threshold: 2 },
            &["a", "b", "c"],
        );
        let sync = GatewaySynchronizer::for_node(&node);
        assert_eq!(sync.threshold(), 2);
        let mut rec = record(&node);

        assert!(matches!(
            sync.arrive(&mut rec, &FlowNodeId::from("c")),
            JoinDecision::Wait { .. }
        ));
        assert_eq!(
            sync.arrive(&mut rec, &FlowNodeId::from("a")),
            JoinDecision::Fire { arrived: 2 }
        );
        assert!(!GatewaySynchronizer::is_idle(&rec));
        assert_eq!(
            sync.arrive(&mut rec, &FlowNodeId::from("b")),
            JoinDecision::AfterFire { arrived: 3 }
        );
        // All M consumed: the next pass starts over.
        assert!(GatewaySynchronizer::is_idle(&rec));
        assert!(matches!(
            sync.arrive(&mut rec, &FlowNodeId::from("b")),
            JoinDecision::Wait { arrived: 1, .. }
        ));
    }

    #[test]
    fn inclusive_defaults_to_all_incoming() {
        let node = gateway(
            NodeKind::InclusiveGateway {
                join_threshold: None,
            },
            &["a", "b"],
        );
        assert_eq!(GatewaySynchronizer::for_node(&node).threshold(), 2);
    }

    #[test]
    fn single_incoming_gateway_splits_immediately() {
        let node = gateway(NodeKind::ParallelGateway, &["a"]);
        let sync = GatewaySynchronizer::for_node(&node);
        let mut rec = record(&node);
        let a = FlowNodeId::from("a");
        assert_eq!(sync.arrive(&mut rec, &a), JoinDecision::Fire { arrived: 1 });
        assert_eq!(sync.arrive(&mut rec, &a), JoinDecision::Fire { arrived: 1 });
    }
}
