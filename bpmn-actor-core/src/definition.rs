//! Deserialized process definitions and their validated, deployed form.
//!
//! A [`ProcessDefinition`] is the node/edge graph an importer hands to the
//! engine. [`DeployedProcess::build`] validates it, derives every
//! [`FlowNodeId`] and freezes the result.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::CompletionPolicy;
use crate::error::{EngineError, EngineResult};
use crate::expression;
use crate::types::*;

fn default_version() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Overrides the engine-wide completion policy.
    #[serde(default)]
    pub completion: Option<CompletionPolicy>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub flows: Vec<SequenceFlowDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// BPMN element id.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Enclosing sub-process element ids, outermost first.
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<DataOutput>,
    #[serde(default)]
    pub default_flow: Option<String>,
    #[serde(default)]
    pub integration: Option<IntegrationSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlowDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}

impl ProcessDefinition {
    pub fn from_yaml(content: &str) -> EngineResult<Self> {
        serde_yaml::from_str(content).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    /// Every data-object id declared on any node.
    pub fn data_objects(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.inputs
                    .iter()
                    .cloned()
                    .chain(n.outputs.iter().map(|o| o.object_id.clone()))
            })
            .collect()
    }
}

// ─── Validation ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn violation(errors: &mut Vec<ValidationError>, rule: &'static str, message: String) {
    errors.push(ValidationError { rule, message });
}

/// Validate a definition before deployment. Returns all errors found.
pub fn validate_definition(def: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut node_map: HashMap<&str, &NodeDefinition> = HashMap::new();
    for node in &def.nodes {
        if node_map.insert(node.id.as_str(), node).is_some() {
            violation(
                &mut errors,
                "duplicate_node",
                format!("duplicate node id: {}", node.id),
            );
        }
    }

    let mut flow_ids = HashSet::new();
    let mut outgoing: HashMap<&str, Vec<&SequenceFlowDefinition>> = HashMap::new();
    let mut incoming: HashMap<&str, Vec<&SequenceFlowDefinition>> = HashMap::new();
    for flow in &def.flows {
        if !flow_ids.insert(flow.id.as_str()) {
            violation(
                &mut errors,
                "duplicate_flow",
                format!("duplicate sequence flow id: {}", flow.id),
            );
        }
        for (end, id) in [("source", &flow.source), ("target", &flow.target)] {
            if !node_map.contains_key(id.as_str()) {
                violation(
                    &mut errors,
                    "unknown_endpoint",
                    format!("flow {} has unknown {end} '{id}'", flow.id),
                );
            }
        }
        outgoing.entry(flow.source.as_str()).or_default().push(flow);
        incoming.entry(flow.target.as_str()).or_default().push(flow);
    }

    if !def.nodes.iter().any(|n| n.kind.is_start()) {
        violation(
            &mut errors,
            "no_start",
            format!("process {} has no start event", def.process_id),
        );
    }

    let data_objects = def.data_objects();

    for node in &def.nodes {
        let id = node.id.as_str();
        let out = outgoing.get(id).map(Vec::as_slice).unwrap_or_default();
        let inc = incoming.get(id).map(Vec::as_slice).unwrap_or_default();

        if node.kind.is_start() && !inc.is_empty() {
            violation(
                &mut errors,
                "start_incoming",
                format!("start event {id} has incoming flows"),
            );
        }
        if node.kind == NodeKind::EndEvent && !out.is_empty() {
            violation(
                &mut errors,
                "end_outgoing",
                format!("end event {id} has outgoing flows"),
            );
        }

        if let Some(default) = &node.default_flow {
            match out.iter().find(|f| &f.id == default) {
                None => violation(
                    &mut errors,
                    "default_flow",
                    format!("default flow {default} of {id} is not one of its outgoing flows"),
                ),
                Some(flow) if flow.condition.is_some() => violation(
                    &mut errors,
                    "default_flow",
                    format!("default flow {default} of {id} carries a condition"),
                ),
                Some(_) => {}
            }
        }

        if node.kind.is_join() {
            let sources: HashSet<&str> = inc.iter().map(|f| f.source.as_str()).collect();
            if sources.len() != inc.len() {
                violation(
                    &mut errors,
                    "parallel_join_flows",
                    format!("gateway {id} has several flows from the same source"),
                );
            }
            let m = sources.len() as u32;
            let threshold = match &node.kind {
                NodeKind::InclusiveGateway { join_threshold } => *join_threshold,
                NodeKind::ComplexGateway { join_threshold } => Some(*join_threshold),
                _ => None,
            };
            if let Some(n) = threshold {
                if n == 0 || n > m.max(1) {
                    violation(
                        &mut errors,
                        "join_threshold",
                        format!("gateway {id} needs {n} of {m} incoming branches"),
                    );
                }
            }
        }

        if let Some(timer) = node.kind.timer() {
            if let Err(e) = timer.validate() {
                violation(&mut errors, "timer_spec", format!("{id}: {e}"));
            }
        }

        for output in &node.outputs {
            match (&output.expression, &node.kind) {
                (Some(expr), NodeKind::Task) => {
                    if let Err(e) = expression::validate(expr, &data_objects) {
                        violation(&mut errors, "expression", format!("{id}: {e}"));
                    }
                }
                (Some(_), _) => violation(
                    &mut errors,
                    "expression",
                    format!("{id}: only tasks compute output expressions"),
                ),
                (None, _) => {}
            }
        }

        if let Some(spec) = &node.integration {
            let allowed = match spec.direction {
                IntegrationDirection::Catch => {
                    matches!(node.kind, NodeKind::StartEvent | NodeKind::MessageCatchEvent)
                }
                IntegrationDirection::Throw => matches!(
                    node.kind,
                    NodeKind::Task | NodeKind::IntermediateThrowEvent | NodeKind::EndEvent
                ),
            };
            if !allowed {
                violation(
                    &mut errors,
                    "integration",
                    format!(
                        "{id}: {} cannot carry a {:?} integration",
                        node.kind.as_str(),
                        spec.direction
                    ),
                );
            }
        }
    }

    for flow in &def.flows {
        if let Some(condition) = &flow.condition {
            if let Err(e) = expression::validate(condition, &data_objects) {
                violation(&mut errors, "expression", format!("flow {}: {e}", flow.id));
            }
        }
    }

    errors
}

/// Element ids not reachable from any start event.
pub fn unreachable_nodes(def: &ProcessDefinition) -> Vec<String> {
    let mut graph: DiGraph<&str, &str> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &def.nodes {
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }
    for flow in &def.flows {
        if let (Some(&a), Some(&b)) = (
            index.get(flow.source.as_str()),
            index.get(flow.target.as_str()),
        ) {
            graph.add_edge(a, b, flow.id.as_str());
        }
    }

    let mut reached = HashSet::new();
    for node in def.nodes.iter().filter(|n| n.kind.is_start()) {
        let mut dfs = Dfs::new(&graph, index[node.id.as_str()]);
        while let Some(nx) = dfs.next(&graph) {
            reached.insert(nx);
        }
    }

    def.nodes
        .iter()
        .filter(|n| !reached.contains(&index[n.id.as_str()]))
        .map(|n| n.id.clone())
        .collect()
}

// ─── Deployed form ────────────────────────────────────────────

/// A validated definition with derived node identities. Immutable.
#[derive(Debug)]
pub struct DeployedProcess {
    pub process_id: String,
    pub version: u32,
    pub completion: CompletionPolicy,
    /// Union of the data-object ids declared on the process's nodes.
    pub data_objects: BTreeSet<String>,
    nodes: BTreeMap<FlowNodeId, FlowNode>,
    by_element: HashMap<String, FlowNodeId>,
}

impl DeployedProcess {
    pub fn build(
        client_id: &str,
        def: &ProcessDefinition,
        default_completion: CompletionPolicy,
    ) -> EngineResult<Self> {
        let errors = validate_definition(def);
        if !errors.is_empty() {
            let msgs: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(EngineError::InvalidDefinition(format!(
                "{}: {}",
                def.process_id,
                msgs.join("; ")
            )));
        }
        for element in unreachable_nodes(def) {
            tracing::warn!(
                process_id = %def.process_id,
                element_id = %element,
                "node is unreachable from every start event"
            );
        }

        let by_element: HashMap<String, FlowNodeId> = def
            .nodes
            .iter()
            .map(|n| {
                let id = FlowNodeId::derive(client_id, &def.process_id, def.version, &n.path, &n.id);
                (n.id.clone(), id)
            })
            .collect();

        let mut nodes = BTreeMap::new();
        for n in &def.nodes {
            let id = by_element[&n.id].clone();
            let mut incoming: Vec<FlowNodeId> = Vec::new();
            for flow in def.flows.iter().filter(|f| f.target == n.id) {
                let source = by_element[&flow.source].clone();
                if !incoming.contains(&source) {
                    incoming.push(source);
                }
            }
            let outgoing = def
                .flows
                .iter()
                .filter(|f| f.source == n.id)
                .map(|f| OutgoingFlow {
                    flow_id: f.id.clone(),
                    target: by_element[&f.target].clone(),
                    condition: f.condition.clone(),
                })
                .collect();
            nodes.insert(
                id.clone(),
                FlowNode {
                    id,
                    element_id: n.id.clone(),
                    name: n.name.clone().unwrap_or_else(|| n.id.clone()),
                    kind: n.kind.clone(),
                    incoming,
                    outgoing,
                    default_flow: n.default_flow.clone(),
                    inputs: n.inputs.clone(),
                    outputs: n.outputs.clone(),
                    integration: n.integration.clone(),
                },
            );
        }

        Ok(Self {
            process_id: def.process_id.clone(),
            version: def.version,
            completion: def.completion.unwrap_or(default_completion),
            data_objects: def.data_objects(),
            nodes,
            by_element,
        })
    }

    pub fn node(&self, id: &FlowNodeId) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn node_by_element(&self, element_id: &str) -> Option<&FlowNode> {
        self.by_element
            .get(element_id)
            .and_then(|id| self.nodes.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    /// Addresses the due-timer poller scans.
    pub fn timer_nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values().filter(|n| n.kind.timer().is_some())
    }

    /// The single plain start event, used when a caller does not name one.
    pub fn default_start(&self) -> EngineResult<&FlowNode> {
        let mut starts = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::StartEvent && n.catches().is_none());
        match (starts.next(), starts.next()) {
            (Some(node), None) => Ok(node),
            (None, _) => Err(EngineError::InvalidDefinition(format!(
                "{} has no plain start event",
                self.process_id
            ))),
            (Some(_), Some(_)) => Err(EngineError::InvalidDefinition(format!(
                "{} has several plain start events; name one",
                self.process_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &str = r#"
process_id: order
nodes:
  - id: start
    type: start_event
    outputs:
      - object_id: order
  - id: split
    type: parallel_gateway
  - id: pick
    type: task
    inputs: [order]
    outputs:
      - object_id: picked
        expression: "order.qty * 2"
  - id: bill
    type: task
    outputs:
      - object_id: invoice
  - id: join
    type: parallel_gateway
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: split }
  - { id: f2, source: split, target: pick }
  - { id: f3, source: split, target: bill }
  - { id: f4, source: pick, target: join }
  - { id: f5, source: bill, target: join }
  - { id: f6, source: join, target: end }
"#;

    fn rules(def: &ProcessDefinition) -> Vec<&'static str> {
        validate_definition(def).into_iter().map(|e| e.rule).collect()
    }

    #[test]
    fn builds_valid_definition() {
        let def = ProcessDefinition::from_yaml(ORDER).unwrap();
        assert_eq!(def.version, 1);
        let deployed = DeployedProcess::build("acme", &def, CompletionPolicy::Archive).unwrap();

        let join = deployed.node_by_element("join").unwrap();
        assert_eq!(join.incoming.len(), 2);
        assert_eq!(
            join.id,
            FlowNodeId::derive("acme", "order", 1, &[], "join")
        );
        let split = deployed.node_by_element("split").unwrap();
        let targets: Vec<_> = split.outgoing.iter().map(|f| f.flow_id.as_str()).collect();
        assert_eq!(targets, ["f2", "f3"]);

        let objects: Vec<_> = deployed.data_objects.iter().map(String::as_str).collect();
        assert_eq!(objects, ["invoice", "order", "picked"]);
        assert_eq!(deployed.default_start().unwrap().element_id, "start");
    }

    #[test]
    fn rejects_structural_errors() {
        let mut def = ProcessDefinition::from_yaml(ORDER).unwrap();
        def.flows.push(SequenceFlowDefinition {
            id: "f7".into(),
            source: "end".into(),
            target: "ghost".into(),
            condition: None,
        });
        def.flows.push(SequenceFlowDefinition {
            id: "f8".into(),
            source: "pick".into(),
            target: "start".into(),
            condition: Some("nope.x > 1".into()),
        });
        let found = rules(&def);
        for rule in ["unknown_endpoint", "end_outgoing", "start_incoming", "expression"] {
            assert!(found.contains(&rule), "missing {rule} in {found:?}");
        }
        assert!(matches!(
            DeployedProcess::build("acme", &def, CompletionPolicy::Archive),
            Err(EngineError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn rejects_bad_thresholds_and_timers() {
        let yaml = r#"
process_id: p
nodes:
  - { id: s, type: start_event }
  - { id: a, type: task }
  - { id: b, type: task }
  - { id: j, type: complex_gateway, join_threshold: 3 }
  - { id: t, type: timer_catch_event, timer: { duration: "PT0S" } }
  - { id: e, type: end_event }
flows:
  - { id: f1, source: s, target: a }
  - { id: f2, source: s, target: b }
  - { id: f3, source: a, target: j }
  - { id: f4, source: b, target: j }
  - { id: f5, source: j, target: t }
  - { id: f6, source: t, target: e }
"#;
        let def = ProcessDefinition::from_yaml(yaml).unwrap();
        let found = rules(&def);
        assert!(found.contains(&"join_threshold"));
        assert!(found.contains(&"timer_spec"));
    }

    #[test]
    fn default_flow_must_be_an_unconditional_outgoing_flow() {
        let yaml = r#"
process_id: p
nodes:
  - { id: s, type: start_event }
  - { id: x, type: exclusive_gateway, default_flow: f9 }
  - { id: e, type: end_event }
flows:
  - { id: f1, source: s, target: x }
  - { id: f2, source: x, target: e }
"#;
        let def = ProcessDefinition::from_yaml(yaml).unwrap();
        assert_eq!(rules(&def), ["default_flow"]);
    }

    #[test]
    fn reports_unreachable_nodes() {
        let yaml = r#"
process_id: p
nodes:
  - { id: s, type: start_event }
  - { id: e, type: end_event }
  - { id: orphan, type: task }
flows:
  - { id: f1, source: s, target: e }
"#;
        let def = ProcessDefinition::from_yaml(yaml).unwrap();
        assert_eq!(unreachable_nodes(&def), ["orphan"]);
    }
}
