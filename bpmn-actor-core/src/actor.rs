//! Flow node actors.
//!
//! One actor (a tokio task with an unbounded mailbox) runs per deployed flow
//! node and handles the node's messages for every process instance
//! sequentially. The actor is the only writer of the FlowNodeInstance
//! records rooted at its node, so per-record state needs no further locking.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cleansing::CompletionSender;
use crate::config::CompletionPolicy;
use crate::definition::DeployedProcess;
use crate::dispatcher::MessageDispatcher;
use crate::error::{EngineError, EngineResult, FaultKind, TimerSpecError};
use crate::events::RuntimeEvent;
use crate::expression::ExpressionEvaluator;
use crate::gateway::{GatewaySynchronizer, JoinDecision};
use crate::messages::{
    ActivationMessage, ActivationSource, ArchiveMessage, CompletionMessage, DeactivationMessage,
    DeletionMessage, Metadata, NodeMessage, TimerDueMessage,
};
use crate::providers::{DataObjectProvider, TimerStoreProvider};
use crate::repository::InstanceRepository;
use crate::router::{MailboxReceiver, Router};
use crate::types::{
    now_ms, DataOutput, FlowNode, FlowNodeId, FlowNodeInstance, NodeInstanceKey, NodeKind,
    NodeState, OutgoingFlow, ProcessInstance, ProcessState, TimerDefinition, TimerRecord,
    Timestamp, WaitReason,
};

/// Everything an actor talks to besides its own definition.
pub struct ActorServices {
    pub repository: Arc<dyn InstanceRepository>,
    pub timer_store: Arc<dyn TimerStoreProvider>,
    pub data_objects: Arc<dyn DataObjectProvider>,
    pub evaluator: ExpressionEvaluator,
    pub dispatcher: Arc<MessageDispatcher>,
    pub router: Router,
    pub completions: CompletionSender,
}

pub struct NodeActor {
    process: Arc<DeployedProcess>,
    node: FlowNode,
    services: Arc<ActorServices>,
}

fn repository_failure(source: anyhow::Error) -> EngineError {
    EngineError::provider("repository")(source)
}

impl NodeActor {
    pub fn new(process: Arc<DeployedProcess>, node: FlowNode, services: Arc<ActorServices>) -> Self {
        Self {
            process,
            node,
            services,
        }
    }

    pub fn spawn(self, mailbox: MailboxReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(mailbox))
    }

    /// Handle messages until the mailbox is unregistered from the router.
    pub async fn run(self, mut mailbox: MailboxReceiver) {
        tracing::debug!(
            node = %self.node.id,
            element_id = %self.node.element_id,
            kind = self.node.kind.as_str(),
            "node actor started"
        );
        while let Some(message) = mailbox.recv().await {
            let instance_id = message.instance_id();
            let kind = message.kind();
            if let Err(e) = self.handle(message).await {
                self.report(instance_id, kind, &e).await;
            }
            self.services.router.in_flight().exit();
        }
        tracing::debug!(node = %self.node.id, "node actor stopped");
    }

    pub async fn handle(&self, message: NodeMessage) -> EngineResult<()> {
        match message {
            NodeMessage::Trigger(m) => self.on_trigger(m.instance_id, m.payload, m.metadata).await,
            NodeMessage::Activation(m) => self.on_activation(m).await,
            NodeMessage::Deactivation(m) => self.on_deactivation(m).await,
            NodeMessage::TimerDue(m) => self.on_timer_due(m).await,
            NodeMessage::Arm => self.arm_start_timer().await,
        }
    }

    // ── Triggers ──

    async fn on_trigger(
        &self,
        instance_id: Uuid,
        payload: Value,
        metadata: Metadata,
    ) -> EngineResult<()> {
        match &self.node.kind {
            kind if kind.is_start() => self.start_instance(instance_id, payload, metadata).await,
            NodeKind::MessageCatchEvent => self.catch_message(instance_id, payload, metadata).await,
            _ => Err(self.violation(instance_id, "trigger at a node that neither starts nor catches")),
        }
    }

    async fn start_instance(
        &self,
        instance_id: Uuid,
        payload: Value,
        metadata: Metadata,
    ) -> EngineResult<()> {
        if self.find(instance_id).await?.is_some() {
            return Err(self.duplicate(instance_id));
        }
        let created = self
            .services
            .repository
            .create_process_instance(&ProcessInstance {
                process_id: self.process.process_id.clone(),
                version: self.process.version,
                instance_id,
                state: ProcessState::Running,
                created_at: now_ms(),
            })
            .await
            .map_err(repository_failure)?;
        if !created {
            return Err(self.duplicate(instance_id));
        }
        tracing::info!(
            process_id = %self.process.process_id,
            %instance_id,
            start = %self.node.element_id,
            "process instance started"
        );
        self.record_event(
            instance_id,
            RuntimeEvent::InstanceStarted {
                process_id: self.process.process_id.clone(),
                version: self.process.version,
                start_node: self.node.id.clone(),
            },
        )
        .await;

        let record = FlowNodeInstance::new(
            &self.node,
            &self.process.process_id,
            instance_id,
            NodeState::Active,
        );
        self.save(&record).await?;
        self.record_activated(&record).await;
        self.store_outputs(instance_id, &payload, &metadata).await?;
        self.pass_and_route(record).await
    }

    // ── Activations ──

    async fn on_activation(&self, message: ActivationMessage) -> EngineResult<()> {
        let instance_id = message.instance_id;
        match (&self.node.kind, &message.source) {
            (kind, ActivationSource::Integration) if kind.is_start() => {
                self.start_instance(instance_id, message.payload, message.metadata)
                    .await
            }
            (kind, ActivationSource::Token { .. }) if kind.is_start() => {
                Err(self.violation(instance_id, "token sent to a start event"))
            }
            (kind, _) if kind.is_join() => self.join(&message).await,
            (NodeKind::MessageCatchEvent, ActivationSource::Integration) => {
                self.catch_message(instance_id, message.payload, message.metadata)
                    .await
            }
            (NodeKind::MessageCatchEvent, ActivationSource::Token { from, pass }) => {
                self.catch_token(instance_id, from, *pass).await
            }
            (NodeKind::TimerCatchEvent { timer }, _) => self.arm_catch_timer(&message, timer).await,
            _ => self.activity(&message).await,
        }
    }

    /// Create or re-enter the record for a token at a simple node.
    async fn enter(&self, message: &ActivationMessage) -> EngineResult<FlowNodeInstance> {
        let instance_id = message.instance_id;
        let ActivationSource::Token { from, pass } = &message.source else {
            return Err(self.violation(instance_id, "integration message at a node without a catch route"));
        };
        self.running_process(instance_id).await?;

        let record = match self.find(instance_id).await? {
            None => {
                let mut record = FlowNodeInstance::new(
                    &self.node,
                    &self.process.process_id,
                    instance_id,
                    NodeState::Active,
                );
                record.accept_token(from, *pass);
                record
            }
            Some(record) if record.is_redelivery(from, *pass) => {
                return Err(self.violation(
                    instance_id,
                    format!("redelivered token from {from} (pass {pass})"),
                ));
            }
            Some(mut record) if record.state == NodeState::Passed => {
                reenter(&mut record, NodeState::Active);
                record.accept_token(from, *pass);
                record
            }
            Some(record) if record.state == NodeState::Deactivated => {
                return Err(self.swallowed(instance_id).await);
            }
            Some(record) => {
                return Err(self.violation(
                    instance_id,
                    format!("token while the node instance is {:?}", record.state),
                ));
            }
        };
        self.save(&record).await?;
        self.record_activated(&record).await;
        Ok(record)
    }

    /// Task, throw event, exclusive gateway and end event.
    async fn activity(&self, message: &ActivationMessage) -> EngineResult<()> {
        let record = self.enter(message).await?;
        self.store_outputs(record.instance_id, &message.payload, &message.metadata)
            .await?;
        self.throw_message(record.instance_id).await;
        self.pass_and_route(record).await
    }

    async fn join(&self, message: &ActivationMessage) -> EngineResult<()> {
        let instance_id = message.instance_id;
        let ActivationSource::Token { from, pass } = &message.source else {
            return Err(self.violation(instance_id, "integration message at a gateway"));
        };
        if !self.node.incoming.contains(from) {
            return Err(self.violation(
                instance_id,
                format!("token from {from}, which has no flow into this gateway"),
            ));
        }
        self.running_process(instance_id).await?;

        let mut record = match self.find(instance_id).await? {
            None => FlowNodeInstance::new(
                &self.node,
                &self.process.process_id,
                instance_id,
                NodeState::Inactive,
            ),
            Some(record) if record.is_redelivery(from, *pass) => {
                self.record_event(
                    instance_id,
                    RuntimeEvent::JoinAbsorbed {
                        node_id: self.node.id.clone(),
                        from: from.clone(),
                        duplicate: true,
                    },
                )
                .await;
                tracing::debug!(node = %self.node.id, %instance_id, %from, pass, "redelivered branch absorbed");
                return Ok(());
            }
            Some(record) => match record.state {
                NodeState::Deactivated => {
                    return Err(self.swallowed(instance_id).await);
                }
                NodeState::Active => {
                    return Err(self.violation(instance_id, "gateway is stuck routing an earlier pass"));
                }
                NodeState::Passed if GatewaySynchronizer::is_idle(&record) => {
                    let mut record = record;
                    reenter(&mut record, NodeState::Inactive);
                    self.record_activated(&record).await;
                    record
                }
                _ => record,
            },
        };
        record.accept_token(from, *pass);

        let sync = GatewaySynchronizer::for_node(&self.node);
        match sync.arrive(&mut record, from) {
            JoinDecision::Wait { arrived, threshold } => {
                record.waiting_for = Some(WaitReason::Branches);
                self.save(&record).await?;
                self.record_event(
                    instance_id,
                    RuntimeEvent::JoinArrived {
                        node_id: self.node.id.clone(),
                        from: from.clone(),
                        arrived,
                        threshold,
                    },
                )
                .await;
                Ok(())
            }
            JoinDecision::Fire { arrived } => {
                record.state = NodeState::Active;
                record.waiting_for = None;
                self.save(&record).await?;
                tracing::debug!(node = %self.node.id, %instance_id, arrived, "join fired");
                self.record_event(
                    instance_id,
                    RuntimeEvent::JoinFired {
                        node_id: self.node.id.clone(),
                        arrived,
                    },
                )
                .await;
                self.pass_and_route(record).await
            }
            decision @ (JoinDecision::AfterFire { .. } | JoinDecision::Duplicate) => {
                self.save(&record).await?;
                self.record_event(
                    instance_id,
                    RuntimeEvent::JoinAbsorbed {
                        node_id: self.node.id.clone(),
                        from: from.clone(),
                        duplicate: decision == JoinDecision::Duplicate,
                    },
                )
                .await;
                // The absorbed token may have been the last one in flight.
                self.maybe_complete(instance_id).await
            }
        }
    }

    // ── Message catch ──

    /// The message half of a message catch event.
    async fn catch_message(
        &self,
        instance_id: Uuid,
        payload: Value,
        metadata: Metadata,
    ) -> EngineResult<()> {
        self.running_process(instance_id).await?;
        match self.find(instance_id).await? {
            None => {
                let mut record = FlowNodeInstance::new(
                    &self.node,
                    &self.process.process_id,
                    instance_id,
                    NodeState::Active,
                );
                record.waiting_for = Some(WaitReason::Token);
                self.save(&record).await?;
                self.record_activated(&record).await;
                self.store_outputs(instance_id, &payload, &metadata).await?;
                self.record_received(instance_id).await;
                Ok(())
            }
            Some(record)
                if record.state == NodeState::Active
                    && record.waiting_for == Some(WaitReason::Message) =>
            {
                self.store_outputs(instance_id, &payload, &metadata).await?;
                self.record_received(instance_id).await;
                self.pass_and_route(record).await
            }
            Some(mut record) if record.state == NodeState::Passed => {
                reenter(&mut record, NodeState::Active);
                record.waiting_for = Some(WaitReason::Token);
                self.save(&record).await?;
                self.record_activated(&record).await;
                self.store_outputs(instance_id, &payload, &metadata).await?;
                self.record_received(instance_id).await;
                Ok(())
            }
            Some(_) => Err(self.duplicate(instance_id)),
        }
    }

    /// The token half of a message catch event.
    async fn catch_token(&self, instance_id: Uuid, from: &FlowNodeId, pass: u32) -> EngineResult<()> {
        self.running_process(instance_id).await?;
        match self.find(instance_id).await? {
            None => {
                let mut record = FlowNodeInstance::new(
                    &self.node,
                    &self.process.process_id,
                    instance_id,
                    NodeState::Active,
                );
                record.accept_token(from, pass);
                record.waiting_for = Some(WaitReason::Message);
                self.save(&record).await?;
                self.record_activated(&record).await;
                Ok(())
            }
            Some(record) if record.is_redelivery(from, pass) => Err(self.violation(
                instance_id,
                format!("redelivered token from {from} (pass {pass})"),
            )),
            Some(mut record)
                if record.state == NodeState::Active
                    && record.waiting_for == Some(WaitReason::Token) =>
            {
                record.accept_token(from, pass);
                self.pass_and_route(record).await
            }
            Some(mut record) if record.state == NodeState::Passed => {
                reenter(&mut record, NodeState::Active);
                record.accept_token(from, pass);
                record.waiting_for = Some(WaitReason::Message);
                self.save(&record).await?;
                self.record_activated(&record).await;
                Ok(())
            }
            Some(record) if record.state == NodeState::Deactivated => {
                Err(self.swallowed(instance_id).await)
            }
            Some(record) => Err(self.violation(
                instance_id,
                format!("token while the node instance is {:?}", record.state),
            )),
        }
    }

    // ── Timers ──

    fn address(&self) -> String {
        self.node.id.to_string()
    }

    async fn arm_catch_timer(
        &self,
        message: &ActivationMessage,
        timer: &TimerDefinition,
    ) -> EngineResult<()> {
        let mut record = self.enter(message).await?;
        let fire_at = first_fire(timer, now_ms())?;
        self.services
            .timer_store
            .save(&TimerRecord {
                fire_at,
                actor_address: self.address(),
                instance_id: record.instance_id,
            })
            .await
            .map_err(EngineError::provider("timer_store"))?;
        record.waiting_for = Some(WaitReason::Timer);
        self.save(&record).await?;
        tracing::debug!(node = %self.node.id, instance_id = %record.instance_id, fire_at, "timer scheduled");
        self.record_event(
            record.instance_id,
            RuntimeEvent::TimerScheduled {
                node_id: self.node.id.clone(),
                fire_at,
            },
        )
        .await;
        Ok(())
    }

    async fn on_timer_due(&self, message: TimerDueMessage) -> EngineResult<()> {
        match &self.node.kind {
            NodeKind::TimerStartEvent { timer } => self.fire_start_timer(&message, timer).await,
            NodeKind::TimerCatchEvent { .. } => self.fire_catch_timer(&message).await,
            _ => Err(self.violation(message.instance_id, "due timer at a node without a timer")),
        }
    }

    async fn fire_catch_timer(&self, message: &TimerDueMessage) -> EngineResult<()> {
        let instance_id = message.instance_id;
        match self.find(instance_id).await? {
            Some(record)
                if record.state == NodeState::Active
                    && record.waiting_for == Some(WaitReason::Timer) =>
            {
                self.delete_timer(instance_id).await;
                self.record_event(
                    instance_id,
                    RuntimeEvent::TimerFired {
                        node_id: self.node.id.clone(),
                        fire_at: message.fire_at,
                    },
                )
                .await;
                self.pass_and_route(record).await
            }
            _ => {
                if let Err(e) = self
                    .services
                    .timer_store
                    .delete(&self.address(), instance_id)
                    .await
                {
                    tracing::warn!(node = %self.node.id, %instance_id, error = %e, "stale timer not removed");
                }
                Err(self.violation(instance_id, "due timer without a waiting node instance"))
            }
        }
    }

    /// Schedule a timer start event at deployment. Already stored timers are
    /// left alone so a restart resumes the existing schedule.
    async fn arm_start_timer(&self) -> EngineResult<()> {
        let NodeKind::TimerStartEvent { timer } = &self.node.kind else {
            return Ok(());
        };
        let address = self.address();
        let pending = self
            .services
            .timer_store
            .load_due(&address, Timestamp::MAX)
            .await
            .map_err(EngineError::provider("timer_store"))?;
        if !pending.is_empty() {
            tracing::debug!(node = %self.node.id, pending = pending.len(), "start timer already armed");
            return Ok(());
        }
        let schedule = timer.schedule(now_ms())?;
        for fire_at in &schedule.fire_at {
            self.services
                .timer_store
                .save(&TimerRecord {
                    fire_at: *fire_at,
                    actor_address: address.clone(),
                    instance_id: Uuid::now_v7(),
                })
                .await
                .map_err(EngineError::provider("timer_store"))?;
        }
        tracing::info!(
            node = %self.node.id,
            element_id = %self.node.element_id,
            fires = schedule.fire_at.len(),
            "start timer armed"
        );
        Ok(())
    }

    async fn fire_start_timer(
        &self,
        message: &TimerDueMessage,
        timer: &TimerDefinition,
    ) -> EngineResult<()> {
        let instance_id = message.instance_id;
        let address = self.address();
        let due = self
            .services
            .timer_store
            .load_due(&address, message.fire_at)
            .await
            .map_err(EngineError::provider("timer_store"))?;
        if !due.iter().any(|r| r.instance_id == instance_id) {
            return Err(self.violation(instance_id, "start timer already consumed"));
        }
        self.delete_timer(instance_id).await;
        self.record_event(
            instance_id,
            RuntimeEvent::TimerFired {
                node_id: self.node.id.clone(),
                fire_at: message.fire_at,
            },
        )
        .await;

        if timer.schedule(now_ms()).is_ok_and(|s| s.rearm) {
            if let Err(e) = self.rearm_start_timer(timer).await {
                self.report(Some(instance_id), "timer_due", &e).await;
            }
        }
        self.start_instance(instance_id, Value::Null, Metadata::new())
            .await
    }

    async fn rearm_start_timer(&self, timer: &TimerDefinition) -> EngineResult<()> {
        let fire_at = first_fire(timer, now_ms())?;
        self.services
            .timer_store
            .save(&TimerRecord {
                fire_at,
                actor_address: self.address(),
                instance_id: Uuid::now_v7(),
            })
            .await
            .map_err(EngineError::provider("timer_store"))
    }

    async fn delete_timer(&self, instance_id: Uuid) {
        if let Err(e) = self
            .services
            .timer_store
            .delete(&self.address(), instance_id)
            .await
        {
            let err = EngineError::provider("timer_store")(e);
            self.report(Some(instance_id), "timer_due", &err).await;
        }
    }

    // ── Deactivation ──

    async fn on_deactivation(&self, message: DeactivationMessage) -> EngineResult<()> {
        let instance_id = message.instance_id;
        if message.trail.contains(&self.node.id) {
            return Err(EngineError::CorruptAuditChain {
                node: self.node.id.clone(),
                instance_id,
            });
        }

        match self.find(instance_id).await? {
            None => {
                self.unfinished_process(instance_id).await?;
                // Tombstone: a token still in flight to this node is swallowed.
                let record = FlowNodeInstance::new(
                    &self.node,
                    &self.process.process_id,
                    instance_id,
                    NodeState::Deactivated,
                );
                self.save(&record).await?;
                self.record_deactivated(instance_id).await;
            }
            Some(record) if record.state == NodeState::Deactivated => {
                return Err(self.violation(instance_id, "node instance is already deactivated"));
            }
            Some(record) if record.state == NodeState::Passed && record.propagated => {
                return Err(self.violation(instance_id, "deactivation already forwarded from this pass"));
            }
            Some(mut record) if record.state == NodeState::Passed => {
                record.propagated = true;
                self.save(&record).await?;
                self.propagate(&record, &message.trail).await;
            }
            Some(mut record) => {
                record.state = NodeState::Deactivated;
                record.waiting_for = None;
                record.join = None;
                if self.node.kind.timer().is_some() {
                    self.delete_timer(instance_id).await;
                }
                self.save(&record).await?;
                self.record_deactivated(instance_id).await;
                self.propagate(&record, &message.trail).await;
            }
        }
        self.maybe_complete(instance_id).await
    }

    /// Forward the deactivation along the following links of `record`.
    async fn propagate(&self, record: &FlowNodeInstance, trail: &[FlowNodeId]) {
        let instance_id = record.instance_id;
        let following = match self.services.repository.following(&record.key()).await {
            Ok(following) => following,
            Err(e) => {
                self.report(Some(instance_id), "deactivation", &repository_failure(e))
                    .await;
                return;
            }
        };
        let mut trail = trail.to_vec();
        trail.push(self.node.id.clone());

        for key in following {
            match self.services.repository.find_node_instance(&key).await {
                Ok(Some(target)) if target.state.is_terminal() => continue,
                Ok(_) => {}
                Err(e) => {
                    self.report(Some(instance_id), "deactivation", &repository_failure(e))
                        .await;
                    continue;
                }
            }
            if trail.contains(&key.node_id) {
                let err = EngineError::CorruptAuditChain {
                    node: key.node_id.clone(),
                    instance_id,
                };
                self.report(Some(instance_id), "deactivation", &err).await;
                continue;
            }
            let message = NodeMessage::Deactivation(DeactivationMessage {
                instance_id,
                trail: trail.clone(),
            });
            if let Err(e) = self.services.router.send(&key.node_id, message).await {
                self.report(Some(instance_id), "deactivation", &e).await;
            }
        }
    }

    // ── Routing ──

    /// Move `record` to PASSED and send a token along every selected flow.
    async fn pass_and_route(&self, mut record: FlowNodeInstance) -> EngineResult<()> {
        let instance_id = record.instance_id;
        let flows = self.select_successors(instance_id).await?;

        record.state = NodeState::Passed;
        record.passed_at = Some(now_ms());
        record.waiting_for = None;
        record.routed_to = flows.iter().map(|f| f.target.clone()).collect();
        self.save(&record).await?;
        self.record_event(
            instance_id,
            RuntimeEvent::NodePassed {
                node_id: self.node.id.clone(),
                element_id: self.node.element_id.clone(),
            },
        )
        .await;

        let from = record.key();
        for flow in &flows {
            let to = NodeInstanceKey::new(flow.target.clone(), instance_id);
            if let Err(e) = self.services.repository.link_following(&from, &to).await {
                self.report(Some(instance_id), "activation", &repository_failure(e))
                    .await;
            }
            self.record_event(
                instance_id,
                RuntimeEvent::FlowTaken {
                    node_id: self.node.id.clone(),
                    flow_id: flow.flow_id.clone(),
                    target: flow.target.clone(),
                },
            )
            .await;
            let token = ActivationMessage::token(instance_id, self.node.id.clone(), record.pass_count);
            if let Err(e) = self
                .services
                .router
                .send(&flow.target, NodeMessage::Activation(token))
                .await
            {
                self.report(Some(instance_id), "activation", &e).await;
            }
        }

        if flows.is_empty() {
            self.maybe_complete(instance_id).await?;
        }
        Ok(())
    }

    /// Outgoing flows to take for this pass.
    ///
    /// Parallel gateways take every flow. Exclusive gateways take the first
    /// satisfied flow in declaration order. Everything else takes every
    /// satisfied flow. The default flow is taken only when nothing else is.
    async fn select_successors(&self, instance_id: Uuid) -> EngineResult<Vec<&OutgoingFlow>> {
        let node = &self.node;
        if node.outgoing.is_empty() {
            return Ok(Vec::new());
        }
        if node.kind == NodeKind::ParallelGateway {
            return Ok(node.outgoing.iter().collect());
        }

        let default = node
            .default_flow
            .as_deref()
            .and_then(|id| node.outgoing.iter().find(|f| f.flow_id == id));
        let candidates = node
            .outgoing
            .iter()
            .filter(|f| node.default_flow.as_deref() != Some(f.flow_id.as_str()));

        let mut selected = Vec::new();
        for flow in candidates {
            if self.guard_holds(flow, instance_id).await? {
                selected.push(flow);
                if node.kind == NodeKind::ExclusiveGateway {
                    break;
                }
            }
        }
        if selected.is_empty() {
            let flow = default.ok_or_else(|| EngineError::UnsatisfiedGateway {
                node: node.id.clone(),
                instance_id,
            })?;
            selected.push(flow);
        }
        Ok(selected)
    }

    async fn guard_holds(&self, flow: &OutgoingFlow, instance_id: Uuid) -> EngineResult<bool> {
        match &flow.condition {
            None => Ok(true),
            Some(condition) => {
                self.services
                    .evaluator
                    .evaluate_guard(
                        condition,
                        &self.process.data_objects,
                        &self.process.process_id,
                        instance_id,
                    )
                    .await
            }
        }
    }

    /// Complete the process instance once no node instance is open, no token
    /// is still in flight and an end was passed. Exactly one caller wins the
    /// transition.
    async fn maybe_complete(&self, instance_id: Uuid) -> EngineResult<()> {
        let repository = &self.services.repository;
        let records = repository
            .node_instances(instance_id)
            .await
            .map_err(repository_failure)?;
        if records.iter().any(|r| !r.state.is_terminal()) {
            return Ok(());
        }
        let by_node: HashMap<&FlowNodeId, &FlowNodeInstance> =
            records.iter().map(|r| (&r.node_id, r)).collect();
        let token_in_flight = records
            .iter()
            .filter(|r| r.state == NodeState::Passed)
            .any(|source| {
                source.routed_to.iter().any(|target| {
                    !by_node
                        .get(target)
                        .is_some_and(|t| t.consumed_token_of(source))
                })
            });
        if token_in_flight {
            return Ok(());
        }
        let reached_end = records.iter().any(|r| {
            r.state == NodeState::Passed
                && self
                    .process
                    .node(&r.node_id)
                    .is_some_and(|n| n.outgoing.is_empty())
        });
        if !reached_end {
            return self.abort(instance_id).await;
        }

        let at = now_ms();
        let finished = repository
            .finish_process_instance(instance_id, ProcessState::Completed { at })
            .await
            .map_err(repository_failure)?;
        if !finished {
            return Ok(());
        }
        self.record_event(instance_id, RuntimeEvent::InstanceCompleted { at })
            .await;

        let process_id = self.process.process_id.clone();
        let data_object_ids = self.process.data_objects.clone();
        let policy = self.process.completion;
        let message = match policy {
            CompletionPolicy::Archive => CompletionMessage::Archive(ArchiveMessage {
                process_id,
                instance_id,
                completed_at: at,
                data_object_ids: data_object_ids.clone(),
            }),
            CompletionPolicy::Delete => CompletionMessage::Deletion(DeletionMessage {
                process_id,
                instance_id,
                data_object_ids: data_object_ids.clone(),
            }),
        };
        self.record_event(
            instance_id,
            RuntimeEvent::CompletionRequested {
                policy,
                data_object_ids,
            },
        )
        .await;
        tracing::info!(
            process_id = %self.process.process_id,
            %instance_id,
            policy = ?policy,
            "process instance completed"
        );
        self.services.completions.send(message)
    }

    /// Every branch was deactivated before reaching an end: the instance is
    /// cancelled and nothing is cleansed.
    async fn abort(&self, instance_id: Uuid) -> EngineResult<()> {
        let at = now_ms();
        let aborted = self
            .services
            .repository
            .finish_process_instance(instance_id, ProcessState::Cancelled { at })
            .await
            .map_err(repository_failure)?;
        if aborted {
            self.record_event(instance_id, RuntimeEvent::InstanceCancelled { at })
                .await;
            tracing::info!(
                process_id = %self.process.process_id,
                %instance_id,
                "process instance aborted before reaching an end"
            );
        }
        Ok(())
    }

    // ── Data ──

    /// Write the node's output bindings. Computed values are all evaluated
    /// before any is written.
    async fn store_outputs(
        &self,
        instance_id: Uuid,
        payload: &Value,
        metadata: &Metadata,
    ) -> EngineResult<()> {
        let single = self.node.outputs.len() == 1;
        let mut values = Vec::with_capacity(self.node.outputs.len());
        for output in &self.node.outputs {
            let value = match &output.expression {
                Some(expression) => Some(
                    self.services
                        .evaluator
                        .evaluate(
                            expression,
                            &self.process.data_objects,
                            &self.process.process_id,
                            instance_id,
                        )
                        .await?,
                ),
                None => copied_value(output, single, payload, metadata),
            };
            if let Some(value) = value {
                values.push((output.object_id.as_str(), value));
            }
        }

        for (object_id, value) in values {
            if let Err(e) = self
                .services
                .data_objects
                .save(&self.process.process_id, object_id, instance_id, &value)
                .await
            {
                let err = EngineError::provider("data_objects")(e);
                self.report(Some(instance_id), "activation", &err).await;
            }
        }
        Ok(())
    }

    async fn load_inputs(&self, instance_id: Uuid) -> EngineResult<Map<String, Value>> {
        let mut inputs = Map::new();
        for object_id in &self.node.inputs {
            let value = self
                .services
                .data_objects
                .load(&self.process.process_id, object_id, instance_id)
                .await
                .map_err(EngineError::provider("data_objects"))?;
            if let Some(value) = value {
                inputs.insert(object_id.clone(), value);
            }
        }
        Ok(inputs)
    }

    /// Send the node's outbound message, if it throws one. Failures are
    /// reported and do not stop the flow.
    async fn throw_message(&self, instance_id: Uuid) {
        if self.node.throws().is_none() {
            return;
        }
        match self.dispatch_outbound(instance_id).await {
            Ok(route) => {
                self.record_event(
                    instance_id,
                    RuntimeEvent::MessageDispatched {
                        node_id: self.node.id.clone(),
                        route,
                    },
                )
                .await;
            }
            Err(e) => self.report(Some(instance_id), "activation", &e).await,
        }
    }

    async fn dispatch_outbound(&self, instance_id: Uuid) -> EngineResult<String> {
        let dispatcher = &self.services.dispatcher;
        dispatcher.ensure_throwing(&self.node).await?;
        let data = self.load_inputs(instance_id).await?;
        let payload = json!({
            "process_id": self.process.process_id,
            "instance_id": instance_id,
            "element_id": self.node.element_id,
            "data": data,
        });
        dispatcher.dispatch(&self.node.id, &payload).await
    }

    // ── Records and events ──

    async fn find(&self, instance_id: Uuid) -> EngineResult<Option<FlowNodeInstance>> {
        let key = NodeInstanceKey::new(self.node.id.clone(), instance_id);
        self.services
            .repository
            .find_node_instance(&key)
            .await
            .map_err(repository_failure)
    }

    async fn save(&self, record: &FlowNodeInstance) -> EngineResult<()> {
        self.services
            .repository
            .save_node_instance(record)
            .await
            .map_err(repository_failure)
    }

    async fn running_process(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        let process = self
            .services
            .repository
            .load_process_instance(instance_id)
            .await
            .map_err(repository_failure)?
            .ok_or_else(|| self.violation(instance_id, "no such process instance"))?;
        if process.state.is_terminal() {
            return Err(self.violation(instance_id, "process instance is finished"));
        }
        Ok(process)
    }

    /// Running, or cancelled while its deactivations fan out.
    async fn unfinished_process(&self, instance_id: Uuid) -> EngineResult<()> {
        let process = self
            .services
            .repository
            .load_process_instance(instance_id)
            .await
            .map_err(repository_failure)?
            .ok_or_else(|| self.violation(instance_id, "no such process instance"))?;
        if matches!(process.state, ProcessState::Completed { .. }) {
            return Err(self.violation(instance_id, "process instance is completed"));
        }
        Ok(())
    }

    /// Drop a token that reached a deactivated record. It may have been the
    /// last one in flight.
    async fn swallowed(&self, instance_id: Uuid) -> EngineError {
        if let Err(e) = self.maybe_complete(instance_id).await {
            self.report(Some(instance_id), "activation", &e).await;
        }
        self.violation(instance_id, "token at a deactivated node instance")
    }

    fn violation(&self, instance_id: Uuid, reason: impl Into<String>) -> EngineError {
        EngineError::protocol(&self.node.id, instance_id, reason)
    }

    fn duplicate(&self, instance_id: Uuid) -> EngineError {
        EngineError::DuplicateTrigger {
            node: self.node.id.clone(),
            instance_id,
        }
    }

    async fn record_event(&self, instance_id: Uuid, event: RuntimeEvent) {
        if let Err(e) = self
            .services
            .repository
            .append_event(instance_id, &event)
            .await
        {
            tracing::warn!(node = %self.node.id, %instance_id, error = %e, "runtime event not recorded");
        }
    }

    async fn record_activated(&self, record: &FlowNodeInstance) {
        self.record_event(
            record.instance_id,
            RuntimeEvent::NodeActivated {
                node_id: self.node.id.clone(),
                element_id: self.node.element_id.clone(),
                pass_count: record.pass_count,
            },
        )
        .await;
    }

    async fn record_deactivated(&self, instance_id: Uuid) {
        self.record_event(
            instance_id,
            RuntimeEvent::NodeDeactivated {
                node_id: self.node.id.clone(),
                element_id: self.node.element_id.clone(),
            },
        )
        .await;
    }

    async fn record_received(&self, instance_id: Uuid) {
        self.record_event(
            instance_id,
            RuntimeEvent::MessageReceived {
                node_id: self.node.id.clone(),
            },
        )
        .await;
    }

    /// Log a fault and, when it belongs to an instance, append it to the
    /// instance's event log.
    async fn report(&self, instance_id: Option<Uuid>, handling: &'static str, err: &EngineError) {
        let kind = err.kind();
        let node = &self.node.id;
        let element_id = &self.node.element_id;
        match kind {
            FaultKind::ProtocolViolation => {
                tracing::debug!(%node, %element_id, ?instance_id, handling, error = %err, "message dropped");
            }
            FaultKind::DuplicateTrigger | FaultKind::ProviderFailure | FaultKind::Unroutable => {
                tracing::warn!(%node, %element_id, ?instance_id, handling, error = %err, "node fault");
            }
            kind if kind.leaves_instance_stuck() => {
                tracing::error!(%node, %element_id, ?instance_id, handling, error = %err, "node instance is stuck");
            }
            _ => {
                tracing::error!(%node, %element_id, ?instance_id, handling, error = %err, "node fault");
            }
        }
        if let Some(instance_id) = instance_id {
            self.record_event(
                instance_id,
                RuntimeEvent::FaultReported {
                    node_id: Some(node.clone()),
                    element_id: Some(element_id.clone()),
                    kind,
                    message: err.to_string(),
                },
            )
            .await;
        }
    }
}

/// Start a new loop pass of a PASSED record.
fn reenter(record: &mut FlowNodeInstance, state: NodeState) {
    record.state = state;
    record.pass_count += 1;
    record.passed_at = None;
    record.waiting_for = None;
    record.routed_to.clear();
    record.propagated = false;
}

fn first_fire(timer: &TimerDefinition, now: Timestamp) -> EngineResult<Timestamp> {
    let schedule = timer.schedule(now)?;
    schedule
        .fire_at
        .first()
        .copied()
        .ok_or_else(|| TimerSpecError::new(timer.spec(), "no fire time after now").into())
}

/// Value of an event output: the metadata field of the same name, then the
/// payload field, then the whole payload for a single binding.
fn copied_value(
    output: &DataOutput,
    single: bool,
    payload: &Value,
    metadata: &Metadata,
) -> Option<Value> {
    if let Some(value) = metadata.get(&output.object_id) {
        return Some(value.clone());
    }
    if let Some(value) = payload.get(&output.object_id) {
        return Some(value.clone());
    }
    (single && !payload.is_null()).then(|| payload.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleansing::completion_channel;
    use crate::definition::ProcessDefinition;
    use crate::providers::{inbound_channel, MessageIntegrationProvider};
    use crate::router::InFlight;
    use crate::store_memory::{MemoryDataObjects, MemoryIntegration, MemoryRepository, MemoryTimerStore};
    use serde_json::json;

    const CHAIN: &str = r#"
process_id: chain
nodes:
  - { id: start, type: start_event }
  - { id: work, type: task }
  - { id: end, type: end_event }
flows:
  - { id: f1, source: start, target: work }
  - { id: f2, source: work, target: end }
"#;

    struct Fixture {
        repo: Arc<MemoryRepository>,
        process: Arc<DeployedProcess>,
        services: Arc<ActorServices>,
        instance_id: Uuid,
    }

    impl Fixture {
        fn node(&self, element_id: &str) -> FlowNode {
            self.process.node_by_element(element_id).unwrap().clone()
        }

        fn actor(&self, element_id: &str) -> NodeActor {
            NodeActor::new(self.process.clone(), self.node(element_id), self.services.clone())
        }

        async fn seed(&self, element_id: &str, state: NodeState) -> FlowNodeInstance {
            let record = FlowNodeInstance::new(&self.node(element_id), "chain", self.instance_id, state);
            self.repo.save_node_instance(&record).await.unwrap();
            record
        }

        async fn faults(&self, kind: FaultKind) -> usize {
            self.repo
                .read_events(self.instance_id, 0)
                .await
                .unwrap()
                .iter()
                .filter(|(_, e)| e.fault_kind() == Some(kind))
                .count()
        }
    }

    async fn fixture() -> Fixture {
        let (inbound, _inbound_rx) = inbound_channel();
        let repo = Arc::new(MemoryRepository::new());
        let objects = Arc::new(MemoryDataObjects::new());
        let router = Router::new(InFlight::default());
        let (completions, _completion_rx) = completion_channel(router.in_flight().clone());
        let integration: Arc<dyn MessageIntegrationProvider> = Arc::new(MemoryIntegration::new(inbound));
        let services = Arc::new(ActorServices {
            repository: repo.clone(),
            timer_store: Arc::new(MemoryTimerStore::new()),
            data_objects: objects.clone(),
            evaluator: ExpressionEvaluator::new(objects.clone()),
            dispatcher: Arc::new(MessageDispatcher::new(integration, repo.clone(), router.clone())),
            router,
            completions,
        });
        let def = ProcessDefinition::from_yaml(CHAIN).unwrap();
        let process = Arc::new(DeployedProcess::build("test", &def, CompletionPolicy::Archive).unwrap());
        let instance_id = Uuid::now_v7();
        repo.create_process_instance(&ProcessInstance {
            process_id: "chain".into(),
            version: 1,
            instance_id,
            state: ProcessState::Running,
            created_at: 0,
        })
        .await
        .unwrap();
        Fixture {
            repo,
            process,
            services,
            instance_id,
        }
    }

    fn deactivation(instance_id: Uuid, trail: Vec<FlowNodeId>) -> NodeMessage {
        NodeMessage::Deactivation(DeactivationMessage { instance_id, trail })
    }

    #[tokio::test]
    async fn deactivation_revisiting_its_node_is_corrupt() {
        let fx = fixture().await;
        let work = fx.seed("work", NodeState::Active).await;

        let err = fx
            .actor("work")
            .handle(deactivation(fx.instance_id, vec![work.node_id.clone()]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::CorruptAuditChain);
        let stored = fx.repo.find_node_instance(&work.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Active);
    }

    #[tokio::test]
    async fn forwarding_into_the_trail_is_flagged_and_not_sent() {
        let fx = fixture().await;
        let work = fx.seed("work", NodeState::Passed).await;
        let end = fx.seed("end", NodeState::Active).await;
        fx.repo.link_following(&work.key(), &end.key()).await.unwrap();

        fx.actor("work")
            .handle(deactivation(fx.instance_id, vec![end.node_id.clone()]))
            .await
            .unwrap();

        assert_eq!(fx.faults(FaultKind::CorruptAuditChain).await, 1);
        assert_eq!(fx.services.router.in_flight().count(), 0);
        let stored = fx.repo.find_node_instance(&work.key()).await.unwrap().unwrap();
        assert!(stored.propagated);
        let end_now = fx.repo.find_node_instance(&end.key()).await.unwrap().unwrap();
        assert_eq!(end_now.state, NodeState::Active);
    }

    #[tokio::test]
    async fn passed_node_forwards_a_deactivation_once() {
        let fx = fixture().await;
        fx.seed("work", NodeState::Passed).await;
        let actor = fx.actor("work");

        actor.handle(deactivation(fx.instance_id, vec![])).await.unwrap();
        let again = actor.handle(deactivation(fx.instance_id, vec![])).await.unwrap_err();
        assert_eq!(again.kind(), FaultKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn deactivation_for_unknown_instance_leaves_no_record() {
        let fx = fixture().await;
        let ghost = Uuid::now_v7();
        let err = fx.actor("work").handle(deactivation(ghost, vec![])).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::ProtocolViolation);
        assert!(fx.repo.node_instances(ghost).await.unwrap().is_empty());
    }

    fn output(id: &str) -> DataOutput {
        DataOutput {
            object_id: id.into(),
            expression: None,
        }
    }

    #[test]
    fn copied_value_prefers_metadata_then_payload_field() {
        let mut metadata = Metadata::new();
        metadata.insert("customer".into(), json!("c-1"));
        let payload = json!({"customer": "ignored", "order": {"qty": 2}});

        assert_eq!(
            copied_value(&output("customer"), false, &payload, &metadata),
            Some(json!("c-1"))
        );
        assert_eq!(
            copied_value(&output("order"), false, &payload, &metadata),
            Some(json!({"qty": 2}))
        );
        assert_eq!(copied_value(&output("other"), false, &payload, &metadata), None);
    }

    #[test]
    fn single_binding_takes_whole_payload() {
        let payload = json!({"qty": 2});
        assert_eq!(
            copied_value(&output("order"), true, &payload, &Metadata::new()),
            Some(payload.clone())
        );
        assert_eq!(
            copied_value(&output("order"), true, &Value::Null, &Metadata::new()),
            None
        );
    }

    #[test]
    fn reenter_starts_a_new_pass() {
        let node = FlowNode {
            id: FlowNodeId::from("task"),
            element_id: "task".into(),
            name: "task".into(),
            kind: NodeKind::Task,
            incoming: vec![],
            outgoing: vec![],
            default_flow: None,
            inputs: vec![],
            outputs: vec![],
            integration: None,
        };
        let mut record = FlowNodeInstance::new(&node, "p", Uuid::nil(), NodeState::Passed);
        record.passed_at = Some(5);
        record.routed_to = vec![FlowNodeId::from("next")];
        reenter(&mut record, NodeState::Active);
        assert_eq!(record.state, NodeState::Active);
        assert_eq!(record.pass_count, 1);
        assert!(record.passed_at.is_none());
        assert!(record.routed_to.is_empty());
    }

    #[test]
    fn first_fire_of_a_duration() {
        let timer = TimerDefinition::Duration("PT10S".into());
        assert_eq!(first_fire(&timer, 1_000).unwrap(), 11_000);
        let exhausted = TimerDefinition::Cycle("R0/PT1S".into());
        assert!(matches!(
            first_fire(&exhausted, 0),
            Err(EngineError::MalformedTimerSpec(_))
        ));
    }
}
