//! Engine: deployment, external triggers, cancellation and the due-timer
//! poller. Owns the router, the dispatcher loop and the cleansing loop.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::actor::{ActorServices, NodeActor};
use crate::cleansing::{completion_channel, CleansingService};
use crate::config::EngineConfig;
use crate::definition::{DeployedProcess, ProcessDefinition};
use crate::dispatcher::MessageDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::events::RuntimeEvent;
use crate::expression::ExpressionEvaluator;
use crate::messages::{
    DeactivationMessage, Metadata, NodeMessage, TimerDueMessage, TriggerMessage,
};
use crate::providers::{InboundMessage, InboundReceiver, Providers};
use crate::repository::InstanceRepository;
use crate::router::Router;
use crate::types::{now_ms, FlowNodeId, NodeKind, NodeState, ProcessState, Timestamp};

type DeploymentKey = (String, u32);

pub struct Engine {
    config: EngineConfig,
    repository: Arc<dyn InstanceRepository>,
    providers: Providers,
    router: Router,
    dispatcher: Arc<MessageDispatcher>,
    services: Arc<ActorServices>,
    deployments: RwLock<BTreeMap<DeploymentKey, Arc<DeployedProcess>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine and spawn its dispatcher and cleansing loops. Must be
    /// called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        repository: Arc<dyn InstanceRepository>,
        providers: Providers,
        inbound: InboundReceiver,
    ) -> EngineResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| EngineError::Config(format!("{e:#}")))?;

        let in_flight = inbound.in_flight().clone();
        let router = Router::new(in_flight.clone());
        let (completions, completion_rx) = completion_channel(in_flight);
        let dispatcher = Arc::new(MessageDispatcher::new(
            providers.integration.clone(),
            repository.clone(),
            router.clone(),
        ));
        let services = Arc::new(ActorServices {
            repository: repository.clone(),
            timer_store: providers.timer_store.clone(),
            data_objects: providers.data_objects.clone(),
            evaluator: ExpressionEvaluator::new(providers.data_objects.clone()),
            dispatcher: dispatcher.clone(),
            router: router.clone(),
            completions,
        });

        let cleansing = CleansingService::new(repository.clone(), providers.data_objects.clone());
        let inbound_dispatcher = dispatcher.clone();
        let background = vec![
            tokio::spawn(async move { cleansing.run(completion_rx).await }),
            tokio::spawn(async move { inbound_dispatcher.run(inbound).await }),
        ];

        tracing::info!(
            client_id = %config.client_id,
            completion = ?config.completion,
            "engine started"
        );
        Ok(Arc::new(Self {
            config,
            repository,
            providers,
            router,
            dispatcher,
            services,
            deployments: RwLock::new(BTreeMap::new()),
            background: Mutex::new(background),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn InstanceRepository> {
        &self.repository
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    // ── Deployment ──

    /// Validate a definition, spawn one actor per node, open the catching
    /// routes and arm timer start events.
    pub async fn deploy(&self, definition: &ProcessDefinition) -> EngineResult<Arc<DeployedProcess>> {
        let process = Arc::new(DeployedProcess::build(
            &self.config.client_id,
            definition,
            self.config.completion,
        )?);
        let key = (process.process_id.clone(), process.version);
        {
            let mut deployments = self.deployments.write().await;
            if deployments.contains_key(&key) {
                return Err(EngineError::InvalidDefinition(format!(
                    "{} version {} is already deployed",
                    key.0, key.1
                )));
            }
            for node in process.nodes() {
                let mailbox = self.router.register(node.id.clone()).await;
                NodeActor::new(process.clone(), node.clone(), self.services.clone()).spawn(mailbox);
            }
            deployments.insert(key.clone(), process.clone());
        }

        for node in process.nodes() {
            if let Err(e) = self.dispatcher.open_catching(node).await {
                self.undeploy(&key.0, key.1).await;
                return Err(e);
            }
        }
        for node in process.nodes() {
            if matches!(node.kind, NodeKind::TimerStartEvent { .. }) {
                self.router.send(&node.id, NodeMessage::Arm).await?;
            }
        }

        tracing::info!(
            process_id = %process.process_id,
            version = process.version,
            nodes = process.nodes().count(),
            "process deployed"
        );
        Ok(process)
    }

    /// Release the routes and stop the actors of one deployed version.
    /// Messages already queued are still handled.
    pub async fn undeploy(&self, process_id: &str, version: u32) -> bool {
        let removed = self
            .deployments
            .write()
            .await
            .remove(&(process_id.to_string(), version));
        let Some(process) = removed else {
            return false;
        };
        for node in process.nodes() {
            if let Err(e) = self.dispatcher.shutdown(&node.id).await {
                tracing::warn!(node = %node.id, error = %e, "route not released");
            }
            self.router.unregister(&node.id).await;
        }
        tracing::info!(process_id, version, "process undeployed");
        true
    }

    /// Latest deployed version of `process_id`.
    pub async fn deployment(&self, process_id: &str) -> Option<Arc<DeployedProcess>> {
        self.deployments
            .read()
            .await
            .iter()
            .filter(|((id, _), _)| id == process_id)
            .map(|(_, process)| process.clone())
            .last()
    }

    // ── Triggers ──

    /// Start an instance of the latest version through its plain start event.
    pub async fn start_instance(&self, process_id: &str, payload: Value) -> EngineResult<Uuid> {
        let process = self
            .deployment(process_id)
            .await
            .ok_or_else(|| EngineError::UnknownProcess(process_id.to_string()))?;
        let start = process.default_start()?;
        let instance_id = Uuid::now_v7();
        self.trigger(
            &start.id,
            TriggerMessage {
                instance_id,
                payload,
                metadata: Metadata::new(),
            },
        )
        .await?;
        Ok(instance_id)
    }

    pub async fn trigger(&self, node_id: &FlowNodeId, message: TriggerMessage) -> EngineResult<()> {
        self.router.send(node_id, NodeMessage::Trigger(message)).await
    }

    /// Route an inbound message as if the integration provider had pushed it.
    pub async fn deliver(&self, message: InboundMessage) -> EngineResult<Uuid> {
        self.dispatcher.deliver(message).await
    }

    /// Deactivate one node instance and everything it activated.
    pub async fn deactivate(&self, node_id: &FlowNodeId, instance_id: Uuid) -> EngineResult<()> {
        self.router
            .send(
                node_id,
                NodeMessage::Deactivation(DeactivationMessage {
                    instance_id,
                    trail: Vec::new(),
                }),
            )
            .await
    }

    /// Mark a running instance cancelled and deactivate every open node
    /// instance. Returns false when the instance was not running.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> EngineResult<bool> {
        let at = now_ms();
        let cancelled = self
            .repository
            .finish_process_instance(instance_id, ProcessState::Cancelled { at })
            .await
            .map_err(EngineError::provider("repository"))?;
        if !cancelled {
            return Ok(false);
        }
        if let Err(e) = self
            .repository
            .append_event(instance_id, &RuntimeEvent::InstanceCancelled { at })
            .await
        {
            tracing::warn!(%instance_id, error = %e, "runtime event not recorded");
        }

        let open = self
            .repository
            .node_instances_by_state(instance_id, &NodeState::NON_TERMINAL)
            .await
            .map_err(EngineError::provider("repository"))?;
        for record in &open {
            if let Err(e) = self.deactivate(&record.node_id, instance_id).await {
                tracing::warn!(node = %record.node_id, %instance_id, error = %e, "deactivation not sent");
            }
        }
        tracing::info!(%instance_id, open = open.len(), "process instance cancelled");
        Ok(true)
    }

    // ── Timers ──

    /// Send a TimerDue for every stored timer of a deployed node that is due
    /// at `now`. Returns the number of messages sent.
    pub async fn poll_due_timers(&self, now: Timestamp) -> usize {
        let processes: Vec<Arc<DeployedProcess>> =
            self.deployments.read().await.values().cloned().collect();
        let mut sent = 0;
        for process in &processes {
            for node in process.timer_nodes() {
                let due = match self
                    .providers
                    .timer_store
                    .load_due(node.id.as_str(), now)
                    .await
                {
                    Ok(due) => due,
                    Err(e) => {
                        tracing::warn!(node = %node.id, error = %e, "due timers not loaded");
                        continue;
                    }
                };
                for record in due {
                    let message = NodeMessage::TimerDue(TimerDueMessage {
                        instance_id: record.instance_id,
                        fire_at: record.fire_at,
                    });
                    match self.router.send(&node.id, message).await {
                        Ok(()) => sent += 1,
                        Err(e) => {
                            tracing::warn!(node = %node.id, error = %e, "due timer not delivered")
                        }
                    }
                }
            }
        }
        if sent > 0 {
            tracing::debug!(count = sent, "due timers delivered");
        }
        sent
    }

    /// Run the due-timer poller until the shutdown signal is received.
    pub async fn run_timer_poller(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.poll_interval();
        tracing::info!(interval_ms = interval.as_millis() as u64, "timer poller started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.poll_due_timers(now_ms()).await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("timer poller stopped");
    }

    // ── Lifecycle ──

    /// Resolve once no message is queued or being handled anywhere.
    pub async fn settled(&self) {
        self.router.in_flight().settled().await;
    }

    /// Undeploy everything and stop the background loops.
    pub async fn shutdown(&self) {
        let keys: Vec<DeploymentKey> = self.deployments.read().await.keys().cloned().collect();
        for (process_id, version) in keys {
            self.undeploy(&process_id, version).await;
        }
        self.router.unregister_all().await;
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        tracing::info!("engine stopped");
    }
}
