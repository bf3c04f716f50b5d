//! Message Dispatcher: the association between flow nodes and their external
//! integration routes.
//!
//! Catching routes are opened at deployment; throwing routes are opened by
//! the node actor on its first outbound dispatch. Inbound messages are turned
//! into a Trigger (no instance record yet) or an Activation (record exists)
//! with metadata already extracted from the provider headers.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::messages::{
    ActivationMessage, ActivationSource, Metadata, NodeMessage, TriggerMessage,
};
use crate::providers::{InboundMessage, InboundReceiver, MessageIntegrationProvider};
use crate::repository::InstanceRepository;
use crate::router::Router;
use crate::types::{
    FlowNode, FlowNodeId, IntegrationDirection, IntegrationHandle, MetadataField,
    NodeInstanceKey,
};

struct Route {
    handle: IntegrationHandle,
    metadata: Vec<MetadataField>,
}

pub struct MessageDispatcher {
    integration: Arc<dyn MessageIntegrationProvider>,
    repository: Arc<dyn InstanceRepository>,
    router: Router,
    routes: RwLock<HashMap<FlowNodeId, Route>>,
}

impl MessageDispatcher {
    pub fn new(
        integration: Arc<dyn MessageIntegrationProvider>,
        repository: Arc<dyn InstanceRepository>,
        router: Router,
    ) -> Self {
        Self {
            integration,
            repository,
            router,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Open the inbound route of a catching node. No-op for other nodes and
    /// for routes already open.
    pub async fn open_catching(&self, node: &FlowNode) -> EngineResult<()> {
        let Some(spec) = node.catches() else {
            return Ok(());
        };
        if self.routes.read().await.contains_key(&node.id) {
            return Ok(());
        }
        let handle = self
            .integration
            .start_catching(&node.id, &spec.route, &spec.metadata)
            .await
            .map_err(EngineError::provider("integration"))?;
        tracing::info!(
            node = %node.id,
            element_id = %node.element_id,
            route = %spec.route,
            channel = %handle.channel,
            "catching route opened"
        );
        self.routes.write().await.insert(
            node.id.clone(),
            Route {
                handle,
                metadata: spec.metadata.clone(),
            },
        );
        Ok(())
    }

    /// Open the outbound route of a throwing node unless already open.
    pub async fn ensure_throwing(&self, node: &FlowNode) -> EngineResult<()> {
        let Some(spec) = node.throws() else {
            return Ok(());
        };
        if self.routes.read().await.contains_key(&node.id) {
            return Ok(());
        }
        let handle = self
            .integration
            .start_throwing(&node.id, &spec.route)
            .await
            .map_err(EngineError::provider("integration"))?;
        tracing::debug!(
            node = %node.id,
            route = %spec.route,
            channel = %handle.channel,
            "throwing route opened"
        );
        self.routes.write().await.insert(
            node.id.clone(),
            Route {
                handle,
                metadata: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn is_routed(&self, node_id: &FlowNodeId) -> bool {
        self.routes.read().await.contains_key(node_id)
    }

    /// Forward an outbound payload on the node's throwing route.
    pub async fn dispatch(&self, node_id: &FlowNodeId, payload: &Value) -> EngineResult<String> {
        let handle = {
            let routes = self.routes.read().await;
            routes
                .get(node_id)
                .filter(|r| r.handle.direction == IntegrationDirection::Throw)
                .map(|r| r.handle.clone())
        }
        .ok_or_else(|| EngineError::Unroutable(node_id.clone()))?;

        self.integration
            .dispatch(&handle, payload)
            .await
            .map_err(EngineError::provider("integration"))?;
        Ok(handle.route)
    }

    /// Release the route of `node_id` at the provider. Returns false when no
    /// route was open.
    pub async fn shutdown(&self, node_id: &FlowNodeId) -> EngineResult<bool> {
        let removed = self.routes.write().await.remove(node_id);
        match removed {
            Some(route) => {
                self.integration
                    .shutdown(&route.handle)
                    .await
                    .map_err(EngineError::provider("integration"))?;
                tracing::debug!(node = %node_id, route = %route.handle.route, "route released");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Route one inbound message to its node actor. Returns the process
    /// instance id the message was delivered for.
    pub async fn deliver(&self, message: InboundMessage) -> EngineResult<Uuid> {
        let metadata = {
            let routes = self.routes.read().await;
            let route = routes
                .get(&message.node_id)
                .filter(|r| r.handle.direction == IntegrationDirection::Catch)
                .ok_or_else(|| EngineError::Unroutable(message.node_id.clone()))?;
            extract_metadata(&route.metadata, &message.headers)
        };

        let (instance_id, node_message) = match message.instance_id {
            None => {
                let instance_id = Uuid::now_v7();
                (
                    instance_id,
                    NodeMessage::Trigger(TriggerMessage {
                        instance_id,
                        payload: message.payload,
                        metadata,
                    }),
                )
            }
            Some(instance_id) => {
                let key = NodeInstanceKey::new(message.node_id.clone(), instance_id);
                let existing = self
                    .repository
                    .find_node_instance(&key)
                    .await
                    .map_err(EngineError::provider("repository"))?;
                let node_message = if existing.is_some() {
                    NodeMessage::Activation(ActivationMessage {
                        instance_id,
                        source: ActivationSource::Integration,
                        payload: message.payload,
                        metadata,
                    })
                } else {
                    NodeMessage::Trigger(TriggerMessage {
                        instance_id,
                        payload: message.payload,
                        metadata,
                    })
                };
                (instance_id, node_message)
            }
        };

        tracing::debug!(
            node = %message.node_id,
            %instance_id,
            kind = node_message.kind(),
            "inbound message routed"
        );
        self.router.send(&message.node_id, node_message).await?;
        Ok(instance_id)
    }

    /// Consume provider-pushed messages until the channel closes.
    pub async fn run(&self, mut inbound: InboundReceiver) {
        while let Some(message) = inbound.rx.recv().await {
            let node_id = message.node_id.clone();
            if let Err(e) = self.deliver(message).await {
                tracing::warn!(node = %node_id, error = %e, "inbound message not delivered");
            }
            inbound.in_flight.exit();
        }
        tracing::debug!("inbound channel closed, dispatcher loop exiting");
    }
}

/// Map provider header paths to named values. A path starting with `/` is a
/// JSON pointer; anything else names a top-level header. Missing paths are
/// skipped.
pub fn extract_metadata(fields: &[MetadataField], headers: &Value) -> Metadata {
    let mut metadata = Metadata::new();
    for field in fields {
        let found = if field.path.starts_with('/') {
            headers.pointer(&field.path)
        } else {
            headers.get(&field.path)
        };
        if let Some(value) = found {
            metadata.insert(field.name.clone(), value.clone());
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::inbound_channel;
    use crate::router::InFlight;
    use crate::store_memory::{MemoryIntegration, MemoryRepository};
    use crate::types::{IntegrationSpec, NodeKind};
    use serde_json::json;

    fn node(id: &str, kind: NodeKind, direction: IntegrationDirection) -> FlowNode {
        FlowNode {
            id: FlowNodeId::from(id),
            element_id: id.into(),
            name: id.into(),
            kind,
            incoming: vec![],
            outgoing: vec![],
            default_flow: None,
            inputs: vec![],
            outputs: vec![],
            integration: Some(IntegrationSpec {
                route: format!("route.{id}"),
                direction,
                metadata: vec![MetadataField {
                    name: "customer".into(),
                    path: "/customer/id".into(),
                }],
            }),
        }
    }

    fn dispatcher() -> (MessageDispatcher, Arc<MemoryIntegration>, Router) {
        let (inbound, _rx) = inbound_channel();
        let integration = Arc::new(MemoryIntegration::new(inbound));
        let router = Router::new(InFlight::default());
        let dispatcher = MessageDispatcher::new(
            integration.clone(),
            Arc::new(MemoryRepository::new()),
            router.clone(),
        );
        (dispatcher, integration, router)
    }

    #[test]
    fn metadata_uses_pointers_and_plain_keys() {
        let fields = vec![
            MetadataField {
                name: "customer".into(),
                path: "/customer/id".into(),
            },
            MetadataField {
                name: "trace".into(),
                path: "trace_id".into(),
            },
            MetadataField {
                name: "absent".into(),
                path: "/nope".into(),
            },
        ];
        let headers = json!({"customer": {"id": "c-9"}, "trace_id": "t1"});
        let metadata = extract_metadata(&fields, &headers);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["customer"], json!("c-9"));
        assert_eq!(metadata["trace"], json!("t1"));
    }

    #[tokio::test]
    async fn dispatch_without_route_is_unroutable() {
        let (dispatcher, _, _) = dispatcher();
        let err = dispatcher
            .dispatch(&FlowNodeId::from("ghost"), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unroutable(_)));
    }

    #[tokio::test]
    async fn throwing_route_opens_lazily_and_forwards() {
        let (dispatcher, integration, _) = dispatcher();
        let notify = node("notify", NodeKind::Task, IntegrationDirection::Throw);
        assert!(!dispatcher.is_routed(&notify.id).await);
        dispatcher.ensure_throwing(&notify).await.unwrap();
        let route = dispatcher.dispatch(&notify.id, &json!({"n": 1})).await.unwrap();
        assert_eq!(route, "route.notify");
        assert_eq!(integration.sent().await, vec![("route.notify".to_string(), json!({"n": 1}))]);

        assert!(dispatcher.shutdown(&notify.id).await.unwrap());
        assert!(!dispatcher.shutdown(&notify.id).await.unwrap());
        assert!(!integration.is_open(&notify.id).await);
    }

    #[tokio::test]
    async fn inbound_without_instance_becomes_trigger_with_metadata() {
        let (dispatcher, _, router) = dispatcher();
        let start = node("order_in", NodeKind::StartEvent, IntegrationDirection::Catch);
        dispatcher.open_catching(&start).await.unwrap();
        let mut mailbox = router.register(start.id.clone()).await;

        let instance_id = dispatcher
            .deliver(InboundMessage {
                node_id: start.id.clone(),
                instance_id: None,
                payload: json!({"qty": 3}),
                headers: json!({"customer": {"id": "c-1"}}),
            })
            .await
            .unwrap();

        match mailbox.recv().await.unwrap() {
            NodeMessage::Trigger(trigger) => {
                assert_eq!(trigger.instance_id, instance_id);
                assert_eq!(trigger.payload, json!({"qty": 3}));
                assert_eq!(trigger.metadata["customer"], json!("c-1"));
            }
            other => panic!("expected trigger, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_on_throwing_route_is_unroutable() {
        let (dispatcher, _, _) = dispatcher();
        let notify = node("notify", NodeKind::Task, IntegrationDirection::Throw);
        dispatcher.ensure_throwing(&notify).await.unwrap();
        let err = dispatcher
            .deliver(InboundMessage {
                node_id: notify.id.clone(),
                instance_id: None,
                payload: Value::Null,
                headers: Value::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unroutable(_)));
    }
}
