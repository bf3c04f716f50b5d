//! Provider SPIs and the named registry they are resolved from.
//!
//! Each capability is an async trait returning `anyhow::Result`. Hosts
//! register implementations under an id and the configuration picks one per
//! capability at startup.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ProviderSelection;
use crate::error::{EngineError, EngineResult};
use crate::router::InFlight;
use crate::types::{FlowNodeId, IntegrationHandle, MetadataField, Timestamp, TimerRecord};

#[async_trait]
pub trait DataObjectProvider: Send + Sync {
    async fn save(
        &self,
        process_id: &str,
        object_id: &str,
        instance_id: Uuid,
        value: &Value,
    ) -> Result<()>;
    async fn load(&self, process_id: &str, object_id: &str, instance_id: Uuid)
        -> Result<Option<Value>>;
    /// Deleting an absent object succeeds.
    async fn delete(&self, process_id: &str, object_id: &str, instance_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait TimerStoreProvider: Send + Sync {
    async fn save(&self, record: &TimerRecord) -> Result<()>;
    /// Records addressed to `actor_address` with `fire_at <= now`.
    async fn load_due(&self, actor_address: &str, now: Timestamp) -> Result<Vec<TimerRecord>>;
    /// Deletes every record of `instance_id` at `actor_address`. Idempotent.
    async fn delete(&self, actor_address: &str, instance_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait MessageIntegrationProvider: Send + Sync {
    /// Open an inbound route. Inbound messages go to the provider's
    /// [`InboundSender`].
    async fn start_catching(
        &self,
        node_id: &FlowNodeId,
        route: &str,
        metadata: &[MetadataField],
    ) -> Result<IntegrationHandle>;
    async fn start_throwing(&self, node_id: &FlowNodeId, route: &str) -> Result<IntegrationHandle>;
    async fn dispatch(&self, handle: &IntegrationHandle, payload: &Value) -> Result<()>;
    async fn shutdown(&self, handle: &IntegrationHandle) -> Result<()>;
}

// ── Inbound channel ──

/// A message received by an integration provider for a catching node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub node_id: FlowNodeId,
    /// `None` starts a new process instance.
    pub instance_id: Option<Uuid>,
    pub payload: Value,
    /// Provider headers; metadata fields are JSON pointers into this value.
    #[serde(default)]
    pub headers: Value,
}

/// Provider-side end of the inbound channel.
#[derive(Clone)]
pub struct InboundSender {
    tx: mpsc::UnboundedSender<InboundMessage>,
    in_flight: InFlight,
}

impl InboundSender {
    pub fn send(&self, message: InboundMessage) -> Result<()> {
        self.in_flight.enter();
        if self.tx.send(message).is_err() {
            self.in_flight.exit();
            anyhow::bail!("inbound channel closed");
        }
        Ok(())
    }
}

/// Engine-side end of the inbound channel.
pub struct InboundReceiver {
    pub(crate) rx: mpsc::UnboundedReceiver<InboundMessage>,
    pub(crate) in_flight: InFlight,
}

impl InboundReceiver {
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }
}

/// The channel shares its in-flight counter with the engine built from the
/// receiver, so provider-pushed messages count towards `Engine::settled`.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let in_flight = InFlight::default();
    (
        InboundSender {
            tx,
            in_flight: in_flight.clone(),
        },
        InboundReceiver { rx, in_flight },
    )
}

// ── Registry ──

/// The providers one engine runs with.
#[derive(Clone)]
pub struct Providers {
    pub data_objects: Arc<dyn DataObjectProvider>,
    pub timer_store: Arc<dyn TimerStoreProvider>,
    pub integration: Arc<dyn MessageIntegrationProvider>,
}

/// Implementation id → provider, per capability.
#[derive(Default)]
pub struct ProviderRegistry {
    data_objects: HashMap<String, Arc<dyn DataObjectProvider>>,
    timer_stores: HashMap<String, Arc<dyn TimerStoreProvider>>,
    integrations: HashMap<String, Arc<dyn MessageIntegrationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_data_objects(
        &mut self,
        id: impl Into<String>,
        provider: Arc<dyn DataObjectProvider>,
    ) -> &mut Self {
        self.data_objects.insert(id.into(), provider);
        self
    }

    pub fn register_timer_store(
        &mut self,
        id: impl Into<String>,
        provider: Arc<dyn TimerStoreProvider>,
    ) -> &mut Self {
        self.timer_stores.insert(id.into(), provider);
        self
    }

    pub fn register_integration(
        &mut self,
        id: impl Into<String>,
        provider: Arc<dyn MessageIntegrationProvider>,
    ) -> &mut Self {
        self.integrations.insert(id.into(), provider);
        self
    }

    pub fn resolve(&self, selection: &ProviderSelection) -> EngineResult<Providers> {
        fn pick<T: ?Sized>(
            map: &HashMap<String, Arc<T>>,
            capability: &str,
            id: &str,
        ) -> EngineResult<Arc<T>> {
            map.get(id).cloned().ok_or_else(|| {
                EngineError::Config(format!("no {capability} provider registered as '{id}'"))
            })
        }

        Ok(Providers {
            data_objects: pick(&self.data_objects, "data object", &selection.data_objects)?,
            timer_store: pick(&self.timer_stores, "timer store", &selection.timer_store)?,
            integration: pick(&self.integrations, "integration", &selection.integration)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::{MemoryDataObjects, MemoryIntegration, MemoryTimerStore};

    #[test]
    fn resolve_picks_registered_ids() {
        let (inbound, _rx) = inbound_channel();
        let mut registry = ProviderRegistry::new();
        registry
            .register_data_objects("memory", Arc::new(MemoryDataObjects::new()))
            .register_timer_store("memory", Arc::new(MemoryTimerStore::new()))
            .register_integration("memory", Arc::new(MemoryIntegration::new(inbound)));

        assert!(registry.resolve(&ProviderSelection::default()).is_ok());

        let selection = ProviderSelection {
            timer_store: "redis".to_string(),
            ..ProviderSelection::default()
        };
        let err = registry.resolve(&selection).err().unwrap();
        assert!(err.to_string().contains("redis"));
    }

    #[tokio::test]
    async fn inbound_sender_counts_in_flight() {
        let (inbound, mut rx) = inbound_channel();
        inbound
            .send(InboundMessage {
                node_id: FlowNodeId::from("n"),
                instance_id: None,
                payload: Value::Null,
                headers: Value::Null,
            })
            .unwrap();
        assert_eq!(rx.in_flight().count(), 1);
        assert!(rx.rx.recv().await.is_some());
    }
}
