//! In-memory backends for every SPI. Used by tests and the default host
//! configuration; nothing survives a restart.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::RuntimeEvent;
use crate::providers::{
    DataObjectProvider, InboundMessage, InboundSender, MessageIntegrationProvider,
    ProviderRegistry, TimerStoreProvider,
};
use crate::repository::InstanceRepository;
use crate::types::*;

// ─── Instance repository ──────────────────────────────────────

#[derive(Default)]
struct RepositoryState {
    processes: HashMap<Uuid, ProcessInstance>,
    nodes: BTreeMap<NodeInstanceKey, FlowNodeInstance>,
    links: BTreeMap<NodeInstanceKey, Vec<NodeInstanceKey>>,
    archives: HashMap<Uuid, ArchivedInstance>,
    events: HashMap<Uuid, Vec<RuntimeEvent>>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepositoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for MemoryRepository {
    async fn create_process_instance(&self, instance: &ProcessInstance) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.processes.contains_key(&instance.instance_id) {
            return Ok(false);
        }
        state
            .processes
            .insert(instance.instance_id, instance.clone());
        Ok(true)
    }

    async fn load_process_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.state.lock().await.processes.get(&instance_id).cloned())
    }

    async fn finish_process_instance(
        &self,
        instance_id: Uuid,
        new_state: ProcessState,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.processes.get_mut(&instance_id) {
            Some(instance) if !instance.state.is_terminal() => {
                instance.state = new_state;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_process_instance(&self, instance_id: Uuid) -> Result<()> {
        self.state.lock().await.processes.remove(&instance_id);
        Ok(())
    }

    async fn find_node_instance(&self, key: &NodeInstanceKey) -> Result<Option<FlowNodeInstance>> {
        Ok(self.state.lock().await.nodes.get(key).cloned())
    }

    async fn save_node_instance(&self, record: &FlowNodeInstance) -> Result<()> {
        self.state
            .lock()
            .await
            .nodes
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn node_instances(&self, instance_id: Uuid) -> Result<Vec<FlowNodeInstance>> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn node_instances_by_state(
        &self,
        instance_id: Uuid,
        states: &[NodeState],
    ) -> Result<Vec<FlowNodeInstance>> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .values()
            .filter(|r| r.instance_id == instance_id && states.contains(&r.state))
            .cloned()
            .collect())
    }

    async fn delete_node_subtree(&self, instance_id: Uuid) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.nodes.len();
        state.nodes.retain(|key, _| key.instance_id != instance_id);
        let removed = before - state.nodes.len();
        state.links.retain(|from, _| from.instance_id != instance_id);
        Ok(removed)
    }

    async fn link_following(&self, from: &NodeInstanceKey, to: &NodeInstanceKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let targets = state.links.entry(from.clone()).or_default();
        if !targets.contains(to) {
            targets.push(to.clone());
        }
        Ok(())
    }

    async fn following(&self, from: &NodeInstanceKey) -> Result<Vec<NodeInstanceKey>> {
        Ok(self
            .state
            .lock()
            .await
            .links
            .get(from)
            .cloned()
            .unwrap_or_default())
    }

    async fn links(&self, instance_id: Uuid) -> Result<Vec<(NodeInstanceKey, NodeInstanceKey)>> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|(from, _)| from.instance_id == instance_id)
            .flat_map(|(from, targets)| targets.iter().map(|to| (from.clone(), to.clone())))
            .collect())
    }

    async fn save_archive(&self, archive: &ArchivedInstance) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.archives.contains_key(&archive.instance_id) {
            return Ok(false);
        }
        state.archives.insert(archive.instance_id, archive.clone());
        Ok(true)
    }

    async fn load_archive(&self, instance_id: Uuid) -> Result<Option<ArchivedInstance>> {
        Ok(self.state.lock().await.archives.get(&instance_id).cloned())
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut state = self.state.lock().await;
        let log = state.events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(&instance_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from_seq as usize)
                    .map(|(seq, event)| (seq as u64, event.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_events(&self, instance_id: Uuid) -> Result<usize> {
        let mut state = self.state.lock().await;
        Ok(state.events.remove(&instance_id).map_or(0, |log| log.len()))
    }
}

// ─── Data objects ─────────────────────────────────────────────

type ObjectKey = (String, String, Uuid);

#[derive(Default)]
pub struct MemoryDataObjects {
    objects: Mutex<HashMap<ObjectKey, Value>>,
    loads: Mutex<HashMap<String, usize>>,
}

impl MemoryDataObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often `object_id` was requested through `load`.
    pub async fn load_count(&self, object_id: &str) -> usize {
        self.loads.lock().await.get(object_id).copied().unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

fn object_key(process_id: &str, object_id: &str, instance_id: Uuid) -> ObjectKey {
    (process_id.to_string(), object_id.to_string(), instance_id)
}

#[async_trait]
impl DataObjectProvider for MemoryDataObjects {
    async fn save(
        &self,
        process_id: &str,
        object_id: &str,
        instance_id: Uuid,
        value: &Value,
    ) -> Result<()> {
        self.objects
            .lock()
            .await
            .insert(object_key(process_id, object_id, instance_id), value.clone());
        Ok(())
    }

    async fn load(
        &self,
        process_id: &str,
        object_id: &str,
        instance_id: Uuid,
    ) -> Result<Option<Value>> {
        *self
            .loads
            .lock()
            .await
            .entry(object_id.to_string())
            .or_default() += 1;
        Ok(self
            .objects
            .lock()
            .await
            .get(&object_key(process_id, object_id, instance_id))
            .cloned())
    }

    async fn delete(&self, process_id: &str, object_id: &str, instance_id: Uuid) -> Result<()> {
        self.objects
            .lock()
            .await
            .remove(&object_key(process_id, object_id, instance_id));
        Ok(())
    }
}

// ─── Timer store ──────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTimerStore {
    records: Mutex<Vec<TimerRecord>>,
}

impl MemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<TimerRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl TimerStoreProvider for MemoryTimerStore {
    async fn save(&self, record: &TimerRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if !records.contains(record) {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn load_due(&self, actor_address: &str, now: Timestamp) -> Result<Vec<TimerRecord>> {
        let records = self.records.lock().await;
        let mut due: Vec<TimerRecord> = records
            .iter()
            .filter(|r| r.actor_address == actor_address && r.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.fire_at);
        Ok(due)
    }

    async fn delete(&self, actor_address: &str, instance_id: Uuid) -> Result<()> {
        self.records
            .lock()
            .await
            .retain(|r| !(r.actor_address == actor_address && r.instance_id == instance_id));
        Ok(())
    }
}

// ─── Message integration ──────────────────────────────────────

/// Loopback integration: records outbound payloads per route and lets tests
/// inject inbound messages on catching routes.
pub struct MemoryIntegration {
    inbound: InboundSender,
    open: Mutex<HashMap<FlowNodeId, IntegrationHandle>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl MemoryIntegration {
    pub fn new(inbound: InboundSender) -> Self {
        Self {
            inbound,
            open: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Payloads dispatched so far, as `(route, payload)`.
    pub async fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().await.clone()
    }

    pub async fn is_open(&self, node_id: &FlowNodeId) -> bool {
        self.open.lock().await.contains_key(node_id)
    }

    /// Deliver a message on the catching route of `node_id`.
    pub async fn inject(
        &self,
        node_id: &FlowNodeId,
        instance_id: Option<Uuid>,
        payload: Value,
        headers: Value,
    ) -> Result<()> {
        let open = self.open.lock().await;
        match open.get(node_id) {
            Some(handle) if handle.direction == IntegrationDirection::Catch => {}
            _ => anyhow::bail!("no catching route open for node {node_id}"),
        }
        self.inbound.send(InboundMessage {
            node_id: node_id.clone(),
            instance_id,
            payload,
            headers,
        })
    }

    fn handle(node_id: &FlowNodeId, route: &str, direction: IntegrationDirection) -> IntegrationHandle {
        IntegrationHandle {
            node_id: node_id.clone(),
            route: route.to_string(),
            direction,
            channel: format!("memory://{route}/{node_id}"),
        }
    }
}

#[async_trait]
impl MessageIntegrationProvider for MemoryIntegration {
    async fn start_catching(
        &self,
        node_id: &FlowNodeId,
        route: &str,
        _metadata: &[MetadataField],
    ) -> Result<IntegrationHandle> {
        let handle = Self::handle(node_id, route, IntegrationDirection::Catch);
        self.open
            .lock()
            .await
            .insert(node_id.clone(), handle.clone());
        Ok(handle)
    }

    async fn start_throwing(&self, node_id: &FlowNodeId, route: &str) -> Result<IntegrationHandle> {
        let handle = Self::handle(node_id, route, IntegrationDirection::Throw);
        self.open
            .lock()
            .await
            .insert(node_id.clone(), handle.clone());
        Ok(handle)
    }

    async fn dispatch(&self, handle: &IntegrationHandle, payload: &Value) -> Result<()> {
        anyhow::ensure!(
            self.open.lock().await.contains_key(&handle.node_id),
            "route {} is closed",
            handle.channel
        );
        self.sent
            .lock()
            .await
            .push((handle.route.clone(), payload.clone()));
        Ok(())
    }

    async fn shutdown(&self, handle: &IntegrationHandle) -> Result<()> {
        self.open.lock().await.remove(&handle.node_id);
        Ok(())
    }
}

/// Registry with every in-memory provider registered as `memory`.
pub fn memory_registry(inbound: InboundSender) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry
        .register_data_objects("memory", Arc::new(MemoryDataObjects::new()))
        .register_timer_store("memory", Arc::new(MemoryTimerStore::new()))
        .register_integration("memory", Arc::new(MemoryIntegration::new(inbound)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node: &str, instance_id: Uuid) -> NodeInstanceKey {
        NodeInstanceKey::new(FlowNodeId::from(node), instance_id)
    }

    #[tokio::test]
    async fn finish_transitions_exactly_once() {
        let repo = MemoryRepository::new();
        let instance = ProcessInstance {
            process_id: "p".into(),
            version: 1,
            instance_id: Uuid::now_v7(),
            state: ProcessState::Running,
            created_at: 0,
        };
        assert!(repo.create_process_instance(&instance).await.unwrap());
        assert!(!repo.create_process_instance(&instance).await.unwrap());

        let done = ProcessState::Completed { at: 5 };
        assert!(repo
            .finish_process_instance(instance.instance_id, done.clone())
            .await
            .unwrap());
        assert!(!repo
            .finish_process_instance(instance.instance_id, done)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn subtree_deletion_scopes_to_instance() {
        let repo = MemoryRepository::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        repo.link_following(&key("n1", a), &key("n2", a)).await.unwrap();
        repo.link_following(&key("n1", a), &key("n2", a)).await.unwrap();
        repo.link_following(&key("n1", b), &key("n2", b)).await.unwrap();
        assert_eq!(repo.following(&key("n1", a)).await.unwrap().len(), 1);

        repo.delete_node_subtree(a).await.unwrap();
        assert!(repo.links(a).await.unwrap().is_empty());
        assert_eq!(repo.links(b).await.unwrap().len(), 1);
        // Idempotent.
        assert_eq!(repo.delete_node_subtree(a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_log_is_dropped_per_instance() {
        let repo = MemoryRepository::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let event = RuntimeEvent::InstanceCompleted { at: 1 };
        for id in [a, a, b] {
            repo.append_event(id, &event).await.unwrap();
        }
        assert_eq!(repo.delete_events(a).await.unwrap(), 2);
        assert_eq!(repo.delete_events(a).await.unwrap(), 0);
        assert!(repo.read_events(a, 0).await.unwrap().is_empty());
        assert_eq!(repo.read_events(b, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timer_store_filters_by_address_and_due_time() {
        let store = MemoryTimerStore::new();
        let instance = Uuid::now_v7();
        for (fire_at, address) in [(10, "a"), (20, "a"), (5, "b")] {
            store
                .save(&TimerRecord {
                    fire_at,
                    actor_address: address.into(),
                    instance_id: instance,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.load_due("a", 15).await.unwrap().len(), 1);
        assert_eq!(store.load_due("a", 20).await.unwrap().len(), 2);
        store.delete("a", instance).await.unwrap();
        assert!(store.load_due("a", i64::MAX).await.unwrap().is_empty());
        assert_eq!(store.load_due("b", i64::MAX).await.unwrap().len(), 1);
    }
}
