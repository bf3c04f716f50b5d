use crate::events::RuntimeEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Query surface of the instance graph store.
///
/// Node actors only write records rooted at their own FlowNode; the trait
/// itself does no locking beyond what each backend needs for single calls.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    // ── Process instances ──

    /// Insert unless present. Returns false when the instance already existed.
    async fn create_process_instance(&self, instance: &ProcessInstance) -> Result<bool>;
    async fn load_process_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>>;
    /// Move a running instance to `state`. Returns true only for the call that
    /// made the transition.
    async fn finish_process_instance(&self, instance_id: Uuid, state: ProcessState)
        -> Result<bool>;
    async fn delete_process_instance(&self, instance_id: Uuid) -> Result<()>;

    // ── Flow node instances (HAS_INSTANCE) ──

    async fn find_node_instance(&self, key: &NodeInstanceKey) -> Result<Option<FlowNodeInstance>>;
    /// Insert or replace the record for `record.key()`.
    async fn save_node_instance(&self, record: &FlowNodeInstance) -> Result<()>;
    async fn node_instances(&self, instance_id: Uuid) -> Result<Vec<FlowNodeInstance>>;
    async fn node_instances_by_state(
        &self,
        instance_id: Uuid,
        states: &[NodeState],
    ) -> Result<Vec<FlowNodeInstance>>;
    /// Delete every node record and following link of the instance. Returns
    /// the number of node records removed.
    async fn delete_node_subtree(&self, instance_id: Uuid) -> Result<usize>;

    // ── Following links (HAS_FOLLOWING_INSTANCE) ──

    /// Idempotent.
    async fn link_following(&self, from: &NodeInstanceKey, to: &NodeInstanceKey) -> Result<()>;
    async fn following(&self, from: &NodeInstanceKey) -> Result<Vec<NodeInstanceKey>>;
    async fn links(&self, instance_id: Uuid) -> Result<Vec<(NodeInstanceKey, NodeInstanceKey)>>;

    // ── Archive ──

    /// Store unless an archive exists. Returns false when one already did.
    async fn save_archive(&self, archive: &ArchivedInstance) -> Result<bool>;
    async fn load_archive(&self, instance_id: Uuid) -> Result<Option<ArchivedInstance>>;

    // ── Event log (append-only until the instance is cleansed) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(&self, instance_id: Uuid, from_seq: u64)
        -> Result<Vec<(u64, RuntimeEvent)>>;
    /// Drop the whole log of an instance. Returns the number of events removed.
    async fn delete_events(&self, instance_id: Uuid) -> Result<usize>;
}
