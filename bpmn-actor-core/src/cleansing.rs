//! Process Instance Cleansing Service.
//!
//! Consumes completion messages and snapshots or removes a finished
//! instance's subtree. Every step tolerates already-deleted state, so a
//! message can be redelivered after a partial failure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::messages::{ArchiveMessage, CompletionMessage, DeletionMessage};
use crate::providers::DataObjectProvider;
use crate::repository::InstanceRepository;
use crate::router::InFlight;
use crate::types::ArchivedInstance;

#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<CompletionMessage>,
    in_flight: InFlight,
}

impl CompletionSender {
    pub fn send(&self, message: CompletionMessage) -> EngineResult<()> {
        self.in_flight.enter();
        if self.tx.send(message).is_err() {
            self.in_flight.exit();
            return Err(EngineError::Config(
                "cleansing service is not running".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<CompletionMessage>,
    in_flight: InFlight,
}

pub fn completion_channel(in_flight: InFlight) -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CompletionSender {
            tx,
            in_flight: in_flight.clone(),
        },
        CompletionReceiver { rx, in_flight },
    )
}

pub struct CleansingService {
    repository: Arc<dyn InstanceRepository>,
    data_objects: Arc<dyn DataObjectProvider>,
}

impl CleansingService {
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        data_objects: Arc<dyn DataObjectProvider>,
    ) -> Self {
        Self {
            repository,
            data_objects,
        }
    }

    /// Consume completion messages until every sender is dropped.
    pub async fn run(&self, mut receiver: CompletionReceiver) {
        while let Some(message) = receiver.rx.recv().await {
            if let Err(e) = self.handle(&message).await {
                tracing::warn!(
                    instance_id = %message.instance_id(),
                    error = %e,
                    "cleansing failed; redeliver to retry"
                );
            }
            receiver.in_flight.exit();
        }
        tracing::debug!("completion channel closed, cleansing service exiting");
    }

    pub async fn handle(&self, message: &CompletionMessage) -> EngineResult<()> {
        match message {
            CompletionMessage::Archive(msg) => self.archive(msg).await,
            CompletionMessage::Deletion(msg) => self.delete(msg).await,
        }
    }

    async fn archive(&self, msg: &ArchiveMessage) -> EngineResult<()> {
        let repo = EngineError::provider("repository");
        let existing = self
            .repository
            .load_archive(msg.instance_id)
            .await
            .map_err(repo)?;
        if existing.is_none() {
            let archive = self.snapshot(msg).await?;
            let saved = self
                .repository
                .save_archive(&archive)
                .await
                .map_err(EngineError::provider("repository"))?;
            if saved {
                tracing::info!(
                    process_id = %msg.process_id,
                    instance_id = %msg.instance_id,
                    nodes = archive.nodes.len(),
                    "instance archived"
                );
            }
        }
        self.release(&msg.process_id, msg.instance_id, &msg.data_object_ids)
            .await
    }

    async fn snapshot(&self, msg: &ArchiveMessage) -> EngineResult<ArchivedInstance> {
        let repo = || EngineError::provider("repository");
        let process = self
            .repository
            .load_process_instance(msg.instance_id)
            .await
            .map_err(repo())?;
        let nodes = self
            .repository
            .node_instances(msg.instance_id)
            .await
            .map_err(repo())?;
        let links = self
            .repository
            .links(msg.instance_id)
            .await
            .map_err(repo())?;
        let events = self
            .repository
            .read_events(msg.instance_id, 0)
            .await
            .map_err(repo())?
            .into_iter()
            .map(|(_, event)| event)
            .collect();

        let mut data_objects = BTreeMap::new();
        for object_id in &msg.data_object_ids {
            let value = self
                .data_objects
                .load(&msg.process_id, object_id, msg.instance_id)
                .await
                .map_err(EngineError::provider("data_objects"))?;
            if let Some(value) = value {
                data_objects.insert(object_id.clone(), value);
            }
        }

        Ok(ArchivedInstance {
            process_id: msg.process_id.clone(),
            instance_id: msg.instance_id,
            completed_at: msg.completed_at,
            process,
            nodes,
            links,
            data_objects,
            events,
        })
    }

    async fn delete(&self, msg: &DeletionMessage) -> EngineResult<()> {
        self.release(&msg.process_id, msg.instance_id, &msg.data_object_ids)
            .await?;
        tracing::info!(
            process_id = %msg.process_id,
            instance_id = %msg.instance_id,
            "instance deleted"
        );
        Ok(())
    }

    /// Remove the live subtree, the process record, the data objects and the
    /// event log.
    async fn release(
        &self,
        process_id: &str,
        instance_id: Uuid,
        data_object_ids: &BTreeSet<String>,
    ) -> EngineResult<()> {
        let removed = self
            .repository
            .delete_node_subtree(instance_id)
            .await
            .map_err(EngineError::provider("repository"))?;
        self.repository
            .delete_process_instance(instance_id)
            .await
            .map_err(EngineError::provider("repository"))?;
        for object_id in data_object_ids {
            self.data_objects
                .delete(process_id, object_id, instance_id)
                .await
                .map_err(EngineError::provider("data_objects"))?;
        }
        let events = self
            .repository
            .delete_events(instance_id)
            .await
            .map_err(EngineError::provider("repository"))?;
        tracing::debug!(
            %instance_id,
            removed,
            objects = data_object_ids.len(),
            events,
            "live instance state released"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RuntimeEvent;
    use crate::store_memory::{MemoryDataObjects, MemoryRepository};
    use crate::types::*;
    use serde_json::json;

    async fn seeded() -> (Arc<MemoryRepository>, Arc<MemoryDataObjects>, Uuid) {
        let repo = Arc::new(MemoryRepository::new());
        let objects = Arc::new(MemoryDataObjects::new());
        let instance_id = Uuid::now_v7();
        repo.create_process_instance(&ProcessInstance {
            process_id: "order".into(),
            version: 1,
            instance_id,
            state: ProcessState::Completed { at: 7 },
            created_at: 1,
        })
        .await
        .unwrap();
        let node = FlowNode {
            id: FlowNodeId::from("end"),
            element_id: "end".into(),
            name: "end".into(),
            kind: NodeKind::EndEvent,
            incoming: vec![],
            outgoing: vec![],
            default_flow: None,
            inputs: vec![],
            outputs: vec![],
            integration: None,
        };
        repo.save_node_instance(&FlowNodeInstance::new(
            &node,
            "order",
            instance_id,
            NodeState::Passed,
        ))
        .await
        .unwrap();
        objects
            .save("order", "invoice", instance_id, &json!({"total": 12}))
            .await
            .unwrap();
        repo.append_event(instance_id, &RuntimeEvent::InstanceCompleted { at: 7 })
            .await
            .unwrap();
        (repo, objects, instance_id)
    }

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn archive_snapshots_once_and_is_idempotent() {
        let (repo, objects, instance_id) = seeded().await;
        let service = CleansingService::new(repo.clone(), objects.clone());
        let msg = CompletionMessage::Archive(ArchiveMessage {
            process_id: "order".into(),
            instance_id,
            completed_at: 7,
            data_object_ids: ids(&["invoice", "never_written"]),
        });

        service.handle(&msg).await.unwrap();
        let archive = repo.load_archive(instance_id).await.unwrap().unwrap();
        assert_eq!(archive.nodes.len(), 1);
        assert_eq!(archive.data_objects["invoice"], json!({"total": 12}));
        assert_eq!(archive.events, vec![RuntimeEvent::InstanceCompleted { at: 7 }]);
        assert!(repo.read_events(instance_id, 0).await.unwrap().is_empty());
        assert!(repo.node_instances(instance_id).await.unwrap().is_empty());
        assert!(repo.load_process_instance(instance_id).await.unwrap().is_none());
        assert!(objects.is_empty().await);

        // Redelivery keeps the first snapshot.
        service.handle(&msg).await.unwrap();
        let again = repo.load_archive(instance_id).await.unwrap().unwrap();
        assert_eq!(again, archive);
    }

    #[tokio::test]
    async fn deletion_is_idempotent() {
        let (repo, objects, instance_id) = seeded().await;
        let service = CleansingService::new(repo.clone(), objects.clone());
        let msg = CompletionMessage::Deletion(DeletionMessage {
            process_id: "order".into(),
            instance_id,
            data_object_ids: ids(&["invoice"]),
        });
        service.handle(&msg).await.unwrap();
        service.handle(&msg).await.unwrap();
        assert!(repo.node_instances(instance_id).await.unwrap().is_empty());
        assert!(repo.load_archive(instance_id).await.unwrap().is_none());
        assert!(repo.read_events(instance_id, 0).await.unwrap().is_empty());
        assert!(objects.is_empty().await);
    }
}
