//! Actor directory: FlowNodeId → mailbox.
//!
//! Every message that passes through the router is counted in [`InFlight`]
//! until its receiver has finished handling it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::messages::NodeMessage;
use crate::types::FlowNodeId;

pub type Mailbox = mpsc::UnboundedSender<NodeMessage>;
pub type MailboxReceiver = mpsc::UnboundedReceiver<NodeMessage>;

#[derive(Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

/// Count of messages sent but not yet handled, engine-wide.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

impl InFlight {
    pub fn enter(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is in flight.
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
pub struct Router {
    directory: Arc<RwLock<HashMap<FlowNodeId, Mailbox>>>,
    in_flight: InFlight,
}

impl Router {
    pub fn new(in_flight: InFlight) -> Self {
        Self {
            directory: Arc::new(RwLock::new(HashMap::new())),
            in_flight,
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Create a mailbox for `node_id`. Replaces any previous registration.
    pub async fn register(&self, node_id: FlowNodeId) -> MailboxReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.directory.write().await.insert(node_id, tx);
        rx
    }

    /// Drop the mailbox sender; the actor drains what is queued and stops.
    pub async fn unregister(&self, node_id: &FlowNodeId) -> bool {
        self.directory.write().await.remove(node_id).is_some()
    }

    pub async fn unregister_all(&self) {
        self.directory.write().await.clear();
    }

    pub async fn send(&self, node_id: &FlowNodeId, message: NodeMessage) -> EngineResult<()> {
        let directory = self.directory.read().await;
        let mailbox = directory
            .get(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.clone()))?;
        self.in_flight.enter();
        if mailbox.send(message).is_err() {
            self.in_flight.exit();
            return Err(EngineError::UnknownNode(node_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeactivationMessage;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn send_counts_until_exit() {
        let router = Router::new(InFlight::default());
        let node = FlowNodeId::from("n1");
        let mut rx = router.register(node.clone()).await;

        router
            .send(
                &node,
                NodeMessage::Deactivation(DeactivationMessage {
                    instance_id: Uuid::nil(),
                    trail: vec![],
                }),
            )
            .await
            .unwrap();
        assert_eq!(router.in_flight().count(), 1);

        let in_flight = router.in_flight().clone();
        let worker = tokio::spawn(async move {
            let _ = rx.recv().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.exit();
        });
        router.in_flight().settled().await;
        assert_eq!(router.in_flight().count(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_node_is_not_counted() {
        let router = Router::new(InFlight::default());
        let err = router
            .send(&FlowNodeId::from("nope"), NodeMessage::Arm)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode(_)));
        assert_eq!(router.in_flight().count(), 0);
    }
}
