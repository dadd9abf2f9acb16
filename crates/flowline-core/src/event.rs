use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::traits::TaskCompletionListener;
use crate::types::{
    NodeId, NodeInstanceId, TaskId, TaskType, WorkflowInstanceId, WorkflowStatus,
};

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Workflow instance created and its start nodes completed.
    WorkflowStarted { workflow_instance_id: WorkflowInstanceId },
    /// Workflow instance reached a terminal status.
    WorkflowFinished {
        workflow_instance_id: WorkflowInstanceId,
        status: WorkflowStatus,
    },
    /// Node instance became ready and is about to be dispatched.
    NodeReady {
        workflow_instance_id: WorkflowInstanceId,
        node_instance_id: NodeInstanceId,
        node_id: NodeId,
    },
    NodeCompleted {
        workflow_instance_id: WorkflowInstanceId,
        node_instance_id: NodeInstanceId,
    },
    NodeFailed {
        workflow_instance_id: WorkflowInstanceId,
        node_instance_id: NodeInstanceId,
        error: String,
    },
    /// Node finalized without running because no incoming edge activated.
    NodeSkipped {
        workflow_instance_id: WorkflowInstanceId,
        node_instance_id: NodeInstanceId,
    },
    /// Task created for a ready node and handed to a human or agent.
    TaskDispatched {
        workflow_instance_id: WorkflowInstanceId,
        task_id: TaskId,
        task_type: TaskType,
    },
    /// A loop-back was refused because the per-path cap was reached.
    LoopLimitReached {
        workflow_instance_id: WorkflowInstanceId,
        node_id: NodeId,
        limit: u32,
    },
    /// A context was rebuilt after a cache miss.
    ContextRecovered {
        workflow_instance_id: WorkflowInstanceId,
        from_snapshot: bool,
        ready_nodes: usize,
    },
    /// A context was persisted and dropped from the cache.
    ContextEvicted { workflow_instance_id: WorkflowInstanceId },
    /// The health check found drift and resynced a context.
    ContextRepaired {
        workflow_instance_id: WorkflowInstanceId,
        in_memory_completed: usize,
        persisted_completed: usize,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Handle returned by [`ListenerSet::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Task-completion listeners, notified one after another in subscription order.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TaskCompletionListener>)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn TaskCompletionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((id, listener));
        }
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Vec<Arc<dyn TaskCompletionListener>> {
        self.listeners
            .read()
            .map(|l| l.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn notify_completed(&self, task_id: &TaskId, result: &serde_json::Value) {
        for listener in self.current() {
            listener.on_task_completed(task_id, result).await;
        }
    }

    pub async fn notify_failed(&self, task_id: &TaskId, error: &str) {
        for listener in self.current() {
            listener.on_task_failed(task_id, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TaskCompletionListener for Recorder {
        fn on_task_completed<'a>(
            &'a self,
            task_id: &'a TaskId,
            _result: &'a serde_json::Value,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}:done:{}", self.name, task_id));
            })
        }

        fn on_task_failed<'a>(&'a self, task_id: &'a TaskId, error: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}:failed:{}:{}", self.name, task_id, error));
            })
        }
    }

    #[tokio::test]
    async fn test_listeners_notified_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        set.subscribe(Arc::new(Recorder { name: "first", log: log.clone() }));
        set.subscribe(Arc::new(Recorder { name: "second", log: log.clone() }));

        set.notify_completed(&TaskId::from("t1"), &serde_json::json!({}))
            .await;

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["first:done:t1", "second:done:t1"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        let id = set.subscribe(Arc::new(Recorder { name: "only", log: log.clone() }));
        assert_eq!(set.len(), 1);
        assert!(set.unsubscribe(id));
        assert!(!set.unsubscribe(id));
        assert!(set.is_empty());

        set.notify_failed(&TaskId::from("t2"), "boom").await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_bus_delivers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::ContextEvicted {
            workflow_instance_id: WorkflowInstanceId::from("wf-1"),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::ContextEvicted { workflow_instance_id } => {
                assert_eq!(workflow_instance_id.as_str(), "wf-1")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
