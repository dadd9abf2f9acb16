use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowline_core::config::{EngineConfig, RegistryConfig};
use flowline_core::error::{FlowError, Result};
use flowline_core::event::{EngineEvent, EventBus};
use flowline_core::traits::Repositories;
use flowline_core::types::{
    NodeInstance, NodeInstanceId, NodeInstanceStatus, WorkflowInstance, WorkflowInstanceId,
};

use crate::condition::ConditionEngine;
use crate::graph::{ContextSnapshot, ExecutionContext, NodeStatus, Topology};

struct CachedContext {
    ctx: Arc<ExecutionContext>,
    last_access: Instant,
    recovered_at: Option<Instant>,
}

/// Owns the live [`ExecutionContext`]s, keyed by workflow instance.
///
/// Contexts are cached in memory with an LRU bound and an idle TTL. A miss
/// recovers the context from its latest snapshot, or from the persisted
/// node-instance rows when the snapshot is missing or stale.
pub struct ContextRegistry {
    repos: Repositories,
    conditions: Arc<ConditionEngine>,
    event_bus: Arc<EventBus>,
    engine: EngineConfig,
    config: RegistryConfig,
    contexts: Mutex<HashMap<WorkflowInstanceId, CachedContext>>,
    locks: Mutex<HashMap<WorkflowInstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContextRegistry {
    pub fn new(
        repos: Repositories,
        conditions: Arc<ConditionEngine>,
        event_bus: Arc<EventBus>,
        engine: EngineConfig,
        config: RegistryConfig,
    ) -> Self {
        Self {
            repos,
            conditions,
            event_bus,
            engine,
            config,
            contexts: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The per-instance mutex serializing graph progress of one workflow
    /// instance. Created on first use.
    pub fn lock_for(&self, id: &WorkflowInstanceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Cached context, without recovery.
    pub fn get(&self, id: &WorkflowInstanceId) -> Option<Arc<ExecutionContext>> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.get_mut(id).map(|cached| {
            cached.last_access = Instant::now();
            cached.ctx.clone()
        })
    }

    pub fn contains(&self, id: &WorkflowInstanceId) -> bool {
        self.contexts
            .lock()
            .map(|c| c.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached context, or one recovered from the repositories.
    pub async fn get_or_create(&self, id: &WorkflowInstanceId) -> Result<Arc<ExecutionContext>> {
        if let Some(ctx) = self.get(id) {
            return Ok(ctx);
        }
        let instance = self
            .repos
            .workflow_instances
            .get(id)
            .await?
            .ok_or_else(|| FlowError::not_found("workflow instance", id))?;
        let ctx = self.recover(&instance).await?;
        let ctx = self.insert(ctx, true);
        self.evict_over_capacity().await;
        Ok(ctx)
    }

    /// A fresh, empty context for a newly created instance. Replaces any
    /// cached context for the same id.
    pub async fn create(
        &self,
        instance: &WorkflowInstance,
        topology: Topology,
    ) -> Result<Arc<ExecutionContext>> {
        let ctx = Arc::new(self.build(instance, topology));
        {
            let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            contexts.insert(
                instance.id.clone(),
                CachedContext {
                    ctx: ctx.clone(),
                    last_access: Instant::now(),
                    recovered_at: None,
                },
            );
        }
        self.evict_over_capacity().await;
        Ok(ctx)
    }

    /// Persist and drop a context. Returns false if it was not cached.
    pub async fn remove(&self, id: &WorkflowInstanceId) -> Result<bool> {
        let Some(ctx) = self.get(id) else {
            return Ok(false);
        };
        self.persist(&ctx).await?;
        let removed = self
            .contexts
            .lock()
            .map(|mut c| c.remove(id).is_some())
            .unwrap_or(false);
        self.release_lock(id);
        Ok(removed)
    }

    /// Save the context's snapshot through the workflow-instance repository.
    pub async fn persist(&self, ctx: &ExecutionContext) -> Result<()> {
        let snapshot = ctx.snapshot().await.to_value()?;
        self.repos
            .workflow_instances
            .save_snapshot(ctx.workflow_instance_id(), &snapshot)
            .await
    }

    /// Snapshot every cached context. Returns how many were saved.
    pub async fn persist_all(&self) -> usize {
        let mut saved = 0;
        for ctx in self.cached() {
            match self.persist(&ctx).await {
                Ok(()) => saved += 1,
                Err(e) => error!(
                    workflow_instance_id = %ctx.workflow_instance_id(),
                    error = %e,
                    "Failed to persist context"
                ),
            }
        }
        debug!(saved, "Persisted contexts");
        saved
    }

    /// Persist and drop contexts idle for longer than the TTL.
    pub async fn expire_idle(&self) -> usize {
        let ttl = Duration::from_secs(self.config.context_ttl_secs);
        let idle: Vec<Arc<ExecutionContext>> = {
            let contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            contexts
                .values()
                .filter(|c| c.last_access.elapsed() >= ttl)
                .map(|c| c.ctx.clone())
                .collect()
        };
        let mut expired = 0;
        for ctx in idle {
            if self.evict(&ctx).await {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Expired idle contexts");
        }
        expired
    }

    /// Compare each cached context's completed count with the persisted
    /// rows and rebuild the ones that drifted. Contexts recovered within
    /// the grace period are skipped. Returns how many were repaired.
    pub async fn health_check(&self) -> usize {
        let grace = Duration::from_secs(self.config.recovery_grace_secs);
        let candidates: Vec<Arc<ExecutionContext>> = {
            let contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            contexts
                .values()
                .filter(|c| c.recovered_at.map_or(true, |at| at.elapsed() >= grace))
                .map(|c| c.ctx.clone())
                .collect()
        };

        let mut repaired = 0;
        for ctx in candidates {
            let id = ctx.workflow_instance_id().clone();
            let lock = self.lock_for(&id);
            let _guard = lock.lock().await;
            match self.repair_if_drifted(&ctx).await {
                Ok(true) => repaired += 1,
                Ok(false) => {}
                Err(e) => warn!(workflow_instance_id = %id, error = %e, "Health check failed"),
            }
        }
        repaired
    }

    async fn repair_if_drifted(&self, ctx: &Arc<ExecutionContext>) -> Result<bool> {
        let id = ctx.workflow_instance_id();
        let rows = self
            .repos
            .node_instances
            .list_for_workflow_instance(id)
            .await?;
        let persisted = rows
            .iter()
            .filter(|r| r.status == NodeInstanceStatus::Completed)
            .count();
        let in_memory = ctx.completed_count().await;
        if persisted == in_memory {
            return Ok(false);
        }

        warn!(
            workflow_instance_id = %id,
            in_memory,
            persisted,
            "Context drifted from the repository, rebuilding"
        );
        let instance = self
            .repos
            .workflow_instances
            .get(id)
            .await?
            .ok_or_else(|| FlowError::not_found("workflow instance", id))?;
        let fresh = self.build(&instance, ctx.topology().clone());
        fresh.rebuild_from_rows(rows).await?;
        fresh.rescan_ready().await;
        let fresh = Arc::new(fresh);
        self.persist(&fresh).await?;
        {
            let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = contexts.get_mut(id) {
                if Arc::ptr_eq(&cached.ctx, ctx) {
                    cached.ctx = fresh;
                    cached.recovered_at = Some(Instant::now());
                }
            }
        }
        self.event_bus.publish(EngineEvent::ContextRepaired {
            workflow_instance_id: id.clone(),
            in_memory_completed: in_memory,
            persisted_completed: persisted,
        });
        Ok(true)
    }

    /// Run the persist, expiry and health-check loops until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let persist_every = Duration::from_secs(self.config.persist_interval_secs.max(1));
        let health_every = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        let expire_every = Duration::from_secs((self.config.context_ttl_secs / 4).max(1));
        let mut persist = tokio::time::interval_at(Instant::now() + persist_every, persist_every);
        let mut health = tokio::time::interval_at(Instant::now() + health_every, health_every);
        let mut expire = tokio::time::interval_at(Instant::now() + expire_every, expire_every);
        info!(
            persist_interval_secs = self.config.persist_interval_secs,
            health_check_interval_secs = self.config.health_check_interval_secs,
            "Context registry background loop started"
        );

        loop {
            tokio::select! {
                _ = persist.tick() => {
                    self.persist_all().await;
                }
                _ = health.tick() => {
                    let repaired = self.health_check().await;
                    if repaired > 0 {
                        info!(repaired, "Health check repaired contexts");
                    }
                }
                _ = expire.tick() => {
                    self.expire_idle().await;
                }
                _ = cancel.cancelled() => {
                    self.persist_all().await;
                    info!("Context registry shutting down");
                    break;
                }
            }
        }
    }

    fn build(&self, instance: &WorkflowInstance, topology: Topology) -> ExecutionContext {
        ExecutionContext::new(
            instance.id.clone(),
            topology,
            global_data(instance),
            self.conditions.clone(),
            self.repos.clone(),
            self.event_bus.clone(),
            self.engine.clone(),
        )
    }

    async fn recover(&self, instance: &WorkflowInstance) -> Result<ExecutionContext> {
        let id = &instance.id;
        let topology = Topology::load(self.repos.nodes.as_ref(), &instance.workflow_id).await?;
        let rows = self
            .repos
            .node_instances
            .list_for_workflow_instance(id)
            .await?;

        let mut from_snapshot = false;
        let ctx = self.build(instance, topology.clone());
        match self.repos.workflow_instances.load_snapshot(id).await? {
            Some(value) => match ContextSnapshot::from_value(value) {
                Ok(snapshot) if snapshot_matches(&snapshot, &rows) => {
                    ctx.restore(snapshot).await?;
                    from_snapshot = true;
                }
                Ok(_) => {
                    info!(workflow_instance_id = %id, "Snapshot is stale, rebuilding from rows")
                }
                Err(e) => {
                    warn!(workflow_instance_id = %id, error = %e, "Discarding invalid snapshot")
                }
            },
            None => debug!(workflow_instance_id = %id, "No snapshot, rebuilding from rows"),
        }

        let ctx = if from_snapshot {
            ctx
        } else {
            let ctx = self.build(instance, topology);
            ctx.rebuild_from_rows(rows).await?;
            ctx
        };
        let ready = ctx.rescan_ready().await;
        info!(
            workflow_instance_id = %id,
            from_snapshot,
            ready_nodes = ready.len(),
            "Context recovered"
        );
        self.event_bus.publish(EngineEvent::ContextRecovered {
            workflow_instance_id: id.clone(),
            from_snapshot,
            ready_nodes: ready.len(),
        });
        Ok(ctx)
    }

    /// Cache a recovered context unless another caller got there first.
    fn insert(&self, ctx: ExecutionContext, recovered: bool) -> Arc<ExecutionContext> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entry = contexts
            .entry(ctx.workflow_instance_id().clone())
            .or_insert_with(|| CachedContext {
                ctx: Arc::new(ctx),
                last_access: now,
                recovered_at: recovered.then_some(now),
            });
        entry.last_access = now;
        entry.ctx.clone()
    }

    async fn evict_over_capacity(&self) {
        loop {
            let victim = {
                let contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
                if contexts.len() <= self.config.max_contexts {
                    return;
                }
                contexts
                    .values()
                    .min_by_key(|c| c.last_access)
                    .map(|c| c.ctx.clone())
            };
            match victim {
                Some(ctx) => {
                    if !self.evict(&ctx).await {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// Persist, then drop `ctx` if it is still the cached one. A context
    /// that cannot be persisted stays cached.
    async fn evict(&self, ctx: &Arc<ExecutionContext>) -> bool {
        let id = ctx.workflow_instance_id().clone();
        if let Err(e) = self.persist(ctx).await {
            error!(workflow_instance_id = %id, error = %e, "Not evicting unpersisted context");
            return false;
        }
        let removed = {
            let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            match contexts.get(&id) {
                Some(cached) if Arc::ptr_eq(&cached.ctx, ctx) => contexts.remove(&id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.release_lock(&id);
            debug!(workflow_instance_id = %id, "Context evicted");
            self.event_bus.publish(EngineEvent::ContextEvicted {
                workflow_instance_id: id,
            });
        }
        removed
    }

    /// Drop the instance mutex unless someone is holding or waiting on it.
    fn release_lock(&self, id: &WorkflowInstanceId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    fn cached(&self) -> Vec<Arc<ExecutionContext>> {
        self.contexts
            .lock()
            .map(|c| c.values().map(|cached| cached.ctx.clone()).collect())
            .unwrap_or_default()
    }
}

/// Global data visible to every node: the instance's context data with the
/// workflow input under `input`.
fn global_data(instance: &WorkflowInstance) -> Value {
    match &instance.context_data {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("input".into(), instance.input_data.clone());
            Value::Object(map)
        }
        Value::Null => json!({ "input": instance.input_data }),
        other => json!({ "context": other, "input": instance.input_data }),
    }
}

/// A snapshot is usable only if it knows every persisted row and agrees on
/// which of them completed.
fn snapshot_matches(snapshot: &ContextSnapshot, rows: &[NodeInstance]) -> bool {
    let known: BTreeSet<&NodeInstanceId> = snapshot.node_states.keys().collect();
    let persisted: BTreeSet<&NodeInstanceId> = rows.iter().map(|r| &r.id).collect();
    if known != persisted {
        return false;
    }
    let completed_in_snapshot: BTreeSet<&NodeInstanceId> = snapshot
        .node_states
        .values()
        .filter(|n| n.status == NodeStatus::Completed)
        .map(|n| &n.node_instance_id)
        .collect();
    let completed_in_rows: BTreeSet<&NodeInstanceId> = rows
        .iter()
        .filter(|r| r.status == NodeInstanceStatus::Completed)
        .map(|r| &r.id)
        .collect();
    completed_in_snapshot == completed_in_rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::types::{Connection, NodeDefinition, NodeId, WorkflowDefinition, WorkflowId};
    use flowline_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: ContextRegistry,
        instance: WorkflowInstance,
        rows: Vec<NodeInstance>,
    }

    async fn fixture(config: RegistryConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let definition = WorkflowDefinition {
            id: WorkflowId::from("wf"),
            name: "linear".into(),
            nodes: vec![
                NodeDefinition::start("start"),
                NodeDefinition::agent("a", "bot"),
                NodeDefinition::end("end"),
            ],
            connections: vec![Connection::always("start", "a"), Connection::always("a", "end")],
        };
        store.seed_workflow(&definition).unwrap();
        let repos = Repositories::from_store(store.clone());

        let instance = WorkflowInstance::new(
            WorkflowId::from("wf"),
            "run",
            json!({"topic": "rust"}),
            json!({"tenant": "acme"}),
        );
        repos.workflow_instances.create(&instance).await.unwrap();
        let mut rows = Vec::new();
        for node in ["start", "a", "end"] {
            let row = NodeInstance::new(instance.id.clone(), NodeId::from(node));
            repos.node_instances.create(&row).await.unwrap();
            rows.push(row);
        }

        let registry = ContextRegistry::new(
            repos,
            Arc::new(ConditionEngine::default()),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
            config,
        );
        Fixture { store, registry, instance, rows }
    }

    async fn complete_row(store: &Arc<MemoryStore>, row: &NodeInstance) {
        let repos = Repositories::from_store(store.clone());
        let mut row = row.clone();
        row.status = NodeInstanceStatus::Completed;
        row.output_data = Some(json!({}));
        row.completed_at = Some(chrono::Utc::now());
        repos.node_instances.update(&row).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_from_rows_without_snapshot() {
        let f = fixture(RegistryConfig::default()).await;
        complete_row(&f.store, &f.rows[0]).await;

        let ctx = f.registry.get_or_create(&f.instance.id).await.unwrap();
        assert_eq!(ctx.completed_count().await, 1);
        assert_eq!(ctx.pending_triggers().await, BTreeSet::from([f.rows[1].id.clone()]));

        let input = ctx.get_node_execution_context(&f.rows[1].id).await.unwrap();
        assert_eq!(input["global"]["tenant"], "acme");
        assert_eq!(input["global"]["input"]["topic"], "rust");

        // Second lookup is a cache hit.
        let again = f.registry.get_or_create(&f.instance.id).await.unwrap();
        assert!(Arc::ptr_eq(&ctx, &again));
    }

    #[tokio::test]
    async fn test_remove_persists_snapshot() {
        let f = fixture(RegistryConfig::default()).await;
        complete_row(&f.store, &f.rows[0]).await;
        f.registry.get_or_create(&f.instance.id).await.unwrap();

        assert!(f.registry.remove(&f.instance.id).await.unwrap());
        assert!(!f.registry.contains(&f.instance.id));
        assert!(!f.registry.remove(&f.instance.id).await.unwrap());

        let repos = Repositories::from_store(f.store.clone());
        let saved = repos
            .workflow_instances
            .load_snapshot(&f.instance.id)
            .await
            .unwrap()
            .unwrap();
        let snapshot = ContextSnapshot::from_value(saved).unwrap();
        assert!(snapshot.node_states.contains_key(&f.rows[0].id));

        let mut events = f.registry.event_bus.subscribe();
        f.registry.get_or_create(&f.instance.id).await.unwrap();
        match events.try_recv().unwrap() {
            EngineEvent::ContextRecovered { from_snapshot, ready_nodes, .. } => {
                assert!(from_snapshot);
                assert_eq!(ready_nodes, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_snapshot_falls_back_to_rows() {
        let f = fixture(RegistryConfig::default()).await;
        f.registry.get_or_create(&f.instance.id).await.unwrap();
        f.registry.remove(&f.instance.id).await.unwrap();

        // Completed after the snapshot was taken.
        complete_row(&f.store, &f.rows[0]).await;

        let mut events = f.registry.event_bus.subscribe();
        let ctx = f.registry.get_or_create(&f.instance.id).await.unwrap();
        assert_eq!(ctx.completed_count().await, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::ContextRecovered { from_snapshot: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let f = fixture(RegistryConfig::default()).await;
        let Err(err) = f
            .registry
            .get_or_create(&WorkflowInstanceId::from("missing"))
            .await
        else {
            panic!("context created for an unknown instance");
        };
        assert!(matches!(err, FlowError::NotFound { .. }));
        assert!(f.registry.get(&WorkflowInstanceId::from("missing")).is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_persists_first() {
        let f = fixture(RegistryConfig {
            max_contexts: 1,
            ..RegistryConfig::default()
        })
        .await;
        let repos = Repositories::from_store(f.store.clone());
        let other = WorkflowInstance::new(WorkflowId::from("wf"), "other", Value::Null, Value::Null);
        repos.workflow_instances.create(&other).await.unwrap();

        f.registry.get_or_create(&f.instance.id).await.unwrap();
        f.registry.get_or_create(&other.id).await.unwrap();

        assert_eq!(f.registry.len(), 1);
        assert!(f.registry.contains(&other.id));
        assert!(repos
            .workflow_instances
            .load_snapshot(&f.instance.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_contexts_expire() {
        let f = fixture(RegistryConfig {
            context_ttl_secs: 60,
            ..RegistryConfig::default()
        })
        .await;
        f.registry.get_or_create(&f.instance.id).await.unwrap();
        assert_eq!(f.registry.expire_idle().await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(f.registry.expire_idle().await, 1);
        assert!(f.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_repairs_drift() {
        let f = fixture(RegistryConfig {
            recovery_grace_secs: 180,
            ..RegistryConfig::default()
        })
        .await;
        let ctx = f.registry.get_or_create(&f.instance.id).await.unwrap();
        assert_eq!(ctx.completed_count().await, 0);

        // Completed behind the context's back.
        complete_row(&f.store, &f.rows[0]).await;

        // Inside the grace period nothing happens.
        assert_eq!(f.registry.health_check().await, 0);

        tokio::time::advance(Duration::from_secs(181)).await;
        assert_eq!(f.registry.health_check().await, 1);
        let repaired = f.registry.get(&f.instance.id).unwrap();
        assert!(!Arc::ptr_eq(&ctx, &repaired));
        assert_eq!(repaired.completed_count().await, 1);

        assert_eq!(f.registry.health_check().await, 0);
    }

    #[tokio::test]
    async fn test_lock_is_shared_per_instance() {
        let f = fixture(RegistryConfig::default()).await;
        let a = f.registry.lock_for(&f.instance.id);
        let b = f.registry.lock_for(&f.instance.id);
        assert!(Arc::ptr_eq(&a, &b));
        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());
    }

    #[test]
    fn test_global_data_merges_input() {
        let instance = WorkflowInstance::new(
            WorkflowId::from("wf"),
            "x",
            json!({"n": 1}),
            json!({"team": "red"}),
        );
        assert_eq!(global_data(&instance), json!({"team": "red", "input": {"n": 1}}));
    }
}
