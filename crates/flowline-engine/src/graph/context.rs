use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowline_core::config::EngineConfig;
use flowline_core::error::{FlowError, Result};
use flowline_core::event::{EngineEvent, EventBus};
use flowline_core::traits::Repositories;
use flowline_core::types::{
    NodeId, NodeInstance, NodeInstanceId, NodeInstanceStatus, NodeKind, WorkflowInstanceId,
    WorkflowStatus,
};

use super::dependency::NodeDependency;
use super::path::{ExecutionPath, PathStatus, MAIN_PATH};
use super::snapshot::{ContextSnapshot, ExecutionData};
use super::state::{ExecutionRecord, NodeState, NodeStatus};
use super::topology::Topology;
use crate::condition::ConditionEngine;

/// A node instance handed out by [`ExecutionContext::get_ready_nodes`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyNode {
    pub node_instance_id: NodeInstanceId,
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub path_id: String,
}

struct ContextState {
    dependencies: BTreeMap<NodeInstanceId, NodeDependency>,
    nodes: BTreeMap<NodeInstanceId, NodeState>,
    data: ExecutionData,
}

impl ContextState {
    fn node(&self, id: &NodeInstanceId) -> Result<&NodeState> {
        self.nodes
            .get(id)
            .ok_or_else(|| FlowError::not_found("node instance", id))
    }

    fn node_mut(&mut self, id: &NodeInstanceId) -> Result<&mut NodeState> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| FlowError::not_found("node instance", id))
    }

    fn path_of(&self, id: &NodeInstanceId) -> String {
        self.nodes
            .get(id)
            .and_then(|n| n.path_id.clone())
            .unwrap_or_else(|| MAIN_PATH.to_string())
    }

    fn path_mut(&mut self, path_id: &str) -> &mut ExecutionPath {
        self.data
            .paths
            .entry(path_id.to_string())
            .or_insert_with(|| ExecutionPath::new(path_id.to_string(), Some(MAIN_PATH.into())))
    }

    fn is_pending_triggerable(&self, id: &NodeInstanceId) -> bool {
        let pending = self
            .nodes
            .get(id)
            .is_some_and(|n| n.status == NodeStatus::Pending);
        pending
            && self
                .dependencies
                .get(id)
                .is_some_and(NodeDependency::is_triggerable)
    }

    /// Queue `id` if it is Pending and triggerable. Unclaimed instances join
    /// the main path.
    fn refresh_trigger(&mut self, id: &NodeInstanceId) -> bool {
        if !self.is_pending_triggerable(id) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(id) {
            if node.path_id.is_none() {
                node.path_id = Some(MAIN_PATH.to_string());
            }
        }
        self.data.pending_triggers.insert(id.clone())
    }

    fn has_live_work(&self) -> bool {
        !self.data.pending_triggers.is_empty()
            || self.nodes.values().any(|n| n.status.is_live())
            || self
                .nodes
                .keys()
                .any(|id| self.is_pending_triggerable(id))
    }

    fn settle_paths(&mut self) {
        let mut live: BTreeSet<String> = BTreeSet::new();
        for node in self.nodes.values() {
            let queued = self.data.pending_triggers.contains(&node.node_instance_id);
            if node.status.is_live() || queued {
                live.insert(
                    node.path_id
                        .clone()
                        .unwrap_or_else(|| MAIN_PATH.to_string()),
                );
            }
        }
        for path in self.data.paths.values_mut() {
            path.settle(live.contains(&path.path_id));
        }
    }

    /// Latest output of `node_id`, preferring what the given path saw.
    fn latest_output(&self, path_id: &str, node_id: &NodeId) -> Option<Value> {
        if let Some(out) = self
            .data
            .paths
            .get(path_id)
            .and_then(|p| p.accumulated_outputs.get(node_id))
        {
            return Some(out.clone());
        }
        self.nodes
            .values()
            .filter(|n| &n.node_id == node_id && n.status == NodeStatus::Completed)
            .max_by_key(|n| n.completed_at)
            .and_then(|n| self.data.outputs.get(&n.node_instance_id).cloned())
    }

    fn is_descendant_path(&self, candidate: &str, ancestor: &str) -> bool {
        let mut current = Some(candidate.to_string());
        let mut hops = 0;
        while let Some(path_id) = current {
            if path_id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.data.paths.len() {
                return false;
            }
            current = self
                .data
                .paths
                .get(&path_id)
                .and_then(|p| p.parent_path_id.clone());
        }
        false
    }

    fn completed_ids(&self) -> BTreeSet<NodeInstanceId> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.node_instance_id.clone())
            .collect()
    }
}

/// Execution state of one workflow instance: the dependency graph, node
/// state machine, execution paths and accumulated outputs.
///
/// All mutation goes through one async mutex. Every state change is written
/// to the node-instance repository before it is applied in memory, so a
/// failed write leaves the in-memory state untouched.
pub struct ExecutionContext {
    workflow_instance_id: WorkflowInstanceId,
    topology: Topology,
    state: Mutex<ContextState>,
    conditions: Arc<ConditionEngine>,
    repos: Repositories,
    event_bus: Arc<EventBus>,
    limits: EngineConfig,
}

impl ExecutionContext {
    pub fn new(
        workflow_instance_id: WorkflowInstanceId,
        topology: Topology,
        global: Value,
        conditions: Arc<ConditionEngine>,
        repos: Repositories,
        event_bus: Arc<EventBus>,
        limits: EngineConfig,
    ) -> Self {
        let mut data = ExecutionData {
            workflow_id: topology.workflow_id.clone(),
            global,
            ..ExecutionData::default()
        };
        data.paths.insert(MAIN_PATH.to_string(), ExecutionPath::main());
        Self {
            workflow_instance_id,
            topology,
            state: Mutex::new(ContextState {
                dependencies: BTreeMap::new(),
                nodes: BTreeMap::new(),
                data,
            }),
            conditions,
            repos,
            event_bus,
            limits,
        }
    }

    pub fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    // ── Registration ──────────────────────────────────────────────

    /// Start tracking a persisted node instance. No-op if already tracked.
    pub async fn track_instance(&self, instance: &NodeInstance) {
        let mut state = self.state.lock().await;
        state
            .nodes
            .entry(instance.id.clone())
            .or_insert_with(|| NodeState::from_instance(instance));
    }

    /// Record the upstream instances of a node instance.
    ///
    /// Upstreams that already finished count as resolved right away, so
    /// instances may be registered in any order.
    pub async fn register_dependencies(
        &self,
        node_instance_id: &NodeInstanceId,
        node_id: &NodeId,
        upstream: Vec<NodeInstanceId>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .nodes
            .entry(node_instance_id.clone())
            .or_insert_with(|| NodeState::pending(node_instance_id.clone(), node_id.clone()));

        let mut dep = NodeDependency::new(node_instance_id.clone(), node_id.clone(), upstream);
        for up in dep.upstream.clone() {
            let Some(up_status) = state.nodes.get(&up).map(|n| n.status) else {
                continue;
            };
            match up_status {
                NodeStatus::Completed => {
                    let activated = self.edge_holds(&state, &up, node_id);
                    dep.resolve(&up, activated);
                    if activated {
                        let path = state.path_of(&up);
                        if let Some(node) = state.nodes.get_mut(node_instance_id) {
                            node.path_id.get_or_insert(path);
                        }
                    }
                }
                NodeStatus::Skipped => {
                    dep.resolve(&up, false);
                }
                _ => {}
            }
        }
        debug!(
            node_instance_id = %node_instance_id,
            upstream = dep.upstream.len(),
            ready = dep.ready,
            "Registered dependencies"
        );
        state.dependencies.insert(node_instance_id.clone(), dep);
        state.refresh_trigger(node_instance_id);
        state.settle_paths();
        Ok(())
    }

    // ── State transitions ─────────────────────────────────────────

    /// Pending/Ready → Executing. Returns false if it was already executing.
    pub async fn mark_executing(
        &self,
        node_id: &NodeId,
        node_instance_id: &NodeInstanceId,
        input: Value,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let node = state.node(node_instance_id)?;
        check_node_id(node, node_id)?;
        match node.status {
            NodeStatus::Executing => return Ok(false),
            NodeStatus::Pending | NodeStatus::Ready => {}
            other => return Err(invalid(node_instance_id, other, NodeStatus::Executing)),
        }
        let path_id = state.path_of(node_instance_id);

        let now = Utc::now();
        let mut row = self.load_row(node_instance_id).await?;
        row.status = NodeInstanceStatus::Running;
        row.started_at = Some(now);
        row.input_data = Some(input.clone());
        row.execution_path_id = Some(path_id.clone());
        self.repos.node_instances.update(&row).await?;

        let node = state.node_mut(node_instance_id)?;
        node.status = NodeStatus::Executing;
        node.path_id = Some(path_id.clone());
        state.data.pending_triggers.remove(node_instance_id);

        let path = state.path_mut(&path_id);
        path.visited_nodes.insert(node_id.clone());
        let execution_count = state
            .data
            .records
            .iter()
            .filter(|r| r.path_id == path_id && &r.node_id == node_id)
            .count() as u32
            + 1;
        state.data.records.push(ExecutionRecord {
            path_id,
            node_instance_id: node_instance_id.clone(),
            node_id: node_id.clone(),
            execution_count,
            input,
            output: None,
            status: NodeStatus::Executing,
            started_at: now,
            finished_at: None,
        });
        state.settle_paths();
        Ok(true)
    }

    /// Record a completion and evaluate outgoing edges.
    ///
    /// Returns false (and evaluates nothing) when the instance was already
    /// completed, in memory or in the repository, or has reached another
    /// terminal state.
    pub async fn mark_completed(
        &self,
        node_id: &NodeId,
        node_instance_id: &NodeInstanceId,
        output: Value,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let node = state.node(node_instance_id)?;
        check_node_id(node, node_id)?;
        if node.status == NodeStatus::Completed {
            debug!(node_instance_id = %node_instance_id, "Duplicate completion ignored");
            return Ok(false);
        }
        let status = node.status;

        let mut row = self.load_row(node_instance_id).await?;
        if row.status == NodeInstanceStatus::Completed {
            warn!(
                workflow_instance_id = %self.workflow_instance_id,
                node_instance_id = %node_instance_id,
                "Node already completed in the repository, syncing in-memory state"
            );
            let persisted = row.output_data.clone().unwrap_or(Value::Null);
            let at = row.completed_at.unwrap_or_else(Utc::now);
            self.apply_completion(&mut state, node_instance_id, persisted, at, false)
                .await?;
            return Ok(false);
        }
        if status.is_terminal() {
            info!(
                node_instance_id = %node_instance_id,
                status = %status,
                "Completion for finished node ignored"
            );
            return Ok(false);
        }

        let now = Utc::now();
        row.status = NodeInstanceStatus::Completed;
        row.output_data = Some(output.clone());
        row.error_message = None;
        row.completed_at = Some(now);
        row.execution_path_id = Some(state.path_of(node_instance_id));
        self.repos.node_instances.update(&row).await?;

        self.apply_completion(&mut state, node_instance_id, output, now, true)
            .await?;
        info!(
            workflow_instance_id = %self.workflow_instance_id,
            node_instance_id = %node_instance_id,
            node_id = %node_id,
            "Node completed"
        );
        self.event_bus.publish(EngineEvent::NodeCompleted {
            workflow_instance_id: self.workflow_instance_id.clone(),
            node_instance_id: node_instance_id.clone(),
        });
        Ok(true)
    }

    /// Record a failure. Downstream nodes are left unresolved.
    pub async fn mark_failed(
        &self,
        node_id: &NodeId,
        node_instance_id: &NodeInstanceId,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let node = state.node(node_instance_id)?;
        check_node_id(node, node_id)?;
        if node.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        let mut row = self.load_row(node_instance_id).await?;
        row.status = NodeInstanceStatus::Failed;
        row.error_message = Some(error.to_string());
        row.completed_at = Some(now);
        self.repos.node_instances.update(&row).await?;

        let path_id = state.path_of(node_instance_id);
        let node = state.node_mut(node_instance_id)?;
        node.status = NodeStatus::Failed;
        node.error = Some(error.to_string());
        node.completed_at = Some(now);
        state.data.pending_triggers.remove(node_instance_id);
        state.path_mut(&path_id).has_failure = true;
        finish_record(&mut state.data.records, node_instance_id, NodeStatus::Failed, None, now);
        state.settle_paths();

        warn!(
            workflow_instance_id = %self.workflow_instance_id,
            node_instance_id = %node_instance_id,
            error = %error,
            "Node failed"
        );
        self.event_bus.publish(EngineEvent::NodeFailed {
            workflow_instance_id: self.workflow_instance_id.clone(),
            node_instance_id: node_instance_id.clone(),
            error: error.to_string(),
        });
        Ok(true)
    }

    /// Cancel one non-terminal node instance.
    pub async fn mark_cancelled(&self, node_instance_id: &NodeInstanceId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let changed = self.cancel_locked(&mut state, node_instance_id).await?;
        state.settle_paths();
        Ok(changed)
    }

    /// Cancel every non-terminal instance downstream of `node_instance_id`
    /// in its path (or in paths forked from it).
    pub async fn cancel_descendants(
        &self,
        node_instance_id: &NodeInstanceId,
    ) -> Result<Vec<NodeInstanceId>> {
        let mut state = self.state.lock().await;
        let origin = state.node(node_instance_id)?.clone();
        let origin_path = origin.path_id.clone().unwrap_or_else(|| MAIN_PATH.into());
        let reachable = self.topology.reachable_from(&origin.node_id);

        let victims: Vec<NodeInstanceId> = state
            .nodes
            .values()
            .filter(|n| &n.node_instance_id != node_instance_id)
            .filter(|n| !n.status.is_terminal() && reachable.contains(&n.node_id))
            .filter(|n| match &n.path_id {
                None => true,
                Some(p) => state.is_descendant_path(p, &origin_path),
            })
            .map(|n| n.node_instance_id.clone())
            .collect();

        let mut cancelled = Vec::new();
        for id in victims {
            if self.cancel_locked(&mut state, &id).await? {
                cancelled.push(id);
            }
        }
        state.settle_paths();
        Ok(cancelled)
    }

    /// Cancel every non-terminal node instance.
    pub async fn cancel_all(&self) -> Result<Vec<NodeInstanceId>> {
        let mut state = self.state.lock().await;
        let open: Vec<NodeInstanceId> = state
            .nodes
            .values()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.node_instance_id.clone())
            .collect();
        let mut cancelled = Vec::new();
        for id in open {
            if self.cancel_locked(&mut state, &id).await? {
                cancelled.push(id);
            }
        }
        state.settle_paths();
        Ok(cancelled)
    }

    async fn cancel_locked(
        &self,
        state: &mut ContextState,
        node_instance_id: &NodeInstanceId,
    ) -> Result<bool> {
        if state.node(node_instance_id)?.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        let mut row = self.load_row(node_instance_id).await?;
        row.status = NodeInstanceStatus::Cancelled;
        row.completed_at = Some(now);
        self.repos.node_instances.update(&row).await?;

        let node = state.node_mut(node_instance_id)?;
        node.status = NodeStatus::Cancelled;
        node.completed_at = Some(now);
        state.data.pending_triggers.remove(node_instance_id);
        finish_record(&mut state.data.records, node_instance_id, NodeStatus::Cancelled, None, now);
        info!(node_instance_id = %node_instance_id, "Node cancelled");
        Ok(true)
    }

    // ── Downstream triggering ─────────────────────────────────────

    async fn apply_completion(
        &self,
        state: &mut ContextState,
        node_instance_id: &NodeInstanceId,
        output: Value,
        at: DateTime<Utc>,
        allow_loops: bool,
    ) -> Result<()> {
        let path_id = state.path_of(node_instance_id);
        let node = state.node_mut(node_instance_id)?;
        node.status = NodeStatus::Completed;
        node.completed_at = Some(at);
        node.error = None;
        node.path_id = Some(path_id.clone());
        let node_id = node.node_id.clone();

        state.data.pending_triggers.remove(node_instance_id);
        state.data.outputs.insert(node_instance_id.clone(), output.clone());
        let path = state.path_mut(&path_id);
        path.visited_nodes.insert(node_id.clone());
        path.accumulated_outputs.insert(node_id.clone(), output.clone());

        let finished = finish_record(
            &mut state.data.records,
            node_instance_id,
            NodeStatus::Completed,
            Some(output.clone()),
            at,
        );
        if !finished {
            let execution_count = state
                .data
                .records
                .iter()
                .filter(|r| r.path_id == path_id && r.node_id == node_id)
                .count() as u32
                + 1;
            state.data.records.push(ExecutionRecord {
                path_id,
                node_instance_id: node_instance_id.clone(),
                node_id,
                execution_count,
                input: Value::Null,
                output: Some(output),
                status: NodeStatus::Completed,
                started_at: at,
                finished_at: Some(at),
            });
        }

        self.trigger_downstream(state, node_instance_id, allow_loops)
            .await?;
        state.settle_paths();
        Ok(())
    }

    /// Evaluate every outgoing edge of a completed instance.
    ///
    /// An edge that holds and targets a node not yet visited in the source's
    /// path resolves that node's dependency; one that targets a visited node
    /// creates a loop instance. Edges that do not hold resolve without
    /// activating, and nodes left with no activated upstream pass that on.
    async fn trigger_downstream(
        &self,
        state: &mut ContextState,
        source_id: &NodeInstanceId,
        allow_loops: bool,
    ) -> Result<()> {
        let source = state.node(source_id)?.clone();
        let path_id = source.path_id.clone().unwrap_or_else(|| MAIN_PATH.into());
        let cond_ctx = self.condition_context(state, source_id);
        let connections: Vec<_> = self.topology.outgoing(&source.node_id).cloned().collect();

        let mut dormant = Vec::new();
        for conn in connections {
            let target = &conn.to_node_id;
            let activated = self
                .conditions
                .evaluate(conn.condition_config.as_ref(), &cond_ctx);
            let visited = state
                .data
                .paths
                .get(&path_id)
                .is_some_and(|p| p.visited_nodes.contains(target));
            debug!(
                from = %source.node_id,
                to = %target,
                activated,
                visited,
                "Evaluated edge"
            );

            if activated && visited {
                if !allow_loops {
                    resolve_loop_rows(state, source_id, target);
                    continue;
                }
                if state
                    .data
                    .paths
                    .get(&path_id)
                    .is_some_and(|p| p.exhausted.contains(target))
                {
                    debug!(node_id = %target, path_id = %path_id, "Loop cap already reached");
                    continue;
                }
                match self.create_loop_locked(state, &path_id, target, source_id).await {
                    Ok(_) => {}
                    Err(FlowError::LoopLimitExceeded { limit, .. }) => {
                        warn!(
                            workflow_instance_id = %self.workflow_instance_id,
                            node_id = %target,
                            path_id = %path_id,
                            limit,
                            "Loop limit reached, not re-running node"
                        );
                        state.path_mut(&path_id).exhausted.insert(target.clone());
                        self.event_bus.publish(EngineEvent::LoopLimitReached {
                            workflow_instance_id: self.workflow_instance_id.clone(),
                            node_id: target.clone(),
                            limit,
                        });
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            dormant.extend(resolve_target(state, &source, target, activated, &path_id));
        }

        self.propagate_dormancy(state, dormant);
        Ok(())
    }

    fn propagate_dormancy(&self, state: &mut ContextState, mut worklist: Vec<NodeInstanceId>) {
        while let Some(id) = worklist.pop() {
            let Some(node) = state.nodes.get(&id).cloned() else {
                continue;
            };
            debug!(node_instance_id = %id, node_id = %node.node_id, "Node dormant");
            let path_id = node.path_id.clone().unwrap_or_else(|| MAIN_PATH.into());
            let targets: Vec<NodeId> = self
                .topology
                .outgoing(&node.node_id)
                .map(|c| c.to_node_id.clone())
                .collect();
            for target in targets {
                worklist.extend(resolve_target(state, &node, &target, false, &path_id));
            }
        }
    }

    fn edge_holds(&self, state: &ContextState, source_id: &NodeInstanceId, target: &NodeId) -> bool {
        let Some(source) = state.nodes.get(source_id) else {
            return false;
        };
        let cond_ctx = self.condition_context(state, source_id);
        self.topology
            .outgoing(&source.node_id)
            .filter(|c| &c.to_node_id == target)
            .any(|c| self.conditions.evaluate(c.condition_config.as_ref(), &cond_ctx))
    }

    /// The value edge conditions are evaluated against.
    fn condition_context(&self, state: &ContextState, source_id: &NodeInstanceId) -> Value {
        let path_id = state.path_of(source_id);
        let path = state.data.paths.get(&path_id);
        let node_id = state
            .nodes
            .get(source_id)
            .map(|n| n.node_id.to_string())
            .unwrap_or_default();
        json!({
            "output": state.data.outputs.get(source_id).cloned().unwrap_or(Value::Null),
            "node": {
                "node_instance_id": source_id,
                "node_id": node_id,
                "path_id": path_id,
            },
            "global": state.data.global,
            "outputs": path
                .map(|p| serde_json::to_value(&p.accumulated_outputs).unwrap_or_default())
                .unwrap_or_default(),
            "user_selections": path
                .map(|p| serde_json::to_value(&p.user_selections).unwrap_or_default())
                .unwrap_or_default(),
        })
    }

    // ── Loops and retries ─────────────────────────────────────────

    /// Create a loop-back instance of `node_id` in `path_id`, fed by
    /// `triggered_by`. Fails with `LoopLimitExceeded` once the path has
    /// looped back to the node `max_loop_iterations` times.
    pub async fn create_loop_instance(
        &self,
        path_id: &str,
        node_id: &NodeId,
        triggered_by: &NodeInstanceId,
    ) -> Result<NodeInstanceId> {
        let mut state = self.state.lock().await;
        state.node(triggered_by)?;
        let id = self
            .create_loop_locked(&mut state, path_id, node_id, triggered_by)
            .await?;
        state.settle_paths();
        Ok(id)
    }

    async fn create_loop_locked(
        &self,
        state: &mut ContextState,
        path_id: &str,
        node_id: &NodeId,
        triggered_by: &NodeInstanceId,
    ) -> Result<NodeInstanceId> {
        let limit = self.limits.max_loop_iterations;
        let count = state
            .path_mut(path_id)
            .loop_count
            .get(node_id)
            .copied()
            .unwrap_or(0);
        if count >= limit {
            return Err(FlowError::LoopLimitExceeded {
                node_id: node_id.to_string(),
                path_id: path_id.to_string(),
                limit,
            });
        }
        let iteration = count + 1;

        let mut row = NodeInstance::new(self.workflow_instance_id.clone(), node_id.clone());
        row.loop_iteration = Some(iteration);
        row.parent_instance_id = Some(triggered_by.clone());
        row.execution_path_id = Some(path_id.to_string());
        self.repos.node_instances.create(&row).await?;

        state.path_mut(path_id).loop_count.insert(node_id.clone(), iteration);
        state.nodes.insert(row.id.clone(), NodeState::from_instance(&row));
        let mut dep = NodeDependency::new(row.id.clone(), node_id.clone(), [triggered_by.clone()]);
        if state
            .nodes
            .get(triggered_by)
            .is_some_and(|n| n.status == NodeStatus::Completed)
        {
            dep.resolve(triggered_by, true);
        }
        state.dependencies.insert(row.id.clone(), dep);
        state.refresh_trigger(&row.id);

        info!(
            workflow_instance_id = %self.workflow_instance_id,
            node_id = %node_id,
            path_id = %path_id,
            iteration,
            "Loop-back instance created"
        );
        Ok(row.id)
    }

    /// Failed, not yet retried, and under the retry cap.
    pub async fn is_retryable(&self, node_instance_id: &NodeInstanceId) -> bool {
        let state = self.state.lock().await;
        state.nodes.get(node_instance_id).is_some_and(|n| {
            n.status == NodeStatus::Failed
                && !n.retried
                && n.retry_count < self.limits.max_node_retries
        })
    }

    /// Operator retry: a fresh instance with the failed one's upstreams.
    /// Nodes skipped because of the failure become pending again.
    pub async fn create_retry_instance(
        &self,
        failed_id: &NodeInstanceId,
    ) -> Result<NodeInstanceId> {
        let mut state = self.state.lock().await;
        let failed = state.node(failed_id)?.clone();
        if failed.status != NodeStatus::Failed || failed.retried {
            return Err(invalid(failed_id, failed.status, NodeStatus::Pending));
        }
        if failed.retry_count >= self.limits.max_node_retries {
            return Err(FlowError::Validation(format!(
                "node instance {} already retried {} times",
                failed_id, failed.retry_count
            )));
        }
        let path_id = failed.path_id.clone().unwrap_or_else(|| MAIN_PATH.into());

        let mut row = NodeInstance::new(self.workflow_instance_id.clone(), failed.node_id.clone());
        row.retry_count = failed.retry_count + 1;
        row.parent_instance_id = Some(failed_id.clone());
        row.execution_path_id = Some(path_id.clone());
        self.repos.node_instances.create(&row).await?;

        let mut dep = match state.dependencies.get(failed_id) {
            Some(old) => {
                let mut dep = old.clone();
                dep.node_instance_id = row.id.clone();
                dep
            }
            None => NodeDependency::new(row.id.clone(), failed.node_id.clone(), []),
        };
        dep.refresh();
        state.dependencies.insert(row.id.clone(), dep);
        state.nodes.insert(row.id.clone(), NodeState::from_instance(&row));
        state.node_mut(failed_id)?.retried = true;

        let still_failing = state.nodes.values().any(|n| {
            n.status == NodeStatus::Failed
                && !n.retried
                && n.path_id.as_deref().unwrap_or(MAIN_PATH) == path_id
        });
        state.path_mut(&path_id).has_failure = still_failing;

        let skipped: Vec<NodeInstanceId> = state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Skipped)
            .map(|n| n.node_instance_id.clone())
            .collect();
        for id in skipped {
            let mut skipped_row = self.load_row(&id).await?;
            skipped_row.status = NodeInstanceStatus::Pending;
            skipped_row.completed_at = None;
            self.repos.node_instances.update(&skipped_row).await?;
            if let Some(node) = state.nodes.get_mut(&id) {
                node.status = NodeStatus::Pending;
                node.completed_at = None;
            }
        }

        state.refresh_trigger(&row.id);
        state.settle_paths();
        info!(
            workflow_instance_id = %self.workflow_instance_id,
            failed = %failed_id,
            retry = %row.id,
            attempt = row.retry_count,
            "Retry instance created"
        );
        Ok(row.id)
    }

    // ── Ready set ─────────────────────────────────────────────────

    /// Drain the trigger set and mark the drained instances Ready.
    ///
    /// Pending instances that are triggerable but missing from the set are
    /// picked up as well.
    pub async fn get_ready_nodes(&self) -> Vec<ReadyNode> {
        let mut state = self.state.lock().await;
        let mut drained: BTreeSet<NodeInstanceId> = std::mem::take(&mut state.data.pending_triggers);

        let missed: Vec<NodeInstanceId> = state
            .dependencies
            .keys()
            .filter(|id| !drained.contains(*id) && state.is_pending_triggerable(id))
            .cloned()
            .collect();
        for id in missed {
            warn!(
                workflow_instance_id = %self.workflow_instance_id,
                node_instance_id = %id,
                "Ready node was missing from the trigger set"
            );
            drained.insert(id);
        }

        let mut ready = Vec::new();
        for id in drained {
            if !state.is_pending_triggerable(&id) {
                continue;
            }
            let path_id = state.path_of(&id);
            let Some(node) = state.nodes.get_mut(&id) else {
                continue;
            };
            node.status = NodeStatus::Ready;
            node.path_id = Some(path_id.clone());
            let node_id = node.node_id.clone();
            self.event_bus.publish(EngineEvent::NodeReady {
                workflow_instance_id: self.workflow_instance_id.clone(),
                node_instance_id: id.clone(),
                node_id: node_id.clone(),
            });
            ready.push(ReadyNode {
                kind: self.topology.kind(&node_id),
                node_instance_id: id,
                node_id,
                path_id,
            });
        }
        state.settle_paths();
        ready
    }

    /// Put a Ready instance back in the trigger set, e.g. when dispatch was
    /// deferred.
    pub async fn requeue(&self, node_instance_id: &NodeInstanceId) -> bool {
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(node_instance_id) {
            Some(node) if node.status == NodeStatus::Ready => {
                node.status = NodeStatus::Pending;
                state.refresh_trigger(node_instance_id)
            }
            _ => false,
        }
    }

    /// Add every triggerable Pending instance to the trigger set and return
    /// the resulting set.
    pub async fn rescan_ready(&self) -> BTreeSet<NodeInstanceId> {
        let mut state = self.state.lock().await;
        let ids: Vec<NodeInstanceId> = state.dependencies.keys().cloned().collect();
        for id in ids {
            state.refresh_trigger(&id);
        }
        state.settle_paths();
        state.data.pending_triggers.clone()
    }

    // ── Node input assembly ───────────────────────────────────────

    /// Input for a node: direct-upstream outputs, all-upstream outputs,
    /// attachment references found in them, and the global data.
    pub async fn get_node_execution_context(
        &self,
        node_instance_id: &NodeInstanceId,
    ) -> Result<Value> {
        let state = self.state.lock().await;
        let node = state.node(node_instance_id)?;
        let path_id = state.path_of(node_instance_id);

        let mut immediate = Map::new();
        if let Some(dep) = state.dependencies.get(node_instance_id) {
            let feeding = if dep.activated_upstream.is_empty() {
                &dep.upstream
            } else {
                &dep.activated_upstream
            };
            for up in feeding {
                let Some(up_node) = state.nodes.get(up) else {
                    continue;
                };
                if let Some(out) = state.latest_output(&path_id, &up_node.node_id) {
                    immediate.insert(up_node.node_id.to_string(), out);
                }
            }
        }

        let mut all = Map::new();
        for ancestor in self.topology.ancestors_of(&node.node_id) {
            if let Some(out) = state.latest_output(&path_id, &ancestor) {
                all.insert(ancestor.to_string(), out);
            }
        }
        // Loop instances also see their trigger, which may not be a static ancestor.
        if let Some(parent) = node.parent_instance_id.as_ref().and_then(|p| state.nodes.get(p)) {
            if let Some(out) = state.latest_output(&path_id, &parent.node_id) {
                all.entry(parent.node_id.to_string()).or_insert(out);
            }
        }

        let mut attachments = Vec::new();
        for out in all.values() {
            for key in ["attachments", "files"] {
                if let Some(Value::Array(items)) = out.get(key) {
                    for item in items {
                        if !attachments.contains(item) {
                            attachments.push(item.clone());
                        }
                    }
                }
            }
        }

        Ok(json!({
            "node_instance_id": node_instance_id,
            "node_id": node.node_id,
            "path_id": path_id,
            "loop_iteration": node.loop_iteration,
            "retry_count": node.retry_count,
            "immediate_upstream": immediate,
            "all_upstream": all,
            "attachments": attachments,
            "global": state.data.global,
        }))
    }

    // ── Paths ─────────────────────────────────────────────────────

    /// Fork a new Active path from `parent_path_id`.
    pub async fn create_execution_path(&self, parent_path_id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        fork_path(&mut state, parent_path_id)
    }

    /// Record the downstream nodes a user chose at `node_instance_id`.
    ///
    /// Choosing more than one target forks one path per target; the origin
    /// path is marked Branched. Returns the new path ids.
    pub async fn handle_user_path_selection(
        &self,
        node_instance_id: &NodeInstanceId,
        targets: Vec<NodeId>,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let node = state.node(node_instance_id)?.clone();
        let allowed: BTreeSet<NodeId> = self
            .topology
            .outgoing(&node.node_id)
            .map(|c| c.to_node_id.clone())
            .collect();
        if let Some(bad) = targets.iter().find(|t| !allowed.contains(*t)) {
            return Err(FlowError::Validation(format!(
                "'{}' is not downstream of '{}'",
                bad, node.node_id
            )));
        }

        let origin = state.path_of(node_instance_id);
        state
            .path_mut(&origin)
            .user_selections
            .insert(node_instance_id.clone(), targets.clone());
        if targets.len() < 2 {
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for target in &targets {
            let child = fork_path(&mut state, &origin)?;
            for n in state.nodes.values_mut() {
                let unclaimed = n.path_id.is_none() || n.path_id.as_deref() == Some(origin.as_str());
                if &n.node_id == target && n.status == NodeStatus::Pending && unclaimed {
                    n.path_id = Some(child.clone());
                }
            }
            created.push(child);
        }
        state.path_mut(&origin).status = PathStatus::Branched;
        info!(
            workflow_instance_id = %self.workflow_instance_id,
            node_instance_id = %node_instance_id,
            paths = created.len(),
            "Execution branched on user selection"
        );
        Ok(created)
    }

    // ── Completion ────────────────────────────────────────────────

    /// Zero Active paths and at least one Completed or Failed path.
    pub async fn is_completed(&self) -> bool {
        let state = self.state.lock().await;
        let paths = state.data.paths.values();
        let mut finished = false;
        for path in paths {
            match path.status {
                PathStatus::Active => return false,
                PathStatus::Completed | PathStatus::Failed => finished = true,
                PathStatus::Branched => {}
            }
        }
        finished
    }

    /// Workflow status implied by the node states, or `None` while any node
    /// is still pending, ready or executing.
    pub async fn terminal_status(&self) -> Option<WorkflowStatus> {
        let state = self.state.lock().await;
        terminal_status_of(&state)
    }

    /// Once nothing can run any more, mark the remaining Pending instances
    /// Skipped and return the terminal status.
    pub async fn finalize(&self) -> Result<Option<WorkflowStatus>> {
        let mut state = self.state.lock().await;
        if state.has_live_work() {
            return Ok(None);
        }
        let leftovers: Vec<NodeInstanceId> = state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Pending)
            .map(|n| n.node_instance_id.clone())
            .collect();
        for id in leftovers {
            let mut row = self.load_row(&id).await?;
            row.status = NodeInstanceStatus::Skipped;
            self.repos.node_instances.update(&row).await?;
            if let Some(node) = state.nodes.get_mut(&id) {
                node.status = NodeStatus::Skipped;
            }
            self.event_bus.publish(EngineEvent::NodeSkipped {
                workflow_instance_id: self.workflow_instance_id.clone(),
                node_instance_id: id,
            });
        }
        state.settle_paths();
        Ok(terminal_status_of(&state))
    }

    // ── Snapshot and recovery ─────────────────────────────────────

    pub async fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock().await;
        ContextSnapshot {
            workflow_instance_id: self.workflow_instance_id.clone(),
            execution_context: state.data.clone(),
            node_dependencies: state.dependencies.clone(),
            node_states: state.nodes.clone(),
            last_updated: Utc::now(),
        }
    }

    /// Replace the in-memory state with a snapshot. Instances that were
    /// Ready when the snapshot was taken go back to the trigger set.
    pub async fn restore(&self, snapshot: ContextSnapshot) -> Result<()> {
        if snapshot.workflow_instance_id != self.workflow_instance_id {
            return Err(FlowError::Snapshot(format!(
                "snapshot of {} cannot restore {}",
                snapshot.workflow_instance_id, self.workflow_instance_id
            )));
        }
        let mut state = self.state.lock().await;
        state.dependencies = snapshot.node_dependencies;
        state.nodes = snapshot.node_states;
        state.data = snapshot.execution_context;
        if !state.data.paths.contains_key(MAIN_PATH) {
            state
                .data
                .paths
                .insert(MAIN_PATH.to_string(), ExecutionPath::main());
        }
        let ready: Vec<NodeInstanceId> = state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Ready)
            .map(|n| n.node_instance_id.clone())
            .collect();
        for id in ready {
            if let Some(node) = state.nodes.get_mut(&id) {
                node.status = NodeStatus::Pending;
            }
            state.refresh_trigger(&id);
        }
        state.settle_paths();
        Ok(())
    }

    /// Re-apply a completion that is already persisted: no repository write
    /// and no loop-back creation.
    pub async fn replay_completion(
        &self,
        node_instance_id: &NodeInstanceId,
        output: Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.node(node_instance_id)?.status == NodeStatus::Completed {
            return Ok(());
        }
        self.apply_completion(&mut state, node_instance_id, output, at, false)
            .await
    }

    /// Rebuild the whole state from persisted node-instance rows.
    ///
    /// Loop instances depend on the instance that triggered them, retries on
    /// what the retried instance depended on, everything else on the root
    /// instances of its static upstream nodes. Completed rows are then replayed
    /// in completion order.
    pub async fn rebuild_from_rows(&self, rows: Vec<NodeInstance>) -> Result<()> {
        let by_id: HashMap<NodeInstanceId, NodeInstance> =
            rows.iter().map(|r| (r.id.clone(), r.clone())).collect();
        let mut roots: HashMap<NodeId, NodeInstanceId> = HashMap::new();
        for row in &rows {
            if row.parent_instance_id.is_none() && row.loop_iteration.is_none() {
                roots.entry(row.node_id.clone()).or_insert_with(|| row.id.clone());
            }
        }

        let mut state = self.state.lock().await;
        state.dependencies.clear();
        state.nodes.clear();
        state.data.pending_triggers.clear();
        state.data.outputs.clear();
        state.data.records.clear();
        state.data.paths.clear();
        state
            .data
            .paths
            .insert(MAIN_PATH.to_string(), ExecutionPath::main());

        for row in &rows {
            let mut node = NodeState::from_instance(row);
            if node.status == NodeStatus::Completed {
                node.status = NodeStatus::Pending;
                node.completed_at = None;
            }
            if let Some(path_id) = &row.execution_path_id {
                let path = state.path_mut(path_id);
                if let Some(iteration) = row.loop_iteration {
                    let count = path.loop_count.entry(row.node_id.clone()).or_insert(0);
                    *count = (*count).max(iteration);
                }
                if node.status == NodeStatus::Executing {
                    path.visited_nodes.insert(row.node_id.clone());
                }
            }
            state.nodes.insert(row.id.clone(), node);
        }
        for row in rows.iter().filter(|r| r.retry_count > 0) {
            if let Some(node) = row
                .parent_instance_id
                .as_ref()
                .and_then(|p| state.nodes.get_mut(p))
            {
                node.retried = true;
            }
        }

        for row in &rows {
            let upstream = rebuild_upstream(row, &by_id, &roots, &self.topology);
            let dep = NodeDependency::new(row.id.clone(), row.node_id.clone(), upstream);
            state.dependencies.insert(row.id.clone(), dep);
        }

        // Failed paths whose failures were all retried are healthy again.
        let unretried_failures: BTreeSet<String> = state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Failed && !n.retried)
            .map(|n| n.path_id.clone().unwrap_or_else(|| MAIN_PATH.into()))
            .collect();
        for path in state.data.paths.values_mut() {
            path.has_failure = unretried_failures.contains(&path.path_id);
        }

        let mut completed: Vec<&NodeInstance> = rows
            .iter()
            .filter(|r| r.status == NodeInstanceStatus::Completed)
            .collect();
        completed.sort_by_key(|r| (r.completed_at, r.created_at));
        for row in completed {
            let output = row.output_data.clone().unwrap_or(Value::Null);
            let at = row.completed_at.unwrap_or(row.created_at);
            self.apply_completion(&mut state, &row.id, output, at, false)
                .await?;
        }

        let ids: Vec<NodeInstanceId> = state.dependencies.keys().cloned().collect();
        for id in ids {
            state.refresh_trigger(&id);
        }
        state.settle_paths();
        Ok(())
    }

    // ── Introspection ─────────────────────────────────────────────

    pub async fn node_state(&self, node_instance_id: &NodeInstanceId) -> Option<NodeState> {
        self.state.lock().await.nodes.get(node_instance_id).cloned()
    }

    pub async fn node_states(&self) -> Vec<NodeState> {
        self.state.lock().await.nodes.values().cloned().collect()
    }

    pub async fn dependency(&self, node_instance_id: &NodeInstanceId) -> Option<NodeDependency> {
        self.state
            .lock()
            .await
            .dependencies
            .get(node_instance_id)
            .cloned()
    }

    /// Instances of a static node, oldest first.
    pub async fn instances_of(&self, node_id: &NodeId) -> Vec<NodeInstanceId> {
        let state = self.state.lock().await;
        let mut found: Vec<&NodeState> = state
            .nodes
            .values()
            .filter(|n| &n.node_id == node_id)
            .collect();
        found.sort_by_key(|n| (n.loop_iteration.unwrap_or(0), n.retry_count));
        found.iter().map(|n| n.node_instance_id.clone()).collect()
    }

    pub async fn completed_nodes(&self) -> BTreeSet<NodeInstanceId> {
        self.state.lock().await.completed_ids()
    }

    pub async fn output_of(&self, node_instance_id: &NodeInstanceId) -> Option<Value> {
        self.state
            .lock()
            .await
            .data
            .outputs
            .get(node_instance_id)
            .cloned()
    }

    pub async fn completed_count(&self) -> usize {
        self.state.lock().await.completed_ids().len()
    }

    pub async fn pending_triggers(&self) -> BTreeSet<NodeInstanceId> {
        self.state.lock().await.data.pending_triggers.clone()
    }

    pub async fn paths(&self) -> Vec<ExecutionPath> {
        self.state.lock().await.data.paths.values().cloned().collect()
    }

    pub async fn records(&self) -> Vec<ExecutionRecord> {
        self.state.lock().await.data.records.clone()
    }

    async fn load_row(&self, id: &NodeInstanceId) -> Result<NodeInstance> {
        self.repos
            .node_instances
            .get(id)
            .await?
            .ok_or_else(|| FlowError::not_found("node instance", id))
    }
}

fn check_node_id(node: &NodeState, node_id: &NodeId) -> Result<()> {
    if &node.node_id != node_id {
        return Err(FlowError::Validation(format!(
            "node instance {} belongs to node '{}', not '{}'",
            node.node_instance_id, node.node_id, node_id
        )));
    }
    Ok(())
}

fn invalid(id: &NodeInstanceId, from: NodeStatus, to: NodeStatus) -> FlowError {
    FlowError::InvalidTransition {
        node_instance_id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Close the open execution record of an instance. Returns false if there
/// was none.
fn finish_record(
    records: &mut [ExecutionRecord],
    id: &NodeInstanceId,
    status: NodeStatus,
    output: Option<Value>,
    at: DateTime<Utc>,
) -> bool {
    match records
        .iter_mut()
        .rev()
        .find(|r| &r.node_instance_id == id && r.finished_at.is_none())
    {
        Some(record) => {
            record.status = status;
            record.output = output;
            record.finished_at = Some(at);
            true
        }
        None => false,
    }
}

fn fork_path(state: &mut ContextState, parent_path_id: &str) -> Result<String> {
    let parent = state
        .data
        .paths
        .get(parent_path_id)
        .ok_or_else(|| FlowError::not_found("execution path", parent_path_id))?;
    let child_id = format!("{}/{}", parent_path_id, &Uuid::new_v4().simple().to_string()[..8]);
    let child = parent.fork(child_id.clone());
    state.data.paths.insert(child_id.clone(), child);
    Ok(child_id)
}

/// Resolve the dependency of every Pending instance of `target` on
/// instances of the source's node. Loop instances only answer to the exact
/// instance that triggered them, so another path's run of the same node
/// leaves them alone. Returns instances that just became dormant.
fn resolve_target(
    state: &mut ContextState,
    source: &NodeState,
    target: &NodeId,
    activated: bool,
    path_id: &str,
) -> Vec<NodeInstanceId> {
    let candidates: Vec<NodeInstanceId> = state
        .dependencies
        .iter()
        .filter(|(id, dep)| {
            &dep.node_id == target
                && state
                    .nodes
                    .get(*id)
                    .is_some_and(|n| n.status == NodeStatus::Pending)
        })
        .map(|(id, _)| id.clone())
        .collect();

    let mut dormant = Vec::new();
    for id in candidates {
        let is_loop = state
            .nodes
            .get(&id)
            .is_some_and(|n| n.loop_iteration.is_some());
        let matching: Vec<NodeInstanceId> = match state.dependencies.get(&id) {
            Some(dep) if is_loop => dep
                .upstream
                .iter()
                .filter(|u| **u == source.node_instance_id)
                .cloned()
                .collect(),
            Some(dep) => dep
                .upstream
                .iter()
                .filter(|u| {
                    state
                        .nodes
                        .get(*u)
                        .is_some_and(|n| n.node_id == source.node_id)
                })
                .cloned()
                .collect(),
            None => continue,
        };
        if matching.is_empty() {
            continue;
        }
        let Some(dep) = state.dependencies.get_mut(&id) else {
            continue;
        };
        let was_dormant = dep.is_dormant();
        for up in &matching {
            dep.resolve(up, activated);
        }
        let now_dormant = dep.is_dormant();

        if activated {
            if let Some(node) = state.nodes.get_mut(&id) {
                node.path_id.get_or_insert_with(|| path_id.to_string());
            }
        }
        if !state.refresh_trigger(&id) && now_dormant && !was_dormant {
            dormant.push(id);
        }
    }
    dormant
}

/// Resolve loop instances of `target` that already exist with `source_id`
/// as their trigger, as when replaying persisted completions.
fn resolve_loop_rows(state: &mut ContextState, source_id: &NodeInstanceId, target: &NodeId) {
    let fed: Vec<NodeInstanceId> = state
        .dependencies
        .iter_mut()
        .filter(|(_, dep)| &dep.node_id == target && dep.upstream.contains(source_id))
        .filter_map(|(id, dep)| dep.resolve(source_id, true).then(|| id.clone()))
        .collect();
    for id in fed {
        state.refresh_trigger(&id);
    }
}

fn terminal_status_of(state: &ContextState) -> Option<WorkflowStatus> {
    let mut cancelled = false;
    let mut failed = false;
    for node in state.nodes.values() {
        match node.status {
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Executing => return None,
            NodeStatus::Cancelled => cancelled = true,
            NodeStatus::Failed if !node.retried => failed = true,
            _ => {}
        }
    }
    if state.nodes.is_empty() {
        return None;
    }
    Some(if cancelled {
        WorkflowStatus::Cancelled
    } else if failed {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Completed
    })
}

fn rebuild_upstream(
    row: &NodeInstance,
    by_id: &HashMap<NodeInstanceId, NodeInstance>,
    roots: &HashMap<NodeId, NodeInstanceId>,
    topology: &Topology,
) -> Vec<NodeInstanceId> {
    let mut current = row;
    // Retry chains are bounded by the number of rows.
    for _ in 0..=by_id.len() {
        if current.loop_iteration.is_some() {
            return current.parent_instance_id.iter().cloned().collect();
        }
        match (&current.parent_instance_id, current.retry_count) {
            (Some(parent), n) if n > 0 => match by_id.get(parent) {
                Some(p) => current = p,
                None => break,
            },
            _ => break,
        }
    }
    topology
        .static_upstream(&row.node_id)
        .iter()
        .filter_map(|pred| roots.get(pred).cloned())
        .collect()
}
