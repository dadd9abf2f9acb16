use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use flowline_core::config::EngineConfig;
use flowline_core::error::{FlowError, Result};
use flowline_core::event::{EngineEvent, EventBus, ListenerId};
use flowline_core::traits::{AgentTaskService, Repositories, TaskCompletionListener};
use flowline_core::types::{
    Assignee, NodeId, NodeInstance, NodeInstanceId, NodeInstanceStatus, NodeKind, SubmitStatus,
    TaskId, TaskInstance, TaskStatus, TaskType, WorkflowId, WorkflowInstance, WorkflowInstanceId,
    WorkflowStatus,
};

use crate::graph::{ExecutionContext, NodeStatus, ReadyNode, Topology};
use crate::registry::ContextRegistry;

type TaskOutcome = std::result::Result<Value, String>;

/// Turns ready nodes into dispatched work and task outcomes back into
/// graph progress.
///
/// Every operation that touches an instance's graph runs under that
/// instance's registry lock.
pub struct Orchestrator {
    repos: Repositories,
    registry: Arc<ContextRegistry>,
    agents: Arc<dyn AgentTaskService>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    /// Timeout watchdogs for in-flight agent tasks. Dropping the sender
    /// disarms the watchdog.
    watchdogs: Mutex<HashMap<TaskId, oneshot::Sender<()>>>,
    listener: std::sync::Mutex<Option<ListenerId>>,
    this: Weak<Self>,
}

impl Orchestrator {
    /// Build the orchestrator and subscribe it to the agent service.
    pub fn new(
        repos: Repositories,
        registry: Arc<ContextRegistry>,
        agents: Arc<dyn AgentTaskService>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let orchestrator = Arc::new_cyclic(|this| Self {
            repos,
            registry,
            agents,
            event_bus,
            config,
            watchdogs: Mutex::new(HashMap::new()),
            listener: std::sync::Mutex::new(None),
            this: this.clone(),
        });
        let id = orchestrator.agents.subscribe(orchestrator.clone());
        if let Ok(mut listener) = orchestrator.listener.lock() {
            *listener = Some(id);
        }
        orchestrator
    }

    /// Unsubscribe from the agent service. Returns false if already detached.
    pub fn detach(&self) -> bool {
        let id = self.listener.lock().ok().and_then(|mut l| l.take());
        match id {
            Some(id) => self.agents.unsubscribe(id),
            None => false,
        }
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    // ── Instance lifecycle ────────────────────────────────────────

    /// Create a workflow instance and run it until it waits on tasks.
    ///
    /// The instance row and one node-instance row per node are written
    /// first; dependency registration and the first advance follow under
    /// the instance lock. A failure in the second phase fails the instance.
    pub async fn start_workflow(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        input: Value,
        context_data: Value,
    ) -> Result<WorkflowInstanceId> {
        let topology = Topology::load(self.repos.nodes.as_ref(), workflow_id).await?;
        if !topology.nodes().any(|n| n.kind == NodeKind::Start) {
            return Err(FlowError::Validation(format!(
                "workflow '{}' has no start node",
                workflow_id
            )));
        }

        let now = Utc::now();
        let mut instance = WorkflowInstance::new(workflow_id.clone(), name, input, context_data);
        instance.status = WorkflowStatus::Running;
        instance.started_at = Some(now);
        self.repos.workflow_instances.create(&instance).await?;

        let mut rows = Vec::new();
        for node in topology.nodes() {
            let row = NodeInstance::new(instance.id.clone(), node.id.clone());
            self.repos.node_instances.create(&row).await?;
            rows.push(row);
        }
        info!(
            workflow_instance_id = %instance.id,
            workflow_id = %workflow_id,
            nodes = rows.len(),
            "Workflow instance created"
        );

        let lock = self.registry.lock_for(&instance.id);
        let _guard = lock.lock().await;
        if let Err(e) = self.activate(&instance, topology, &rows).await {
            error!(workflow_instance_id = %instance.id, error = %e, "Workflow activation failed");
            self.fail_instance(&instance.id, &e.to_string()).await;
            return Err(e);
        }
        Ok(instance.id)
    }

    async fn activate(
        &self,
        instance: &WorkflowInstance,
        topology: Topology,
        rows: &[NodeInstance],
    ) -> Result<()> {
        let roots: HashMap<&NodeId, &NodeInstanceId> =
            rows.iter().map(|r| (&r.node_id, &r.id)).collect();
        let ctx = self.registry.create(instance, topology).await?;
        for row in rows {
            ctx.track_instance(row).await;
        }
        for row in rows {
            let upstream = ctx
                .topology()
                .static_upstream(&row.node_id)
                .iter()
                .filter_map(|p| roots.get(p).map(|id| (*id).clone()))
                .collect();
            ctx.register_dependencies(&row.id, &row.node_id, upstream)
                .await?;
        }
        self.event_bus.publish(EngineEvent::WorkflowStarted {
            workflow_instance_id: instance.id.clone(),
        });
        self.advance(&ctx).await?;
        self.registry.persist(&ctx).await
    }

    /// Re-activate every non-terminal instance, e.g. after a restart.
    /// Returns how many were resumed. Failures are logged per instance.
    pub async fn resume_active_instances(&self) -> Result<usize> {
        let active = self.repos.workflow_instances.list_active().await?;
        let mut resumed = 0;
        for instance in active {
            match self.resume_instance(instance).await {
                Ok(()) => resumed += 1,
                Err(e) => error!(error = %e, "Failed to resume workflow instance"),
            }
        }
        info!(resumed, "Active workflow instances resumed");
        Ok(resumed)
    }

    async fn resume_instance(&self, mut instance: WorkflowInstance) -> Result<()> {
        let lock = self.registry.lock_for(&instance.id);
        let _guard = lock.lock().await;
        let ctx = self.registry.get_or_create(&instance.id).await?;
        if instance.status == WorkflowStatus::Pending {
            instance.status = WorkflowStatus::Running;
            instance.started_at.get_or_insert_with(Utc::now);
            instance.updated_at = Utc::now();
            self.repos.workflow_instances.update(&instance).await?;
        }

        // Agent work in flight before the restart gets a fresh deadline.
        for node in ctx.node_states().await {
            if node.status != NodeStatus::Executing {
                continue;
            }
            for task in self
                .repos
                .tasks
                .list_for_node_instance(&node.node_instance_id)
                .await?
            {
                if task.task_type == TaskType::Agent && !task.status.is_terminal() {
                    self.arm_watchdog(task.id.clone()).await;
                }
            }
        }

        if instance.status == WorkflowStatus::Paused {
            debug!(workflow_instance_id = %instance.id, "Instance is paused, not advancing");
            return Ok(());
        }
        info!(workflow_instance_id = %instance.id, "Resuming workflow instance");
        self.advance(&ctx).await
    }

    pub async fn pause_workflow(&self, id: &WorkflowInstanceId) -> Result<bool> {
        let lock = self.registry.lock_for(id);
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(id).await?;
        match instance.status {
            WorkflowStatus::Running | WorkflowStatus::Pending => {}
            WorkflowStatus::Paused => return Ok(false),
            other => {
                return Err(FlowError::Validation(format!(
                    "cannot pause a {} workflow",
                    other
                )))
            }
        }
        instance.status = WorkflowStatus::Paused;
        instance.updated_at = Utc::now();
        self.repos.workflow_instances.update(&instance).await?;
        info!(workflow_instance_id = %id, "Workflow paused");
        Ok(true)
    }

    /// Un-pause and dispatch whatever became ready meanwhile.
    pub async fn resume_workflow(&self, id: &WorkflowInstanceId) -> Result<bool> {
        let lock = self.registry.lock_for(id);
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(id).await?;
        if instance.status != WorkflowStatus::Paused {
            return Ok(false);
        }
        instance.status = WorkflowStatus::Running;
        instance.updated_at = Utc::now();
        self.repos.workflow_instances.update(&instance).await?;
        info!(workflow_instance_id = %id, "Workflow resumed");

        let ctx = self.registry.get_or_create(id).await?;
        self.advance(&ctx).await?;
        Ok(true)
    }

    // ── Task outcomes ─────────────────────────────────────────────

    /// Complete a human task on behalf of `actor`. `selections` records the
    /// downstream nodes the user chose for `user_choice` edges.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        actor: &str,
        output: Value,
        selections: Option<Vec<NodeId>>,
    ) -> Result<bool> {
        let task = self.load_task(task_id).await?;
        authorize(&task, actor)?;
        self.finish_task(task_id, Ok(output), selections).await
    }

    pub async fn fail_task(&self, task_id: &TaskId, actor: &str, error: &str) -> Result<bool> {
        let task = self.load_task(task_id).await?;
        authorize(&task, actor)?;
        self.finish_task(task_id, Err(error.to_string()), None).await
    }

    /// Apply a task outcome to its node and advance the graph. Outcomes for
    /// tasks that already finished or were cancelled are ignored.
    async fn finish_task(
        &self,
        task_id: &TaskId,
        outcome: TaskOutcome,
        selections: Option<Vec<NodeId>>,
    ) -> Result<bool> {
        let task = self.load_task(task_id).await?;
        let lock = self.registry.lock_for(&task.workflow_instance_id);
        let _guard = lock.lock().await;

        let mut task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            info!(task_id = %task_id, status = %task.status, "Outcome for finished task ignored");
            return Ok(false);
        }
        let instance = self.load_instance(&task.workflow_instance_id).await?;
        if instance.status.is_terminal() {
            info!(task_id = %task_id, "Outcome for task of finished workflow ignored");
            self.cancel_task_row(&mut task).await?;
            return Ok(false);
        }

        let ctx = self.registry.get_or_create(&task.workflow_instance_id).await?;
        let node_instance_id = task.node_instance_id.clone();
        let node_id = self.load_node_row(&node_instance_id).await?.node_id;
        if let Some(targets) = selections {
            ctx.handle_user_path_selection(&node_instance_id, targets)
                .await?;
        }

        self.disarm(task_id).await;
        let now = Utc::now();
        match &outcome {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                task.output_data = Some(output.clone());
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                task.error_message = Some(error.clone());
            }
        }
        task.completed_at = Some(now);
        self.repos.tasks.update(&task).await?;

        let siblings = self.open_tasks_of(&node_instance_id).await?;
        match outcome {
            Ok(output) => {
                for mut sibling in siblings {
                    self.cancel_task_row(&mut sibling).await?;
                }
                info!(task_id = %task_id, node_instance_id = %node_instance_id, "Task completed");
                if let Err(e) = ctx.mark_completed(&node_id, &node_instance_id, output).await {
                    self.fail_node(&ctx, &node_id, &node_instance_id, &e.to_string())
                        .await;
                }
            }
            Err(error) if siblings.is_empty() => {
                warn!(task_id = %task_id, error = %error, "Task failed");
                self.fail_node(&ctx, &node_id, &node_instance_id, &error).await;
            }
            Err(error) => {
                info!(
                    task_id = %task_id,
                    error = %error,
                    open = siblings.len(),
                    "Task failed, node still has open tasks"
                );
            }
        }

        self.advance(&ctx).await?;
        Ok(true)
    }

    /// Boxed: the watchdog spawned by `arm_watchdog` ends up back here
    /// through `finish_task`, and the cycle needs a concrete `Send` type.
    fn expire_task(&self, task_id: TaskId, timeout: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.watchdogs.lock().await.remove(&task_id);
            let error = FlowError::Timeout {
                task_id: task_id.to_string(),
                timeout_secs: timeout.as_secs(),
            };
            warn!(task_id = %task_id, "Agent task timed out");
            if let Err(e) = self.finish_task(&task_id, Err(error.to_string()), None).await {
                error!(task_id = %task_id, error = %e, "Failed to expire task");
            }
        })
    }

    async fn arm_watchdog(&self, task_id: TaskId) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let (tx, rx) = oneshot::channel::<()>();
        self.watchdogs.lock().await.insert(task_id.clone(), tx);
        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, rx).await.is_err() {
                this.expire_task(task_id, timeout).await;
            }
        });
    }

    async fn disarm(&self, task_id: &TaskId) {
        if self.watchdogs.lock().await.remove(task_id).is_some() {
            debug!(task_id = %task_id, "Watchdog disarmed");
        }
    }

    // ── Cancellation ──────────────────────────────────────────────

    /// Cancel a task. A node left without open tasks is cancelled with it.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<bool> {
        let task = self.load_task(task_id).await?;
        let lock = self.registry.lock_for(&task.workflow_instance_id);
        let _guard = lock.lock().await;

        let mut task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        self.cancel_task_row(&mut task).await?;
        let ctx = self.registry.get_or_create(&task.workflow_instance_id).await?;
        if self.open_tasks_of(&task.node_instance_id).await?.is_empty() {
            self.cancel_node_locked(&ctx, &task.node_instance_id).await?;
        }
        self.advance(&ctx).await?;
        Ok(true)
    }

    /// Cancel a node instance and its non-terminal descendants. Returns the
    /// cancelled instances.
    pub async fn cancel_node(&self, node_instance_id: &NodeInstanceId) -> Result<Vec<NodeInstanceId>> {
        let row = self.load_node_row(node_instance_id).await?;
        let lock = self.registry.lock_for(&row.workflow_instance_id);
        let _guard = lock.lock().await;

        let ctx = self.registry.get_or_create(&row.workflow_instance_id).await?;
        let cancelled = self.cancel_node_locked(&ctx, node_instance_id).await?;
        self.advance(&ctx).await?;
        Ok(cancelled)
    }

    async fn cancel_node_locked(
        &self,
        ctx: &Arc<ExecutionContext>,
        node_instance_id: &NodeInstanceId,
    ) -> Result<Vec<NodeInstanceId>> {
        let mut cancelled = Vec::new();
        if ctx.mark_cancelled(node_instance_id).await? {
            cancelled.push(node_instance_id.clone());
        }
        cancelled.extend(ctx.cancel_descendants(node_instance_id).await?);
        for id in &cancelled {
            for mut task in self.open_tasks_of(id).await? {
                self.cancel_task_row(&mut task).await?;
            }
        }
        info!(
            workflow_instance_id = %ctx.workflow_instance_id(),
            node_instance_id = %node_instance_id,
            cancelled = cancelled.len(),
            "Node cancelled"
        );
        Ok(cancelled)
    }

    /// Cancel every open node and task and mark the instance Cancelled.
    pub async fn cancel_workflow(&self, id: &WorkflowInstanceId) -> Result<bool> {
        let lock = self.registry.lock_for(id);
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(id).await?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        let ctx = self.registry.get_or_create(id).await?;
        for node_instance_id in ctx.cancel_all().await? {
            for mut task in self.open_tasks_of(&node_instance_id).await? {
                self.cancel_task_row(&mut task).await?;
            }
        }
        let now = Utc::now();
        instance.status = WorkflowStatus::Cancelled;
        instance.completed_at = Some(now);
        instance.updated_at = now;
        self.repos.workflow_instances.update(&instance).await?;
        info!(workflow_instance_id = %id, "Workflow cancelled");
        self.event_bus.publish(EngineEvent::WorkflowFinished {
            workflow_instance_id: id.clone(),
            status: WorkflowStatus::Cancelled,
        });
        self.registry.persist(&ctx).await?;
        Ok(true)
    }

    async fn cancel_task_row(&self, task: &mut TaskInstance) -> Result<()> {
        self.disarm(&task.id).await;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.repos.tasks.update(task).await?;
        debug!(task_id = %task.id, "Task cancelled");
        Ok(())
    }

    // ── Retry ─────────────────────────────────────────────────────

    /// Re-run a failed node instance as a new instance. A failed workflow
    /// goes back to Running.
    pub async fn retry_node(&self, node_instance_id: &NodeInstanceId) -> Result<NodeInstanceId> {
        let row = self.load_node_row(node_instance_id).await?;
        let lock = self.registry.lock_for(&row.workflow_instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(&row.workflow_instance_id).await?;
        if !matches!(
            instance.status,
            WorkflowStatus::Running | WorkflowStatus::Failed
        ) {
            return Err(FlowError::Validation(format!(
                "cannot retry a node of a {} workflow",
                instance.status
            )));
        }
        let ctx = self.registry.get_or_create(&row.workflow_instance_id).await?;
        let retry = ctx.create_retry_instance(node_instance_id).await?;

        if instance.status == WorkflowStatus::Failed {
            instance.status = WorkflowStatus::Running;
            instance.error_message = None;
            instance.completed_at = None;
            instance.updated_at = Utc::now();
            self.repos.workflow_instances.update(&instance).await?;
        }
        info!(
            workflow_instance_id = %instance.id,
            failed = %node_instance_id,
            retry = %retry,
            "Node retry scheduled"
        );
        self.advance(&ctx).await?;
        Ok(retry)
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Open tasks of an instance, in node order.
    pub async fn open_tasks(&self, id: &WorkflowInstanceId) -> Result<Vec<TaskInstance>> {
        let ctx = self.registry.get_or_create(id).await?;
        let mut open = Vec::new();
        for node in ctx.node_states().await {
            if node.status == NodeStatus::Executing {
                open.extend(self.open_tasks_of(&node.node_instance_id).await?);
            }
        }
        Ok(open)
    }

    // ── Graph progress ────────────────────────────────────────────

    /// Dispatch ready nodes until only external work is outstanding, then
    /// check for completion. Callers hold the instance lock.
    async fn advance(&self, ctx: &Arc<ExecutionContext>) -> Result<()> {
        loop {
            let instance = self.load_instance(ctx.workflow_instance_id()).await?;
            if instance.status.is_terminal() {
                return Ok(());
            }
            if instance.status == WorkflowStatus::Paused {
                debug!(workflow_instance_id = %instance.id, "Paused, ready nodes stay queued");
                return Ok(());
            }

            let ready = ctx.get_ready_nodes().await;
            if ready.is_empty() {
                break;
            }
            let mut progressed = false;
            for node in &ready {
                match self.run_ready_node(ctx, &instance, node).await {
                    Ok(moved) => progressed |= moved,
                    Err(e) => {
                        self.fail_node(ctx, &node.node_id, &node.node_instance_id, &e.to_string())
                            .await
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        self.check_completion(ctx).await
    }

    /// Returns true if the graph moved on synchronously.
    async fn run_ready_node(
        &self,
        ctx: &Arc<ExecutionContext>,
        instance: &WorkflowInstance,
        node: &ReadyNode,
    ) -> Result<bool> {
        let id = &node.node_instance_id;
        let row = self.load_node_row(id).await?;
        match row.status {
            NodeInstanceStatus::Pending | NodeInstanceStatus::Waiting => {}
            NodeInstanceStatus::Completed => {
                ctx.mark_completed(&node.node_id, id, row.output_data.unwrap_or(Value::Null))
                    .await?;
                return Ok(true);
            }
            NodeInstanceStatus::Running => {
                debug!(node_instance_id = %id, "Node already running");
                ctx.mark_executing(&node.node_id, id, row.input_data.unwrap_or(Value::Null))
                    .await?;
                return Ok(false);
            }
            NodeInstanceStatus::Failed => {
                let error = row.error_message.unwrap_or_else(|| "failed".to_string());
                ctx.mark_failed(&node.node_id, id, &error).await?;
                return Ok(false);
            }
            NodeInstanceStatus::Cancelled | NodeInstanceStatus::Skipped => {
                ctx.mark_cancelled(id).await?;
                return Ok(false);
            }
        }

        let input = ctx.get_node_execution_context(id).await?;
        match node.kind {
            NodeKind::Start => {
                ctx.mark_executing(&node.node_id, id, input).await?;
                ctx.mark_completed(&node.node_id, id, instance.input_data.clone())
                    .await?;
                Ok(true)
            }
            NodeKind::End => {
                let output = input
                    .get("all_upstream")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                ctx.mark_executing(&node.node_id, id, input).await?;
                ctx.mark_completed(&node.node_id, id, output).await?;
                Ok(true)
            }
            NodeKind::Processor => {
                self.dispatch(ctx, node, input).await?;
                Ok(false)
            }
        }
    }

    /// Create the tasks of a ready processor node.
    async fn dispatch(
        &self,
        ctx: &Arc<ExecutionContext>,
        node: &ReadyNode,
        input: Value,
    ) -> Result<()> {
        let definition = ctx
            .topology()
            .node(&node.node_id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("node", &node.node_id))?;
        let task_type = definition.task_type();
        let binding = definition.processor.clone();
        let agent_id = binding.as_ref().and_then(|b| b.agent_id.clone());
        if matches!(task_type, TaskType::Agent | TaskType::Mixed) && agent_id.is_none() {
            return Err(FlowError::Validation(format!(
                "processor node '{}' has no agent",
                node.node_id
            )));
        }
        if !ctx
            .mark_executing(&node.node_id, &node.node_instance_id, input.clone())
            .await?
        {
            return Ok(());
        }

        let task_input = json!({
            "instructions": binding.as_ref().and_then(|b| b.instructions.clone()),
            "context": input,
        });
        let wfi = ctx.workflow_instance_id();

        if matches!(task_type, TaskType::Human | TaskType::Mixed) {
            let mut task = TaskInstance::new(
                node.node_instance_id.clone(),
                wfi.clone(),
                TaskType::Human,
                definition.name.clone(),
            );
            task.input_data = task_input.clone();
            if let Some(user) = binding.as_ref().and_then(|b| b.user_id.clone()) {
                task.assignee = Some(Assignee::User(user));
                task.status = TaskStatus::Assigned;
            }
            self.repos.tasks.create(&task).await?;
            info!(task_id = %task.id, node_id = %node.node_id, "Human task created");
            self.event_bus.publish(EngineEvent::TaskDispatched {
                workflow_instance_id: wfi.clone(),
                task_id: task.id.clone(),
                task_type: TaskType::Human,
            });
        }

        if let Some(agent_id) = agent_id.filter(|_| task_type != TaskType::Human) {
            let mut task = TaskInstance::new(
                node.node_instance_id.clone(),
                wfi.clone(),
                TaskType::Agent,
                definition.name.clone(),
            );
            task.input_data = task_input;
            task.assignee = Some(Assignee::Agent(agent_id.clone()));
            self.repos.tasks.create(&task).await?;

            match self.agents.submit(&task).await? {
                SubmitStatus::Queued => {
                    task.status = TaskStatus::InProgress;
                    task.started_at = Some(Utc::now());
                    self.repos.tasks.update(&task).await?;
                    info!(task_id = %task.id, agent_id = %agent_id, "Agent task submitted");
                    self.event_bus.publish(EngineEvent::TaskDispatched {
                        workflow_instance_id: wfi.clone(),
                        task_id: task.id.clone(),
                        task_type: TaskType::Agent,
                    });
                    self.arm_watchdog(task.id.clone()).await;
                }
                SubmitStatus::Rejected => {
                    let reason = format!("agent '{}' rejected the task", agent_id);
                    task.status = TaskStatus::Failed;
                    task.error_message = Some(reason.clone());
                    task.completed_at = Some(Utc::now());
                    self.repos.tasks.update(&task).await?;
                    warn!(task_id = %task.id, agent_id = %agent_id, "Agent task rejected");
                    if task_type == TaskType::Agent {
                        self.fail_node(ctx, &node.node_id, &node.node_instance_id, &reason)
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_completion(&self, ctx: &Arc<ExecutionContext>) -> Result<()> {
        if !ctx.is_completed().await {
            return Ok(());
        }
        let Some(status) = ctx.finalize().await? else {
            return Ok(());
        };
        let mut instance = self.load_instance(ctx.workflow_instance_id()).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        let mut outputs = BTreeMap::new();
        let mut first_error = None;
        for node in ctx.node_states().await {
            match node.status {
                NodeStatus::Completed if ctx.topology().kind(&node.node_id) == NodeKind::End => {
                    if let Some(out) = ctx.output_of(&node.node_instance_id).await {
                        outputs.insert(node.node_id.to_string(), out);
                    }
                }
                NodeStatus::Failed if !node.retried && first_error.is_none() => {
                    first_error = node
                        .error
                        .map(|e| format!("node '{}' failed: {}", node.node_id, e));
                }
                _ => {}
            }
        }

        let now = Utc::now();
        instance.status = status;
        instance.output_data = Some(json!(outputs));
        if status == WorkflowStatus::Failed {
            instance.error_message = first_error;
        }
        instance.completed_at = Some(now);
        instance.updated_at = now;
        self.repos.workflow_instances.update(&instance).await?;

        info!(
            workflow_instance_id = %instance.id,
            status = %status,
            "Workflow finished"
        );
        self.event_bus.publish(EngineEvent::WorkflowFinished {
            workflow_instance_id: instance.id.clone(),
            status,
        });
        self.registry.persist(ctx).await
    }

    async fn fail_node(
        &self,
        ctx: &ExecutionContext,
        node_id: &NodeId,
        node_instance_id: &NodeInstanceId,
        error: &str,
    ) {
        if let Err(e) = ctx.mark_failed(node_id, node_instance_id, error).await {
            error!(
                node_instance_id = %node_instance_id,
                error = %e,
                "Could not record node failure"
            );
        }
    }

    async fn fail_instance(&self, id: &WorkflowInstanceId, error: &str) {
        let result = async {
            let mut instance = self.load_instance(id).await?;
            let now = Utc::now();
            instance.status = WorkflowStatus::Failed;
            instance.error_message = Some(error.to_string());
            instance.completed_at = Some(now);
            instance.updated_at = now;
            self.repos.workflow_instances.update(&instance).await
        }
        .await;
        match result {
            Ok(()) => self.event_bus.publish(EngineEvent::WorkflowFinished {
                workflow_instance_id: id.clone(),
                status: WorkflowStatus::Failed,
            }),
            Err(e) => error!(workflow_instance_id = %id, error = %e, "Could not mark workflow failed"),
        }
    }

    async fn open_tasks_of(&self, node_instance_id: &NodeInstanceId) -> Result<Vec<TaskInstance>> {
        Ok(self
            .repos
            .tasks
            .list_for_node_instance(node_instance_id)
            .await?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect())
    }

    async fn load_instance(&self, id: &WorkflowInstanceId) -> Result<WorkflowInstance> {
        self.repos
            .workflow_instances
            .get(id)
            .await?
            .ok_or_else(|| FlowError::not_found("workflow instance", id))
    }

    async fn load_task(&self, id: &TaskId) -> Result<TaskInstance> {
        self.repos
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| FlowError::not_found("task", id))
    }

    async fn load_node_row(&self, id: &NodeInstanceId) -> Result<NodeInstance> {
        self.repos
            .node_instances
            .get(id)
            .await?
            .ok_or_else(|| FlowError::not_found("node instance", id))
    }
}

impl TaskCompletionListener for Orchestrator {
    fn on_task_completed<'a>(&'a self, task_id: &'a TaskId, result: &'a Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.finish_task(task_id, Ok(result.clone()), None).await {
                error!(task_id = %task_id, error = %e, "Failed to apply task completion");
            }
        })
    }

    fn on_task_failed<'a>(&'a self, task_id: &'a TaskId, error: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.finish_task(task_id, Err(error.to_string()), None).await {
                error!(task_id = %task_id, error = %e, "Failed to apply task failure");
            }
        })
    }
}

/// Only the assigned user may finish a human task; unassigned tasks are
/// open to anyone. Agent tasks are finished by the agent service.
fn authorize(task: &TaskInstance, actor: &str) -> Result<()> {
    match &task.assignee {
        None => Ok(()),
        Some(Assignee::User(user)) if user == actor => Ok(()),
        Some(Assignee::User(user)) => Err(FlowError::Authorization(format!(
            "task {} is assigned to '{}', not '{}'",
            task.id, user, actor
        ))),
        Some(Assignee::Agent(agent)) => Err(FlowError::Authorization(format!(
            "task {} belongs to agent '{}'",
            task.id, agent
        ))),
    }
}
