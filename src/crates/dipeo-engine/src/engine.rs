//! Execution engine
//!
//! Drives one diagram execution: seeds the queue with the initially ready
//! nodes, pops nodes as the scheduler admits them, resolves inputs, invokes
//! handlers (with timeout and transient-retry policy), feeds outputs back,
//! and emits ordered domain events. The loop is sequential and
//! deterministic; result application never races.
//!
//! The default failure policy is fail-fast: a node failure aborts the
//! execution. Nodes configured with `continue_on_error` demote the failure
//! to a skip with the error recorded. Cancellation is cooperative and
//! observed at loop boundaries.

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, Result};
use crate::handlers::HandlerRegistry;
use crate::inputs::resolve_inputs;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scheduler::{Readiness, Scheduler};
use dipeo_core::{
    Conversation, DomainEvent, Envelope, EventSink, ExecutableDiagram, ExecutionId,
    HandlerContext, HandlerError, LlmUsage, Node, NodeId, NodeType, Status,
};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many times a node may be reconsidered while waiting for inputs
    /// before the execution fails with dependency starvation.
    pub max_requeue_attempts: u32,
    /// Loop bound applied to nodes that configure no `max_iterations`.
    pub default_iteration_cap: u32,
    /// Per-dispatch time budget; a timed-out handler surfaces as a
    /// distinguishable timeout error.
    pub node_timeout: Option<Duration>,
    /// Retry policy for transient handler failures.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_requeue_attempts: 100,
            default_iteration_cap: 100,
            node_timeout: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Cooperative cancellation flag for a running execution.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one diagram execution.
#[derive(Debug)]
pub struct ExecutionRun {
    pub execution_id: ExecutionId,
    pub status: Status,
    pub outputs: BTreeMap<NodeId, Envelope>,
    pub llm_usage: LlmUsage,
    pub executed_nodes: Vec<NodeId>,
    pub exec_counts: BTreeMap<NodeId, u32>,
    pub error: Option<String>,
}

impl ExecutionRun {
    pub fn output(&self, node_id: &str) -> Option<&Envelope> {
        self.outputs.get(node_id)
    }
}

/// Emits events with a per-execution monotonic sequence number.
struct EventEmitter {
    sink: Arc<dyn EventSink>,
    seq: u64,
}

impl EventEmitter {
    fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink, seq: 0 }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn publish(&self, event: DomainEvent) {
        self.sink.publish(event).await;
    }
}

/// Runs resolved diagrams against a handler registry.
pub struct ExecutionEngine {
    diagram: Arc<ExecutableDiagram>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
}

impl ExecutionEngine {
    pub fn new(
        diagram: Arc<ExecutableDiagram>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            diagram,
            handlers,
            events,
            config: EngineConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle for cancelling this execution from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Execute the diagram to a terminal status under a fresh execution id.
    ///
    /// Runtime failures (node errors, dependency starvation, cancellation)
    /// are reported in the returned [`ExecutionRun`]; `Err` is reserved for
    /// a structurally invalid diagram.
    pub async fn execute(&self, variables: BTreeMap<String, Value>) -> Result<ExecutionRun> {
        self.execute_with_id(Uuid::new_v4().to_string(), variables)
            .await
    }

    /// Execute under a caller-chosen execution id, so observers that track
    /// executions by id (the state store) can be primed beforehand.
    pub async fn execute_with_id(
        &self,
        execution_id: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionRun> {
        self.diagram
            .validate()
            .map_err(ExecutionError::InvalidDiagram)?;
        let mut ctx = ExecutionContext::new(execution_id.clone(), variables);
        let mut scheduler = Scheduler::new(
            self.diagram.clone(),
            self.config.max_requeue_attempts,
            self.config.default_iteration_cap,
        );
        let conversation = Arc::new(RwLock::new(Conversation::default()));
        let mut emitter = EventEmitter::new(self.events.clone());

        info!(execution_id = %execution_id, nodes = self.diagram.node_count(), "execution started");
        let seq = emitter.next_seq();
        emitter
            .publish(DomainEvent::execution_started(
                &execution_id,
                seq,
                self.diagram.id.as_deref(),
            ))
            .await;

        // Execution begins at Start nodes; everything else is reached by
        // traversal, so disconnected nodes never run.
        let start_nodes = self.diagram.start_nodes();
        if start_nodes.is_empty() && self.diagram.node_count() > 0 {
            warn!(execution_id = %execution_id, "diagram has no start nodes");
        }
        let mut queue: VecDeque<NodeId> = start_nodes.into();
        let mut failure: Option<ExecutionError> = None;
        let mut cancelled = false;

        while let Some(node_id) = queue.pop_front() {
            // Loop boundary: drain without dispatching once cancelled.
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            let Some(node) = self.diagram.node(&node_id) else {
                continue;
            };
            let node = node.clone();

            if scheduler.is_skipped(&node_id) {
                continue;
            }

            if scheduler.should_skip(&node_id, ctx.execution_count(&node_id)) {
                debug!(node_id = %node_id, "iteration cap reached, skipping");
                ctx.set_skip_marker(&node_id, Envelope::max_iterations_marker(&node_id));
                let seq = emitter.next_seq();
                emitter
                    .publish(DomainEvent::node_skipped(
                        &execution_id,
                        &node_id,
                        seq,
                        "max_iterations",
                    ))
                    .await;
                scheduler.mark_skipped(&node_id);
                Self::enqueue(&mut queue, scheduler.next_nodes(&node_id));
                continue;
            }

            let edges = match scheduler.check_dependencies(&node_id, &ctx) {
                Readiness::Ready { edges } => edges,
                Readiness::NotReady => {
                    if !scheduler.handle_requeue(&node_id) {
                        failure = Some(ExecutionError::DependencyStarvation {
                            node: node_id.clone(),
                            attempts: scheduler.requeue_attempts(&node_id),
                        });
                        break;
                    }
                    queue.push_back(node_id);
                    continue;
                }
                Readiness::NoValidInputs => {
                    debug!(node_id = %node_id, "no valid incoming edges after branch filtering");
                    continue;
                }
            };

            scheduler.reset_requeue(&node_id);
            let iteration = ctx.increment_execution_count(&node_id);
            let seq = emitter.next_seq();
            emitter
                .publish(DomainEvent::node_started(
                    &execution_id,
                    &node_id,
                    seq,
                    iteration,
                ))
                .await;

            let dispatch = self
                .dispatch(&node, &edges, &ctx, &scheduler, conversation.clone())
                .await;

            match dispatch {
                Ok(envelope) => {
                    if node.node_type == NodeType::Condition {
                        scheduler.record_condition(&node_id, envelope.is_truthy());
                    }
                    let usage = envelope.meta.llm_usage;
                    ctx.set_node_output(&node_id, envelope.clone());

                    let seq = emitter.next_seq();
                    emitter
                        .publish(DomainEvent::node_completed(
                            &execution_id,
                            &node_id,
                            seq,
                            envelope.into(),
                            usage,
                        ))
                        .await;

                    scheduler.mark_completed(&node_id);
                    scheduler.mark_first_only_consumed(&node_id);
                    Self::enqueue(&mut queue, scheduler.next_nodes(&node_id));

                    if node.node_type == NodeType::Endpoint {
                        debug!(node_id = %node_id, "endpoint reached, stopping");
                        break;
                    }
                }
                Err(handler_error) => {
                    let message = handler_error.to_string();
                    warn!(node_id = %node_id, error = %message, "node failed");
                    ctx.set_error(&node_id, message.clone());
                    let seq = emitter.next_seq();
                    emitter
                        .publish(DomainEvent::node_error(
                            &execution_id, &node_id, seq, &message,
                        ))
                        .await;

                    if node.continue_on_error() {
                        ctx.set_skip_marker(
                            &node_id,
                            Envelope::error_body(node_id.as_str(), message.clone()),
                        );
                        let seq = emitter.next_seq();
                        emitter
                            .publish(DomainEvent::node_skipped(
                                &execution_id,
                                &node_id,
                                seq,
                                "error",
                            ))
                            .await;
                        scheduler.mark_skipped(&node_id);
                        Self::enqueue(&mut queue, scheduler.next_nodes(&node_id));
                    } else {
                        failure = Some(ExecutionError::node_failed(&node_id, handler_error));
                        break;
                    }
                }
            }
        }

        if self.cancel.load(Ordering::SeqCst) {
            cancelled = true;
        }

        let (status, error) = if let Some(failure) = failure {
            let summary = failure.summary();
            let seq = emitter.next_seq();
            emitter
                .publish(DomainEvent::execution_failed(&execution_id, seq, &summary))
                .await;
            (Status::Failed, Some(summary))
        } else if cancelled {
            (Status::Aborted, None)
        } else {
            (Status::Completed, None)
        };

        let seq = emitter.next_seq();
        emitter
            .publish(DomainEvent::execution_completed(
                &execution_id,
                seq,
                status,
                error.as_deref(),
            ))
            .await;
        info!(execution_id = %execution_id, %status, elapsed_ms = ctx.elapsed_ms() as u64, "execution finished");

        let summary = ctx.summary();
        Ok(ExecutionRun {
            execution_id,
            status,
            llm_usage: summary.llm_usage,
            executed_nodes: summary.execution_order,
            exec_counts: ctx.execution_counts().clone(),
            outputs: ctx.into_outputs(),
            error,
        })
    }

    /// Resolve inputs and invoke the node's handler under the timeout and
    /// retry policy.
    async fn dispatch(
        &self,
        node: &Node,
        edges: &[dipeo_core::Edge],
        ctx: &ExecutionContext,
        scheduler: &Scheduler,
        conversation: Arc<RwLock<Conversation>>,
    ) -> std::result::Result<Envelope, HandlerError> {
        let inputs = resolve_inputs(&node.id, edges, ctx)?;

        let handler = self
            .handlers
            .get(node.node_type)
            .ok_or_else(|| HandlerError::Fatal(format!("no handler for {}", node.node_type)))?;

        let handler_ctx = HandlerContext {
            execution_id: &ctx.execution_id,
            variables: ctx.variables(),
            exec_counts: ctx.execution_counts(),
            iteration_caps: scheduler.iteration_caps(),
            node_outputs: ctx.node_outputs(),
            upstream: edges.iter().map(|e| e.source.clone()).collect(),
            llm_usage: ctx.llm_usage(),
            conversation,
        };

        let timeout = self.config.node_timeout;
        retry_with_backoff(&self.config.retry, &node.id, || {
            let fut = handler.handle(node, &inputs, &handler_ctx);
            async move {
                match timeout {
                    Some(budget) => tokio::time::timeout(budget, fut).await.map_err(|_| {
                        HandlerError::Timeout(format!("exceeded {}ms", budget.as_millis()))
                    })?,
                    None => fut.await,
                }
            }
        })
        .await
    }

    fn enqueue(queue: &mut VecDeque<NodeId>, next: Vec<NodeId>) {
        for node_id in next {
            if !queue.contains(&node_id) {
                queue.push_back(node_id);
            }
        }
    }
}
