//! End-to-end execution scenarios
//!
//! Each test builds a resolved diagram, runs it through the engine with the
//! built-in handlers, and asserts on the terminal status, the execution
//! order, and the emitted event stream.

use dipeo_core::{
    Branch, ContentType, EchoLlm, Edge, EventType, ExecutableDiagram, MemorySink, Node, NodeType,
    Status,
};
use dipeo_engine::{EngineConfig, ExecutionEngine, HandlerRegistry};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn build_engine(
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    sink: Arc<MemorySink>,
) -> ExecutionEngine {
    let diagram = Arc::new(ExecutableDiagram::new(Some("test-diagram".into()), nodes, edges));
    let handlers = Arc::new(HandlerRegistry::with_defaults(Arc::new(EchoLlm)));
    ExecutionEngine::new(diagram, handlers, sink)
}

fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Linear chain: the echo job forwards the start payload unchanged.
#[tokio::test]
async fn linear_execution_echoes_start_output() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("b", NodeType::Job),
            Node::new("c", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "b")
                .with_content_type(ContentType::Object)
                .with_label("input"),
            Edge::new("e2", "b", "c")
                .with_content_type(ContentType::Object)
                .with_label("result"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.executed_nodes, vec!["a", "b", "c"]);
    assert_eq!(
        run.output("b").unwrap().body,
        run.output("a").unwrap().body
    );
    assert!(run.error.is_none());
}

fn branch_nodes_and_edges() -> (Vec<Node>, Vec<Edge>) {
    let nodes = vec![
        Node::new("a", NodeType::Start),
        Node::new("b", NodeType::Condition).with_data("expression", json!("x > 0")),
        Node::new("c", NodeType::Job),
        Node::new("d", NodeType::Job),
        Node::new("e", NodeType::Endpoint),
    ];
    let edges = vec![
        Edge::new("e1", "a", "b").with_label("start"),
        Edge::new("e2", "b", "c").with_branch(Branch::True).with_label("t"),
        Edge::new("e3", "b", "d").with_branch(Branch::False).with_label("f"),
        Edge::new("e4", "c", "e").with_label("from_c"),
        Edge::new("e5", "d", "e").with_label("from_d"),
    ];
    (nodes, edges)
}

/// Condition true branch: only the true target runs, the join still fires.
#[tokio::test]
async fn condition_true_branch() {
    let sink = Arc::new(MemorySink::new());
    let (nodes, edges) = branch_nodes_and_edges();
    let engine = build_engine(nodes, edges, sink.clone());

    let run = engine.execute(vars(&[("x", json!(5))])).await.unwrap();

    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.executed_nodes, vec!["a", "b", "c", "e"]);
    assert!(!run.executed_nodes.contains(&"d".to_string()));
    assert!(run.output("d").is_none());
}

/// Same graph, negative input: the false target runs instead.
#[tokio::test]
async fn condition_false_branch() {
    let sink = Arc::new(MemorySink::new());
    let (nodes, edges) = branch_nodes_and_edges();
    let engine = build_engine(nodes, edges, sink.clone());

    let run = engine.execute(vars(&[("x", json!(-1))])).await.unwrap();

    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.executed_nodes, vec!["a", "b", "d", "e"]);
    assert!(!run.executed_nodes.contains(&"c".to_string()));
}

/// Loop with a cap of 3: the loop node runs exactly three times, is skipped
/// once, and the condition's max-iterations exit reaches the endpoint.
#[tokio::test]
async fn loop_with_iteration_cap() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("l", NodeType::PersonJob)
                .with_data("max_iterations", json!(3))
                .with_data("prompt", json!("work")),
            Node::new("b", NodeType::Condition)
                .with_data("condition_type", json!("max_iterations")),
            Node::new("e", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "l").with_label("seed"),
            Edge::new("e2", "l", "b").with_label("iter"),
            Edge::new("e3", "b", "l").with_branch(Branch::False).with_label("again"),
            Edge::new("e4", "b", "e").with_branch(Branch::True).with_label("done"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.exec_counts.get("l"), Some(&3));
    assert!(run.executed_nodes.contains(&"e".to_string()));

    let skipped = sink.of_type(EventType::NodeSkipped);
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].scope.node_id.as_deref(), Some("l"));
    assert_eq!(
        skipped[0].payload.get("reason").and_then(Value::as_str),
        Some("max_iterations")
    );
}

/// First-only seed: the loop starts from the seed edge, then continues via
/// its self edge until the cap. The seed contributes exactly one value.
#[tokio::test]
async fn first_only_seed_starts_self_loop() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("l", NodeType::PersonJob)
                .with_data("max_iterations", json!(3))
                .with_data("prompt", json!("iterate")),
        ],
        vec![
            Edge::new("e1", "a", "l").with_label("seed").first_only(),
            Edge::new("e2", "l", "l").with_label("prev"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.exec_counts.get("l"), Some(&3));
    assert_eq!(sink.of_type(EventType::NodeSkipped).len(), 1);
}

/// Iteration-cap limit holds at every point in the stream: no node ever
/// exceeds its configured cap.
#[tokio::test]
async fn iteration_cap_is_never_exceeded() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("l", NodeType::PersonJob)
                .with_data("max_iterations", json!(2))
                .with_data("prompt", json!("spin")),
        ],
        vec![
            Edge::new("e1", "a", "l").with_label("seed").first_only(),
            Edge::new("e2", "l", "l").with_label("prev"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.exec_counts.get("l"), Some(&2));

    let started = sink.of_type(EventType::NodeStarted);
    let l_starts = started
        .iter()
        .filter(|e| e.scope.node_id.as_deref() == Some("l"))
        .count();
    assert_eq!(l_starts, 2);
}

/// Start straight into an endpoint.
#[tokio::test]
async fn start_to_endpoint() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("start", NodeType::Start),
            Node::new("end", NodeType::Endpoint),
        ],
        vec![Edge::new("e1", "start", "end").with_label("v")],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.executed_nodes, vec!["start", "end"]);
}

/// A node with no path from the start never executes.
#[tokio::test]
async fn unreachable_node_never_executes() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("b", NodeType::Endpoint),
            Node::new("island_src", NodeType::Job),
            Node::new("island", NodeType::Job),
        ],
        vec![
            Edge::new("e1", "a", "b").with_label("v"),
            Edge::new("e2", "island_src", "island").with_label("w"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.executed_nodes, vec!["a", "b"]);
}

/// Dependency monotonicity on a diamond: the join never starts before both
/// feeders completed.
#[tokio::test]
async fn diamond_join_waits_for_both_feeders() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("left", NodeType::Job),
            Node::new("right", NodeType::Job),
            Node::new("join", NodeType::Job),
            Node::new("end", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "left").with_label("v"),
            Edge::new("e2", "a", "right").with_label("v"),
            Edge::new("e3", "left", "join").with_label("l"),
            Edge::new("e4", "right", "join").with_label("r"),
            Edge::new("e5", "join", "end").with_label("j"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Completed);

    let events = sink.events();
    let position = |event_type: EventType, node: &str| {
        events
            .iter()
            .position(|e| {
                e.event_type == event_type && e.scope.node_id.as_deref() == Some(node)
            })
            .unwrap()
    };
    let join_started = position(EventType::NodeStarted, "join");
    assert!(position(EventType::NodeCompleted, "left") < join_started);
    assert!(position(EventType::NodeCompleted, "right") < join_started);
}

/// Priority dependencies order sibling targets of one source.
#[tokio::test]
async fn priority_orders_siblings() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("low", NodeType::Job),
            Node::new("high", NodeType::Job),
        ],
        vec![
            Edge::new("e1", "a", "low").with_label("v").with_priority(1),
            Edge::new("e2", "a", "high").with_label("v").with_priority(9),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.executed_nodes, vec!["a", "high", "low"]);
}

/// Fail-fast: a failing node aborts the execution with a summary naming
/// the node and the error kind.
#[tokio::test]
async fn node_failure_fails_fast() {
    let sink = Arc::new(MemorySink::new());
    // A template job without a template is a validation failure.
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("bad", NodeType::Job).with_data("sub_type", json!("template")),
            Node::new("after", NodeType::Job),
        ],
        vec![
            Edge::new("e1", "a", "bad").with_label("v"),
            Edge::new("e2", "bad", "after").with_label("w"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, Status::Failed);
    let error = run.error.unwrap();
    assert!(error.contains("bad"));
    assert!(error.contains("validation"));
    assert!(!run.executed_nodes.contains(&"after".to_string()));

    assert_eq!(sink.of_type(EventType::NodeError).len(), 1);
    assert_eq!(sink.of_type(EventType::ExecutionFailed).len(), 1);
    let completed = sink.of_type(EventType::ExecutionCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload_status(), Some(Status::Failed));
}

/// continue_on_error demotes the failure to a skip and execution proceeds.
#[tokio::test]
async fn continue_on_error_demotes_to_skip() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("bad", NodeType::Job)
                .with_data("sub_type", json!("template"))
                .with_data("continue_on_error", json!(true)),
            Node::new("after", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "bad").with_label("v"),
            Edge::new("e2", "bad", "after").with_label("w"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, Status::Completed);
    assert!(run.executed_nodes.contains(&"after".to_string()));

    let skipped = sink.of_type(EventType::NodeSkipped);
    assert_eq!(skipped.len(), 1);
    assert_eq!(
        skipped[0].payload.get("reason").and_then(Value::as_str),
        Some("error")
    );
}

/// Cancellation before the run drains the queue without dispatching.
#[tokio::test]
async fn cancellation_aborts_without_dispatch() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("b", NodeType::Job),
            Node::new("c", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "b").with_label("v"),
            Edge::new("e2", "b", "c").with_label("w"),
        ],
        sink.clone(),
    );

    let handle = engine.cancel_handle();
    handle.cancel();
    assert!(handle.is_cancelled());

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Aborted);
    assert!(run.executed_nodes.is_empty());

    let completed = sink.of_type(EventType::ExecutionCompleted);
    assert_eq!(completed[0].payload_status(), Some(Status::Aborted));
}

/// Condition value feeds variable extraction downstream.
#[tokio::test]
async fn variable_in_object_extraction() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("pick", NodeType::Job),
            Node::new("end", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "pick")
                .with_content_type(ContentType::VariableInObject)
                .with_object_key_path("user.name"),
            Edge::new("e2", "pick", "end").with_label("out"),
        ],
        sink.clone(),
    );

    let run = engine
        .execute(vars(&[("user", json!({"name": "ada"}))]))
        .await
        .unwrap();

    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.output("pick").unwrap().as_json(), json!("ada"));
}

/// Events carry the execution id of the run and strictly increasing seq.
#[tokio::test]
async fn event_stream_is_ordered_and_scoped() {
    let sink = Arc::new(MemorySink::new());
    let (nodes, edges) = branch_nodes_and_edges();
    let engine = build_engine(nodes, edges, sink.clone());

    let run = engine
        .execute_with_id("exec-fixed".into(), vars(&[("x", json!(1))]))
        .await
        .unwrap();
    assert_eq!(run.execution_id, "exec-fixed");

    let events = sink.events();
    assert!(events.len() >= 2);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.scope.execution_id, "exec-fixed");
        assert_eq!(event.seq, i as u64 + 1);
    }
    assert_eq!(events[0].event_type, EventType::ExecutionStarted);
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::ExecutionCompleted
    );
}

/// Usage from LLM nodes accumulates into the run totals with
/// `total == input + output`.
#[tokio::test]
async fn llm_usage_accumulates_across_nodes() {
    let sink = Arc::new(MemorySink::new());
    let engine = build_engine(
        vec![
            Node::new("a", NodeType::Start),
            Node::new("p1", NodeType::PersonJob).with_data("prompt", json!("first question")),
            Node::new("p2", NodeType::PersonJob).with_data("prompt", json!("second question")),
            Node::new("end", NodeType::Endpoint),
        ],
        vec![
            Edge::new("e1", "a", "p1").with_label("v"),
            Edge::new("e2", "p1", "p2").with_label("prev"),
            Edge::new("e3", "p2", "end").with_label("out"),
        ],
        sink.clone(),
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Completed);
    assert!(run.llm_usage.total > 0);
    assert_eq!(run.llm_usage.total, run.llm_usage.input + run.llm_usage.output);
}

/// Handler timeouts surface as a distinguishable failure after retries.
#[tokio::test]
async fn handler_timeout_fails_node() {
    use async_trait::async_trait;
    use dipeo_core::{Envelope, HandlerContext, HandlerError, Inputs, NodeHandler};

    struct SlowHandler;

    #[async_trait]
    impl NodeHandler for SlowHandler {
        async fn handle(
            &self,
            node: &Node,
            _inputs: &Inputs,
            _ctx: &HandlerContext<'_>,
        ) -> Result<Envelope, HandlerError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(Envelope::text(&node.id, "too late"))
        }
    }

    let sink = Arc::new(MemorySink::new());
    let diagram = Arc::new(ExecutableDiagram::new(
        None,
        vec![
            Node::new("a", NodeType::Start),
            Node::new("slow", NodeType::Job),
        ],
        vec![Edge::new("e1", "a", "slow").with_label("v")],
    ));
    let mut handlers = HandlerRegistry::with_defaults(Arc::new(EchoLlm));
    handlers.register(NodeType::Job, Arc::new(SlowHandler));

    let engine = ExecutionEngine::new(diagram, Arc::new(handlers), sink.clone()).with_config(
        EngineConfig {
            node_timeout: Some(std::time::Duration::from_millis(20)),
            retry: dipeo_engine::RetryConfig::none(),
            ..EngineConfig::default()
        },
    );

    let run = engine.execute(BTreeMap::new()).await.unwrap();
    assert_eq!(run.status, Status::Failed);
    assert!(run.error.unwrap().contains("timeout"));
}
