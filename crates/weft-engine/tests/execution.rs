use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use weft_core::{
    ChainDefinition, Classification, Edge, ErrorKind, FieldType, GraphNode, InvocationError,
    MergePolicy, NodeKind, NodeStatus, Provenance, RunSink, RunStatus, SchemaDescriptor,
    StaticCatalog, TransformSpec, WeftConfig,
};
use weft_engine::{Engine, MemoryRunStore, RunOptions};
use weft_test_utils::{fixtures, MockGenerator, MockInvoker};

fn test_config() -> WeftConfig {
    let mut config = WeftConfig::default();
    config.engine.retry_backoff_ms = 1;
    config.engine.agent_timeout_secs = 5;
    config
}

fn engine_with(
    invoker: Arc<MockInvoker>,
    generator: Option<Arc<MockGenerator>>,
) -> (Engine, Arc<MemoryRunStore>) {
    engine_from(test_config(), invoker, generator)
}

fn engine_from(
    config: WeftConfig,
    invoker: Arc<MockInvoker>,
    generator: Option<Arc<MockGenerator>>,
) -> (Engine, Arc<MemoryRunStore>) {
    let store = Arc::new(MemoryRunStore::new());
    let mut builder = Engine::builder(config)
        .catalog(Arc::new(StaticCatalog::new(fixtures::agents("http://agents.test"))))
        .invoker(invoker)
        .sink(store.clone());
    if let Some(generator) = generator {
        builder = builder.generator(generator);
    }
    (builder.build().unwrap(), store)
}

fn summarize_then_translate() -> ChainDefinition {
    ChainDefinition {
        id: Some("summarize-translate".into()),
        nodes: vec![
            GraphNode::input("in", json!("a long article about rivers")),
            GraphNode::agent("sum", fixtures::SUMMARIZER),
            GraphNode::agent("tr", fixtures::TRANSLATOR).with_parameter("target", json!("es")),
        ],
        edges: vec![Edge::new("in", "sum"), Edge::new("sum", "tr")],
        ..Default::default()
    }
}

fn healthy_agents() -> MockInvoker {
    MockInvoker::new()
        .reply(fixtures::SUMMARIZER, json!({"summary": "rivers flow"}))
        .reply(fixtures::TRANSLATOR, json!({"translated": "los ríos fluyen", "target": "es"}))
}

#[tokio::test]
async fn linear_chain_succeeds_with_provenance() {
    let invoker = Arc::new(healthy_agents());
    let (engine, store) = engine_with(invoker.clone(), None);

    let run = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    assert_eq!(run.node_results.len(), 3);
    assert_eq!(run.transforms.len(), 2);

    let tr = run.node_result("tr").unwrap();
    assert_eq!(tr.input, json!({"text": "rivers flow", "target": "es"}));
    assert!(matches!(
        tr.provenance.get("text"),
        Some(Provenance::Upstream { node_id, method: Classification::Deterministic, .. }) if node_id == "sum"
    ));
    assert_eq!(tr.provenance.get("target"), Some(&Provenance::Parameter));

    let expected = fixtures::SUMMARIZER_PRICE + fixtures::TRANSLATOR_PRICE;
    assert!((run.total_cost - expected).abs() < 1e-9);
    assert_eq!(invoker.call_count(fixtures::TRANSLATOR), 1);

    let persisted = store.load_run(run.id.clone()).await.unwrap().unwrap();
    assert_eq!(persisted, run);
}

#[tokio::test]
async fn failed_agent_halts_downstream() {
    let invoker = Arc::new(
        MockInvoker::new()
            .reply_raw(fixtures::SUMMARIZER, 500, "internal error")
            .reply(fixtures::TRANSLATOR, json!({"translated": "x", "target": "es"})),
    );
    let (engine, store) = engine_with(invoker.clone(), None);

    let run = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::AgentInvocation);
    assert_eq!(error.node_id.as_deref(), Some("sum"));

    let sum = run.node_result("sum").unwrap();
    assert_eq!(sum.status, NodeStatus::Failed);
    assert_eq!(sum.attempts, 1);
    assert!(run.node_result("tr").is_none());
    assert_eq!(invoker.call_count(fixtures::TRANSLATOR), 0);
    assert_eq!(run.total_cost, 0.0);

    let persisted = store.load_run(run.id.clone()).await.unwrap().unwrap();
    assert_eq!(persisted, run);
}

#[tokio::test]
async fn transient_failure_is_retried_once() {
    let invoker = Arc::new(
        healthy_agents().fail_once(fixtures::SUMMARIZER, InvocationError::Connection("reset".into())),
    );
    let (engine, _) = engine_with(invoker.clone(), None);

    let run = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.node_result("sum").unwrap().attempts, 2);
    assert_eq!(invoker.call_count(fixtures::SUMMARIZER), 2);
}

#[tokio::test]
async fn persistent_transient_failure_gives_up_after_two_attempts() {
    let invoker = Arc::new(
        healthy_agents().fail(fixtures::SUMMARIZER, InvocationError::Timeout { after_ms: 5000 }),
    );
    let (engine, _) = engine_with(invoker.clone(), None);

    let run = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.node_result("sum").unwrap().attempts, 2);
    assert_eq!(invoker.call_count(fixtures::SUMMARIZER), 2);
}

#[tokio::test]
async fn non_critical_failure_skips_only_descendants() {
    let mut mapping = weft_core::FieldMapping::new();
    mapping.insert(
        "text",
        weft_core::FieldSource::field("sentiment", weft_core::MatchKind::Exact),
    );
    let chain = ChainDefinition {
        nodes: vec![
            GraphNode::input("in", json!({"text": "great news", "target": "fr"})),
            GraphNode::agent("sent", fixtures::SENTIMENT).non_critical(),
            GraphNode {
                id: "label".into(),
                kind: NodeKind::Transform {
                    method: TransformSpec::Mapping { mapping },
                    target_schema: Some(SchemaDescriptor::new().required("text", FieldType::String)),
                },
                critical: true,
                position: None,
            },
            GraphNode::agent("tr", fixtures::TRANSLATOR),
        ],
        edges: vec![
            Edge::new("in", "sent"),
            Edge::new("sent", "label"),
            Edge::new("in", "tr"),
        ],
        ..Default::default()
    };
    let invoker = Arc::new(
        MockInvoker::new()
            .reply_raw(fixtures::SENTIMENT, 503, "unavailable")
            .reply(fixtures::TRANSLATOR, json!({"translated": "bonne nouvelle", "target": "fr"})),
    );
    let (engine, _) = engine_with(invoker, None);

    let run = engine.execute(chain, RunOptions::default()).await;

    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    assert_eq!(run.node_result("sent").unwrap().status, NodeStatus::Failed);
    assert!(run.node_result("label").is_none());
    assert_eq!(run.node_result("tr").unwrap().status, NodeStatus::Succeeded);
}

fn merge_chain(policy: MergePolicy) -> ChainDefinition {
    let target = SchemaDescriptor::new()
        .required("a", FieldType::Number)
        .required("b", FieldType::Number);
    ChainDefinition {
        nodes: vec![
            GraphNode::input("p1", json!({"a": 1})),
            GraphNode::input("p2", json!({"a": 2, "b": 3})),
            GraphNode {
                id: "m".into(),
                kind: NodeKind::Transform {
                    method: TransformSpec::Auto,
                    target_schema: Some(target),
                },
                critical: true,
                position: None,
            },
        ],
        edges: vec![
            Edge::new("p1", "m").with_priority(10).with_merge(policy),
            Edge::new("p2", "m").with_priority(1).with_merge(policy),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn authoritative_merge_prefers_higher_priority() {
    let (engine, _) = engine_with(Arc::new(MockInvoker::new()), None);

    let run = engine
        .execute(merge_chain(MergePolicy::Authoritative), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    let m = run.node_result("m").unwrap();
    assert_eq!(m.output, Some(json!({"a": 1, "b": 3})));
    assert!(matches!(
        m.provenance.get("a"),
        Some(Provenance::Upstream { node_id, .. }) if node_id == "p1"
    ));
    assert!(matches!(
        m.provenance.get("b"),
        Some(Provenance::Upstream { node_id, .. }) if node_id == "p2"
    ));
}

#[tokio::test]
async fn strict_merge_conflict_fails_the_node() {
    let (engine, _) = engine_with(Arc::new(MockInvoker::new()), None);

    let run = engine
        .execute(merge_chain(MergePolicy::Strict), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.node_result("m").unwrap().error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::MergeConflict);
}

fn sentiment_to_translator() -> ChainDefinition {
    ChainDefinition {
        nodes: vec![
            GraphNode::input("in", json!("what a day")),
            GraphNode::agent("sent", fixtures::SENTIMENT),
            GraphNode::agent("tr", fixtures::TRANSLATOR),
        ],
        edges: vec![Edge::new("in", "sent"), Edge::new("sent", "tr")],
        ..Default::default()
    }
}

#[tokio::test]
async fn generative_edge_needs_confirmation() {
    let invoker = Arc::new(
        MockInvoker::new()
            .reply(fixtures::SENTIMENT, json!({"sentiment": "positive", "score": 0.9}))
            .reply(fixtures::TRANSLATOR, json!({"translated": "quel jour", "target": "fr"})),
    );
    let generator = Arc::new(MockGenerator::returning(
        json!({"text": "what a day", "target": "fr"}),
    ));
    let (engine, _) = engine_with(invoker.clone(), Some(generator.clone()));

    let denied = engine
        .execute(sentiment_to_translator(), RunOptions::default())
        .await;
    assert_eq!(denied.status, RunStatus::Failed);
    assert_eq!(denied.error.as_ref().unwrap().kind, ErrorKind::Compatibility);
    assert_eq!(generator.calls(), 0);
    assert_eq!(invoker.call_count(fixtures::TRANSLATOR), 0);

    let options = RunOptions {
        confirmed_edges: ["sent->tr".to_string()].into(),
        ..Default::default()
    };
    let run = engine.execute(sentiment_to_translator(), options).await;
    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    assert_eq!(generator.calls(), 1);

    let record = run.transforms.iter().find(|t| t.edge_id == "sent->tr").unwrap();
    assert_eq!(record.method, Classification::Generative);
    let expected = fixtures::SENTIMENT_PRICE
        + fixtures::TRANSLATOR_PRICE
        + WeftConfig::default().pricing.generative_cost;
    assert!((run.total_cost - expected).abs() < 1e-9);
}

#[tokio::test]
async fn invalid_chain_is_a_failed_run_without_results() {
    let (engine, store) = engine_with(Arc::new(healthy_agents()), None);
    let mut chain = summarize_then_translate();
    chain.edges.push(Edge::new("tr", "sum"));

    let run = engine.execute(chain, RunOptions::default()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Validation);
    assert!(run.node_results.is_empty());
    assert_eq!(store.load_run(run.id.clone()).await.unwrap().unwrap(), run);
}

#[tokio::test]
async fn cancellation_keeps_recorded_results() {
    let invoker = Arc::new(healthy_agents().delay(fixtures::SUMMARIZER, Duration::from_secs(10)));
    let (engine, _) = engine_with(invoker, None);

    let run_id = engine
        .submit(summarize_then_translate(), RunOptions::default())
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.cancel(&run_id).await);

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.is_active(&run_id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let run = engine.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(run.node_result("in").is_some());
    assert!(run.node_result("sum").is_none());
    assert!(!engine.cancel(&run_id).await);
}

#[tokio::test]
async fn runs_are_listed_newest_first() {
    let (engine, _) = engine_with(Arc::new(healthy_agents()), None);
    let first = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;

    let listed = engine.list_runs(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
}

async fn wait_until_inactive(engine: &Engine, run_id: &weft_core::RunId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.is_active(run_id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn cancellation_keeps_transforms_of_interrupted_node() {
    let invoker = Arc::new(
        MockInvoker::new()
            .reply(fixtures::SENTIMENT, json!({"sentiment": "positive", "score": 0.9}))
            .reply(fixtures::TRANSLATOR, json!({"translated": "quel jour", "target": "fr"}))
            .delay(fixtures::TRANSLATOR, Duration::from_secs(10)),
    );
    let generator = Arc::new(MockGenerator::returning(
        json!({"text": "what a day", "target": "fr"}),
    ));
    let (engine, store) = engine_with(invoker.clone(), Some(generator.clone()));
    let options = RunOptions {
        confirm_all_generative: true,
        ..Default::default()
    };

    let run_id = engine.submit(sentiment_to_translator(), options).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while invoker.call_count(fixtures::TRANSLATOR) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(engine.cancel(&run_id).await);
    wait_until_inactive(&engine, &run_id).await;

    let run = store.load_run(run_id.clone()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(run.node_result("tr").is_none());
    assert_eq!(generator.calls(), 1);

    let record = run.transforms.iter().find(|t| t.edge_id == "sent->tr").unwrap();
    assert_eq!(record.method, Classification::Generative);
    assert!(record.succeeded);

    let expected = fixtures::SENTIMENT_PRICE + WeftConfig::default().pricing.generative_cost;
    assert!((run.total_cost - expected).abs() < 1e-9, "{}", run.total_cost);
}

#[tokio::test]
async fn cancelling_clears_pending_confirmations() {
    let invoker = Arc::new(
        MockInvoker::new().reply(fixtures::SENTIMENT, json!({"sentiment": "positive", "score": 0.9})),
    );
    let generator = Arc::new(MockGenerator::returning(
        json!({"text": "what a day", "target": "fr"}),
    ));
    let (engine, store) = engine_with(invoker, Some(generator.clone()));
    let options = RunOptions {
        interactive: true,
        ..Default::default()
    };

    let run_id = engine.submit(sentiment_to_translator(), options).await;
    let broker = engine.broker();
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.pending_requests().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(engine.cancel(&run_id).await);
    wait_until_inactive(&engine, &run_id).await;

    assert!(broker.pending_requests().await.is_empty());
    assert_eq!(generator.calls(), 0);
    let run = store.load_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    let record = run.transforms.iter().find(|t| t.edge_id == "sent->tr").unwrap();
    assert_eq!(record.method, Classification::Incompatible);
    assert_eq!(record.cost, 0.0);
}

#[tokio::test]
async fn moderator_bridges_to_agent_with_parameters() {
    let moderated = ChainDefinition {
        id: Some("moderated".into()),
        nodes: vec![
            GraphNode::input("in", json!("a long article about rivers")),
            GraphNode::agent("sum", fixtures::SUMMARIZER),
            GraphNode::transform("fix", TransformSpec::Auto),
            GraphNode::agent("tr", fixtures::TRANSLATOR).with_parameter("target", json!("es")),
        ],
        edges: vec![Edge::new("in", "sum"), Edge::new("sum", "fix"), Edge::new("fix", "tr")],
        ..Default::default()
    };
    let (engine, _) = engine_with(Arc::new(healthy_agents()), None);

    let direct = engine
        .execute(summarize_then_translate(), RunOptions::default())
        .await;
    let run = engine.execute(moderated, RunOptions::default()).await;

    assert_eq!(direct.status, RunStatus::Succeeded, "{:?}", direct.error);
    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
    assert_eq!(run.node_result("fix").unwrap().output, Some(json!({"text": "rivers flow"})));

    let tr = run.node_result("tr").unwrap();
    assert_eq!(tr.input, json!({"text": "rivers flow", "target": "es"}));
    assert_eq!(tr.provenance.get("target"), Some(&Provenance::Parameter));
    assert_eq!(run.transforms.len(), 3);
    assert!(run.transforms.iter().all(|t| t.succeeded && t.cost == 0.0));
}

fn fan_out(width: usize) -> ChainDefinition {
    let mut nodes = vec![GraphNode::input("in", json!("a long article about rivers"))];
    let mut edges = Vec::new();
    for i in 0..width {
        let id = format!("sum{}", i);
        nodes.push(GraphNode::agent(id.clone(), fixtures::SUMMARIZER));
        edges.push(Edge::new("in", id));
    }
    ChainDefinition {
        id: Some("fan-out".into()),
        nodes,
        edges,
        ..Default::default()
    }
}

#[tokio::test]
async fn siblings_run_concurrently_within_the_parallel_limit() {
    for (limit, expected_peak) in [(2, 2), (4, 4)] {
        let invoker = Arc::new(
            healthy_agents().delay(fixtures::SUMMARIZER, Duration::from_millis(150)),
        );
        let mut config = test_config();
        config.engine.max_parallel_nodes = limit;
        let (engine, _) = engine_from(config, invoker.clone(), None);

        let run = engine.execute(fan_out(4), RunOptions::default()).await;

        assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
        assert_eq!(run.node_results.len(), 5);
        assert_eq!(invoker.call_count(fixtures::SUMMARIZER), 4);
        assert_eq!(invoker.peak_in_flight(), expected_peak, "max_parallel_nodes = {}", limit);
    }
}
