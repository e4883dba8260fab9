use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use weft_core::{ChainDefinition, ConfirmationDecision, RunId, SchemaDescriptor, WeftError};
use weft_engine::RunOptions;

use crate::state::AppState;

/// Error body shared by every handler: `{"error": "..."}` with a status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{} not found", what),
        }
    }
}

impl From<WeftError> for ApiError {
    fn from(e: WeftError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/chains/validate
pub async fn validate_chain(
    State(state): State<Arc<AppState>>,
    Json(chain): Json<ChainDefinition>,
) -> (StatusCode, Json<Value>) {
    match state.engine.validate(&chain).await {
        Ok(graph) => (
            StatusCode::OK,
            Json(json!({
                "valid": true,
                "order": graph.order(),
                "catalog_version": graph.catalog_version(),
            })),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "valid": false,
                "error": e.to_string(),
                "node_id": e.node_id(),
                "edge_id": e.edge_id(),
            })),
        ),
    }
}

#[derive(Deserialize)]
pub struct CompatibilityBody {
    pub source: SchemaDescriptor,
    pub target: SchemaDescriptor,
}

// POST /api/compatibility
pub async fn compatibility(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompatibilityBody>,
) -> Json<Value> {
    let result = state.engine.score(&body.source, &body.target);
    Json(json!(result))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    #[default]
    Sync,
    Async,
}

#[derive(Deserialize)]
pub struct SubmitBody {
    pub chain: ChainDefinition,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub mode: SubmitMode,
}

// POST /api/runs
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Response {
    match body.mode {
        SubmitMode::Sync => {
            let run = state.engine.execute(body.chain, body.options).await;
            Json(json!(run)).into_response()
        }
        SubmitMode::Async => {
            let run_id = state.engine.submit(body.chain, body.options).await;
            info!(run_id = %run_id, "Run accepted");
            (StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))).into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/runs?limit=50
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let runs = state.engine.list_runs(q.limit).await?;
    Ok(Json(json!({ "runs": runs })))
}

// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_str(&id);
    match state.engine.load_run(&run_id).await? {
        Some(run) => Ok(Json(json!(run))),
        None => Err(ApiError::not_found(format!("run {}", id))),
    }
}

// GET /api/runs/{id}/transforms
pub async fn run_transforms(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_str(&id);
    match state.engine.load_run(&run_id).await? {
        Some(run) => Ok(Json(json!({ "transforms": run.transforms }))),
        None => Err(ApiError::not_found(format!("run {}", id))),
    }
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_str(&id);
    if state.engine.cancel(&run_id).await {
        Ok(Json(json!({ "run_id": run_id, "cancelled": true })))
    } else {
        Err(ApiError::not_found(format!("active run {}", id)))
    }
}

// GET /api/confirmations
pub async fn list_confirmations(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pending = state.engine.broker().pending_requests().await;
    Json(json!({ "confirmations": pending }))
}

#[derive(Deserialize)]
pub struct AnswerBody {
    pub approve: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

// POST /api/confirmations/{id}; accepts a unique id prefix
pub async fn answer_confirmation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> ApiResult<Json<Value>> {
    let broker = state.engine.broker();
    let request_id = broker
        .find_by_prefix(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("confirmation {}", id)))?;

    let decision = if body.approve {
        ConfirmationDecision::Approved
    } else {
        ConfirmationDecision::Denied {
            reason: body.reason.unwrap_or_else(|| "denied via gateway".into()),
        }
    };

    if !broker.respond(&request_id, decision).await {
        // Timed out between lookup and answer
        warn!(request_id = %request_id, "Confirmation vanished before answer");
        return Err(ApiError::not_found(format!("confirmation {}", id)));
    }
    Ok(Json(json!({ "id": request_id, "approved": body.approve })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use tower::ServiceExt;

    use weft_core::{Edge, GraphNode, StaticCatalog, WeftConfig};
    use weft_engine::Engine;
    use weft_test_utils::{fixtures, MockGenerator, MockInvoker};

    use super::*;
    use crate::server::router;

    fn engine(invoker: MockInvoker) -> Engine {
        let mut config = WeftConfig::default();
        config.engine.retry_backoff_ms = 1;
        Engine::builder(config)
            .catalog(Arc::new(StaticCatalog::new(fixtures::agents("http://agents.test"))))
            .invoker(Arc::new(invoker))
            .generator(Arc::new(MockGenerator::returning(
                json!({"translated": "positivo", "target": "es"}),
            )))
            .build()
            .unwrap()
    }

    fn healthy() -> MockInvoker {
        MockInvoker::new()
            .reply(fixtures::SUMMARIZER, json!({"summary": "rivers flow"}))
            .reply(fixtures::SENTIMENT, json!({"sentiment": "positive", "score": 0.9}))
            .reply(fixtures::TRANSLATOR, json!({"translated": "los ríos", "target": "es"}))
    }

    fn chain() -> Value {
        json!({
            "id": "demo",
            "nodes": [
                {"id": "in", "kind": "input", "value": "a long article"},
                {"id": "sum", "kind": "agent", "agent_id": "summarizer"}
            ],
            "edges": [{"source": "in", "target": "sum"}]
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(engine(healthy()));
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn validate_reports_order_or_error() {
        let app = router(engine(healthy()));
        let (status, body) = call(&app, "POST", "/api/chains/validate", Some(chain())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order"], json!(["in", "sum"]));

        let mut broken = chain();
        broken["nodes"][1]["agent_id"] = json!("ghost");
        let (status, body) = call(&app, "POST", "/api/chains/validate", Some(broken)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["valid"], false);
        assert_eq!(body["node_id"], "sum");
    }

    #[tokio::test]
    async fn compatibility_scores_schemas() {
        let app = router(engine(healthy()));
        let (status, body) = call(
            &app,
            "POST",
            "/api/compatibility",
            Some(json!({"source": {"summary": "string"}, "target": {"text": "string"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["classification"], "deterministic");
    }

    #[tokio::test]
    async fn sync_run_is_returned_and_queryable() {
        let app = router(engine(healthy()));
        let (status, run) = call(&app, "POST", "/api/runs", Some(json!({"chain": chain()}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "succeeded");
        let id = run["id"].as_str().unwrap().to_string();

        let (status, loaded) = call(&app, "GET", &format!("/api/runs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(loaded, run);

        let (_, transforms) =
            call(&app, "GET", &format!("/api/runs/{}/transforms", id), None).await;
        assert_eq!(transforms["transforms"].as_array().unwrap().len(), 1);

        let (_, listed) = call(&app, "GET", "/api/runs?limit=5", None).await;
        assert_eq!(listed["runs"][0]["id"], id.as_str());

        let (status, _) = call(&app, "GET", "/api/runs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn async_run_can_be_cancelled() {
        let invoker = healthy().delay(fixtures::SUMMARIZER, Duration::from_secs(30));
        let app = router(engine(invoker));
        let (status, body) = call(
            &app,
            "POST",
            "/api/runs",
            Some(json!({"chain": chain(), "mode": "async"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["run_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", &format!("/api/runs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);

        let mut run = Value::Null;
        for _ in 0..100 {
            let (status, body) = call(&app, "GET", &format!("/api/runs/{}", id), None).await;
            if status == StatusCode::OK && body["status"] == "failed" {
                run = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(run["error"]["kind"], "cancelled");
    }

    #[tokio::test]
    async fn generative_edge_waits_for_confirmation() {
        let app = router(engine(healthy()));
        let chain = ChainDefinition {
            id: Some("needs-confirmation".into()),
            nodes: vec![
                GraphNode::input("in", json!("great news")),
                GraphNode::agent("sent", fixtures::SENTIMENT),
                GraphNode::agent("pub", fixtures::PUBLISHER),
            ],
            edges: vec![Edge::new("in", "sent"), Edge::new("sent", "pub")],
            ..Default::default()
        };
        let submit = json!({"chain": chain, "mode": "async", "options": {"interactive": true}});
        let (status, _) = call(&app, "POST", "/api/runs", Some(submit)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut pending = Value::Null;
        for _ in 0..100 {
            let (_, body) = call(&app, "GET", "/api/confirmations", None).await;
            if body["confirmations"].as_array().is_some_and(|c| !c.is_empty()) {
                pending = body["confirmations"][0].clone();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pending["edge_id"], "sent->pub");

        let id = pending["id"].as_str().unwrap();
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/confirmations/{}", &id[..8]),
            Some(json!({"approve": false, "reason": "not today"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], false);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/confirmations/{}", id),
            Some(json!({"approve": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
