//! Mocks and fixtures shared by Weft's unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::{
    AgentInvoker, GenerativeRequest, GenerativeTransformer, InvocationError, InvocationRequest,
    InvocationResponse, Result, WeftError,
};

pub mod fixtures {
    use weft_core::{AgentDescriptor, CatalogSnapshot, FieldType, SchemaDescriptor, TrustTier};

    pub const SUMMARIZER: &str = "summarizer";
    pub const TRANSLATOR: &str = "translator";
    pub const SENTIMENT: &str = "sentiment";
    pub const PUBLISHER: &str = "publisher";

    pub const SUMMARIZER_PRICE: f64 = 0.01;
    pub const TRANSLATOR_PRICE: f64 = 0.02;
    pub const SENTIMENT_PRICE: f64 = 0.005;
    pub const PUBLISHER_PRICE: f64 = 0.03;

    fn agent(
        base_url: &str,
        id: &str,
        input: SchemaDescriptor,
        output: SchemaDescriptor,
        price: f64,
    ) -> AgentDescriptor {
        AgentDescriptor {
            id: id.to_string(),
            name: Some(id.to_string()),
            input_schema: input,
            output_schema: output,
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), id),
            price,
            trust: TrustTier::Verified,
            signing_secret: None,
        }
    }

    /// `{text}` -> `{summary}`
    pub fn summarizer(base_url: &str) -> AgentDescriptor {
        agent(
            base_url,
            SUMMARIZER,
            SchemaDescriptor::new().required("text", FieldType::String),
            SchemaDescriptor::new().required("summary", FieldType::String),
            SUMMARIZER_PRICE,
        )
    }

    /// `{text, target}` -> `{translated, target}`
    pub fn translator(base_url: &str) -> AgentDescriptor {
        agent(
            base_url,
            TRANSLATOR,
            SchemaDescriptor::new()
                .required("text", FieldType::String)
                .required("target", FieldType::String),
            SchemaDescriptor::new()
                .required("translated", FieldType::String)
                .required("target", FieldType::String),
            TRANSLATOR_PRICE,
        )
    }

    /// `{text}` -> `{sentiment, score}`
    pub fn sentiment(base_url: &str) -> AgentDescriptor {
        agent(
            base_url,
            SENTIMENT,
            SchemaDescriptor::new().required("text", FieldType::String),
            SchemaDescriptor::new()
                .required("sentiment", FieldType::String)
                .required("score", FieldType::Number),
            SENTIMENT_PRICE,
        )
    }

    /// `{translated, target}` -> `{url}`
    pub fn publisher(base_url: &str) -> AgentDescriptor {
        agent(
            base_url,
            PUBLISHER,
            SchemaDescriptor::new()
                .required("translated", FieldType::String)
                .required("target", FieldType::String),
            SchemaDescriptor::new().required("url", FieldType::String),
            PUBLISHER_PRICE,
        )
    }

    pub fn agents(base_url: &str) -> Vec<AgentDescriptor> {
        vec![
            summarizer(base_url),
            translator(base_url),
            sentiment(base_url),
            publisher(base_url),
        ]
    }

    pub fn catalog(base_url: &str) -> CatalogSnapshot {
        CatalogSnapshot::new(agents(base_url))
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Response(InvocationResponse),
    Error(InvocationError),
}

/// Scripted [`AgentInvoker`] keyed by agent id.
///
/// Queued replies are consumed first; after that the agent's standing reply
/// is used. Agents with neither get a 404.
#[derive(Default)]
pub struct MockInvoker {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: Mutex<HashMap<String, Reply>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<InvocationRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts one invocation as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `agent_id` with HTTP 200 and `body`.
    pub fn reply(self, agent_id: &str, body: Value) -> Self {
        self.reply_raw(agent_id, 200, &body.to_string())
    }

    /// Always answer `agent_id` with the given status and raw body.
    pub fn reply_raw(self, agent_id: &str, status: u16, body: &str) -> Self {
        self.standing.lock().unwrap().insert(
            agent_id.to_string(),
            Reply::Response(InvocationResponse {
                status,
                body: body.to_string(),
            }),
        );
        self
    }

    /// Always fail `agent_id` with `error`.
    pub fn fail(self, agent_id: &str, error: InvocationError) -> Self {
        self.standing
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), Reply::Error(error));
        self
    }

    /// Fail the next call to `agent_id` once, then fall back to its standing reply.
    pub fn fail_once(self, agent_id: &str, error: InvocationError) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .push_back(Reply::Error(error));
        self
    }

    /// Hold every call to `agent_id` for `delay` before answering.
    pub fn delay(self, agent_id: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<InvocationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, agent_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .count()
    }

    /// Most invocations that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, agent_id: &str) -> Reply {
        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(agent_id)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.standing
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| {
                Reply::Response(InvocationResponse {
                    status: 404,
                    body: format!("no script for {}", agent_id),
                })
            })
    }
}

impl AgentInvoker for MockInvoker {
    fn invoke(
        &self,
        request: InvocationRequest,
    ) -> BoxFuture<'_, std::result::Result<InvocationResponse, InvocationError>> {
        Box::pin(async move {
            let agent_id = request.agent_id.clone();
            self.calls.lock().unwrap().push(request);
            let _running = InFlight::enter(&self.in_flight, &self.peak_in_flight);
            let delay = self.delays.lock().unwrap().get(&agent_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_reply(&agent_id) {
                Reply::Response(r) => Ok(r),
                Reply::Error(e) => Err(e),
            }
        })
    }
}

/// [`GenerativeTransformer`] that always produces the same value.
pub struct MockGenerator {
    output: std::result::Result<Value, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last: Mutex<Option<GenerativeRequest>>,
}

impl MockGenerator {
    pub fn returning(output: Value) -> Self {
        Self {
            output: Ok(output),
            delay: None,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            output: Err(message.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerativeRequest> {
        self.last.lock().unwrap().clone()
    }
}

impl GenerativeTransformer for MockGenerator {
    fn generate(&self, request: GenerativeRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.output.clone().map_err(WeftError::Generative)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(agent_id: &str) -> InvocationRequest {
        InvocationRequest {
            agent_id: agent_id.into(),
            endpoint: format!("http://agents.test/{}", agent_id),
            payload: json!({}),
            signing_secret: None,
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn queued_failure_then_standing_reply() {
        let invoker = MockInvoker::new()
            .reply("a", json!({"ok": true}))
            .fail_once("a", InvocationError::Connection("reset".into()));

        assert!(invoker.invoke(request("a")).await.is_err());
        let second = invoker.invoke(request("a")).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(invoker.call_count("a"), 2);

        let unknown = invoker.invoke(request("b")).await.unwrap();
        assert_eq!(unknown.status, 404);
    }

    #[test]
    fn fixture_endpoints_follow_base_url() {
        let catalog = fixtures::catalog("http://agents.test/");
        assert_eq!(
            catalog.get(fixtures::SUMMARIZER).unwrap().endpoint,
            "http://agents.test/summarizer"
        );
        assert_eq!(catalog.agents.len(), 4);
    }
}
