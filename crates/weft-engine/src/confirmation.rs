use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::{ConfirmationDecision, ConfirmationRequest, EngineEvent, EventBus, RunId};

/// Holds generative-transform confirmations until someone answers them.
///
/// Requests are published on the event bus; the CLI prompt or the HTTP
/// interface answers through [`ConfirmationBroker::respond`].
pub struct ConfirmationBroker {
    pending: Mutex<HashMap<String, (ConfirmationRequest, oneshot::Sender<ConfirmationDecision>)>>,
    event_bus: Arc<EventBus>,
}

impl ConfirmationBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request and publish it. Await the receiver for the answer.
    pub async fn request(&self, req: ConfirmationRequest) -> oneshot::Receiver<ConfirmationDecision> {
        let (tx, rx) = oneshot::channel();
        let id = req.id.clone();
        // Insert before publishing so a subscriber can answer immediately
        self.pending.lock().await.insert(id, (req.clone(), tx));
        self.event_bus
            .publish(EngineEvent::ConfirmationRequested { request: req });
        rx
    }

    /// Request and wait, treating a timeout, a dropped responder or a cancelled
    /// run as a denial. The pending entry never outlives the wait.
    pub async fn ask(
        &self,
        req: ConfirmationRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ConfirmationDecision {
        let id = req.id.clone();
        let rx = self.request(req).await;
        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                info!(request_id = %id, "Confirmation abandoned, run cancelled");
                ConfirmationDecision::Denied {
                    reason: "run cancelled".into(),
                }
            }
            answer = tokio::time::timeout(timeout, rx) => match answer {
                Ok(Ok(decision)) => return decision,
                Ok(Err(_)) => ConfirmationDecision::Denied {
                    reason: "confirmation channel closed".into(),
                },
                Err(_) => {
                    warn!(request_id = %id, "Confirmation timed out");
                    ConfirmationDecision::Denied {
                        reason: format!("no answer within {}s", timeout.as_secs()),
                    }
                }
            },
        };
        self.pending.lock().await.remove(&id);
        decision
    }

    /// Drop every pending request of a run. Their waiters see a denial.
    pub async fn discard_run(&self, run_id: &RunId) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, (req, _)| &req.run_id != run_id);
        before - pending.len()
    }

    /// Answer a pending request. Returns true if it was found.
    pub async fn respond(&self, request_id: &str, decision: ConfirmationDecision) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        let Some((_req, tx)) = entry else {
            return false;
        };
        info!(
            request_id,
            approved = matches!(decision, ConfirmationDecision::Approved),
            "Confirmation resolved"
        );
        self.event_bus.publish(EngineEvent::ConfirmationResolved {
            request_id: request_id.to_string(),
            decision: decision.clone(),
        });
        // Receiver may already be gone after a timeout
        let _ = tx.send(decision);
        true
    }

    pub async fn pending_requests(&self) -> Vec<ConfirmationRequest> {
        let mut pending: Vec<_> = self
            .pending
            .lock()
            .await
            .values()
            .map(|(req, _)| req.clone())
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending
    }

    /// Resolve a short id prefix to a full pending id.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        self.pending
            .lock()
            .await
            .keys()
            .find(|k| k.starts_with(prefix))
            .cloned()
    }
}
