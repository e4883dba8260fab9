use std::time::Duration;

use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, warn};

use weft_core::{AgentInvoker, InvocationError, InvocationRequest, InvocationResponse};

/// Header carrying `sha256=<hex>` of the request body when the agent has a secret.
pub const SIGNATURE_HEADER: &str = "X-Weft-Signature";

const AGENT_HEADER: &str = "X-Weft-Agent";

/// HMAC-SHA256 of `body` keyed by `secret`, formatted for [`SIGNATURE_HEADER`].
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// POSTs the effective input as JSON to the agent's endpoint.
pub struct HttpAgentInvoker {
    http: Client,
}

impl HttpAgentInvoker {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for HttpAgentInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentInvoker for HttpAgentInvoker {
    fn invoke(
        &self,
        request: InvocationRequest,
    ) -> BoxFuture<'_, std::result::Result<InvocationResponse, InvocationError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&request.payload)
                .map_err(|e| InvocationError::MalformedBody(e.to_string()))?;

            let mut req = self
                .http
                .post(&request.endpoint)
                .timeout(Duration::from_millis(request.timeout_ms))
                .header(CONTENT_TYPE, "application/json")
                .header(AGENT_HEADER, request.agent_id.as_str());

            if let Some(ref secret) = request.signing_secret {
                match sign_body(secret, &body) {
                    Some(signature) => req = req.header(SIGNATURE_HEADER, signature),
                    None => warn!(agent_id = %request.agent_id, "Could not sign request body"),
                }
            }

            let response = req.body(body).send().await.map_err(|e| {
                if e.is_timeout() {
                    InvocationError::Timeout {
                        after_ms: request.timeout_ms,
                    }
                } else {
                    InvocationError::Connection(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    InvocationError::Timeout {
                        after_ms: request.timeout_ms,
                    }
                } else {
                    InvocationError::Connection(e.to_string())
                }
            })?;

            debug!(
                agent_id = %request.agent_id,
                status,
                bytes = body.len(),
                "Agent responded"
            );
            Ok(InvocationResponse { status, body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn request(endpoint: String, secret: Option<&str>) -> InvocationRequest {
        InvocationRequest {
            agent_id: "summarizer".into(),
            endpoint,
            payload: json!({"text": "hello"}),
            signing_secret: secret.map(str::to_string),
            timeout_ms: 2000,
        }
    }

    #[test]
    fn signature_is_stable_hex() {
        let a = sign_body("secret", b"{}").unwrap();
        let b = sign_body("secret", b"{}").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
        assert_ne!(a, sign_body("other", b"{}").unwrap());
    }

    #[tokio::test]
    async fn posts_signed_json() {
        let mut server = Server::new_async().await;
        let body = serde_json::to_vec(&json!({"text": "hello"})).unwrap();
        let signature = sign_body("s3cret", &body).unwrap();
        let mock = server
            .mock("POST", "/summarizer")
            .match_header("content-type", "application/json")
            .match_header(SIGNATURE_HEADER, signature.as_str())
            .match_body(Matcher::Json(json!({"text": "hello"})))
            .with_status(200)
            .with_body(r#"{"summary":"hi"}"#)
            .create_async()
            .await;

        let invoker = HttpAgentInvoker::new();
        let response = invoker
            .invoke(request(format!("{}/summarizer", server.url()), Some("s3cret")))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"summary":"hi"}"#);
    }

    #[tokio::test]
    async fn unsigned_without_secret() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/summarizer")
            .match_header(SIGNATURE_HEADER, Matcher::Missing)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let response = HttpAgentInvoker::new()
            .invoke(request(format!("{}/summarizer", server.url()), None))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "boom");
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let err = HttpAgentInvoker::new()
            .invoke(request("http://127.0.0.1:1/summarizer".into(), None))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
