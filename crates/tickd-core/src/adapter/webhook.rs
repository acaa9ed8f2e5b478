//! Generic real-mode integration: POST the action to a configured URL.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{proof, ActionAdapter, AdapterError, ExecutionOutput, ExecutionRequest};
use crate::config::WebhookTarget;
use crate::control::Mode;
use crate::error::{Result, TickdError};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct WebhookAdapter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAdapter {
    pub fn new(target: &WebhookTarget) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(target.timeout_ms))
            .build()
            .map_err(|e| TickdError::Config(format!("webhook client for {}: {e}", target.url)))?;
        Ok(Self {
            client,
            url: target.url.clone(),
        })
    }
}

fn classify_send_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() {
        AdapterError::transient(format!("webhook request failed: {err}"))
    } else if err.is_builder() {
        AdapterError::permanent(format!("webhook request invalid: {err}"))
    } else {
        AdapterError::unknown(format!("webhook request failed: {err}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> AdapterError {
    let message = if body.is_empty() {
        format!("webhook returned {status}")
    } else {
        let snippet: String = body.chars().take(200).collect();
        format!("webhook returned {status}: {snippet}")
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AdapterError::transient(message)
    } else {
        AdapterError::permanent(message)
    }
}

#[async_trait]
impl ActionAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        mode: Mode,
    ) -> std::result::Result<ExecutionOutput, AdapterError> {
        if mode == Mode::Proof {
            return Ok(proof::synthesize(request));
        }

        let response = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_send_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let artifact: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        let artifact_ref = artifact
            .get("artifact_ref")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("http:{}", status.as_u16()));
        tracing::debug!(action_id = %request.action_id, %status, artifact_ref = %artifact_ref, "webhook delivered");
        Ok(ExecutionOutput {
            artifact_ref,
            content_hash: None,
            artifact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::adapter::ErrorKind;
    use serde_json::json;
    use uuid::Uuid;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            action_id: Uuid::new_v4(),
            action_type: ActionType::Webhook,
            idempotency_key: "order-17".into(),
            payload: json!({"event": "shipped"}),
        }
    }

    fn adapter(url: String) -> WebhookAdapter {
        WebhookAdapter::new(&WebhookTarget {
            url,
            timeout_ms: 2_000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn success_uses_artifact_ref_from_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("idempotency-key", "order-17")
            .match_body(mockito::Matcher::PartialJson(json!({
                "action_type": "WEBHOOK",
                "payload": {"event": "shipped"}
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"artifact_ref":"evt_991"}"#)
            .create_async()
            .await;

        let out = adapter(format!("{}/hook", server.url()))
            .execute(&request(), Mode::Real)
            .await
            .unwrap();
        assert_eq!(out.artifact_ref, "evt_991");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn success_without_body_falls_back_to_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(204)
            .create_async()
            .await;

        let out = adapter(format!("{}/hook", server.url()))
            .execute(&request(), Mode::Real)
            .await
            .unwrap();
        assert_eq!(out.artifact_ref, "http:204");
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/busy").with_status(503).create_async().await;
        server.mock("POST", "/slow-down").with_status(429).create_async().await;

        for path in ["/busy", "/slow-down"] {
            let err = adapter(format!("{}{path}", server.url()))
                .execute(&request(), Mode::Real)
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Transient, "{path}");
        }
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(422)
            .with_body("missing field 'event'")
            .create_async()
            .await;

        let err = adapter(format!("{}/hook", server.url()))
            .execute(&request(), Mode::Real)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permanent);
        assert!(err.message.contains("missing field"));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = adapter(format!("http://127.0.0.1:{port}/hook"))
            .execute(&request(), Mode::Real)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn proof_mode_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .expect(0)
            .create_async()
            .await;

        let out = adapter(format!("{}/hook", server.url()))
            .execute(&request(), Mode::Proof)
            .await
            .unwrap();
        assert!(out.artifact_ref.starts_with(proof::ARTIFACT_PREFIX));
        mock.assert_async().await;
    }
}
