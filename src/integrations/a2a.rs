//! A2A 客户端
//!
//! 以 JSON-RPC 2.0 `message/send` 向远程 Agent 发送一条只含文本 part 的用户消息。
//! 回复可能是 Message（result.parts）或 Task（result.artifacts[].parts / result.status.message.parts），
//! 取其中全部文本 part 拼接为输出。

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::RemoteAgentError;
use crate::integrations::RemoteAgent;

/// JSON-RPC 请求体
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'static str,
    params: SendParams<'a>,
}

#[derive(Debug, Serialize)]
struct SendParams<'a> {
    message: A2aMessage<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct A2aMessage<'a> {
    kind: &'static str,
    role: &'static str,
    message_id: String,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    kind: &'static str,
    text: &'a str,
}

/// 基于 HTTP 的 A2A 远程 Agent
pub struct A2aClient {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl A2aClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteAgentError {
        if e.is_timeout() {
            RemoteAgentError::Timeout {
                agent: self.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            RemoteAgentError::Unreachable {
                agent: self.name.clone(),
                reason: e.to_string(),
            }
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> RemoteAgentError {
        RemoteAgentError::InvalidResponse {
            agent: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// 解析 JSON-RPC 响应体：error → RemoteFailure；Task 失败状态 → RemoteFailure；否则提取文本
    fn parse_response(&self, body: &Value) -> Result<String, RemoteAgentError> {
        if let Some(err) = body.get("error") {
            let reason = err
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| err.to_string());
            return Err(RemoteAgentError::RemoteFailure {
                agent: self.name.clone(),
                reason,
            });
        }
        let result = body
            .get("result")
            .ok_or_else(|| self.invalid("missing result"))?;

        let state = result
            .pointer("/status/state")
            .and_then(Value::as_str)
            .unwrap_or("completed");
        let status_text = result
            .pointer("/status/message/parts")
            .map(collect_text)
            .unwrap_or_default();
        if matches!(state, "failed" | "rejected" | "canceled") {
            let reason = if status_text.is_empty() {
                format!("task {state}")
            } else {
                status_text
            };
            return Err(RemoteAgentError::RemoteFailure {
                agent: self.name.clone(),
                reason,
            });
        }

        let mut text = result.get("parts").map(collect_text).unwrap_or_default();
        if text.is_empty() {
            if let Some(artifacts) = result.get("artifacts").and_then(Value::as_array) {
                text = artifacts
                    .iter()
                    .filter_map(|a| a.get("parts"))
                    .map(collect_text)
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
        }
        if text.is_empty() {
            text = status_text;
        }
        if text.is_empty() {
            return Err(self.invalid("no text parts in result"));
        }
        Ok(text)
    }
}

fn collect_text(parts: &Value) -> String {
    parts
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("kind").and_then(Value::as_str).unwrap_or("text") == "text")
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[async_trait]
impl RemoteAgent for A2aClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, input: &str) -> Result<String, RemoteAgentError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: uuid::Uuid::new_v4().to_string(),
            method: "message/send",
            params: SendParams {
                message: A2aMessage {
                    kind: "message",
                    role: "user",
                    message_id: uuid::Uuid::new_v4().to_string(),
                    parts: vec![TextPart {
                        kind: "text",
                        text: input,
                    }],
                },
            },
        };

        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(RemoteAgentError::Unreachable {
                agent: self.name.clone(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RemoteAgentError::RemoteFailure {
                agent: self.name.clone(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let body: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                self.invalid(e.to_string())
            }
        })?;
        self.parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(url: &str, timeout_ms: u64) -> A2aClient {
        A2aClient::new("ResearchAgent", url, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_send_message_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "jsonrpc": "2.0",
                "method": "message/send",
                "params": {"message": {"role": "user", "parts": [{"kind": "text", "text": "rash, no fever"}]}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "1",
                "result": {"kind": "message", "role": "agent", "parts": [
                    {"kind": "text", "text": "See a "},
                    {"kind": "text", "text": "dermatologist."}
                ]}
            })))
            .mount(&server)
            .await;

        let out = client(&server.uri(), 2000).send("rash, no fever").await.unwrap();
        assert_eq!(out, "See a dermatologist.");
    }

    #[tokio::test]
    async fn test_task_artifacts_are_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "1",
                "result": {
                    "kind": "task",
                    "status": {"state": "completed"},
                    "artifacts": [{"parts": [{"kind": "text", "text": "Dr. Lee, Austin TX"}]}]
                }
            })))
            .mount(&server)
            .await;

        let out = client(&server.uri(), 2000).send("find providers").await.unwrap();
        assert_eq!(out, "Dr. Lee, Austin TX");
    }

    #[tokio::test]
    async fn test_jsonrpc_error_is_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "1",
                "error": {"code": -32000, "message": "LLM selection is required."}
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 2000).send("x").await.unwrap_err();
        assert_eq!(
            err,
            RemoteAgentError::RemoteFailure {
                agent: "ResearchAgent".to_string(),
                reason: "LLM selection is required.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_task_is_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "1",
                "result": {"kind": "task", "status": {"state": "failed", "message": {
                    "parts": [{"kind": "text", "text": "No Serper API Key Provided"}]
                }}}
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 2000).send("x").await.unwrap_err();
        assert!(!err.is_unreachable());
        assert!(err.to_string().contains("No Serper API Key Provided"));
    }

    #[tokio::test]
    async fn test_slow_agent_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({"jsonrpc": "2.0", "id": "1", "result": {"parts": []}})),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri(), 50).send("x").await.unwrap_err();
        assert!(matches!(err, RemoteAgentError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let err = client("http://127.0.0.1:9", 500).send("x").await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_empty_result_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": "1", "result": {"kind": "message", "parts": []}
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 2000).send("x").await.unwrap_err();
        assert!(matches!(err, RemoteAgentError::InvalidResponse { .. }));
    }
}
