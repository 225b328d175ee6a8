use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use loom_core::{
    ClassifiedError, ClassifiedResult, ErrorKind, HealthRecord, ProviderKind, Request, Response,
    ResponseMeta, Usage,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::auth::build_auth_headers;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Speaks the Anthropic `/v1/messages` wire format.
pub struct AnthropicAdapter {
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl AnthropicAdapter {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            client,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_payload(&self, request: &Request, stream: bool) -> Value {
        let max_tokens = request
            .params
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(1024);
        let mut body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": request.prompt}],
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        for (key, value) in &request.params {
            if key != "max_tokens" {
                obj.insert(key.clone(), value.clone());
            }
        }
        body
    }

    async fn send(&self, request: &Request, stream: bool, deadline: Instant) -> ClassifiedResult<reqwest::Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(loom_core::adapter::timeout_error("anthropic"));
        }
        let mut headers = build_auth_headers(ProviderKind::Anthropic, &self.api_key)
            .map_err(|e| ClassifiedError::new("anthropic", ErrorKind::Auth, e.to_string()))?;
        headers.insert(
            "anthropic-version",
            reqwest::header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        self.client
            .post(self.endpoint())
            .headers(headers)
            .json(&self.build_payload(request, stream))
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| ClassifiedError::new("anthropic", ErrorKind::from(&e), e.to_string()))
    }

    async fn parse_response(&self, request: &Request, http: reqwest::Response) -> ClassifiedResult<Response> {
        let status = http.status();
        let body = http
            .text()
            .await
            .map_err(|e| ClassifiedError::new("anthropic", ErrorKind::Network, e.to_string()))?;

        if !status.is_success() {
            return Err(ClassifiedError::from_status("anthropic", status.as_u16(), body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifiedError::new("anthropic", ErrorKind::Unknown, format!("malformed response: {}", e)))?;

        let content = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| ClassifiedError::new("anthropic", ErrorKind::Unknown, "no text block in response"))?;

        let usage = Usage::new(parsed.usage.input_tokens, parsed.usage.output_tokens);

        Ok(Response {
            content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage,
            meta: ResponseMeta {
                provider: "anthropic".to_string(),
                request_id: request.request_id,
                finish_reason: parsed.stop_reason,
                degraded: false,
                thinking_enabled: None,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl loom_core::Adapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn dispatch(&self, request: &Request, deadline: Instant) -> ClassifiedResult<Response> {
        let http = self.send(request, false, deadline).await?;
        self.parse_response(request, http).await
    }

    async fn stream(
        &self,
        request: &Request,
        deadline: Instant,
    ) -> ClassifiedResult<BoxStream<'static, loom_core::adapter::StreamChunk>> {
        let http = self.send(request, true, deadline).await?;
        let byte_stream = http.bytes_stream();

        let chunks = byte_stream.flat_map(|chunk| {
            let lines: Vec<loom_core::adapter::StreamChunk> = match chunk {
                Ok(bytes) => String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter_map(|line| line.strip_prefix("data: "))
                    .filter_map(|data| serde_json::from_str::<Value>(data).ok())
                    .filter_map(|v| {
                        v.pointer("/delta/text")
                            .and_then(Value::as_str)
                            .map(|s| Ok(s.to_string()))
                    })
                    .collect(),
                Err(e) => vec![Err(ClassifiedError::new("anthropic", ErrorKind::Network, e.to_string()))],
            };
            stream::iter(lines)
        });

        Ok(Box::pin(chunks))
    }

    async fn health_probe(&self, deadline: Instant) -> ClassifiedResult<HealthRecord> {
        let started = Instant::now();
        let probe = Request::new("ping");
        let outcome = self.dispatch(&probe, deadline).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(HealthRecord {
            healthy: outcome.is_ok(),
            last_check: Some(chrono::Utc::now()),
            last_success: outcome.is_ok().then(chrono::Utc::now),
            consecutive_failures: if outcome.is_ok() { 0 } else { 1 },
            rolling_success_rate: if outcome.is_ok() { 1.0 } else { 0.0 },
            avg_latency_ms: latency_ms,
            p95_latency_ms: latency_ms,
            last_error_kind: outcome.err().map(|e| e.kind.to_string()),
        })
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(
            "https://api.anthropic.com/v1",
            "claude-3-5-sonnet-20241022",
            "sk-ant-test",
            Client::new(),
        )
    }

    #[test]
    fn endpoint_appends_messages() {
        assert_eq!(adapter().endpoint(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn build_payload_defaults_max_tokens() {
        let request = Request::new("hi");
        let payload = adapter().build_payload(&request, false);
        assert_eq!(payload["max_tokens"], json!(1024));
    }

    #[test]
    fn build_payload_honors_explicit_max_tokens() {
        let mut request = Request::new("hi");
        request.params.insert("max_tokens".into(), json!(256));
        let payload = adapter().build_payload(&request, false);
        assert_eq!(payload["max_tokens"], json!(256));
    }
}
