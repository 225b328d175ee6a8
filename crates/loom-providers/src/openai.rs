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

/// Speaks the OpenAI `/v1/chat/completions` wire format. Azure OpenAI and
/// DeepSeek both serve compatible responses off the same shape, so one
/// adapter parametrized by base URL and kind covers all three.
pub struct OpenAiCompatibleAdapter {
    kind: ProviderKind,
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(
        kind: ProviderKind,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            client,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_payload(&self, request: &Request, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        for (key, value) in &request.params {
            obj.insert(key.clone(), value.clone());
        }
        if self.kind == ProviderKind::DeepSeek {
            if let Some(Value::Bool(true)) = request.params.get("thinking") {
                obj.insert("thinking".into(), json!({"type": "enabled"}));
            }
        }
        body
    }

    async fn send(&self, request: &Request, stream: bool, deadline: Instant) -> ClassifiedResult<reqwest::Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(loom_core::adapter::timeout_error(&self.provider_name()));
        }
        let headers = build_auth_headers(self.kind, &self.api_key)
            .map_err(|e| ClassifiedError::new(self.provider_name(), ErrorKind::Auth, e.to_string()))?;

        self.client
            .post(self.endpoint())
            .headers(headers)
            .json(&self.build_payload(request, stream))
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| ClassifiedError::new(self.provider_name(), ErrorKind::from(&e), e.to_string()))
    }

    fn provider_name(&self) -> String {
        format!("{:?}", self.kind).to_lowercase()
    }

    async fn parse_response(&self, request: &Request, http: reqwest::Response) -> ClassifiedResult<Response> {
        let status = http.status();
        let body = http
            .text()
            .await
            .map_err(|e| ClassifiedError::new(self.provider_name(), ErrorKind::Network, e.to_string()))?;

        if !status.is_success() {
            return Err(ClassifiedError::from_status(self.provider_name(), status.as_u16(), body));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifiedError::new(self.provider_name(), ErrorKind::Unknown, format!("malformed response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClassifiedError::new(self.provider_name(), ErrorKind::Unknown, "no choices in response"))?;

        let usage = parsed
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| Usage::estimate_from_content(&choice.message.content));

        Ok(Response {
            content: choice.message.content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage,
            meta: ResponseMeta {
                provider: self.provider_name(),
                request_id: request.request_id,
                finish_reason: choice.finish_reason,
                degraded: false,
                thinking_enabled: if self.kind == ProviderKind::DeepSeek {
                    Some(request.params.contains_key("thinking"))
                } else {
                    None
                },
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl loom_core::Adapter for OpenAiCompatibleAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
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
        let provider = self.provider_name();
        let byte_stream = http.bytes_stream();

        let chunks = byte_stream.flat_map(move |chunk| {
            let provider = provider.clone();
            let lines: Vec<loom_core::adapter::StreamChunk> = match chunk {
                Ok(bytes) => String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter_map(|line| line.strip_prefix("data: "))
                    .filter(|data| *data != "[DONE]")
                    .filter_map(|data| serde_json::from_str::<Value>(data).ok())
                    .filter_map(|v| {
                        v.pointer("/choices/0/delta/content")
                            .and_then(Value::as_str)
                            .map(|s| Ok(s.to_string()))
                    })
                    .collect(),
                Err(e) => vec![Err(ClassifiedError::new(provider, ErrorKind::Network, e.to_string()))],
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
    use loom_core::Adapter;

    fn adapter() -> OpenAiCompatibleAdapter {
        OpenAiCompatibleAdapter::new(
            ProviderKind::OpenAi,
            "https://api.openai.com/v1",
            "gpt-4o-mini",
            "sk-test",
            Client::new(),
        )
    }

    #[test]
    fn endpoint_appends_chat_completions() {
        assert_eq!(adapter().endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn build_payload_merges_params() {
        let mut request = Request::new("hi");
        request.params.insert("temperature".into(), json!(0.2));
        let payload = adapter().build_payload(&request, false);
        assert_eq!(payload["temperature"], json!(0.2));
        assert_eq!(payload["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn deepseek_adds_thinking_block_when_requested() {
        let mut request = Request::new("hi");
        request.params.insert("thinking".into(), json!(true));
        let deep = OpenAiCompatibleAdapter::new(
            ProviderKind::DeepSeek,
            "https://api.deepseek.com",
            "deepseek-chat",
            "key",
            Client::new(),
        );
        let payload = deep.build_payload(&request, false);
        assert_eq!(payload["thinking"]["type"], json!("enabled"));
    }

    #[test]
    fn kind_reports_configured_provider() {
        assert_eq!(adapter().kind(), ProviderKind::OpenAi);
    }
}
