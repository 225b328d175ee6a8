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

/// Speaks the Ollama-style local inference wire format: `/api/generate`,
/// newline-delimited JSON chunks while streaming, no authentication.
pub struct LocalAdapter {
    base_url: String,
    model: String,
    client: Client,
}

impl LocalAdapter {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }

    fn build_payload(&self, request: &Request, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": stream,
        });
        if !request.params.is_empty() {
            let options: serde_json::Map<String, Value> = request
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            body["options"] = Value::Object(options);
        }
        body
    }

    async fn send(&self, request: &Request, stream: bool, deadline: Instant) -> ClassifiedResult<reqwest::Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(loom_core::adapter::timeout_error("local"));
        }

        self.client
            .post(self.endpoint())
            .json(&self.build_payload(request, stream))
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| ClassifiedError::new("local", ErrorKind::from(&e), e.to_string()))
    }

    async fn parse_response(&self, request: &Request, http: reqwest::Response) -> ClassifiedResult<Response> {
        let status = http.status();
        let body = http
            .text()
            .await
            .map_err(|e| ClassifiedError::new("local", ErrorKind::Network, e.to_string()))?;

        if !status.is_success() {
            return Err(ClassifiedError::from_status("local", status.as_u16(), body));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifiedError::new("local", ErrorKind::Unknown, format!("malformed response: {}", e)))?;

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (Some(p), Some(c)) => Usage::new(p, c),
            _ => Usage::estimate_from_content(&parsed.response),
        };

        Ok(Response {
            content: parsed.response,
            model: self.model.clone(),
            usage,
            meta: ResponseMeta {
                provider: "local".to_string(),
                request_id: request.request_id,
                finish_reason: Some(if parsed.done { "stop".to_string() } else { "incomplete".to_string() }),
                degraded: false,
                thinking_enabled: None,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[async_trait]
impl loom_core::Adapter for LocalAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
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
                    .filter(|l| !l.trim().is_empty())
                    .filter_map(|line| serde_json::from_str::<GenerateResponse>(line).ok())
                    .filter(|r| !r.response.is_empty())
                    .map(|r| Ok(r.response))
                    .collect(),
                Err(e) => vec![Err(ClassifiedError::new("local", ErrorKind::Network, e.to_string()))],
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

    fn adapter() -> LocalAdapter {
        LocalAdapter::new("http://localhost:11434", "llama3", Client::new())
    }

    #[test]
    fn endpoint_targets_api_generate() {
        assert_eq!(adapter().endpoint(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn build_payload_nests_params_under_options() {
        let mut request = Request::new("hi");
        request.params.insert("num_ctx".into(), json!(4096));
        let payload = adapter().build_payload(&request, false);
        assert_eq!(payload["options"]["num_ctx"], json!(4096));
    }

    #[test]
    fn usage_falls_back_to_estimate_without_eval_counts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"response":"hello there","done":true}"#,
        )
        .unwrap();
        assert!(parsed.prompt_eval_count.is_none());
        assert!(parsed.eval_count.is_none());
    }
}
