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

/// Speaks the Google Gemini `generateContent` wire format. The API key is
/// sent as a query parameter rather than a header, so `loom_providers::auth`
/// is not used here.
pub struct GoogleAdapter {
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl GoogleAdapter {
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

    fn endpoint(&self, streaming: bool) -> String {
        let method = if streaming {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            method,
            self.api_key
        )
    }

    fn build_payload(&self, request: &Request) -> Value {
        let mut body = json!({
            "contents": [{"parts": [{"text": request.prompt}]}],
        });
        if !request.params.is_empty() {
            let generation_config: serde_json::Map<String, Value> = request
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            body["generationConfig"] = Value::Object(generation_config);
        }
        body
    }

    async fn send(&self, request: &Request, streaming: bool, deadline: Instant) -> ClassifiedResult<reqwest::Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(loom_core::adapter::timeout_error("google"));
        }

        self.client
            .post(self.endpoint(streaming))
            .json(&self.build_payload(request))
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| ClassifiedError::new("google", ErrorKind::from(&e), e.to_string()))
    }

    async fn parse_response(&self, request: &Request, http: reqwest::Response) -> ClassifiedResult<Response> {
        let status = http.status();
        let body = http
            .text()
            .await
            .map_err(|e| ClassifiedError::new("google", ErrorKind::Network, e.to_string()))?;

        if !status.is_success() {
            return Err(ClassifiedError::from_status("google", status.as_u16(), body));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifiedError::new("google", ErrorKind::Unknown, format!("malformed response: {}", e)))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ClassifiedError::new("google", ErrorKind::Unknown, "no candidates in response"))?;

        let content = candidate
            .content
            .parts
            .into_iter()
            .next()
            .and_then(|p| p.text)
            .ok_or_else(|| ClassifiedError::new("google", ErrorKind::Unknown, "no text part in candidate"))?;

        let usage = parsed
            .usage_metadata
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_else(|| Usage::estimate_from_content(&content));

        Ok(Response {
            content,
            model: self.model.clone(),
            usage,
            meta: ResponseMeta {
                provider: "google".to_string(),
                request_id: request.request_id,
                finish_reason: candidate.finish_reason,
                degraded: false,
                thinking_enabled: None,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

#[async_trait]
impl loom_core::Adapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
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
                    .filter_map(|line| serde_json::from_str::<Value>(line.trim_start_matches(',').trim()).ok())
                    .filter_map(|v| {
                        v.pointer("/candidates/0/content/parts/0/text")
                            .and_then(Value::as_str)
                            .map(|s| Ok(s.to_string()))
                    })
                    .collect(),
                Err(e) => vec![Err(ClassifiedError::new("google", ErrorKind::Network, e.to_string()))],
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

    fn adapter() -> GoogleAdapter {
        GoogleAdapter::new(
            "https://generativelanguage.googleapis.com/v1beta",
            "gemini-1.5-pro",
            "goog-test",
            Client::new(),
        )
    }

    #[test]
    fn endpoint_includes_model_and_key() {
        let endpoint = adapter().endpoint(false);
        assert!(endpoint.contains(":generateContent"));
        assert!(endpoint.contains("key=goog-test"));
    }

    #[test]
    fn streaming_endpoint_uses_stream_method() {
        assert!(adapter().endpoint(true).contains(":streamGenerateContent"));
    }

    #[test]
    fn build_payload_nests_params_under_generation_config() {
        let mut request = Request::new("hi");
        request.params.insert("temperature".into(), json!(0.3));
        let payload = adapter().build_payload(&request);
        assert_eq!(payload["generationConfig"]["temperature"], json!(0.3));
    }
}
