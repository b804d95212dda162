use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rateburn_core::{ExecutorConfig, RateBurnError, RequestOutcome, Result, TargetConfig};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, trace};

use crate::runner::{GenerationRequest, RequestExecutor};
use crate::sse::{SseDecoder, SseEvent};

const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    config: ExecutorConfig,
}

/// First-chunk time and chunk count observed while reading a stream.
#[derive(Debug, Default)]
struct StreamProgress {
    first_chunk: Option<f64>,
    chunks: u64,
}

impl StreamProgress {
    fn record_chunk(&mut self, start: Instant) {
        if self.first_chunk.is_none() {
            self.first_chunk = Some(start.elapsed().as_secs_f64());
        }
        self.chunks += 1;
    }

    fn record_data(&mut self, payload: &str, start: Instant) {
        // Token accounting is best effort: a fragment that is not valid
        // JSON is skipped, it does not fail the request.
        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(_) => self.record_chunk(start),
            Err(e) => trace!("Skipping malformed stream fragment: {}", e),
        }
    }
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, config: ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RateBurnError::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
            config,
        })
    }

    pub fn for_target(target: &TargetConfig, model: &str, config: ExecutorConfig) -> Result<Self> {
        Self::new(&target.base_url, &target.resolved_api_key()?, model, config)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Model ids served by the endpoint (`GET {base_url}/models`).
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        if !resp.status().is_success() {
            return Err(RateBurnError::Http(format!(
                "Failed to list models: {}",
                resp.status()
            )));
        }

        let models: ModelsResponse = resp.json().await.map_err(|e| self.http_error(e))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn stream_chat(
        &self,
        request: &GenerationRequest,
        start: Instant,
        progress: &mut StreamProgress,
    ) -> Result<()> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let end = text
                .char_indices()
                .nth(ERROR_BODY_LIMIT)
                .map_or(text.len(), |(i, _)| i);
            return Err(RateBurnError::Http(format!(
                "HTTP status {}: {}",
                status,
                &text[..end]
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| self.http_error(e))?;
            for event in decoder.push(&bytes) {
                match event {
                    SseEvent::Done => return Ok(()),
                    SseEvent::Data(payload) => progress.record_data(&payload, start),
                }
            }
        }

        // Server closed the body without the sentinel.
        if let Some(SseEvent::Data(payload)) = decoder.finish() {
            progress.record_data(&payload, start);
        }
        Ok(())
    }

    fn http_error(&self, e: reqwest::Error) -> RateBurnError {
        if e.is_timeout() {
            return RateBurnError::Http(format!(
                "request timed out after {:?}: {}",
                self.config.timeout, e
            ));
        }
        RateBurnError::Http(e.to_string())
    }
}

#[async_trait]
impl RequestExecutor for ChatClient {
    async fn execute(&self, request: &GenerationRequest) -> RequestOutcome {
        let prompt_length = request.prompt.chars().count();
        let issued_at = Utc::now();
        let start = Instant::now();
        let mut progress = StreamProgress::default();

        let result = self.stream_chat(request, start, &mut progress).await;
        let total_duration = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => RequestOutcome::succeeded(
                request.request_id.clone(),
                issued_at,
                progress.first_chunk,
                total_duration,
                progress.chunks,
                prompt_length,
            ),
            Err(e) => {
                debug!(request_id = %request.request_id, "Request failed: {}", e);
                RequestOutcome::failed(
                    request.request_id.clone(),
                    issued_at,
                    total_duration,
                    prompt_length,
                    e.to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use futures::stream;
    use std::time::Duration;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn sse_response(parts: Vec<&'static str>, delay: Duration) -> Response {
        let body = stream::iter(parts).then(move |part| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, std::io::Error>(part)
        });
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(body),
        )
            .into_response()
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            request_id: "test-1".to_string(),
            prompt: prompt.to_string(),
            max_tokens: 16,
            temperature: 0.0,
        }
    }

    fn client(base_url: &str, timeout: Duration) -> ChatClient {
        ChatClient::new(base_url, "sk-test", "test-model", ExecutorConfig { timeout }).unwrap()
    }

    #[tokio::test]
    async fn test_streams_chunks_until_done() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                sse_response(
                    vec![
                        "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{}}]}\n\ndata: [DONE]\n\n",
                        "data: {\"after\":\"done\"}\n\n",
                    ],
                    Duration::from_millis(20),
                )
            }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_secs(10)).execute(&request("héllo")).await;

        assert!(outcome.success, "{:?}", outcome.error_detail);
        assert_eq!(outcome.chunks_received, 3);
        assert_eq!(outcome.prompt_length, 5);
        let ttft = outcome.time_to_first_chunk.unwrap();
        assert!(ttft > 0.0 && ttft <= outcome.total_duration);
        assert!(outcome.throughput > 0.0);
        assert_eq!(outcome.request_id, "test-1");
    }

    #[tokio::test]
    async fn test_malformed_fragments_are_skipped() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                sse_response(
                    vec![
                        "data: {not json\n\n",
                        ": comment\n\n",
                        "data: {\"ok\":true}\n\n",
                        "data: [DONE]\n\n",
                    ],
                    Duration::from_millis(1),
                )
            }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_secs(10)).execute(&request("hi")).await;
        assert!(outcome.success);
        assert_eq!(outcome.chunks_received, 1);
    }

    #[tokio::test]
    async fn test_sends_openai_request_body() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|headers: axum::http::HeaderMap, Json(body): Json<serde_json::Value>| async move {
                let auth = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                let valid = auth == "Bearer sk-test"
                    && body["model"] == "test-model"
                    && body["stream"] == true
                    && body["max_tokens"] == 16
                    && body["messages"][0]["role"] == "user"
                    && body["messages"][0]["content"] == "ping";
                if valid {
                    sse_response(vec!["data: {}\n\ndata: [DONE]\n\n"], Duration::ZERO)
                } else {
                    StatusCode::BAD_REQUEST.into_response()
                }
            }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_secs(10)).execute(&request("ping")).await;
        assert!(outcome.success, "{:?}", outcome.error_detail);
    }

    #[tokio::test]
    async fn test_non_success_status_fails() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_secs(10)).execute(&request("hi")).await;
        assert!(!outcome.success);
        let error = outcome.error_detail.unwrap();
        assert!(error.contains("503"), "{}", error);
        assert!(error.contains("overloaded"), "{}", error);
        assert_eq!(outcome.time_to_first_chunk, None);
        assert!(outcome.total_duration >= 0.0);
    }

    #[tokio::test]
    async fn test_connection_refused_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let base = format!("http://{}/v1", addr);
        let outcome = client(&base, Duration::from_secs(5)).execute(&request("hi")).await;
        assert!(!outcome.success);
        assert!(outcome.error_detail.is_some());
    }

    #[tokio::test]
    async fn test_timeout_before_first_chunk_fails() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                sse_response(
                    vec!["data: {}\n\n", "data: {}\n\n", "data: [DONE]\n\n"],
                    Duration::from_millis(300),
                )
            }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_millis(200)).execute(&request("hi")).await;
        assert!(!outcome.success);
        assert!(outcome.error_detail.is_some());
        assert_eq!(outcome.chunks_received, 0);
    }

    #[tokio::test]
    async fn test_timeout_mid_stream_fails() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let parts = [
                    ("data: {}\n\n", Duration::ZERO),
                    ("data: {}\n\n", Duration::from_millis(600)),
                    ("data: [DONE]\n\n", Duration::ZERO),
                ];
                let body = stream::iter(parts).then(|(part, delay)| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, std::io::Error>(part)
                });
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(body),
                )
                    .into_response()
            }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_millis(200)).execute(&request("hi")).await;
        assert!(!outcome.success);
        assert!(outcome.error_detail.is_some());
        assert_eq!(outcome.time_to_first_chunk, None);
        assert_eq!(outcome.chunks_received, 0);
        assert!(outcome.total_duration >= 0.15, "{}", outcome.total_duration);
        assert!(outcome.total_duration < 0.6, "{}", outcome.total_duration);
    }

    #[tokio::test]
    async fn test_stream_closed_without_sentinel_succeeds() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { sse_response(vec!["data: {}\n\n", "data: {}"], Duration::ZERO) }),
        );
        let base = serve(app).await;

        let outcome = client(&base, Duration::from_secs(10)).execute(&request("hi")).await;
        assert!(outcome.success);
        assert_eq!(outcome.chunks_received, 2);
    }

    #[tokio::test]
    async fn test_list_models() {
        let app = Router::new().route(
            "/v1/models",
            get(|| async {
                Json(serde_json::json!({
                    "object": "list",
                    "data": [{"id": "llama-3.1-8b"}, {"id": "qwen3-coder-30b"}]
                }))
            }),
        );
        let base = serve(app).await;

        let models = client(&base, Duration::from_secs(5)).list_models().await.unwrap();
        assert_eq!(models, vec!["llama-3.1-8b", "qwen3-coder-30b"]);
    }

    #[test]
    fn test_first_chunk_is_first_write_wins() {
        let start = Instant::now();
        let mut progress = StreamProgress::default();
        progress.record_chunk(start);
        let first = progress.first_chunk;
        std::thread::sleep(Duration::from_millis(5));
        progress.record_chunk(start);
        assert_eq!(progress.first_chunk, first);
        assert_eq!(progress.chunks, 2);
    }
}
