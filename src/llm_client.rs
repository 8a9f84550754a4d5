// src/llm_client.rs
//! OpenAI-compatible chat completion client and the `ChatModel` seam the
//! agents are written against.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::models::RequestUsage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Request error: {0}")]
    Request(String),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("Failed to parse response: {0}")]
    Parse(String),
    #[error("No content in model response")]
    EmptyResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatTurn>) -> Self {
        Self { messages, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub thought: Option<String>,
    pub usage: Option<RequestUsage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Delta(String),
    Thought(String),
    Usage(RequestUsage),
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, LlmError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError>;

    /// Streams the completion. Backends without native streaming emit the
    /// whole reply as one chunk.
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let completion = self.complete(request).await?;
        let mut chunks = Vec::new();
        if let Some(thought) = completion.thought {
            chunks.push(Ok(StreamChunk::Thought(thought)));
        }
        chunks.push(Ok(StreamChunk::Delta(completion.content)));
        if let Some(usage) = completion.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        Ok(futures::stream::iter(chunks).boxed())
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<UsagePayload> for RequestUsage {
    fn from(usage: UsagePayload) -> Self {
        RequestUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Skip,
    Done,
    Chunks(Vec<StreamChunk>),
}

pub(crate) fn parse_completion(body: &str) -> Result<Completion, LlmError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::Parse(format!("{}. Response: {}", e, body)))?;

    let message = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or(LlmError::EmptyResponse)?;

    Ok(Completion {
        content: message.content.unwrap_or_default(),
        thought: message.reasoning_content.filter(|t| !t.is_empty()),
        usage: response.usage.map(RequestUsage::from),
    })
}

pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        // comments, event names, ids and blank keep-alives
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let event: StreamResponse = serde_json::from_str(data)
        .map_err(|e| LlmError::Parse(format!("{}. Event: {}", e, data)))?;

    let mut chunks = Vec::new();
    for choice in event.choices {
        if let Some(thought) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
            chunks.push(StreamChunk::Thought(thought));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            chunks.push(StreamChunk::Delta(content));
        }
    }
    if let Some(usage) = event.usage {
        chunks.push(StreamChunk::Usage(usage.into()));
    }
    Ok(SseLine::Chunks(chunks))
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503)
}

/// Exponential backoff for provider calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: 2.0,
            max_elapsed_time: Some(self.max_elapsed_time),
            ..Default::default()
        }
    }
}

/// Sends the request produced by `build`, retrying connection failures,
/// timeouts and transient statuses. Returns the first successful response.
pub(crate) async fn send_with_retry<F>(policy: &RetryPolicy, target: &str, build: F) -> Result<Response, LlmError>
where
    F: Fn() -> RequestBuilder,
{
    let build = &build;
    let operation = || async move {
        let response = build().send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                tracing::warn!("{} connection error (retrying): {}", target, e);
                backoff::Error::transient(LlmError::Request(e.to_string()))
            } else {
                tracing::error!("{} permanent error: {}", target, e);
                backoff::Error::permanent(LlmError::Request(e.to_string()))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = LlmError::Api { status: status.as_u16(), body };
        if is_transient_status(status.as_u16()) {
            tracing::warn!("{} returned {} (retrying)", target, status);
            Err(backoff::Error::transient(error))
        } else {
            tracing::error!("{} permanent error: {}", target, error);
            Err(backoff::Error::permanent(error))
        }
    };

    retry(policy.backoff(), operation).await
}

/// Client for any provider exposing the OpenAI `/chat/completions` API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    extra_body: Option<Value>,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: 0.0,
            max_tokens: None,
            extra_body: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        let mut client = Self::new(config.api_key.clone(), config.base_url.clone(), config.model.clone())
            .with_temperature(config.temperature);
        if let Some(max_tokens) = config.max_tokens {
            client = client.with_max_tokens(max_tokens);
        }
        if let Some(extra_body) = &config.extra_body {
            client = client.with_extra_body(extra_body.clone());
        }
        client
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Provider-specific fields merged into every request body.
    pub fn with_extra_body(mut self, extra_body: Value) -> Self {
        self.extra_body = Some(extra_body);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn completions_request(&self, body: &Value) -> RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature.unwrap_or(self.temperature),
        });
        if let Some(max_tokens) = request.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let (Some(Value::Object(extra)), Some(obj)) = (&self.extra_body, body.as_object_mut()) {
            for (key, value) in extra {
                obj.insert(key.clone(), value.clone());
            }
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let body = self.build_body(request, false);
        tracing::debug!("Chat completion request: {} messages, model {}", request.messages.len(), self.model);

        let response = send_with_retry(&self.retry, "Model API", || {
            self.completions_request(&body).timeout(Duration::from_secs(120))
        })
        .await?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        tracing::debug!("Model API response (status {}): {} bytes", status, response_text.len());

        parse_completion(&response_text)
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let body = self.build_body(request, true);

        // only the connection is retried; a stream that breaks midway fails
        let response = send_with_retry(&self.retry, "Model API stream", || self.completions_request(&body)).await?;

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::try_stream! {
            // Buffer raw bytes so multi-byte characters split across network
            // chunks are decoded only once the whole line has arrived.
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| LlmError::Request(e.to_string()))?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim())? {
                        SseLine::Skip => {}
                        SseLine::Done => {
                            done = true;
                            break 'read;
                        }
                        SseLine::Chunks(chunks) => {
                            for chunk in chunks {
                                yield chunk;
                            }
                        }
                    }
                }
            }

            // last event without a trailing newline
            if !done && !buffer.is_empty() {
                let line = String::from_utf8_lossy(&buffer).into_owned();
                if let SseLine::Chunks(chunks) = parse_sse_line(line.trim())? {
                    for chunk in chunks {
                        yield chunk;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_with_reasoning_and_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "你好", "reasoning_content": "greet back"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.content, "你好");
        assert_eq!(completion.thought.as_deref(), Some("greet back"));
        assert_eq!(completion.usage, Some(RequestUsage { prompt_tokens: 12, completion_tokens: 3 }));
    }

    #[test]
    fn test_parse_completion_without_choices() {
        assert_eq!(parse_completion(r#"{"choices": []}"#), Err(LlmError::EmptyResponse));
        assert!(matches!(parse_completion("not json"), Err(LlmError::Parse(_))));
    }

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);

        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"你"}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            SseLine::Chunks(vec![StreamChunk::Delta("你".to_string())])
        );

        let usage = r#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7}}"#;
        assert_eq!(
            parse_sse_line(usage).unwrap(),
            SseLine::Chunks(vec![StreamChunk::Usage(RequestUsage { prompt_tokens: 5, completion_tokens: 7 })])
        );
    }

    #[test]
    fn test_build_body_merges_extra_fields() {
        let client = OpenAiClient::new("key".into(), "https://example.com/v1/".into(), "gpt-4o".into())
            .with_max_tokens(8192)
            .with_extra_body(json!({"search_disable": false, "show_ref_label": true}));
        let body = client.build_body(&ChatRequest::new(vec![ChatTurn::user("hi")]), true);

        assert_eq!(client.base_url, "https://example.com/v1");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["stream"], true);
        assert_eq!(body["show_ref_label"], true);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    const COMPLETION_BODY: &str =
        r#"{"choices":[{"message":{"content":"ok"}}],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#;

    fn client_for(server: &test_server::CannedServer) -> OpenAiClient {
        OpenAiClient::new("key".into(), server.base_url.clone(), "gpt-4o".into())
            .with_retry_policy(test_server::fast_retry())
    }

    #[tokio::test]
    async fn test_complete_retries_transient_status() {
        let server = test_server::spawn(vec![(503, "busy"), (429, "slow down"), (200, COMPLETION_BODY)]).await;
        let completion = client_for(&server)
            .complete(&ChatRequest::new(vec![ChatTurn::user("hi")]))
            .await
            .unwrap();

        assert_eq!(completion.content, "ok");
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn test_complete_fails_fast_on_client_error() {
        let server = test_server::spawn(vec![(400, "bad request"), (200, COMPLETION_BODY)]).await;
        let err = client_for(&server)
            .complete(&ChatRequest::new(vec![ChatTurn::user("hi")]))
            .await
            .unwrap_err();

        assert_eq!(err, LlmError::Api { status: 400, body: "bad request".to_string() });
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_stream_retries_connection_and_keeps_unterminated_event() {
        let events = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"你\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"好\"}}]}"
        );
        let server = test_server::spawn(vec![(502, ""), (200, events)]).await;

        let stream = client_for(&server)
            .complete_stream(&ChatRequest::new(vec![ChatTurn::user("hi")]))
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(
            chunks,
            vec![StreamChunk::Delta("你".to_string()), StreamChunk::Delta("好".to_string())]
        );
        assert_eq!(server.hits(), 2);
        assert!(server.bodies()[1].contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn test_stream_stops_at_done() {
        let events = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}";
        let server = test_server::spawn(vec![(200, events)]).await;

        let stream = client_for(&server)
            .complete_stream(&ChatRequest::new(vec![ChatTurn::user("hi")]))
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec![StreamChunk::Delta("a".to_string())]);
    }

    #[test]
    fn test_from_config_applies_extra_body() {
        let config = ModelConfig {
            api_key: "key".into(),
            base_url: "https://example.com/v1".into(),
            model: "deepseek-r1".into(),
            temperature: 0.3,
            max_tokens: None,
            extra_body: Some(json!({"search_disable": false})),
        };
        let body = OpenAiClient::from_config(&config).build_body(&ChatRequest::new(vec![ChatTurn::user("hi")]), false);
        assert_eq!(body["search_disable"], false);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(401));
    }
}


#[cfg(test)]
pub(crate) mod test_server {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::RetryPolicy;

    /// Loopback HTTP server answering each request with the next canned
    /// `(status, body)` pair.
    pub struct CannedServer {
        pub base_url: String,
        hits: Arc<AtomicUsize>,
        bodies: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl CannedServer {
        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        /// Request bodies in arrival order.
        pub fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            max_elapsed_time: Duration::from_secs(5),
        }
    }

    pub async fn spawn(responses: Vec<(u16, &str)>) -> CannedServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut responses: VecDeque<(u16, String)> =
            responses.into_iter().map(|(status, body)| (status, body.to_string())).collect();

        let counter = hits.clone();
        let seen = bodies.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = read_request(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(body);

                let (status, body) = responses.pop_front().unwrap_or((500, "no more responses".to_string()));
                let raw = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(raw.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        CannedServer {
            base_url: format!("http://{}", addr),
            hits,
            bodies,
        }
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);

            let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&data[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                return String::from_utf8_lossy(&data[header_end + 4..]).into_owned();
            }
        }
        String::new()
    }
}
