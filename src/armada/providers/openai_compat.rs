//! OpenAI-compatible chat-completions provider.
//!
//! Speaks the `/chat/completions` wire format over `reqwest`, in both
//! blocking and SSE-streaming forms. Stop sequences and the generation
//! cap are forwarded verbatim; image parts are sent as data-URI
//! `image_url` entries.
//!
//! SSE events can be split across TCP packets at any byte, so the stream
//! keeps a line buffer across chunks and only parses complete
//! `\n`-terminated lines.

use crate::armada::config::{MissionConfig, ProviderKind};
use crate::armada::provider::{
    ChatRequest, ContentPart, Message, MessageChunk, MessageChunkStream, MessageContent, Provider,
    ProviderError, ProviderRegistry, Role, TokenUsage,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio::sync::Mutex;

lazy_static! {
    /// One connection pool for every adapter instance in the process.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::Client::new();
}

/// A provider speaking the OpenAI-compatible wire format.
pub struct OpenAiCompatProvider {
    model: String,
    api_key: String,
    base_url: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl OpenAiCompatProvider {
    /// Create an adapter for `model` at `base_url` (no trailing slash).
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            usage: Mutex::new(None),
        }
    }

    /// Create an adapter against a provider family's compatibility
    /// endpoint.
    pub fn for_kind(kind: ProviderKind, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = match kind {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        };
        Self::new(model, api_key, base_url)
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(convert_message).collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    async fn post(
        &self,
        body: &Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = SHARED_HTTP_CLIENT
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!("chat completions request failed ({}): {}", status, text);
            }
            let snippet: String = text.chars().take(300).collect();
            if text.contains("context_length") || text.contains("maximum context") {
                return Err(ProviderError::ContextWindow(snippet));
            }
            return Err(ProviderError::Protocol(format!("{}: {}", status, snippet)));
        }
        Ok(response)
    }

    async fn record_usage(&self, response: &Value) {
        if let Some(usage) = response.get("usage") {
            let input = usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let output = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            *self.usage.lock().await = Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            });
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn send(&self, request: ChatRequest) -> Result<Message, ProviderError> {
        let body = self.build_body(&request, false);
        let response = self.post(&body).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("malformed response body: {}", e)))?;
        self.record_usage(&parsed).await;

        let content = parsed["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| {
                ProviderError::Protocol("response carries no message content".to_string())
            })?;
        Ok(Message::text(Role::Assistant, content))
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<MessageChunkStream, ProviderError> {
        let body = self.build_body(&request, true);
        let response = self.post(&body).await?;

        struct SseState {
            bytes: Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
            buffer: String,
            pending: VecDeque<MessageChunk>,
            done: bool,
        }

        let state = SseState {
            bytes: Box::pin(response.bytes_stream().map(|result| result.map(|b| b.to_vec()))),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    None => {
                        state.done = true;
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(ProviderError::Transport(e.to_string())), state));
                    }
                    Some(Ok(bytes)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for line in drain_complete_sse_lines(&mut state.buffer) {
                            match parse_sse_data_line(&line) {
                                Some(SseEvent::Chunk(chunk)) => state.pending.push_back(chunk),
                                Some(SseEvent::Done) => state.done = true,
                                None => {}
                            }
                        }
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn last_usage(&self) -> Option<TokenUsage> {
        self.usage.lock().await.clone()
    }
}

fn convert_message(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    match &message.content {
        MessageContent::Text(text) => json!({"role": role, "content": text.as_ref()}),
        MessageContent::Parts(parts) => {
            let converted: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => json!({"type": "text", "text": text}),
                    ContentPart::Image { data, media_type } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", media_type, data)},
                    }),
                })
                .collect();
            json!({"role": role, "content": converted})
        }
    }
}

enum SseEvent {
    Chunk(MessageChunk),
    Done,
}

/// Drain all complete `\n`-terminated lines from `buffer`, leaving any
/// trailing partial line in place for the next packet.
fn drain_complete_sse_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline) = buffer.find('\n') {
        let line = buffer[..newline].trim_end_matches('\r').to_string();
        buffer.drain(..=newline);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Parse one complete SSE line. Returns `None` for comments and
/// non-`data:` lines.
fn parse_sse_data_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let parsed: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("skipping unparseable SSE line: {}", e);
            return None;
        }
    };
    let choice = parsed["choices"].get(0)?;
    let content = choice["delta"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice["finish_reason"].as_str().map(str::to_string);
    Some(SseEvent::Chunk(MessageChunk {
        content,
        finish_reason,
    }))
}

/// Build a [`ProviderRegistry`] with one compatibility adapter per
/// configured model. The concrete model is the first `allowed_models`
/// entry, falling back to the config name.
pub fn registry_from_config(config: &MissionConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for model in &config.models {
        let concrete = model
            .allowed_models
            .first()
            .cloned()
            .unwrap_or_else(|| model.name.clone());
        registry.register(
            model.name.clone(),
            std::sync::Arc::new(OpenAiCompatProvider::for_kind(
                model.provider,
                concrete,
                model.api_key.clone(),
            )),
        );
    }
    registry
}
