//! Conversational state for one LM participant.
//!
//! A [`Session`] owns a provider handle, the model identifier, an ordered
//! list of system prompts, the conversation history, and the stop
//! sequences forwarded on every request. It is the only component that
//! appends messages; the pruning manager is the only component that
//! rewrites them (see [`crate::armada::pruning`]).
//!
//! All message-list state lives behind a single per-session mutex
//! ([`SharedSessionState`]). Provider streaming, pruning, and history
//! reads are serialised on that lock, which keeps the append-only
//! invariant trivially correct: within one session a new
//! [`send_stream`](Session::send_stream) does not start until the prior
//! one has appended both its user and assistant messages.
//!
//! # Stop sequences are a correctness contract
//!
//! The prompts instruct the model to emit the literal
//! [`STOP_SENTINEL`](crate::armada::prompts::STOP_SENTINEL) immediately
//! after `</ACTION_INPUT>` or `</ANSWER>`. The session forwards it as a
//! provider-level stop sequence so generation halts before the model can
//! hallucinate its own `<OBSERVATION>`.

use crate::armada::provider::{
    ChatRequest, Message, MessageContent, MessageMetadata, Provider, Role, TokenUsage,
};
use futures_util::StreamExt;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Message-list state shared between the session and its pruning manager.
pub type SharedSessionState = Arc<Mutex<SessionState>>;

/// The lockable interior of a [`Session`].
pub struct SessionState {
    /// Ordered system prompts, materialised as `Role::System` messages at
    /// the head of every request.
    pub prompts: Vec<String>,
    /// Conversation history, append-only except for pruning content
    /// rewrites.
    pub messages: Vec<Message>,
    /// Stop sequences forwarded on every request.
    pub stop_sequences: Vec<String>,
    /// Running insertion counter; becomes `metadata.position` of each
    /// appended message.
    inserted: usize,
}

impl SessionState {
    fn new() -> Self {
        Self {
            prompts: Vec::new(),
            messages: Vec::new(),
            stop_sequences: Vec::new(),
            inserted: 0,
        }
    }

    /// Append a message, stamping insertion metadata.
    pub fn push_message(&mut self, role: Role, content: MessageContent) -> usize {
        let position = self.inserted;
        self.inserted += 1;
        self.messages.push(Message {
            role,
            content,
            metadata: Some(MessageMetadata {
                id: Uuid::new_v4().to_string(),
                tool_name: String::new(),
                position,
                prunable: false,
            }),
        });
        position
    }

    /// Materialise the full request message list: prompts first, then the
    /// conversation.
    fn request_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.prompts.len() + self.messages.len());
        for prompt in &self.prompts {
            out.push(Message::text(Role::System, prompt));
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}

/// The assistant's reply to one send, with optional token accounting.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Full assistant text (accumulated across chunks for streaming sends).
    pub content: String,
    /// Usage reported by the provider for this round-trip, when available.
    pub usage: Option<TokenUsage>,
}

/// A conversational session bound to one provider and model.
pub struct Session {
    id: String,
    provider: Arc<dyn Provider>,
    model: String,
    max_tokens: Option<usize>,
    state: SharedSessionState,
}

impl Session {
    /// Create a session speaking to `model` through `provider`.
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider,
            model: model.into(),
            max_tokens: None,
            state: Arc::new(Mutex::new(SessionState::new())),
        }
    }

    /// Cap the per-response generation length (builder pattern).
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Unique session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The model identifier forwarded on every request.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Handle to the locked message state, shared with the pruning manager.
    pub fn shared_state(&self) -> SharedSessionState {
        Arc::clone(&self.state)
    }

    /// Append a system prompt. Prompts are sent ahead of the conversation
    /// on every request, in insertion order.
    pub async fn add_system_prompt(&self, prompt: impl Into<String>) {
        self.state.lock().await.prompts.push(prompt.into());
    }

    /// Replace the stop sequences forwarded to the provider.
    pub async fn set_stop_sequences(&self, stop_sequences: Vec<String>) {
        self.state.lock().await.stop_sequences = stop_sequences;
    }

    /// Snapshot of the conversation history (prompts excluded).
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    /// Drop the conversation history while keeping prompts and stop
    /// sequences. Used when an agent is handed a fresh assignment.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.messages.clear();
        state.inserted = 0;
    }

    /// Send a user message and wait for the complete response.
    pub async fn send(
        &self,
        user_message: &str,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
        let request = {
            let mut state = self.state.lock().await;
            state.push_message(Role::User, MessageContent::Text(Arc::from(user_message)));
            self.build_request(&state)
        };

        let reply = self.provider.send(request).await?;
        let content = reply.content_text();
        let usage = self.provider.last_usage().await;

        let mut state = self.state.lock().await;
        state.push_message(Role::Assistant, reply.content);
        Ok(ChatResponse { content, usage })
    }

    /// Send a user message, piping each streamed content chunk to
    /// `on_chunk` as it arrives.
    ///
    /// The user message is appended before the request goes out; the
    /// assistant message is appended only after the stream completes
    /// successfully. Errors surfaced by the provider channel abort the
    /// call and are propagated; no partial assistant message is
    /// committed.
    pub async fn send_stream<F>(
        &self,
        user_message: &str,
        mut on_chunk: F,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>>
    where
        F: FnMut(&str) + Send,
    {
        let request = {
            let mut state = self.state.lock().await;
            state.push_message(Role::User, MessageContent::Text(Arc::from(user_message)));
            self.build_request(&state)
        };

        let mut stream = self.provider.open_stream(request).await?;
        let mut accumulated = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.content.is_empty() {
                on_chunk(&chunk.content);
                accumulated.push_str(&chunk.content);
            }
        }
        drop(stream);
        let usage = self.provider.last_usage().await;

        let mut state = self.state.lock().await;
        state.push_message(
            Role::Assistant,
            MessageContent::Text(Arc::from(accumulated.as_str())),
        );
        Ok(ChatResponse {
            content: accumulated,
            usage,
        })
    }

    /// Build a one-off request that extends the current history with an
    /// extra user message *without committing anything* to the session.
    ///
    /// Used for follow-up questions asked of agents owned by earlier
    /// tasks: later tasks may query those agents but must not mutate
    /// their sessions.
    pub async fn request_with(&self, extra_user_message: &str) -> ChatRequest {
        let state = self.state.lock().await;
        let mut request = self.build_request(&state);
        request
            .messages
            .push(Message::text(Role::User, extra_user_message));
        request
    }

    /// Borrow the provider handle (e.g. for uncommitted one-off sends).
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Release the session. The provider is closed by its owning agent,
    /// not here, because providers may be shared across sessions.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        log::debug!(
            "session {} closing with {} messages",
            self.id,
            state.messages.len()
        );
        state.messages.clear();
        state.prompts.clear();
    }

    fn build_request(&self, state: &SessionState) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: state.request_messages(),
            stop_sequences: state.stop_sequences.clone(),
            max_tokens: self.max_tokens,
        }
    }
}
