//! Shared primitives for provider-agnostic LM access.
//!
//! The engine talks to every language-model vendor through the narrow
//! [`Provider`] trait and the lightweight data types in this module: chat
//! [`Message`]s, streaming [`MessageChunk`]s, and [`TokenUsage`] accounting.
//! Conversation bookkeeping lives in [`crate::armada::session::Session`];
//! a `Provider` only translates one [`ChatRequest`] into one response (or
//! one chunk stream) in the vendor's wire format.
//!
//! All implementations must be thread-safe (`Send + Sync`) so they can be
//! shared between concurrently running tasks. A provider that holds real
//! resources (a long-lived connection, a subprocess) can declare itself
//! closeable; the owning agent will call [`Provider::close`] on teardown.

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (including system-injected observations).
    User,
    /// An assistant authored message.
    Assistant,
}

impl Role {
    /// Lowercase wire name (`"system"`, `"user"`, `"assistant"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One part of a multi-part message body.
#[derive(Debug, Clone)]
pub enum ContentPart {
    /// Plain text.
    Text(String),
    /// An inline image: base64 payload plus its media type
    /// (e.g. `"image/png"`).
    Image { data: String, media_type: String },
}

/// A message body: either a single text block or an ordered part sequence.
#[derive(Debug, Clone)]
pub enum MessageContent {
    /// The common case. Stored as `Arc<str>` so histories can be cheaply
    /// cloned when building requests.
    Text(Arc<str>),
    /// Mixed text/image content.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Render the body as plain text. Image parts contribute a short
    /// placeholder so the result is always printable.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.to_string(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text(t) => t.clone(),
                    ContentPart::Image { media_type, .. } => format!("[image {}]", media_type),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// `true` when the body is a text block equal to `text`.
    pub fn is_text(&self, text: &str) -> bool {
        matches!(self, MessageContent::Text(t) if t.as_ref() == text)
    }
}

/// Bookkeeping stamped onto messages at insertion time.
///
/// The pruning manager relies on `position` (the index the message was
/// inserted at; the list is append-only) and flips `prunable` on tool
/// observations it takes ownership of.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Unique message id.
    pub id: String,
    /// Name of the tool whose observation this message carries; empty for
    /// all non-tool messages.
    pub tool_name: String,
    /// Index of the message at insertion time.
    pub position: usize,
    /// Whether the pruning manager may replace this message's body.
    pub prunable: bool,
}

/// Represents a generic message exchanged with an LM.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: MessageContent,
    /// Insertion metadata; `None` on messages constructed ad hoc for a
    /// request (e.g. system prompts materialised at send time).
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Build a plain-text message with the given role and no metadata.
    pub fn text(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: MessageContent::Text(Arc::from(content.as_ref())),
            metadata: None,
        }
    }

    /// Render the body as plain text.
    pub fn content_text(&self) -> String {
        self.content.as_text()
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Represents a chunk of content in a streaming response.
///
/// Each chunk contains a delta (incremental piece) of the assistant's
/// response. Chunks that only carry a `finish_reason` have empty content.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk.
    pub content: String,
    /// Provider specific completion status (e.g. `"stop"`), when present.
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of message chunks compatible with `Send` executors.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, ProviderError>> + Send>>;

/// One fully-assembled request to a provider.
///
/// The session materialises this from its prompts, history, and stop
/// sequences on every send; providers never see session internals.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Concrete model identifier (e.g. `"gpt-4o"`).
    pub model: String,
    /// System prompts first, then the alternating conversation.
    pub messages: Vec<Message>,
    /// Stop sequences forwarded verbatim on every request.
    pub stop_sequences: Vec<String>,
    /// Optional generation cap.
    pub max_tokens: Option<usize>,
}

/// Errors surfaced by a provider channel.
///
/// The distinction matters to the retry machinery: a
/// [`ContextWindow`](ProviderError::ContextWindow) rejection is retry-worthy
/// after pruning, while transport and protocol errors abort the current turn
/// and surface as an iteration failure.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Network-level failure (connect, TLS, mid-stream disconnect).
    Transport(String),
    /// The provider answered, but not with a usable completion
    /// (non-2xx status, malformed body, refused request).
    Protocol(String),
    /// The provider rejected the request for being too large.
    ContextWindow(String),
}

impl ProviderError {
    /// `true` for rejections caused by input size.
    pub fn is_context_window(&self) -> bool {
        matches!(self, ProviderError::ContextWindow(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "provider transport error: {}", msg),
            ProviderError::Protocol(msg) => write!(f, "provider protocol error: {}", msg),
            ProviderError::ContextWindow(msg) => {
                write!(f, "provider rejected input size: {}", msg)
            }
        }
    }
}

impl Error for ProviderError {}

/// Trait-driven abstraction over a concrete LM vendor.
///
/// The trait deliberately excludes conversation bookkeeping; see
/// [`Session`](crate::armada::session::Session) for that. Implementations
/// translate a [`ChatRequest`] into the vendor wire format and return
/// responses in a uniform shape.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a full request/response style chat completion.
    async fn send(&self, request: ChatRequest) -> Result<Message, ProviderError>;

    /// Open a streaming response for the request.
    ///
    /// The returned stream must yield [`MessageChunk`]s mirroring the
    /// incremental tokens supplied by the upstream service, and terminate
    /// after the final chunk. Providers honour `request.stop_sequences` by
    /// halting generation server-side; the stream simply ends.
    async fn open_stream(&self, request: ChatRequest) -> Result<MessageChunkStream, ProviderError>;

    /// The default model identifier this provider was configured with.
    fn model_name(&self) -> &str;

    /// Token usage reported for the most recent completed call, when the
    /// vendor exposes billing information.
    async fn last_usage(&self) -> Option<TokenUsage> {
        None
    }

    /// Whether this provider holds resources that need explicit teardown.
    fn is_closeable(&self) -> bool {
        false
    }

    /// Release held resources. Called by the owning agent on `close()`;
    /// a no-op for stateless HTTP providers.
    async fn close(&self) {}
}

/// Resolves config model references to concrete [`Provider`] handles.
///
/// The registry is populated by the embedding application (or by
/// [`ProviderRegistry::register`] calls made from
/// [`from_config`](crate::armada::providers::openai_compat::registry_from_config))
/// and handed to the [`MissionRunner`](crate::armada::runner::MissionRunner),
/// which resolves `supervisor_model` and per-agent `model` references
/// through it.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider under a config model name. Replaces any
    /// previous registration for the same name.
    pub fn register(&mut self, model_ref: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(model_ref.into(), provider);
    }

    /// Resolve a config model reference.
    pub fn resolve(&self, model_ref: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(model_ref).cloned()
    }

    /// Names registered so far, unordered.
    pub fn model_refs(&self) -> Vec<&str> {
        self.providers.keys().map(|k| k.as_str()).collect()
    }
}
