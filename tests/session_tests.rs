use armada::armada::provider::{
    ChatRequest, Message, MessageChunk, MessageChunkStream, Provider, ProviderError, Role,
};
use armada::armada::session::Session;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replays scripted responses as 4-character chunks and records every
/// request it receives.
struct ScriptedProvider {
    requests: Mutex<Vec<ChatRequest>>,
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<Result<&str, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| r.map(str::to_string))
                    .collect(),
            ),
        })
    }

    fn next_response(&self) -> Result<String, ProviderError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Protocol("script exhausted".to_string())))
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn send(&self, request: ChatRequest) -> Result<Message, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let response = self.next_response()?;
        Ok(Message::text(Role::Assistant, response))
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<MessageChunkStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let response = self.next_response()?;
        let chars: Vec<char> = response.chars().collect();
        let chunks: Vec<Result<MessageChunk, ProviderError>> = chars
            .chunks(4)
            .map(|group| {
                Ok(MessageChunk {
                    content: group.iter().collect(),
                    finish_reason: None,
                })
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }
}

/// A provider whose stream fails midway.
struct MidStreamFailure;

#[async_trait]
impl Provider for MidStreamFailure {
    async fn send(&self, _request: ChatRequest) -> Result<Message, ProviderError> {
        Err(ProviderError::Protocol("unused".to_string()))
    }

    async fn open_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<MessageChunkStream, ProviderError> {
        let chunks: Vec<Result<MessageChunk, ProviderError>> = vec![
            Ok(MessageChunk {
                content: "partial ".to_string(),
                finish_reason: None,
            }),
            Err(ProviderError::Transport("connection reset".to_string())),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test]
async fn send_stream_pipes_chunks_and_appends_both_messages() {
    let provider = ScriptedProvider::new(vec![Ok("streamed response body")]);
    let session = Session::new(provider.clone(), "test-model");
    session.add_system_prompt("you are a test subject").await;
    session
        .set_stop_sequences(vec!["___STOP___".to_string()])
        .await;

    let mut seen = String::new();
    let response = session
        .send_stream("hello there", |chunk| seen.push_str(chunk))
        .await
        .unwrap();

    assert_eq!(response.content, "streamed response body");
    assert_eq!(seen, "streamed response body");

    let history = session.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content_text(), "hello there");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content_text(), "streamed response body");

    // The request carried model, prompts-first messages, and stops.
    let request = provider.request(0);
    assert_eq!(request.model, "test-model");
    assert_eq!(request.stop_sequences, vec!["___STOP___".to_string()]);
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[0].content_text(), "you are a test subject");
    assert_eq!(request.messages[1].content_text(), "hello there");
}

#[tokio::test]
async fn a_stream_error_commits_no_partial_assistant_message() {
    let session = Session::new(Arc::new(MidStreamFailure), "flaky-model");
    let mut seen = String::new();
    let error = session
        .send_stream("hello", |chunk| seen.push_str(chunk))
        .await
        .unwrap_err();

    assert!(error.to_string().contains("connection reset"));
    assert_eq!(seen, "partial ");
    let history = session.history().await;
    assert_eq!(history.len(), 1, "only the user message is committed");
    assert_eq!(history[0].role, Role::User);
}

#[tokio::test]
async fn messages_stay_strictly_linearised_across_sends() {
    let provider = ScriptedProvider::new(vec![Ok("first"), Ok("second")]);
    let session = Session::new(provider.clone(), "m");
    session.send_stream("one", |_| {}).await.unwrap();
    session.send_stream("two", |_| {}).await.unwrap();

    let history = session.history().await;
    let texts: Vec<String> = history.iter().map(|m| m.content_text()).collect();
    assert_eq!(texts, vec!["one", "first", "two", "second"]);
    // Position metadata reflects insertion order.
    for (index, message) in history.iter().enumerate() {
        assert_eq!(message.metadata.as_ref().unwrap().position, index);
    }
    // The second request replays the full history.
    let request = provider.request(1);
    assert_eq!(request.messages.len(), 3);
}

#[tokio::test]
async fn request_with_extends_without_committing() {
    let provider = ScriptedProvider::new(vec![Ok("committed")]);
    let session = Session::new(provider.clone(), "m");
    session.send_stream("real message", |_| {}).await.unwrap();

    let request = session.request_with("ephemeral question").await;
    assert_eq!(request.messages.len(), 3);
    assert_eq!(
        request.messages.last().unwrap().content_text(),
        "ephemeral question"
    );
    assert_eq!(session.history().await.len(), 2, "nothing was committed");
}

#[tokio::test]
async fn reset_clears_history_but_keeps_prompts_and_stops() {
    let provider = ScriptedProvider::new(vec![Ok("a"), Ok("b")]);
    let session = Session::new(provider.clone(), "m");
    session.add_system_prompt("persona").await;
    session.set_stop_sequences(vec!["STOP".to_string()]).await;
    session.send_stream("x", |_| {}).await.unwrap();

    session.reset().await;
    assert!(session.history().await.is_empty());

    session.send_stream("fresh start", |_| {}).await.unwrap();
    let request = provider.request(1);
    assert_eq!(request.messages[0].content_text(), "persona");
    assert_eq!(request.stop_sequences, vec!["STOP".to_string()]);
    assert_eq!(request.messages.len(), 2);
    // Positions restart after a reset.
    let history = session.history().await;
    assert_eq!(history[0].metadata.as_ref().unwrap().position, 0);
}
