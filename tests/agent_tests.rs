use armada::armada::agent::{Agent, EventScope};
use armada::armada::event::{EventBus, MissionEvent, MissionHandler};
use armada::armada::provider::{
    ChatRequest, Message, MessageChunk, MessageChunkStream, Provider, ProviderError, Role,
};
use armada::armada::schema::{FieldSpec, FieldType};
use armada::armada::tools::{Tool, ToolMap};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex};

struct ScriptedProvider {
    requests: Mutex<Vec<ChatRequest>>,
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        })
    }

    fn next_response(&self) -> Result<String, ProviderError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Protocol("script exhausted".to_string()))
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn send(&self, request: ChatRequest) -> Result<Message, ProviderError> {
        self.requests.lock().unwrap().push(request);
        Ok(Message::text(Role::Assistant, self.next_response()?))
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<MessageChunkStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let response = self.next_response()?;
        let chars: Vec<char> = response.chars().collect();
        let chunks: Vec<Result<MessageChunk, ProviderError>> = chars
            .chunks(5)
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

/// Returns 25 numbered objects, enough to trip the array interceptor.
struct FetchNumbersTool;

#[async_trait]
impl Tool for FetchNumbersTool {
    fn name(&self) -> &str {
        "fetch_numbers"
    }
    fn description(&self) -> &str {
        "Fetch numbered records."
    }
    fn parameters(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::new("count", FieldType::Integer)]
    }
    async fn call(&self, _input: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let items: Vec<Value> = (0..25).map(|i| json!({ "i": i })).collect();
        Ok(serde_json::to_string(&items)?)
    }
}

/// Records the input it was invoked with.
struct RecordingTool {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        "record"
    }
    fn description(&self) -> &str {
        "Records its input."
    }
    async fn call(&self, input: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.seen.lock().unwrap().push(input.to_string());
        Ok("recorded".to_string())
    }
}

struct CapturingHandler {
    events: Mutex<Vec<MissionEvent>>,
}

#[async_trait]
impl MissionHandler for CapturingHandler {
    async fn on_event(&self, event: &MissionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn tool_map(tool: Arc<dyn Tool>) -> ToolMap {
    let mut tools = ToolMap::new();
    tools.insert(tool.name().to_string(), tool);
    tools
}

#[tokio::test]
async fn chat_dispatches_a_tool_and_spills_its_oversize_result() {
    let provider = ScriptedProvider::new(vec![
        "<REASONING>\nNeed the records first.\n</REASONING>\n<ACTION>fetch_numbers</ACTION>\n<ACTION_INPUT>\n{\"count\": 25}\n</ACTION_INPUT>",
        "<ANSWER>\nGot the data.\n</ANSWER>",
    ]);
    let mut agent = Agent::new("analyst", provider.clone(), "scripted-model")
        .with_role("Data analyst")
        .with_tools(tool_map(Arc::new(FetchNumbersTool)));

    let result = agent.chat("Collect the numbers").await.unwrap();
    assert_eq!(result.answer, "Got the data.");
    assert!(result.complete);
    assert!(result.ask_supe.is_empty());

    // The observation carried a stored-result id plus metadata.
    let history = agent.session().history().await;
    assert_eq!(history.len(), 4);
    let observation = history[2].content_text();
    assert!(observation.starts_with("<OBSERVATION>\n"));
    assert!(observation.contains("_result_fetch_numbers_0"));
    assert!(observation.contains("<OBSERVATION_METADATA>"));
    assert!(observation.contains("total_items: 25"));
    assert!(observation.contains("shown_items: 5"));
    assert_eq!(agent.result_store().len(), 1);

    // System prompt advertises the tools and the stop sequence is set.
    let request = provider.request(0);
    assert_eq!(request.stop_sequences, vec!["___STOP___".to_string()]);
    let system = request.messages[0].content_text();
    assert!(system.contains("fetch_numbers"));
    assert!(system.contains("result_items"), "result tools are installed");
    assert!(system.contains("Data analyst"));
}

#[tokio::test]
async fn a_stream_cut_before_the_closing_input_tag_still_dispatches() {
    // The provider stop sequence fires right after the payload, so the
    // closing </ACTION_INPUT> never arrives.
    let provider = ScriptedProvider::new(vec![
        "<ACTION>fetch_numbers</ACTION>\n<ACTION_INPUT>\n{\"count\": 25}",
        "<ANSWER>\nStill worked.\n</ANSWER>",
    ]);
    let mut agent = Agent::new("resilient", provider, "scripted-model")
        .with_tools(tool_map(Arc::new(FetchNumbersTool)));

    let result = agent.chat("collect").await.unwrap();
    assert_eq!(result.answer, "Still worked.");
    // The tool really ran: its spilled result is in the store.
    assert_eq!(agent.result_store().len(), 1);
}

#[tokio::test]
async fn a_missing_tool_becomes_an_error_observation() {
    let provider = ScriptedProvider::new(vec![
        "<ACTION>does_not_exist</ACTION>\n<ACTION_INPUT>\n{}\n</ACTION_INPUT>",
        "<ANSWER>\nGiving up on that tool.\n</ANSWER>",
    ]);
    let mut agent = Agent::new("worker", provider, "scripted-model");
    let result = agent.chat("try something").await.unwrap();
    assert_eq!(result.answer, "Giving up on that tool.");

    let history = agent.session().history().await;
    let observation = history[2].content_text();
    assert!(observation.contains("Error: Tool 'does_not_exist' not found"));
}

#[tokio::test]
async fn secret_placeholders_are_injected_only_at_dispatch() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let provider = ScriptedProvider::new(vec![
        "<ACTION>record</ACTION>\n<ACTION_INPUT>\n{\"token\": \"{{secrets.api_key}}\"}\n</ACTION_INPUT>",
        "<ANSWER>\nDone.\n</ANSWER>",
    ]);
    let mut secrets = HashMap::new();
    secrets.insert("api_key".to_string(), "s3cr3t-value".to_string());
    let mut agent = Agent::new("worker", provider, "scripted-model")
        .with_tools(tool_map(Arc::new(RecordingTool {
            seen: Arc::clone(&seen),
        })))
        .with_secrets(secrets);

    agent.chat("record the token").await.unwrap();

    // The tool saw the real value...
    let inputs = seen.lock().unwrap().clone();
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].contains("s3cr3t-value"));
    // ...while the session only ever holds the placeholder.
    for message in agent.session().history().await {
        let text = message.content_text();
        assert!(
            !text.contains("s3cr3t-value"),
            "secret leaked into the session: {}",
            text
        );
    }
}

#[tokio::test]
async fn ask_supe_ends_the_chat_incomplete() {
    let provider = ScriptedProvider::new(vec![
        "<ASK_SUPE>\nWhich environment should I target?\n</ASK_SUPE>",
    ]);
    let mut agent = Agent::new("worker", provider, "scripted-model");
    let result = agent.chat("deploy the service").await.unwrap();
    assert!(!result.complete);
    assert_eq!(result.ask_supe, "Which environment should I target?");
    assert!(result.answer.is_empty());
}

#[tokio::test]
async fn follow_up_answers_come_from_memory_without_mutation() {
    let provider = ScriptedProvider::new(vec![
        "<ANSWER>\nThe capital is Paris.\n</ANSWER>",
        "<ANSWER>\nParis\n</ANSWER>",
    ]);
    let mut agent = Agent::new("geographer", provider.clone(), "scripted-model");
    agent.chat("What is the capital of France?").await.unwrap();
    let history_len = agent.session().history().await.len();

    let answer = agent.answer_follow_up("Just the city name?").await.unwrap();
    assert_eq!(answer, "Paris");
    assert_eq!(
        agent.session().history().await.len(),
        history_len,
        "follow-ups never mutate the session"
    );
    // The follow-up request carried the wrapped question.
    let request = provider.request(1);
    assert!(request
        .messages
        .last()
        .unwrap()
        .content_text()
        .contains("<FOLLOWUP_QUESTION>"));
}

#[tokio::test]
async fn the_turn_limit_cuts_off_runaway_tool_loops() {
    let loop_turn =
        "<ACTION>fetch_numbers</ACTION>\n<ACTION_INPUT>\n{\"count\": 1}\n</ACTION_INPUT>";
    let provider = ScriptedProvider::new(vec![loop_turn, loop_turn]);
    let mut agent = Agent::new("loopy", provider, "scripted-model")
        .with_tools(tool_map(Arc::new(FetchNumbersTool)))
        .with_turn_limit(2);

    let result = agent.chat("loop forever").await.unwrap();
    assert!(!result.complete);
    assert!(result.answer.is_empty());
}

#[tokio::test]
async fn lifecycle_events_flow_through_the_bus() {
    let handler = Arc::new(CapturingHandler {
        events: Mutex::new(Vec::new()),
    });
    let bus = EventBus::start(handler.clone());

    let provider = ScriptedProvider::new(vec![
        "<REASONING>\nthink\n</REASONING>\n<ACTION>fetch_numbers</ACTION>\n<ACTION_INPUT>\n{}\n</ACTION_INPUT>",
        "<ANSWER>\nall done\n</ANSWER>",
    ]);
    let mut agent = Agent::new("observed", provider, "scripted-model")
        .with_tools(tool_map(Arc::new(FetchNumbersTool)))
        .with_events(
            bus.sink(),
            EventScope {
                mission_id: "m-1".to_string(),
                task: Some("t-1".to_string()),
            },
        );
    agent.chat("work").await.unwrap();
    drop(agent);
    bus.shutdown().await;

    let events = handler.events.lock().unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(types.first(), Some(&"agent_started"));
    assert!(types.contains(&"agent_thinking"));
    assert!(types.contains(&"agent_calling_tool"));
    assert!(types.contains(&"agent_tool_complete"));
    assert!(types.contains(&"agent_answer"));
    assert_eq!(types.last(), Some(&"agent_completed"));
    for event in events.iter() {
        assert_eq!(event.mission_id(), "m-1");
        assert_eq!(event.task(), Some("t-1"));
    }
}
