//! The supervisor: an LM-driven orchestrator scoped to one task.
//!
//! A supervisor never does the work itself. It drives the same turn loop
//! as an agent, but its tool set delegates: `call_agent` assigns work to
//! (or resumes) sub-agents, `ask_agent` asks a quick question answered
//! from an agent's memory, and `query_task_output` reads the structured
//! outputs of completed dependency tasks. Sub-agent results come back as
//! structured observation envelopes:
//!
//! ```text
//! <STATUS>success</STATUS><AGENT_ID>researcher_ab12cd34</AGENT_ID><ANSWER>…</ANSWER>
//! <STATUS>failed</STATUS><AGENT_ID>…</AGENT_ID><ERROR_TYPE>provider</ERROR_TYPE><ERROR>…</ERROR><RETRYABLE>true</RETRYABLE>
//! ```
//!
//! On its terminal `<ANSWER>` the supervisor may append `<OUTPUT>` and
//! `<LEARNINGS>` JSON blocks; both are parsed off, and the remaining text
//! becomes the task (or iteration) summary.
//!
//! # Agent reuse semantics
//!
//! `call_agent(task = …)` always starts a fresh assignment: an existing
//! instance is reset and abandons anything in flight. `call_agent(response
//! = …)` continues an agent that previously ended its turn with
//! `<ASK_SUPE>`. Agents inherited from dependency tasks accept only
//! `response` and `ask_agent`; assigning them a fresh `task` is refused.

use crate::armada::agent::{Agent, ChatResult, EventScope};
use crate::armada::config::AgentConfig;
use crate::armada::event::{EventSink, MissionEvent};
use crate::armada::prompts::{self, STOP_SENTINEL};
use crate::armada::provider::{Provider, ProviderRegistry};
use crate::armada::pruning::PruningManager;
use crate::armada::result_store::{InterceptorConfig, ResultInterceptor, ResultStore};
use crate::armada::schema::FieldSpec;
use crate::armada::session::Session;
use crate::armada::stores::{
    DatasetStore, KnowledgeStore, SessionSnapshot, SnapshotMessage, TaskOutput,
};
use crate::armada::tools::result_access::install_result_tools;
use crate::armada::tools::{
    parse_object_input, render_tool_docs, require_str, Tool, ToolMap,
};
use crate::armada::turn::{preview, TurnObserver, TurnOrchestrator};
use crate::armada::turn_log::TurnLogger;
use crate::armada::turn_parser::TurnHandler;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Roster and factory
// ---------------------------------------------------------------------------

/// Live agent instances reachable from one supervisor.
///
/// Cloning shares the underlying agent handles; the runner clones an
/// inherited roster into each iteration so per-item supervisors see the
/// same back-references.
#[derive(Clone, Default)]
pub struct AgentRoster {
    /// Instances keyed by agent id.
    instances: HashMap<String, Arc<Mutex<Agent>>>,
    /// Config name -> id of the current instance for that name.
    by_name: HashMap<String, String>,
    /// Ids inherited from dependency tasks; `task` assignments are
    /// refused for these.
    inherited: HashSet<String>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt another roster's agents as inherited back-references.
    pub fn adopt_inherited(&mut self, other: &AgentRoster) {
        for (id, agent) in &other.instances {
            self.instances.insert(id.clone(), Arc::clone(agent));
            self.inherited.insert(id.clone());
        }
        for (name, id) in &other.by_name {
            self.by_name.entry(name.clone()).or_insert_with(|| id.clone());
        }
    }

    /// Register a freshly built instance under its config name.
    pub fn insert_fresh(&mut self, agent: Agent) -> Arc<Mutex<Agent>> {
        let id = agent.id.clone();
        let name = agent.name.clone();
        let arc = Arc::new(Mutex::new(agent));
        self.instances.insert(id.clone(), Arc::clone(&arc));
        self.by_name.insert(name, id);
        arc
    }

    /// Resolve by agent id first, then by config name.
    pub fn find(&self, key: &str) -> Option<Arc<Mutex<Agent>>> {
        if let Some(agent) = self.instances.get(key) {
            return Some(Arc::clone(agent));
        }
        self.by_name
            .get(key)
            .and_then(|id| self.instances.get(id))
            .map(Arc::clone)
    }

    fn current_id(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    fn is_inherited(&self, id: &str) -> bool {
        self.inherited.contains(id)
    }

    /// Ids and names of agents this roster created itself.
    pub fn owned_ids(&self) -> Vec<String> {
        self.instances
            .keys()
            .filter(|id| !self.inherited.contains(*id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Builds fresh agents for one task invocation.
pub struct AgentFactory {
    /// Configs of the agents callable from this task.
    pub agent_configs: Vec<AgentConfig>,
    pub providers: Arc<ProviderRegistry>,
    /// Implementations for every configured tool name.
    pub tools: ToolMap,
    pub secrets: HashMap<String, String>,
    pub events: EventSink,
    pub scope: EventScope,
    pub dataset_store: Option<Arc<dyn DatasetStore>>,
    pub dataset_notes: Option<String>,
    pub turn_log_dir: Option<PathBuf>,
}

impl AgentFactory {
    /// Agent `(name, role)` pairs for prompt rendering.
    pub fn agent_names(&self) -> Vec<(String, String)> {
        self.agent_configs
            .iter()
            .map(|a| (a.name.clone(), a.role.clone()))
            .collect()
    }

    /// Build a fresh instance for a configured agent name.
    pub fn build(&self, name: &str) -> Result<Agent, Box<dyn Error + Send + Sync>> {
        let config = self
            .agent_configs
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| format!("agent '{}' is not available in this task", name))?;
        let provider = self.providers.resolve(&config.model).ok_or_else(|| {
            format!("no provider registered for model '{}'", config.model)
        })?;
        let model = provider.model_name().to_string();

        let mut tool_map = ToolMap::new();
        for tool_name in &config.tools {
            match self.tools.get(tool_name) {
                Some(tool) => {
                    tool_map.insert(tool_name.clone(), Arc::clone(tool));
                }
                None => {
                    return Err(format!(
                        "no implementation registered for tool '{}' required by agent '{}'",
                        tool_name, name
                    )
                    .into())
                }
            }
        }

        let mut agent = Agent::new(config.name.as_str(), provider, model)
            .with_personality(config.personality.as_str())
            .with_role(config.role.as_str())
            .with_tools(tool_map)
            .with_secrets(self.secrets.clone())
            .with_events(self.events.clone(), self.scope.clone());
        if let Some(limit) = config.turn_limit {
            agent = agent.with_turn_limit(limit);
        }
        let single = config.single_tool_limit.unwrap_or(0);
        let all = config.all_tool_limit.unwrap_or(0);
        if single > 0 || all > 0 {
            agent = agent.with_prune_limits(single, all);
        }
        if let Some(datasets) = &self.dataset_store {
            agent = agent.with_dataset_store(Arc::clone(datasets));
            if let Some(notes) = &self.dataset_notes {
                agent = agent.with_dataset_notes(notes.clone());
            }
        }
        if let Some(dir) = &self.turn_log_dir {
            match TurnLogger::create(dir, agent.session().id()) {
                Ok(logger) => agent = agent.with_turn_logger(logger),
                Err(e) => log::warn!("turn logger unavailable for agent '{}': {}", name, e),
            }
        }
        Ok(agent)
    }
}

// ---------------------------------------------------------------------------
// Supervisor tools
// ---------------------------------------------------------------------------

fn answer_envelope(agent_id: &str, result: &ChatResult) -> String {
    if !result.ask_supe.is_empty() {
        format!(
            "<STATUS>success</STATUS><AGENT_ID>{}</AGENT_ID><ASK_SUPE>{}</ASK_SUPE>",
            agent_id, result.ask_supe
        )
    } else {
        format!(
            "<STATUS>success</STATUS><AGENT_ID>{}</AGENT_ID><ANSWER>{}</ANSWER>",
            agent_id, result.answer
        )
    }
}

fn failure_envelope(agent_id: &str, error_type: &str, error: &str, retryable: bool) -> String {
    format!(
        "<STATUS>failed</STATUS><AGENT_ID>{}</AGENT_ID><ERROR_TYPE>{}</ERROR_TYPE><ERROR>{}</ERROR><RETRYABLE>{}</RETRYABLE>",
        agent_id, error_type, error, retryable
    )
}

/// `call_agent(name, task | response)`: assign or resume a sub-agent.
pub struct CallAgentTool {
    roster: Arc<Mutex<AgentRoster>>,
    factory: Arc<AgentFactory>,
}

impl CallAgentTool {
    pub fn new(roster: Arc<Mutex<AgentRoster>>, factory: Arc<AgentFactory>) -> Self {
        Self { roster, factory }
    }
}

#[async_trait]
impl Tool for CallAgentTool {
    fn name(&self) -> &str {
        "call_agent"
    }

    fn description(&self) -> &str {
        "Assign a fresh task to an agent, or send a response to an agent that asked you a question."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        use crate::armada::schema::FieldType;
        vec![
            FieldSpec::new("name", FieldType::String)
                .required()
                .with_description("agent name (or agent id for response)"),
            FieldSpec::new("task", FieldType::String)
                .with_description("fresh assignment; resets the agent"),
            FieldSpec::new("response", FieldType::String)
                .with_description("continues the agent's open question"),
        ]
    }

    async fn call(&self, input: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let input = parse_object_input(input)?;
        let name = require_str(&input, "name")?;
        let task = input.get("task").and_then(Value::as_str);
        let response = input.get("response").and_then(Value::as_str);

        if let Some(task) = task {
            let existing = {
                let roster = self.roster.lock().await;
                match roster.current_id(name) {
                    Some(id) if roster.is_inherited(id) => {
                        return Err(format!(
                            "agent '{}' is inherited from an earlier task; use 'response' or ask_agent",
                            name
                        )
                        .into())
                    }
                    Some(id) => roster.find(id),
                    None => None,
                }
            };
            let agent_arc = match existing {
                Some(arc) => {
                    // Fresh assignment: abandon anything in flight.
                    arc.lock().await.reset().await;
                    arc
                }
                None => {
                    let agent = self.factory.build(name)?;
                    self.roster.lock().await.insert_fresh(agent)
                }
            };
            let mut agent = agent_arc.lock().await;
            let agent_id = agent.id.clone();
            return Ok(match agent.chat(task).await {
                Ok(result) => answer_envelope(&agent_id, &result),
                Err(e) => failure_envelope(&agent_id, "provider", &e.to_string(), true),
            });
        }

        if let Some(response) = response {
            let agent_arc = self
                .roster
                .lock()
                .await
                .find(name)
                .ok_or_else(|| format!("no agent instance '{}' to respond to", name))?;
            let mut agent = agent_arc.lock().await;
            let agent_id = agent.id.clone();
            return Ok(match agent.chat(response).await {
                Ok(result) => answer_envelope(&agent_id, &result),
                Err(e) => failure_envelope(&agent_id, "provider", &e.to_string(), true),
            });
        }

        Err("call_agent requires either 'task' or 'response'".into())
    }
}

/// `ask_agent(agent_id, question)`: a memory-only follow-up.
pub struct AskAgentTool {
    roster: Arc<Mutex<AgentRoster>>,
}

impl AskAgentTool {
    pub fn new(roster: Arc<Mutex<AgentRoster>>) -> Self {
        Self { roster }
    }
}

#[async_trait]
impl Tool for AskAgentTool {
    fn name(&self) -> &str {
        "ask_agent"
    }

    fn description(&self) -> &str {
        "Ask an agent a question answered from its conversation memory. Does not interrupt or mutate its work."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        use crate::armada::schema::FieldType;
        vec![
            FieldSpec::new("agent_id", FieldType::String).required(),
            FieldSpec::new("question", FieldType::String).required(),
        ]
    }

    async fn call(&self, input: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let input = parse_object_input(input)?;
        let agent_id = require_str(&input, "agent_id")?;
        let question = require_str(&input, "question")?;
        let agent_arc = self
            .roster
            .lock()
            .await
            .find(agent_id)
            .ok_or_else(|| format!("no agent instance '{}'", agent_id))?;
        let agent = agent_arc.lock().await;
        agent.answer_follow_up(question).await
    }
}

/// `query_task_output(task, …)`: read dependency outputs.
///
/// `filters` is a field → value equality map over iteration outputs,
/// `order_by` names an output field (or `index`), and `aggregate`
/// accepts `count`, `sum:<field>`, or `avg:<field>`.
pub struct QueryTaskOutputTool {
    knowledge: Arc<dyn KnowledgeStore>,
    mission_id: String,
}

impl QueryTaskOutputTool {
    pub fn new(knowledge: Arc<dyn KnowledgeStore>, mission_id: impl Into<String>) -> Self {
        Self {
            knowledge,
            mission_id: mission_id.into(),
        }
    }
}

#[async_trait]
impl Tool for QueryTaskOutputTool {
    fn name(&self) -> &str {
        "query_task_output"
    }

    fn description(&self) -> &str {
        "Query the stored output of a completed task: filter, slice, order, or aggregate its iteration outputs."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        use crate::armada::schema::FieldType;
        vec![
            FieldSpec::new("task", FieldType::String).required(),
            FieldSpec::new("filters", FieldType::Object),
            FieldSpec::new("item_ids", FieldType::Array),
            FieldSpec::new("limit", FieldType::Integer),
            FieldSpec::new("offset", FieldType::Integer),
            FieldSpec::new("order_by", FieldType::String),
            FieldSpec::new("desc", FieldType::Boolean),
            FieldSpec::new("aggregate", FieldType::String)
                .with_description("count | sum:<field> | avg:<field>"),
        ]
    }

    async fn call(&self, input: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let input = parse_object_input(input)?;
        let task = require_str(&input, "task")?;
        let output = self
            .knowledge
            .get_task_output(&self.mission_id, task)
            .await?
            .ok_or_else(|| format!("no output recorded for task '{}'", task))?;

        if !output.is_iterated {
            return Ok(serde_json::to_string(&output)?);
        }
        query_iterations(&output, &input)
    }
}

fn query_iterations(
    output: &TaskOutput,
    input: &Map<String, Value>,
) -> Result<String, Box<dyn Error + Send + Sync>> {
    let mut rows: Vec<_> = output.iterations.iter().collect();

    if let Some(Value::Array(ids)) = input.get("item_ids") {
        let wanted: HashSet<String> = ids
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        rows.retain(|r| wanted.contains(&r.item_id));
    }

    if let Some(Value::Object(filters)) = input.get("filters") {
        rows.retain(|r| {
            filters.iter().all(|(field, wanted)| {
                r.output
                    .as_ref()
                    .and_then(|o| o.get(field))
                    .map(|v| v == wanted)
                    .unwrap_or(false)
            })
        });
    }

    if let Some(order_by) = input.get("order_by").and_then(Value::as_str) {
        rows.sort_by(|a, b| {
            if order_by == "index" {
                a.index.cmp(&b.index)
            } else {
                let left = a.output.as_ref().and_then(|o| o.get(order_by));
                let right = b.output.as_ref().and_then(|o| o.get(order_by));
                compare_values(left, right)
            }
        });
    }
    if input.get("desc").and_then(Value::as_bool).unwrap_or(false) {
        rows.reverse();
    }

    let offset = input
        .get("offset")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    if offset < rows.len() {
        rows.drain(..offset);
    } else {
        rows.clear();
    }
    if let Some(limit) = input.get("limit").and_then(Value::as_u64) {
        rows.truncate(limit as usize);
    }

    if let Some(aggregate) = input.get("aggregate").and_then(Value::as_str) {
        if aggregate == "count" {
            return Ok(json!({"aggregate": "count", "value": rows.len()}).to_string());
        }
        if let Some(field) = aggregate
            .strip_prefix("sum:")
            .or_else(|| aggregate.strip_prefix("avg:"))
        {
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|r| {
                    r.output
                        .as_ref()
                        .and_then(|o| o.get(field))
                        .and_then(Value::as_f64)
                })
                .collect();
            let sum: f64 = values.iter().sum();
            let value = if aggregate.starts_with("avg:") {
                if values.is_empty() {
                    0.0
                } else {
                    sum / values.len() as f64
                }
            } else {
                sum
            };
            return Ok(json!({"aggregate": aggregate, "value": value}).to_string());
        }
        return Err(format!(
            "unknown aggregate '{}'; expected count, sum:<field>, or avg:<field>",
            aggregate
        )
        .into());
    }

    Ok(serde_json::to_string(&rows)?)
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Result of one supervisor invocation.
#[derive(Debug, Clone, Default)]
pub struct SupervisorOutcome {
    /// The `<ANSWER>` text with OUTPUT/LEARNINGS blocks stripped.
    pub summary: String,
    /// Parsed `<OUTPUT>` JSON object, when present and well-formed.
    pub output: Option<Map<String, Value>>,
    /// Parsed `<LEARNINGS>` JSON object, when present and well-formed.
    pub learnings: Option<Map<String, Value>>,
}

/// Orchestrates sub-agents for one task invocation.
pub struct Supervisor {
    mission_id: String,
    task_name: String,
    session: Session,
    tools: ToolMap,
    result_store: Arc<ResultStore>,
    interceptor: ResultInterceptor,
    pruning: PruningManager,
    secrets: HashMap<String, String>,
    events: EventSink,
    turn_limit: usize,
    roster: Arc<Mutex<AgentRoster>>,
    agent_names: Vec<(String, String)>,
    dep_summaries: Vec<(String, String)>,
    queryable: Vec<(String, Vec<FieldSpec>)>,
    output_schema: Option<Vec<FieldSpec>>,
    iteration: Option<usize>,
    turn_logger: Option<TurnLogger>,
    initialized: bool,
}

impl Supervisor {
    /// Create a supervisor for `task_name`, chatting through `provider`.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        mission_id: impl Into<String>,
        task_name: impl Into<String>,
    ) -> Self {
        let session = Session::new(provider, model);
        let result_store = Arc::new(ResultStore::new());
        let interceptor =
            ResultInterceptor::new(Arc::clone(&result_store), InterceptorConfig::default());
        let pruning = PruningManager::new(session.shared_state(), 0, 0);
        Self {
            mission_id: mission_id.into(),
            task_name: task_name.into(),
            session,
            tools: ToolMap::new(),
            result_store,
            interceptor,
            pruning,
            secrets: HashMap::new(),
            events: EventSink::disabled(),
            turn_limit: 0,
            roster: Arc::new(Mutex::new(AgentRoster::new())),
            agent_names: Vec::new(),
            dep_summaries: Vec::new(),
            queryable: Vec::new(),
            output_schema: None,
            iteration: None,
            turn_logger: None,
            initialized: false,
        }
    }

    /// Wire the agent roster and factory, installing `call_agent` and
    /// `ask_agent`.
    pub fn with_factory(mut self, factory: Arc<AgentFactory>, roster: Arc<Mutex<AgentRoster>>) -> Self {
        self.agent_names = factory.agent_names();
        self.secrets = factory.secrets.clone();
        self.tools.insert(
            "call_agent".to_string(),
            Arc::new(CallAgentTool {
                roster: Arc::clone(&roster),
                factory: Arc::clone(&factory),
            }),
        );
        self.tools.insert(
            "ask_agent".to_string(),
            Arc::new(AskAgentTool {
                roster: Arc::clone(&roster),
            }),
        );
        self.roster = roster;
        self
    }

    /// Wire the knowledge store, installing `query_task_output`.
    /// `queryable` lists dependency tasks and their output schemas.
    pub fn with_knowledge(
        mut self,
        knowledge: Arc<dyn KnowledgeStore>,
        queryable: Vec<(String, Vec<FieldSpec>)>,
    ) -> Self {
        self.tools.insert(
            "query_task_output".to_string(),
            Arc::new(QueryTaskOutputTool {
                knowledge,
                mission_id: self.mission_id.clone(),
            }),
        );
        self.queryable = queryable;
        self
    }

    /// One summary per completed dependency task, seeded into the
    /// session context.
    pub fn with_dep_summaries(mut self, summaries: Vec<(String, String)>) -> Self {
        self.dep_summaries = summaries;
        self
    }

    /// Declare the structured output the final answer must carry.
    pub fn with_output_schema(mut self, schema: Option<Vec<FieldSpec>>) -> Self {
        self.output_schema = schema;
        self
    }

    /// Wire mission events; `iteration` scopes streaming events to an
    /// iteration index.
    pub fn with_events(mut self, events: EventSink, iteration: Option<usize>) -> Self {
        self.events = events;
        self.iteration = iteration;
        self
    }

    pub fn with_turn_limit(mut self, turn_limit: usize) -> Self {
        self.turn_limit = turn_limit;
        self
    }

    pub fn with_turn_logger(mut self, logger: TurnLogger) -> Self {
        self.turn_logger = Some(logger);
        self
    }

    /// The session id (events and snapshots reference it).
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Render the current conversation as a persistable transcript.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let messages = self
            .session
            .history()
            .await
            .iter()
            .map(|message| SnapshotMessage {
                role: message.role.as_str().to_string(),
                content: message.content_text(),
            })
            .collect();
        SessionSnapshot {
            session_id: self.session.id().to_string(),
            mission_id: Some(self.mission_id.clone()),
            task_name: Some(self.task_name.clone()),
            messages,
            created_at: chrono::Utc::now(),
        }
    }

    /// Handle to this supervisor's roster (for downstream inheritance).
    pub fn roster(&self) -> Arc<Mutex<AgentRoster>> {
        Arc::clone(&self.roster)
    }

    async fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        install_result_tools(&mut self.tools, Arc::clone(&self.result_store), None);

        let tool_docs = render_tool_docs(&self.tools);
        let prompt = prompts::render_supervisor_prompt(
            &self.agent_names,
            &tool_docs,
            self.output_schema.as_deref(),
            &self.queryable,
        );
        self.session.add_system_prompt(prompt).await;

        if !self.dep_summaries.is_empty() {
            let mut context = String::from("## Completed dependency tasks\n\n");
            for (task, summary) in &self.dep_summaries {
                context.push_str(&format!("### {}\n{}\n\n", task, summary));
            }
            self.session.add_system_prompt(context).await;
        }
        self.session
            .set_stop_sequences(vec![STOP_SENTINEL.to_string()])
            .await;
    }

    /// Drive the task (or one iteration of it) to a terminal answer.
    pub async fn run(
        &mut self,
        input: &str,
    ) -> Result<SupervisorOutcome, Box<dyn Error + Send + Sync>> {
        self.ensure_initialized().await;
        let mut bridge = SupervisorTurnBridge {
            events: self.events.clone(),
            mission_id: self.mission_id.clone(),
            task: self.task_name.clone(),
            iteration: self.iteration,
        };
        let mut orchestrator = TurnOrchestrator {
            session: &self.session,
            tools: &self.tools,
            interceptor: &self.interceptor,
            pruning: &mut self.pruning,
            secrets: &self.secrets,
            turn_limit: self.turn_limit,
            turn_logger: self.turn_logger.as_ref(),
        };
        let outcome = orchestrator.run(&mut bridge, input).await?;

        // OUTPUT and LEARNINGS trail the closing </ANSWER> tag, so they
        // are read from the raw final response.
        let output = extract_json_block(&outcome.raw_response, "OUTPUT", &self.task_name);
        let learnings = extract_json_block(&outcome.raw_response, "LEARNINGS", &self.task_name);
        let summary = prompts::strip_tag_blocks(
            &prompts::strip_tag_blocks(&outcome.answer, "OUTPUT"),
            "LEARNINGS",
        )
        .trim()
        .to_string();

        match self.iteration {
            Some(index) => self.events.emit(MissionEvent::IterationAnswer {
                mission_id: self.mission_id.clone(),
                task: self.task_name.clone(),
                index,
                text: summary.clone(),
            }),
            None => self.events.emit(MissionEvent::CommanderAnswer {
                mission_id: self.mission_id.clone(),
                task: self.task_name.clone(),
                text: summary.clone(),
            }),
        }

        Ok(SupervisorOutcome {
            summary,
            output,
            learnings,
        })
    }

    /// Close the supervisor session and every agent this roster created
    /// itself. Inherited agents stay alive for their owners.
    pub async fn close(&mut self) {
        let owned = {
            let roster = self.roster.lock().await;
            roster
                .owned_ids()
                .into_iter()
                .filter_map(|id| roster.find(&id))
                .collect::<Vec<_>>()
        };
        for agent in owned {
            agent.lock().await.close().await;
        }
        self.session.close().await;
    }
}

/// Compose the supervisor input for one iteration: the rendered
/// objective, the current item, and any carried-over context.
pub fn compose_iteration_prompt(
    objective: &str,
    item: &Map<String, Value>,
    prev_output: Option<&Map<String, Value>>,
    prev_learnings: Option<&Map<String, Value>>,
    retry_learnings: Option<&Map<String, Value>>,
) -> String {
    let mut prompt = format!(
        "{}\n\n## Current item\n\n{}",
        objective,
        Value::Object(item.clone())
    );
    if let Some(output) = prev_output {
        prompt.push_str(&format!(
            "\n\n## Previous iteration output\n\n{}",
            Value::Object(output.clone())
        ));
    }
    if let Some(learnings) = prev_learnings {
        prompt.push_str(&format!(
            "\n\n## Previous iteration learnings\n\n{}",
            Value::Object(learnings.clone())
        ));
    }
    if let Some(learnings) = retry_learnings {
        prompt.push_str(&format!(
            "\n\n## Learnings from failed attempts\n\n{}",
            Value::Object(learnings.clone())
        ));
    }
    prompt
}

fn extract_json_block(answer: &str, tag: &str, task: &str) -> Option<Map<String, Value>> {
    let block = prompts::extract_tag(answer, tag)?;
    match serde_json::from_str::<Value>(block.trim()) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            log::warn!("task '{}': {} block is not a JSON object", task, tag);
            None
        }
        Err(e) => {
            log::warn!("task '{}': malformed {} block: {}", task, tag, e);
            None
        }
    }
}

/// Bridges supervisor turn callbacks into commander / iteration events.
struct SupervisorTurnBridge {
    events: EventSink,
    mission_id: String,
    task: String,
    iteration: Option<usize>,
}

impl SupervisorTurnBridge {
    fn emit_reasoning(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        match self.iteration {
            Some(index) => self.events.emit(MissionEvent::IterationReasoning {
                mission_id: self.mission_id.clone(),
                task: self.task.clone(),
                index,
                text: text.to_string(),
            }),
            None => self.events.emit(MissionEvent::CommanderReasoning {
                mission_id: self.mission_id.clone(),
                task: self.task.clone(),
                text: text.to_string(),
            }),
        }
    }
}

impl TurnHandler for SupervisorTurnBridge {
    fn on_thinking(&mut self, text: &str) {
        self.emit_reasoning(text);
    }

    fn on_reasoning_chunk(&mut self, text: &str) {
        self.emit_reasoning(text);
    }
}

impl TurnObserver for SupervisorTurnBridge {
    fn on_calling_tool(&mut self, tool: &str, input: &str) {
        self.events.emit(MissionEvent::CommanderCallingTool {
            mission_id: self.mission_id.clone(),
            task: self.task.clone(),
            tool: tool.to_string(),
            input_preview: preview(input, 120),
        });
    }

    fn on_tool_complete(&mut self, tool: &str, success: bool) {
        self.events.emit(MissionEvent::CommanderToolComplete {
            mission_id: self.mission_id.clone(),
            task: self.task.clone(),
            tool: tool.to_string(),
            success,
        });
    }
}
