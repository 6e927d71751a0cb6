//! Mission execution: topological task scheduling, dataset iteration,
//! retries, and fail-fast aggregation.
//!
//! The runner owns the per-mission stores and the event bus, resolves
//! inputs and datasets up front, and then drives the task DAG from a
//! single coordinator loop: every task whose dependencies are completed
//! launches concurrently; the coordinator waits for the next completion
//! and re-evaluates. Cycles were already refused at config validation,
//! so the loop always makes progress.
//!
//! Iterated tasks run one supervisor invocation per dataset item.
//! Sequential iteration passes the previous item's output and learnings
//! forward and fails fast on exhausted retries; parallel iteration fans
//! items out under a concurrency cap, lets every item run to completion,
//! and fails the task afterwards if any item failed.

use crate::armada::agent::EventScope;
use crate::armada::cancel::CancelToken;
use crate::armada::config::{
    ConfigError, IteratorSpec, MissionConfig, MissionSpec, TaskGraph, TaskSpec,
};
use crate::armada::dataset::{Cursor, Dataset};
use crate::armada::event::{EventBus, EventSink, HandlerChain, LogHandler, MissionEvent, MissionHandler};
use crate::armada::prompts::render_template;
use crate::armada::provider::ProviderRegistry;
use crate::armada::schema::FieldSpec;
use crate::armada::stores::{
    DatasetStore, InMemoryDatasetStore, InMemoryKnowledgeStore, IterationOutput, KnowledgeStore,
    SessionStore, TaskOutput, TaskStatus,
};
use crate::armada::supervisor::{
    compose_iteration_prompt, AgentFactory, AgentRoster, Supervisor, SupervisorOutcome,
};
use crate::armada::tools::ToolMap;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Bitset
// ---------------------------------------------------------------------------

/// Fixed-width bitset over task ids; the ready/completed bookkeeping of
/// the scheduler.
#[derive(Clone)]
pub(crate) struct Bitset {
    words: Vec<u64>,
    len: usize,
}

impl Bitset {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
            len,
        }
    }

    pub(crate) fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 64] |= 1 << (index % 64);
    }

    pub(crate) fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub(crate) fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `true` when every id in `ids` is set.
    pub(crate) fn contains_all(&self, ids: &[usize]) -> bool {
        ids.iter().all(|&id| self.get(id))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// In-flight result of one task, before aggregation into the report.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_name: String,
    pub summary: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TaskResult {
    fn failure(task_name: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task_name: task_name.to_string(),
            summary: String::new(),
            success: false,
            error: Some(error),
        }
    }
}

/// Final outcome of a mission run.
#[derive(Debug, Clone)]
pub struct MissionReport {
    pub mission_id: String,
    pub success: bool,
    /// Stored task outputs, in completion-store order.
    pub outputs: Vec<TaskOutput>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes missions from a resolved [`MissionConfig`].
pub struct MissionRunner {
    config: MissionConfig,
    providers: Arc<ProviderRegistry>,
    tools: ToolMap,
    knowledge: Arc<dyn KnowledgeStore>,
    datasets: Arc<dyn DatasetStore>,
    handler: Arc<dyn MissionHandler>,
    sessions: Option<Arc<dyn SessionStore>>,
    cancel: CancelToken,
    turn_log_dir: Option<PathBuf>,
    supervisor_turn_limit: usize,
}

impl MissionRunner {
    /// Create a runner with in-memory stores and CLI log presentation.
    pub fn new(config: MissionConfig, providers: ProviderRegistry) -> Self {
        Self {
            config,
            providers: Arc::new(providers),
            tools: ToolMap::new(),
            knowledge: Arc::new(InMemoryKnowledgeStore::new()),
            datasets: Arc::new(InMemoryDatasetStore::new()),
            handler: Arc::new(HandlerChain::new().with(Arc::new(LogHandler))),
            sessions: None,
            cancel: CancelToken::new(),
            turn_log_dir: None,
            supervisor_turn_limit: 0,
        }
    }

    /// Implementations for the config's tool names.
    pub fn with_tools(mut self, tools: ToolMap) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_knowledge_store(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = store;
        self
    }

    pub fn with_dataset_store(mut self, store: Arc<dyn DatasetStore>) -> Self {
        self.datasets = store;
        self
    }

    /// Replace the handler chain observing this runner's missions.
    pub fn with_handler(mut self, handler: Arc<dyn MissionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Persist supervisor session transcripts as they complete.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Directory for per-session turn logs.
    pub fn with_turn_log_dir(mut self, dir: PathBuf) -> Self {
        self.turn_log_dir = Some(dir);
        self
    }

    /// Cap supervisor turn loops; 0 (the default) means unbounded.
    pub fn with_supervisor_turn_limit(mut self, limit: usize) -> Self {
        self.supervisor_turn_limit = limit;
        self
    }

    /// The token that cancels missions started by this runner.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute a mission to completion.
    ///
    /// Resolution (inputs, datasets, graph) aborts before any task runs;
    /// from then on failures are per-task and the mission fails fast.
    pub async fn run(
        &self,
        mission_name: &str,
        inputs: HashMap<String, String>,
    ) -> Result<MissionReport, Box<dyn Error + Send + Sync>> {
        self.config.validate()?;
        let mission = self
            .config
            .find_mission(mission_name)
            .ok_or_else(|| ConfigError::UnknownMission(mission_name.to_string()))?
            .clone();
        let mission_id = Uuid::new_v4().to_string();

        let (resolved_inputs, raw_inputs, mut secrets) = resolve_inputs(&mission, &inputs)?;
        secrets.extend(self.config.secret_map());
        resolve_datasets(&mission, &raw_inputs, self.datasets.as_ref()).await?;

        let graph = TaskGraph::build(&mission.tasks)?;
        graph.topo_order()?;

        let bus = EventBus::start(Arc::clone(&self.handler));
        let sink = bus.sink();
        sink.emit(MissionEvent::MissionStarted {
            mission_id: mission_id.clone(),
            mission_name: mission.name.clone(),
        });

        let ctx = Arc::new(MissionCtx {
            mission_id: mission_id.clone(),
            mission,
            config: self.config.clone(),
            graph,
            providers: Arc::clone(&self.providers),
            tools: self.tools.clone(),
            knowledge: Arc::clone(&self.knowledge),
            datasets: Arc::clone(&self.datasets),
            sink: sink.clone(),
            secrets,
            vars: self.config.variable_map(),
            inputs: resolved_inputs,
            cancel: self.cancel.clone(),
            sessions: self.sessions.clone(),
            rosters: Mutex::new(HashMap::new()),
            turn_log_dir: self.turn_log_dir.clone(),
            supervisor_turn_limit: self.supervisor_turn_limit,
        });

        let (all_completed, failure) = schedule(&ctx).await;

        let mut error = failure;
        if self.cancel.is_cancelled() && error.is_none() {
            error = Some("mission cancelled".to_string());
        }
        let success = error.is_none() && all_completed;
        sink.emit(MissionEvent::MissionCompleted {
            mission_id: mission_id.clone(),
            success,
        });

        let outputs = self
            .knowledge
            .list_task_outputs(&mission_id)
            .await
            .unwrap_or_default();

        // Every sink clone must drop before shutdown can drain the bus.
        drop(sink);
        drop(ctx);
        bus.shutdown().await;

        Ok(MissionReport {
            mission_id,
            success,
            outputs,
            error,
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

struct MissionCtx {
    mission_id: String,
    mission: MissionSpec,
    config: MissionConfig,
    graph: TaskGraph,
    providers: Arc<ProviderRegistry>,
    tools: ToolMap,
    knowledge: Arc<dyn KnowledgeStore>,
    datasets: Arc<dyn DatasetStore>,
    sink: EventSink,
    secrets: HashMap<String, String>,
    vars: Map<String, Value>,
    inputs: Map<String, Value>,
    cancel: CancelToken,
    sessions: Option<Arc<dyn SessionStore>>,
    /// task name -> published agent roster, for downstream inheritance.
    rosters: Mutex<HashMap<String, Arc<Mutex<AgentRoster>>>>,
    turn_log_dir: Option<PathBuf>,
    supervisor_turn_limit: usize,
}

/// Drive the DAG until every task completed or a failure stops new
/// launches. Returns (all-completed, first failure).
async fn schedule(ctx: &Arc<MissionCtx>) -> (bool, Option<String>) {
    let total = ctx.graph.len();
    let mut completed = Bitset::new(total);
    let mut in_flight = Bitset::new(total);
    let mut failure: Option<String> = None;
    let mut join_set: JoinSet<(usize, TaskResult)> = JoinSet::new();

    loop {
        if failure.is_none() && !ctx.cancel.is_cancelled() {
            for id in 0..total {
                if completed.get(id) || in_flight.get(id) {
                    continue;
                }
                if !completed.contains_all(ctx.graph.deps(id)) {
                    continue;
                }
                in_flight.set(id);
                let ctx = Arc::clone(ctx);
                join_set.spawn(async move {
                    let result = run_task(&ctx, id).await;
                    (id, result)
                });
            }
        }

        if join_set.is_empty() {
            break;
        }
        match join_set.join_next().await {
            Some(Ok((id, result))) => {
                completed.set(id);
                if !result.success && failure.is_none() {
                    failure = Some(result.error.clone().unwrap_or_else(|| {
                        format!("task '{}' failed", result.task_name)
                    }));
                }
            }
            Some(Err(join_error)) => {
                if failure.is_none() {
                    failure = Some(format!("task execution panicked: {}", join_error));
                }
            }
            None => break,
        }
    }

    (completed.count() == total, failure)
}

/// Execute one task node: dependency plumbing, then single or iterated
/// execution, then lifecycle events.
async fn run_task(ctx: &Arc<MissionCtx>, id: usize) -> TaskResult {
    let task = ctx.mission.tasks[id].clone();
    ctx.sink.emit(MissionEvent::TaskStarted {
        mission_id: ctx.mission_id.clone(),
        task: task.name.clone(),
    });

    let result = match task.iterator.clone() {
        None => run_single(ctx, &task, id).await,
        Some(iterator) => run_iterated(ctx, &task, &iterator, id).await,
    };

    if result.success {
        ctx.sink.emit(MissionEvent::TaskCompleted {
            mission_id: ctx.mission_id.clone(),
            task: task.name.clone(),
            summary: result.summary.clone(),
        });
    } else {
        ctx.sink.emit(MissionEvent::TaskFailed {
            mission_id: ctx.mission_id.clone(),
            task: task.name.clone(),
            error: result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        });
    }
    result
}

/// Summaries, queryable schemas, and inherited agents from the task's
/// transitive dependency chain.
async fn dependency_context(
    ctx: &Arc<MissionCtx>,
    id: usize,
) -> (Vec<(String, String)>, Vec<(String, Vec<FieldSpec>)>, AgentRoster) {
    let chain = ctx.graph.dependency_chain(id);
    let mut summaries = Vec::new();
    let mut queryable = Vec::new();
    for dep_id in &chain {
        let dep_name = ctx.graph.name(*dep_id).to_string();
        if let Ok(Some(output)) = ctx.knowledge.get_task_output(&ctx.mission_id, &dep_name).await {
            if output.status.is_success() {
                summaries.push((dep_name.clone(), output.summary.clone()));
            }
        }
        let dep_task = &ctx.mission.tasks[*dep_id];
        queryable.push((dep_name, dep_task.output.clone().unwrap_or_default()));
    }

    let mut inherited = AgentRoster::new();
    let rosters = ctx.rosters.lock().await;
    for dep_id in &chain {
        if let Some(roster) = rosters.get(ctx.graph.name(*dep_id)) {
            inherited.adopt_inherited(&*roster.lock().await);
        }
    }
    (summaries, queryable, inherited)
}

fn dataset_notes(mission: &MissionSpec) -> Option<String> {
    if mission.datasets.is_empty() {
        return None;
    }
    let mut notes = String::new();
    for dataset in &mission.datasets {
        notes.push_str(&format!(
            "- {}{}\n",
            dataset.name,
            if dataset.description.is_empty() {
                String::new()
            } else {
                format!(": {}", dataset.description)
            }
        ));
    }
    Some(notes)
}

fn build_supervisor(
    ctx: &Arc<MissionCtx>,
    task: &TaskSpec,
    iteration: Option<usize>,
    inherited: AgentRoster,
    summaries: Vec<(String, String)>,
    queryable: Vec<(String, Vec<FieldSpec>)>,
) -> Result<Supervisor, String> {
    let provider = ctx
        .providers
        .resolve(&ctx.mission.supervisor_model)
        .ok_or_else(|| {
            format!(
                "no provider registered for supervisor model '{}'",
                ctx.mission.supervisor_model
            )
        })?;
    let model = provider.model_name().to_string();

    let agent_configs = ctx
        .mission
        .task_agents(task)
        .iter()
        .filter_map(|name| ctx.config.find_agent(name).cloned())
        .collect();
    let scope = EventScope {
        mission_id: ctx.mission_id.clone(),
        task: Some(task.name.clone()),
    };
    let factory = Arc::new(AgentFactory {
        agent_configs,
        providers: Arc::clone(&ctx.providers),
        tools: ctx.tools.clone(),
        secrets: ctx.secrets.clone(),
        events: ctx.sink.clone(),
        scope,
        dataset_store: Some(Arc::clone(&ctx.datasets)),
        dataset_notes: dataset_notes(&ctx.mission),
        turn_log_dir: ctx.turn_log_dir.clone(),
    });
    let roster = Arc::new(Mutex::new(inherited));

    let mut supervisor = Supervisor::new(provider, model, ctx.mission_id.as_str(), task.name.as_str())
        .with_factory(factory, roster)
        .with_knowledge(Arc::clone(&ctx.knowledge), queryable)
        .with_dep_summaries(summaries)
        .with_output_schema(task.output.clone())
        .with_events(ctx.sink.clone(), iteration)
        .with_turn_limit(ctx.supervisor_turn_limit);
    if let Some(dir) = &ctx.turn_log_dir {
        let session_id = supervisor.session_id().to_string();
        match crate::armada::turn_log::TurnLogger::create(dir, &session_id) {
            Ok(logger) => supervisor = supervisor.with_turn_logger(logger),
            Err(e) => log::warn!("turn logger unavailable for task '{}': {}", task.name, e),
        }
    }
    Ok(supervisor)
}

/// Run a supervisor under the mission cancellation token.
async fn run_supervisor_guarded(
    ctx: &Arc<MissionCtx>,
    supervisor: &mut Supervisor,
    input: &str,
) -> Result<SupervisorOutcome, String> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err("mission cancelled".to_string()),
        outcome = supervisor.run(input) => outcome.map_err(|e| e.to_string()),
    }
}

/// Required fields declared by the task but absent (or null) in the
/// structured output.
fn missing_required(
    schema: Option<&[FieldSpec]>,
    output: Option<&Map<String, Value>>,
) -> Vec<String> {
    match schema {
        None => Vec::new(),
        Some(schema) => schema
            .iter()
            .filter(|field| field.required)
            .filter(|field| {
                output
                    .and_then(|o| o.get(&field.name))
                    .map_or(true, Value::is_null)
            })
            .map(|field| field.name.clone())
            .collect(),
    }
}

/// Merge learnings from a failed attempt: array-typed fields
/// concatenate, everything else overwrites.
fn merge_learnings(acc: &mut Option<Map<String, Value>>, incoming: Option<&Map<String, Value>>) {
    let incoming = match incoming {
        Some(map) => map,
        None => return,
    };
    let target = acc.get_or_insert_with(Map::new);
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(new_items)) => {
                existing.extend(new_items.iter().cloned());
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Single task
// ---------------------------------------------------------------------------

async fn run_single(ctx: &Arc<MissionCtx>, task: &TaskSpec, id: usize) -> TaskResult {
    let (summaries, queryable, inherited) = dependency_context(ctx, id).await;
    let mut supervisor =
        match build_supervisor(ctx, task, None, inherited, summaries, queryable) {
            Ok(supervisor) => supervisor,
            Err(error) => return TaskResult::failure(&task.name, error),
        };

    let objective = render_template(&task.objective, &ctx.vars, &ctx.inputs, None);
    let outcome = run_supervisor_guarded(ctx, &mut supervisor, &objective).await;
    snapshot_session(ctx, &supervisor).await;

    match outcome {
        Ok(outcome) => {
            let missing = missing_required(task.output.as_deref(), outcome.output.as_ref());
            if !missing.is_empty() {
                let error = format!("missing required output fields: {}", missing.join(", "));
                supervisor.close().await;
                store_task_output(
                    ctx,
                    TaskOutput::single(task.name.as_str(), TaskStatus::Failed, outcome.summary.as_str(), outcome.output),
                )
                .await;
                return TaskResult::failure(&task.name, error);
            }
            store_task_output(
                ctx,
                TaskOutput::single(
                    task.name.as_str(),
                    TaskStatus::Success,
                    outcome.summary.as_str(),
                    outcome.output.clone(),
                ),
            )
            .await;
            // Publish this task's agents for downstream follow-ups. The
            // supervisor is not closed: inherited agents must stay alive.
            ctx.rosters
                .lock()
                .await
                .insert(task.name.clone(), supervisor.roster());
            TaskResult {
                task_name: task.name.clone(),
                summary: outcome.summary,
                success: true,
                error: None,
            }
        }
        Err(error) => {
            supervisor.close().await;
            store_task_output(
                ctx,
                TaskOutput::single(task.name.as_str(), TaskStatus::Failed, "", None),
            )
            .await;
            TaskResult::failure(&task.name, error)
        }
    }
}

/// Persist the supervisor transcript when a session store is attached.
async fn snapshot_session(ctx: &Arc<MissionCtx>, supervisor: &Supervisor) {
    if let Some(sessions) = &ctx.sessions {
        if let Err(e) = sessions.put(supervisor.snapshot().await).await {
            log::warn!("failed to store session snapshot: {}", e);
        }
    }
}

async fn store_task_output(ctx: &Arc<MissionCtx>, output: TaskOutput) {
    if let Err(e) = ctx.knowledge.put_task_output(&ctx.mission_id, output).await {
        log::warn!("failed to store task output: {}", e);
    }
}

// ---------------------------------------------------------------------------
// Iterated tasks
// ---------------------------------------------------------------------------

async fn run_iterated(
    ctx: &Arc<MissionCtx>,
    task: &TaskSpec,
    iterator: &IteratorSpec,
    id: usize,
) -> TaskResult {
    // Snapshot at task entry; later dataset mutations are invisible here.
    let dataset = match ctx.datasets.get(&iterator.dataset).await {
        Ok(Some(dataset)) => dataset,
        Ok(None) => {
            return TaskResult::failure(
                &task.name,
                format!("dataset '{}' not found", iterator.dataset),
            )
        }
        Err(e) => return TaskResult::failure(&task.name, e.to_string()),
    };
    if let Err(reason) = dataset.validate() {
        return TaskResult::failure(&task.name, reason);
    }

    let (summaries, queryable, inherited) = dependency_context(ctx, id).await;

    if iterator.parallel {
        run_parallel_iterations(ctx, task, iterator, &dataset, summaries, queryable, inherited)
            .await
    } else {
        run_sequential_iterations(ctx, task, iterator, &dataset, summaries, queryable, inherited)
            .await
    }
}

/// One item, with retries. Returns the successful outcome or the final
/// error after retries are exhausted.
#[allow(clippy::too_many_arguments)]
async fn run_item_with_retries(
    ctx: &Arc<MissionCtx>,
    task: &TaskSpec,
    iterator: &IteratorSpec,
    index: usize,
    item: &Map<String, Value>,
    prev_output: Option<&Map<String, Value>>,
    prev_learnings: Option<&Map<String, Value>>,
    summaries: &[(String, String)],
    queryable: &[(String, Vec<FieldSpec>)],
    inherited: &AgentRoster,
) -> Result<SupervisorOutcome, String> {
    let objective = render_template(&task.objective, &ctx.vars, &ctx.inputs, Some(item));
    let mut retry_learnings: Option<Map<String, Value>> = None;

    for attempt in 0..=iterator.max_retries {
        if ctx.cancel.is_cancelled() {
            return Err("mission cancelled".to_string());
        }
        let prompt = compose_iteration_prompt(
            &objective,
            item,
            prev_output,
            prev_learnings,
            retry_learnings.as_ref(),
        );
        ctx.sink.emit(MissionEvent::IterationStarted {
            mission_id: ctx.mission_id.clone(),
            task: task.name.clone(),
            index,
            prompt: prompt.clone(),
        });

        let mut supervisor = build_supervisor(
            ctx,
            task,
            Some(index),
            inherited.clone(),
            summaries.to_vec(),
            queryable.to_vec(),
        )?;
        let outcome = run_supervisor_guarded(ctx, &mut supervisor, &prompt).await;
        snapshot_session(ctx, &supervisor).await;
        // Per-item agents die with the item.
        supervisor.close().await;

        let error = match outcome {
            Ok(outcome) => {
                let missing = missing_required(task.output.as_deref(), outcome.output.as_ref());
                if missing.is_empty() {
                    return Ok(outcome);
                }
                merge_learnings(&mut retry_learnings, outcome.learnings.as_ref());
                format!("missing required output fields: {}", missing.join(", "))
            }
            Err(error) => error,
        };

        if attempt < iterator.max_retries {
            ctx.sink.emit(MissionEvent::IterationRetrying {
                mission_id: ctx.mission_id.clone(),
                task: task.name.clone(),
                index,
                attempt: attempt + 1,
                learnings: retry_learnings.clone().map(Value::Object),
            });
        } else {
            return Err(error);
        }
    }
    unreachable!("retry loop always returns")
}

#[allow(clippy::too_many_arguments)]
async fn run_sequential_iterations(
    ctx: &Arc<MissionCtx>,
    task: &TaskSpec,
    iterator: &IteratorSpec,
    dataset: &Dataset,
    summaries: Vec<(String, String)>,
    queryable: Vec<(String, Vec<FieldSpec>)>,
    inherited: AgentRoster,
) -> TaskResult {
    let mut cursor = Cursor::new(dataset.records.clone(), 1);
    let total = cursor.len();
    let mut iterations: Vec<IterationOutput> = Vec::new();
    let mut prev_output: Option<Map<String, Value>> = None;
    let mut prev_learnings: Option<Map<String, Value>> = None;

    while !cursor.is_done() {
        let index = cursor.index();
        let item = cursor
            .current()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let item_id = dataset.item_id(index);

        ctx.sink.emit(MissionEvent::TaskIterationStarted {
            mission_id: ctx.mission_id.clone(),
            task: task.name.clone(),
            index,
            item_id: item_id.clone(),
        });

        let attempt = run_item_with_retries(
            ctx,
            task,
            iterator,
            index,
            &item,
            prev_output.as_ref(),
            prev_learnings.as_ref(),
            &summaries,
            &queryable,
            &inherited,
        )
        .await;

        match attempt {
            Ok(outcome) => {
                let iteration = IterationOutput {
                    index,
                    item_id,
                    status: TaskStatus::Success,
                    summary: outcome.summary.clone(),
                    output: outcome.output.clone(),
                    timestamp: Utc::now(),
                };
                persist_iteration(ctx, &task.name, &iteration).await;
                emit_iteration_end(ctx, &task.name, &iteration, None);
                iterations.push(iteration);
                prev_output = outcome.output;
                prev_learnings = outcome.learnings;
                cursor.submit_result();
            }
            Err(error) => {
                let iteration = IterationOutput {
                    index,
                    item_id,
                    status: TaskStatus::Failed,
                    summary: error.clone(),
                    output: None,
                    timestamp: Utc::now(),
                };
                persist_iteration(ctx, &task.name, &iteration).await;
                emit_iteration_end(ctx, &task.name, &iteration, Some(&error));
                iterations.push(iteration);

                // Fail fast: subsequent items are not attempted.
                let completed = iterations.len();
                store_task_output(
                    ctx,
                    TaskOutput::iterated(
                        task.name.as_str(),
                        TaskStatus::Failed,
                        format!("{}/{} iterations succeeded", completed - 1, total),
                        total,
                        iterations,
                    ),
                )
                .await;
                return TaskResult::failure(
                    &task.name,
                    format!("iteration {} failed: {}", index, error),
                );
            }
        }
    }

    finish_iterated_task(ctx, task, total, iterations).await
}

#[allow(clippy::too_many_arguments)]
async fn run_parallel_iterations(
    ctx: &Arc<MissionCtx>,
    task: &TaskSpec,
    iterator: &IteratorSpec,
    dataset: &Dataset,
    summaries: Vec<(String, String)>,
    queryable: Vec<(String, Vec<FieldSpec>)>,
    inherited: AgentRoster,
) -> TaskResult {
    let total = dataset.len();
    let permits = iterator
        .concurrency_limit
        .unwrap_or(Semaphore::MAX_PERMITS)
        .min(Semaphore::MAX_PERMITS)
        .max(1);
    let semaphore = Arc::new(Semaphore::new(permits));
    let mut join_set: JoinSet<(usize, IterationOutput)> = JoinSet::new();

    for index in 0..total {
        let item = dataset.records[index]
            .as_object()
            .cloned()
            .unwrap_or_default();
        let item_id = dataset.item_id(index);

        let ctx = Arc::clone(ctx);
        let task = task.clone();
        let iterator = iterator.clone();
        let summaries = summaries.clone();
        let queryable = queryable.clone();
        let inherited = inherited.clone();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            // The whole iteration lifecycle runs under the permit: no
            // more than the cap is ever in started-but-not-completed
            // state.
            ctx.sink.emit(MissionEvent::TaskIterationStarted {
                mission_id: ctx.mission_id.clone(),
                task: task.name.clone(),
                index,
                item_id: item_id.clone(),
            });
            // Ordering across items is unspecified; no previous-iteration
            // context is passed.
            let result = run_item_with_retries(
                &ctx, &task, &iterator, index, &item, None, None, &summaries, &queryable,
                &inherited,
            )
            .await;
            let iteration = match result {
                Ok(outcome) => IterationOutput {
                    index,
                    item_id,
                    status: TaskStatus::Success,
                    summary: outcome.summary,
                    output: outcome.output,
                    timestamp: Utc::now(),
                },
                Err(error) => IterationOutput {
                    index,
                    item_id,
                    status: TaskStatus::Failed,
                    summary: error,
                    output: None,
                    timestamp: Utc::now(),
                },
            };
            // Persist and report before the permit is released.
            persist_iteration(&ctx, &task.name, &iteration).await;
            let error = match iteration.status {
                TaskStatus::Failed => Some(iteration.summary.clone()),
                TaskStatus::Success => None,
            };
            emit_iteration_end(&ctx, &task.name, &iteration, error.as_deref());
            (index, iteration)
        });
    }

    let mut slots: Vec<Option<IterationOutput>> = (0..total).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, iteration)) => {
                slots[index] = Some(iteration);
            }
            Err(join_error) => {
                log::error!("iteration task panicked: {}", join_error);
            }
        }
    }

    let iterations: Vec<IterationOutput> = slots.into_iter().flatten().collect();
    let first_failure = iterations
        .iter()
        .filter(|i| i.status == TaskStatus::Failed)
        .min_by_key(|i| i.index);
    match first_failure {
        Some(failed) => {
            let succeeded = iterations
                .iter()
                .filter(|i| i.status.is_success())
                .count();
            let error = format!("iteration {} failed: {}", failed.index, failed.summary);
            store_task_output(
                ctx,
                TaskOutput::iterated(
                    task.name.as_str(),
                    TaskStatus::Failed,
                    format!("{}/{} iterations succeeded", succeeded, total),
                    total,
                    iterations,
                ),
            )
            .await;
            TaskResult::failure(&task.name, error)
        }
        None => finish_iterated_task(ctx, task, total, iterations).await,
    }
}

async fn persist_iteration(ctx: &Arc<MissionCtx>, task_name: &str, iteration: &IterationOutput) {
    if let Err(e) = ctx
        .knowledge
        .put_iteration_output(&ctx.mission_id, task_name, iteration.clone())
        .await
    {
        log::warn!("failed to store iteration output: {}", e);
    }
}

fn emit_iteration_end(
    ctx: &Arc<MissionCtx>,
    task_name: &str,
    iteration: &IterationOutput,
    error: Option<&str>,
) {
    match error {
        None => ctx.sink.emit(MissionEvent::IterationCompleted {
            mission_id: ctx.mission_id.clone(),
            task: task_name.to_string(),
            index: iteration.index,
            summary: iteration.summary.clone(),
        }),
        Some(error) => ctx.sink.emit(MissionEvent::IterationFailed {
            mission_id: ctx.mission_id.clone(),
            task: task_name.to_string(),
            index: iteration.index,
            error: error.to_string(),
        }),
    }
    ctx.sink.emit(MissionEvent::TaskIterationCompleted {
        mission_id: ctx.mission_id.clone(),
        task: task_name.to_string(),
        index: iteration.index,
        status: iteration.status.as_str().to_string(),
    });
}

async fn finish_iterated_task(
    ctx: &Arc<MissionCtx>,
    task: &TaskSpec,
    total: usize,
    iterations: Vec<IterationOutput>,
) -> TaskResult {
    let summary = format!("{}/{} iterations succeeded", iterations.len(), total);
    ctx.sink.emit(MissionEvent::SummaryAggregation {
        mission_id: ctx.mission_id.clone(),
        task: task.name.clone(),
        summary: summary.clone(),
    });
    store_task_output(
        ctx,
        TaskOutput::iterated(task.name.as_str(), TaskStatus::Success, summary.as_str(), total, iterations),
    )
    .await;
    TaskResult {
        task_name: task.name.clone(),
        summary,
        success: true,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

type ResolvedInputs = (
    Map<String, Value>,
    HashMap<String, String>,
    HashMap<String, String>,
);

/// Resolve provided inputs against the declared schema: type-coerce,
/// require anything without a default that is not secret, and collect
/// secret values for placeholder injection.
fn resolve_inputs(
    mission: &MissionSpec,
    provided: &HashMap<String, String>,
) -> Result<ResolvedInputs, ConfigError> {
    let mut resolved = Map::new();
    let mut raw = HashMap::new();
    let mut secrets = HashMap::new();

    for input in &mission.inputs {
        let value = provided
            .get(&input.name)
            .cloned()
            .or_else(|| input.default.clone());
        let value = match value {
            Some(value) => value,
            None => {
                if input.secret {
                    // Secret inputs come from a vault outside the core;
                    // absence is not a resolution failure.
                    log::warn!("secret input '{}' not provided", input.name);
                    continue;
                }
                return Err(ConfigError::MissingInput(input.name.clone()));
            }
        };
        let coerced = input
            .input_type
            .coerce(&value)
            .map_err(|reason| ConfigError::InvalidInput {
                name: input.name.clone(),
                reason,
            })?;
        raw.insert(input.name.clone(), value.clone());
        if input.secret {
            secrets.insert(input.name.clone(), value);
            resolved.insert(input.name.clone(), Value::String("********".to_string()));
        } else {
            resolved.insert(input.name.clone(), coerced);
        }
    }

    for name in provided.keys() {
        if !mission.inputs.iter().any(|i| &i.name == name) {
            log::warn!("ignoring undeclared mission input '{}'", name);
        }
    }
    Ok((resolved, raw, secrets))
}

/// Materialise declared datasets (inline items or input bindings) into
/// the mission dataset store, validating every record.
async fn resolve_datasets(
    mission: &MissionSpec,
    raw_inputs: &HashMap<String, String>,
    store: &dyn DatasetStore,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    for spec in &mission.datasets {
        let records = match &spec.bind_to {
            Some(input) => {
                let raw = raw_inputs.get(input).ok_or_else(|| {
                    ConfigError::DatasetSchema {
                        dataset: spec.name.clone(),
                        reason: format!("bound input '{}' was not resolved", input),
                    }
                })?;
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Array(items)) => items,
                    Ok(_) => {
                        return Err(Box::new(ConfigError::DatasetSchema {
                            dataset: spec.name.clone(),
                            reason: format!("input '{}' is not a JSON array", input),
                        }))
                    }
                    Err(e) => {
                        return Err(Box::new(ConfigError::DatasetSchema {
                            dataset: spec.name.clone(),
                            reason: format!("input '{}' is not valid JSON: {}", input, e),
                        }))
                    }
                }
            }
            None => spec.items.clone().unwrap_or_default(),
        };

        let dataset = Dataset::new(spec.name.as_str())
            .with_description(spec.description.as_str())
            .with_schema(spec.schema.clone())
            .with_records(records);
        dataset
            .validate()
            .map_err(|reason| ConfigError::DatasetSchema {
                dataset: spec.name.clone(),
                reason,
            })?;
        store.create(dataset).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_tracks_membership_and_count() {
        let mut bits = Bitset::new(130);
        assert_eq!(bits.count(), 0);
        bits.set(0);
        bits.set(64);
        bits.set(129);
        assert!(bits.get(0) && bits.get(64) && bits.get(129));
        assert!(!bits.get(1));
        assert_eq!(bits.count(), 3);
        assert!(bits.contains_all(&[0, 64]));
        assert!(!bits.contains_all(&[0, 2]));
    }

    #[test]
    fn learnings_merge_concatenates_arrays_and_overwrites_scalars() {
        let mut acc: Option<Map<String, Value>> = None;
        let first: Map<String, Value> = serde_json::from_str(
            r#"{"insights": ["a"], "last_error": "timeout"}"#,
        )
        .unwrap();
        let second: Map<String, Value> = serde_json::from_str(
            r#"{"insights": ["b"], "last_error": "parse"}"#,
        )
        .unwrap();
        merge_learnings(&mut acc, Some(&first));
        merge_learnings(&mut acc, Some(&second));
        let merged = acc.unwrap();
        assert_eq!(merged["insights"], serde_json::json!(["a", "b"]));
        assert_eq!(merged["last_error"], serde_json::json!("parse"));
    }

    #[test]
    fn missing_required_reports_absent_and_null_fields() {
        use crate::armada::schema::{FieldSpec, FieldType};
        let schema = vec![
            FieldSpec::new("status", FieldType::String).required(),
            FieldSpec::new("notes", FieldType::String),
        ];
        let output: Map<String, Value> =
            serde_json::from_str(r#"{"status": null, "notes": "x"}"#).unwrap();
        assert_eq!(
            missing_required(Some(&schema), Some(&output)),
            vec!["status".to_string()]
        );
        assert!(missing_required(None, None).is_empty());
    }
}
