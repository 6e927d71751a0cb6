//! The agent: one LM identity with a persona, a tool set, and a bounded
//! conversation.
//!
//! An [`Agent`] assembles the pieces the turn loop needs: a
//! [`Session`], a tool map (its configured tools plus the automatic
//! `result_*` family and, inside a mission, the dataset tools), a result
//! interceptor, and a pruning manager. It exposes two operations:
//! [`chat`](Agent::chat), a full tool-using turn loop, and
//! [`answer_follow_up`](Agent::answer_follow_up), a memory-only reply
//! that never mutates the session. The latter is what later tasks use to
//! question agents owned by earlier tasks.

use crate::armada::event::{EventSink, MissionEvent};
use crate::armada::prompts::{self, AgentMode, STOP_SENTINEL};
use crate::armada::provider::Provider;
use crate::armada::pruning::PruningManager;
use crate::armada::result_store::{InterceptorConfig, ResultInterceptor, ResultStore};
use crate::armada::session::Session;
use crate::armada::stores::DatasetStore;
use crate::armada::tools::dataset_tools::install_dataset_tools;
use crate::armada::tools::result_access::install_result_tools;
use crate::armada::tools::{render_tool_docs, ToolMap};
use crate::armada::turn::{preview, TurnObserver, TurnOrchestrator};
use crate::armada::turn_log::TurnLogger;
use crate::armada::turn_parser::TurnHandler;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use uuid::Uuid;

/// Where an agent's events belong: the owning mission and task, when the
/// agent runs inside one.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub mission_id: String,
    pub task: Option<String>,
}

/// Outcome of one [`Agent::chat`] call.
#[derive(Debug, Clone)]
pub struct ChatResult {
    /// Final answer; empty when the agent asked its supervisor instead.
    pub answer: String,
    /// Question for the supervisor; empty when the agent answered.
    pub ask_supe: String,
    /// Whether the assignment ran to a natural end (an answer, not an
    /// open question or a turn-limit cutoff).
    pub complete: bool,
}

/// An LM-driven worker with a fixed identity.
pub struct Agent {
    /// Unique instance id (`<name>_<short-uuid>`), referenced by the
    /// supervisor's `ask_agent` tool.
    pub id: String,
    /// Config identity this instance was built from.
    pub name: String,
    personality: String,
    role: String,
    mode: AgentMode,
    provider: Arc<dyn Provider>,
    session: Session,
    tools: ToolMap,
    result_store: Arc<ResultStore>,
    interceptor: ResultInterceptor,
    pruning: PruningManager,
    secrets: HashMap<String, String>,
    turn_limit: usize,
    events: EventSink,
    scope: EventScope,
    turn_logger: Option<TurnLogger>,
    dataset_store: Option<Arc<dyn DatasetStore>>,
    dataset_notes: Option<String>,
    initialized: bool,
}

impl Agent {
    /// Create an agent speaking to `model` through `provider`.
    ///
    /// Defaults: workflow mode, no tools beyond the automatic `result_*`
    /// family, default interception thresholds, pruning disabled, no
    /// turn limit.
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let id = format!(
            "{}_{}",
            name,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let session = Session::new(Arc::clone(&provider), model);
        let result_store = Arc::new(ResultStore::new());
        let interceptor =
            ResultInterceptor::new(Arc::clone(&result_store), InterceptorConfig::default());
        let pruning = PruningManager::new(session.shared_state(), 0, 0);
        Self {
            id,
            name,
            personality: String::new(),
            role: String::new(),
            mode: AgentMode::Workflow,
            provider,
            session,
            tools: ToolMap::new(),
            result_store,
            interceptor,
            pruning,
            secrets: HashMap::new(),
            turn_limit: 0,
            events: EventSink::disabled(),
            scope: EventScope::default(),
            turn_logger: None,
            dataset_store: None,
            dataset_notes: None,
            initialized: false,
        }
    }

    /// Select chat or workflow mode (builder pattern).
    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Persona hints embedded into the system prompt.
    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    /// Role description embedded into the system prompt.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Grant tools. Extends any previously granted set; the `result_*`
    /// family is installed automatically on first use.
    pub fn with_tools(mut self, tools: ToolMap) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Secret values available for `{{secrets.NAME}}` injection into
    /// tool inputs. Secrets live only here; they never enter the session
    /// or the turn log.
    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Cap the number of provider round-trips per chat; 0 removes the cap.
    pub fn with_turn_limit(mut self, turn_limit: usize) -> Self {
        self.turn_limit = turn_limit;
        self
    }

    /// Default pruning limits: at most `single` observations per tool and
    /// nothing older than `all` insertions. 0 disables either policy.
    pub fn with_prune_limits(mut self, single: usize, all: usize) -> Self {
        self.pruning = PruningManager::new(self.session.shared_state(), single, all);
        self
    }

    /// Override interception thresholds.
    pub fn with_interceptor_config(mut self, config: InterceptorConfig) -> Self {
        self.interceptor = ResultInterceptor::new(Arc::clone(&self.result_store), config);
        self
    }

    /// Wire lifecycle events into a mission's event bus.
    pub fn with_events(mut self, events: EventSink, scope: EventScope) -> Self {
        self.events = events;
        self.scope = scope;
        self
    }

    /// Persist per-turn snapshots.
    pub fn with_turn_logger(mut self, logger: TurnLogger) -> Self {
        self.turn_logger = Some(logger);
        self
    }

    /// Attach the mission dataset store, enabling the dataset tools and
    /// `result_to_dataset`.
    pub fn with_dataset_store(mut self, store: Arc<dyn DatasetStore>) -> Self {
        self.dataset_store = Some(store);
        self
    }

    /// Human-readable dataset descriptions for the system prompt.
    pub fn with_dataset_notes(mut self, notes: impl Into<String>) -> Self {
        self.dataset_notes = Some(notes.into());
        self
    }

    /// The conversation session (e.g. for transcript snapshots).
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The store holding this agent's spilled results.
    pub fn result_store(&self) -> &Arc<ResultStore> {
        &self.result_store
    }

    async fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        install_result_tools(
            &mut self.tools,
            Arc::clone(&self.result_store),
            self.dataset_store.clone(),
        );
        if let Some(datasets) = &self.dataset_store {
            install_dataset_tools(&mut self.tools, Arc::clone(datasets));
        }
        let tool_docs = render_tool_docs(&self.tools);
        let prompt = prompts::render_agent_prompt(
            self.mode,
            &tool_docs,
            &self.personality,
            &self.role,
            self.dataset_notes.as_deref(),
        );
        self.session.add_system_prompt(prompt).await;
        self.session
            .set_stop_sequences(vec![STOP_SENTINEL.to_string()])
            .await;
    }

    /// Run one assignment through the turn loop.
    pub async fn chat(&mut self, input: &str) -> Result<ChatResult, Box<dyn Error + Send + Sync>> {
        self.ensure_initialized().await;
        log::debug!("agent {} starting chat ({} chars)", self.id, input.len());
        self.events.emit(MissionEvent::AgentStarted {
            mission_id: self.scope.mission_id.clone(),
            task: self.scope.task.clone(),
            agent_id: self.id.clone(),
            agent_name: self.name.clone(),
            session_id: self.session.id().to_string(),
            assignment_preview: preview(input, 120),
        });

        let mut bridge = AgentTurnBridge {
            events: self.events.clone(),
            scope: self.scope.clone(),
            agent_id: self.id.clone(),
            session_id: self.session.id().to_string(),
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
        let outcome = orchestrator.run(&mut bridge, input).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.emit(MissionEvent::AgentCompleted {
                    mission_id: self.scope.mission_id.clone(),
                    task: self.scope.task.clone(),
                    agent_id: self.id.clone(),
                    session_id: self.session.id().to_string(),
                    success: false,
                });
                return Err(e);
            }
        };

        if !outcome.answer.is_empty() {
            self.events.emit(MissionEvent::AgentAnswer {
                mission_id: self.scope.mission_id.clone(),
                task: self.scope.task.clone(),
                agent_id: self.id.clone(),
                session_id: self.session.id().to_string(),
                answer: outcome.answer.clone(),
            });
        }
        self.events.emit(MissionEvent::AgentCompleted {
            mission_id: self.scope.mission_id.clone(),
            task: self.scope.task.clone(),
            agent_id: self.id.clone(),
            session_id: self.session.id().to_string(),
            success: true,
        });

        let complete = outcome.ask_supe.is_empty() && !outcome.hit_turn_limit;
        Ok(ChatResult {
            answer: outcome.answer,
            ask_supe: outcome.ask_supe,
            complete,
        })
    }

    /// Answer a question from conversation memory, without tools and
    /// without committing anything to the session.
    ///
    /// This is the only operation later tasks may invoke on agents they
    /// inherited: it reads the history, it never rewrites it.
    pub async fn answer_follow_up(
        &self,
        question: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let request = self
            .session
            .request_with(&prompts::render_followup_prompt(question))
            .await;
        let reply = self.session.provider().send(request).await?;
        let text = reply.content_text();
        Ok(prompts::extract_tag(&text, "ANSWER")
            .map(|a| a.trim().to_string())
            .unwrap_or_else(|| text.trim().to_string()))
    }

    /// Abandon any in-flight work and start from a clean conversation.
    /// System prompts and stop sequences survive; history and pruning
    /// bookkeeping do not.
    pub async fn reset(&mut self) {
        self.session.reset().await;
        self.pruning.clear_tracking();
    }

    /// Release the session and, when this agent owns a closeable
    /// provider, the provider too.
    pub async fn close(&mut self) {
        self.session.close().await;
        if self.provider.is_closeable() {
            self.provider.close().await;
        }
        log::debug!("agent {} closed", self.id);
    }
}

/// Bridges parser/turn callbacks into mission events.
struct AgentTurnBridge {
    events: EventSink,
    scope: EventScope,
    agent_id: String,
    session_id: String,
}

impl TurnHandler for AgentTurnBridge {
    fn on_thinking(&mut self, text: &str) {
        self.emit_thinking(text);
    }

    fn on_reasoning_chunk(&mut self, text: &str) {
        self.emit_thinking(text);
    }
}

impl TurnObserver for AgentTurnBridge {
    fn on_calling_tool(&mut self, tool: &str, input: &str) {
        self.events.emit(MissionEvent::AgentCallingTool {
            mission_id: self.scope.mission_id.clone(),
            task: self.scope.task.clone(),
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            tool: tool.to_string(),
            input_preview: preview(input, 120),
        });
    }

    fn on_tool_complete(&mut self, tool: &str, success: bool) {
        self.events.emit(MissionEvent::AgentToolComplete {
            mission_id: self.scope.mission_id.clone(),
            task: self.scope.task.clone(),
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            tool: tool.to_string(),
            success,
        });
    }
}

impl AgentTurnBridge {
    fn emit_thinking(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.events.emit(MissionEvent::AgentThinking {
            mission_id: self.scope.mission_id.clone(),
            task: self.scope.task.clone(),
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            text: text.to_string(),
        });
    }
}
