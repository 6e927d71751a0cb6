//! Mission lifecycle events and the observer fan-out.
//!
//! Every transition in a mission, from task scheduling and iteration
//! progress to supervisor ("commander") and agent streaming, is emitted
//! as a [`MissionEvent`] and dispatched to a chain of
//! [`MissionHandler`]s: typically a CLI presenter ([`LogHandler`]), a
//! front-end fan-out, and a durable sink ([`StoringHandler`]).
//!
//! Delivery is best-effort ordered per mission: emitters push onto an
//! unbounded channel owned by the [`EventBus`], a single forwarding task
//! drains it in order, but handlers must tolerate interleaving across
//! concurrently running tasks.

use crate::armada::stores::{Event, EventStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One observable transition in a running mission.
///
/// The serialized form (tagged with `type`) is the wire payload persisted
/// by [`StoringHandler`]; [`MissionEvent::event_type`] returns the same
/// tag for filtering without serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionEvent {
    // ── Mission lifecycle ────────────────────────────────────────────────
    MissionStarted {
        mission_id: String,
        mission_name: String,
    },
    MissionCompleted {
        mission_id: String,
        success: bool,
    },

    // ── Task lifecycle ───────────────────────────────────────────────────
    TaskStarted {
        mission_id: String,
        task: String,
    },
    TaskCompleted {
        mission_id: String,
        task: String,
        summary: String,
    },
    TaskFailed {
        mission_id: String,
        task: String,
        error: String,
    },

    // ── Iteration scheduling (runner-side) ───────────────────────────────
    /// An item began executing. Under parallel iteration this is only
    /// emitted once the item holds a concurrency permit, so the
    /// started-but-not-completed population never exceeds the cap.
    TaskIterationStarted {
        mission_id: String,
        task: String,
        index: usize,
        item_id: String,
    },
    TaskIterationCompleted {
        mission_id: String,
        task: String,
        index: usize,
        status: String,
    },

    // ── Iteration execution ──────────────────────────────────────────────
    /// The iteration actually began running. `prompt` is the supervisor
    /// input for this item, including carried-over learnings.
    IterationStarted {
        mission_id: String,
        task: String,
        index: usize,
        prompt: String,
    },
    IterationCompleted {
        mission_id: String,
        task: String,
        index: usize,
        summary: String,
    },
    IterationFailed {
        mission_id: String,
        task: String,
        index: usize,
        error: String,
    },
    IterationRetrying {
        mission_id: String,
        task: String,
        index: usize,
        attempt: usize,
        learnings: Option<Value>,
    },
    IterationReasoning {
        mission_id: String,
        task: String,
        index: usize,
        text: String,
    },
    IterationAnswer {
        mission_id: String,
        task: String,
        index: usize,
        text: String,
    },

    // ── Supervisor streaming (non-iterated tasks) ────────────────────────
    CommanderReasoning {
        mission_id: String,
        task: String,
        text: String,
    },
    CommanderAnswer {
        mission_id: String,
        task: String,
        text: String,
    },
    CommanderCallingTool {
        mission_id: String,
        task: String,
        tool: String,
        input_preview: String,
    },
    CommanderToolComplete {
        mission_id: String,
        task: String,
        tool: String,
        success: bool,
    },

    // ── Agent streaming ──────────────────────────────────────────────────
    AgentStarted {
        mission_id: String,
        task: Option<String>,
        agent_id: String,
        agent_name: String,
        session_id: String,
        assignment_preview: String,
    },
    AgentCompleted {
        mission_id: String,
        task: Option<String>,
        agent_id: String,
        session_id: String,
        success: bool,
    },
    AgentThinking {
        mission_id: String,
        task: Option<String>,
        agent_id: String,
        session_id: String,
        text: String,
    },
    AgentCallingTool {
        mission_id: String,
        task: Option<String>,
        agent_id: String,
        session_id: String,
        tool: String,
        input_preview: String,
    },
    AgentToolComplete {
        mission_id: String,
        task: Option<String>,
        agent_id: String,
        session_id: String,
        tool: String,
        success: bool,
    },
    AgentAnswer {
        mission_id: String,
        task: Option<String>,
        agent_id: String,
        session_id: String,
        answer: String,
    },

    // ── Aggregation ──────────────────────────────────────────────────────
    SummaryAggregation {
        mission_id: String,
        task: String,
        summary: String,
    },
}

impl MissionEvent {
    /// The wire name of this event (`"task_started"`, …).
    pub fn event_type(&self) -> &'static str {
        use MissionEvent::*;
        match self {
            MissionStarted { .. } => "mission_started",
            MissionCompleted { .. } => "mission_completed",
            TaskStarted { .. } => "task_started",
            TaskCompleted { .. } => "task_completed",
            TaskFailed { .. } => "task_failed",
            TaskIterationStarted { .. } => "task_iteration_started",
            TaskIterationCompleted { .. } => "task_iteration_completed",
            IterationStarted { .. } => "iteration_started",
            IterationCompleted { .. } => "iteration_completed",
            IterationFailed { .. } => "iteration_failed",
            IterationRetrying { .. } => "iteration_retrying",
            IterationReasoning { .. } => "iteration_reasoning",
            IterationAnswer { .. } => "iteration_answer",
            CommanderReasoning { .. } => "commander_reasoning",
            CommanderAnswer { .. } => "commander_answer",
            CommanderCallingTool { .. } => "commander_calling_tool",
            CommanderToolComplete { .. } => "commander_tool_complete",
            AgentStarted { .. } => "agent_started",
            AgentCompleted { .. } => "agent_completed",
            AgentThinking { .. } => "agent_thinking",
            AgentCallingTool { .. } => "agent_calling_tool",
            AgentToolComplete { .. } => "agent_tool_complete",
            AgentAnswer { .. } => "agent_answer",
            SummaryAggregation { .. } => "summary_aggregation",
        }
    }

    /// Mission id this event belongs to.
    pub fn mission_id(&self) -> &str {
        use MissionEvent::*;
        match self {
            MissionStarted { mission_id, .. }
            | MissionCompleted { mission_id, .. }
            | TaskStarted { mission_id, .. }
            | TaskCompleted { mission_id, .. }
            | TaskFailed { mission_id, .. }
            | TaskIterationStarted { mission_id, .. }
            | TaskIterationCompleted { mission_id, .. }
            | IterationStarted { mission_id, .. }
            | IterationCompleted { mission_id, .. }
            | IterationFailed { mission_id, .. }
            | IterationRetrying { mission_id, .. }
            | IterationReasoning { mission_id, .. }
            | IterationAnswer { mission_id, .. }
            | CommanderReasoning { mission_id, .. }
            | CommanderAnswer { mission_id, .. }
            | CommanderCallingTool { mission_id, .. }
            | CommanderToolComplete { mission_id, .. }
            | AgentStarted { mission_id, .. }
            | AgentCompleted { mission_id, .. }
            | AgentThinking { mission_id, .. }
            | AgentCallingTool { mission_id, .. }
            | AgentToolComplete { mission_id, .. }
            | AgentAnswer { mission_id, .. }
            | SummaryAggregation { mission_id, .. } => mission_id,
        }
    }

    /// The task this event concerns, when any.
    pub fn task(&self) -> Option<&str> {
        use MissionEvent::*;
        match self {
            TaskStarted { task, .. }
            | TaskCompleted { task, .. }
            | TaskFailed { task, .. }
            | TaskIterationStarted { task, .. }
            | TaskIterationCompleted { task, .. }
            | IterationStarted { task, .. }
            | IterationCompleted { task, .. }
            | IterationFailed { task, .. }
            | IterationRetrying { task, .. }
            | IterationReasoning { task, .. }
            | IterationAnswer { task, .. }
            | CommanderReasoning { task, .. }
            | CommanderAnswer { task, .. }
            | CommanderCallingTool { task, .. }
            | CommanderToolComplete { task, .. }
            | SummaryAggregation { task, .. } => Some(task),
            AgentStarted { task, .. }
            | AgentCompleted { task, .. }
            | AgentThinking { task, .. }
            | AgentCallingTool { task, .. }
            | AgentToolComplete { task, .. }
            | AgentAnswer { task, .. } => task.as_deref(),
            MissionStarted { .. } | MissionCompleted { .. } => None,
        }
    }

    /// Iteration index, for iteration-scoped events.
    pub fn iteration(&self) -> Option<usize> {
        use MissionEvent::*;
        match self {
            TaskIterationStarted { index, .. }
            | TaskIterationCompleted { index, .. }
            | IterationStarted { index, .. }
            | IterationCompleted { index, .. }
            | IterationFailed { index, .. }
            | IterationRetrying { index, .. }
            | IterationReasoning { index, .. }
            | IterationAnswer { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Session id, for agent-scoped events.
    pub fn session_id(&self) -> Option<&str> {
        use MissionEvent::*;
        match self {
            AgentStarted { session_id, .. }
            | AgentCompleted { session_id, .. }
            | AgentThinking { session_id, .. }
            | AgentCallingTool { session_id, .. }
            | AgentToolComplete { session_id, .. }
            | AgentAnswer { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Convert into the persistable [`Event`] record.
    pub fn to_record(&self) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            mission_id: self.mission_id().to_string(),
            task_id: self.task().map(str::to_string),
            session_id: self.session_id().map(str::to_string),
            iteration: self.iteration(),
            event_type: self.event_type().to_string(),
            payload: serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string()),
            created_at: Utc::now(),
        }
    }
}

/// Observer of mission progress.
///
/// The default implementation ignores everything, so handlers override
/// only what they present or persist.
#[async_trait]
pub trait MissionHandler: Send + Sync {
    async fn on_event(&self, _event: &MissionEvent) {}
}

/// Dispatches every event to each handler in registration order.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn MissionHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler (builder pattern).
    pub fn with(mut self, handler: Arc<dyn MissionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl MissionHandler for HandlerChain {
    async fn on_event(&self, event: &MissionEvent) {
        for handler in &self.handlers {
            handler.on_event(event).await;
        }
    }
}

/// CLI presentation: renders progress through the `log` facade.
pub struct LogHandler;

#[async_trait]
impl MissionHandler for LogHandler {
    async fn on_event(&self, event: &MissionEvent) {
        use MissionEvent::*;
        match event {
            MissionStarted { mission_name, .. } => {
                log::info!("mission '{}' started", mission_name)
            }
            MissionCompleted { success, .. } => {
                log::info!("mission finished (success: {})", success)
            }
            TaskStarted { task, .. } => log::info!("task '{}' started", task),
            TaskCompleted { task, summary, .. } => {
                log::info!("task '{}' completed: {}", task, summary)
            }
            TaskFailed { task, error, .. } => log::warn!("task '{}' failed: {}", task, error),
            IterationFailed { task, index, error, .. } => {
                log::warn!("task '{}' iteration {} failed: {}", task, index, error)
            }
            IterationRetrying { task, index, attempt, .. } => {
                log::info!("task '{}' iteration {} retrying (attempt {})", task, index, attempt)
            }
            AgentCallingTool { agent_id, tool, .. } => {
                log::debug!("agent {} calling tool '{}'", agent_id, tool)
            }
            CommanderCallingTool { task, tool, .. } => {
                log::debug!("supervisor of '{}' calling tool '{}'", task, tool)
            }
            _ => {
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("{}", event.event_type());
                }
            }
        }
    }
}

/// Persists every event verbatim into an [`EventStore`].
pub struct StoringHandler {
    store: Arc<dyn EventStore>,
}

impl StoringHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MissionHandler for StoringHandler {
    async fn on_event(&self, event: &MissionEvent) {
        if let Err(e) = self.store.append(event.to_record()).await {
            log::warn!("failed to persist {} event: {}", event.event_type(), e);
        }
    }
}

/// Owns the forwarding task between synchronous emitters and the async
/// handler chain.
pub struct EventBus {
    tx: mpsc::UnboundedSender<MissionEvent>,
    forwarder: JoinHandle<()>,
}

impl EventBus {
    /// Spawn the forwarding task draining into `handler`.
    pub fn start(handler: Arc<dyn MissionHandler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MissionEvent>();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.on_event(&event).await;
            }
        });
        Self { tx, forwarder }
    }

    /// A cheap cloneable emitter handle.
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: Some(self.tx.clone()),
        }
    }

    /// Close the bus and wait for queued events to be delivered.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.forwarder.await;
    }
}

/// Emitter handle used throughout the engine. A disabled sink (no bus)
/// swallows events, which keeps agents usable outside missions.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<MissionEvent>>,
}

impl EventSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit one event. Never blocks; delivery failures (bus shut down)
    /// are ignored.
    pub fn emit(&self, event: MissionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}
