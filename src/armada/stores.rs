//! Storage contracts and in-memory reference implementations.
//!
//! The engine persists through four narrow interfaces: task outputs go to
//! a [`KnowledgeStore`], datasets live in a [`DatasetStore`], lifecycle
//! events append to an [`EventStore`], and session transcripts can be
//! snapshotted into a [`SessionStore`]. Concrete embedded-SQL back-ends
//! are a separate concern; the `InMemory*` types here are the reference
//! implementations the engine is tested against.

use crate::armada::dataset::Dataset;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by store implementations.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The named entity does not exist.
    NotFound(String),
    /// The operation conflicts with existing state (e.g. creating a
    /// dataset that already exists).
    Conflict(String),
    /// A backend failure (I/O, serialization, connection).
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
        }
    }
}

impl Error for StoreError {}

// ---------------------------------------------------------------------------
// Task outputs
// ---------------------------------------------------------------------------

/// Terminal status of a task or iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }
}

/// Output of one iteration of an iterated task.
#[derive(Debug, Clone, Serialize)]
pub struct IterationOutput {
    pub index: usize,
    /// Identifier of the dataset item this iteration processed.
    pub item_id: String,
    pub status: TaskStatus,
    pub summary: String,
    /// Structured output parsed from the supervisor's `<OUTPUT>` block.
    pub output: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted output of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutput {
    pub task_name: String,
    pub status: TaskStatus,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub output: Option<Map<String, Value>>,
    pub is_iterated: bool,
    pub total_iterations: usize,
    /// Per-item outputs, in index order for sequential tasks.
    pub iterations: Vec<IterationOutput>,
}

impl TaskOutput {
    /// Build a non-iterated output.
    pub fn single(
        task_name: impl Into<String>,
        status: TaskStatus,
        summary: impl Into<String>,
        output: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            status,
            summary: summary.into(),
            timestamp: Utc::now(),
            output,
            is_iterated: false,
            total_iterations: 0,
            iterations: Vec::new(),
        }
    }

    /// Build an iterated output from its per-item results.
    pub fn iterated(
        task_name: impl Into<String>,
        status: TaskStatus,
        summary: impl Into<String>,
        total_iterations: usize,
        iterations: Vec<IterationOutput>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            status,
            summary: summary.into(),
            timestamp: Utc::now(),
            output: None,
            is_iterated: true,
            total_iterations,
            iterations,
        }
    }
}

/// Persists task outputs within a mission.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Store (or replace) the output of a task.
    async fn put_task_output(
        &self,
        mission_id: &str,
        output: TaskOutput,
    ) -> Result<(), StoreError>;

    /// Append one iteration output for a task that is still running, so
    /// sequential iterations are durable in index order before the task
    /// completes.
    async fn put_iteration_output(
        &self,
        mission_id: &str,
        task_name: &str,
        iteration: IterationOutput,
    ) -> Result<(), StoreError>;

    async fn get_task_output(
        &self,
        mission_id: &str,
        task_name: &str,
    ) -> Result<Option<TaskOutput>, StoreError>;

    /// All task outputs for a mission, in store order.
    async fn list_task_outputs(&self, mission_id: &str) -> Result<Vec<TaskOutput>, StoreError>;
}

/// Reference in-memory [`KnowledgeStore`].
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    // mission_id -> ordered (task_name, output)
    outputs: RwLock<HashMap<String, Vec<TaskOutput>>>,
    // (mission_id, task_name) -> in-flight iteration outputs
    iterations: RwLock<HashMap<(String, String), Vec<IterationOutput>>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-flight iteration outputs persisted so far for a task.
    pub async fn pending_iterations(
        &self,
        mission_id: &str,
        task_name: &str,
    ) -> Vec<IterationOutput> {
        self.iterations
            .read()
            .await
            .get(&(mission_id.to_string(), task_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn put_task_output(
        &self,
        mission_id: &str,
        output: TaskOutput,
    ) -> Result<(), StoreError> {
        let mut outputs = self.outputs.write().await;
        let entry = outputs.entry(mission_id.to_string()).or_default();
        entry.retain(|o| o.task_name != output.task_name);
        entry.push(output);
        Ok(())
    }

    async fn put_iteration_output(
        &self,
        mission_id: &str,
        task_name: &str,
        iteration: IterationOutput,
    ) -> Result<(), StoreError> {
        self.iterations
            .write()
            .await
            .entry((mission_id.to_string(), task_name.to_string()))
            .or_default()
            .push(iteration);
        Ok(())
    }

    async fn get_task_output(
        &self,
        mission_id: &str,
        task_name: &str,
    ) -> Result<Option<TaskOutput>, StoreError> {
        Ok(self
            .outputs
            .read()
            .await
            .get(mission_id)
            .and_then(|v| v.iter().find(|o| o.task_name == task_name).cloned()))
    }

    async fn list_task_outputs(&self, mission_id: &str) -> Result<Vec<TaskOutput>, StoreError> {
        Ok(self
            .outputs
            .read()
            .await
            .get(mission_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// Holds a mission's datasets. Exclusive writer, many readers per
/// dataset; iteration snapshots are taken at task entry and never
/// re-read.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Create a dataset. Fails with [`StoreError::Conflict`] if the name
    /// is taken.
    async fn create(&self, dataset: Dataset) -> Result<(), StoreError>;

    /// Replace the records of an existing dataset.
    async fn replace_records(&self, name: &str, records: Vec<Value>) -> Result<(), StoreError>;

    /// Append records to an existing dataset.
    async fn append_records(&self, name: &str, records: Vec<Value>) -> Result<usize, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<Dataset>, StoreError>;

    async fn list_names(&self) -> Result<Vec<String>, StoreError>;

    async fn count(&self, name: &str) -> Result<usize, StoreError>;
}

/// Reference in-memory [`DatasetStore`].
#[derive(Default)]
pub struct InMemoryDatasetStore {
    datasets: RwLock<HashMap<String, Dataset>>,
}

impl InMemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatasetStore for InMemoryDatasetStore {
    async fn create(&self, dataset: Dataset) -> Result<(), StoreError> {
        let mut datasets = self.datasets.write().await;
        if datasets.contains_key(&dataset.name) {
            return Err(StoreError::Conflict(format!(
                "dataset '{}' already exists",
                dataset.name
            )));
        }
        datasets.insert(dataset.name.clone(), dataset);
        Ok(())
    }

    async fn replace_records(&self, name: &str, records: Vec<Value>) -> Result<(), StoreError> {
        let mut datasets = self.datasets.write().await;
        let dataset = datasets
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("dataset '{}'", name)))?;
        dataset.records = records;
        Ok(())
    }

    async fn append_records(&self, name: &str, records: Vec<Value>) -> Result<usize, StoreError> {
        let mut datasets = self.datasets.write().await;
        let dataset = datasets
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("dataset '{}'", name)))?;
        dataset.records.extend(records);
        Ok(dataset.records.len())
    }

    async fn get(&self, name: &str) -> Result<Option<Dataset>, StoreError> {
        Ok(self.datasets.read().await.get(name).cloned())
    }

    async fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.datasets.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        self.datasets
            .read()
            .await
            .get(name)
            .map(|d| d.records.len())
            .ok_or_else(|| StoreError::NotFound(format!("dataset '{}'", name)))
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One persisted lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub mission_id: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub iteration: Option<usize>,
    /// Wire name, e.g. `"task_started"`.
    pub event_type: String,
    /// JSON-serialised payload.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Durable, append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: Event) -> Result<(), StoreError>;

    /// All events recorded for a mission, in append order.
    async fn list(&self, mission_id: &str) -> Result<Vec<Event>, StoreError>;
}

/// Reference in-memory [`EventStore`].
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total events across all missions.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: Event) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn list(&self, mission_id: &str) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.mission_id == mission_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Session snapshots
// ---------------------------------------------------------------------------

/// One rendered message inside a [`SessionSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMessage {
    pub role: String,
    pub content: String,
}

/// A point-in-time transcript of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub mission_id: Option<String>,
    pub task_name: Option<String>,
    pub messages: Vec<SnapshotMessage>,
    pub created_at: DateTime<Utc>,
}

/// Persists session transcripts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, snapshot: SessionSnapshot) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError>;
}

/// Reference in-memory [`SessionStore`]. Keeps the latest snapshot per
/// session id.
#[derive(Default)]
pub struct InMemorySessionStore {
    snapshots: RwLock<HashMap<String, SessionSnapshot>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with a stored snapshot.
    pub async fn session_count(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, snapshot: SessionSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.session_id.clone(), snapshot);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(session_id).cloned())
    }
}
