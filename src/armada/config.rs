//! The resolved configuration shape the engine consumes.
//!
//! The concrete config syntax and its loader live outside the core; any
//! front end that can produce these structs (the serde derives make JSON
//! trivial) can drive the engine. Collections are ordered `Vec`s with a
//! `name` field because declaration order is meaningful: it is the stable
//! tie-break for topological task scheduling.
//!
//! [`MissionConfig::validate`] checks every cross-reference and refuses
//! dependency cycles before anything runs: a mission with a cycle is a
//! config-time error, never a hang.

use crate::armada::schema::{FieldSpec, FieldType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;

// ---------------------------------------------------------------------------
// Top-level collections
// ---------------------------------------------------------------------------

/// Free-text config value, referenced from objectives as `{{vars.name}}`.
/// Secret variables are masked in listings and only ever injected into
/// tool inputs via `{{secrets.name}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

/// One configured model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub api_key: String,
}

/// A tool declaration binding a plugin-provided implementation to a
/// name, description, and input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub implements: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<FieldSpec>,
    /// Implementation-specific fields, passed through untouched.
    #[serde(default)]
    pub settings: Value,
}

/// A plugin source pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub source: String,
    pub version: String,
    #[serde(default)]
    pub settings: Option<Value>,
}

/// Context compaction declaration. Parsed and validated; the compaction
/// algorithm itself is not part of the core engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub token_limit: usize,
    pub turn_retention: usize,
}

/// One agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Model reference into [`MissionConfig::models`].
    pub model: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub single_tool_limit: Option<usize>,
    #[serde(default)]
    pub all_tool_limit: Option<usize>,
    #[serde(default)]
    pub turn_limit: Option<usize>,
    #[serde(default)]
    pub compaction: Option<CompactionConfig>,
}

// ---------------------------------------------------------------------------
// Missions
// ---------------------------------------------------------------------------

/// A declared mission input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: FieldType,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// A declared dataset: schema plus default items or an input binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Vec<FieldSpec>,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    /// Input reference whose (JSON array) value populates the dataset.
    #[serde(default)]
    pub bind_to: Option<String>,
}

/// Iteration settings for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorSpec {
    /// Dataset reference within the mission.
    pub dataset: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub max_retries: usize,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
}

/// One task node in the mission DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// May reference `{{vars.*}}`, `{{inputs.*}}`, and (under an
    /// iterator) `{{item.*}}`.
    pub objective: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Agents callable from this task's supervisor; defaults to the
    /// mission agent list.
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    #[serde(default)]
    pub iterator: Option<IteratorSpec>,
    /// Structured output schema the supervisor must fill.
    #[serde(default)]
    pub output: Option<Vec<FieldSpec>>,
}

/// A complete mission declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionSpec {
    pub name: String,
    /// Model reference driving every task supervisor.
    pub supervisor_model: String,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl MissionSpec {
    pub fn find_task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn find_dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Agent names callable from `task` (its own list, else the
    /// mission's).
    pub fn task_agents<'a>(&'a self, task: &'a TaskSpec) -> &'a [String] {
        task.agents.as_deref().unwrap_or(&self.agents)
    }
}

/// The root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionConfig {
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub missions: Vec<MissionSpec>,
}

impl MissionConfig {
    /// Parse from JSON (one concrete syntax the shape supports out of the
    /// box).
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn find_model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn find_agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn find_mission(&self, name: &str) -> Option<&MissionSpec> {
        self.missions.iter().find(|m| m.name == name)
    }

    /// Variables with their defaults, as a template substitution map.
    /// Secret variable values are masked.
    pub fn variable_map(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for var in &self.variables {
            let value = if var.secret {
                Value::String("********".to_string())
            } else {
                Value::String(var.default.clone().unwrap_or_default())
            };
            map.insert(var.name.clone(), value);
        }
        map
    }

    /// Secret variable values, for `{{secrets.*}}` injection.
    pub fn secret_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .filter(|v| v.secret)
            .filter_map(|v| v.default.clone().map(|d| (v.name.clone(), d)))
            .collect()
    }

    /// Check every cross-reference and refuse dependency cycles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duplicates("variable", self.variables.iter().map(|v| v.name.as_str()))?;
        check_duplicates("model", self.models.iter().map(|m| m.name.as_str()))?;
        check_duplicates("tool", self.tools.iter().map(|t| t.name.as_str()))?;
        check_duplicates("plugin", self.plugins.iter().map(|p| p.name.as_str()))?;
        check_duplicates("agent", self.agents.iter().map(|a| a.name.as_str()))?;
        check_duplicates("mission", self.missions.iter().map(|m| m.name.as_str()))?;

        for agent in &self.agents {
            if self.find_model(&agent.model).is_none() {
                return Err(ConfigError::UnknownReference {
                    kind: "model",
                    name: agent.model.clone(),
                    referenced_by: format!("agent '{}'", agent.name),
                });
            }
            for tool in &agent.tools {
                if self.find_tool(tool).is_none() {
                    return Err(ConfigError::UnknownReference {
                        kind: "tool",
                        name: tool.clone(),
                        referenced_by: format!("agent '{}'", agent.name),
                    });
                }
            }
        }

        for mission in &self.missions {
            self.validate_mission(mission)?;
        }
        Ok(())
    }

    fn validate_mission(&self, mission: &MissionSpec) -> Result<(), ConfigError> {
        check_duplicates("input", mission.inputs.iter().map(|i| i.name.as_str()))?;
        check_duplicates("dataset", mission.datasets.iter().map(|d| d.name.as_str()))?;
        check_duplicates("task", mission.tasks.iter().map(|t| t.name.as_str()))?;

        if self.find_model(&mission.supervisor_model).is_none() {
            return Err(ConfigError::UnknownReference {
                kind: "model",
                name: mission.supervisor_model.clone(),
                referenced_by: format!("mission '{}'", mission.name),
            });
        }
        for agent in &mission.agents {
            if self.find_agent(agent).is_none() {
                return Err(ConfigError::UnknownReference {
                    kind: "agent",
                    name: agent.clone(),
                    referenced_by: format!("mission '{}'", mission.name),
                });
            }
        }
        for dataset in &mission.datasets {
            if let Some(input) = &dataset.bind_to {
                if !mission.inputs.iter().any(|i| &i.name == input) {
                    return Err(ConfigError::UnknownReference {
                        kind: "input",
                        name: input.clone(),
                        referenced_by: format!(
                            "dataset '{}' of mission '{}'",
                            dataset.name, mission.name
                        ),
                    });
                }
            }
        }
        for task in &mission.tasks {
            if let Some(agents) = &task.agents {
                for agent in agents {
                    if self.find_agent(agent).is_none() {
                        return Err(ConfigError::UnknownReference {
                            kind: "agent",
                            name: agent.clone(),
                            referenced_by: format!(
                                "task '{}' of mission '{}'",
                                task.name, mission.name
                            ),
                        });
                    }
                }
            }
            if let Some(iterator) = &task.iterator {
                if mission.find_dataset(&iterator.dataset).is_none() {
                    return Err(ConfigError::UnknownReference {
                        kind: "dataset",
                        name: iterator.dataset.clone(),
                        referenced_by: format!(
                            "task '{}' of mission '{}'",
                            task.name, mission.name
                        ),
                    });
                }
            }
        }

        // Dependency references and cycle refusal.
        let graph = TaskGraph::build(&mission.tasks)?;
        graph.topo_order()?;
        Ok(())
    }
}

fn check_duplicates<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Task graph
// ---------------------------------------------------------------------------

/// Integer-indexed dependency graph over a mission's tasks.
///
/// Tasks get ids in declaration order; dependencies are id sets. The
/// runner's ready/completed bookkeeping is bitset-based on the same ids.
pub struct TaskGraph {
    names: Vec<String>,
    deps: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Build from task declarations, resolving `depends_on` names.
    pub fn build(tasks: &[TaskSpec]) -> Result<Self, ConfigError> {
        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        let mut deps = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mut ids = Vec::with_capacity(task.depends_on.len());
            for dep in &task.depends_on {
                match index.get(dep.as_str()) {
                    Some(&id) => ids.push(id),
                    None => {
                        return Err(ConfigError::UnknownReference {
                            kind: "task",
                            name: dep.clone(),
                            referenced_by: format!("task '{}'", task.name),
                        })
                    }
                }
            }
            deps.push(ids);
        }
        Ok(Self {
            names: tasks.iter().map(|t| t.name.clone()).collect(),
            deps,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, id: usize) -> &str {
        &self.names[id]
    }

    pub fn deps(&self, id: usize) -> &[usize] {
        &self.deps[id]
    }

    /// Kahn's algorithm with a stable tie-break: among simultaneously
    /// ready tasks, declaration order wins. A cycle is a refusal, not a
    /// partial order.
    pub fn topo_order(&self) -> Result<Vec<usize>, ConfigError> {
        let n = self.len();
        let mut remaining_deps: Vec<HashSet<usize>> =
            self.deps.iter().map(|d| d.iter().copied().collect()).collect();
        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            let next = (0..n).find(|&i| !done[i] && remaining_deps[i].is_empty());
            match next {
                Some(i) => {
                    done[i] = true;
                    order.push(i);
                    for deps in remaining_deps.iter_mut() {
                        deps.remove(&i);
                    }
                }
                None => {
                    let stuck: Vec<String> = (0..n)
                        .filter(|&i| !done[i])
                        .map(|i| self.names[i].clone())
                        .collect();
                    return Err(ConfigError::DependencyCycle(stuck));
                }
            }
        }
        Ok(order)
    }

    /// All transitive ancestors of `id`: BFS over `depends_on`,
    /// deduplicated, in a stable order.
    pub fn dependency_chain(&self, id: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut queue: VecDeque<usize> = self.deps[id].iter().copied().collect();
        while let Some(dep) = queue.pop_front() {
            if seen.insert(dep) {
                chain.push(dep);
                queue.extend(self.deps[dep].iter().copied());
            }
        }
        chain
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Configuration and resolution failures. All of these abort before any
/// task runs.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Parse(String),
    DuplicateName {
        kind: &'static str,
        name: String,
    },
    UnknownReference {
        kind: &'static str,
        name: String,
        referenced_by: String,
    },
    DependencyCycle(Vec<String>),
    UnknownMission(String),
    MissingInput(String),
    InvalidInput {
        name: String,
        reason: String,
    },
    DatasetSchema {
        dataset: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::DuplicateName { kind, name } => {
                write!(f, "duplicate {} name '{}'", kind, name)
            }
            ConfigError::UnknownReference {
                kind,
                name,
                referenced_by,
            } => write!(f, "unknown {} '{}' referenced by {}", kind, name, referenced_by),
            ConfigError::DependencyCycle(tasks) => {
                write!(f, "dependency cycle among tasks: {}", tasks.join(", "))
            }
            ConfigError::UnknownMission(name) => write!(f, "unknown mission '{}'", name),
            ConfigError::MissingInput(name) => {
                write!(f, "missing required mission input '{}'", name)
            }
            ConfigError::InvalidInput { name, reason } => {
                write!(f, "invalid mission input '{}': {}", name, reason)
            }
            ConfigError::DatasetSchema { dataset, reason } => {
                write!(f, "dataset '{}' schema violation: {}", dataset, reason)
            }
        }
    }
}

impl Error for ConfigError {}
