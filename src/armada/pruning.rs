//! Bounds the LM context by replacing old tool observations with a
//! sentinel.
//!
//! The [`PruningManager`] tracks every observation message it is handed
//! and enforces two recency policies:
//!
//! 1. **Per-tool** (`single_tool_limit`, N): a window of at most N
//!    observations per tool. When a registration overflows the window,
//!    every entry older than the newest is pruned, oldest first.
//! 2. **Per-message** (`all_tool_limit`, M): prune any tracked observation
//!    that sits more than M insertions behind the newest one.
//!
//! Both limits can be overridden per tool call through the optional
//! `single_tool_limit` / `all_tool_limit` input fields; a value of 0
//! disables the policy for that registration.
//!
//! A pruned message keeps its slot in the history (only its content is
//! rewritten to the literal [`PRUNED_SENTINEL`]), so positions recorded
//! in message metadata stay valid. Pruning is idempotent: a message
//! already at the sentinel is skipped.

use crate::armada::provider::{Message, MessageContent};
use crate::armada::session::SharedSessionState;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// The literal body of a pruned observation.
pub const PRUNED_SENTINEL: &str = "[RESULT PRUNED]";

/// Tracks prunable observations for one session.
pub struct PruningManager {
    session: SharedSessionState,
    /// Default per-tool history bound; 0 disables.
    single_tool_limit: usize,
    /// Default whole-history recency bound; 0 disables.
    all_tool_limit: usize,
    /// tool name -> tracked message positions, oldest first.
    by_tool: HashMap<String, Vec<usize>>,
    /// message position -> tool name (reverse map).
    by_position: HashMap<usize, String>,
}

impl PruningManager {
    /// Create a manager over `session` with default limits. A limit of 0
    /// disables the corresponding policy.
    pub fn new(session: SharedSessionState, single_tool_limit: usize, all_tool_limit: usize) -> Self {
        Self {
            session,
            single_tool_limit,
            all_tool_limit,
            by_tool: HashMap::new(),
            by_position: HashMap::new(),
        }
    }

    /// Number of still-tracked observations for `tool`.
    pub fn tracked(&self, tool: &str) -> usize {
        self.by_tool.get(tool).map(Vec::len).unwrap_or(0)
    }

    /// Total tracked observations across all tools.
    pub fn tracked_total(&self) -> usize {
        self.by_position.len()
    }

    /// Forget every tracked observation. Must accompany a session reset:
    /// tracked positions are only meaningful against the history they
    /// were recorded in.
    pub fn clear_tracking(&mut self) {
        self.by_tool.clear();
        self.by_position.clear();
    }

    /// Take ownership of the most recent observation and apply both
    /// pruning policies.
    ///
    /// Call this once the observation actually occupies the
    /// second-to-last index of the session message list; the history
    /// pattern is `[..., user = observation, assistant = next response]`.
    /// The message is stamped with a fresh id, the producing tool name,
    /// its position, and `prunable = true`, then both policies run with
    /// the per-call overrides applied.
    pub async fn register_and_prune(
        &mut self,
        tool: &str,
        single_override: Option<usize>,
        all_override: Option<usize>,
    ) {
        let mut state = self.session.lock().await;
        let len = state.messages.len();
        if len < 2 {
            return;
        }
        let position = len - 2;

        // A message registers at most once; re-registration with the same
        // state must not mutate anything further.
        if !self.by_position.contains_key(&position) {
            if let Some(meta) = state.messages[position].metadata.as_mut() {
                meta.id = Uuid::new_v4().to_string();
                meta.tool_name = tool.to_string();
                meta.position = position;
                meta.prunable = true;
            }
            self.by_tool
                .entry(tool.to_string())
                .or_default()
                .push(position);
            self.by_position.insert(position, tool.to_string());
        }

        let single_limit = single_override.unwrap_or(self.single_tool_limit);
        if single_limit > 0 {
            let history = self.by_tool.entry(tool.to_string()).or_default();
            if history.len() > single_limit {
                // Window overflow: flush everything older than the newest
                // entry for this tool.
                while history.len() > 1 {
                    let oldest = history.remove(0);
                    self.by_position.remove(&oldest);
                    prune_message(&mut state.messages, oldest);
                }
            }
        }

        let all_limit = all_override.unwrap_or(self.all_tool_limit);
        if all_limit > 0 && position > all_limit {
            let cutoff = position - all_limit;
            let stale: Vec<usize> = self
                .by_position
                .keys()
                .copied()
                .filter(|p| *p < cutoff)
                .collect();
            for p in stale {
                if let Some(tool_name) = self.by_position.remove(&p) {
                    if let Some(history) = self.by_tool.get_mut(&tool_name) {
                        history.retain(|x| *x != p);
                    }
                }
                prune_message(&mut state.messages, p);
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "registered observation for '{}' at {} ({} tracked)",
                tool,
                position,
                self.by_position.len()
            );
        }
    }
}

/// Rewrite a message body to the sentinel. Skips messages already pruned.
fn prune_message(messages: &mut [Message], position: usize) {
    if let Some(message) = messages.get_mut(position) {
        if message.content.is_text(PRUNED_SENTINEL) {
            return;
        }
        message.content = MessageContent::Text(Arc::from(PRUNED_SENTINEL));
    }
}
