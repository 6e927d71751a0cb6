//! Per-turn JSONL snapshots.
//!
//! A [`TurnLogger`] appends one JSON line per completed turn to a
//! per-session file, giving an offline record of what each agent reasoned,
//! called, and answered. Secret values never reach the log: the turn
//! record carries the placeholder form of tool input, not the injected
//! one.

use chrono::Utc;
use serde_json::json;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Snapshot of one completed turn.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// 1-based turn counter within the chat.
    pub turn: usize,
    /// Action name, empty for terminal turns.
    pub action: String,
    /// Raw (un-injected) action input.
    pub action_input: String,
    /// Reasoning text captured this turn.
    pub reasoning: String,
    /// Answer text, empty for tool turns.
    pub answer: String,
    /// Supervisor question, empty unless the agent asked one.
    pub ask_supe: String,
    /// First bytes of the observation produced by this turn's tool call.
    pub observation_preview: String,
}

/// Appends turn records to `<dir>/<session_id>.jsonl`.
pub struct TurnLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl TurnLogger {
    /// Create (or append to) the log file for `session_id` under `dir`.
    pub fn create(dir: &Path, session_id: &str) -> std::io::Result<Self> {
        create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", session_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Write failures are logged and swallowed; turn
    /// logging must never fail a turn.
    pub fn log_turn(&self, record: &TurnRecord) {
        let line = json!({
            "turn": record.turn,
            "timestamp": Utc::now().to_rfc3339(),
            "action": record.action,
            "action_input": record.action_input,
            "reasoning": record.reasoning,
            "answer": record.answer,
            "ask_supe": record.ask_supe,
            "observation_preview": record.observation_preview,
        });
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", line) {
            log::warn!("turn log write failed for {}: {}", self.path.display(), e);
        }
    }
}
