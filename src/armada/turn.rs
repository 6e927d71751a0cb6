//! The reason → act → observe loop for one agent chat.
//!
//! A chat is a sequence of turns against one [`Session`]. Each turn
//! streams the provider response through the
//! [`TurnParser`](crate::armada::turn_parser::TurnParser); if the model
//! emitted an `<ACTION>`, the orchestrator dispatches the tool, runs the
//! raw result through the interceptor, wraps it in an observation
//! envelope, and feeds it back as the next turn's input. The loop ends
//! when a turn produces no action (final `<ANSWER>`), when the model asks
//! its supervisor a question (`<ASK_SUPE>`), or when the turn limit is
//! hit.
//!
//! Secret-value injection happens here, immediately before tool dispatch:
//! `{{secrets.NAME}}` placeholders in the action input are substituted
//! from the agent's secret map. The session history and the turn log only
//! ever see the placeholder form.

use crate::armada::pruning::PruningManager;
use crate::armada::result_store::{Intercepted, ResultInterceptor};
use crate::armada::session::Session;
use crate::armada::tools::ToolMap;
use crate::armada::turn_log::{TurnLogger, TurnRecord};
use crate::armada::turn_parser::{TurnHandler, TurnParser};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;

/// Streaming observer for one chat: the parser callbacks plus tool
/// dispatch notifications.
pub trait TurnObserver: TurnHandler {
    fn on_calling_tool(&mut self, _tool: &str, _input: &str) {}
    fn on_tool_complete(&mut self, _tool: &str, _success: bool) {}
}

/// An observer that ignores everything.
pub struct NullObserver;

impl TurnHandler for NullObserver {}
impl TurnObserver for NullObserver {}

/// Terminal state of one chat.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final `<ANSWER>` text; empty when the chat ended another way.
    pub answer: String,
    /// `<ASK_SUPE>` question; non-empty when the agent yielded to its
    /// supervisor.
    pub ask_supe: String,
    /// The complete text of the final assistant turn. Trailing blocks
    /// that sit outside the answer tags (`<OUTPUT>`, `<LEARNINGS>`) are
    /// only reachable here.
    pub raw_response: String,
    /// Number of provider round-trips consumed.
    pub turns: usize,
    /// Whether the chat was cut off by the turn limit.
    pub hit_turn_limit: bool,
}

/// Drives the turn loop over one session.
///
/// Borrowed wholesale from the owning agent for the duration of a single
/// `chat` call; tool calls never run concurrently within one agent.
pub struct TurnOrchestrator<'a> {
    pub session: &'a Session,
    pub tools: &'a ToolMap,
    pub interceptor: &'a ResultInterceptor,
    pub pruning: &'a mut PruningManager,
    pub secrets: &'a HashMap<String, String>,
    /// Maximum provider round-trips per chat; 0 means unbounded.
    pub turn_limit: usize,
    pub turn_logger: Option<&'a TurnLogger>,
}

impl<'a> TurnOrchestrator<'a> {
    /// Run the loop until the chat terminates.
    pub async fn run<O: TurnObserver>(
        &mut self,
        observer: &mut O,
        input: &str,
    ) -> Result<TurnOutcome, Box<dyn Error + Send + Sync>> {
        let mut current_input = input.to_string();
        // The observation sent in turn N occupies the second-to-last
        // message slot only once turn N's response has been appended, so
        // registration with the pruning manager is deferred one turn.
        let mut pending_registration: Option<(String, Option<usize>, Option<usize>)> = None;
        let mut answer = String::new();
        let mut ask_supe = String::new();
        let mut raw_response = String::new();
        let mut turns = 0usize;
        let mut hit_turn_limit = false;

        loop {
            if self.turn_limit > 0 && turns >= self.turn_limit {
                hit_turn_limit = true;
                log::warn!(
                    "turn limit ({}) reached on session {}",
                    self.turn_limit,
                    self.session.id()
                );
                break;
            }
            turns += 1;

            let (turn_answer, turn_ask, action, action_input, reasoning) = {
                let mut parser = TurnParser::new(&mut *observer);
                let response = self
                    .session
                    .send_stream(&current_input, |chunk| parser.process_chunk(chunk))
                    .await?;
                parser.finish();
                raw_response = response.content;
                (
                    parser.answer().trim().to_string(),
                    parser.ask_supe().to_string(),
                    parser.action().to_string(),
                    parser.action_input().to_string(),
                    parser.reasoning().to_string(),
                )
            };

            if let Some((tool, single, all)) = pending_registration.take() {
                self.pruning.register_and_prune(&tool, single, all).await;
            }

            if !turn_answer.is_empty() {
                answer = turn_answer;
            }
            if !turn_ask.is_empty() {
                ask_supe = turn_ask;
                self.log_turn(turns, "", &action_input, &reasoning, &answer, &ask_supe, "");
                break;
            }
            if action.is_empty() {
                self.log_turn(turns, "", &action_input, &reasoning, &answer, "", "");
                break;
            }

            observer.on_calling_tool(&action, &action_input);
            let (observation, success) = match self.tools.get(&action) {
                None => (
                    wrap_plain_observation(&format!("Error: Tool '{}' not found", action)),
                    false,
                ),
                Some(tool) => {
                    let injected = inject_secrets(&action_input, self.secrets);
                    let result = tool.call(&injected).await;
                    let overrides = prune_overrides(&action_input);
                    pending_registration = Some((action.clone(), overrides.0, overrides.1));
                    match result {
                        Ok(raw) => {
                            let intercepted = self.interceptor.intercept(&action, &raw);
                            (wrap_observation(&intercepted), true)
                        }
                        Err(e) => (wrap_plain_observation(&format!("Error: {}", e)), false),
                    }
                }
            };
            observer.on_tool_complete(&action, success);
            self.log_turn(
                turns,
                &action,
                &action_input,
                &reasoning,
                "",
                "",
                &preview(&observation, 200),
            );
            current_input = observation;
        }

        Ok(TurnOutcome {
            answer,
            ask_supe,
            raw_response,
            turns,
            hit_turn_limit,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn log_turn(
        &self,
        turn: usize,
        action: &str,
        action_input: &str,
        reasoning: &str,
        answer: &str,
        ask_supe: &str,
        observation_preview: &str,
    ) {
        if let Some(logger) = self.turn_logger {
            logger.log_turn(&TurnRecord {
                turn,
                action: action.to_string(),
                action_input: action_input.to_string(),
                reasoning: reasoning.to_string(),
                answer: answer.to_string(),
                ask_supe: ask_supe.to_string(),
                observation_preview: observation_preview.to_string(),
            });
        }
    }
}

/// Wrap an intercepted result in the observation envelope, appending the
/// metadata block when the result was spilled.
pub fn wrap_observation(intercepted: &Intercepted) -> String {
    match &intercepted.metadata {
        None => wrap_plain_observation(&intercepted.data),
        Some(metadata) => {
            let lines: Vec<String> = metadata
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect();
            format!(
                "<OBSERVATION>\n{}\n</OBSERVATION>\n<OBSERVATION_METADATA>\n{}\n</OBSERVATION_METADATA>",
                intercepted.data,
                lines.join("\n")
            )
        }
    }
}

/// Wrap plain observation text (tool errors, raw results) in the
/// envelope.
pub fn wrap_plain_observation(data: &str) -> String {
    format!("<OBSERVATION>\n{}\n</OBSERVATION>", data)
}

/// Substitute `{{secrets.NAME}}` placeholders. Unknown placeholders are
/// left for the tool to reject.
pub fn inject_secrets(input: &str, secrets: &HashMap<String, String>) -> String {
    if secrets.is_empty() || !input.contains("{{secrets.") {
        return input.to_string();
    }
    let mut out = input.to_string();
    for (name, value) in secrets {
        let placeholder = format!("{{{{secrets.{}}}}}", name);
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// Read the optional per-call pruning-limit overrides out of a JSON tool
/// input. Non-JSON input simply has no overrides.
fn prune_overrides(action_input: &str) -> (Option<usize>, Option<usize>) {
    match serde_json::from_str::<Value>(action_input) {
        Ok(Value::Object(map)) => {
            let single = map
                .get("single_tool_limit")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            let all = map
                .get("all_tool_limit")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            (single, all)
        }
        _ => (None, None),
    }
}

/// Clip text for event previews and logs without splitting characters.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}...", &text[..i]),
        None => text.to_string(),
    }
}
