//! Prompt assembly for agents and supervisors, plus the small string
//! helpers used to read tagged blocks back out of model output.
//!
//! The agent system prompt is a base template with four slots
//! (`{{TOOLS}}`, `{{MODE_INSTRUCTIONS}}`, `{{RESPONSE_PATTERNS}}`,
//! `{{RULES}}`) substituted according to the agent's mode, followed by
//! personality, role, and (inside a mission) dataset descriptions. The
//! supervisor prompt lists callable agents and the supervisor tool
//! schemas, and appends a strict `<OUTPUT>` block specification when the
//! task declares an output schema.
//!
//! All tag scanning here is plain string search; the wire protocol is
//! simple enough that a regex engine would be dead weight.

use crate::armada::schema::FieldSpec;

/// Terminator the model must emit right after `</ACTION_INPUT>` or
/// `</ANSWER>`. Configured as a provider-level stop sequence so
/// generation halts before the model can invent its own observation.
pub const STOP_SENTINEL: &str = "___STOP___";

const AGENT_BASE_TEMPLATE: &str = "\
You are an autonomous agent.

{{MODE_INSTRUCTIONS}}

## Tools

You may call the following tools:

{{TOOLS}}

{{RESPONSE_PATTERNS}}

## Rules

{{RULES}}
";

const CHAT_MODE_INSTRUCTIONS: &str = "\
You are having a focused working conversation. Answer the user's request
directly, calling tools when they help.";

const WORKFLOW_MODE_INSTRUCTIONS: &str = "\
You execute assignments inside an automated workflow. There is no human in
the loop: work autonomously until the assignment is complete, then deliver
your final answer. If you are blocked on information only your supervisor
can provide, ask for it with <ASK_SUPE> and stop.";

const RESPONSE_PATTERNS: &str = "\
## Response format

Think, act, and observe using exactly these tags:

<REASONING>
Why you are taking the next step.
</REASONING>
<ACTION>tool_name</ACTION>
<ACTION_INPUT>
{\"field\": \"value\"}
</ACTION_INPUT>
___STOP___

After each action the system replies with an <OBSERVATION> block (and
sometimes an <OBSERVATION_METADATA> block describing a stored result you
can read with the result_* tools). Continue reasoning and acting until the
assignment is complete, then finish with:

<ANSWER>
Your final answer.
</ANSWER>
___STOP___

To ask your supervisor a question instead, finish the turn with:

<ASK_SUPE>
Your question.
</ASK_SUPE>
___STOP___";

const AGENT_RULES: &str = "\
- Emit ___STOP___ immediately after </ACTION_INPUT> or </ANSWER> and
  produce nothing after it.
- Never write your own <OBSERVATION> blocks; the system injects them.
- One action per turn. The ACTION_INPUT payload must be valid JSON unless
  the tool says otherwise.
- If a tool returns an error, adjust your approach instead of repeating
  the same call.";

/// Mode an agent runs in; selects the `{{MODE_INSTRUCTIONS}}` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Chat,
    Workflow,
}

/// Assemble an agent system prompt.
pub fn render_agent_prompt(
    mode: AgentMode,
    tool_docs: &str,
    personality: &str,
    role: &str,
    dataset_notes: Option<&str>,
) -> String {
    let mode_instructions = match mode {
        AgentMode::Chat => CHAT_MODE_INSTRUCTIONS,
        AgentMode::Workflow => WORKFLOW_MODE_INSTRUCTIONS,
    };
    let mut prompt = AGENT_BASE_TEMPLATE
        .replace("{{MODE_INSTRUCTIONS}}", mode_instructions)
        .replace("{{TOOLS}}", tool_docs)
        .replace("{{RESPONSE_PATTERNS}}", RESPONSE_PATTERNS)
        .replace("{{RULES}}", AGENT_RULES);

    if !personality.is_empty() {
        prompt.push_str(&format!("\n## Personality\n\n{}\n", personality));
    }
    if !role.is_empty() {
        prompt.push_str(&format!("\n## Role\n\n{}\n", role));
    }
    if let Some(notes) = dataset_notes {
        if !notes.is_empty() {
            prompt.push_str(&format!("\n## Datasets\n\n{}\n", notes));
        }
    }
    prompt
}

/// Assemble the supervisor system prompt for one task.
///
/// `agents` is `(name, role)` for every agent callable in this task;
/// `queryable` is `(task_name, output schema)` for every completed
/// dependency whose outputs can be read with `query_task_output`.
pub fn render_supervisor_prompt(
    agents: &[(String, String)],
    tool_docs: &str,
    output_schema: Option<&[FieldSpec]>,
    queryable: &[(String, Vec<FieldSpec>)],
) -> String {
    let mut prompt = String::from(
        "You are the supervisor for one task of a mission. You do not do the \
work yourself: you delegate to the agents below, verify what comes back, \
and deliver the task result.\n\n## Agents\n\n",
    );
    if agents.is_empty() {
        prompt.push_str("(no agents assigned; complete the task from the context you have)\n");
    }
    for (name, role) in agents {
        prompt.push_str(&format!("- {}: {}\n", name, role));
    }

    prompt.push_str(
        "\nAssign work with call_agent. `task` always starts a fresh \
assignment: the agent abandons anything in flight. `response` continues \
an agent that asked you a question. Use ask_agent for a quick factual \
question answered from an agent's memory.\n\n## Tools\n\n",
    );
    prompt.push_str(tool_docs);
    prompt.push_str("\n");
    prompt.push_str(RESPONSE_PATTERNS);
    prompt.push_str("\n\n## Rules\n\n");
    prompt.push_str(AGENT_RULES);

    if !queryable.is_empty() {
        prompt.push_str("\n\n## Queryable task outputs\n\n");
        for (task, schema) in queryable {
            prompt.push_str(&format!("- {}: fields ", task));
            if schema.is_empty() {
                prompt.push_str("(unstructured)");
            } else {
                let names: Vec<&str> = schema.iter().map(|f| f.name.as_str()).collect();
                prompt.push_str(&names.join(", "));
            }
            prompt.push('\n');
        }
    }

    if let Some(schema) = output_schema {
        prompt.push_str(
            "\n\n## Structured output\n\nImmediately after </ANSWER>, append an \
OUTPUT block containing exactly one JSON object with these fields:\n\n",
        );
        for field in schema {
            prompt.push_str(&format!(
                "- {} ({}{}){}\n",
                field.name,
                field.field_type.as_str(),
                if field.required { ", required" } else { "" },
                field
                    .description
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            ));
        }
        prompt.push_str(
            "\nFormat:\n\n<ANSWER>\n...summary...\n</ANSWER>\n<OUTPUT>\n{\"field\": \
...}\n</OUTPUT>\n<LEARNINGS>\n{\"insights\": [...]}\n</LEARNINGS>\n___STOP___\n\n\
The LEARNINGS block is optional; use it to pass insights to the next \
iteration of this task.",
        );
    }
    prompt
}

/// Prompt wrapper for a memory-only follow-up question.
pub fn render_followup_prompt(question: &str) -> String {
    format!(
        "<FOLLOWUP_QUESTION>\n{}\n</FOLLOWUP_QUESTION>\n\nAnswer from what you \
already know in this conversation. Do not call tools. Reply with only:\n\
<ANSWER>\nyour answer\n</ANSWER>",
        question
    )
}

/// Substitute `{{vars.*}}`, `{{inputs.*}}`, and `{{item.*}}` references in
/// an objective string. Unknown references are left untouched.
pub fn render_template(
    text: &str,
    vars: &serde_json::Map<String, serde_json::Value>,
    inputs: &serde_json::Map<String, serde_json::Value>,
    item: Option<&serde_json::Map<String, serde_json::Value>>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let reference = after[..end].trim();
                let value = lookup_reference(reference, vars, inputs, item);
                match value {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup_reference(
    reference: &str,
    vars: &serde_json::Map<String, serde_json::Value>,
    inputs: &serde_json::Map<String, serde_json::Value>,
    item: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Option<String> {
    let (scope, key) = reference.split_once('.')?;
    let value = match scope {
        "vars" => vars.get(key),
        "inputs" => inputs.get(key),
        "item" => item.and_then(|m| m.get(key)),
        _ => None,
    }?;
    Some(match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Extract the inner content of the first `<TAG>…</TAG>` block.
pub fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

/// Remove every `<TAG>…</TAG>` block (tags included) from `text`.
pub fn strip_tag_blocks(text: &str, tag: &str) -> String {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(&open) {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + open.len()..];
                match after.find(&close) {
                    Some(end) => {
                        rest = &after[end + close.len()..];
                    }
                    None => {
                        // Unclosed block: drop the rest.
                        rest = "";
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn template_substitutes_all_three_scopes() {
        let vars = map(json!({"region": "eu"}));
        let inputs = map(json!({"query": "solar"}));
        let item = map(json!({"url": "https://example.com"}));
        let rendered = render_template(
            "search {{inputs.query}} in {{vars.region}} at {{item.url}} ({{vars.missing}})",
            &vars,
            &inputs,
            Some(&item),
        );
        assert_eq!(
            rendered,
            "search solar in eu at https://example.com ({{vars.missing}})"
        );
    }

    #[test]
    fn tag_extraction_and_stripping() {
        let text = "before <OUTPUT>{\"a\":1}</OUTPUT> after";
        assert_eq!(extract_tag(text, "OUTPUT"), Some("{\"a\":1}"));
        assert_eq!(strip_tag_blocks(text, "OUTPUT"), "before  after");
        assert_eq!(extract_tag(text, "LEARNINGS"), None);
    }
}
