//! Incremental parser for the tagged reason / act / observe turn protocol.
//!
//! The model's streamed output is an unframed sequence of text chunks in
//! which sections are delimited by literal tags:
//!
//! ```text
//! <REASONING>…</REASONING>
//! <ACTION>…</ACTION>
//! <ACTION_INPUT>…</ACTION_INPUT>
//! <ANSWER>…</ANSWER>
//! <ASK_SUPE>…</ASK_SUPE>
//! ```
//!
//! [`TurnParser`] consumes chunks as they arrive and drives a
//! [`TurnHandler`] with streaming callbacks. `REASONING` and `ANSWER`
//! content is published incrementally; `ACTION`, `ACTION_INPUT`, and
//! `ASK_SUPE` are accumulated and exposed through accessors once their
//! closing tag (or the end of the stream) is seen.
//!
//! # Correctness under chunking
//!
//! A tag may be split across chunk boundaries at any byte. The parser is
//! *streaming-equivalent*: for any input and any chunking of it, the final
//! `answer` / `action` / `action_input` / `ask_supe` values are identical
//! to feeding the whole input as one chunk. Inside a section the parser
//! publishes eagerly but retains the last *L − 1* bytes (where *L* is the
//! closing-tag length) in case they begin a split closing tag.
//!
//! # Truncated streams
//!
//! Generation is usually halted by a provider-level stop sequence right
//! after `</ACTION_INPUT>` or `</ANSWER>`, but a provider may cut the
//! stream before a closing tag arrives. [`TurnParser::finish`] handles
//! that: if the parser is mid-`ACTION_INPUT` the retained buffer becomes
//! the action input (whitespace-trimmed), and `on_answer_end` is always
//! invoked so downstream consumers see a completed turn.

/// Parser section state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Outside any tagged section. Untagged text is reported via
    /// [`TurnHandler::on_thinking`].
    None,
    Reasoning,
    Action,
    ActionInput,
    Answer,
    AskSupe,
}

/// Streaming callbacks fired while a turn is parsed.
///
/// All methods default to no-ops; implement only what you observe. The
/// final section values are read from the parser itself after the stream
/// ends ([`TurnParser::action`] and friends).
pub trait TurnHandler: Send {
    /// Untagged text encountered between sections.
    fn on_thinking(&mut self, _text: &str) {}
    /// A piece of `<REASONING>` content, in stream order.
    fn on_reasoning_chunk(&mut self, _text: &str) {}
    /// The `</REASONING>` tag was consumed.
    fn on_reasoning_end(&mut self) {}
    /// A piece of `<ANSWER>` content, in stream order.
    fn on_answer_chunk(&mut self, _text: &str) {}
    /// The answer section ended (closing tag or stream termination).
    fn on_answer_end(&mut self) {}
}

/// A handler that ignores every callback.
pub struct NullHandler;

impl TurnHandler for NullHandler {}

impl<T: TurnHandler + ?Sized> TurnHandler for &mut T {
    fn on_thinking(&mut self, text: &str) {
        (**self).on_thinking(text)
    }
    fn on_reasoning_chunk(&mut self, text: &str) {
        (**self).on_reasoning_chunk(text)
    }
    fn on_reasoning_end(&mut self) {
        (**self).on_reasoning_end()
    }
    fn on_answer_chunk(&mut self, text: &str) {
        (**self).on_answer_chunk(text)
    }
    fn on_answer_end(&mut self) {
        (**self).on_answer_end()
    }
}

const OPEN_TAGS: [(&str, ParserState); 5] = [
    ("<REASONING>", ParserState::Reasoning),
    ("<ACTION>", ParserState::Action),
    ("<ACTION_INPUT>", ParserState::ActionInput),
    ("<ANSWER>", ParserState::Answer),
    ("<ASK_SUPE>", ParserState::AskSupe),
];

/// Length of the longest opening tag (`<ACTION_INPUT>`).
const OPEN_TAG_MAX_LEN: usize = 14;

fn close_tag(state: ParserState) -> &'static str {
    match state {
        ParserState::Reasoning => "</REASONING>",
        ParserState::Action => "</ACTION>",
        ParserState::ActionInput => "</ACTION_INPUT>",
        ParserState::Answer => "</ANSWER>",
        ParserState::AskSupe => "</ASK_SUPE>",
        ParserState::None => unreachable!("no closing tag outside a section"),
    }
}

/// Largest `i <= at` that is a char boundary of `s`.
fn floor_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Length of the longest buffer suffix that is a proper prefix of some
/// opening tag (and might therefore complete into one on the next chunk).
fn partial_open_suffix_len(buf: &str) -> usize {
    let upper = buf.len().min(OPEN_TAG_MAX_LEN - 1);
    for k in (1..=upper).rev() {
        let start = buf.len() - k;
        if !buf.is_char_boundary(start) {
            continue;
        }
        let suffix = &buf[start..];
        if OPEN_TAGS.iter().any(|(tag, _)| tag.starts_with(suffix)) {
            return k;
        }
    }
    0
}

/// Incremental parser over one agent turn.
///
/// Feed chunks with [`process_chunk`](TurnParser::process_chunk), then call
/// [`finish`](TurnParser::finish) exactly once when the provider stream
/// terminates. Accessors are meaningful after `finish`.
pub struct TurnParser<H: TurnHandler> {
    handler: H,
    state: ParserState,
    buffer: String,
    /// Scratch accumulator for ACTION / ACTION_INPUT / ASK_SUPE sections.
    acc: String,
    /// Leading newlines are stripped at section entry; cleared once the
    /// first non-newline byte is seen.
    strip_newlines: bool,
    reasoning: String,
    answer: String,
    action: String,
    action_input: String,
    ask_supe: String,
    answer_ended: bool,
    finished: bool,
}

impl<H: TurnHandler> TurnParser<H> {
    /// Create a parser that drives `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            state: ParserState::None,
            buffer: String::new(),
            acc: String::new(),
            strip_newlines: false,
            reasoning: String::new(),
            answer: String::new(),
            action: String::new(),
            action_input: String::new(),
            ask_supe: String::new(),
            answer_ended: false,
            finished: false,
        }
    }

    /// Current section state (mainly useful in tests).
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Accumulated `<REASONING>` content.
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Final answer text; empty when the turn produced no `<ANSWER>`.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Final action name; empty when the turn produced no `<ACTION>`.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Raw action input payload.
    pub fn action_input(&self) -> &str {
        &self.action_input
    }

    /// Question addressed to the supervisor; empty when absent.
    pub fn ask_supe(&self) -> &str {
        &self.ask_supe
    }

    /// Feed one stream chunk.
    pub fn process_chunk(&mut self, chunk: &str) {
        if chunk.is_empty() || self.finished {
            return;
        }
        self.buffer.push_str(chunk);
        self.drain();
    }

    /// Signal end of stream (including provider stop-sequence interruption).
    ///
    /// Flushes whatever is retained into the current section, applies the
    /// truncated-`ACTION_INPUT` rule, and guarantees `on_answer_end` has
    /// been called.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let rest = std::mem::take(&mut self.buffer);
        match self.state {
            ParserState::None => {
                if !rest.is_empty() {
                    self.handler.on_thinking(&rest);
                }
            }
            ParserState::Reasoning => {
                if !rest.is_empty() {
                    self.deliver(ParserState::Reasoning, &rest);
                }
                self.handler.on_reasoning_end();
            }
            ParserState::Answer => {
                if !rest.is_empty() {
                    self.deliver(ParserState::Answer, &rest);
                }
            }
            ParserState::Action => {
                self.acc.push_str(&rest);
                self.action = std::mem::take(&mut self.acc).trim().to_string();
            }
            ParserState::ActionInput => {
                // The model was cut off after the payload but before the
                // closing tag; the retained buffer is the input.
                self.acc.push_str(&rest);
                self.action_input = std::mem::take(&mut self.acc).trim().to_string();
            }
            ParserState::AskSupe => {
                self.acc.push_str(&rest);
                self.ask_supe = std::mem::take(&mut self.acc).trim().to_string();
            }
        }
        self.state = ParserState::None;

        if !self.answer_ended {
            self.answer_ended = true;
            self.handler.on_answer_end();
        }
    }

    fn deliver(&mut self, state: ParserState, content: &str) {
        match state {
            ParserState::Reasoning => {
                self.reasoning.push_str(content);
                self.handler.on_reasoning_chunk(content);
            }
            ParserState::Answer => {
                self.answer.push_str(content);
                self.handler.on_answer_chunk(content);
            }
            ParserState::Action | ParserState::ActionInput | ParserState::AskSupe => {
                self.acc.push_str(content);
            }
            ParserState::None => {}
        }
    }

    fn close_section(&mut self, state: ParserState) {
        match state {
            ParserState::Reasoning => self.handler.on_reasoning_end(),
            ParserState::Answer => {
                self.answer_ended = true;
                self.handler.on_answer_end();
            }
            ParserState::Action => {
                self.action = std::mem::take(&mut self.acc).trim().to_string();
            }
            ParserState::ActionInput => {
                self.action_input = std::mem::take(&mut self.acc);
            }
            ParserState::AskSupe => {
                self.ask_supe = std::mem::take(&mut self.acc).trim().to_string();
            }
            ParserState::None => {}
        }
    }

    fn drain(&mut self) {
        loop {
            match self.state {
                ParserState::None => {
                    let mut found: Option<(usize, ParserState, usize)> = None;
                    for (tag, next) in OPEN_TAGS.iter() {
                        if let Some(i) = self.buffer.find(tag) {
                            if found.map_or(true, |(fi, _, _)| i < fi) {
                                found = Some((i, *next, tag.len()));
                            }
                        }
                    }
                    match found {
                        Some((i, next, tag_len)) => {
                            if i > 0 {
                                let pre = self.buffer[..i].to_string();
                                self.handler.on_thinking(&pre);
                            }
                            self.buffer.drain(..i + tag_len);
                            self.state = next;
                            self.strip_newlines = true;
                            self.acc.clear();
                        }
                        None => {
                            let keep = partial_open_suffix_len(&self.buffer);
                            let cut = floor_boundary(&self.buffer, self.buffer.len() - keep);
                            if cut > 0 {
                                let pre: String = self.buffer.drain(..cut).collect();
                                self.handler.on_thinking(&pre);
                            }
                            return;
                        }
                    }
                }
                state => {
                    if self.strip_newlines {
                        let trimmed = self.buffer.trim_start_matches('\n').len();
                        let n = self.buffer.len() - trimmed;
                        if n > 0 {
                            self.buffer.drain(..n);
                        }
                        if self.buffer.is_empty() {
                            return;
                        }
                        self.strip_newlines = false;
                    }
                    let close = close_tag(state);
                    if let Some(i) = self.buffer.find(close) {
                        if i > 0 {
                            let content = self.buffer[..i].to_string();
                            self.deliver(state, &content);
                        }
                        self.buffer.drain(..i + close.len());
                        self.close_section(state);
                        self.state = ParserState::None;
                    } else {
                        let keep = (close.len() - 1).min(self.buffer.len());
                        let cut = floor_boundary(&self.buffer, self.buffer.len() - keep);
                        if cut > 0 {
                            let content: String = self.buffer.drain(..cut).collect();
                            self.deliver(state, &content);
                        }
                        return;
                    }
                }
            }
        }
    }
}
