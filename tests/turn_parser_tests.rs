use armada::armada::turn_parser::{NullHandler, ParserState, TurnHandler, TurnParser};

#[derive(Default)]
struct RecordingHandler {
    thinking: String,
    reasoning: String,
    answer_chunks: String,
    reasoning_ends: usize,
    answer_ends: usize,
}

impl TurnHandler for RecordingHandler {
    fn on_thinking(&mut self, text: &str) {
        self.thinking.push_str(text);
    }
    fn on_reasoning_chunk(&mut self, text: &str) {
        self.reasoning.push_str(text);
    }
    fn on_reasoning_end(&mut self) {
        self.reasoning_ends += 1;
    }
    fn on_answer_chunk(&mut self, text: &str) {
        self.answer_chunks.push_str(text);
    }
    fn on_answer_end(&mut self) {
        self.answer_ends += 1;
    }
}

/// Parse `input` fed as chunks of `chunk_chars` characters and return the
/// terminal accessors.
fn parse_chunked(input: &str, chunk_chars: usize) -> (String, String, String, String) {
    let mut parser = TurnParser::new(NullHandler);
    let chars: Vec<char> = input.chars().collect();
    for group in chars.chunks(chunk_chars.max(1)) {
        let piece: String = group.iter().collect();
        parser.process_chunk(&piece);
    }
    parser.finish();
    (
        parser.answer().to_string(),
        parser.action().to_string(),
        parser.action_input().to_string(),
        parser.ask_supe().to_string(),
    )
}

#[test]
fn split_tag_streaming_emits_reasoning_and_returns_to_none() {
    let mut handler = RecordingHandler::default();
    let mut parser = TurnParser::new(&mut handler);
    parser.process_chunk("<REAS");
    parser.process_chunk("ONING>hi</REAS");
    parser.process_chunk("ONING>");
    assert_eq!(parser.state(), ParserState::None);
    assert_eq!(parser.reasoning(), "hi");
    parser.finish();
    drop(parser);
    assert_eq!(handler.reasoning, "hi");
    assert_eq!(handler.reasoning_ends, 1);
    assert_eq!(handler.answer_ends, 1, "finish always ends the answer");
}

#[test]
fn streaming_is_equivalent_for_any_chunking() {
    let fixtures = [
        "<REASONING>\nfigure it out\n</REASONING>\n<ACTION>search</ACTION>\n<ACTION_INPUT>\n{\"q\": \"rust\"}\n</ACTION_INPUT>",
        "<ANSWER>\nfinal answer with unicode: café 日本語 ééé\n</ANSWER>",
        "free text first <ANSWER>then the answer</ANSWER> trailing",
        "<ASK_SUPE>\nwhich dataset should I use?\n</ASK_SUPE>",
        "almost a tag <ACT but not, then <ANSWER>x</ANSWER>",
        "<REASONING>a</REASONING><ANSWER>b</ANSWER><REASONING>c</REASONING>",
    ];
    for fixture in &fixtures {
        let whole = parse_chunked(fixture, usize::MAX);
        for chunk_chars in 1..=7 {
            let chunked = parse_chunked(fixture, chunk_chars);
            assert_eq!(
                whole, chunked,
                "chunking by {} chars diverged on {:?}",
                chunk_chars, fixture
            );
        }
    }
}

#[test]
fn action_sections_accumulate_and_deliver_at_close() {
    let (answer, action, action_input, ask_supe) = parse_chunked(
        "<REASONING>\nneed data\n</REASONING>\n<ACTION>fetch_rows</ACTION>\n<ACTION_INPUT>\n{\"offset\": 0, \"count\": 10}\n</ACTION_INPUT>",
        3,
    );
    assert_eq!(action, "fetch_rows");
    assert_eq!(action_input, "{\"offset\": 0, \"count\": 10}\n");
    assert!(answer.is_empty());
    assert!(ask_supe.is_empty());
}

#[test]
fn truncated_stream_after_action_input_still_exposes_the_payload() {
    // The provider stop sequence can cut the stream before the closing
    // tag arrives.
    let mut parser = TurnParser::new(NullHandler);
    parser.process_chunk("<ACTION>search</ACTION>\n<ACTION_INPUT>\n{\"q\": 1}\n");
    parser.finish();
    assert_eq!(parser.action(), "search");
    assert_eq!(parser.action_input(), "{\"q\": 1}");
}

#[test]
fn leading_newlines_are_stripped_at_section_entry() {
    let mut parser = TurnParser::new(NullHandler);
    parser.process_chunk("<ANSWER>");
    parser.process_chunk("\n");
    parser.process_chunk("\nhello");
    parser.process_chunk("</ANSWER>");
    parser.finish();
    assert_eq!(parser.answer(), "hello");
}

#[test]
fn ask_supe_is_trimmed_and_answer_stays_empty() {
    let mut handler = RecordingHandler::default();
    let mut parser = TurnParser::new(&mut handler);
    parser.process_chunk("<ASK_SUPE>\nwhich region?\n</ASK_SUPE>");
    parser.finish();
    assert_eq!(parser.ask_supe(), "which region?");
    assert!(parser.answer().is_empty());
    drop(parser);
    assert_eq!(handler.answer_ends, 1);
}

#[test]
fn untagged_text_is_reported_as_thinking() {
    let mut handler = RecordingHandler::default();
    let mut parser = TurnParser::new(&mut handler);
    parser.process_chunk("hmm, let me see <ANSWER>done</ANSWER> bye");
    parser.finish();
    assert_eq!(parser.answer(), "done");
    drop(parser);
    assert!(handler.thinking.contains("hmm, let me see"));
    assert!(handler.thinking.contains("bye"));
}

#[test]
fn truncated_answer_content_is_flushed_on_finish() {
    let mut handler = RecordingHandler::default();
    let mut parser = TurnParser::new(&mut handler);
    parser.process_chunk("<ANSWER>\npartial answer without closing tag");
    parser.finish();
    assert_eq!(parser.answer(), "partial answer without closing tag");
    drop(parser);
    assert_eq!(handler.answer_chunks, "partial answer without closing tag");
    assert_eq!(handler.answer_ends, 1);
}

#[test]
fn finish_is_idempotent_and_late_chunks_are_ignored() {
    let mut handler = RecordingHandler::default();
    let mut parser = TurnParser::new(&mut handler);
    parser.process_chunk("<ANSWER>done</ANSWER>");
    parser.finish();
    parser.finish();
    parser.process_chunk("<ANSWER>late</ANSWER>");
    assert_eq!(parser.answer(), "done");
    drop(parser);
    assert_eq!(handler.answer_ends, 1);
}
