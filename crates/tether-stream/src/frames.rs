use serde_json::Value;

use tether_core::events::StreamMeta;

/// One classified `data:` payload from the event stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Literal `[DONE]` sentinel: the stream is complete.
    Done,
    /// `{conversation_id, message_id}` pair.
    Meta(StreamMeta),
    /// One incremental text fragment. May be empty.
    Token(String),
    /// Malformed JSON or an unrecognized shape. Skipped, never fatal.
    Ignored,
}

/// Classify one raw payload string.
///
/// An object carrying both identifiers is metadata even when it also carries
/// other fields; identifier fields must be non-empty strings. Otherwise a
/// present `token` string field (empty allowed) makes it a token event.
pub fn classify(raw: &str) -> Payload {
    if raw == "[DONE]" {
        return Payload::Done;
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return Payload::Ignored,
    };

    let has_ids = value
        .get("conversation_id")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty())
        && value
            .get("message_id")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
    if has_ids {
        if let Ok(meta) = serde_json::from_value::<StreamMeta>(value.clone()) {
            return Payload::Meta(meta);
        }
    }

    if let Some(token) = value.get("token").and_then(Value::as_str) {
        return Payload::Token(token.to_string());
    }

    Payload::Ignored
}

/// Extract `data:` payloads from a run of complete events.
///
/// Events are separated by blank lines; within an event, every line starting
/// with `data: ` (or `data:` with no space) contributes its remainder. All
/// other lines are ignored.
pub fn parse_data_lines(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    for part in raw.split("\n\n") {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        for line in trimmed.lines() {
            if let Some(rest) = line.strip_prefix("data: ") {
                payloads.push(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                payloads.push(rest.to_string());
            }
        }
    }
    payloads
}

/// Stateful byte-to-payload reassembler.
///
/// Transport chunks can split an event anywhere, including inside a
/// multi-byte character, so the decoder buffers raw bytes and only decodes up
/// to the last complete blank-line boundary of each chunk. The boundary is
/// ASCII (`\n\n`) and UTF-8 continuation bytes never contain `\n`, so byte
/// search cannot land inside a character.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk; returns the payloads of every event completed
    /// by it. The trailing partial event is carried forward.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(pos) = last_boundary(&self.buffer) else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.buffer.drain(..pos + 2).collect();
        parse_data_lines(&String::from_utf8_lossy(&complete))
    }

    /// Flush whatever remains at end of input.
    pub fn finish(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_data_lines(&String::from_utf8_lossy(&rest))
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn last_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).rposition(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_done_sentinel() {
        assert_eq!(classify("[DONE]"), Payload::Done);
    }

    #[test]
    fn classify_meta() {
        let payload = classify(r#"{"conversation_id":"c1","message_id":"m1"}"#);
        match payload {
            Payload::Meta(meta) => {
                assert_eq!(meta.conversation_id.as_str(), "c1");
                assert_eq!(meta.message_id.as_str(), "m1");
            }
            other => panic!("expected meta, got {other:?}"),
        }
    }

    #[test]
    fn classify_token_including_empty() {
        assert_eq!(classify(r#"{"token":"Hel"}"#), Payload::Token("Hel".into()));
        assert_eq!(classify(r#"{"token":""}"#), Payload::Token(String::new()));
    }

    #[test]
    fn meta_wins_over_token_in_same_object() {
        let payload =
            classify(r#"{"conversation_id":"c1","message_id":"m1","token":"x"}"#);
        assert!(matches!(payload, Payload::Meta(_)));
    }

    #[test]
    fn empty_identifier_is_not_meta() {
        // Falls through to the token field
        let payload = classify(r#"{"conversation_id":"","message_id":"m1","token":"x"}"#);
        assert_eq!(payload, Payload::Token("x".into()));
    }

    #[test]
    fn malformed_json_is_ignored() {
        assert_eq!(classify("{not json"), Payload::Ignored);
        assert_eq!(classify(r#"{"unrelated":true}"#), Payload::Ignored);
    }

    #[test]
    fn parse_data_lines_both_prefixes() {
        let raw = "data: {\"token\":\"a\"}\n\ndata:{\"token\":\"b\"}\n\n";
        assert_eq!(
            parse_data_lines(raw),
            vec![r#"{"token":"a"}"#, r#"{"token":"b"}"#]
        );
    }

    #[test]
    fn parse_data_lines_skips_other_fields() {
        let raw = "event: message\nid: 3\ndata: payload\n\n";
        assert_eq!(parse_data_lines(raw), vec!["payload"]);
    }

    #[test]
    fn decoder_holds_incomplete_event() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"data: {\"token\":\"He").is_empty());
        assert!(decoder.pending_bytes() > 0);
        let payloads = decoder.feed(b"l\"}\n\n");
        assert_eq!(payloads, vec![r#"{"token":"Hel"}"#]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn decoder_emits_only_up_to_last_boundary() {
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(b"data: a\n\ndata: b\n\ndata: partial");
        assert_eq!(payloads, vec!["a", "b"]);
        assert_eq!(decoder.feed(b"\n\n"), vec!["partial"]);
    }

    #[test]
    fn decoder_survives_split_multibyte_character() {
        // "é" is 0xC3 0xA9; split between the two bytes
        let full = "data: {\"token\":\"caf\u{e9}\"}\n\n".as_bytes();
        let split_at = full.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&full[..split_at]).is_empty());
        let payloads = decoder.feed(&full[split_at..]);
        assert_eq!(payloads.len(), 1);
        assert_eq!(classify(&payloads[0]), Payload::Token("caf\u{e9}".into()));
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), vec!["tail"]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn one_byte_at_a_time() {
        let wire = b"data: {\"token\":\"ok\"}\n\ndata: [DONE]\n\n";
        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();
        for b in wire {
            payloads.extend(decoder.feed(std::slice::from_ref(b)));
        }
        assert_eq!(payloads, vec![r#"{"token":"ok"}"#, "[DONE]"]);
    }
}
