//! Streaming translation. `StreamIngester::ingest` is the incremental
//! step: it buffers raw upstream bytes and emits fully-formed canonical
//! events as soon as a complete line is available.
//!
//! UTF-8 safety: a newline byte (`0x0A`) never appears as a continuation
//! byte of a multi-byte UTF-8 code point, so splitting the raw byte
//! stream on `\n` can never divide a code point — the only thing that can
//! straddle a chunk boundary is an *incomplete* trailing line, which is
//! simply held in `buffer` until more bytes arrive. Tool-call argument
//! fragments are accumulated per index (OpenAI's wire shape) or per id
//! (Claude/Gemini) so a caller only ever sees well-formed deltas.

use std::collections::HashMap;

use llmgate_common::CallerFormat;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalStreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallDelta { id: String, name: Option<String>, arguments_fragment: String },
    Done,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
}

pub struct StreamIngester {
    upstream: CallerFormat,
    buffer: Vec<u8>,
    tool_calls_by_index: HashMap<u64, ToolCallAccumulator>,
}

impl StreamIngester {
    pub fn new(upstream: CallerFormat) -> Self {
        Self { upstream, buffer: Vec::new(), tool_calls_by_index: HashMap::new() }
    }

    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<CanonicalStreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(event) = self.process_line(line) {
                out.push(event);
            }
        }
        out
    }

    fn process_line(&mut self, line: &str) -> Option<CanonicalStreamEvent> {
        match self.upstream {
            CallerFormat::OpenAI => self.process_openai_line(line),
            CallerFormat::Claude => self.process_claude_line(line),
            CallerFormat::Gemini => self.process_gemini_line(line),
        }
    }

    fn process_openai_line(&mut self, line: &str) -> Option<CanonicalStreamEvent> {
        let data = line.strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            return Some(CanonicalStreamEvent::Done);
        }
        let value: Value = serde_json::from_str(data).ok()?;
        let delta = value.get("choices")?.as_array()?.first()?.get("delta")?;
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            return Some(CanonicalStreamEvent::TextDelta(text.to_string()));
        }
        if let Some(reasoning) = delta.get("reasoning").and_then(Value::as_str) {
            return Some(CanonicalStreamEvent::ThinkingDelta(reasoning.to_string()));
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            let call = calls.first()?;
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.tool_calls_by_index.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                entry.id = Some(id.to_string());
            }
            let function = call.get("function")?;
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name = Some(name.to_string());
            }
            let fragment = function.get("arguments").and_then(Value::as_str).unwrap_or("").to_string();
            return Some(CanonicalStreamEvent::ToolCallDelta {
                id: entry.id.clone().unwrap_or_default(),
                name: entry.name.clone(),
                arguments_fragment: fragment,
            });
        }
        None
    }

    fn process_claude_line(&mut self, line: &str) -> Option<CanonicalStreamEvent> {
        let data = line.strip_prefix("data:")?.trim();
        let value: Value = serde_json::from_str(data).ok()?;
        match value.get("type").and_then(Value::as_str)? {
            "content_block_delta" => {
                let delta = value.get("delta")?;
                match delta.get("type").and_then(Value::as_str)? {
                    "text_delta" => Some(CanonicalStreamEvent::TextDelta(
                        delta.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
                    )),
                    "thinking_delta" => Some(CanonicalStreamEvent::ThinkingDelta(
                        delta.get("thinking").and_then(Value::as_str).unwrap_or("").to_string(),
                    )),
                    "input_json_delta" => {
                        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let entry = self.tool_calls_by_index.entry(index).or_default();
                        Some(CanonicalStreamEvent::ToolCallDelta {
                            id: entry.id.clone().unwrap_or_default(),
                            name: entry.name.clone(),
                            arguments_fragment: delta.get("partial_json").and_then(Value::as_str).unwrap_or("").to_string(),
                        })
                    }
                    _ => None,
                }
            }
            "content_block_start" => {
                let block = value.get("content_block")?;
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
                    let entry = self.tool_calls_by_index.entry(index).or_default();
                    entry.id = block.get("id").and_then(Value::as_str).map(str::to_string);
                    entry.name = block.get("name").and_then(Value::as_str).map(str::to_string);
                }
                None
            }
            "message_stop" => Some(CanonicalStreamEvent::Done),
            _ => None,
        }
    }

    fn process_gemini_line(&mut self, line: &str) -> Option<CanonicalStreamEvent> {
        let trimmed = line.trim_start_matches(',').trim_start_matches('[').trim_end_matches(']').trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        let part = value.get("candidates")?.as_array()?.first()?.get("content")?.get("parts")?.as_array()?.first()?;
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            return Some(if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                CanonicalStreamEvent::ThinkingDelta(text.to_string())
            } else {
                CanonicalStreamEvent::TextDelta(text.to_string())
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_text_delta_is_ingested_line_by_line() {
        let mut ingester = StreamIngester::new(CallerFormat::OpenAI);
        let events = ingester.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n");
        assert_eq!(events, vec![CanonicalStreamEvent::TextDelta("hel".to_string())]);
    }

    #[test]
    fn openai_done_sentinel_is_recognized() {
        let mut ingester = StreamIngester::new(CallerFormat::OpenAI);
        let events = ingester.ingest(b"data: [DONE]\n");
        assert_eq!(events, vec![CanonicalStreamEvent::Done]);
    }

    #[test]
    fn a_chunk_boundary_mid_utf8_character_is_held_until_complete() {
        let mut ingester = StreamIngester::new(CallerFormat::OpenAI);
        let full = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{00e9}\"}}]}\n".as_bytes().to_vec();
        let split_at = full.len() - 1; // splits inside the 2-byte 'é' encoding
        let first = ingester.ingest(&full[..split_at]);
        assert!(first.is_empty());
        let second = ingester.ingest(&full[split_at..]);
        assert_eq!(second, vec![CanonicalStreamEvent::TextDelta("caf\u{e9}".to_string())]);
    }

    #[test]
    fn claude_message_stop_ends_the_stream() {
        let mut ingester = StreamIngester::new(CallerFormat::Claude);
        let events = ingester.ingest(b"data: {\"type\":\"message_stop\"}\n");
        assert_eq!(events, vec![CanonicalStreamEvent::Done]);
    }

    #[test]
    fn claude_tool_use_fragments_accumulate_a_stable_id() {
        let mut ingester = StreamIngester::new(CallerFormat::Claude);
        let _ = ingester.ingest(
            b"data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"abc\",\"name\":\"search\"}}\n",
        );
        let events = ingester.ingest(
            b"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"q\\\":\"}}\n",
        );
        assert_eq!(
            events,
            vec![CanonicalStreamEvent::ToolCallDelta {
                id: "abc".to_string(),
                name: Some("search".to_string()),
                arguments_fragment: "{\"q\":".to_string(),
            }]
        );
    }

    #[test]
    fn gemini_json_line_yields_a_text_delta() {
        let mut ingester = StreamIngester::new(CallerFormat::Gemini);
        let events = ingester.ingest(
            b"{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n",
        );
        assert_eq!(events, vec![CanonicalStreamEvent::TextDelta("hi".to_string())]);
    }
}
