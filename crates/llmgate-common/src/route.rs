use serde_json::Value;

use crate::proto::{CallerFormat, Op};

/// One of the four thinking-suffix shapes a model name's trailing
/// `(<payload>)` annotation can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingSuffix {
    Budget(u64),
    Auto,
    Level(ThinkingLevel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
    Ultra,
}

impl ThinkingLevel {
    fn as_str(self) -> &'static str {
        match self {
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Ultra => "ultra",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "ultra" => Some(ThinkingLevel::Ultra),
            _ => None,
        }
    }
}

impl ThinkingSuffix {
    fn parse(payload: &str) -> Option<Self> {
        if payload == "auto" {
            return Some(ThinkingSuffix::Auto);
        }
        if let Some(level) = ThinkingLevel::parse(payload) {
            return Some(ThinkingSuffix::Level(level));
        }
        payload.parse::<u64>().ok().map(ThinkingSuffix::Budget)
    }

    fn render(&self) -> String {
        match self {
            ThinkingSuffix::Budget(n) => n.to_string(),
            ThinkingSuffix::Auto => "auto".to_string(),
            ThinkingSuffix::Level(level) => level.as_str().to_string(),
        }
    }
}

/// Parse `requested_model` into `(base, suffix)`. A trailing `(<payload>)`
/// that doesn't match a recognized thinking-suffix shape is left
/// untouched — the whole string is the base model with no suffix, not an
/// error: an upstream might legitimately advertise a model id containing
/// parens.
pub fn parse_thinking_suffix(requested_model: &str) -> (String, Option<ThinkingSuffix>) {
    let Some(open) = requested_model.rfind('(') else {
        return (requested_model.to_string(), None);
    };
    if !requested_model.ends_with(')') || open + 1 >= requested_model.len() - 1 {
        return (requested_model.to_string(), None);
    }
    let payload = &requested_model[open + 1..requested_model.len() - 1];
    let Some(suffix) = ThinkingSuffix::parse(payload) else {
        return (requested_model.to_string(), None);
    };
    let base = requested_model[..open].to_string();
    if base.is_empty() {
        return (requested_model.to_string(), None);
    }
    (base, Some(suffix))
}

/// Inverse of [`parse_thinking_suffix`]: renders a base model name and an
/// optional suffix back into the wire form.
pub fn render_thinking_suffix(base: &str, suffix: Option<ThinkingSuffix>) -> String {
    match suffix {
        None => base.to_string(),
        Some(s) => format!("{base}({})", s.render()),
    }
}

/// Immutable per-incoming-call value, produced once at parse time and
/// never mutated afterward.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub caller_format: CallerFormat,
    pub requested_model: String,
    pub op: Op,
    pub streaming: bool,
    pub payload: Value,
}

/// Authenticated caller, produced by the Access Manager chain.
#[derive(Debug, Clone)]
pub struct Principal {
    pub api_key_id: String,
    pub access_level: String,
    pub metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_no_suffix() {
        assert_eq!(parse_thinking_suffix("gemini-2.5-pro"), ("gemini-2.5-pro".to_string(), None));
    }

    #[test]
    fn parse_budget_suffix() {
        let (base, suffix) = parse_thinking_suffix("gemini-2.5-pro(8192)");
        assert_eq!(base, "gemini-2.5-pro");
        assert_eq!(suffix, Some(ThinkingSuffix::Budget(8192)));
    }

    #[test]
    fn parse_auto_and_level_suffixes() {
        assert_eq!(
            parse_thinking_suffix("claude-opus-4-5(auto)").1,
            Some(ThinkingSuffix::Auto)
        );
        assert_eq!(
            parse_thinking_suffix("claude-opus-4-5(high)").1,
            Some(ThinkingSuffix::Level(ThinkingLevel::High))
        );
    }

    #[test]
    fn unrecognized_payload_is_not_a_suffix() {
        // Round-trippable per spec design note, but "xyz" is not a legal
        // payload, so the whole string stays the base model id.
        let (base, suffix) = parse_thinking_suffix("weird-model(xyz)");
        assert_eq!(base, "weird-model(xyz)");
        assert_eq!(suffix, None);
    }

    #[test]
    fn round_trip_is_idempotent() {
        let cases: &[(&str, Option<ThinkingSuffix>)] = &[
            ("gemini-2.5-pro", None),
            ("gemini-2.5-pro", Some(ThinkingSuffix::Budget(4096))),
            ("claude-opus-4-5", Some(ThinkingSuffix::Auto)),
            ("claude-opus-4-5", Some(ThinkingSuffix::Level(ThinkingLevel::Ultra))),
        ];
        for (base, suffix) in cases {
            let rendered = render_thinking_suffix(base, *suffix);
            assert_eq!(parse_thinking_suffix(&rendered), (base.to_string(), *suffix));
        }
    }
}
