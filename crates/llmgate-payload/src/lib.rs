//! Payload Rules: default/override/filter rules applied to
//! the outgoing upstream payload, addressed by dotted JSON path. The
//! model selector reuses the same glob shape as the Alias Resolver's
//! exclusion patterns, via [`llmgate_registry::GlobPattern`].

use llmgate_registry::GlobPattern;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Default,
    DefaultRaw,
    Override,
    Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadRule {
    pub model_selector: String,
    pub path: String,
    #[serde(default)]
    pub value: Value,
    pub kind: RuleKind,
}

/// Applies every rule whose `model_selector` matches `model_id`, in
/// declaration order, to `payload`. `default`/`default-raw` only set a
/// leaf that is currently absent; `override` always sets it; `filter`
/// deletes it.
pub fn apply_rules(rules: &[PayloadRule], model_id: &str, payload: &mut Value) {
    for rule in rules {
        if !GlobPattern::parse(&rule.model_selector).matches(model_id) {
            continue;
        }
        apply_rule(rule, payload);
    }
}

fn apply_rule(rule: &PayloadRule, payload: &mut Value) {
    let segments: Vec<&str> = rule.path.split('.').collect();
    match rule.kind {
        RuleKind::Filter => delete_path(payload, &segments),
        RuleKind::Override => set_path(payload, &segments, rule.value.clone()),
        RuleKind::Default => {
            if get_path(payload, &segments).is_none() {
                set_path(payload, &segments, rule.value.clone());
            }
        }
        RuleKind::DefaultRaw => {
            if get_path(payload, &segments).is_none() {
                let parsed = match &rule.value {
                    Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| rule.value.clone()),
                    other => other.clone(),
                };
                set_path(payload, &segments, parsed);
            }
        }
    }
}

fn get_path<'a>(payload: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = payload;
    for segment in segments {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

/// Walks `segments`, creating an object at every missing intermediate
/// node — the leaf is created if missing.
fn set_path(payload: &mut Value, segments: &[&str], value: Value) {
    let Some((leaf, parents)) = segments.split_last() else { return };
    let mut current = payload;
    for segment in parents {
        if !matches!(current, Value::Object(_)) {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just coerced to object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !matches!(current, Value::Object(_)) {
        *current = Value::Object(Map::new());
    }
    current.as_object_mut().expect("just coerced to object").insert(leaf.to_string(), value);
}

fn delete_path(payload: &mut Value, segments: &[&str]) {
    let Some((leaf, parents)) = segments.split_last() else { return };
    let mut current = payload;
    for segment in parents {
        let Some(next) = current.as_object_mut().and_then(|m| m.get_mut(*segment)) else { return };
        current = next;
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(*leaf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(selector: &str, path: &str, value: Value, kind: RuleKind) -> PayloadRule {
        PayloadRule { model_selector: selector.to_string(), path: path.to_string(), value, kind }
    }

    #[test]
    fn default_rule_creates_missing_leaf_path() {
        let rules = vec![rule(
            "gemini-2.5-pro",
            "generationConfig.thinkingConfig.thinkingBudget",
            json!(8192),
            RuleKind::Default,
        )];
        let mut payload = json!({});
        apply_rules(&rules, "gemini-2.5-pro", &mut payload);
        assert_eq!(payload["generationConfig"]["thinkingConfig"]["thinkingBudget"], json!(8192));
    }

    #[test]
    fn default_rule_does_not_overwrite_an_existing_value() {
        let rules = vec![rule("*", "temperature", json!(0.5), RuleKind::Default)];
        let mut payload = json!({ "temperature": 0.9 });
        apply_rules(&rules, "any-model", &mut payload);
        assert_eq!(payload["temperature"], json!(0.9));
    }

    #[test]
    fn override_rule_always_replaces() {
        let rules = vec![rule("*", "temperature", json!(0.1), RuleKind::Override)];
        let mut payload = json!({ "temperature": 0.9 });
        apply_rules(&rules, "any-model", &mut payload);
        assert_eq!(payload["temperature"], json!(0.1));
    }

    #[test]
    fn filter_rule_deletes_the_leaf() {
        let rules = vec![rule("*", "unsafe_field", Value::Null, RuleKind::Filter)];
        let mut payload = json!({ "unsafe_field": "x", "keep": 1 });
        apply_rules(&rules, "any-model", &mut payload);
        assert!(payload.get("unsafe_field").is_none());
        assert_eq!(payload["keep"], json!(1));
    }

    #[test]
    fn default_raw_parses_a_json_string_value() {
        let rules =
            vec![rule("*", "tools", Value::String(r#"[{"name":"search"}]"#.to_string()), RuleKind::DefaultRaw)];
        let mut payload = json!({});
        apply_rules(&rules, "any-model", &mut payload);
        assert_eq!(payload["tools"], json!([{"name":"search"}]));
    }

    #[test]
    fn rule_only_applies_to_matching_model_selector() {
        let rules = vec![rule("claude-*", "x", json!(1), RuleKind::Override)];
        let mut payload = json!({});
        apply_rules(&rules, "gemini-2.5-pro", &mut payload);
        assert!(payload.get("x").is_none());
    }
}
