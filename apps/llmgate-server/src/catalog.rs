//! Per-provider model catalogs, seeded into the registry at startup. A
//! deployment can override the defaults by dropping a `providers.json`
//! file (`{ "<provider_tag>": [ModelInfo, ...] }`) into the data
//! directory; anything not named there falls back to the built-in set.

use std::collections::HashMap;
use std::path::Path;

use llmgate_registry::{ModelInfo, ThinkingSupport};

pub fn builtin_catalog(provider_tag: &str) -> Vec<ModelInfo> {
    match provider_tag {
        "anthropic" | "claudecode" | "kiro" => vec![
            model("claude-opus-4-5", "Claude Opus 4.5", provider_tag, 200_000, 64_000, ThinkingSupport::Auto),
            model("claude-sonnet-4-5", "Claude Sonnet 4.5", provider_tag, 200_000, 64_000, ThinkingSupport::Auto),
            model("claude-haiku-4-5", "Claude Haiku 4.5", provider_tag, 200_000, 32_000, ThinkingSupport::FixedBudget),
        ],
        "gemini" | "geminicli" | "vertex" | "antigravity" => vec![
            model("gemini-2.5-pro", "Gemini 2.5 Pro", provider_tag, 1_048_576, 65_536, ThinkingSupport::Levels),
            model("gemini-2.5-flash", "Gemini 2.5 Flash", provider_tag, 1_048_576, 65_536, ThinkingSupport::Levels),
        ],
        "aws-idc" | "aws-builder-id" => vec![
            model("claude-sonnet-4-5", "Claude Sonnet 4.5 (Amazon Q)", provider_tag, 200_000, 64_000, ThinkingSupport::Auto)
        ],
        _ => vec![
            model("gpt-5", "GPT-5", provider_tag, 400_000, 128_000, ThinkingSupport::None),
            model("gpt-5-mini", "GPT-5 Mini", provider_tag, 400_000, 128_000, ThinkingSupport::None),
        ],
    }
}

fn model(id: &str, display: &str, provider_tag: &str, context: u64, max_out: u64, thinking: ThinkingSupport) -> ModelInfo {
    ModelInfo {
        model_id: id.to_string(),
        display_name: display.to_string(),
        provider_family: provider_tag.to_string(),
        context_length: context,
        max_output_tokens: max_out,
        supported_methods: vec!["generateContent".to_string(), "streamGenerateContent".to_string()],
        thinking_support: thinking,
    }
}

/// Loads `<data_dir>/providers.json` if present; its entries take
/// precedence over [`builtin_catalog`] for the provider tags it names.
pub async fn load_overrides(data_dir: &Path) -> HashMap<String, Vec<ModelInfo>> {
    let path = data_dir.join("providers.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

pub fn catalog_for(provider_tag: &str, overrides: &HashMap<String, Vec<ModelInfo>>) -> Vec<ModelInfo> {
    overrides.get(provider_tag).cloned().unwrap_or_else(|| builtin_catalog(provider_tag))
}
