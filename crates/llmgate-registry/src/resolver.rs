//! Alias & Mapping Resolver: the five-stage rewrite pipeline
//! applied to a requested model name, implemented as an ordered sequence
//! of pure functions rather than a side-effecting object — every stage is
//! a deterministic rewrite of `(base, suffix)`.

use llmgate_common::{GatewayError, ThinkingSuffix, parse_thinking_suffix};

use crate::cooldown::CooldownTracker;
use crate::registry::ModelRegistry;

#[derive(Debug, Clone)]
pub struct AmpMapping {
    pub from: String,
    pub to: String,
    pub regex: bool,
}

#[derive(Debug, Clone)]
pub struct OAuthAlias {
    pub name: String,
    pub alias: String,
    pub fork: bool,
}

/// One glob pattern shape shared with Payload Rules' model selector:
/// exact, `prefix*`, `*suffix`, `*infix*`.
#[derive(Debug, Clone)]
pub enum GlobPattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Infix(String),
}

impl GlobPattern {
    pub fn parse(pattern: &str) -> Self {
        let starts = pattern.starts_with('*');
        let ends = pattern.ends_with('*');
        match (starts, ends) {
            (true, true) if pattern.len() >= 2 => {
                GlobPattern::Infix(pattern[1..pattern.len() - 1].to_string())
            }
            (true, _) => GlobPattern::Suffix(pattern[1..].to_string()),
            (_, true) => GlobPattern::Prefix(pattern[..pattern.len() - 1].to_string()),
            _ => GlobPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, model_id: &str) -> bool {
        match self {
            GlobPattern::Exact(s) => model_id == s,
            GlobPattern::Prefix(s) => model_id.starts_with(s.as_str()),
            GlobPattern::Suffix(s) => model_id.ends_with(s.as_str()),
            GlobPattern::Infix(s) => s.is_empty() || model_id.contains(s.as_str()),
        }
    }
}

/// Ordered preference list for "auto" resolution.
pub fn default_auto_preference() -> Vec<String> {
    vec![
        "gemini-2.5-pro".to_string(),
        "claude-sonnet-4-5".to_string(),
        "gpt-4o".to_string(),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub amp_mappings: Vec<AmpMapping>,
    pub oauth_aliases: Vec<OAuthAlias>,
    pub exclusions: Vec<String>,
    pub auto_preference: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub canonical_base: String,
    pub suffix: Option<llmgate_common::ThinkingSuffix>,
}

/// Runs the five-stage pipeline. `registry`/`cooldown` are consulted only
/// where needed: stage 2 needs `to` to resolve to >=1 provider, stage 5
/// needs the Ready state of the preference list.
pub async fn resolve(
    requested_model: &str,
    config: &ResolverConfig,
    registry: &ModelRegistry,
    cooldown: &CooldownTracker,
) -> Result<ResolvedModel, GatewayError> {
    let (mut base, mut suffix) = parse_thinking_suffix(requested_model);

    base = apply_amp_mapping(&base, &mut suffix, config, registry).await;
    base = apply_oauth_alias(&base, config);

    if is_excluded(&base, config) {
        return Err(GatewayError::CallerError(format!("model {base} is excluded")));
    }

    if base == "auto" {
        base = resolve_auto(config, registry, cooldown).await?;
    }

    Ok(ResolvedModel { canonical_base: base, suffix })
}

async fn apply_amp_mapping(
    base: &str,
    suffix: &mut Option<ThinkingSuffix>,
    config: &ResolverConfig,
    registry: &ModelRegistry,
) -> String {
    // Exact matches precede regex so a literal override always wins.
    for mapping in config.amp_mappings.iter().filter(|m| !m.regex) {
        if mapping.from == base && registry.has_any_provider(&mapping.to).await {
            return rewrite_with_mapping_suffix(&mapping.to, suffix);
        }
    }
    for mapping in config.amp_mappings.iter().filter(|m| m.regex) {
        let Ok(re) = regex::Regex::new(&mapping.from) else { continue };
        if re.is_match(base) && registry.has_any_provider(&mapping.to).await {
            return rewrite_with_mapping_suffix(&mapping.to, suffix);
        }
    }
    base.to_string()
}

fn rewrite_with_mapping_suffix(to: &str, suffix: &mut Option<ThinkingSuffix>) -> String {
    let (to_base, to_suffix) = parse_thinking_suffix(to);
    if to_suffix.is_some() {
        *suffix = to_suffix;
    }
    to_base
}

fn apply_oauth_alias(base: &str, config: &ResolverConfig) -> String {
    for alias in &config.oauth_aliases {
        if alias.alias == base {
            return alias.name.clone();
        }
    }
    base.to_string()
}

fn is_excluded(base: &str, config: &ResolverConfig) -> bool {
    config.exclusions.iter().any(|pattern| GlobPattern::parse(pattern).matches(base))
}

async fn resolve_auto(
    config: &ResolverConfig,
    registry: &ModelRegistry,
    cooldown: &CooldownTracker,
) -> Result<String, GatewayError> {
    let preference =
        if config.auto_preference.is_empty() { default_auto_preference() } else { config.auto_preference.clone() };
    for model_id in &preference {
        let candidates = registry.candidates(model_id).await;
        for client_id in &candidates {
            if cooldown.is_ready(client_id, model_id).await {
                return Ok(model_id.clone());
            }
        }
    }
    Err(GatewayError::NoCapacity { model: "auto".to_string(), retry_after_secs: None })
}
