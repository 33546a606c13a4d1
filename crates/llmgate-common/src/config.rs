use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    FillFirst,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::RoundRobin
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub routing_strategy: RoutingStrategy,
    pub quota_switch_project: bool,
    pub quota_switch_preview_model: bool,
    pub request_retry: u32,
    pub max_retry_interval_secs: u64,
    pub rate_limit_min_interval_ms: u64,
    pub rate_limit_max_interval_ms: u64,
    pub rate_limit_daily_max: u32,
    pub rate_limit_backoff_base_secs: u64,
    pub rate_limit_backoff_max_secs: u64,
    pub rate_limit_backoff_multiplier: f64,
    pub suspend_cooldown_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: "./data".to_string(),
            routing_strategy: RoutingStrategy::RoundRobin,
            quota_switch_project: true,
            quota_switch_preview_model: false,
            request_retry: 3,
            max_retry_interval_secs: 30,
            rate_limit_min_interval_ms: 1000,
            rate_limit_max_interval_ms: 2000,
            rate_limit_daily_max: 500,
            rate_limit_backoff_base_secs: 30,
            rate_limit_backoff_max_secs: 300,
            rate_limit_backoff_multiplier: 1.5,
            suspend_cooldown_secs: 3600,
        }
    }
}

/// Optional overlay used while merging CLI/ENV/file layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
    pub routing_strategy: Option<RoutingStrategy>,
    pub quota_switch_project: Option<bool>,
    pub quota_switch_preview_model: Option<bool>,
    pub request_retry: Option<u32>,
    pub max_retry_interval_secs: Option<u64>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.routing_strategy.is_some() {
            self.routing_strategy = other.routing_strategy;
        }
        if other.quota_switch_project.is_some() {
            self.quota_switch_project = other.quota_switch_project;
        }
        if other.quota_switch_preview_model.is_some() {
            self.quota_switch_preview_model = other.quota_switch_preview_model;
        }
        if other.request_retry.is_some() {
            self.request_retry = other.request_retry;
        }
        if other.max_retry_interval_secs.is_some() {
            self.max_retry_interval_secs = other.max_retry_interval_secs;
        }
    }

    pub fn apply_to(self, base: GatewayConfig) -> GatewayConfig {
        GatewayConfig {
            host: self.host.unwrap_or(base.host),
            port: self.port.unwrap_or(base.port),
            data_dir: self.data_dir.unwrap_or(base.data_dir),
            routing_strategy: self.routing_strategy.unwrap_or(base.routing_strategy),
            quota_switch_project: self.quota_switch_project.unwrap_or(base.quota_switch_project),
            quota_switch_preview_model: self
                .quota_switch_preview_model
                .unwrap_or(base.quota_switch_preview_model),
            request_retry: self.request_retry.unwrap_or(base.request_retry),
            max_retry_interval_secs: self
                .max_retry_interval_secs
                .unwrap_or(base.max_retry_interval_secs),
            ..base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlays_only_set_fields() {
        let mut patch = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            ..Default::default()
        };
        patch.overlay(GatewayConfigPatch {
            port: Some(9090),
            ..Default::default()
        });
        assert_eq!(patch.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(patch.port, Some(9090));
    }

    #[test]
    fn apply_to_keeps_defaults_for_unset_fields() {
        let patch = GatewayConfigPatch {
            port: Some(9090),
            ..Default::default()
        };
        let cfg = patch.apply_to(GatewayConfig::default());
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.host, "0.0.0.0");
    }
}
