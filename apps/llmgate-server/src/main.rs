use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use llmgate_auth::{AuthStore, IdcFlow, KiroSocialFlow, OAuthRefresher, RefreshFlow, RefresherConfig};
use llmgate_common::{GatewayConfig, GatewayConfigPatch, RoutingStrategy};
use llmgate_conductor::{AccessManager, Conductor, MemoryApiKeyProvider, ReqwestTransport};
use llmgate_ratelimit::{RateLimiter, RateLimiterConfig};
use llmgate_registry::{CooldownTracker, InFlightTracker, ModelRegistry, ResolverConfig, Selector, SelectionPolicy};
use tokio::sync::Notify;

mod auth_middleware;
mod catalog;
mod inbound;
mod management;
mod state;

use state::{AppState, SharedState};

/// Startup CLI. clap resolves each field from the flag or its `env`
/// fallback before we ever look at a config file on disk.
#[derive(Debug, Clone, Parser)]
#[command(name = "llmgate-server", version, about = "Multi-provider LLM API gateway")]
struct CliArgs {
    #[arg(long, env = "LLMGATE_HOST")]
    host: Option<String>,

    #[arg(long, env = "LLMGATE_PORT")]
    port: Option<u16>,

    #[arg(long, env = "LLMGATE_DATA_DIR")]
    data_dir: Option<String>,

    #[arg(long, env = "LLMGATE_ROUTING_STRATEGY")]
    routing_strategy: Option<String>,

    /// Bootstrap API key, printed once if no `keys.json` exists yet.
    #[arg(long, env = "LLMGATE_API_KEY")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            std::process::exit(1);
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(|| "./data".to_string());
    tokio::fs::create_dir_all(&data_dir).await.context("create data dir")?;

    let config = load_config(&args, &data_dir).await?;

    let auth_store = Arc::new(AuthStore::new(&config.data_dir));
    let clients = auth_store.load_all().await.context("load credentials")?;
    if clients.is_empty() {
        tracing::warn!(data_dir = %config.data_dir, "no credentials found; gateway will report no_capacity on every request until one is added");
    }

    let registry = Arc::new(ModelRegistry::new());
    let overrides = catalog::load_overrides(std::path::Path::new(&config.data_dir)).await;
    for client in &clients {
        let models = catalog::catalog_for(&client.provider_tag, &overrides);
        registry.register(&client.client_id, &client.provider_tag, &models).await;
    }

    let cooldown = Arc::new(CooldownTracker::new());
    cooldown.clone().spawn_recovery_task(Arc::new(Notify::new()));

    let selection_policy = match config.routing_strategy {
        RoutingStrategy::RoundRobin => SelectionPolicy::RoundRobin,
        RoutingStrategy::FillFirst => SelectionPolicy::FillFirst,
    };
    let selector = Arc::new(Selector::new(selection_policy));
    let in_flight = Arc::new(InFlightTracker::new());

    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        min_interval: std::time::Duration::from_millis(config.rate_limit_min_interval_ms),
        max_interval: std::time::Duration::from_millis(config.rate_limit_max_interval_ms),
        daily_max: config.rate_limit_daily_max,
        backoff_base: std::time::Duration::from_secs(config.rate_limit_backoff_base_secs),
        backoff_max: std::time::Duration::from_secs(config.rate_limit_backoff_max_secs),
        backoff_multiplier: config.rate_limit_backoff_multiplier,
        suspend_cooldown: std::time::Duration::from_secs(config.suspend_cooldown_secs),
    }));

    let http = reqwest::Client::builder().build().context("build reqwest client")?;
    let flows: Vec<Arc<dyn RefreshFlow>> = vec![
        Arc::new(KiroSocialFlow { http: http.clone(), endpoint: "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken".to_string() }),
        Arc::new(IdcFlow {
            http: http.clone(),
            token_endpoint: "https://oidc.us-east-1.amazonaws.com/token".to_string(),
            client_id: std::env::var("LLMGATE_IDC_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("LLMGATE_IDC_CLIENT_SECRET").unwrap_or_default(),
        }),
    ];
    let refresher = Arc::new(OAuthRefresher::new(auth_store.clone(), flows, RefresherConfig::default()));
    refresher.clone().spawn_loop();

    let conductor = Arc::new(Conductor {
        registry,
        cooldown,
        selector,
        resolver_config: ResolverConfig::default(),
        auth_store,
        refresher,
        rate_limiter,
        in_flight,
        payload_rules: Vec::new(),
        transport: ReqwestTransport::new(http),
        config: config.clone(),
    });

    // Bootstrap a single API key provider; management endpoints share the
    // same chain.
    let memory_keys = MemoryApiKeyProvider::new();
    let api_key = args.api_key.clone().unwrap_or_else(|| {
        let generated = uuid::Uuid::new_v4().to_string();
        eprintln!("generated api key: {generated}");
        generated
    });
    memory_keys.insert(api_key, "default");
    let access = Arc::new(AccessManager::new(vec![Box::new(memory_keys)]));

    let app_state: SharedState = Arc::new(AppState { conductor, access });

    let app = axum::Router::new()
        .merge(inbound::router())
        .merge(management::router())
        .route_layer(axum::middleware::from_fn_with_state(app_state.clone(), auth_middleware::require_principal))
        .with_state(app_state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await.context("bind listener")?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}

/// Merges CLI > ENV (already folded in by clap) > on-disk `config.json`.
async fn load_config(args: &CliArgs, data_dir: &str) -> anyhow::Result<GatewayConfig> {
    let config_path = std::path::Path::new(data_dir).join("config.json");
    let mut patch = match tokio::fs::read(&config_path).await {
        Ok(bytes) => serde_json::from_slice::<GatewayConfigPatch>(&bytes).context("parse config.json")?,
        Err(_) => GatewayConfigPatch::default(),
    };

    let routing_strategy = match args.routing_strategy.as_deref() {
        Some("round-robin") => Some(RoutingStrategy::RoundRobin),
        Some("fill-first") => Some(RoutingStrategy::FillFirst),
        Some(other) => anyhow::bail!("invalid routing strategy: {other}"),
        None => None,
    };

    patch.overlay(GatewayConfigPatch {
        host: args.host.clone(),
        port: args.port,
        data_dir: Some(data_dir.to_string()),
        routing_strategy,
        ..Default::default()
    });

    Ok(patch.apply_to(GatewayConfig::default()))
}
