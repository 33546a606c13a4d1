//! Per-credential rate limiter. Admission is a blocking wait,
//! not a fallible call: `wait` only ever blocks or is cancelled, it never
//! returns an error on its own.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub daily_max: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    pub suspend_cooldown: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(2),
            daily_max: 500,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(5 * 60),
            backoff_multiplier: 1.5,
            suspend_cooldown: Duration::from_secs(3600),
        }
    }
}

const SUSPEND_KEYWORDS: &[&str] = &[
    "suspended",
    "banned",
    "disabled",
    "account has been",
    "access denied",
    "rate limit exceeded",
    "too many requests",
    "quota exceeded",
];

#[derive(Debug)]
struct CredentialState {
    last_request: Option<Instant>,
    next_allowed: Option<Instant>,
    request_count: u64,
    fail_count: u32,
    daily_requests: u32,
    daily_reset_at: Instant,
    cooldown_end: Option<Instant>,
    suspended: bool,
}

impl CredentialState {
    fn new(now: Instant) -> Self {
        Self {
            last_request: None,
            next_allowed: None,
            request_count: 0,
            fail_count: 0,
            daily_requests: 0,
            daily_reset_at: now + next_utc_midnight_from(now),
            cooldown_end: None,
            suspended: false,
        }
    }

    fn roll_daily_counter_if_due(&mut self, now: Instant) {
        if now >= self.daily_reset_at {
            self.daily_requests = 0;
            self.daily_reset_at = now + Duration::from_secs(24 * 3600);
        }
    }
}

/// `Instant` has no wall-clock anchor, so the 24h daily window is modeled
/// as a rolling 24h duration rather than a literal UTC-midnight instant;
/// wall-clock truncation is the admin/reporting layer's concern, not the
/// limiter's hot path.
fn next_utc_midnight_from(_now: Instant) -> Duration {
    Duration::from_secs(24 * 3600)
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    states: RwLock<HashMap<String, Arc<Mutex<CredentialState>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    async fn state_for(&self, token_key: &str) -> Arc<Mutex<CredentialState>> {
        if let Some(existing) = self.states.read().await.get(token_key) {
            return existing.clone();
        }
        let mut guard = self.states.write().await;
        guard
            .entry(token_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CredentialState::new(Instant::now()))))
            .clone()
    }

    /// Blocks until admission is granted, honoring `cancel`. Returns
    /// `false` if cancelled before admission, `true` on admission.
    pub async fn wait(&self, token_key: &str, cancel: &CancellationToken) -> bool {
        let state = self.state_for(token_key).await;
        loop {
            let wake_at = {
                let mut guard = state.lock().await;
                let now = Instant::now();
                guard.roll_daily_counter_if_due(now);

                let daily_ready = guard.daily_requests < self.config.daily_max;
                let cooldown_ready = guard.cooldown_end.is_none_or(|c| c <= now);
                let pacing_ready = guard.next_allowed.is_none_or(|t| t <= now);

                if daily_ready && cooldown_ready && pacing_ready {
                    guard.last_request = Some(now);
                    guard.next_allowed = Some(
                        now + jittered_interval(self.config.min_interval, self.config.max_interval),
                    );
                    guard.request_count += 1;
                    guard.daily_requests += 1;
                    None
                } else {
                    Some(self.next_wake(&guard, now))
                }
            };

            let Some(wake_at) = wake_at else {
                return true;
            };

            tokio::select! {
                _ = sleep_until(wake_at) => continue,
                _ = cancel.cancelled() => return false,
            }
        }
    }

    fn next_wake(&self, guard: &CredentialState, now: Instant) -> Instant {
        let mut candidates = Vec::new();
        if guard.daily_requests >= self.config.daily_max {
            candidates.push(guard.daily_reset_at);
        }
        if let Some(cooldown_end) = guard.cooldown_end
            && cooldown_end > now
        {
            candidates.push(cooldown_end);
        }
        if let Some(next_allowed) = guard.next_allowed
            && next_allowed > now
        {
            candidates.push(next_allowed);
        }
        candidates.into_iter().min().unwrap_or(now)
    }

    pub async fn mark_failed(&self, token_key: &str) {
        let state = self.state_for(token_key).await;
        let mut guard = state.lock().await;
        guard.fail_count += 1;
        let backoff = exp_backoff(
            self.config.backoff_base,
            self.config.backoff_multiplier,
            guard.fail_count,
            self.config.backoff_max,
        );
        guard.cooldown_end = Some(Instant::now() + backoff);
    }

    pub async fn mark_success(&self, token_key: &str) {
        let state = self.state_for(token_key).await;
        let mut guard = state.lock().await;
        guard.fail_count = 0;
        guard.cooldown_end = None;
    }

    /// Matches `msg` against the fixed suspension-keyword set;
    /// on a match, suspends the credential for `suspend_cooldown`.
    pub async fn detect_suspended(&self, token_key: &str, msg: &str) -> bool {
        let lower = msg.to_ascii_lowercase();
        let matched = SUSPEND_KEYWORDS.iter().any(|kw| lower.contains(kw));
        if matched {
            let state = self.state_for(token_key).await;
            let mut guard = state.lock().await;
            guard.suspended = true;
            guard.cooldown_end = Some(Instant::now() + self.config.suspend_cooldown);
        }
        matched
    }

    pub async fn is_suspended(&self, token_key: &str) -> bool {
        let state = self.state_for(token_key).await;
        state.lock().await.suspended
    }

    pub async fn request_count(&self, token_key: &str) -> u64 {
        let state = self.state_for(token_key).await;
        state.lock().await.request_count
    }
}

/// Picks an interval in `[min, max]` then applies up to ±30% jitter,
/// clamped so the result never falls below `min` — each wait must still
/// return at least `min_interval` after the previous one, regardless of
/// jitter direction.
fn jittered_interval(min: Duration, max: Duration) -> Duration {
    let base = if max > min {
        let span = (max - min).as_millis() as u64;
        min + Duration::from_millis(rand::rng().random_range(0..=span))
    } else {
        min
    };
    let jitter_frac = rand::rng().random_range(-0.30_f64..=0.30_f64);
    let millis = (base.as_millis() as f64 * (1.0 + jitter_frac)).max(min.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

fn exp_backoff(base: Duration, multiplier: f64, fail_count: u32, cap: Duration) -> Duration {
    let exponent = (fail_count.saturating_sub(1)) as i32;
    let raw_secs = base.as_secs_f64() * multiplier.powi(exponent);
    let jitter_frac = rand::rng().random_range(-0.30_f64..=0.30_f64);
    let jittered_secs = (raw_secs * (1.0 + jitter_frac)).max(0.0);
    Duration::from_secs_f64(jittered_secs).min(cap)
}
