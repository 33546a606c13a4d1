//! Selector: picks one client from a candidate list.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::cooldown::CooldownTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    RoundRobin,
    FillFirst,
    Priority,
}

#[derive(Debug, Clone)]
pub struct CandidateInfo {
    pub client_id: String,
    pub priority: i32,
}

/// In-flight call counts per client, consulted by the fill-first policy.
/// A guard returned by `begin` decrements on drop so a panicking or
/// cancelled request never leaks a count.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    counts: Mutex<HashMap<String, usize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, client_id: &str) -> usize {
        self.counts.lock().await.get(client_id).copied().unwrap_or(0)
    }

    pub async fn begin(self: &Arc<Self>, client_id: &str) -> InFlightGuard {
        *self.counts.lock().await.entry(client_id.to_string()).or_insert(0) += 1;
        InFlightGuard { tracker: self.clone(), client_id: client_id.to_string() }
    }
}

pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    client_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let tracker = self.tracker.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            let mut guard = tracker.counts.lock().await;
            if let Some(count) = guard.get_mut(&client_id) {
                *count = count.saturating_sub(1);
            }
        });
    }
}

pub struct Selector {
    policy: SelectionPolicy,
    round_robin_counter: AtomicUsize,
}

impl Selector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy, round_robin_counter: AtomicUsize::new(0) }
    }

    /// Filters `candidates` to those in `Ready` state, then applies the
    /// configured policy. Never acquires a lock on the chosen client — the
    /// Rate Limiter is the actual admission gate.
    pub async fn select(
        &self,
        model_id: &str,
        candidates: &[CandidateInfo],
        cooldown: &CooldownTracker,
        in_flight: &InFlightTracker,
    ) -> Option<String> {
        let mut ready = Vec::with_capacity(candidates.len());
        for c in candidates {
            if cooldown.is_ready(&c.client_id, model_id).await {
                ready.push(c.clone());
            }
        }
        if ready.is_empty() {
            return None;
        }

        match self.policy {
            SelectionPolicy::RoundRobin => Some(self.round_robin(&ready)),
            SelectionPolicy::FillFirst => Some(self.fill_first(&ready, in_flight).await),
            SelectionPolicy::Priority => {
                let top_priority = ready.iter().map(|c| c.priority).max().unwrap();
                let top: Vec<CandidateInfo> =
                    ready.into_iter().filter(|c| c.priority == top_priority).collect();
                Some(self.round_robin(&top))
            }
        }
    }

    fn round_robin(&self, ready: &[CandidateInfo]) -> String {
        let mut sorted = ready.to_vec();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % sorted.len();
        sorted[idx].client_id.clone()
    }

    async fn fill_first(&self, ready: &[CandidateInfo], in_flight: &InFlightTracker) -> String {
        let mut best: Option<(usize, &CandidateInfo)> = None;
        for c in ready {
            let count = in_flight.count(&c.client_id).await;
            if count == 0 {
                return c.client_id.clone();
            }
            if best.is_none_or(|(best_count, _)| count < best_count) {
                best = Some((count, c));
            }
        }
        best.map(|(_, c)| c.client_id.clone()).expect("ready is non-empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(pairs: &[(&str, i32)]) -> Vec<CandidateInfo> {
        pairs.iter().map(|(id, p)| CandidateInfo { client_id: id.to_string(), priority: *p }).collect()
    }

    #[tokio::test]
    async fn round_robin_never_returns_a_non_ready_client() {
        let cooldown = CooldownTracker::new();
        cooldown.suspend("c1", "m1", "banned").await;
        let selector = Selector::new(SelectionPolicy::RoundRobin);
        let in_flight = InFlightTracker::new();
        let chosen = selector.select("m1", &candidates(&[("c1", 0), ("c2", 0)]), &cooldown, &in_flight).await;
        assert_eq!(chosen, Some("c2".to_string()));
    }

    #[tokio::test]
    async fn round_robin_prefers_higher_priority() {
        let cooldown = CooldownTracker::new();
        let selector = Selector::new(SelectionPolicy::RoundRobin);
        let in_flight = InFlightTracker::new();
        let chosen = selector
            .select("m1", &candidates(&[("low", 1), ("high", 10)]), &cooldown, &in_flight)
            .await;
        assert_eq!(chosen, Some("high".to_string()));
    }

    #[tokio::test]
    async fn fill_first_prefers_idle_client() {
        let cooldown = CooldownTracker::new();
        let selector = Selector::new(SelectionPolicy::FillFirst);
        let in_flight = Arc::new(InFlightTracker::new());
        let _guard = in_flight.begin("busy").await;
        let chosen = selector
            .select("m1", &candidates(&[("busy", 0), ("idle", 0)]), &cooldown, &in_flight)
            .await;
        assert_eq!(chosen, Some("idle".to_string()));
    }

    #[tokio::test]
    async fn no_ready_candidates_returns_none() {
        let cooldown = CooldownTracker::new();
        cooldown.suspend("c1", "m1", "banned").await;
        let selector = Selector::new(SelectionPolicy::RoundRobin);
        let in_flight = InFlightTracker::new();
        let chosen = selector.select("m1", &candidates(&[("c1", 0)]), &cooldown, &in_flight).await;
        assert_eq!(chosen, None);
    }
}
