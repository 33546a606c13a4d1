//! Per-(client, model) cooldown state.
//!
//! Reads always compare against wall-clock `Instant::now()` — the stored
//! deadline is the source of truth, not any cached derived state. The
//! background recovery task below is purely an optimization that turns a
//! passive poll into a proactive wake-up; correctness never depends on it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tokio::time::{Duration, Instant, sleep_until};

pub const QUOTA_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownState {
    Ready,
    Quota { expires_at: Instant },
    Suspended { reason: String },
}

#[derive(Debug, Default, Clone)]
struct Entry {
    quota_hit: Option<Instant>,
    suspended_reason: Option<String>,
}

/// What a registry availability computation needs about one (client, model)
/// pair, split out so callers don't re-derive the quota-vs-suspended split.
#[derive(Debug, Clone)]
pub struct Classification {
    pub quota_active: bool,
    pub suspended_reason: Option<String>,
}

impl Classification {
    pub fn is_quota_reason_suspended(&self) -> bool {
        self.suspended_reason.as_deref() == Some("quota")
    }

    pub fn is_other_suspended(&self) -> bool {
        matches!(&self.suspended_reason, Some(r) if r != "quota")
    }
}

#[derive(Debug)]
pub struct CooldownTracker {
    entries: RwLock<HashMap<(String, String), Entry>>,
    heap: tokio::sync::Mutex<BinaryHeap<Reverse<(Instant, String, String)>>>,
    notify: Notify,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heap: tokio::sync::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    pub async fn mark_quota(&self, client: &str, model: &str) {
        let now = Instant::now();
        {
            let mut guard = self.entries.write().await;
            guard.entry((client.to_string(), model.to_string())).or_default().quota_hit = Some(now);
        }
        self.heap
            .lock()
            .await
            .push(Reverse((now + QUOTA_COOLDOWN, client.to_string(), model.to_string())));
        self.notify.notify_one();
    }

    pub async fn clear_quota(&self, client: &str, model: &str) {
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get_mut(&(client.to_string(), model.to_string())) {
            entry.quota_hit = None;
        }
    }

    pub async fn suspend(&self, client: &str, model: &str, reason: impl Into<String>) {
        let mut guard = self.entries.write().await;
        guard
            .entry((client.to_string(), model.to_string()))
            .or_default()
            .suspended_reason = Some(reason.into());
    }

    pub async fn resume(&self, client: &str, model: &str) {
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get_mut(&(client.to_string(), model.to_string())) {
            entry.suspended_reason = None;
        }
    }

    pub async fn state(&self, client: &str, model: &str) -> CooldownState {
        let guard = self.entries.read().await;
        let Some(entry) = guard.get(&(client.to_string(), model.to_string())) else {
            return CooldownState::Ready;
        };
        if let Some(reason) = &entry.suspended_reason {
            return CooldownState::Suspended { reason: reason.clone() };
        }
        if let Some(hit) = entry.quota_hit {
            let expires_at = hit + QUOTA_COOLDOWN;
            if Instant::now() < expires_at {
                return CooldownState::Quota { expires_at };
            }
        }
        CooldownState::Ready
    }

    pub async fn is_ready(&self, client: &str, model: &str) -> bool {
        matches!(self.state(client, model).await, CooldownState::Ready)
    }

    pub async fn classify(&self, client: &str, model: &str) -> Classification {
        let guard = self.entries.read().await;
        let Some(entry) = guard.get(&(client.to_string(), model.to_string())) else {
            return Classification { quota_active: false, suspended_reason: None };
        };
        let quota_active = entry
            .quota_hit
            .is_some_and(|hit| Instant::now() < hit + QUOTA_COOLDOWN);
        Classification { quota_active, suspended_reason: entry.suspended_reason.clone() }
    }

    /// Drops every cooldown entry for `client`, mirroring `unregister`'s
    /// invariant that a forgotten client leaves no residue behind.
    pub async fn forget_client(&self, client: &str) {
        let mut guard = self.entries.write().await;
        guard.retain(|(c, _), _| c != client);
    }

    /// Spawns the background recovery task. It never mutates cooldown
    /// correctness (reads always re-check wall clock); it only notifies
    /// `on_expiry` promptly instead of leaving expiry to the next poll.
    pub fn spawn_recovery_task(self: Arc<Self>, on_expiry: Arc<Notify>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, c, m))| (*t, c.clone(), m.clone()))
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _, _)) => sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, c, m))) = heap.peek().cloned() {
                        if t > now {
                            break;
                        }
                        heap.pop();
                        due.push((c, m));
                    }
                }
                if !due.is_empty() {
                    on_expiry.notify_waiters();
                }
            }
        });
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quota_cooldown_auto_expires_without_explicit_clear() {
        let tracker = CooldownTracker::new();
        tracker.mark_quota("c1", "m1").await;
        assert!(matches!(tracker.state("c1", "m1").await, CooldownState::Quota { .. }));
        tokio::time::advance(QUOTA_COOLDOWN + Duration::from_secs(1)).await;
        assert_eq!(tracker.state("c1", "m1").await, CooldownState::Ready);
    }

    #[tokio::test]
    async fn suspend_is_sticky_until_resume() {
        let tracker = CooldownTracker::new();
        tracker.suspend("c1", "m1", "banned").await;
        assert!(matches!(tracker.state("c1", "m1").await, CooldownState::Suspended { .. }));
        tracker.resume("c1", "m1").await;
        assert_eq!(tracker.state("c1", "m1").await, CooldownState::Ready);
    }

    #[tokio::test]
    async fn quota_reason_suspension_is_distinguished_from_other_reasons() {
        let tracker = CooldownTracker::new();
        tracker.suspend("c1", "m1", "quota").await;
        let c = tracker.classify("c1", "m1").await;
        assert!(c.is_quota_reason_suspended());
        assert!(!c.is_other_suspended());

        tracker.suspend("c2", "m1", "credential").await;
        let c2 = tracker.classify("c2", "m1").await;
        assert!(c2.is_other_suspended());
    }

    #[tokio::test]
    async fn forget_client_drops_all_of_its_entries() {
        let tracker = CooldownTracker::new();
        tracker.mark_quota("c1", "m1").await;
        tracker.suspend("c1", "m2", "banned").await;
        tracker.forget_client("c1").await;
        assert_eq!(tracker.state("c1", "m1").await, CooldownState::Ready);
        assert_eq!(tracker.state("c1", "m2").await, CooldownState::Ready);
    }
}
