//! Rate & Dedup Guard. Dedup is a bounded map with capacity eviction; the
//! cooldown-by-kind lookup is a fixed per-kind interval rather than
//! escalating backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{Kind, RateState, Role};

/// Bounded LRU of recently processed inbound ids. Capacity eviction only —
/// dedup here never expires by time.
pub struct DedupGuard {
    seen: Mutex<(HashSet<String>, VecDeque<String>)>,
    capacity: usize,
}

impl DedupGuard {
    pub fn new(capacity: usize) -> Self {
        DedupGuard { seen: Mutex::new((HashSet::new(), VecDeque::new())), capacity }
    }

    /// Returns `true` if `id` is new (caller should process it), `false` if
    /// it was already seen (caller must drop with `already_processed`).
    pub fn check_and_record(&self, id: &str) -> bool {
        let mut guard = self.seen.lock().unwrap();
        let (set, order) = &mut *guard;
        if set.contains(id) {
            return false;
        }
        if order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        set.insert(id.to_string());
        order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().0.len()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub default_interval: Duration,
    pub max_daily: u32,
    pub quotas_per_hour: HashMap<Role, u32>,
}

impl Default for RateLimits {
    fn default() -> Self {
        let mut quotas_per_hour = HashMap::new();
        quotas_per_hour.insert(Role::Admin, 1000);
        quotas_per_hour.insert(Role::Employee, 100);
        quotas_per_hour.insert(Role::Provider, 50);
        quotas_per_hour.insert(Role::Friend, 30);
        quotas_per_hour.insert(Role::Familiar, 30);
        quotas_per_hour.insert(Role::Customer, 10);
        quotas_per_hour.insert(Role::Block, 0);
        RateLimits { default_interval: Duration::from_secs(5), max_daily: 200, quotas_per_hour }
    }
}

impl RateLimits {
    /// commands -> 1s, questions -> half of default, everything else ->
    /// default.
    pub fn min_interval(&self, kind: Kind) -> Duration {
        match kind {
            Kind::Command => Duration::from_secs(1),
            Kind::Question => self.default_interval / 2,
            _ => self.default_interval,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CommandState {
    invocations_this_hour: VecDeque<DateTime<Utc>>,
    last_invoked: Option<DateTime<Utc>>,
    daily_count: u32,
    daily_reset_date: Option<chrono::NaiveDate>,
}

/// Concurrent per-address map with fine-grained locking.
pub struct RateGuard {
    limits: RateLimits,
    states: Mutex<HashMap<String, RateState>>,
    command_states: Mutex<HashMap<(String, &'static str), CommandState>>,
    window: Duration,
}

impl RateGuard {
    pub fn new(limits: RateLimits) -> Self {
        RateGuard { limits, states: Mutex::new(HashMap::new()), command_states: Mutex::new(HashMap::new()), window: Duration::from_secs(3600) }
    }

    /// `canRespond(address, kind, isAdmin)`. Admins bypass both checks.
    /// Daily counter resets when the calendar day changes.
    pub fn can_respond(&self, address: &str, kind: Kind, is_admin: bool, now: DateTime<Utc>) -> bool {
        if is_admin {
            return true;
        }
        let mut states = self.states.lock().unwrap();
        let state = states.entry(address.to_string()).or_default();
        prune(state, now, self.window);
        reset_if_new_day(state, now);

        let min_interval = self.limits.min_interval(kind);
        let interval_ok = match state.response_timestamps.back() {
            Some(last) => now.signed_duration_since(*last).to_std().unwrap_or_default() >= min_interval,
            None => true,
        };
        interval_ok && state.daily_count < self.limits.max_daily
    }

    /// Records an admitted response. Skip for admins: they bypass the
    /// counters, so they're never recorded against them.
    pub fn record_response(&self, address: &str, now: DateTime<Utc>) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(address.to_string()).or_default();
        prune(state, now, self.window);
        reset_if_new_day(state, now);
        state.response_timestamps.push_back(now);
        state.daily_count += 1;
    }

    pub fn record_denied(&self, address: &str, now: DateTime<Utc>) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(address.to_string()).or_default();
        state.last_denied_at = Some(now);
    }

    /// Per-role hourly command quota.
    pub fn quota_per_hour(&self, role: Role) -> u32 {
        *self.limits.quotas_per_hour.get(&role).unwrap_or(&0)
    }

    /// Gate a command invocation against its own cooldown, its daily cap,
    /// and the caller's per-role hourly quota. Admins bypass all three.
    /// Returns `false` if any check denies; callers that deny must not call
    /// [`Self::record_command`].
    pub fn check_command(&self, address: &str, handler_name: &'static str, role: Role, cooldown_secs: u64, daily_cap: Option<u32>, now: DateTime<Utc>) -> bool {
        if role.is_admin() {
            return true;
        }
        let mut states = self.command_states.lock().unwrap();
        let state = states.entry((address.to_string(), handler_name)).or_default();
        prune_command(state, now, self.window);
        reset_command_if_new_day(state, now);

        if let Some(last) = state.last_invoked {
            if now.signed_duration_since(last).to_std().unwrap_or_default() < Duration::from_secs(cooldown_secs) {
                return false;
            }
        }
        if let Some(cap) = daily_cap {
            if state.daily_count >= cap {
                return false;
            }
        }
        state.invocations_this_hour.len() < self.quota_per_hour(role) as usize
    }

    /// Records an admitted command invocation. Only call after
    /// [`Self::check_command`] returned `true`.
    pub fn record_command(&self, address: &str, handler_name: &'static str, now: DateTime<Utc>) {
        let mut states = self.command_states.lock().unwrap();
        let state = states.entry((address.to_string(), handler_name)).or_default();
        reset_command_if_new_day(state, now);
        state.invocations_this_hour.push_back(now);
        state.last_invoked = Some(now);
        state.daily_count += 1;
    }

    /// Periodic sweep: drop addresses inactive for longer than the window.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let mut states = self.states.lock().unwrap();
        states.retain(|_, state| {
            state
                .response_timestamps
                .back()
                .map(|last| now.signed_duration_since(*last).to_std().unwrap_or_default() < self.window)
                .unwrap_or(false)
        });
    }
}

fn prune(state: &mut RateState, now: DateTime<Utc>, window: Duration) {
    while let Some(front) = state.response_timestamps.front() {
        if now.signed_duration_since(*front).to_std().unwrap_or_default() > window {
            state.response_timestamps.pop_front();
        } else {
            break;
        }
    }
}

fn reset_if_new_day(state: &mut RateState, now: DateTime<Utc>) {
    let today = now.date_naive();
    if state.daily_reset_date != Some(today) {
        state.daily_reset_date = Some(today);
        state.daily_count = 0;
    }
}

fn prune_command(state: &mut CommandState, now: DateTime<Utc>, window: Duration) {
    while let Some(front) = state.invocations_this_hour.front() {
        if now.signed_duration_since(*front).to_std().unwrap_or_default() > window {
            state.invocations_this_hour.pop_front();
        } else {
            break;
        }
    }
}

fn reset_command_if_new_day(state: &mut CommandState, now: DateTime<Utc>) {
    let today = now.date_naive();
    if state.daily_reset_date != Some(today) {
        state.daily_reset_date = Some(today);
        state.daily_count = 0;
    }
}
