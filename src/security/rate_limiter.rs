//! Sliding-window admission control for planner operations.
//!
//! Each category (e.g. `taskCreate`) owns a quota of `max_requests` per
//! `window_ms`, counted per identifier. Exceeding it blocks the whole
//! category until the oldest in-window request of the offending identifier
//! expires.
//!
//! ## Design
//! - In-memory only, never persisted
//! - Fail-open: unknown categories and internal faults admit the request
//! - `with_limit` rolls the admitted request back when the guarded
//!   operation fails, so failed attempts do not consume quota
//! - Expired events and blocks are pruned lazily on every check and by a
//!   periodic cleanup task (every 30s by default)

use crate::config::LimitsConfig;
use crate::reporting::{ErrorKind, ErrorReport, ErrorReporter};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Identifier used when the caller passes none.
pub const DEFAULT_IDENTIFIER: &str = "default";

/// Default cleanup period: 30 seconds.
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Returned by [`AdmissionController::with_limit`] when the category is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit exceeded for {category}. Try again in {wait}")]
pub struct RateLimitExceeded {
    pub category: String,
    pub retry_after_ms: u64,
    /// Human-readable wait (e.g. `"12 seconds"`).
    pub wait: String,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Requests left in the window (`None` when no quota applies).
    pub remaining: Option<u32>,
    /// Milliseconds until the window (or block) resets.
    pub reset_ms: u64,
    pub blocked: bool,
}

impl AdmissionResult {
    fn open() -> Self {
        Self {
            allowed: true,
            remaining: None,
            reset_ms: 0,
            blocked: false,
        }
    }
}

/// Payload of a `limit_exceeded` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitExceededEvent {
    pub category: String,
    pub identifier: String,
    pub max_requests: u32,
    pub window_ms: u64,
    pub reset_ms: u64,
}

/// Callback invoked when a category becomes blocked.
pub type LimitListener = Arc<dyn Fn(&LimitExceededEvent) + Send + Sync>;

/// Usage snapshot for one category and identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    pub category: String,
    pub identifier: String,
    pub max_requests: u32,
    pub window_ms: u64,
    pub current_requests: u32,
    pub remaining: u32,
    pub reset_ms: u64,
    pub blocked: bool,
    pub blocked_until_ms: Option<u64>,
    /// `current_requests` as a percentage of `max_requests`.
    pub percentage: u32,
}

/// Aggregate usage over all categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatistics {
    pub total_limiters: usize,
    pub total_requests: usize,
    pub blocked_limiters: usize,
    pub by_limiter: BTreeMap<String, LimiterUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterUsage {
    pub requests: usize,
    pub max_requests: u32,
    pub blocked: bool,
    pub utilization: u32,
}

// ── Internal state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RateEvent {
    identifier: String,
    timestamp_ms: u64,
    /// Unique id so a rollback removes exactly the admitted event.
    ticket: u64,
}

#[derive(Debug, Clone)]
struct RateWindow {
    max_requests: u32,
    window_ms: u64,
    events: VecDeque<RateEvent>,
    blocked_until_ms: Option<u64>,
}

impl RateWindow {
    fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            events: VecDeque::new(),
            blocked_until_ms: None,
        }
    }

    /// Drop events outside the window. Returns how many were dropped.
    fn prune(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.window_ms);
        let before = self.events.len();
        self.events.retain(|e| e.timestamp_ms > cutoff);
        before - self.events.len()
    }

    fn clear_expired_block(&mut self, now: u64) {
        if self.blocked_until_ms.is_some_and(|until| until <= now) {
            self.blocked_until_ms = None;
        }
    }

    fn identifier_events<'a>(&'a self, identifier: &'a str) -> impl Iterator<Item = &'a RateEvent> + 'a {
        self.events.iter().filter(move |e| e.identifier == identifier)
    }

    fn reset_from(&self, oldest: Option<u64>, now: u64) -> u64 {
        match oldest {
            Some(ts) => self.window_ms.saturating_sub(now.saturating_sub(ts)),
            None => self.window_ms,
        }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<String, RateWindow>,
    next_ticket: u64,
    destroyed: bool,
}

enum Admission {
    Admitted(AdmissionResult, u64),
    Denied(AdmissionResult, Option<LimitExceededEvent>),
    Open(AdmissionResult),
}

// ── Controller ──────────────────────────────────────────────────

/// Per-category sliding-window rate limiter.
pub struct AdmissionController {
    state: Mutex<LimiterState>,
    listeners: Mutex<Vec<LimitListener>>,
    reporter: Arc<dyn ErrorReporter>,
    cleanup_interval: Duration,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AdmissionController {
    /// Create a controller with no categories.
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            state: Mutex::new(LimiterState::default()),
            listeners: Mutex::new(Vec::new()),
            reporter,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Create a controller with every category from `config`.
    pub fn from_config(config: &LimitsConfig, reporter: Arc<dyn ErrorReporter>) -> anyhow::Result<Self> {
        let mut controller = Self::new(reporter);
        controller.cleanup_interval = config.cleanup_interval();
        for (category, quota) in &config.categories {
            controller.configure(category, quota.max_requests, quota.window_ms)?;
        }
        Ok(controller)
    }

    /// Define or redefine a category's quota. Recorded events are kept.
    pub fn configure(&self, category: &str, max_requests: u32, window_ms: u64) -> anyhow::Result<()> {
        if category.is_empty() {
            anyhow::bail!("Rate limit category must not be empty");
        }
        if max_requests == 0 || window_ms == 0 {
            anyhow::bail!("Rate limit for '{category}' needs max_requests and window_ms > 0");
        }
        let mut state = self.state.lock();
        if state.destroyed {
            anyhow::bail!("Admission controller has been destroyed");
        }
        state
            .windows
            .entry(category.to_string())
            .and_modify(|w| {
                w.max_requests = max_requests;
                w.window_ms = window_ms;
            })
            .or_insert_with(|| RateWindow::new(max_requests, window_ms));
        tracing::debug!(category, max_requests, window_ms, "Configured rate limit");
        Ok(())
    }

    /// Names of all configured categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().windows.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a callback fired whenever a category becomes blocked.
    pub fn on_limit_exceeded(&self, listener: LimitListener) {
        self.listeners.lock().push(listener);
    }

    /// Check (and if admitted, record) one request.
    pub fn check(&self, category: &str, identifier: &str) -> AdmissionResult {
        match self.admit(category, identifier, crate::now_ms()) {
            Admission::Admitted(result, _) | Admission::Open(result) => result,
            Admission::Denied(result, event) => {
                self.notify(event);
                result
            }
        }
    }

    fn admit(&self, category: &str, identifier: &str, now: u64) -> Admission {
        if category.is_empty() {
            self.reporter.report(ErrorReport::new(
                ErrorKind::Runtime,
                "check",
                "Rate limit check without a category",
            ));
            return Admission::Open(AdmissionResult::open());
        }
        let identifier = if identifier.is_empty() {
            DEFAULT_IDENTIFIER
        } else {
            identifier
        };

        let mut state = self.state.lock();
        if state.destroyed {
            tracing::debug!(category, "Admission controller destroyed, admitting");
            return Admission::Open(AdmissionResult::open());
        }
        let ticket = state.next_ticket;
        let Some(window) = state.windows.get_mut(category) else {
            tracing::warn!(category, "Unknown rate limit category, admitting");
            return Admission::Open(AdmissionResult::open());
        };

        window.prune(now);

        if let Some(until) = window.blocked_until_ms.filter(|until| *until > now) {
            return Admission::Denied(
                AdmissionResult {
                    allowed: false,
                    remaining: Some(0),
                    reset_ms: until - now,
                    blocked: true,
                },
                None,
            );
        }
        window.clear_expired_block(now);

        let count = window.identifier_events(identifier).count();
        let oldest = window.identifier_events(identifier).next().map(|e| e.timestamp_ms);
        let count_u32 = u32::try_from(count).unwrap_or(u32::MAX);

        if count_u32 >= window.max_requests {
            let reset_ms = window.reset_from(oldest, now);
            window.blocked_until_ms = Some(now + reset_ms);
            tracing::warn!(category, identifier, reset_ms, "Rate limit exceeded");
            let event = LimitExceededEvent {
                category: category.to_string(),
                identifier: identifier.to_string(),
                max_requests: window.max_requests,
                window_ms: window.window_ms,
                reset_ms,
            };
            return Admission::Denied(
                AdmissionResult {
                    allowed: false,
                    remaining: Some(0),
                    reset_ms,
                    blocked: true,
                },
                Some(event),
            );
        }

        window.events.push_back(RateEvent {
            identifier: identifier.to_string(),
            timestamp_ms: now,
            ticket,
        });
        let result = AdmissionResult {
            allowed: true,
            remaining: Some(window.max_requests - count_u32 - 1),
            reset_ms: window.reset_from(oldest, now),
            blocked: false,
        };
        state.next_ticket = ticket.wrapping_add(1);
        Admission::Admitted(result, ticket)
    }

    fn notify(&self, event: Option<LimitExceededEvent>) {
        let Some(event) = event else {
            return;
        };
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Remove exactly the event recorded under `ticket`.
    fn rollback(&self, category: &str, ticket: u64) {
        let mut state = self.state.lock();
        if let Some(window) = state.windows.get_mut(category) {
            if let Some(pos) = window.events.iter().position(|e| e.ticket == ticket) {
                window.events.remove(pos);
                tracing::debug!(category, "Rolled back admitted request");
            }
        }
    }

    fn deny_error(category: &str, result: &AdmissionResult) -> RateLimitExceeded {
        RateLimitExceeded {
            category: category.to_string(),
            retry_after_ms: result.reset_ms,
            wait: format_wait(result.reset_ms),
        }
    }

    /// Run `operation` if admitted. A failed operation does not count
    /// against the quota. Denial yields a [`RateLimitExceeded`] error.
    pub async fn with_limit<T, F, Fut>(
        &self,
        category: &str,
        identifier: &str,
        operation: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ticket = match self.admit(category, identifier, crate::now_ms()) {
            Admission::Admitted(_, ticket) => Some(ticket),
            Admission::Open(_) => None,
            Admission::Denied(result, event) => {
                self.notify(event);
                return Err(Self::deny_error(category, &result).into());
            }
        };

        let outcome = operation().await;
        if outcome.is_err() {
            if let Some(ticket) = ticket {
                self.rollback(category, ticket);
            }
        }
        outcome
    }

    /// Blocking counterpart of [`Self::with_limit`].
    pub fn with_limit_sync<T, F>(&self, category: &str, identifier: &str, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let ticket = match self.admit(category, identifier, crate::now_ms()) {
            Admission::Admitted(_, ticket) => Some(ticket),
            Admission::Open(_) => None,
            Admission::Denied(result, event) => {
                self.notify(event);
                return Err(Self::deny_error(category, &result).into());
            }
        };

        let outcome = operation();
        if outcome.is_err() {
            if let Some(ticket) = ticket {
                self.rollback(category, ticket);
            }
        }
        outcome
    }

    /// Usage of one identifier in one category (`None` for unknown categories).
    pub fn status(&self, category: &str, identifier: &str) -> Option<LimitStatus> {
        self.status_at(category, identifier, crate::now_ms())
    }

    fn status_at(&self, category: &str, identifier: &str, now: u64) -> Option<LimitStatus> {
        let identifier = if identifier.is_empty() {
            DEFAULT_IDENTIFIER
        } else {
            identifier
        };
        let state = self.state.lock();
        let window = state.windows.get(category)?;
        let cutoff = now.saturating_sub(window.window_ms);
        let in_window: Vec<&RateEvent> = window
            .identifier_events(identifier)
            .filter(|e| e.timestamp_ms > cutoff)
            .collect();
        let current = u32::try_from(in_window.len()).unwrap_or(u32::MAX);
        let oldest = in_window.first().map(|e| e.timestamp_ms);
        let blocked_until_ms = window.blocked_until_ms.filter(|until| *until > now);
        let percentage = u32::try_from(u64::from(current) * 100 / u64::from(window.max_requests))
            .unwrap_or(u32::MAX);

        Some(LimitStatus {
            category: category.to_string(),
            identifier: identifier.to_string(),
            max_requests: window.max_requests,
            window_ms: window.window_ms,
            current_requests: current,
            remaining: window.max_requests.saturating_sub(current),
            reset_ms: window.reset_from(oldest, now),
            blocked: blocked_until_ms.is_some(),
            blocked_until_ms,
            percentage,
        })
    }

    /// Usage summary over every category.
    pub fn statistics(&self) -> LimiterStatistics {
        let now = crate::now_ms();
        let state = self.state.lock();
        let mut stats = LimiterStatistics {
            total_limiters: state.windows.len(),
            ..LimiterStatistics::default()
        };
        for (name, window) in &state.windows {
            let requests = window.events.len();
            let blocked = window.blocked_until_ms.is_some_and(|until| until > now);
            stats.total_requests += requests;
            if blocked {
                stats.blocked_limiters += 1;
            }
            let utilization = u32::try_from(requests as u64 * 100 / u64::from(window.max_requests))
                .unwrap_or(u32::MAX);
            stats.by_limiter.insert(
                name.clone(),
                LimiterUsage {
                    requests,
                    max_requests: window.max_requests,
                    blocked,
                    utilization,
                },
            );
        }
        stats
    }

    /// Clear one identifier's events, or the whole category (including its
    /// block) when `identifier` is `None`. Returns false for unknown categories.
    pub fn reset(&self, category: &str, identifier: Option<&str>) -> bool {
        let mut state = self.state.lock();
        let Some(window) = state.windows.get_mut(category) else {
            return false;
        };
        match identifier {
            Some(id) => window.events.retain(|e| e.identifier != id),
            None => {
                window.events.clear();
                window.blocked_until_ms = None;
            }
        }
        tracing::info!(category, identifier = identifier.unwrap_or("*"), "Rate limit reset");
        true
    }

    /// Clear every category.
    pub fn reset_all(&self) {
        let mut state = self.state.lock();
        for window in state.windows.values_mut() {
            window.events.clear();
            window.blocked_until_ms = None;
        }
        tracing::info!("All rate limits reset");
    }

    /// Prune expired events and lift expired blocks. Returns pruned events.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(crate::now_ms())
    }

    fn cleanup_at(&self, now: u64) -> usize {
        let mut state = self.state.lock();
        let mut pruned = 0;
        for window in state.windows.values_mut() {
            pruned += window.prune(now);
            window.clear_expired_block(now);
        }
        if pruned > 0 {
            tracing::debug!(pruned, "Rate limiter cleanup");
        }
        pruned
    }

    /// Start the periodic cleanup task. Idempotent; must run inside a Tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut slot = self.cleanup_task.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.cleanup_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.cleanup();
            }
        }));
    }

    /// Stop the periodic cleanup task. Idempotent.
    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
    }

    /// Stop cleanup and drop all state. Later checks admit everything.
    pub fn destroy(&self) {
        self.stop_cleanup();
        {
            let mut state = self.state.lock();
            state.windows.clear();
            state.destroyed = true;
        }
        self.listeners.lock().clear();
        tracing::info!("Admission controller destroyed");
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}

/// Render a wait time for humans: `"1 second"`, `"42 seconds"`, `"2 minutes 5s"`.
pub fn format_wait(ms: u64) -> String {
    let seconds = ms.div_ceil(1000);
    if seconds < 60 {
        let unit = if seconds == 1 { "second" } else { "seconds" };
        return format!("{seconds} {unit}");
    }
    let minutes = seconds / 60;
    let rest = seconds % 60;
    let unit = if minutes == 1 { "minute" } else { "minutes" };
    if rest > 0 {
        format!("{minutes} {unit} {rest}s")
    } else {
        format!("{minutes} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::{ErrorLog, TracingReporter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller() -> AdmissionController {
        AdmissionController::new(Arc::new(TracingReporter))
    }

    fn admitted(controller: &AdmissionController, category: &str, id: &str, now: u64) -> bool {
        match controller.admit(category, id, now) {
            Admission::Admitted(..) | Admission::Open(_) => true,
            Admission::Denied(..) => false,
        }
    }

    #[test]
    fn denies_request_beyond_quota() {
        let c = controller();
        c.configure("taskCreate", 3, 60_000).unwrap();
        for _ in 0..3 {
            assert!(c.check("taskCreate", "user").allowed);
        }
        let denied = c.check("taskCreate", "user");
        assert!(!denied.allowed);
        assert!(denied.blocked);
        assert_eq!(denied.remaining, Some(0));
        assert!(denied.reset_ms > 0);
    }

    #[test]
    fn remaining_counts_down() {
        let c = controller();
        c.configure("search", 3, 60_000).unwrap();
        assert_eq!(c.check("search", "").remaining, Some(2));
        assert_eq!(c.check("search", "").remaining, Some(1));
        assert_eq!(c.check("search", "").remaining, Some(0));
    }

    #[test]
    fn burst_then_recovery_after_window() {
        let c = controller();
        c.configure("taskCreate", 2, 1_000).unwrap();
        let t0 = 1_000_000;
        assert!(admitted(&c, "taskCreate", "default", t0));
        assert!(admitted(&c, "taskCreate", "default", t0));
        assert!(!admitted(&c, "taskCreate", "default", t0));
        // Still blocked mid-window.
        assert!(!admitted(&c, "taskCreate", "default", t0 + 500));
        assert!(admitted(&c, "taskCreate", "default", t0 + 1_100));
    }

    #[test]
    fn block_applies_to_whole_category() {
        let c = controller();
        c.configure("taskEdit", 1, 10_000).unwrap();
        let t0 = 5_000_000;
        assert!(admitted(&c, "taskEdit", "alice", t0));
        assert!(!admitted(&c, "taskEdit", "alice", t0 + 1));
        assert!(!admitted(&c, "taskEdit", "bob", t0 + 2));
    }

    #[test]
    fn identifiers_have_separate_quotas() {
        let c = controller();
        c.configure("api", 2, 60_000).unwrap();
        assert!(c.check("api", "alice").allowed);
        assert!(c.check("api", "alice").allowed);
        assert!(c.check("api", "bob").allowed);
        assert_eq!(c.status("api", "bob").unwrap().current_requests, 1);
    }

    #[test]
    fn unknown_and_empty_category_fail_open() {
        let log = Arc::new(ErrorLog::in_memory());
        let c = AdmissionController::new(log.clone());
        let result = c.check("nope", "user");
        assert!(result.allowed);
        assert_eq!(result.remaining, None);

        assert!(c.check("", "user").allowed);
        assert_eq!(log.recent().len(), 1);
        assert_eq!(log.recent()[0].kind, ErrorKind::Runtime);
    }

    #[test]
    fn destroyed_controller_admits_everything() {
        let c = controller();
        c.configure("export", 1, 300_000).unwrap();
        assert!(c.check("export", "u").allowed);
        c.destroy();
        for _ in 0..5 {
            assert!(c.check("export", "u").allowed);
        }
        assert!(c.configure("export", 1, 1).is_err());
        assert!(c.status("export", "u").is_none());
    }

    #[test]
    fn configure_rejects_zero_and_keeps_events() {
        let c = controller();
        assert!(c.configure("x", 0, 1_000).is_err());
        assert!(c.configure("x", 1, 0).is_err());
        assert!(c.configure("", 1, 1).is_err());

        c.configure("x", 5, 60_000).unwrap();
        c.check("x", "u");
        c.configure("x", 10, 60_000).unwrap();
        let status = c.status("x", "u").unwrap();
        assert_eq!(status.max_requests, 10);
        assert_eq!(status.current_requests, 1);
    }

    #[test]
    fn failing_operation_does_not_consume_quota() {
        let c = controller();
        c.configure("taskCreate", 2, 60_000).unwrap();
        for _ in 0..5 {
            let result: anyhow::Result<()> =
                c.with_limit_sync("taskCreate", "u", || anyhow::bail!("write failed"));
            assert!(result.unwrap_err().to_string().contains("write failed"));
        }
        assert_eq!(c.status("taskCreate", "u").unwrap().remaining, 2);
    }

    #[test]
    fn rollback_removes_only_the_failed_attempt() {
        let c = controller();
        c.configure("taskEdit", 5, 60_000).unwrap();
        c.with_limit_sync("taskEdit", "u", || Ok(())).unwrap();
        let _ = c.with_limit_sync::<(), _>("taskEdit", "u", || anyhow::bail!("boom"));
        c.with_limit_sync("taskEdit", "u", || Ok(())).unwrap();
        assert_eq!(c.status("taskEdit", "u").unwrap().current_requests, 2);
    }

    #[tokio::test]
    async fn with_limit_denial_is_downcastable() {
        let c = controller();
        c.configure("export", 1, 300_000).unwrap();
        let first = c.with_limit("export", "u", || async { Ok(1) }).await.unwrap();
        assert_eq!(first, 1);

        let err = c
            .with_limit("export", "u", || async { Ok(2) })
            .await
            .unwrap_err();
        let exceeded = err.downcast_ref::<RateLimitExceeded>().unwrap();
        assert_eq!(exceeded.category, "export");
        assert!(exceeded.retry_after_ms > 0);
        assert!(err.to_string().starts_with("Rate limit exceeded for export. Try again in"));
    }

    #[tokio::test]
    async fn async_failure_rolls_back() {
        let c = controller();
        c.configure("storage", 1, 60_000).unwrap();
        let failed: anyhow::Result<()> = c
            .with_limit("storage", "u", || async { anyhow::bail!("quota") })
            .await;
        assert!(failed.is_err());
        assert!(c.with_limit("storage", "u", || async { Ok(()) }).await.is_ok());
    }

    #[test]
    fn listeners_fire_once_per_block() {
        let c = controller();
        c.configure("filter", 1, 60_000).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        c.on_limit_exceeded(Arc::new(move |event: &LimitExceededEvent| {
            assert_eq!(event.category, "filter");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        c.check("filter", "u");
        c.check("filter", "u");
        c.check("filter", "u");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_clears_identifier_or_category() {
        let c = controller();
        c.configure("api", 1, 60_000).unwrap();
        c.check("api", "a");
        c.check("api", "a");
        assert!(c.status("api", "a").unwrap().blocked);

        // Identifier reset keeps the block.
        assert!(c.reset("api", Some("a")));
        assert!(!c.check("api", "a").allowed);

        assert!(c.reset("api", None));
        assert!(c.check("api", "a").allowed);
        assert!(!c.reset("missing", None));
    }

    #[test]
    fn reset_all_and_statistics() {
        let c = controller();
        c.configure("a", 1, 60_000).unwrap();
        c.configure("b", 4, 60_000).unwrap();
        c.check("a", "u");
        c.check("a", "u");
        c.check("b", "u");

        let stats = c.statistics();
        assert_eq!(stats.total_limiters, 2);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.blocked_limiters, 1);
        assert_eq!(stats.by_limiter["b"].utilization, 25);

        c.reset_all();
        let stats = c.statistics();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.blocked_limiters, 0);
    }

    #[test]
    fn cleanup_prunes_and_unblocks() {
        let c = controller();
        c.configure("taskDelete", 1, 1_000).unwrap();
        let t0 = 10_000;
        assert!(admitted(&c, "taskDelete", "u", t0));
        assert!(!admitted(&c, "taskDelete", "u", t0 + 10));

        assert_eq!(c.cleanup_at(t0 + 2_000), 1);
        let state = c.state.lock();
        let window = &state.windows["taskDelete"];
        assert!(window.events.is_empty());
        assert!(window.blocked_until_ms.is_none());
    }

    #[test]
    fn status_reports_usage() {
        let c = controller();
        c.configure("search", 4, 60_000).unwrap();
        c.check("search", "u");
        let status = c.status_at("search", "u", crate::now_ms()).unwrap();
        assert_eq!(status.current_requests, 1);
        assert_eq!(status.remaining, 3);
        assert_eq!(status.percentage, 25);
        assert!(!status.blocked);
        assert!(c.status("unknown", "u").is_none());
    }

    #[tokio::test]
    async fn cleanup_task_start_stop_is_idempotent() {
        let c = Arc::new(controller());
        c.start_cleanup();
        c.start_cleanup();
        assert!(c.cleanup_task.lock().is_some());
        c.stop_cleanup();
        c.stop_cleanup();
        assert!(c.cleanup_task.lock().is_none());
    }

    #[test]
    fn format_wait_is_readable() {
        assert_eq!(format_wait(1), "1 second");
        assert_eq!(format_wait(1_000), "1 second");
        assert_eq!(format_wait(42_500), "43 seconds");
        assert_eq!(format_wait(60_000), "1 minute");
        assert_eq!(format_wait(125_000), "2 minutes 5s");
    }

    #[test]
    fn from_config_loads_defaults() {
        let c = AdmissionController::from_config(&LimitsConfig::default(), Arc::new(TracingReporter))
            .unwrap();
        assert_eq!(c.categories().len(), 8);
        assert_eq!(c.status("export", "u").unwrap().window_ms, 300_000);
    }
}
