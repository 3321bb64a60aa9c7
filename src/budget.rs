//! Per-user budget gating.
//!
//! Each registered user carries counters keyed by calendar window (day,
//! week, month, lifetime). The gate pre-checks a projected cost against the
//! block threshold before any provider call and records the actual cost
//! afterwards. Counters reset exactly at UTC window boundaries. State is
//! process-local; hosts persist it via `snapshot`/`restore`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Default warn fraction of the cap.
pub const DEFAULT_WARN_FRACTION: f64 = 0.8;
/// Default block fraction of the cap.
pub const DEFAULT_BLOCK_FRACTION: f64 = 1.0;

/// Calendar-aligned budget window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    Daily,
    Weekly,
    Monthly,
    Lifetime,
}

impl BudgetWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Lifetime => "lifetime",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "lifetime" => Some(Self::Lifetime),
            _ => None,
        }
    }

    /// Start of the window containing `now`.
    fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start: NaiveDate = match self {
            Self::Daily => date,
            Self::Weekly => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Self::Monthly => date.with_day(1).unwrap_or(date),
            Self::Lifetime => return DateTime::<Utc>::MIN_UTC,
        };
        Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).expect("midnight exists"))
    }
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One window's counters for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub cap: f64,
    pub warn: f64,
    pub block: f64,
    pub consumed: f64,
    pub window_start: DateTime<Utc>,
}

impl WindowState {
    fn new(cap: f64, warn: f64, block: f64, now: DateTime<Utc>, window: BudgetWindow) -> Self {
        Self {
            cap,
            warn,
            block,
            consumed: 0.0,
            window_start: window.period_start(now),
        }
    }

    /// Reset the counter if `now` has crossed into a new period.
    fn roll_over(&mut self, window: BudgetWindow, now: DateTime<Utc>) {
        let current_start = window.period_start(now);
        if current_start > self.window_start {
            debug!(window = %window, "budget window rolled over");
            self.consumed = 0.0;
            self.window_start = current_start;
        }
    }
}

/// A per-window budget definition supplied at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub window: BudgetWindow,
    pub cap: f64,
    #[serde(default = "default_warn")]
    pub warn: f64,
    #[serde(default = "default_block")]
    pub block: f64,
}

fn default_warn() -> f64 {
    DEFAULT_WARN_FRACTION
}

fn default_block() -> f64 {
    DEFAULT_BLOCK_FRACTION
}

impl BudgetLimit {
    pub fn new(window: BudgetWindow, cap: f64) -> Self {
        Self {
            window,
            cap,
            warn: DEFAULT_WARN_FRACTION,
            block: DEFAULT_BLOCK_FRACTION,
        }
    }

    pub fn with_warn_fraction(mut self, warn: f64) -> Self {
        self.warn = warn;
        self
    }

    pub fn with_block_fraction(mut self, block: f64) -> Self {
        self.block = block;
        self
    }
}

/// A warning produced by the pre-check when consumption crosses the warn
/// threshold without reaching the block threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub user_id: String,
    pub window: BudgetWindow,
    pub consumed: f64,
    pub projected: f64,
    pub cap: f64,
}

/// Outcome of an admitting pre-check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BudgetVerdict {
    pub warnings: Vec<BudgetWarning>,
}

#[derive(Debug, Default)]
struct UserBudget {
    windows: HashMap<BudgetWindow, WindowState>,
}

/// The budget gate.
///
/// The user map takes a short read lock; all counter mutation happens under
/// that user's own mutex, so concurrent queries from different users never
/// contend.
pub struct BudgetManager {
    users: RwLock<HashMap<String, Arc<Mutex<UserBudget>>>>,
}

impl BudgetManager {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a user's budget limits.
    pub fn register_user(&self, user_id: impl Into<String>, limits: Vec<BudgetLimit>) {
        let now = Utc::now();
        let mut windows = HashMap::new();
        for limit in limits {
            windows.insert(
                limit.window,
                WindowState::new(limit.cap, limit.warn, limit.block, now, limit.window),
            );
        }
        self.users.write().expect("budget map poisoned").insert(
            user_id.into(),
            Arc::new(Mutex::new(UserBudget { windows })),
        );
    }

    /// Whether a budget is registered for this user (the gate is inert
    /// otherwise).
    pub fn has_budget(&self, user_id: &str) -> bool {
        self.users
            .read()
            .expect("budget map poisoned")
            .contains_key(user_id)
    }

    fn user(&self, user_id: &str) -> Option<Arc<Mutex<UserBudget>>> {
        self.users
            .read()
            .expect("budget map poisoned")
            .get(user_id)
            .cloned()
    }

    /// Pre-check a projected cost against every registered window.
    ///
    /// Denies with `budget_exceeded` when any window would reach its block
    /// threshold; otherwise admits, reporting the windows that crossed their
    /// warn threshold. Denial consumes nothing.
    pub async fn precheck(&self, user_id: &str, projected: f64) -> Result<BudgetVerdict> {
        let Some(user) = self.user(user_id) else {
            return Ok(BudgetVerdict::default());
        };
        let now = Utc::now();
        let mut state = user.lock().await;
        let mut verdict = BudgetVerdict::default();

        for (window, ws) in state.windows.iter_mut() {
            ws.roll_over(*window, now);
            let total = ws.consumed + projected;
            if total >= ws.block * ws.cap {
                return Err(Error::BudgetExceeded {
                    user_id: user_id.to_string(),
                    window: window.as_str().to_string(),
                    consumed: ws.consumed,
                    projected,
                    cap: ws.cap,
                });
            }
            if total >= ws.warn * ws.cap {
                verdict.warnings.push(BudgetWarning {
                    user_id: user_id.to_string(),
                    window: *window,
                    consumed: ws.consumed,
                    projected,
                    cap: ws.cap,
                });
            }
        }
        Ok(verdict)
    }

    /// Record the actual cost of an executed (or partially executed) query.
    pub async fn record(&self, user_id: &str, actual: f64) {
        let Some(user) = self.user(user_id) else {
            return;
        };
        let now = Utc::now();
        let mut state = user.lock().await;
        for (window, ws) in state.windows.iter_mut() {
            ws.roll_over(*window, now);
            ws.consumed += actual;
        }
    }

    /// Current consumption for one user/window, rolling over first.
    pub async fn consumed(&self, user_id: &str, window: BudgetWindow) -> Option<f64> {
        let user = self.user(user_id)?;
        let now = Utc::now();
        let mut state = user.lock().await;
        let ws = state.windows.get_mut(&window)?;
        ws.roll_over(window, now);
        Some(ws.consumed)
    }

    /// Serialize all budget state to an opaque blob:
    /// `{ user_id → { window → { consumed, cap, warn, block, window_start } } }`.
    pub async fn snapshot(&self) -> serde_json::Value {
        let users: Vec<(String, Arc<Mutex<UserBudget>>)> = {
            let map = self.users.read().expect("budget map poisoned");
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut out = serde_json::Map::new();
        for (user_id, user) in users {
            let state = user.lock().await;
            let mut windows = serde_json::Map::new();
            for (window, ws) in &state.windows {
                windows.insert(
                    window.as_str().to_string(),
                    serde_json::to_value(ws).unwrap_or(serde_json::Value::Null),
                );
            }
            out.insert(user_id, serde_json::Value::Object(windows));
        }
        serde_json::Value::Object(out)
    }

    /// Restore budget state from a `snapshot` blob, replacing current state.
    pub fn restore(&self, blob: &serde_json::Value) -> Result<()> {
        let users_obj = blob
            .as_object()
            .ok_or_else(|| Error::configuration("budget snapshot must be an object"))?;

        let mut restored = HashMap::new();
        for (user_id, windows_value) in users_obj {
            let windows_obj = windows_value.as_object().ok_or_else(|| {
                Error::configuration(format!("budget snapshot for '{user_id}' must be an object"))
            })?;
            let mut windows = HashMap::new();
            for (window_name, ws_value) in windows_obj {
                let window = BudgetWindow::parse(window_name).ok_or_else(|| {
                    Error::configuration(format!("unknown budget window '{window_name}'"))
                })?;
                let ws: WindowState = serde_json::from_value(ws_value.clone())?;
                windows.insert(window, ws);
            }
            restored.insert(
                user_id.clone(),
                Arc::new(Mutex::new(UserBudget { windows })),
            );
        }

        *self.users.write().expect("budget map poisoned") = restored;
        Ok(())
    }
}

impl Default for BudgetManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager_with(user: &str, cap: f64) -> BudgetManager {
        let manager = BudgetManager::new();
        manager.register_user(user, vec![BudgetLimit::new(BudgetWindow::Daily, cap)]);
        manager
    }

    #[tokio::test]
    async fn test_unregistered_user_is_inert() {
        let manager = BudgetManager::new();
        assert!(!manager.has_budget("ghost"));
        let verdict = manager.precheck("ghost", 1_000.0).await.unwrap();
        assert!(verdict.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_admit_below_warn() {
        let manager = manager_with("u", 10.0);
        let verdict = manager.precheck("u", 1.0).await.unwrap();
        assert!(verdict.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_exactly_at_warn_warns_and_admits() {
        let manager = manager_with("u", 10.0);
        manager.record("u", 7.5).await;
        // 7.5 + 0.5 == 8.0 == 0.8 * 10.0
        let verdict = manager.precheck("u", 0.5).await.unwrap();
        assert_eq!(verdict.warnings.len(), 1);
        assert_eq!(verdict.warnings[0].window, BudgetWindow::Daily);
    }

    #[tokio::test]
    async fn test_exactly_at_block_denies() {
        let manager = manager_with("u", 10.0);
        manager.record("u", 9.5).await;
        let err = manager.precheck("u", 0.5).await.unwrap_err();
        assert_eq!(err.kind(), "budget_exceeded");
    }

    #[tokio::test]
    async fn test_denied_precheck_consumes_nothing() {
        let manager = manager_with("u", 0.01);
        manager.record("u", 0.0099).await;
        assert!(manager.precheck("u", 0.001).await.is_err());
        let consumed = manager.consumed("u", BudgetWindow::Daily).await.unwrap();
        assert!((consumed - 0.0099).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_record_accumulates_monotonically() {
        let manager = manager_with("u", 100.0);
        let mut last = 0.0;
        for _ in 0..5 {
            manager.record("u", 0.25).await;
            let consumed = manager.consumed("u", BudgetWindow::Daily).await.unwrap();
            assert!(consumed >= last);
            last = consumed;
        }
        assert!((last - 1.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_multiple_windows_all_checked() {
        let manager = BudgetManager::new();
        manager.register_user(
            "u",
            vec![
                BudgetLimit::new(BudgetWindow::Daily, 100.0),
                BudgetLimit::new(BudgetWindow::Lifetime, 1.0),
            ],
        );
        manager.record("u", 0.9).await;
        // Daily is fine; lifetime blocks.
        let err = manager.precheck("u", 0.2).await.unwrap_err();
        match err {
            Error::BudgetExceeded { window, .. } => assert_eq!(window, "lifetime"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custom_fractions() {
        let manager = BudgetManager::new();
        manager.register_user(
            "u",
            vec![BudgetLimit::new(BudgetWindow::Daily, 10.0)
                .with_warn_fraction(0.5)
                .with_block_fraction(0.9)],
        );
        let verdict = manager.precheck("u", 5.0).await.unwrap();
        assert_eq!(verdict.warnings.len(), 1);
        assert!(manager.precheck("u", 9.0).await.is_err());
    }

    #[tokio::test]
    async fn test_window_rollover_resets_consumed() {
        let manager = manager_with("u", 10.0);
        manager.record("u", 5.0).await;

        // Force the stored window_start into the previous day; the next
        // access must reset the counter.
        {
            let user = manager.user("u").unwrap();
            let mut state = user.lock().await;
            let ws = state.windows.get_mut(&BudgetWindow::Daily).unwrap();
            ws.window_start = ws.window_start - Duration::days(1);
        }
        let consumed = manager.consumed("u", BudgetWindow::Daily).await.unwrap();
        assert_eq!(consumed, 0.0);
    }

    #[tokio::test]
    async fn test_lifetime_never_resets() {
        let manager = BudgetManager::new();
        manager.register_user("u", vec![BudgetLimit::new(BudgetWindow::Lifetime, 10.0)]);
        manager.record("u", 3.0).await;
        {
            let user = manager.user("u").unwrap();
            let mut state = user.lock().await;
            let ws = state.windows.get_mut(&BudgetWindow::Lifetime).unwrap();
            // Even a years-old window start keeps its consumption.
            ws.window_start = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        }
        let consumed = manager.consumed("u", BudgetWindow::Lifetime).await.unwrap();
        assert_eq!(consumed, 3.0);
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let manager = BudgetManager::new();
        manager.register_user(
            "alice",
            vec![
                BudgetLimit::new(BudgetWindow::Daily, 1.0),
                BudgetLimit::new(BudgetWindow::Monthly, 20.0),
            ],
        );
        manager.register_user("bob", vec![BudgetLimit::new(BudgetWindow::Weekly, 5.0)]);
        manager.record("alice", 0.4).await;
        manager.record("bob", 2.0).await;

        let blob = manager.snapshot().await;

        let fresh = BudgetManager::new();
        fresh.restore(&blob).unwrap();

        assert_eq!(
            fresh.consumed("alice", BudgetWindow::Daily).await.unwrap(),
            manager.consumed("alice", BudgetWindow::Daily).await.unwrap()
        );
        assert_eq!(
            fresh.consumed("bob", BudgetWindow::Weekly).await.unwrap(),
            2.0
        );
        // Round trip again: identical blobs.
        assert_eq!(fresh.snapshot().await, blob);
    }

    #[tokio::test]
    async fn test_restore_rejects_malformed_blob() {
        let manager = BudgetManager::new();
        assert!(manager.restore(&serde_json::json!([1, 2, 3])).is_err());
        assert!(manager
            .restore(&serde_json::json!({"u": {"hourly": {}}}))
            .is_err());
    }

    #[test]
    fn test_period_start_alignment() {
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 13, 45, 0).unwrap(); // a Wednesday
        assert_eq!(
            BudgetWindow::Daily.period_start(now),
            Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BudgetWindow::Weekly.period_start(now),
            Utc.with_ymd_and_hms(2026, 7, 13, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BudgetWindow::Monthly.period_start(now),
            Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
        );
    }
}
