//! Cost & Budget Ledger
//!
//! Accumulates token usage and USD cost per backend, enforces budgets over
//! calendar periods, and fires threshold alerts.
//!
//! Budgets can be scoped to one backend or to the whole orchestrator. Each
//! budget has a period (daily, monthly, or none) measured in UTC calendar
//! units: a daily budget resets at 00:00 UTC, a monthly budget on the first
//! of the month. Resets happen lazily the next time the budget is touched.
//!
//! Alert callbacks run after the ledger's locks are released, so a callback
//! may safely call back into the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::registry::Pricing;

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time for budget periods
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at the given instant
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an instant
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move forward
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Budget Types
// ============================================================================

/// Budget reset period
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Resets at 00:00 UTC
    Daily,
    /// Resets on the first of the month, 00:00 UTC
    Monthly,
    /// Never resets
    None,
}

impl BudgetPeriod {
    /// Start of the period containing `now`, or `None` for a lifetime budget
    #[must_use]
    pub fn period_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = match self {
            Self::Daily => now.date_naive(),
            Self::Monthly => {
                NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or(now.date_naive())
            }
            Self::None => return None,
        };
        Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
    }
}

/// What happens when a budget is spent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEnforcement {
    /// Alerts only
    #[default]
    Soft,
    /// Block further dispatch until the period resets
    HardStop,
}

/// What a budget applies to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// All backends together
    Global,
    /// A single backend
    Backend(String),
}

impl BudgetScope {
    /// Scope for a named backend
    pub fn backend(name: impl Into<String>) -> Self {
        Self::Backend(name.into())
    }
}

impl From<&str> for BudgetScope {
    fn from(name: &str) -> Self {
        Self::Backend(name.to_string())
    }
}

impl From<String> for BudgetScope {
    fn from(name: String) -> Self {
        Self::Backend(name)
    }
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Backend(name) => write!(f, "backend '{name}'"),
        }
    }
}

/// Alert delivered when spend crosses a threshold
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BudgetAlert {
    /// Budget that crossed
    pub scope: BudgetScope,
    /// Configured threshold, percent of limit
    pub threshold_percent: f64,
    /// Configured message
    pub message: String,
    /// Spend when the alert fired
    pub spent: f64,
    /// Budget limit
    pub limit: f64,
}

/// Callback invoked for each fired alert
pub type AlertCallback = Arc<dyn Fn(&BudgetAlert) + Send + Sync>;

/// Result of a budget check
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BudgetCheck {
    /// Dispatch may proceed
    Allowed,
    /// A hard-stop budget is spent
    Exceeded {
        /// Spend this period
        spent: f64,
        /// Limit
        limit: f64,
    },
}

/// Point-in-time view of a budget
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BudgetStatus {
    /// Budget scope
    pub scope: BudgetScope,
    /// Limit in USD
    pub limit: f64,
    /// Spend this period
    pub spent: f64,
    /// Limit minus spend, floored at zero
    pub remaining: f64,
    /// Reset period
    pub period: BudgetPeriod,
    /// Enforcement mode
    pub enforcement: BudgetEnforcement,
    /// Start of the current period
    pub period_start: DateTime<Utc>,
}

/// Accumulated usage
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BackendUsage {
    /// Calls recorded
    pub requests: u64,
    /// Input tokens
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Cost in USD
    pub cost: f64,
}

#[derive(Debug)]
struct AlertRule {
    threshold_percent: f64,
    message: String,
    fired: bool,
}

#[derive(Debug)]
struct Budget {
    limit: f64,
    period: BudgetPeriod,
    enforcement: BudgetEnforcement,
    spent: f64,
    period_start: DateTime<Utc>,
    alerts: Vec<AlertRule>,
}

impl Budget {
    fn roll_over(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.period.period_start(now) {
            if start > self.period_start {
                self.spent = 0.0;
                self.period_start = start;
                for alert in &mut self.alerts {
                    alert.fired = false;
                }
            }
        }
    }

    fn percent_used(&self) -> f64 {
        if self.limit <= 0.0 {
            if self.spent > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            self.spent / self.limit * 100.0
        }
    }

    /// Fire any alert whose threshold is now crossed
    fn due_alerts(&mut self, scope: &BudgetScope) -> Vec<BudgetAlert> {
        let used = self.percent_used();
        let (spent, limit) = (self.spent, self.limit);
        self.alerts
            .iter_mut()
            .filter(|rule| !rule.fired && used >= rule.threshold_percent)
            .map(|rule| {
                rule.fired = true;
                BudgetAlert {
                    scope: scope.clone(),
                    threshold_percent: rule.threshold_percent,
                    message: rule.message.clone(),
                    spent,
                    limit,
                }
            })
            .collect()
    }

    fn status(&self, scope: &BudgetScope) -> BudgetStatus {
        BudgetStatus {
            scope: scope.clone(),
            limit: self.limit,
            spent: self.spent,
            remaining: (self.limit - self.spent).max(0.0),
            period: self.period,
            enforcement: self.enforcement,
            period_start: self.period_start,
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Usage, cost and budget bookkeeping
pub struct CostLedger {
    pricing: DashMap<String, Pricing>,
    usage: DashMap<String, BackendUsage>,
    budgets: DashMap<BudgetScope, Arc<Mutex<Budget>>>,
    alert_callback: RwLock<Option<AlertCallback>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostLedger")
            .field("backends", &self.usage.len())
            .field("budgets", &self.budgets.len())
            .finish_non_exhaustive()
    }
}

impl Default for CostLedger {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl CostLedger {
    /// Create a ledger using the given clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pricing: DashMap::new(),
            usage: DashMap::new(),
            budgets: DashMap::new(),
            alert_callback: RwLock::new(None),
            clock,
        }
    }

    /// Set or clear a backend's pricing
    pub fn set_pricing(&self, backend: &str, pricing: Option<Pricing>) {
        match pricing {
            Some(pricing) => {
                self.pricing.insert(backend.to_string(), pricing);
            }
            None => {
                self.pricing.remove(backend);
            }
        }
    }

    /// Record a call's token usage and return its cost
    pub fn record_usage(&self, backend: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost = self
            .pricing
            .get(backend)
            .map_or(0.0, |p| p.cost(input_tokens, output_tokens));

        {
            let mut usage = self.usage.entry(backend.to_string()).or_default();
            usage.requests += 1;
            usage.input_tokens += input_tokens;
            usage.output_tokens += output_tokens;
            usage.cost += cost;
        }

        let now = self.clock.now();
        let mut fired = Vec::new();
        for scope in [BudgetScope::backend(backend), BudgetScope::Global] {
            let Some(budget) = self.budget(&scope) else {
                continue;
            };
            let mut budget = budget.lock();
            budget.roll_over(now);
            budget.spent += cost;
            fired.extend(budget.due_alerts(&scope));
        }

        self.dispatch_alerts(&fired);
        cost
    }

    fn budget(&self, scope: &BudgetScope) -> Option<Arc<Mutex<Budget>>> {
        self.budgets.get(scope).map(|entry| Arc::clone(entry.value()))
    }

    fn dispatch_alerts(&self, alerts: &[BudgetAlert]) {
        if alerts.is_empty() {
            return;
        }
        let callback = self.alert_callback.read().clone();
        for alert in alerts {
            match &callback {
                Some(callback) => callback(alert),
                None => tracing::warn!(
                    scope = %alert.scope,
                    threshold_percent = alert.threshold_percent,
                    spent = alert.spent,
                    limit = alert.limit,
                    "budget alert: {}",
                    alert.message
                ),
            }
        }
    }

    /// Install or replace a budget
    ///
    /// Replacing a budget keeps its spend for the current period and its
    /// alert rules.
    pub fn set_budget(
        &self,
        scope: BudgetScope,
        limit: f64,
        period: BudgetPeriod,
        enforcement: BudgetEnforcement,
    ) {
        let now = self.clock.now();
        let period_start = period.period_start(now).unwrap_or(now);

        if let Some(existing) = self.budget(&scope) {
            let mut budget = existing.lock();
            if budget.period != period {
                budget.spent = 0.0;
                budget.period_start = period_start;
            }
            budget.limit = limit;
            budget.period = period;
            budget.enforcement = enforcement;
            for alert in &mut budget.alerts {
                alert.fired = false;
            }
        } else {
            self.budgets.insert(
                scope.clone(),
                Arc::new(Mutex::new(Budget {
                    limit,
                    period,
                    enforcement,
                    spent: 0.0,
                    period_start,
                    alerts: Vec::new(),
                })),
            );
        }
        tracing::info!(scope = %scope, limit, ?period, ?enforcement, "budget set");
    }

    /// Remove a budget
    pub fn remove_budget(&self, scope: &BudgetScope) -> bool {
        self.budgets.remove(scope).is_some()
    }

    /// Add a threshold alert to an existing budget
    ///
    /// Returns false if no budget exists for the scope.
    pub fn add_alert(
        &self,
        scope: &BudgetScope,
        threshold_percent: f64,
        message: impl Into<String>,
    ) -> bool {
        let Some(budget) = self.budget(scope) else {
            return false;
        };
        let fired = {
            let mut budget = budget.lock();
            budget.roll_over(self.clock.now());
            budget.alerts.push(AlertRule {
                threshold_percent,
                message: message.into(),
                fired: false,
            });
            budget.due_alerts(scope)
        };
        self.dispatch_alerts(&fired);
        true
    }

    /// Install the alert callback
    pub fn on_alert(&self, callback: AlertCallback) {
        *self.alert_callback.write() = Some(callback);
    }

    /// Whether a hard-stop budget blocks dispatch for this scope
    pub fn check_budget(&self, scope: &BudgetScope) -> BudgetCheck {
        let Some(budget) = self.budget(scope) else {
            return BudgetCheck::Allowed;
        };
        let mut budget = budget.lock();
        budget.roll_over(self.clock.now());
        if budget.enforcement == BudgetEnforcement::HardStop && budget.spent >= budget.limit {
            BudgetCheck::Exceeded {
                spent: budget.spent,
                limit: budget.limit,
            }
        } else {
            BudgetCheck::Allowed
        }
    }

    /// Budget status for a scope
    pub fn budget_status(&self, scope: &BudgetScope) -> Option<BudgetStatus> {
        let budget = self.budget(scope)?;
        let mut budget = budget.lock();
        budget.roll_over(self.clock.now());
        Some(budget.status(scope))
    }

    /// Total cost, for one backend or across all
    pub fn total_cost(&self, backend: Option<&str>) -> f64 {
        match backend {
            Some(name) => self.usage.get(name).map_or(0.0, |u| u.cost),
            None => self.usage.iter().map(|entry| entry.value().cost).sum(),
        }
    }

    /// Cost per backend
    pub fn cost_by_backend(&self) -> HashMap<String, f64> {
        self.usage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().cost))
            .collect()
    }

    /// Usage per backend
    pub fn usage_by_backend(&self) -> HashMap<String, BackendUsage> {
        self.usage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
