//! Multi-period spend accounting with pre-admission gating and post-facto disable.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use dashmap::DashMap;

use crate::error::BudgetError;
use crate::types::{BudgetCap, BudgetSpending, PeriodType};

/// Result of a pre-admission [`BudgetStore::check_budget`] call.
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub current_spending: f64,
    /// `f64::INFINITY` when no cap rows exist for the scope.
    pub budget_cap: f64,
    pub percent_used: f64,
}

/// Persistence surface for budget caps and spend accounting.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn caps_for(&self, provider_id: &str, model_id: Option<&str>) -> Vec<BudgetCap>;

    /// Read (or lazily create with zero spend) the active spending row for a scope/period.
    async fn active_spending(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
    ) -> BudgetSpending;

    /// Atomically add `amount` to the active row's `current_spend`.
    async fn increment_spend(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
        amount: f64,
    ) -> Result<(), BudgetError>;

    /// Mark the active row for a scope/period as disabled.
    async fn set_disabled(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
        disabled: bool,
    ) -> Result<(), BudgetError>;

    async fn put_cap(&self, cap: BudgetCap);

    /// §4.5 `resetBudgetPeriod`: rotate the scope's window — compute the
    /// fresh `[periodStart, periodEnd)` bounds containing `now` and upsert a
    /// zeroed, non-disabled row for them, superseding whatever row currently
    /// covers `now`.
    async fn reset_budget_period(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError>;
}

/// Bounds for a period containing `now`, per the boundary policy in §4.5:
/// daily = local midnight to next midnight; weekly starts Sunday 00:00; monthly
/// spans the calendar month. All computed in UTC (no locale sensitivity, per §9).
#[must_use]
pub fn period_bounds(period_type: PeriodType, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("valid time");
    match period_type {
        PeriodType::Daily => {
            let start = Utc.from_utc_datetime(&now.date_naive().and_time(midnight));
            (start, start + ChronoDuration::days(1))
        }
        PeriodType::Weekly => {
            let days_since_sunday = now.weekday().num_days_from_sunday();
            let start_date = now.date_naive() - ChronoDuration::days(i64::from(days_since_sunday));
            let start = Utc.from_utc_datetime(&start_date.and_time(midnight));
            (start, start + ChronoDuration::days(7))
        }
        PeriodType::Monthly => {
            let first_of_month = now.date_naive().with_day(1).expect("day 1 always valid");
            let start = Utc.from_utc_datetime(&first_of_month.and_time(midnight));
            let next_month = if now.month() == 12 {
                Utc.from_utc_datetime(
                    &first_of_month
                        .with_year(now.year() + 1)
                        .and_then(|d| d.with_month(1))
                        .expect("valid date")
                        .and_time(midnight),
                )
            } else {
                Utc.from_utc_datetime(
                    &first_of_month
                        .with_month(now.month() + 1)
                        .expect("valid date")
                        .and_time(midnight),
                )
            };
            (start, next_month)
        }
    }
}

fn scope_cap_limit(cap: &BudgetCap, period_type: PeriodType) -> Option<f64> {
    match period_type {
        PeriodType::Daily => cap.daily_limit,
        PeriodType::Weekly => cap.weekly_limit,
        PeriodType::Monthly => cap.monthly_limit,
    }
}

/// Drives pre-admission checks and spend accounting against a [`BudgetStore`].
pub struct BudgetEnforcer<S: BudgetStore> {
    store: S,
}

impl<S: BudgetStore> BudgetEnforcer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// §4.5 `checkBudget`: evaluates every non-null-limit cap row for both the
    /// model-specific and model-agnostic scopes independently (Open Question
    /// 1 in DESIGN.md) and denies on the first that would be exceeded.
    pub async fn check_budget(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        estimated_cost: f64,
    ) -> BudgetCheck {
        let now = Utc::now();
        let mut caps = self.store.caps_for(provider_id, model_id).await;
        if model_id.is_some() {
            caps.extend(self.store.caps_for(provider_id, None).await);
        }

        if caps.is_empty() {
            return BudgetCheck {
                allowed: true,
                reason: None,
                current_spending: 0.0,
                budget_cap: f64::INFINITY,
                percent_used: 0.0,
            };
        }

        let mut worst: Option<BudgetCheck> = None;
        for cap in &caps {
            for period in [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly] {
                let Some(limit) = scope_cap_limit(cap, period) else {
                    continue;
                };
                let spending = self
                    .store
                    .active_spending(provider_id, cap.model_id.as_deref(), period, now)
                    .await;
                let percent_used = if limit > 0.0 {
                    (spending.current_spend / limit) * 100.0
                } else {
                    100.0
                };
                if spending.current_spend + estimated_cost > limit {
                    let _ = self
                        .store
                        .set_disabled(provider_id, cap.model_id.as_deref(), period, now, true)
                        .await;
                    return BudgetCheck {
                        allowed: false,
                        reason: Some(format!("Would exceed {period} budget cap of {limit}")),
                        current_spending: spending.current_spend,
                        budget_cap: limit,
                        percent_used,
                    };
                }
                if worst.is_none() {
                    worst = Some(BudgetCheck {
                        allowed: true,
                        reason: None,
                        current_spending: spending.current_spend,
                        budget_cap: limit,
                        percent_used,
                    });
                }
            }
        }

        worst.unwrap_or(BudgetCheck {
            allowed: true,
            reason: None,
            current_spending: 0.0,
            budget_cap: f64::INFINITY,
            percent_used: 0.0,
        })
    }

    /// §4.5 `recordSpending`: atomically increments every period's active row.
    pub async fn record_spending(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        actual_cost: f64,
    ) -> Result<(), BudgetError> {
        let now = Utc::now();
        for period in [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly] {
            self.store
                .increment_spend(provider_id, model_id, period, now, actual_cost)
                .await?;
        }
        Ok(())
    }

    pub async fn is_disabled(&self, provider_id: &str, model_id: Option<&str>) -> bool {
        let now = Utc::now();
        for period in [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly] {
            if self
                .store
                .active_spending(provider_id, model_id, period, now)
                .await
                .disabled
            {
                return true;
            }
        }
        false
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// §4.5 `resetBudgetPeriod`: rotate `period_type` for a single
    /// `(provider_id, model_id)` scope. Callers that manage a set of
    /// configured caps invoke this once per scope when that period's window
    /// rolls over (e.g. a daily-rotation job calling it for every cap at
    /// local midnight).
    pub async fn reset_budget_period(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
    ) -> Result<(), BudgetError> {
        let now = Utc::now();
        self.store.reset_budget_period(provider_id, model_id, period_type, now).await
    }
}

struct ScopeState {
    rows: Vec<BudgetSpending>,
}

/// In-memory [`BudgetStore`]; the default and what the test suite exercises.
/// Concurrent scope and cap state is `DashMap`-backed rather than
/// `Mutex`-wrapped, matching the teacher's use of `dashmap` for shared
/// in-memory maps accessed from many concurrent tasks.
#[derive(Default)]
pub struct InMemoryBudgetStore {
    caps: DashMap<(String, Option<String>), Vec<BudgetCap>>,
    scopes: DashMap<(String, Option<String>, PeriodType), ScopeState>,
}

impl InMemoryBudgetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(provider_id: &str, model_id: Option<&str>, period_type: PeriodType) -> (String, Option<String>, PeriodType) {
        (provider_id.to_string(), model_id.map(str::to_string), period_type)
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn caps_for(&self, provider_id: &str, model_id: Option<&str>) -> Vec<BudgetCap> {
        let key = (provider_id.to_string(), model_id.map(str::to_string));
        self.caps.get(&key).map(|caps| caps.clone()).unwrap_or_default()
    }

    async fn active_spending(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
    ) -> BudgetSpending {
        let key = Self::key(provider_id, model_id, period_type);
        let mut state = self.scopes.entry(key).or_insert_with(|| ScopeState { rows: Vec::new() });

        if let Some(row) = state.rows.iter().find(|r| r.is_active_at(now)) {
            return row.clone();
        }

        let (period_start, period_end) = period_bounds(period_type, now);
        let row = BudgetSpending {
            provider_id: provider_id.to_string(),
            model_id: model_id.map(str::to_string),
            period_type,
            period_start,
            period_end,
            current_spend: 0.0,
            disabled: false,
        };
        state.rows.push(row.clone());
        row
    }

    async fn increment_spend(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
        amount: f64,
    ) -> Result<(), BudgetError> {
        drop(self.active_spending(provider_id, model_id, period_type, now).await);
        let key = Self::key(provider_id, model_id, period_type);
        if let Some(mut state) = self.scopes.get_mut(&key) {
            if let Some(row) = state.rows.iter_mut().find(|r| r.is_active_at(now)) {
                row.current_spend += amount;
            }
        }
        Ok(())
    }

    async fn set_disabled(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
        disabled: bool,
    ) -> Result<(), BudgetError> {
        drop(self.active_spending(provider_id, model_id, period_type, now).await);
        let key = Self::key(provider_id, model_id, period_type);
        if let Some(mut state) = self.scopes.get_mut(&key) {
            if let Some(row) = state.rows.iter_mut().find(|r| r.is_active_at(now)) {
                row.disabled = disabled;
            }
        }
        Ok(())
    }

    async fn put_cap(&self, cap: BudgetCap) {
        let key = (cap.provider_id.clone(), cap.model_id.clone());
        self.caps.entry(key).or_insert_with(Vec::new).push(cap);
    }

    async fn reset_budget_period(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError> {
        let key = Self::key(provider_id, model_id, period_type);
        let (period_start, period_end) = period_bounds(period_type, now);
        let mut state = self.scopes.entry(key).or_insert_with(|| ScopeState { rows: Vec::new() });
        state.rows.retain(|r| !r.is_active_at(now));
        state.rows.push(BudgetSpending {
            provider_id: provider_id.to_string(),
            model_id: model_id.map(str::to_string),
            period_type,
            period_start,
            period_end,
            current_spend: 0.0,
            disabled: false,
        });
        Ok(())
    }
}
