//! Postgres-backed [`BudgetStore`] for multi-process spend accounting.
//!
//! Grounded on `dashflow-postgres-checkpointer`: a `tokio_postgres::Client`
//! held alongside a spawned connection task, table auto-creation on
//! construction, and a `validate_identifier` guard on the one
//! caller-supplied SQL identifier (the table name). The accounting
//! structure itself (one row per `(provider, model?, period)` scope) is
//! grounded on `council-core::budget::InMemoryBudgetStore`, with upserts
//! doing the job that struct does with a `Mutex<HashMap<...>>`: Postgres's
//! `NULL <> NULL` semantics make `model_id` unsuitable as a `NULL`-able
//! unique-constraint column, so the model-agnostic scope is stored under
//! the sentinel empty string instead and translated at the API boundary.

mod error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

use council_core::budget::{period_bounds, BudgetStore};
use council_core::error::BudgetError;
use council_core::types::{BudgetCap, BudgetSpending, PeriodType};

pub use error::{Error as PostgresStoreError, Result};

fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(error::Error::InvalidIdentifier("identifier cannot be empty".to_string()));
    }
    if name.len() > 63 {
        return Err(error::Error::InvalidIdentifier(format!(
            "identifier '{name}' exceeds maximum length of 63 characters"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().expect("checked non-empty above");
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(error::Error::InvalidIdentifier(format!(
            "identifier '{name}' must start with a letter or underscore"
        )));
    }
    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(error::Error::InvalidIdentifier(format!(
                "identifier '{name}' contains invalid character '{c}'"
            )));
        }
    }
    Ok(())
}

/// Sentinel stored in place of `NULL` for the model-agnostic scope.
const MODEL_AGNOSTIC: &str = "";

fn model_column(model_id: Option<&str>) -> &str {
    model_id.unwrap_or(MODEL_AGNOSTIC)
}

fn model_option(model_id: &str) -> Option<String> {
    if model_id.is_empty() { None } else { Some(model_id.to_string()) }
}

fn period_column(period_type: PeriodType) -> &'static str {
    match period_type {
        PeriodType::Daily => "daily",
        PeriodType::Weekly => "weekly",
        PeriodType::Monthly => "monthly",
    }
}

fn period_from_column(s: &str) -> PeriodType {
    match s {
        "weekly" => PeriodType::Weekly,
        "monthly" => PeriodType::Monthly,
        _ => PeriodType::Daily,
    }
}

/// A [`BudgetStore`] backed by two Postgres tables: one for configured caps,
/// one for per-period spend accounting.
pub struct PostgresBudgetStore {
    client: tokio_postgres::Client,
    caps_table: String,
    spending_table: String,
}

impl PostgresBudgetStore {
    /// Connect and create the default `council_budget_caps`/`council_budget_spending` tables.
    pub async fn new(connection_string: &str) -> Result<Self> {
        Self::with_table_names(connection_string, "council_budget_caps", "council_budget_spending").await
    }

    /// Connect and create tables named `caps_table`/`spending_table`.
    pub async fn with_table_names(connection_string: &str, caps_table: &str, spending_table: &str) -> Result<Self> {
        validate_identifier(caps_table)?;
        validate_identifier(spending_table)?;

        info!("connecting to postgres budget store");
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });

        let store = Self { client, caps_table: caps_table.to_string(), spending_table: spending_table.to_string() };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {caps} (
                provider_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                daily_limit DOUBLE PRECISION,
                weekly_limit DOUBLE PRECISION,
                monthly_limit DOUBLE PRECISION,
                PRIMARY KEY (provider_id, model_id)
            );
            CREATE TABLE IF NOT EXISTS {spending} (
                provider_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                period_type TEXT NOT NULL,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL,
                current_spend DOUBLE PRECISION NOT NULL DEFAULT 0,
                disabled BOOLEAN NOT NULL DEFAULT false,
                PRIMARY KEY (provider_id, model_id, period_type, period_start)
            );
            ",
            caps = self.caps_table,
            spending = self.spending_table,
        );
        self.client.batch_execute(&sql).await?;
        debug!("postgres budget schema initialized");
        Ok(())
    }

    fn row_to_spending(row: &tokio_postgres::Row) -> BudgetSpending {
        let provider_id: String = row.get("provider_id");
        let model_id: String = row.get("model_id");
        let period_type: String = row.get("period_type");
        let period_start: DateTime<Utc> = row.get("period_start");
        let period_end: DateTime<Utc> = row.get("period_end");
        let current_spend: f64 = row.get("current_spend");
        let disabled: bool = row.get("disabled");
        BudgetSpending {
            provider_id,
            model_id: model_option(&model_id),
            period_type: period_from_column(&period_type),
            period_start,
            period_end,
            current_spend,
            disabled,
        }
    }
}

#[async_trait]
impl BudgetStore for PostgresBudgetStore {
    async fn caps_for(&self, provider_id: &str, model_id: Option<&str>) -> Vec<BudgetCap> {
        let sql = format!(
            "SELECT provider_id, model_id, daily_limit, weekly_limit, monthly_limit FROM {} WHERE provider_id = $1 AND model_id = $2",
            self.caps_table
        );
        let rows = match self.client.query(&sql, &[&provider_id, &model_column(model_id)]).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("failed to load budget caps: {e}");
                return Vec::new();
            }
        };
        rows.iter()
            .map(|row| BudgetCap {
                provider_id: row.get("provider_id"),
                model_id: model_option(&row.get::<_, String>("model_id")),
                daily_limit: row.get("daily_limit"),
                weekly_limit: row.get("weekly_limit"),
                monthly_limit: row.get("monthly_limit"),
            })
            .collect()
    }

    async fn active_spending(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
    ) -> BudgetSpending {
        let select_sql = format!(
            "SELECT provider_id, model_id, period_type, period_start, period_end, current_spend, disabled
             FROM {} WHERE provider_id = $1 AND model_id = $2 AND period_type = $3 AND period_start <= $4 AND period_end > $4",
            self.spending_table
        );
        if let Ok(rows) = self
            .client
            .query(&select_sql, &[&provider_id, &model_column(model_id), &period_column(period_type), &now])
            .await
        {
            if let Some(row) = rows.first() {
                return Self::row_to_spending(row);
            }
        }

        let (period_start, period_end) = period_bounds(period_type, now);
        let insert_sql = format!(
            "INSERT INTO {} (provider_id, model_id, period_type, period_start, period_end, current_spend, disabled)
             VALUES ($1, $2, $3, $4, $5, 0, false)
             ON CONFLICT (provider_id, model_id, period_type, period_start) DO NOTHING",
            self.spending_table
        );
        let _ = self
            .client
            .execute(&insert_sql, &[&provider_id, &model_column(model_id), &period_column(period_type), &period_start, &period_end])
            .await;

        BudgetSpending {
            provider_id: provider_id.to_string(),
            model_id: model_id.map(str::to_string),
            period_type,
            period_start,
            period_end,
            current_spend: 0.0,
            disabled: false,
        }
    }

    async fn increment_spend(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
        amount: f64,
    ) -> std::result::Result<(), BudgetError> {
        let (period_start, period_end) = period_bounds(period_type, now);
        let sql = format!(
            "INSERT INTO {} (provider_id, model_id, period_type, period_start, period_end, current_spend, disabled)
             VALUES ($1, $2, $3, $4, $5, $6, false)
             ON CONFLICT (provider_id, model_id, period_type, period_start)
             DO UPDATE SET current_spend = {table}.current_spend + EXCLUDED.current_spend",
            self.spending_table,
            table = self.spending_table,
        );
        self.client
            .execute(&sql, &[&provider_id, &model_column(model_id), &period_column(period_type), &period_start, &period_end, &amount])
            .await
            .map_err(|e| BudgetError::from(error::Error::from(e)))?;
        Ok(())
    }

    async fn set_disabled(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
        disabled: bool,
    ) -> std::result::Result<(), BudgetError> {
        let (period_start, period_end) = period_bounds(period_type, now);
        let sql = format!(
            "INSERT INTO {} (provider_id, model_id, period_type, period_start, period_end, current_spend, disabled)
             VALUES ($1, $2, $3, $4, $5, 0, $6)
             ON CONFLICT (provider_id, model_id, period_type, period_start)
             DO UPDATE SET disabled = EXCLUDED.disabled",
            self.spending_table
        );
        self.client
            .execute(&sql, &[&provider_id, &model_column(model_id), &period_column(period_type), &period_start, &period_end, &disabled])
            .await
            .map_err(|e| BudgetError::from(error::Error::from(e)))?;
        Ok(())
    }

    async fn put_cap(&self, cap: BudgetCap) {
        let sql = format!(
            "INSERT INTO {} (provider_id, model_id, daily_limit, weekly_limit, monthly_limit)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (provider_id, model_id) DO UPDATE SET
                 daily_limit = EXCLUDED.daily_limit,
                 weekly_limit = EXCLUDED.weekly_limit,
                 monthly_limit = EXCLUDED.monthly_limit",
            self.caps_table
        );
        if let Err(e) = self
            .client
            .execute(&sql, &[&cap.provider_id, &model_column(cap.model_id.as_deref()), &cap.daily_limit, &cap.weekly_limit, &cap.monthly_limit])
            .await
        {
            error!("failed to upsert budget cap: {e}");
        }
    }

    async fn reset_budget_period(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
        period_type: PeriodType,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), BudgetError> {
        let (period_start, period_end) = period_bounds(period_type, now);
        let sql = format!(
            "INSERT INTO {} (provider_id, model_id, period_type, period_start, period_end, current_spend, disabled)
             VALUES ($1, $2, $3, $4, $5, 0, false)
             ON CONFLICT (provider_id, model_id, period_type, period_start)
             DO UPDATE SET current_spend = 0, disabled = false",
            self.spending_table
        );
        self.client
            .execute(&sql, &[&provider_id, &model_column(model_id), &period_column(period_type), &period_start, &period_end])
            .await
            .map_err(|e| BudgetError::from(error::Error::from(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_identifier_accepts_standard_table_names() {
        assert!(validate_identifier("council_budget_caps").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn validate_identifier_rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn validate_identifier_rejects_sql_injection_attempt() {
        assert!(validate_identifier("x; DROP TABLE users; --").is_err());
    }

    #[test]
    fn validate_identifier_rejects_leading_digit() {
        assert!(validate_identifier("1table").is_err());
    }

    #[test]
    fn model_column_and_model_option_round_trip_through_sentinel() {
        assert_eq!(model_column(None), MODEL_AGNOSTIC);
        assert_eq!(model_column(Some("gpt-4")), "gpt-4");
        assert_eq!(model_option(MODEL_AGNOSTIC), None);
        assert_eq!(model_option("gpt-4"), Some("gpt-4".to_string()));
    }

    #[test]
    fn period_column_round_trips_through_all_variants() {
        for period in [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly] {
            assert_eq!(period_from_column(period_column(period)), period);
        }
    }

    #[tokio::test]
    #[ignore = "requires a postgres server"]
    async fn caps_round_trip_through_put_and_get() {
        let store = PostgresBudgetStore::new("host=localhost user=postgres password=postgres dbname=postgres")
            .await
            .unwrap();
        store
            .put_cap(BudgetCap {
                provider_id: "openai".to_string(),
                model_id: Some("gpt-4".to_string()),
                daily_limit: Some(100.0),
                weekly_limit: None,
                monthly_limit: None,
            })
            .await;
        let caps = store.caps_for("openai", Some("gpt-4")).await;
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].daily_limit, Some(100.0));
    }

    #[tokio::test]
    #[ignore = "requires a postgres server"]
    async fn concurrent_increments_accumulate_without_lost_updates() {
        let store = PostgresBudgetStore::new("host=localhost user=postgres password=postgres dbname=postgres")
            .await
            .unwrap();
        let now = Utc::now();
        for _ in 0..5 {
            store.increment_spend("anthropic", None, PeriodType::Daily, now, 10.0).await.unwrap();
        }
        let spending = store.active_spending("anthropic", None, PeriodType::Daily, now).await;
        assert_eq!(spending.current_spend, 50.0);
    }
}
