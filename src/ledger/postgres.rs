//! PostgreSQL ledger backend.
//!
//! Enable with the `postgres` feature flag. Each mutation is one short
//! transaction whose period row lock is held only for a single `UPDATE`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::store::{Charge, ChargeOutcome, Hold, LedgerStore, ReserveOutcome};
use super::{LedgerError, LedgerResult, StorageResultExt, check_ceiling};
use crate::budget::{DenyReason, admit};
use crate::types::{CategoryUsage, OperationType, PeriodKey, ReservationId, UsagePeriod, UserId};

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub periods_table: String,
    pub commits_table: String,
    pub reservations_table: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::with_prefix_unchecked("usage_ledger")
    }
}

impl PostgresConfig {
    fn with_prefix_unchecked(prefix: &str) -> Self {
        Self {
            periods_table: format!("{}_periods", prefix),
            commits_table: format!("{}_commits", prefix),
            reservations_table: format!("{}_reservations", prefix),
        }
    }

    /// Derive all table names from `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> LedgerResult<Self> {
        let prefix = prefix.into();
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(LedgerError::Unavailable {
                message: format!(
                    "Invalid table prefix '{}': only ASCII alphanumeric and underscore allowed",
                    prefix
                ),
            });
        }
        Ok(Self::with_prefix_unchecked(&prefix))
    }
}

enum ApplyResult {
    Applied(UsagePeriod),
    Duplicate,
    NoMatch,
}

pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    config: PostgresConfig,
}

impl PostgresLedgerStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            config: PostgresConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PostgresConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let PostgresConfig {
            periods_table: periods,
            commits_table: commits,
            reservations_table: reservations,
        } = &self.config;

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {periods} (
                    user_id VARCHAR(128) NOT NULL,
                    year INTEGER NOT NULL,
                    month INTEGER NOT NULL CHECK (month BETWEEN 1 AND 12),
                    ceiling_cents BIGINT NOT NULL CHECK (ceiling_cents > 0),
                    total_cost_cents BIGINT NOT NULL DEFAULT 0 CHECK (total_cost_cents >= 0),
                    reserved_cents BIGINT NOT NULL DEFAULT 0 CHECK (reserved_cents >= 0),
                    category_cost JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    category_count JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    limit_reached BOOLEAN NOT NULL DEFAULT FALSE,
                    limit_reached_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (user_id, year, month)
                )
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {commits} (
                    user_id VARCHAR(128) NOT NULL,
                    year INTEGER NOT NULL,
                    month INTEGER NOT NULL,
                    idempotency_key VARCHAR(255) NOT NULL,
                    operation VARCHAR(64) NOT NULL,
                    cost_cents BIGINT NOT NULL,
                    committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (user_id, year, month, idempotency_key)
                )
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {reservations} (
                    reservation_id UUID PRIMARY KEY,
                    user_id VARCHAR(128) NOT NULL,
                    year INTEGER NOT NULL,
                    month INTEGER NOT NULL,
                    operation VARCHAR(64) NOT NULL,
                    amount_cents BIGINT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{reservations}_created ON {reservations} (created_at)"
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }

    fn to_db(cents: u64) -> LedgerResult<i64> {
        i64::try_from(cents).map_err(|_| LedgerError::Corrupt {
            message: format!("{} cents does not fit a BIGINT column", cents),
        })
    }

    fn from_db(value: i64, column: &str) -> LedgerResult<u64> {
        u64::try_from(value).map_err(|_| LedgerError::Corrupt {
            message: format!("negative value {} in column {}", value, column),
        })
    }

    fn period_from_row(row: &PgRow) -> LedgerResult<UsagePeriod> {
        let user_id: String = row.try_get("user_id").storage_err()?;
        let user_id = UserId::new(user_id).map_err(|e| LedgerError::Corrupt {
            message: e.to_string(),
        })?;
        let year: i32 = row.try_get("year").storage_err()?;
        let month: i32 = row.try_get("month").storage_err()?;
        let key = PeriodKey::new(user_id, year, month as u32).map_err(|e| LedgerError::Corrupt {
            message: e.to_string(),
        })?;

        let category_cost: BTreeMap<OperationType, i64> =
            serde_json::from_value(row.try_get("category_cost").storage_err()?)?;
        let category_count: BTreeMap<OperationType, i64> =
            serde_json::from_value(row.try_get("category_count").storage_err()?)?;

        let mut categories = BTreeMap::new();
        for (op, cost) in category_cost {
            let count = category_count.get(&op).copied().unwrap_or(0);
            categories.insert(
                op,
                CategoryUsage {
                    cost_cents: Self::from_db(cost, "category_cost")?,
                    count: Self::from_db(count, "category_count")?,
                },
            );
        }

        Ok(UsagePeriod {
            key,
            ceiling_cents: Self::from_db(row.try_get("ceiling_cents").storage_err()?, "ceiling_cents")?,
            total_cost_cents: Self::from_db(
                row.try_get("total_cost_cents").storage_err()?,
                "total_cost_cents",
            )?,
            reserved_cents: Self::from_db(
                row.try_get("reserved_cents").storage_err()?,
                "reserved_cents",
            )?,
            categories,
            limit_reached: row.try_get("limit_reached").storage_err()?,
            limit_reached_at: row.try_get("limit_reached_at").storage_err()?,
            created_at: row.try_get("created_at").storage_err()?,
            updated_at: row.try_get("updated_at").storage_err()?,
        })
    }

    async fn fetch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &PeriodKey,
    ) -> LedgerResult<Option<UsagePeriod>> {
        let query = format!(
            "SELECT * FROM {} WHERE user_id = $1 AND year = $2 AND month = $3",
            self.config.periods_table
        );
        let row = sqlx::query(&query)
            .bind(key.user_id.as_str())
            .bind(key.year)
            .bind(key.month as i32)
            .fetch_optional(&mut **tx)
            .await
            .storage_err()?;
        row.as_ref().map(Self::period_from_row).transpose()
    }

    /// Drop a reservation inside `tx`, returning the amount that was held.
    async fn drop_hold(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &PeriodKey,
        reservation_id: ReservationId,
    ) -> LedgerResult<Option<i64>> {
        let query = format!(
            "DELETE FROM {} WHERE reservation_id = $1 RETURNING amount_cents",
            self.config.reservations_table
        );
        let amount: Option<i64> = sqlx::query_scalar(&query)
            .bind(reservation_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .storage_err()?;

        if let Some(amount) = amount {
            let query = format!(
                r#"
                UPDATE {} SET reserved_cents = GREATEST(reserved_cents - $4, 0), updated_at = NOW()
                WHERE user_id = $1 AND year = $2 AND month = $3
                "#,
                self.config.periods_table
            );
            sqlx::query(&query)
                .bind(key.user_id.as_str())
                .bind(key.year)
                .bind(key.month as i32)
                .bind(amount)
                .execute(&mut **tx)
                .await
                .storage_err()?;
        }
        Ok(amount)
    }

    async fn apply_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &PeriodKey,
        charge: &Charge,
    ) -> LedgerResult<ApplyResult> {
        let cost = Self::to_db(charge.cost_cents)?;

        if let Some(ref idempotency_key) = charge.idempotency_key {
            let query = format!(
                r#"
                INSERT INTO {} (user_id, year, month, idempotency_key, operation, cost_cents)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT DO NOTHING
                "#,
                self.config.commits_table
            );
            let inserted = sqlx::query(&query)
                .bind(key.user_id.as_str())
                .bind(key.year)
                .bind(key.month as i32)
                .bind(idempotency_key)
                .bind(charge.operation.as_str())
                .bind(cost)
                .execute(&mut **tx)
                .await
                .storage_err()?;
            if inserted.rows_affected() == 0 {
                return Ok(ApplyResult::Duplicate);
            }
        }

        // Increment and threshold check happen in one row update.
        let query = format!(
            r#"
            UPDATE {} SET
                total_cost_cents = total_cost_cents + $4,
                category_cost = jsonb_set(
                    category_cost, ARRAY[$5::text],
                    to_jsonb(COALESCE((category_cost ->> $5)::bigint, 0) + $4), true),
                category_count = jsonb_set(
                    category_count, ARRAY[$5::text],
                    to_jsonb(COALESCE((category_count ->> $5)::bigint, 0) + 1), true),
                limit_reached = (total_cost_cents + $4) >= ceiling_cents,
                limit_reached_at = CASE
                    WHEN (total_cost_cents + $4) >= ceiling_cents THEN NOW()
                    ELSE limit_reached_at
                END,
                updated_at = NOW()
            WHERE user_id = $1 AND year = $2 AND month = $3 AND NOT limit_reached
            RETURNING *
            "#,
            self.config.periods_table
        );
        let row = sqlx::query(&query)
            .bind(key.user_id.as_str())
            .bind(key.year)
            .bind(key.month as i32)
            .bind(cost)
            .bind(charge.operation.as_str())
            .fetch_optional(&mut **tx)
            .await
            .storage_err()?;

        match row {
            Some(row) => Ok(ApplyResult::Applied(Self::period_from_row(&row)?)),
            None => {
                if let Some(ref idempotency_key) = charge.idempotency_key {
                    let query = format!(
                        r#"
                        DELETE FROM {}
                        WHERE user_id = $1 AND year = $2 AND month = $3 AND idempotency_key = $4
                        "#,
                        self.config.commits_table
                    );
                    sqlx::query(&query)
                        .bind(key.user_id.as_str())
                        .bind(key.year)
                        .bind(key.month as i32)
                        .bind(idempotency_key)
                        .execute(&mut **tx)
                        .await
                        .storage_err()?;
                }
                Ok(ApplyResult::NoMatch)
            }
        }
    }

    /// Turn an [`ApplyResult`] into an outcome and finish the transaction.
    async fn finish_apply(
        &self,
        mut tx: Transaction<'_, Postgres>,
        key: &PeriodKey,
        result: ApplyResult,
    ) -> LedgerResult<ChargeOutcome> {
        let outcome = match result {
            ApplyResult::Applied(period) => ChargeOutcome::Applied {
                crossed_limit: period.limit_reached,
                period,
            },
            ApplyResult::Duplicate => match self.fetch(&mut tx, key).await? {
                Some(period) => ChargeOutcome::Duplicate(period),
                None => return Err(Self::not_found(key)),
            },
            ApplyResult::NoMatch => match self.fetch(&mut tx, key).await? {
                Some(period) => ChargeOutcome::Rejected(period),
                None => return Err(Self::not_found(key)),
            },
        };
        tx.commit().await.storage_err()?;
        Ok(outcome)
    }

    fn not_found(key: &PeriodKey) -> LedgerError {
        LedgerError::NotFound {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn get(&self, key: &PeriodKey) -> LedgerResult<Option<UsagePeriod>> {
        let query = format!(
            "SELECT * FROM {} WHERE user_id = $1 AND year = $2 AND month = $3",
            self.config.periods_table
        );
        let row = sqlx::query(&query)
            .bind(key.user_id.as_str())
            .bind(key.year)
            .bind(key.month as i32)
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;
        row.as_ref().map(Self::period_from_row).transpose()
    }

    async fn create_if_absent(
        &self,
        key: &PeriodKey,
        ceiling_cents: u64,
    ) -> LedgerResult<UsagePeriod> {
        check_ceiling(key, ceiling_cents)?;
        let query = format!(
            r#"
            INSERT INTO {} (user_id, year, month, ceiling_cents)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, year, month) DO NOTHING
            "#,
            self.config.periods_table
        );
        sqlx::query(&query)
            .bind(key.user_id.as_str())
            .bind(key.year)
            .bind(key.month as i32)
            .bind(Self::to_db(ceiling_cents)?)
            .execute(&*self.pool)
            .await
            .storage_err()?;

        self.get(key).await?.ok_or_else(|| Self::not_found(key))
    }

    async fn apply_charge(&self, key: &PeriodKey, charge: &Charge) -> LedgerResult<ChargeOutcome> {
        let mut tx = self.pool.begin().await.storage_err()?;
        let result = self.apply_in(&mut tx, key, charge).await?;
        self.finish_apply(tx, key, result).await
    }

    async fn reserve(&self, key: &PeriodKey, hold: &Hold) -> LedgerResult<ReserveOutcome> {
        let amount = Self::to_db(hold.amount_cents)?;
        let mut tx = self.pool.begin().await.storage_err()?;

        let query = format!(
            r#"
            INSERT INTO {} (reservation_id, user_id, year, month, operation, amount_cents)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (reservation_id) DO NOTHING
            "#,
            self.config.reservations_table
        );
        let inserted = sqlx::query(&query)
            .bind(hold.reservation_id.as_uuid())
            .bind(key.user_id.as_str())
            .bind(key.year)
            .bind(key.month as i32)
            .bind(hold.operation.as_str())
            .bind(amount)
            .execute(&mut *tx)
            .await
            .storage_err()?;

        if inserted.rows_affected() == 0 {
            let period = self.fetch(&mut tx, key).await?.ok_or_else(|| Self::not_found(key))?;
            tx.commit().await.storage_err()?;
            return Ok(ReserveOutcome::Granted(period));
        }

        let query = format!(
            r#"
            UPDATE {} SET reserved_cents = reserved_cents + $4, updated_at = NOW()
            WHERE user_id = $1 AND year = $2 AND month = $3
              AND NOT limit_reached
              AND total_cost_cents + reserved_cents + $4 <= ceiling_cents
            RETURNING *
            "#,
            self.config.periods_table
        );
        let row = sqlx::query(&query)
            .bind(key.user_id.as_str())
            .bind(key.year)
            .bind(key.month as i32)
            .bind(amount)
            .fetch_optional(&mut *tx)
            .await
            .storage_err()?;

        match row {
            Some(row) => {
                let period = Self::period_from_row(&row)?;
                tx.commit().await.storage_err()?;
                Ok(ReserveOutcome::Granted(period))
            }
            None => {
                let period = self.fetch(&mut tx, key).await?;
                tx.rollback().await.storage_err()?;
                let period = period.ok_or_else(|| Self::not_found(key))?;
                let reason = admit(&period, hold.amount_cents)
                    .deny_reason()
                    .unwrap_or(DenyReason::WouldExceed);
                Ok(ReserveOutcome::Denied { period, reason })
            }
        }
    }

    async fn settle(
        &self,
        key: &PeriodKey,
        reservation_id: ReservationId,
        charge: &Charge,
    ) -> LedgerResult<ChargeOutcome> {
        let mut tx = self.pool.begin().await.storage_err()?;
        self.drop_hold(&mut tx, key, reservation_id).await?;
        let result = self.apply_in(&mut tx, key, charge).await?;
        self.finish_apply(tx, key, result).await
    }

    async fn release(&self, key: &PeriodKey, reservation_id: ReservationId) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await.storage_err()?;
        let released = self.drop_hold(&mut tx, key, reservation_id).await?;
        tx.commit().await.storage_err()?;
        Ok(released.is_some())
    }

    async fn release_expired(&self, older_than: DateTime<Utc>) -> LedgerResult<usize> {
        let query = format!(
            r#"
            WITH expired AS (
                DELETE FROM {reservations} WHERE created_at < $1
                RETURNING user_id, year, month, amount_cents
            ),
            totals AS (
                SELECT user_id, year, month, SUM(amount_cents)::BIGINT AS amount
                FROM expired GROUP BY user_id, year, month
            ),
            adjusted AS (
                UPDATE {periods} p
                SET reserved_cents = GREATEST(p.reserved_cents - t.amount, 0), updated_at = NOW()
                FROM totals t
                WHERE p.user_id = t.user_id AND p.year = t.year AND p.month = t.month
            )
            SELECT COUNT(*) FROM expired
            "#,
            reservations = self.config.reservations_table,
            periods = self.config.periods_table,
        );
        let released: i64 = sqlx::query_scalar(&query)
            .bind(older_than)
            .fetch_one(&*self.pool)
            .await
            .storage_err()?;
        Ok(released as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_prefix_validation() {
        let config = PostgresConfig::prefix("fitness_usage").unwrap();
        assert_eq!(config.periods_table, "fitness_usage_periods");
        assert_eq!(config.reservations_table, "fitness_usage_reservations");

        assert!(PostgresConfig::prefix("usage; DROP TABLE x").is_err());
        assert!(PostgresConfig::prefix("").is_err());
    }

    #[test]
    fn test_cents_conversion_bounds() {
        assert_eq!(PostgresLedgerStore::to_db(250).unwrap(), 250);
        assert!(PostgresLedgerStore::to_db(u64::MAX).is_err());
        assert!(PostgresLedgerStore::from_db(-1, "total_cost_cents").is_err());
    }

    #[tokio::test]
    async fn test_zero_ceiling_rejected_before_query() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost:1/usage")
            .unwrap();
        let store = PostgresLedgerStore::with_pool(Arc::new(pool));
        let key = PeriodKey::new(crate::types::UserId::new("user-1").unwrap(), 2026, 5).unwrap();

        let err = store.create_if_absent(&key, 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCeiling { .. }));
    }
}
