//! Repositories for the rollup tables.
//!
//! Upserts key on `(entity, period_type, period_start)` and replace every
//! non-key field, so regenerating a period is idempotent: exactly one row
//! per key ever exists, holding the most recent write.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::analytics::{AffiliateAnalytics, PeriodType, UserAnalytics};

const USER_COLUMNS: &str = "id, user_id, period_type, period_start, period_end, total_deposits, deposit_count, \
     first_deposit_date, last_deposit_date, avg_deposit_amount, total_bets, bet_count, first_bet_date, \
     last_bet_date, avg_bet_amount, days_active, sessions_count, total_session_minutes, total_wins, \
     total_losses, net_result, cpa_qualified, cpa_qualification_date, cpa_amount, last_updated";

const AFFILIATE_COLUMNS: &str = "id, affiliate_id, period_type, period_start, period_end, total_users, new_users, \
     active_users, cpa_qualified_users, total_deposits, total_bets, total_commissions, level_1_users, \
     level_2_users, level_3_users, level_4_users, level_5_users, level_1_commissions, level_2_commissions, \
     level_3_commissions, level_4_commissions, level_5_commissions, conversion_rate, retention_rate, \
     avg_user_value, last_updated";

pub struct UserAnalyticsRepo {
    db: PgPool,
}

impl UserAnalyticsRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Insert or replace the rollup for `(user_id, period_type, period_start)`.
    ///
    /// `row.id` and `row.last_updated` are assigned by the database; the
    /// returned record carries the persisted values.
    #[instrument(skip(self, row), fields(user_id = row.user_id, period = %row.period_type), err)]
    pub async fn upsert(&self, row: &UserAnalytics) -> Result<UserAnalytics> {
        let sql = format!(
            r#"
            INSERT INTO user_analytics (
                user_id, period_type, period_start, period_end,
                total_deposits, deposit_count, first_deposit_date, last_deposit_date, avg_deposit_amount,
                total_bets, bet_count, first_bet_date, last_bet_date, avg_bet_amount,
                days_active, sessions_count, total_session_minutes,
                total_wins, total_losses, net_result,
                cpa_qualified, cpa_qualification_date, cpa_amount
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT ON CONSTRAINT user_analytics_entity_period
            DO UPDATE SET
                period_end = EXCLUDED.period_end,
                total_deposits = EXCLUDED.total_deposits,
                deposit_count = EXCLUDED.deposit_count,
                first_deposit_date = EXCLUDED.first_deposit_date,
                last_deposit_date = EXCLUDED.last_deposit_date,
                avg_deposit_amount = EXCLUDED.avg_deposit_amount,
                total_bets = EXCLUDED.total_bets,
                bet_count = EXCLUDED.bet_count,
                first_bet_date = EXCLUDED.first_bet_date,
                last_bet_date = EXCLUDED.last_bet_date,
                avg_bet_amount = EXCLUDED.avg_bet_amount,
                days_active = EXCLUDED.days_active,
                sessions_count = EXCLUDED.sessions_count,
                total_session_minutes = EXCLUDED.total_session_minutes,
                total_wins = EXCLUDED.total_wins,
                total_losses = EXCLUDED.total_losses,
                net_result = EXCLUDED.net_result,
                cpa_qualified = EXCLUDED.cpa_qualified,
                cpa_qualification_date = EXCLUDED.cpa_qualification_date,
                cpa_amount = EXCLUDED.cpa_amount,
                last_updated = now()
            RETURNING {USER_COLUMNS}
            "#
        );
        let persisted = sqlx::query_as::<_, UserAnalytics>(&sql)
            .bind(row.user_id)
            .bind(row.period_type)
            .bind(row.period_start)
            .bind(row.period_end)
            .bind(row.total_deposits)
            .bind(row.deposit_count)
            .bind(row.first_deposit_date)
            .bind(row.last_deposit_date)
            .bind(row.avg_deposit_amount)
            .bind(row.total_bets)
            .bind(row.bet_count)
            .bind(row.first_bet_date)
            .bind(row.last_bet_date)
            .bind(row.avg_bet_amount)
            .bind(row.days_active)
            .bind(row.sessions_count)
            .bind(row.total_session_minutes)
            .bind(row.total_wins)
            .bind(row.total_losses)
            .bind(row.net_result)
            .bind(row.cpa_qualified)
            .bind(row.cpa_qualification_date)
            .bind(row.cpa_amount)
            .fetch_one(&self.db)
            .await?;
        Ok(persisted)
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, user_id: i64, period_type: PeriodType, period_start: DateTime<Utc>) -> Result<Option<UserAnalytics>> {
        let row = sqlx::query_as::<_, UserAnalytics>(&format!(
            "SELECT {USER_COLUMNS} FROM user_analytics WHERE user_id = $1 AND period_type = $2 AND period_start = $3"
        ))
        .bind(user_id)
        .bind(period_type)
        .bind(period_start)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    /// How many of the given users hold a CPA-qualified rollup for the period.
    /// Used by the affiliate engine's qualified-user count.
    #[instrument(skip(self, user_ids), fields(count = user_ids.len()), err)]
    pub async fn count_cpa_qualified(
        &self,
        user_ids: &[i64],
        period_type: PeriodType,
        period_start: DateTime<Utc>,
    ) -> Result<i64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM user_analytics
            WHERE user_id = ANY($1) AND period_type = $2 AND period_start = $3 AND cpa_qualified
            "#,
        )
        .bind(user_ids)
        .bind(period_type)
        .bind(period_start)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }
}

pub struct AffiliateAnalyticsRepo {
    db: PgPool,
}

impl AffiliateAnalyticsRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Insert or replace the rollup for `(affiliate_id, period_type, period_start)`.
    #[instrument(skip(self, row), fields(affiliate_id = row.affiliate_id, period = %row.period_type), err)]
    pub async fn upsert(&self, row: &AffiliateAnalytics) -> Result<AffiliateAnalytics> {
        let sql = format!(
            r#"
            INSERT INTO affiliate_analytics (
                affiliate_id, period_type, period_start, period_end,
                total_users, new_users, active_users, cpa_qualified_users,
                total_deposits, total_bets, total_commissions,
                level_1_users, level_2_users, level_3_users, level_4_users, level_5_users,
                level_1_commissions, level_2_commissions, level_3_commissions, level_4_commissions, level_5_commissions,
                conversion_rate, retention_rate, avg_user_value
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT ON CONSTRAINT affiliate_analytics_entity_period
            DO UPDATE SET
                period_end = EXCLUDED.period_end,
                total_users = EXCLUDED.total_users,
                new_users = EXCLUDED.new_users,
                active_users = EXCLUDED.active_users,
                cpa_qualified_users = EXCLUDED.cpa_qualified_users,
                total_deposits = EXCLUDED.total_deposits,
                total_bets = EXCLUDED.total_bets,
                total_commissions = EXCLUDED.total_commissions,
                level_1_users = EXCLUDED.level_1_users,
                level_2_users = EXCLUDED.level_2_users,
                level_3_users = EXCLUDED.level_3_users,
                level_4_users = EXCLUDED.level_4_users,
                level_5_users = EXCLUDED.level_5_users,
                level_1_commissions = EXCLUDED.level_1_commissions,
                level_2_commissions = EXCLUDED.level_2_commissions,
                level_3_commissions = EXCLUDED.level_3_commissions,
                level_4_commissions = EXCLUDED.level_4_commissions,
                level_5_commissions = EXCLUDED.level_5_commissions,
                conversion_rate = EXCLUDED.conversion_rate,
                retention_rate = EXCLUDED.retention_rate,
                avg_user_value = EXCLUDED.avg_user_value,
                last_updated = now()
            RETURNING {AFFILIATE_COLUMNS}
            "#
        );
        let persisted = sqlx::query_as::<_, AffiliateAnalytics>(&sql)
            .bind(row.affiliate_id)
            .bind(row.period_type)
            .bind(row.period_start)
            .bind(row.period_end)
            .bind(row.total_users)
            .bind(row.new_users)
            .bind(row.active_users)
            .bind(row.cpa_qualified_users)
            .bind(row.total_deposits)
            .bind(row.total_bets)
            .bind(row.total_commissions)
            .bind(row.level_1_users)
            .bind(row.level_2_users)
            .bind(row.level_3_users)
            .bind(row.level_4_users)
            .bind(row.level_5_users)
            .bind(row.level_1_commissions)
            .bind(row.level_2_commissions)
            .bind(row.level_3_commissions)
            .bind(row.level_4_commissions)
            .bind(row.level_5_commissions)
            .bind(row.conversion_rate)
            .bind(row.retention_rate)
            .bind(row.avg_user_value)
            .fetch_one(&self.db)
            .await?;
        Ok(persisted)
    }

    #[instrument(skip(self), err)]
    pub async fn get(
        &self,
        affiliate_id: i64,
        period_type: PeriodType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<AffiliateAnalytics>> {
        let row = sqlx::query_as::<_, AffiliateAnalytics>(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliate_analytics WHERE affiliate_id = $1 AND period_type = $2 AND period_start = $3"
        ))
        .bind(affiliate_id)
        .bind(period_type)
        .bind(period_start)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }
}
