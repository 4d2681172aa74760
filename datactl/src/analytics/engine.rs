//! Per-user and per-affiliate rollup generation.
//!
//! The engine fetches the raw rows for a period window from the source,
//! folds them into the metric groups, and upserts the rollup keyed by
//! `(entity, period_type, period_start)`. Generation is idempotent: running
//! it twice for the same key leaves exactly one row holding the latest
//! computation.
//!
//! Session metrics and the affiliate performance joins are documented
//! placeholder estimates pending real session tracking; see the named
//! functions below.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::analytics::cpa::{CpaLevelAmounts, CpaMetrics, CpaRuleSet};
use crate::analytics::period::{Period, PeriodType, resolve};
use crate::db::handlers::analytics::{AffiliateAnalyticsRepo, UserAnalyticsRepo};
use crate::db::models::analytics::{AffiliateAnalytics, UserAnalytics};
use crate::errors::{Error, Result};
use crate::etl::extract::SourceReader;
use crate::etl::value::Record;
use crate::provider::ConfigProvider;

// Source-side tables and columns the engine aggregates over.
const SOURCE_USERS: &str = "users";
const SOURCE_DEPOSITS: &str = "deposits";
const SOURCE_BETS: &str = "bets";
const SOURCE_TRANSACTIONS: &str = "transactions";
const USER_KEY: &str = "user_id";
const CREATED_AT: &str = "created_at";

pub struct AnalyticsEngine {
    reader: SourceReader,
    users: UserAnalyticsRepo,
    affiliates: AffiliateAnalyticsRepo,
    provider: Arc<dyn ConfigProvider>,
}

impl AnalyticsEngine {
    pub fn new(
        reader: SourceReader,
        users: UserAnalyticsRepo,
        affiliates: AffiliateAnalyticsRepo,
        provider: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            reader,
            users,
            affiliates,
            provider,
        }
    }

    /// Compute and upsert the rollup for one user and period. Returns `None`
    /// when the user does not exist in the source.
    #[instrument(skip(self), err)]
    pub async fn generate_user_analytics(
        &self,
        user_id: i64,
        period_type: PeriodType,
        reference: Option<DateTime<Utc>>,
    ) -> Result<Option<UserAnalytics>> {
        let period = resolve(period_type, reference.unwrap_or_else(Utc::now));

        let Some(_user) = self.reader.fetch_row(SOURCE_USERS, "id", user_id).await? else {
            return Ok(None);
        };

        let keys = [user_id];
        let deposits = self
            .reader
            .read_window(SOURCE_DEPOSITS, USER_KEY, &keys, CREATED_AT, period.start, period.end)
            .await?;
        let bets = self
            .reader
            .read_window(SOURCE_BETS, USER_KEY, &keys, CREATED_AT, period.start, period.end)
            .await?;
        let transactions = self
            .reader
            .read_window(SOURCE_TRANSACTIONS, USER_KEY, &keys, CREATED_AT, period.start, period.end)
            .await?;

        let rules = self.provider.cpa_validation_rules().await;
        let amounts = self.provider.cpa_level_amounts().await;

        let row = build_user_rollup(
            user_id,
            period,
            &deposits,
            &bets,
            &transactions,
            &rules,
            &amounts,
            Utc::now(),
        )?;
        let persisted = self.users.upsert(&row).await?;
        info!(
            user_id,
            period = %period_type,
            deposits = persisted.deposit_count,
            bets = persisted.bet_count,
            cpa_qualified = persisted.cpa_qualified,
            "user rollup upserted"
        );
        Ok(Some(persisted))
    }

    /// Compute and upsert the rollup for one affiliate and period. Returns
    /// `None` when the affiliate does not exist in the source.
    #[instrument(skip(self), err)]
    pub async fn generate_affiliate_analytics(
        &self,
        affiliate_id: i64,
        period_type: PeriodType,
        reference: Option<DateTime<Utc>>,
    ) -> Result<Option<AffiliateAnalytics>> {
        let period = resolve(period_type, reference.unwrap_or_else(Utc::now));

        let Some(_affiliate) = self.reader.fetch_row(SOURCE_USERS, "id", affiliate_id).await? else {
            return Ok(None);
        };

        let downline = self.reader.fetch_rows(SOURCE_USERS, "affiliate_id", affiliate_id).await?;
        let user_ids: Vec<i64> = downline.iter().filter_map(|row| row.get("id")?.as_i64()).collect();

        let deposits = self
            .reader
            .read_window(SOURCE_DEPOSITS, USER_KEY, &user_ids, CREATED_AT, period.start, period.end)
            .await?;
        let bets = self
            .reader
            .read_window(SOURCE_BETS, USER_KEY, &user_ids, CREATED_AT, period.start, period.end)
            .await?;
        let transactions = self
            .reader
            .read_window(SOURCE_TRANSACTIONS, USER_KEY, &user_ids, CREATED_AT, period.start, period.end)
            .await?;

        let active_ids: HashSet<i64> = bets
            .iter()
            .chain(transactions.iter())
            .filter_map(|row| row.get(USER_KEY)?.as_i64())
            .collect();
        let cpa_qualified = self
            .users
            .count_cpa_qualified(&user_ids, period_type, period.start)
            .await?;
        let amounts = self.provider.cpa_level_amounts().await;

        let row = build_affiliate_rollup(
            affiliate_id,
            period,
            &downline,
            &active_ids,
            cpa_qualified,
            sum_amounts(&deposits, "amount"),
            sum_amounts(&bets, "amount"),
            &amounts,
        )?;
        let persisted = self.affiliates.upsert(&row).await?;
        info!(
            affiliate_id,
            period = %period_type,
            users = persisted.total_users,
            active = persisted.active_users,
            "affiliate rollup upserted"
        );
        Ok(Some(persisted))
    }
}

/// Fold the window rows into a user rollup. Pure: all inputs come from the
/// caller, including the clock.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_user_rollup(
    user_id: i64,
    period: Period,
    deposits: &[Record],
    bets: &[Record],
    transactions: &[Record],
    rules: &CpaRuleSet,
    amounts: &CpaLevelAmounts,
    now: DateTime<Utc>,
) -> Result<UserAnalytics> {
    let deposit_series = summarize(deposits, "amount", CREATED_AT);
    let bet_series = summarize(bets, "amount", CREATED_AT);

    let days_active = activity_days(transactions, bets);
    let total_activity = transactions.len() + bets.len();
    // Placeholder session estimates: one session per ten activity events,
    // five minutes per event. To be replaced by real session tracking.
    let sessions_count = total_activity.div_ceil(10);
    let total_session_minutes = total_activity * 5;

    let total_wins: Decimal = bets
        .iter()
        .filter(|row| result_is(row, "win"))
        .filter_map(|row| row.get("win_amount")?.as_decimal())
        .sum();
    let total_losses: Decimal = bets
        .iter()
        .filter(|row| result_is(row, "loss"))
        .filter_map(|row| row.get("amount")?.as_decimal())
        .sum();

    let metrics = CpaMetrics {
        total_deposits: deposit_series.total,
        bet_count: bet_series.count as u32,
        total_bets: bet_series.total,
        days_active: days_active as u32,
    };
    let cpa_qualified = rules.evaluate(&metrics);

    let row = UserAnalytics {
        id: Uuid::nil(), // assigned by the database on insert
        user_id,
        period_type: period.period_type,
        period_start: period.start,
        period_end: period.end,
        total_deposits: deposit_series.total,
        deposit_count: deposit_series.count as i32,
        first_deposit_date: deposit_series.first,
        last_deposit_date: deposit_series.last,
        avg_deposit_amount: deposit_series.average(),
        total_bets: bet_series.total,
        bet_count: bet_series.count as i32,
        first_bet_date: bet_series.first,
        last_bet_date: bet_series.last,
        avg_bet_amount: bet_series.average(),
        days_active: days_active as i32,
        sessions_count: sessions_count as i32,
        total_session_minutes: total_session_minutes as i32,
        total_wins,
        total_losses,
        net_result: total_wins - total_losses,
        cpa_qualified,
        cpa_qualification_date: cpa_qualified.then_some(now),
        cpa_amount: if cpa_qualified { amounts.level_1 } else { Decimal::ZERO },
        last_updated: now,
    };
    validate_user_rollup(&row)?;
    Ok(row)
}

/// Fold the downline into an affiliate rollup. The level commissions are
/// placeholder estimates (level population times the configured payout);
/// real commission joins replace this once the payout ledger is specified.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_affiliate_rollup(
    affiliate_id: i64,
    period: Period,
    downline: &[Record],
    active_ids: &HashSet<i64>,
    cpa_qualified_users: i64,
    total_deposits: Decimal,
    total_bets: Decimal,
    amounts: &CpaLevelAmounts,
) -> Result<AffiliateAnalytics> {
    let total_users = downline.len() as i64;
    let new_users = downline
        .iter()
        .filter(|row| {
            row.get(CREATED_AT)
                .and_then(|v| v.as_timestamp())
                .is_some_and(|t| t >= period.start && t <= period.end)
        })
        .count() as i64;

    let mut level_users = [0i32; 5];
    for row in downline {
        if let Some(level) = row.get("mlm_level").and_then(|v| v.as_i64()) {
            if (1..=5).contains(&level) {
                level_users[(level - 1) as usize] += 1;
            }
        }
    }
    let level_commissions: Vec<Decimal> = (1..=5u8)
        .map(|level| amounts.for_level(level) * Decimal::from(level_users[(level - 1) as usize]))
        .collect();
    let total_commissions: Decimal = level_commissions.iter().copied().sum();

    let ratio = |numerator: i64| -> f64 {
        if total_users == 0 {
            0.0
        } else {
            (numerator as f64 / total_users as f64).clamp(0.0, 1.0)
        }
    };
    let avg_user_value = if total_users == 0 {
        Decimal::ZERO
    } else {
        (total_deposits / Decimal::from(total_users)).round_dp(2)
    };

    let row = AffiliateAnalytics {
        id: Uuid::nil(), // assigned by the database on insert
        affiliate_id,
        period_type: period.period_type,
        period_start: period.start,
        period_end: period.end,
        total_users: total_users as i32,
        new_users: new_users as i32,
        active_users: active_ids.len() as i32,
        cpa_qualified_users: cpa_qualified_users as i32,
        total_deposits,
        total_bets,
        total_commissions,
        level_1_users: level_users[0],
        level_2_users: level_users[1],
        level_3_users: level_users[2],
        level_4_users: level_users[3],
        level_5_users: level_users[4],
        level_1_commissions: level_commissions[0],
        level_2_commissions: level_commissions[1],
        level_3_commissions: level_commissions[2],
        level_4_commissions: level_commissions[3],
        level_5_commissions: level_commissions[4],
        conversion_rate: ratio(cpa_qualified_users),
        retention_rate: ratio(active_ids.len() as i64),
        avg_user_value,
        last_updated: Utc::now(),
    };
    validate_affiliate_rollup(&row)?;
    Ok(row)
}

/// Totals, count and first/last dates over one amount column.
#[derive(Debug, Default)]
struct AmountSeries {
    total: Decimal,
    count: usize,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl AmountSeries {
    fn average(&self) -> Decimal {
        if self.count == 0 {
            Decimal::ZERO
        } else {
            (self.total / Decimal::from(self.count as i64)).round_dp(2)
        }
    }
}

fn summarize(rows: &[Record], amount_column: &str, date_column: &str) -> AmountSeries {
    let mut series = AmountSeries {
        count: rows.len(),
        ..AmountSeries::default()
    };
    for row in rows {
        if let Some(amount) = row.get(amount_column).and_then(|v| v.as_decimal()) {
            series.total += amount;
        }
        if let Some(date) = row.get(date_column).and_then(|v| v.as_timestamp()) {
            series.first = Some(series.first.map_or(date, |f| f.min(date)));
            series.last = Some(series.last.map_or(date, |l| l.max(date)));
        }
    }
    series
}

/// Distinct calendar dates with any observed transaction or bet.
fn activity_days(transactions: &[Record], bets: &[Record]) -> usize {
    let days: HashSet<NaiveDate> = transactions
        .iter()
        .chain(bets.iter())
        .filter_map(|row| row.get(CREATED_AT)?.as_timestamp())
        .map(|t| t.date_naive())
        .collect();
    days.len()
}

fn result_is(row: &Record, expected: &str) -> bool {
    row.get("result")
        .and_then(|v| v.as_text())
        .is_some_and(|s| s.eq_ignore_ascii_case(expected))
}

fn sum_amounts(rows: &[Record], amount_column: &str) -> Decimal {
    rows.iter().filter_map(|row| row.get(amount_column)?.as_decimal()).sum()
}

/// The engine refuses to persist a rollup that violates its own invariants;
/// reaching this error means a computation bug, not bad data.
fn validate_user_rollup(row: &UserAnalytics) -> Result<()> {
    if row.period_end <= row.period_start {
        return Err(Error::invariant("period_end must be after period_start"));
    }
    if row.net_result != row.total_wins - row.total_losses {
        return Err(Error::invariant("net_result must equal total_wins - total_losses"));
    }
    let non_negative: [(&str, Decimal); 6] = [
        ("total_deposits", row.total_deposits),
        ("avg_deposit_amount", row.avg_deposit_amount),
        ("total_bets", row.total_bets),
        ("avg_bet_amount", row.avg_bet_amount),
        ("total_wins", row.total_wins),
        ("total_losses", row.total_losses),
    ];
    for (name, value) in non_negative {
        if value < Decimal::ZERO {
            return Err(Error::invariant(format!("{name} must be non-negative, got {value}")));
        }
    }
    if row.cpa_amount < Decimal::ZERO {
        return Err(Error::invariant("cpa_amount must be non-negative"));
    }
    Ok(())
}

fn validate_affiliate_rollup(row: &AffiliateAnalytics) -> Result<()> {
    if row.period_end <= row.period_start {
        return Err(Error::invariant("period_end must be after period_start"));
    }
    for (name, rate) in [("conversion_rate", row.conversion_rate), ("retention_rate", row.retention_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::invariant(format!("{name} must lie in [0, 1], got {rate}")));
        }
    }
    for (name, value) in [
        ("total_deposits", row.total_deposits),
        ("total_bets", row.total_bets),
        ("total_commissions", row.total_commissions),
        ("avg_user_value", row.avg_user_value),
    ] {
        if value < Decimal::ZERO {
            return Err(Error::invariant(format!("{name} must be non-negative, got {value}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::value::SqlValue;
    use chrono::TimeZone;

    fn daily_period() -> Period {
        resolve(PeriodType::Daily, Utc.with_ymd_and_hms(2025, 3, 10, 14, 22, 0).unwrap())
    }

    fn row(pairs: &[(&str, SqlValue)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn deposit(amount: i64, day: u32, hour: u32) -> Record {
        row(&[
            ("user_id", SqlValue::Int(42)),
            ("amount", SqlValue::Decimal(Decimal::from(amount))),
            (
                "created_at",
                SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()),
            ),
        ])
    }

    fn bet(amount: i64, win_amount: i64, result: &str, day: u32, hour: u32) -> Record {
        row(&[
            ("user_id", SqlValue::Int(42)),
            ("amount", SqlValue::Decimal(Decimal::from(amount))),
            ("win_amount", SqlValue::Decimal(Decimal::from(win_amount))),
            ("result", SqlValue::Text(result.into())),
            (
                "created_at",
                SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()),
            ),
        ])
    }

    #[test]
    fn user_rollup_deposit_and_bet_groups() {
        let deposits = vec![deposit(30, 10, 9), deposit(20, 10, 18)];
        let bets = vec![bet(10, 25, "win", 10, 10), bet(15, 0, "loss", 10, 11)];
        let rollup = build_user_rollup(
            42,
            daily_period(),
            &deposits,
            &bets,
            &[],
            &CpaRuleSet::default(),
            &CpaLevelAmounts::default(),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(rollup.total_deposits, Decimal::from(50));
        assert_eq!(rollup.deposit_count, 2);
        assert_eq!(rollup.avg_deposit_amount, Decimal::from(25));
        assert_eq!(
            rollup.first_deposit_date,
            Some(Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap())
        );
        assert_eq!(
            rollup.last_deposit_date,
            Some(Utc.with_ymd_and_hms(2025, 3, 10, 18, 0, 0).unwrap())
        );
        assert_eq!(rollup.total_bets, Decimal::from(25));
        assert_eq!(rollup.bet_count, 2);
        assert_eq!(rollup.total_wins, Decimal::from(25));
        assert_eq!(rollup.total_losses, Decimal::from(15));
        assert_eq!(rollup.net_result, Decimal::from(10));
    }

    #[test]
    fn avg_times_count_matches_total_within_tolerance() {
        let deposits = vec![deposit(10, 10, 9), deposit(10, 10, 10), deposit(11, 10, 11)];
        let rollup = build_user_rollup(
            42,
            daily_period(),
            &deposits,
            &[],
            &[],
            &CpaRuleSet::default(),
            &CpaLevelAmounts::default(),
            Utc::now(),
        )
        .unwrap();
        let reconstructed = rollup.avg_deposit_amount * Decimal::from(rollup.deposit_count);
        let diff = (reconstructed - rollup.total_deposits).abs();
        assert!(diff <= Decimal::new(1, 2), "diff {diff} exceeds 0.01");
    }

    #[test]
    fn empty_window_produces_zeroed_rollup() {
        let rollup = build_user_rollup(
            42,
            daily_period(),
            &[],
            &[],
            &[],
            &CpaRuleSet::default(),
            &CpaLevelAmounts::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rollup.deposit_count, 0);
        assert_eq!(rollup.avg_deposit_amount, Decimal::ZERO);
        assert_eq!(rollup.days_active, 0);
        assert_eq!(rollup.sessions_count, 0);
        assert!(!rollup.cpa_qualified);
        assert_eq!(rollup.cpa_amount, Decimal::ZERO);
    }

    #[test]
    fn activity_days_counts_distinct_dates() {
        let bets = vec![bet(1, 0, "loss", 10, 9), bet(1, 0, "loss", 10, 23), bet(1, 0, "loss", 11, 1)];
        let transactions = vec![row(&[(
            "created_at",
            SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 3, 12, 8, 0, 0).unwrap()),
        )])];
        assert_eq!(activity_days(&transactions, &bets), 3);
    }

    #[test]
    fn cpa_qualification_uses_configured_rules_and_level_one_payout() {
        // Seed scenario: deposits=50, bets=12, bet amount=200, days_active=4.
        let deposits = vec![deposit(50, 10, 9)];
        let mut bets = Vec::new();
        for i in 0..12 {
            let day = 10 + (i % 4) as u32;
            bets.push(bet(17, 0, "loss", day, 10));
        }
        // Periods are monthly so the four distinct days all land inside.
        let period = resolve(PeriodType::Monthly, Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap();
        let rollup = build_user_rollup(
            42,
            period,
            &deposits,
            &bets,
            &[],
            &CpaRuleSet::default(),
            &CpaLevelAmounts::default(),
            now,
        )
        .unwrap();

        assert!(rollup.total_bets >= Decimal::from(100));
        assert!(rollup.cpa_qualified);
        assert_eq!(rollup.cpa_qualification_date, Some(now));
        assert_eq!(rollup.cpa_amount, Decimal::from(50));
    }

    #[test]
    fn affiliate_rollup_counts_and_rates() {
        let period = daily_period();
        let user_row = |id: i64, level: i64, created_day: u32| {
            row(&[
                ("id", SqlValue::Int(id)),
                ("mlm_level", SqlValue::Int(level)),
                (
                    "created_at",
                    SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 3, created_day, 12, 0, 0).unwrap()),
                ),
            ])
        };
        let downline = vec![user_row(1, 1, 10), user_row(2, 1, 1), user_row(3, 2, 10), user_row(4, 7, 1)];
        let active: HashSet<i64> = [1, 3].into_iter().collect();

        let rollup = build_affiliate_rollup(
            7,
            period,
            &downline,
            &active,
            1,
            Decimal::from(400),
            Decimal::from(900),
            &CpaLevelAmounts::default(),
        )
        .unwrap();

        assert_eq!(rollup.total_users, 4);
        assert_eq!(rollup.new_users, 2);
        assert_eq!(rollup.active_users, 2);
        assert_eq!(rollup.cpa_qualified_users, 1);
        assert_eq!(rollup.level_1_users, 2);
        assert_eq!(rollup.level_2_users, 1);
        // mlm_level 7 is outside the tracked tiers.
        assert_eq!(rollup.level_5_users, 0);
        assert_eq!(rollup.level_1_commissions, Decimal::from(100));
        assert_eq!(rollup.level_2_commissions, Decimal::from(20));
        assert_eq!(rollup.total_commissions, Decimal::from(120));
        assert_eq!(rollup.conversion_rate, 0.25);
        assert_eq!(rollup.retention_rate, 0.5);
        assert_eq!(rollup.avg_user_value, Decimal::from(100));
    }

    #[test]
    fn affiliate_rollup_with_no_users_has_zero_rates() {
        let rollup = build_affiliate_rollup(
            7,
            daily_period(),
            &[],
            &HashSet::new(),
            0,
            Decimal::ZERO,
            Decimal::ZERO,
            &CpaLevelAmounts::default(),
        )
        .unwrap();
        assert_eq!(rollup.total_users, 0);
        assert_eq!(rollup.conversion_rate, 0.0);
        assert_eq!(rollup.retention_rate, 0.0);
        assert_eq!(rollup.avg_user_value, Decimal::ZERO);
    }

    #[test]
    fn negative_source_amounts_are_refused() {
        let deposits = vec![row(&[
            ("user_id", SqlValue::Int(42)),
            ("amount", SqlValue::Decimal(Decimal::from(-10))),
            (
                "created_at",
                SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()),
            ),
        ])];
        let result = build_user_rollup(
            42,
            daily_period(),
            &deposits,
            &[],
            &[],
            &CpaRuleSet::default(),
            &CpaLevelAmounts::default(),
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::Invariant { .. })));
    }
}
