//! Period-bucketed rollup records.
//!
//! Both rollup tables are keyed by `(entity, period_type, period_start)`;
//! writes are idempotent upserts that replace every non-key field.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Calendar bucket for a rollup row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeriodType::Daily => "DAILY",
            PeriodType::Weekly => "WEEKLY",
            PeriodType::Monthly => "MONTHLY",
            PeriodType::Yearly => "YEARLY",
        };
        f.write_str(s)
    }
}

/// Per-user rollup for one period.
///
/// Invariants checked before every write: `period_end > period_start`,
/// `net_result = total_wins - total_losses`, all monetary and count fields
/// non-negative.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserAnalytics {
    pub id: Uuid,
    pub user_id: i64,
    pub period_type: PeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    // Deposit group
    pub total_deposits: Decimal,
    pub deposit_count: i32,
    pub first_deposit_date: Option<DateTime<Utc>>,
    pub last_deposit_date: Option<DateTime<Utc>>,
    pub avg_deposit_amount: Decimal,

    // Bet group
    pub total_bets: Decimal,
    pub bet_count: i32,
    pub first_bet_date: Option<DateTime<Utc>>,
    pub last_bet_date: Option<DateTime<Utc>>,
    pub avg_bet_amount: Decimal,

    // Activity group. Session figures are heuristic estimates; see
    // `analytics::engine` for the formulas.
    pub days_active: i32,
    pub sessions_count: i32,
    pub total_session_minutes: i32,

    // Result group
    pub total_wins: Decimal,
    pub total_losses: Decimal,
    pub net_result: Decimal,

    // CPA group
    pub cpa_qualified: bool,
    pub cpa_qualification_date: Option<DateTime<Utc>>,
    pub cpa_amount: Decimal,

    pub last_updated: DateTime<Utc>,
}

/// Per-affiliate rollup for one period.
///
/// `conversion_rate` and `retention_rate` are bounded to `[0, 1]`;
/// `avg_user_value >= 0`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AffiliateAnalytics {
    pub id: Uuid,
    pub affiliate_id: i64,
    pub period_type: PeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    pub total_users: i32,
    pub new_users: i32,
    pub active_users: i32,
    pub cpa_qualified_users: i32,

    pub total_deposits: Decimal,
    pub total_bets: Decimal,
    pub total_commissions: Decimal,

    pub level_1_users: i32,
    pub level_2_users: i32,
    pub level_3_users: i32,
    pub level_4_users: i32,
    pub level_5_users: i32,
    pub level_1_commissions: Decimal,
    pub level_2_commissions: Decimal,
    pub level_3_commissions: Decimal,
    pub level_4_commissions: Decimal,
    pub level_5_commissions: Decimal,

    pub conversion_rate: f64,
    pub retention_rate: f64,
    pub avg_user_value: Decimal,

    pub last_updated: DateTime<Utc>,
}
