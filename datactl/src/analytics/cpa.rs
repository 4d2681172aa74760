//! CPA qualification rules and level payouts.
//!
//! Qualification is driven by configuration: criteria are grouped, each
//! group combines its criteria with AND or OR, and the groups themselves
//! combine with a top-level operator. Disabled criteria are skipped; a group
//! left with no enabled criteria contributes nothing.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionType {
    TotalDeposits,
    BetCount,
    TotalBets,
    DaysActive,
}

fn enabled_default() -> bool {
    true
}

/// One threshold: the named metric must reach `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    #[serde(rename = "type")]
    pub criterion: CriterionType,
    pub value: Decimal,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaGroup {
    pub operator: GroupOperator,
    pub criteria: Vec<Criterion>,
}

/// The full rule set, as delivered by the `cpa_validation_rules` config key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpaRuleSet {
    pub groups: Vec<CriteriaGroup>,
    pub group_operator: GroupOperator,
}

impl Default for CpaRuleSet {
    /// The default rule: deposits >= 30 AND bets >= 10 AND bet amount >= 100
    /// AND days active >= 3.
    fn default() -> Self {
        Self {
            groups: vec![CriteriaGroup {
                operator: GroupOperator::And,
                criteria: vec![
                    Criterion {
                        criterion: CriterionType::TotalDeposits,
                        value: Decimal::from(30),
                        enabled: true,
                    },
                    Criterion {
                        criterion: CriterionType::BetCount,
                        value: Decimal::from(10),
                        enabled: true,
                    },
                    Criterion {
                        criterion: CriterionType::TotalBets,
                        value: Decimal::from(100),
                        enabled: true,
                    },
                    Criterion {
                        criterion: CriterionType::DaysActive,
                        value: Decimal::from(3),
                        enabled: true,
                    },
                ],
            }],
            group_operator: GroupOperator::And,
        }
    }
}

/// The metrics a rule set is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpaMetrics {
    pub total_deposits: Decimal,
    pub bet_count: u32,
    pub total_bets: Decimal,
    pub days_active: u32,
}

impl CpaMetrics {
    fn value_of(&self, criterion: CriterionType) -> Decimal {
        match criterion {
            CriterionType::TotalDeposits => self.total_deposits,
            CriterionType::BetCount => Decimal::from(self.bet_count),
            CriterionType::TotalBets => self.total_bets,
            CriterionType::DaysActive => Decimal::from(self.days_active),
        }
    }
}

impl CpaRuleSet {
    /// Evaluate the rule set. A rule set with no enabled criteria at all
    /// never qualifies.
    pub fn evaluate(&self, metrics: &CpaMetrics) -> bool {
        let mut group_results = self.groups.iter().filter_map(|group| {
            let mut enabled = group.criteria.iter().filter(|c| c.enabled).peekable();
            enabled.peek()?;
            let result = match group.operator {
                GroupOperator::And => enabled.all(|c| metrics.value_of(c.criterion) >= c.value),
                GroupOperator::Or => enabled.any(|c| metrics.value_of(c.criterion) >= c.value),
            };
            Some(result)
        });

        match self.group_operator {
            GroupOperator::And => {
                let mut any = false;
                for result in group_results.by_ref() {
                    if !result {
                        return false;
                    }
                    any = true;
                }
                any
            }
            GroupOperator::Or => group_results.any(|r| r),
        }
    }
}

/// Per-level CPA payout amounts, as delivered by the `cpa_level_amounts`
/// config key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpaLevelAmounts {
    pub level_1: Decimal,
    pub level_2: Decimal,
    pub level_3: Decimal,
    pub level_4: Decimal,
    pub level_5: Decimal,
}

impl Default for CpaLevelAmounts {
    fn default() -> Self {
        Self {
            level_1: Decimal::from(50),
            level_2: Decimal::from(20),
            level_3: Decimal::from(5),
            level_4: Decimal::from(5),
            level_5: Decimal::from(5),
        }
    }
}

impl CpaLevelAmounts {
    /// Payout for an MLM level; levels outside 1..=5 pay nothing.
    pub fn for_level(&self, level: u8) -> Decimal {
        match level {
            1 => self.level_1,
            2 => self.level_2,
            3 => self.level_3,
            4 => self.level_4,
            5 => self.level_5,
            _ => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qualified_metrics() -> CpaMetrics {
        CpaMetrics {
            total_deposits: Decimal::from(50),
            bet_count: 12,
            total_bets: Decimal::from(200),
            days_active: 4,
        }
    }

    #[test]
    fn default_rules_qualify_an_active_user() {
        let rules = CpaRuleSet::default();
        assert!(rules.evaluate(&qualified_metrics()));
    }

    #[test]
    fn default_rules_reject_below_any_threshold() {
        let rules = CpaRuleSet::default();
        for patch in [
            CpaMetrics {
                total_deposits: Decimal::from(29),
                ..qualified_metrics()
            },
            CpaMetrics {
                bet_count: 9,
                ..qualified_metrics()
            },
            CpaMetrics {
                total_bets: Decimal::from(99),
                ..qualified_metrics()
            },
            CpaMetrics {
                days_active: 2,
                ..qualified_metrics()
            },
        ] {
            assert!(!rules.evaluate(&patch), "{patch:?} must not qualify");
        }
    }

    #[test]
    fn or_group_qualifies_on_any_criterion() {
        let rules = CpaRuleSet {
            groups: vec![CriteriaGroup {
                operator: GroupOperator::Or,
                criteria: vec![
                    Criterion {
                        criterion: CriterionType::TotalDeposits,
                        value: Decimal::from(1_000),
                        enabled: true,
                    },
                    Criterion {
                        criterion: CriterionType::DaysActive,
                        value: Decimal::from(3),
                        enabled: true,
                    },
                ],
            }],
            group_operator: GroupOperator::And,
        };
        assert!(rules.evaluate(&qualified_metrics()));
    }

    #[test]
    fn disabled_criteria_are_skipped() {
        let mut rules = CpaRuleSet::default();
        rules.groups[0].criteria[0].enabled = false; // drop the deposit rule
        let metrics = CpaMetrics {
            total_deposits: Decimal::ZERO,
            ..qualified_metrics()
        };
        assert!(rules.evaluate(&metrics));
    }

    #[test]
    fn all_disabled_never_qualifies() {
        let mut rules = CpaRuleSet::default();
        for criterion in &mut rules.groups[0].criteria {
            criterion.enabled = false;
        }
        assert!(!rules.evaluate(&qualified_metrics()));

        let empty = CpaRuleSet {
            groups: vec![],
            group_operator: GroupOperator::And,
        };
        assert!(!empty.evaluate(&qualified_metrics()));
    }

    #[test]
    fn rule_set_deserializes_from_config_shape() {
        let rules: CpaRuleSet = serde_json::from_value(serde_json::json!({
            "groups": [{
                "operator": "AND",
                "criteria": [
                    {"type": "total_deposits", "value": 30, "enabled": true},
                    {"type": "bet_count", "value": 10}
                ]
            }],
            "group_operator": "OR"
        }))
        .unwrap();
        assert_eq!(rules.groups.len(), 1);
        assert!(rules.groups[0].criteria[1].enabled);
        assert_eq!(rules.group_operator, GroupOperator::Or);
    }

    #[test]
    fn level_amounts_default_payout_table() {
        let amounts = CpaLevelAmounts::default();
        assert_eq!(amounts.for_level(1), Decimal::from(50));
        assert_eq!(amounts.for_level(2), Decimal::from(20));
        assert_eq!(amounts.for_level(5), Decimal::from(5));
        assert_eq!(amounts.for_level(6), Decimal::ZERO);
        assert_eq!(amounts.for_level(0), Decimal::ZERO);
    }
}
