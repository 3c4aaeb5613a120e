//! Organization policy rules over AI composition percentages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::CompositionPercentages;

/// Risk category of a rule. `Strength` rules are informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Strength,
}

impl RiskClass {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Strength)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Pure,
    Blended,
    Overall,
}

impl Metric {
    pub fn read(&self, pct: &CompositionPercentages) -> f64 {
        match self {
            Self::Pure => pct.pure,
            Self::Blended => pct.blended,
            Self::Overall => pct.overall,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pure => "pure AI",
            Self::Blended => "blended AI",
            Self::Overall => "overall AI",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl Comparator {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessOrEqual => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub metric: Metric,
    pub comparator: Comparator,
    /// Percentage, 0 to 100.
    pub threshold: f64,
}

impl fmt::Display for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}%",
            self.metric,
            self.comparator.symbol(),
            self.threshold
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub risk: RiskClass,
    pub condition: RuleCondition,
}

/// Decides whether a rule triggers for a set of percentages.
pub trait RuleEvaluator: Send + Sync {
    fn triggers(&self, rule: &Rule, percentages: &CompositionPercentages) -> bool;
}

/// Compares a single metric against a fixed threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdRuleEvaluator;

impl RuleEvaluator for ThresholdRuleEvaluator {
    fn triggers(&self, rule: &Rule, percentages: &CompositionPercentages) -> bool {
        let value = rule.condition.metric.read(percentages);
        rule.condition.comparator.holds(value, rule.condition.threshold)
    }
}

/// A rule that triggered for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub repository: String,
    pub rule: String,
    pub condition: String,
    pub risk: RiskClass,
}

/// Percentages for one analysed repository, with the rules that apply to it.
#[derive(Debug, Clone)]
pub struct RuleSubject {
    pub repository: String,
    pub percentages: CompositionPercentages,
    pub rules: Vec<Rule>,
}

/// Outcome of evaluating a batch of subjects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub violations: Vec<RuleViolation>,
}

impl RuleOutcome {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Keep only the rules that can block a pull request.
pub fn blocking_rules(organization: Vec<Rule>, group: Vec<Rule>) -> Vec<Rule> {
    organization
        .into_iter()
        .chain(group)
        .filter(|rule| rule.risk.is_blocking())
        .collect()
}

/// Evaluate every blocking rule against every subject.
///
/// The batch passes only if no rule triggers anywhere.
pub fn evaluate_rules(evaluator: &dyn RuleEvaluator, subjects: &[RuleSubject]) -> RuleOutcome {
    let mut violations = Vec::new();
    for subject in subjects {
        for rule in subject.rules.iter().filter(|r| r.risk.is_blocking()) {
            if evaluator.triggers(rule, &subject.percentages) {
                violations.push(RuleViolation {
                    repository: subject.repository.clone(),
                    rule: rule.name.clone(),
                    condition: rule.condition.to_string(),
                    risk: rule.risk,
                });
            }
        }
    }
    RuleOutcome { violations }
}
