//! Autonomy engine: may a patch be applied without asking?
//!
//! Everything here is a pure function of its inputs. A [`Decision`] is
//! computed fresh for every consolidated patch and never cached.

use crate::catalog::PatternRule;
use crate::diff::{blast_radius, UnifiedDiff};
use crate::pipeline::lexical::is_lexical;
use crate::report::{Report, Severity, Violation};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Style,
    Refactor,
    BugFix,
    Security,
    Deletion,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Style => "style",
            ActionKind::Refactor => "refactor",
            ActionKind::BugFix => "bug_fix",
            ActionKind::Security => "security",
            ActionKind::Deletion => "deletion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn raised(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl From<Severity> for RiskLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => RiskLevel::Low,
            Severity::Medium => RiskLevel::Medium,
            Severity::High => RiskLevel::High,
            Severity::Critical => RiskLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Apply,
    Ask,
}

/// The verdict for one consolidated patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action_kind: ActionKind,
    pub risk_level: RiskLevel,
    pub outcome: Outcome,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} risk: {}",
            self.action_kind.label(),
            self.risk_level.label(),
            match self.outcome {
                Outcome::Apply => "apply",
                Outcome::Ask => "ask",
            }
        )
    }
}

/// The fixed action/risk table
pub fn decide(action_kind: ActionKind, risk_level: RiskLevel) -> Outcome {
    use ActionKind::*;
    use RiskLevel::*;
    match (action_kind, risk_level) {
        (Style, Low | Medium) => Outcome::Apply,
        (Style, High | Critical) => Outcome::Ask,
        (Refactor | BugFix, Low) => Outcome::Apply,
        (Refactor | BugFix, Medium | High | Critical) => Outcome::Ask,
        (Security | Deletion, Low | Medium | High | Critical) => Outcome::Ask,
    }
}

/// Risk of applying `diffs` given the violations they address.
///
/// Base risk follows the worst severity. Touching more than `max_lines`
/// lines raises it one tier; touching several files or removing more than
/// ten lines beyond what is added lifts it to at least high.
pub fn assess_risk(violations: &[Violation], diffs: &[UnifiedDiff], max_lines: usize) -> RiskLevel {
    let mut risk = violations
        .iter()
        .map(|v| v.severity)
        .max()
        .map(RiskLevel::from)
        .unwrap_or(RiskLevel::Low);

    let radius = blast_radius(diffs);
    if radius.lines_touched() > max_lines {
        risk = risk.raised();
    }
    if radius.files > 1 || radius.removed > radius.added + 10 {
        risk = risk.max(RiskLevel::High);
    }
    risk
}

/// What kind of change a patch for `report` is
pub fn classify_action(report: &Report, diffs: &[UnifiedDiff]) -> ActionKind {
    let security = report.violations.iter().any(|v| {
        PatternRule::from_rule_id(&v.rule_id).is_some_and(|rule| rule.is_security())
    });
    if security {
        return ActionKind::Security;
    }

    let radius = blast_radius(diffs);
    if radius.removed > 0 && radius.added == 0 {
        return ActionKind::Deletion;
    }

    if !report.violations.is_empty() && report.violations.iter().all(|v| is_lexical(&v.rule_id)) {
        return ActionKind::Style;
    }

    let open_hypotheses = report
        .bug_hunt
        .as_ref()
        .is_some_and(|hunt| hunt.open_hypotheses().next().is_some());
    if report.violations.is_empty() && !open_hypotheses {
        return ActionKind::Refactor;
    }
    ActionKind::BugFix
}

/// Classify, assess and decide in one step
pub fn evaluate(report: &Report, diffs: &[UnifiedDiff], max_lines: usize) -> Decision {
    let action_kind = classify_action(report, diffs);
    let risk_level = assess_risk(&report.violations, diffs, max_lines);
    Decision {
        action_kind,
        risk_level,
        outcome: decide(action_kind, risk_level),
    }
}
