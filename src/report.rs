//! Report types: what the analyzer hands back to its caller
//!
//! A `Report` is the externally visible aggregate of one pipeline run.
//! The bug-hunting sub-report is present only when deep analysis ran.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much a finding should be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// One tier lower, bottoming out at `Low`
    pub fn downgraded(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            Confidence::Medium | Confidence::Low => Confidence::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

/// Line and byte span of a finding (lines are 1-based, inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub start_line: usize,
    pub end_line: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl Location {
    pub fn line(line: usize, start_offset: usize, end_offset: usize) -> Self {
        Self {
            start_line: line,
            end_line: line,
            start_offset,
            end_offset,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "line {}", self.start_line)
        } else {
            write!(f, "lines {}-{}", self.start_line, self.end_line)
        }
    }
}

/// A concrete, located finding of a known bad pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub location: Location,
    pub severity: Severity,
    pub confidence: Confidence,
    pub message: String,
}

impl Violation {
    /// Identity used to compare findings across revisions of a unit.
    /// Line numbers shift when code is edited, so they are left out.
    pub fn signature(&self) -> (String, String) {
        (self.rule_id.clone(), self.message.clone())
    }
}

/// Kind of suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Code refactoring (extract, rename, restructure)
    Refactoring,
    /// Code quality/maintainability
    Quality,
    /// Naming or formatting consistency
    Style,
}

impl SuggestionKind {
    pub fn label(&self) -> &'static str {
        match self {
            SuggestionKind::Refactoring => "Refactor",
            SuggestionKind::Quality => "Quality",
            SuggestionKind::Style => "Style",
        }
    }
}

/// Priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A non-judgmental hint; never triggers escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub priority: Priority,
    pub line: Option<usize>,
    pub summary: String,
    pub detail: Option<String>,
}

impl Suggestion {
    pub fn new(kind: SuggestionKind, priority: Priority, summary: String) -> Self {
        Self {
            kind,
            priority,
            line: None,
            summary,
            detail: None,
        }
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// The eight analysis phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reconnaissance,
    LexicalConsistency,
    PatternMatching,
    AssumptionInterrogation,
    DataFlowTracing,
    HypothesisRanking,
    FixDesign,
    VerificationChecklist,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Reconnaissance,
        Phase::LexicalConsistency,
        Phase::PatternMatching,
        Phase::AssumptionInterrogation,
        Phase::DataFlowTracing,
        Phase::HypothesisRanking,
        Phase::FixDesign,
        Phase::VerificationChecklist,
    ];

    /// 1-based position in the pipeline
    pub fn number(&self) -> u8 {
        match self {
            Phase::Reconnaissance => 1,
            Phase::LexicalConsistency => 2,
            Phase::PatternMatching => 3,
            Phase::AssumptionInterrogation => 4,
            Phase::DataFlowTracing => 5,
            Phase::HypothesisRanking => 6,
            Phase::FixDesign => 7,
            Phase::VerificationChecklist => 8,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Reconnaissance => "Reconnaissance",
            Phase::LexicalConsistency => "Lexical Consistency",
            Phase::PatternMatching => "Pattern Matching",
            Phase::AssumptionInterrogation => "Assumption Interrogation",
            Phase::DataFlowTracing => "Data Flow Tracing",
            Phase::HypothesisRanking => "Hypothesis Ranking",
            Phase::FixDesign => "Fix Design",
            Phase::VerificationChecklist => "Verification Checklist",
        }
    }

    /// Phases 1-3 make up shallow analysis
    pub fn is_shallow(&self) -> bool {
        self.number() <= 3
    }
}

/// Outcome label for one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped(String),
}

impl PhaseStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PhaseStatus::Passed => "pass",
            PhaseStatus::Failed => "fail",
            PhaseStatus::Skipped(_) => "skipped",
        }
    }
}

/// What kind of implicit assumption a hypothesis challenges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionKind {
    NeverEmpty,
    NeverNil,
    NeverZero,
    NeverFails,
    WellFormedInput,
}

impl AssumptionKind {
    pub fn describe(&self, subject: &str) -> String {
        match self {
            AssumptionKind::NeverEmpty => format!("`{}` is never empty", subject),
            AssumptionKind::NeverNil => format!("`{}` is never nil", subject),
            AssumptionKind::NeverZero => format!("`{}` is never zero", subject),
            AssumptionKind::NeverFails => format!("`{}` never fails", subject),
            AssumptionKind::WellFormedInput => format!("`{}` is always well-formed", subject),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AssumptionKind::NeverNil | AssumptionKind::NeverFails => Severity::High,
            AssumptionKind::NeverEmpty | AssumptionKind::NeverZero => Severity::Medium,
            AssumptionKind::WellFormedInput => Severity::Low,
        }
    }
}

/// One observation supporting or weakening a hypothesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub phase: Phase,
    pub observation: String,
    pub weight: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum HypothesisStatus {
    Open,
    Discarded(String),
}

/// A candidate root-cause explanation, ranked by evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub subject: String,
    pub assumption: AssumptionKind,
    pub line: usize,
    pub severity: Severity,
    /// The unanswered challenge that produced this hypothesis
    pub challenge: String,
    pub evidence: Vec<Evidence>,
    pub first_phase: Phase,
    pub status: HypothesisStatus,
}

impl Hypothesis {
    pub fn weight(&self) -> i32 {
        self.evidence.iter().map(|e| e.weight).sum()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, HypothesisStatus::Open)
    }
}

/// Result of one verification check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

/// A fix candidate designed in phase 7 and judged in phase 8
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSkeleton {
    pub hypothesis_id: String,
    pub diff: String,
    pub justification: String,
    /// Filled in by the verification checklist
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    #[serde(default)]
    pub promoted: bool,
}

/// Per-phase entry in the bug-hunting sub-report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Short account of what the phase observed
    pub notes: Vec<String>,
    pub hypotheses: Vec<String>,
    pub proposals: Vec<ProposalSkeleton>,
}

impl PhaseRecord {
    pub fn new(phase: Phase, status: PhaseStatus) -> Self {
        Self {
            phase,
            status,
            notes: Vec::new(),
            hypotheses: Vec::new(),
            proposals: Vec::new(),
        }
    }

    pub fn skipped(phase: Phase, reason: &str) -> Self {
        Self::new(phase, PhaseStatus::Skipped(reason.to_string()))
    }
}

/// Why deep analysis ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Forced,
    CatalogMatches,
    RepeatedVerificationFailure,
}

/// Detailed output of the full eight-phase protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugHuntReport {
    pub reason: EscalationReason,
    /// Exactly eight entries, in phase order
    pub phases: Vec<PhaseRecord>,
    /// All hypotheses, including discarded ones, in ranked order for open ones
    pub hypotheses: Vec<Hypothesis>,
}

impl BugHuntReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|r| r.phase == phase)
    }

    /// Skeletons that passed every verification check
    pub fn promoted(&self) -> Vec<&ProposalSkeleton> {
        self.phase(Phase::VerificationChecklist)
            .map(|r| r.proposals.iter().filter(|p| p.promoted).collect())
            .unwrap_or_default()
    }

    pub fn open_hypotheses(&self) -> impl Iterator<Item = &Hypothesis> {
        self.hypotheses.iter().filter(|h| h.is_open())
    }
}

/// The externally visible aggregate of one analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub unit: String,
    pub violations: Vec<Violation>,
    pub suggestions: Vec<Suggestion>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bug_hunt: Option<BugHuntReport>,
    /// Set by the escalation ladder after repeated verification failures
    #[serde(default)]
    pub human_escalation_required: bool,
}

impl Report {
    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    /// Ids a justification can cite: violation rule ids and hypothesis ids
    pub fn evidence_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.violations.iter().map(|v| v.rule_id.clone()).collect();
        if let Some(hunt) = &self.bug_hunt {
            ids.extend(hunt.open_hypotheses().map(|h| h.id.clone()));
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// True when a verification pass promoted nothing
    pub fn verification_failed(&self) -> bool {
        self.bug_hunt
            .as_ref()
            .map(|h| h.promoted().is_empty())
            .unwrap_or(false)
    }
}
