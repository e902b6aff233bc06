//! The eight-phase bug-hunting pipeline
//!
//! Phases run strictly in order over one code unit. Phases 1-3 always run
//! (unless the unit is trivially clean); the escalation ladder decides
//! whether phases 4-8 follow.

pub mod assumptions;
pub mod dataflow;
pub mod fix_design;
pub mod lexical;
pub mod ranking;
pub mod recon;
pub mod verify;

use crate::catalog::PatternCatalog;
use crate::config::Config;
use crate::error::HuntResult;
use crate::ladder::{Depth, EscalationLadder};
use crate::report::{
    BugHuntReport, EscalationReason, Hypothesis, HypothesisStatus, Phase, PhaseRecord,
    PhaseStatus, Priority, Report, Suggestion, SuggestionKind, Violation,
};
use crate::unit::CodeUnit;
use recon::Inventory;
use std::sync::Arc;

const TRIVIALLY_CLEAN: &str = "trivially clean";
const NO_OPEN_HYPOTHESES: &str = "no open hypotheses";
const LONG_FUNCTION_LINES: usize = 60;
const DEEP_NESTING: usize = 4;

#[derive(Debug, Clone)]
pub struct PhasePipeline {
    config: Arc<Config>,
    catalog: Arc<PatternCatalog>,
    ladder: Arc<EscalationLadder>,
}

impl PhasePipeline {
    pub fn new(config: Arc<Config>, catalog: Arc<PatternCatalog>, ladder: Arc<EscalationLadder>) -> Self {
        Self {
            config,
            catalog,
            ladder,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn ladder(&self) -> &Arc<EscalationLadder> {
        &self.ladder
    }

    /// Analyze one unit. Only malformed input or a ledger failure errors.
    pub fn run(&self, unit: &CodeUnit, force_deep: bool) -> HuntResult<Report> {
        unit.validate(self.config.max_input_bytes)?;
        let name = unit.display_name();

        let inventory = recon::survey(unit);
        let mut recon_record = PhaseRecord::new(Phase::Reconnaissance, PhaseStatus::Passed);
        recon_record.notes.push(format!(
            "{} definitions, {} assignments, {} uses, {} blocks (max depth {})",
            inventory.definitions.len(),
            inventory.assignments.len(),
            inventory.uses.len(),
            inventory.blocks.len(),
            inventory.max_depth()
        ));
        tracing::debug!(unit = %name, symbols = inventory.symbol_count(), "phase 1 done");

        if inventory.is_trivially_clean() && !force_deep {
            let escalation = self.ladder.assess(unit, 0, false)?;
            let bug_hunt = (escalation.depth == Depth::Deep).then(|| {
                let mut phases = vec![recon_record];
                phases.extend(Phase::ALL[1..].iter().map(|p| PhaseRecord::skipped(*p, TRIVIALLY_CLEAN)));
                BugHuntReport {
                    reason: escalation.reason.unwrap_or(EscalationReason::RepeatedVerificationFailure),
                    phases,
                    hypotheses: Vec::new(),
                }
            });
            return Ok(Report {
                unit: name,
                violations: Vec::new(),
                suggestions: Vec::new(),
                bug_hunt,
                human_escalation_required: escalation.human_required,
            });
        }

        let lexical = lexical::check(unit, &inventory);
        tracing::debug!(unit = %name, flags = lexical.violations.len(), "phase 2 done");
        let patterns = self.catalog.scan(unit);
        tracing::debug!(unit = %name, matches = patterns.len(), "phase 3 done");

        let mut violations: Vec<Violation> = lexical
            .violations
            .iter()
            .chain(&patterns)
            .cloned()
            .collect();
        violations.sort_by(|a, b| {
            a.location
                .start_offset
                .cmp(&b.location.start_offset)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        let mut suggestions = lexical.suggestions;
        suggestions.extend(structure_suggestions(&inventory));

        let escalation = self.ladder.assess(unit, patterns.len(), force_deep)?;
        if escalation.depth == Depth::Shallow {
            return Ok(Report {
                unit: name,
                violations,
                suggestions,
                bug_hunt: None,
                human_escalation_required: false,
            });
        }

        let mut phases = vec![
            recon_record,
            findings_record(Phase::LexicalConsistency, &lexical.violations),
            findings_record(Phase::PatternMatching, &patterns),
        ];
        let (deep_phases, hypotheses) = self.deep_phases(unit, &inventory);
        phases.extend(deep_phases);

        Ok(Report {
            unit: name,
            violations,
            suggestions,
            bug_hunt: Some(BugHuntReport {
                reason: escalation.reason.unwrap_or(EscalationReason::Forced),
                phases,
                hypotheses,
            }),
            human_escalation_required: escalation.human_required,
        })
    }

    /// Phases 4-8
    fn deep_phases(
        &self,
        unit: &CodeUnit,
        inventory: &Inventory,
    ) -> (Vec<PhaseRecord>, Vec<Hypothesis>) {
        let name = unit.display_name();

        let interrogation = assumptions::interrogate(unit, inventory);
        let mut hypotheses = interrogation.hypotheses;
        let mut phase4 = PhaseRecord::new(Phase::AssumptionInterrogation, adverse(!hypotheses.is_empty()));
        for c in &interrogation.challenges {
            phase4.notes.push(match c.answered_at {
                Some(line) => format!("line {}: {} answered on line {}", c.line, c.question, line),
                None => format!("line {}: {} unanswered", c.line, c.question),
            });
        }
        phase4.hypotheses = hypotheses.iter().map(|h| h.id.clone()).collect();
        tracing::debug!(unit = %name, hypotheses = hypotheses.len(), "phase 4 done");

        let touched = dataflow::trace(&mut hypotheses, inventory);
        let any_open = hypotheses.iter().any(|h| h.is_open());
        let mut phase5 = PhaseRecord::new(Phase::DataFlowTracing, adverse(any_open));
        for h in &hypotheses {
            if let HypothesisStatus::Discarded(reason) = &h.status {
                phase5.notes.push(format!("{} discarded: {}", h.id, reason));
            }
        }
        phase5.hypotheses = touched;
        tracing::debug!(unit = %name, "phase 5 done");

        ranking::rank(&mut hypotheses);
        let mut phase6 = PhaseRecord::new(Phase::HypothesisRanking, adverse(any_open));
        phase6.hypotheses = hypotheses
            .iter()
            .filter(|h| h.is_open())
            .map(|h| h.id.clone())
            .collect();
        phase6.notes = hypotheses
            .iter()
            .filter(|h| h.is_open())
            .map(|h| format!("{} weight {} ({}): {}", h.id, h.weight(), h.severity, h.challenge))
            .collect();

        if !any_open {
            return (
                vec![
                    phase4,
                    phase5,
                    phase6,
                    PhaseRecord::skipped(Phase::FixDesign, NO_OPEN_HYPOTHESES),
                    PhaseRecord::skipped(Phase::VerificationChecklist, NO_OPEN_HYPOTHESES),
                ],
                hypotheses,
            );
        }

        let skeletons = fix_design::design(unit, &hypotheses, self.config.max_fix_candidates);
        let mut phase7 = PhaseRecord::new(Phase::FixDesign, adverse(skeletons.is_empty()));
        phase7.hypotheses = skeletons.iter().map(|s| s.hypothesis_id.clone()).collect();
        if skeletons.is_empty() {
            phase7.notes.push(format!(
                "no guard template for the top hypotheses in {}",
                unit.language().label()
            ));
        }
        phase7.proposals = skeletons.clone();
        tracing::debug!(unit = %name, skeletons = skeletons.len(), "phase 7 done");

        let checked = verify::verify(unit, inventory, &hypotheses, skeletons, self.config.max_fix_lines);
        let promoted = checked.iter().filter(|s| s.promoted).count();
        let mut phase8 = PhaseRecord::new(Phase::VerificationChecklist, adverse(promoted == 0));
        phase8.notes.push(format!("{} of {} skeletons promoted", promoted, checked.len()));
        phase8.hypotheses = checked
            .iter()
            .filter(|s| s.promoted)
            .map(|s| s.hypothesis_id.clone())
            .collect();
        phase8.proposals = checked;
        tracing::debug!(unit = %name, promoted, "phase 8 done");

        (vec![phase4, phase5, phase6, phase7, phase8], hypotheses)
    }
}

fn adverse(found: bool) -> PhaseStatus {
    if found {
        PhaseStatus::Failed
    } else {
        PhaseStatus::Passed
    }
}

fn findings_record(phase: Phase, violations: &[Violation]) -> PhaseRecord {
    let mut record = PhaseRecord::new(phase, adverse(!violations.is_empty()));
    record.notes = violations
        .iter()
        .map(|v| format!("{} at {}: {}", v.rule_id, v.location, v.message))
        .collect();
    record
}

fn structure_suggestions(inventory: &Inventory) -> Vec<Suggestion> {
    let mut out: Vec<Suggestion> = inventory
        .definitions
        .iter()
        .filter(|d| d.end_line + 1 - d.line > LONG_FUNCTION_LINES)
        .map(|d| {
            Suggestion::new(
                SuggestionKind::Refactoring,
                Priority::Medium,
                format!("`{}` spans {} lines", d.name, d.end_line + 1 - d.line),
            )
            .with_line(d.line)
        })
        .collect();
    if let Some(block) = inventory.blocks.iter().find(|b| b.depth >= DEEP_NESTING) {
        out.push(
            Suggestion::new(
                SuggestionKind::Quality,
                Priority::Low,
                format!("`{}` nested {} levels deep", block.keyword, block.depth),
            )
            .with_line(block.line),
        );
    }
    out
}

/// Public entry point: the pipeline plus the configured forcing toggle
#[derive(Debug, Clone)]
pub struct Analyzer {
    pipeline: PhasePipeline,
}

impl Analyzer {
    pub fn new(pipeline: PhasePipeline) -> Self {
        Self { pipeline }
    }

    /// Analyzer with the built-in catalog and an in-memory failure ledger
    pub fn with_config(config: Arc<Config>) -> Self {
        let ladder = Arc::new(EscalationLadder::in_memory(config.repeat_failure_threshold));
        Self::new(PhasePipeline::new(config, Arc::new(PatternCatalog::new()), ladder))
    }

    pub fn pipeline(&self) -> &PhasePipeline {
        &self.pipeline
    }

    pub fn analyze(&self, unit: &CodeUnit, enable_bug_hunting: bool) -> HuntResult<Report> {
        let force = enable_bug_hunting || self.pipeline.config.force_bug_hunting;
        self.pipeline.run(unit, force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HuntError, InputError};
    use std::path::PathBuf;

    fn analyzer() -> Analyzer {
        Analyzer::with_config(Arc::new(Config::default()))
    }

    fn unit(src: &str, name: &str) -> CodeUnit {
        CodeUnit::new(src, Some(PathBuf::from(name)), 32 * 1024).unwrap()
    }

    #[test]
    fn test_clean_unit_has_no_sub_report() {
        let u = CodeUnit::new("def hello; puts 'hi'; end", None, 1024).unwrap();
        let report = analyzer().analyze(&u, false).unwrap();
        assert!(report.violations.is_empty());
        assert!(report.bug_hunt.is_none());
    }

    #[test]
    fn test_forced_run_labels_all_phases() {
        let u = CodeUnit::new("def hello; puts 'hi'; end", None, 1024).unwrap();
        let report = analyzer().analyze(&u, true).unwrap();
        let hunt = report.bug_hunt.unwrap();
        assert_eq!(hunt.reason, EscalationReason::Forced);
        let order: Vec<Phase> = hunt.phases.iter().map(|r| r.phase).collect();
        assert_eq!(order, Phase::ALL.to_vec());
    }

    #[test]
    fn test_forced_env_toggle_matches_parameter() {
        let config = Config {
            force_bug_hunting: true,
            ..Config::default()
        };
        let u = CodeUnit::new("def hello; puts 'hi'; end", None, 1024).unwrap();
        let toggled = Analyzer::with_config(Arc::new(config)).analyze(&u, false).unwrap();
        let param = analyzer().analyze(&u, true).unwrap();
        assert_eq!(toggled, param);
    }

    #[test]
    fn test_trivially_clean_skips_when_forced_is_off() {
        let u = unit("# nothing here\n", "a.rb");
        let report = analyzer().analyze(&u, false).unwrap();
        assert!(report.bug_hunt.is_none());

        let report = analyzer().analyze(&u, true).unwrap();
        let hunt = report.bug_hunt.unwrap();
        assert_eq!(hunt.phases.len(), 8);
        assert!(hunt.phases.iter().all(|p| !matches!(&p.status, PhaseStatus::Skipped(r) if r == TRIVIALLY_CLEAN)));
    }

    #[test]
    fn test_violation_triggers_deep_analysis_and_promotion() {
        let src = "def first(items)\n  # FIXME: callers pass empty lists\n  items[0]\nend\n";
        let report = analyzer().analyze(&unit(src, "a.rb"), false).unwrap();
        assert_eq!(report.violations[0].rule_id, "BH004");
        let hunt = report.bug_hunt.unwrap();
        assert_eq!(hunt.reason, EscalationReason::CatalogMatches);
        assert_eq!(hunt.phase(Phase::PatternMatching).unwrap().status, PhaseStatus::Failed);
        assert_eq!(hunt.promoted().len(), 1);
        assert_eq!(hunt.phase(Phase::VerificationChecklist).unwrap().status, PhaseStatus::Passed);
    }

    #[test]
    fn test_lexical_flags_alone_stay_shallow() {
        let u = unit("if done == true\n  puts 'ok'\nend\n", "a.rb");
        let report = analyzer().analyze(&u, false).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule_id, "LEX003");
        assert!(report.bug_hunt.is_none());

        let forced = analyzer().analyze(&u, true).unwrap();
        assert_eq!(forced.bug_hunt.unwrap().reason, EscalationReason::Forced);
    }

    #[test]
    fn test_failure_streak_escalates_a_unit_without_violations() {
        let a = analyzer();
        let u = unit("def hello(name)\n  puts name\nend\n", "a.rb");
        assert!(a.analyze(&u, false).unwrap().bug_hunt.is_none());

        for _ in 0..3 {
            a.pipeline().ladder().record_verification(&u, false).unwrap();
        }
        let report = a.analyze(&u, false).unwrap();
        assert!(report.violations.is_empty());
        assert!(report.human_escalation_required);
        let hunt = report.bug_hunt.unwrap();
        assert_eq!(hunt.reason, EscalationReason::RepeatedVerificationFailure);
        assert_eq!(hunt.phases.len(), 8);
    }

    #[test]
    fn test_oversized_input_is_rejected() {
        let config = Config::default();
        let big = "puts 'hello world'; 1+1\n".repeat(2000);
        let err = CodeUnit::new(big.clone(), None, config.max_input_bytes).unwrap_err();
        assert!(matches!(err, InputError::SizeExceeded { .. }));

        // A unit built under a looser bound is re-checked by run
        let u = CodeUnit::new(big, None, usize::MAX).unwrap();
        let err = analyzer().analyze(&u, false).unwrap_err();
        assert!(matches!(err, HuntError::Input(InputError::SizeExceeded { .. })));
    }

    #[test]
    fn test_runs_are_deterministic() {
        let src = "def f(a, b, xs)\n  xs[0]\n  a / b # XXX\nend\n";
        let a = analyzer();
        let first = a.analyze(&unit(src, "a.rb"), false).unwrap();
        let second = a.analyze(&unit(src, "a.rb"), false).unwrap();
        assert_eq!(first, second);
    }
}
