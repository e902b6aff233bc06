//! Convergence loop
//!
//! Drives each queued unit through repeated cycles of
//! analyze, prioritize, deliberate, apply-or-ask, validate and reflect until
//! a stop condition fires. Units run concurrently up to `worker_count`.
//!
//! Improvement per cycle is measured over findings: catalog and lexical
//! violations plus open hypotheses, compared by signature so that line
//! shifts from an applied patch do not count as change.

use crate::autonomy::{self, Decision, Outcome};
use crate::catalog::PatternCatalog;
use crate::chamber::{Chamber, Deliberation, ParticipantOutcome};
use crate::config::Config;
use crate::diff::{apply_diff, UnifiedDiff};
use crate::error::{HuntError, HuntResult};
use crate::ladder::{EscalationLadder, FailureLedger, LadderVerdict};
use crate::pipeline::{Analyzer, PhasePipeline};
use crate::report::{ProposalSkeleton, Report};
use crate::store::{SessionStatus, SessionStore};
use crate::unit::CodeUnit;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanAnswer {
    Approve,
    Reject,
}

/// Whoever confirms patches the autonomy engine will not apply alone
pub trait HumanGate: Send + Sync {
    /// Ask about one consolidated patch. `None` means nobody answered.
    fn request<'a>(
        &'a self,
        decision: &'a Decision,
        report: &'a Report,
        diff: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<HumanAnswer>> + Send + 'a>>;
}

/// Gate for unattended runs: every question goes unanswered
#[derive(Debug, Default, Clone, Copy)]
pub struct Unattended;

impl HumanGate for Unattended {
    fn request<'a>(
        &'a self,
        _decision: &'a Decision,
        _report: &'a Report,
        _diff: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<HumanAnswer>> + Send + 'a>> {
        Box::pin(async { None })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No violations and no open hypotheses
    Clean,
    /// Improvement stayed under the plateau threshold for enough cycles
    Converged,
    MaxCycles,
    /// A question went unanswered or no participant produced a proposal
    Paused,
    HumanEscalation,
    Interrupted,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::Clean => "clean",
            StopReason::Converged => "converged",
            StopReason::MaxCycles => "max cycles",
            StopReason::Paused => "paused",
            StopReason::HumanEscalation => "human escalation",
            StopReason::Interrupted => "interrupted",
        }
    }

    fn session_status(&self) -> SessionStatus {
        match self {
            StopReason::Clean | StopReason::Converged | StopReason::MaxCycles => {
                SessionStatus::Completed
            }
            StopReason::Paused => SessionStatus::Paused,
            StopReason::HumanEscalation => SessionStatus::Escalated,
            StopReason::Interrupted => SessionStatus::Interrupted,
        }
    }
}

/// Audit record of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u32,
    pub findings_before: usize,
    pub findings_after: usize,
    pub resolved: usize,
    pub introduced: usize,
    pub metric: f64,
    pub promoted: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deliberation: Option<Deliberation>,
    /// Participant outcomes of a deliberation that reached no quorum
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_outcomes: Vec<ParticipantOutcome>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub answer: Option<HumanAnswer>,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub verdict: Option<LadderVerdict>,
    pub note: String,
}

impl CycleRecord {
    fn new(cycle: u32, findings_before: usize, promoted: usize) -> Self {
        Self {
            cycle,
            findings_before,
            findings_after: findings_before,
            resolved: 0,
            introduced: 0,
            metric: 0.0,
            promoted,
            deliberation: None,
            failed_outcomes: Vec::new(),
            decision: None,
            answer: None,
            applied: false,
            verdict: None,
            note: String::new(),
        }
    }
}

/// How one queued unit ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub stop: StopReason,
    pub cycles: Vec<CycleRecord>,
    /// Unit text after every applied patch
    pub source: String,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub report: Option<Report>,
}

#[derive(Serialize)]
struct SessionPayload<'a> {
    unit: &'a str,
    fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<StopReason>,
    cycles: &'a [CycleRecord],
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a Report>,
}

struct UnitState {
    name: String,
    original: String,
    unit: CodeUnit,
    /// Once a unit needed deep analysis it keeps getting it
    deep: bool,
    plateau: u32,
    cycles: Vec<CycleRecord>,
    session_id: Option<String>,
    report: Option<Report>,
}

/// What apply-or-ask settled on for one deliberation
enum Settled {
    Patched(CodeUnit),
    Rejected,
    Unappliable(String),
    Paused,
    Interrupted,
}

pub struct ConvergenceLoop {
    config: Arc<Config>,
    analyzer: Arc<Analyzer>,
    chamber: Arc<Chamber>,
    store: Arc<SessionStore>,
    gate: Arc<dyn HumanGate>,
}

impl std::fmt::Debug for ConvergenceLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceLoop")
            .field("config", &self.config)
            .field("chamber", &self.chamber)
            .field("store", &self.store.dir())
            .finish_non_exhaustive()
    }
}

impl ConvergenceLoop {
    /// Loop whose escalation ladder keeps its failure streaks in `store`
    pub fn new(
        config: Arc<Config>,
        chamber: Arc<Chamber>,
        store: Arc<SessionStore>,
        gate: Arc<dyn HumanGate>,
    ) -> Self {
        let ledger: Arc<dyn FailureLedger> = store.clone();
        let ladder = Arc::new(EscalationLadder::new(config.repeat_failure_threshold, ledger));
        let pipeline = PhasePipeline::new(config.clone(), Arc::new(PatternCatalog::new()), ladder);
        Self {
            config,
            analyzer: Arc::new(Analyzer::new(pipeline)),
            chamber,
            store,
            gate,
        }
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// Converge every unit in `queue`. Outcomes come back in queue order.
    ///
    /// A persistence failure aborts the whole run; everything else ends the
    /// affected unit with a [`StopReason`].
    pub async fn run(
        &self,
        queue: Vec<CodeUnit>,
        cancel: CancellationToken,
    ) -> HuntResult<Vec<UnitOutcome>> {
        let workers = self.config.worker_count.max(1);
        tracing::info!(units = queue.len(), workers, "convergence run started");

        let mut outcomes: Vec<(usize, UnitOutcome)> = stream::iter(queue.into_iter().enumerate())
            .map(|(index, unit)| {
                let cancel = cancel.clone();
                async move { self.converge(unit, &cancel).await.map(|o| (index, o)) }
            })
            .buffer_unordered(workers)
            .try_collect()
            .await?;
        outcomes.sort_by_key(|(index, _)| *index);
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    async fn converge(&self, unit: CodeUnit, cancel: &CancellationToken) -> HuntResult<UnitOutcome> {
        let mut state = UnitState {
            name: unit.display_name(),
            original: unit.source().to_string(),
            unit,
            deep: false,
            plateau: 0,
            cycles: Vec::new(),
            session_id: None,
            report: None,
        };

        let stop = self.cycles(&mut state, cancel).await?;
        self.persist(&mut state, Some(stop)).await?;
        tracing::info!(
            unit = %state.name,
            stop = stop.label(),
            cycles = state.cycles.len(),
            "unit finished"
        );

        let source = state.unit.source().to_string();
        Ok(UnitOutcome {
            unit: state.name,
            stop,
            cycles: state.cycles,
            changed: source != state.original,
            source,
            session_id: state.session_id,
            report: state.report,
        })
    }

    async fn cycles(&self, state: &mut UnitState, cancel: &CancellationToken) -> HuntResult<StopReason> {
        for cycle in 1..=self.config.max_cycles {
            if cancel.is_cancelled() {
                return Ok(StopReason::Interrupted);
            }

            // analyze
            let report = self.analyze(&state.unit, state.deep).await?;
            state.deep |= report.bug_hunt.is_some();
            let before = findings(&report);
            tracing::info!(
                unit = %state.name,
                cycle,
                findings = before.len(),
                deep = state.deep,
                "cycle started"
            );
            if report.human_escalation_required {
                state.report = Some(report);
                return Ok(StopReason::HumanEscalation);
            }
            if before.is_empty() {
                state.report = Some(report);
                return Ok(StopReason::Clean);
            }

            // prioritize
            let skeletons: Vec<ProposalSkeleton> = report
                .bug_hunt
                .as_ref()
                .map(|hunt| hunt.promoted().into_iter().cloned().collect())
                .unwrap_or_default();
            let mut record = CycleRecord::new(cycle, before.len(), skeletons.len());

            // deliberate, then apply or ask
            let settled = if skeletons.is_empty() {
                record.note = "no fix passed verification".to_string();
                Settled::Unappliable(record.note.clone())
            } else {
                let deliberated = self.chamber.deliberate(&report, &skeletons, cancel.clone()).await;
                match deliberated {
                    Ok(deliberation) => {
                        let settled = self
                            .apply_or_ask(&state.unit, &report, &deliberation, &mut record, cancel)
                            .await?;
                        record.deliberation = Some(deliberation);
                        settled
                    }
                    Err(HuntError::NoQuorum { outcomes }) => {
                        record.failed_outcomes = outcomes;
                        record.note = "no participant returned a usable proposal".to_string();
                        let verdict = self.record(&state.unit, None).await?;
                        record.verdict = Some(verdict);
                        state.cycles.push(record);
                        state.report = Some(report);
                        self.persist(state, None).await?;
                        return Ok(if verdict.requires_human() {
                            StopReason::HumanEscalation
                        } else {
                            StopReason::Paused
                        });
                    }
                    Err(HuntError::Cancelled) => Settled::Interrupted,
                    Err(e) => return Err(e),
                }
            };

            // validate
            let mut stop = None;
            match settled {
                Settled::Patched(patched) => {
                    let after_report = self.analyze(&patched, state.deep).await?;
                    let after = findings(&after_report);
                    let resolved = before.difference(&after).count();
                    let introduced = after.difference(&before).count();
                    let passed = introduced == 0 && resolved > 0;
                    record.findings_after = after.len();
                    record.resolved = resolved;
                    record.introduced = introduced;
                    record.metric =
                        (resolved as f64 - introduced as f64) / before.len().max(1) as f64;

                    let verdict = self.record(&state.unit, Some(passed)).await?;
                    record.verdict = Some(verdict);
                    if passed {
                        record.applied = true;
                        state.unit = patched;
                        state.report = Some(after_report);
                    } else {
                        record.note = format!(
                            "patch resolved {} and introduced {} findings; kept the previous text",
                            resolved, introduced
                        );
                        state.report = Some(report);
                    }
                    if verdict.requires_human() {
                        stop = Some(StopReason::HumanEscalation);
                    }
                }
                Settled::Unappliable(reason) => {
                    record.note = reason;
                    let verdict = self.record(&state.unit, Some(false)).await?;
                    record.verdict = Some(verdict);
                    state.report = Some(report);
                    if verdict.requires_human() {
                        stop = Some(StopReason::HumanEscalation);
                    }
                }
                Settled::Rejected => {
                    record.note = "patch rejected".to_string();
                    state.report = Some(report);
                }
                Settled::Paused => {
                    record.note = "no answer before the wait expired".to_string();
                    state.report = Some(report);
                    stop = Some(StopReason::Paused);
                }
                Settled::Interrupted => {
                    record.note = "cancelled".to_string();
                    state.report = Some(report);
                    stop = Some(StopReason::Interrupted);
                }
            }

            // reflect
            if record.metric < self.config.plateau_threshold {
                state.plateau += 1;
            } else {
                state.plateau = 0;
            }
            tracing::info!(
                unit = %state.name,
                cycle,
                metric = record.metric,
                applied = record.applied,
                plateau = state.plateau,
                "cycle finished"
            );
            state.cycles.push(record);
            self.persist(state, None).await?;

            if let Some(stop) = stop {
                return Ok(stop);
            }
            if state.plateau >= self.config.plateau_cycles {
                return Ok(StopReason::Converged);
            }
        }
        Ok(StopReason::MaxCycles)
    }

    async fn apply_or_ask(
        &self,
        unit: &CodeUnit,
        report: &Report,
        deliberation: &Deliberation,
        record: &mut CycleRecord,
        cancel: &CancellationToken,
    ) -> HuntResult<Settled> {
        let decision = autonomy::evaluate(report, &deliberation.patch, self.config.blast_radius_lines);
        record.decision = Some(decision);
        tracing::info!(unit = %report.unit, decision = %decision, "autonomy decision");

        if decision.outcome == Outcome::Ask {
            let wait = Duration::from_secs(self.config.human_wait_secs);
            let ask = tokio::time::timeout(
                wait,
                self.gate.request(&decision, report, &deliberation.diff),
            );
            let answer = tokio::select! {
                _ = cancel.cancelled() => return Ok(Settled::Interrupted),
                answer = ask => answer.ok().flatten(),
            };
            record.answer = answer;
            match answer {
                Some(HumanAnswer::Approve) => {}
                Some(HumanAnswer::Reject) => return Ok(Settled::Rejected),
                None => return Ok(Settled::Paused),
            }
        }

        Ok(match patch_unit(unit, &deliberation.patch, self.config.max_input_bytes) {
            Ok(patched) => Settled::Patched(patched),
            Err(reason) => Settled::Unappliable(reason),
        })
    }

    async fn analyze(&self, unit: &CodeUnit, deep: bool) -> HuntResult<Report> {
        let analyzer = self.analyzer.clone();
        let unit = unit.clone();
        blocking(move || analyzer.analyze(&unit, deep)).await
    }

    /// Record a verification outcome on the ladder; `None` records a no-quorum round
    async fn record(&self, unit: &CodeUnit, passed: Option<bool>) -> HuntResult<LadderVerdict> {
        let ladder = self.analyzer.pipeline().ladder().clone();
        let unit = unit.clone();
        blocking(move || match passed {
            Some(passed) => ladder.record_verification(&unit, passed),
            None => ladder.record_no_quorum(&unit),
        })
        .await
    }

    async fn persist(&self, state: &mut UnitState, stop: Option<StopReason>) -> HuntResult<()> {
        let payload = serde_json::to_value(SessionPayload {
            unit: &state.name,
            fingerprint: state.unit.fingerprint(),
            stop,
            cycles: &state.cycles,
            report: state.report.as_ref(),
        })?;
        let status = stop
            .map(|s| s.session_status())
            .unwrap_or(SessionStatus::InProgress);
        let store = self.store.clone();
        let id = state.session_id.clone();
        let session = blocking(move || match id {
            Some(id) => store.replace_session(&id, &payload, status),
            None => store.save_session_with_status(&payload, status),
        })
        .await?;
        state.session_id = Some(session.id);
        Ok(())
    }
}

/// Run file locking, disk I/O and analysis off the async workers
async fn blocking<T, F>(work: F) -> HuntResult<T>
where
    F: FnOnce() -> HuntResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(HuntError::Cancelled),
    }
}

/// Signatures of everything still wrong with a unit
fn findings(report: &Report) -> HashSet<(String, String)> {
    let mut out: HashSet<(String, String)> =
        report.violations.iter().map(|v| v.signature()).collect();
    if let Some(hunt) = &report.bug_hunt {
        out.extend(
            hunt.open_hypotheses()
                .map(|h| (h.assumption.describe(&h.subject), String::new())),
        );
    }
    out
}

/// Apply a consolidated patch to the unit it was made for
fn patch_unit(unit: &CodeUnit, patch: &[UnifiedDiff], max_bytes: usize) -> Result<CodeUnit, String> {
    let name = unit.display_name();
    if let Some(other) = patch.iter().find(|d| d.new_path != name) {
        return Err(format!("patch touches {} outside {}", other.new_path, name));
    }
    let mut text = unit.source().to_string();
    for diff in patch {
        text = apply_diff(&text, diff)?;
    }
    unit.revised(text, max_bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_unified_diff;

    #[test]
    fn test_patch_unit_rejects_foreign_files() {
        let unit = CodeUnit::new("a\nb\n", Some("x.rb".into()), 1024).unwrap();
        let foreign = parse_unified_diff("--- a/y.rb\n+++ b/y.rb\n@@ -1,1 +1,2 @@\n+z\n a\n").unwrap();
        assert!(patch_unit(&unit, &[foreign], 1024).unwrap_err().contains("y.rb"));

        let own = parse_unified_diff("--- a/x.rb\n+++ b/x.rb\n@@ -1,1 +1,2 @@\n+z\n a\n").unwrap();
        assert_eq!(patch_unit(&unit, &[own], 1024).unwrap().source(), "z\na\nb\n");
    }

    #[test]
    fn test_stop_reasons_map_to_session_status() {
        assert_eq!(StopReason::Clean.session_status(), SessionStatus::Completed);
        assert_eq!(StopReason::Paused.session_status(), SessionStatus::Paused);
        assert_eq!(StopReason::HumanEscalation.session_status(), SessionStatus::Escalated);
        assert_eq!(StopReason::Interrupted.session_status(), SessionStatus::Interrupted);
    }
}
