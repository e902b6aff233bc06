//! Diagnostic escalation ladder
//!
//! Decides how deep a unit is analyzed and counts consecutive verification
//! failures per unit. The count lives behind [`FailureLedger`] so it can be
//! persisted by the session store and survive restarts.

use crate::error::HuntResult;
use crate::report::EscalationReason;
use crate::unit::CodeUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Consecutive verification failures keyed by unit fingerprint
pub trait FailureLedger: Send + Sync {
    fn streak(&self, fingerprint: &str) -> HuntResult<u32>;

    /// Record one verification outcome and return the new streak
    fn record(&self, fingerprint: &str, passed: bool) -> HuntResult<u32>;
}

/// Ledger that forgets everything when dropped
#[derive(Debug, Default)]
pub struct MemoryLedger {
    streaks: Mutex<HashMap<String, u32>>,
}

impl FailureLedger for MemoryLedger {
    fn streak(&self, fingerprint: &str) -> HuntResult<u32> {
        let streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(streaks.get(fingerprint).copied().unwrap_or(0))
    }

    fn record(&self, fingerprint: &str, passed: bool) -> HuntResult<u32> {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        if passed {
            streaks.remove(fingerprint);
            return Ok(0);
        }
        let streak = streaks.entry(fingerprint.to_string()).or_insert(0);
        *streak += 1;
        Ok(*streak)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    /// Phases 1-3
    Shallow,
    /// All eight phases
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub depth: Depth,
    pub reason: Option<EscalationReason>,
    pub human_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum LadderVerdict {
    Continue { streak: u32 },
    MandatoryHuman { streak: u32 },
}

impl LadderVerdict {
    pub fn requires_human(&self) -> bool {
        matches!(self, LadderVerdict::MandatoryHuman { .. })
    }
}

pub struct EscalationLadder {
    threshold: u32,
    ledger: Arc<dyn FailureLedger>,
}

impl std::fmt::Debug for EscalationLadder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationLadder")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl EscalationLadder {
    pub fn new(threshold: u32, ledger: Arc<dyn FailureLedger>) -> Self {
        Self { threshold, ledger }
    }

    pub fn in_memory(threshold: u32) -> Self {
        Self::new(threshold, Arc::new(MemoryLedger::default()))
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Depth for a unit whose phase 3 scan found `catalog_matches` catalog matches.
    ///
    /// Lexical flags alone never deepen analysis.
    pub fn assess(
        &self,
        unit: &CodeUnit,
        catalog_matches: usize,
        forced: bool,
    ) -> HuntResult<Escalation> {
        let streak = self.ledger.streak(&unit.fingerprint())?;
        let escalation = if streak >= self.threshold {
            Escalation {
                depth: Depth::Deep,
                reason: Some(EscalationReason::RepeatedVerificationFailure),
                human_required: true,
            }
        } else if forced {
            Escalation {
                depth: Depth::Deep,
                reason: Some(EscalationReason::Forced),
                human_required: false,
            }
        } else if catalog_matches > 0 {
            Escalation {
                depth: Depth::Deep,
                reason: Some(EscalationReason::CatalogMatches),
                human_required: false,
            }
        } else {
            Escalation {
                depth: Depth::Shallow,
                reason: None,
                human_required: false,
            }
        };
        tracing::debug!(
            unit = %unit.display_name(),
            streak,
            depth = ?escalation.depth,
            "ladder assessed"
        );
        Ok(escalation)
    }

    /// Record a verification outcome; failures extend the unit's streak
    pub fn record_verification(&self, unit: &CodeUnit, passed: bool) -> HuntResult<LadderVerdict> {
        let streak = self.ledger.record(&unit.fingerprint(), passed)?;
        if streak >= self.threshold {
            tracing::warn!(
                unit = %unit.display_name(),
                streak,
                "verification failed {} times in a row; human review required",
                streak
            );
            Ok(LadderVerdict::MandatoryHuman { streak })
        } else {
            Ok(LadderVerdict::Continue { streak })
        }
    }

    /// A deliberation with no usable proposal counts as a failed verification
    pub fn record_no_quorum(&self, unit: &CodeUnit) -> HuntResult<LadderVerdict> {
        self.record_verification(unit, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> CodeUnit {
        CodeUnit::new("x = items[0]\n", None, 1024).unwrap()
    }

    #[test]
    fn test_shallow_by_default() {
        let ladder = EscalationLadder::in_memory(3);
        let e = ladder.assess(&unit(), 0, false).unwrap();
        assert_eq!(e.depth, Depth::Shallow);
        assert!(e.reason.is_none());
    }

    #[test]
    fn test_violations_or_force_escalate() {
        let ladder = EscalationLadder::in_memory(3);
        let e = ladder.assess(&unit(), 2, false).unwrap();
        assert_eq!(e.reason, Some(EscalationReason::CatalogMatches));
        let e = ladder.assess(&unit(), 0, true).unwrap();
        assert_eq!(e.reason, Some(EscalationReason::Forced));
        assert!(!e.human_required);
    }

    #[test]
    fn test_third_consecutive_failure_requires_human() {
        let ladder = EscalationLadder::in_memory(3);
        let u = unit();
        assert_eq!(
            ladder.record_verification(&u, false).unwrap(),
            LadderVerdict::Continue { streak: 1 }
        );
        assert_eq!(
            ladder.record_no_quorum(&u).unwrap(),
            LadderVerdict::Continue { streak: 2 }
        );
        let third = ladder.record_verification(&u, false).unwrap();
        assert!(third.requires_human());

        let e = ladder.assess(&u, 0, false).unwrap();
        assert!(e.human_required);
        assert_eq!(e.depth, Depth::Deep);
    }

    #[test]
    fn test_success_resets_streak() {
        let ladder = EscalationLadder::in_memory(3);
        let u = unit();
        ladder.record_verification(&u, false).unwrap();
        ladder.record_verification(&u, false).unwrap();
        ladder.record_verification(&u, true).unwrap();
        assert_eq!(
            ladder.record_verification(&u, false).unwrap(),
            LadderVerdict::Continue { streak: 1 }
        );
    }
}
