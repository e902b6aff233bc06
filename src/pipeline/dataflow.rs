//! Phase 5: data flow tracing
//!
//! Follows each open hypothesis back to the most recent assignment of its
//! subject and weighs what it finds there.

use super::recon::Inventory;
use crate::report::{AssumptionKind, Evidence, Hypothesis, HypothesisStatus, Phase};
use regex::Regex;
use std::sync::OnceLock;

fn external_source_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(gets|params|read\w*|input|env|ENV|request|args|argv|recv\w*|load\w*|find\w*|get\w*|fetch|parse\w*|stdin|readline)\b",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

/// What a literal right-hand side says about an assumption
#[derive(Debug, Clone, PartialEq, Eq)]
enum LiteralVerdict {
    Satisfies,
    Violates,
    Unrelated,
}

/// Adjust hypotheses in place. Returns the ids that gained evidence.
pub fn trace(hypotheses: &mut [Hypothesis], inventory: &Inventory) -> Vec<String> {
    let mut touched = Vec::new();
    for h in hypotheses.iter_mut().filter(|h| h.is_open()) {
        if let Some(assignment) = inventory.last_assignment_before(&h.subject, h.line) {
            let rhs = assignment
                .rhs
                .trim()
                .trim_end_matches([';', ','])
                .trim();
            match literal_verdict(h.assumption, rhs) {
                LiteralVerdict::Satisfies => {
                    h.status = HypothesisStatus::Discarded(format!(
                        "`{}` is assigned `{}` on line {}",
                        h.subject, rhs, assignment.line
                    ));
                    touched.push(h.id.clone());
                    continue;
                }
                LiteralVerdict::Violates => {
                    h.evidence.push(Evidence {
                        phase: Phase::DataFlowTracing,
                        observation: format!(
                            "assigned `{}` on line {}, which breaks the assumption",
                            rhs, assignment.line
                        ),
                        weight: 2,
                    });
                    touched.push(h.id.clone());
                    continue;
                }
                LiteralVerdict::Unrelated => {}
            }
            if let Some(m) = external_source_re().find(rhs) {
                h.evidence.push(Evidence {
                    phase: Phase::DataFlowTracing,
                    observation: format!(
                        "assigned from external source `{}` on line {}",
                        m.as_str(),
                        assignment.line
                    ),
                    weight: 2,
                });
                touched.push(h.id.clone());
            }
        } else if let Some(def) = inventory.parameter_of(&h.subject, h.line) {
            h.evidence.push(Evidence {
                phase: Phase::DataFlowTracing,
                observation: format!(
                    "parameter of `{}` reaches line {} unguarded",
                    def.name, h.line
                ),
                weight: 1,
            });
            touched.push(h.id.clone());
        }
    }
    touched
}

fn literal_verdict(assumption: AssumptionKind, rhs: &str) -> LiteralVerdict {
    use LiteralVerdict::*;

    if matches!(rhs, "nil" | "null" | "None" | "undefined") {
        return match assumption {
            AssumptionKind::WellFormedInput => Unrelated,
            _ => Violates,
        };
    }
    if let Some(value) = number_literal(rhs) {
        return match assumption {
            AssumptionKind::NeverZero if value == 0.0 => Violates,
            AssumptionKind::NeverZero | AssumptionKind::NeverNil => Satisfies,
            AssumptionKind::WellFormedInput => Satisfies,
            _ => Unrelated,
        };
    }
    if let Some(content) = string_literal(rhs) {
        return match assumption {
            AssumptionKind::NeverEmpty if content.is_empty() => Violates,
            AssumptionKind::NeverEmpty | AssumptionKind::NeverNil => Satisfies,
            AssumptionKind::WellFormedInput if number_literal(content).is_some() => Satisfies,
            AssumptionKind::WellFormedInput => Violates,
            _ => Unrelated,
        };
    }
    if let Some(items) = collection_literal(rhs) {
        return match assumption {
            AssumptionKind::NeverEmpty if items.trim().is_empty() => Violates,
            AssumptionKind::NeverEmpty | AssumptionKind::NeverNil => Satisfies,
            _ => Unrelated,
        };
    }
    if rhs.starts_with("Some(") || rhs.starts_with("Ok(") {
        return match assumption {
            AssumptionKind::NeverFails | AssumptionKind::NeverNil => Satisfies,
            _ => Unrelated,
        };
    }
    if rhs.starts_with("Err(") && assumption == AssumptionKind::NeverFails {
        return Violates;
    }
    if matches!(rhs, "true" | "false" | "True" | "False") && assumption == AssumptionKind::NeverNil {
        return Satisfies;
    }
    Unrelated
}

fn number_literal(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let cleaned = cleaned.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn string_literal(text: &str) -> Option<&str> {
    for quote in ['"', '\'', '`'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

fn collection_literal(text: &str) -> Option<&str> {
    let text = text
        .strip_prefix("vec!")
        .or_else(|| text.strip_prefix("%w"))
        .or_else(|| text.strip_prefix("%i"))
        .unwrap_or(text);
    for (open, close) in [('[', ']'), ('{', '}')] {
        if text.len() >= 2 && text.starts_with(open) && text.ends_with(close) {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::assumptions::interrogate;
    use crate::pipeline::recon::survey;
    use crate::unit::CodeUnit;
    use std::path::PathBuf;

    fn traced(src: &str, name: &str) -> Vec<Hypothesis> {
        let unit = CodeUnit::new(src, Some(PathBuf::from(name)), 32 * 1024).unwrap();
        let inventory = survey(&unit);
        let mut hypotheses = interrogate(&unit, &inventory).hypotheses;
        trace(&mut hypotheses, &inventory);
        hypotheses
    }

    #[test]
    fn test_external_source_upgrades() {
        let h = traced("def f\n  ids = params[:ids]\n  ids[0]\nend\n", "a.rb");
        let h = h.iter().find(|h| h.subject == "ids").unwrap();
        assert_eq!(h.weight(), 3);
        assert!(h.is_open());
    }

    #[test]
    fn test_nonzero_literal_discards() {
        let h = traced("def f(total)\n  n = 4\n  total / n\nend\n", "a.rb");
        assert_eq!(h.len(), 1);
        assert!(!h[0].is_open());
    }

    #[test]
    fn test_zero_literal_confirms() {
        let h = traced("def f(total)\n  n = 0\n  total / n\nend\n", "a.rb");
        assert!(h[0].is_open());
        assert_eq!(h[0].weight(), 3);
    }

    #[test]
    fn test_parameter_upgrades_by_one() {
        let h = traced("def first(items)\n  items[0]\nend\n", "a.rb");
        assert_eq!(h[0].weight(), 2);
        assert_eq!(h[0].evidence[1].phase, Phase::DataFlowTracing);
    }

    #[test]
    fn test_no_provenance_leaves_hypothesis_unchanged() {
        let h = traced("items[0]\n", "a.rb");
        assert_eq!(h[0].weight(), 1);
        assert!(h[0].is_open());
    }

    #[test]
    fn test_literal_verdicts() {
        assert_eq!(literal_verdict(AssumptionKind::NeverEmpty, "[1, 2]"), LiteralVerdict::Satisfies);
        assert_eq!(literal_verdict(AssumptionKind::NeverEmpty, "[]"), LiteralVerdict::Violates);
        assert_eq!(literal_verdict(AssumptionKind::NeverNil, "nil"), LiteralVerdict::Violates);
        assert_eq!(literal_verdict(AssumptionKind::WellFormedInput, "\"42\""), LiteralVerdict::Satisfies);
        assert_eq!(literal_verdict(AssumptionKind::NeverZero, "x + 1"), LiteralVerdict::Unrelated);
    }
}
