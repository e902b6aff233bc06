//! Phase 7: fix design
//!
//! Turns the top-ranked hypotheses into guard-insertion skeletons. A
//! skeleton is a unified diff that adds a guard right before the line that
//! relies on the assumption.

use crate::diff::insertion_diff;
use crate::report::{AssumptionKind, Hypothesis, ProposalSkeleton};
use crate::unit::{CodeUnit, Language};
use crate::util::source_lines;

/// Skeletons for up to `limit` open hypotheses, in ranked order
pub fn design(unit: &CodeUnit, ranked: &[Hypothesis], limit: usize) -> Vec<ProposalSkeleton> {
    ranked
        .iter()
        .filter(|h| h.is_open())
        .take(limit)
        .filter_map(|h| skeleton_for(unit, h))
        .collect()
}

fn skeleton_for(unit: &CodeUnit, h: &Hypothesis) -> Option<ProposalSkeleton> {
    // Compound subjects (`users.find`, `h[:key]`) need a rewrite, not a guard
    if !h.subject.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let lines = source_lines(unit);
    let use_line = lines.iter().find(|l| l.number == h.line)?;
    let indent = use_line.indent().to_string();
    let body = guard_lines(unit.language(), h.assumption, &h.subject)?;
    let step = indent_step(unit.language(), &indent);

    let guard: Vec<String> = body
        .iter()
        .map(|(depth, text)| format!("{}{}{}", indent, step.repeat(*depth), text))
        .collect();

    let diff = insertion_diff(&unit.display_name(), unit.source(), h.line, &guard, 1).ok()?;
    Some(ProposalSkeleton {
        hypothesis_id: h.id.clone(),
        diff: diff.render(),
        justification: format!(
            "{}: guard `{}` before line {}. {}",
            h.id, h.subject, h.line, h.challenge
        ),
        checks: Vec::new(),
        promoted: false,
    })
}

fn indent_step(language: Language, indent: &str) -> &'static str {
    if indent.contains('\t') || language == Language::Go {
        return "\t";
    }
    match language {
        Language::Python | Language::Rust => "    ",
        _ => "  ",
    }
}

/// Guard template as (extra indent depth, text) pairs
fn guard_lines(
    language: Language,
    assumption: AssumptionKind,
    s: &str,
) -> Option<Vec<(usize, String)>> {
    use AssumptionKind::*;

    let one = |text: String| Some(vec![(0, text)]);
    let block = |open: String, body: &str, close: &str| {
        Some(vec![(0, open), (1, body.to_string()), (0, close.to_string())])
    };

    match language {
        Language::Ruby => match assumption {
            NeverEmpty => one(format!("return if {s}.nil? || {s}.empty?")),
            NeverNil => one(format!("return if {s}.nil?")),
            NeverZero => one(format!("return if {s}.nil? || {s}.zero?")),
            WellFormedInput => one(format!(r"return unless {s}.to_s.match?(/\A-?\d+(\.\d+)?\z/)")),
            NeverFails => None,
        },
        Language::Python => {
            let cond = match assumption {
                NeverEmpty => format!("if not {s}:"),
                NeverNil => format!("if {s} is None:"),
                NeverZero => format!("if not {s}:"),
                WellFormedInput => format!("if not str({s}).strip().lstrip('-').isdigit():"),
                NeverFails => return None,
            };
            Some(vec![(0, cond), (1, "return None".to_string())])
        }
        Language::JavaScript | Language::TypeScript => match assumption {
            NeverEmpty => one(format!("if (!{s} || {s}.length === 0) return;")),
            NeverNil | NeverFails => one(format!("if ({s} == null) return;")),
            NeverZero => one(format!("if (!{s}) return;")),
            WellFormedInput => one(format!("if (Number.isNaN(Number({s}))) return;")),
        },
        Language::Rust => match assumption {
            NeverEmpty => block(format!("if {s}.is_empty() {{"), "return Default::default();", "}"),
            NeverZero => block(format!("if {s} == 0 {{"), "return Default::default();", "}"),
            NeverNil | NeverFails | WellFormedInput => None,
        },
        Language::Go => match assumption {
            NeverEmpty => block(format!("if len({s}) == 0 {{"), "return", "}"),
            NeverNil => block(format!("if {s} == nil {{"), "return", "}"),
            NeverZero => block(format!("if {s} == 0 {{"), "return", "}"),
            NeverFails | WellFormedInput => None,
        },
        Language::Unknown => None,
    }
}
