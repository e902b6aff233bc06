//! Phase 8: verification checklist
//!
//! A skeleton is promoted only when it addresses its hypothesis, stays
//! inside the enclosing block, and is a well-formed patch.

use super::recon::Inventory;
use crate::diff::{apply_diff, parse_unified_diff, DiffLine, UnifiedDiff};
use crate::report::{CheckResult, CheckStatus, Hypothesis, ProposalSkeleton};
use crate::unit::CodeUnit;
use crate::util::{blank_strings, source_lines};
use regex::Regex;

pub const ADDRESSES_HYPOTHESIS: &str = "addresses_hypothesis";
pub const SCOPED: &str = "scoped";
pub const WELL_FORMED: &str = "well_formed";

/// Run the checklist over every skeleton and mark the ones that pass
pub fn verify(
    unit: &CodeUnit,
    inventory: &Inventory,
    hypotheses: &[Hypothesis],
    skeletons: Vec<ProposalSkeleton>,
    max_fix_lines: usize,
) -> Vec<ProposalSkeleton> {
    skeletons
        .into_iter()
        .map(|mut skeleton| {
            let parsed = parse_unified_diff(&skeleton.diff);
            let hypothesis = hypotheses.iter().find(|h| h.id == skeleton.hypothesis_id);
            let checks = vec![
                addresses_hypothesis(parsed.as_ref().ok(), hypothesis),
                scoped(parsed.as_ref().ok(), hypothesis, inventory, unit, max_fix_lines),
                well_formed(unit, &skeleton.diff),
            ];
            skeleton.promoted = checks.iter().all(|c| c.status == CheckStatus::Pass);
            skeleton.checks = checks;
            skeleton
        })
        .collect()
}

fn result(name: &str, pass: bool, detail: impl Into<String>) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        status: if pass { CheckStatus::Pass } else { CheckStatus::Fail },
        detail: detail.into(),
    }
}

fn addresses_hypothesis(diff: Option<&UnifiedDiff>, hypothesis: Option<&Hypothesis>) -> CheckResult {
    let (Some(diff), Some(h)) = (diff, hypothesis) else {
        return result(ADDRESSES_HYPOTHESIS, false, "diff or hypothesis missing");
    };
    let subject = Regex::new(&format!(r"\b{}\b", regex::escape(&h.subject))).ok();
    let covers_line = diff.hunks.iter().any(|hunk| {
        let (start, end) = hunk.old_range();
        start <= h.line && h.line <= end
    });
    let mentions_subject = diff.hunks.iter().flat_map(|hunk| &hunk.lines).any(|l| match l {
        DiffLine::Add(text) => subject.as_ref().is_some_and(|re| re.is_match(text)),
        _ => false,
    });
    match (covers_line, mentions_subject) {
        (true, true) => result(ADDRESSES_HYPOTHESIS, true, format!("guards `{}` at line {}", h.subject, h.line)),
        (false, _) => result(ADDRESSES_HYPOTHESIS, false, format!("no hunk covers line {}", h.line)),
        (true, false) => result(ADDRESSES_HYPOTHESIS, false, format!("added lines never mention `{}`", h.subject)),
    }
}

/// Original line numbers a hunk changes; an insertion lands before its position
fn change_positions(diff: &UnifiedDiff) -> Vec<usize> {
    let mut positions = Vec::new();
    for hunk in &diff.hunks {
        let mut old_line = hunk.old_start.max(1);
        for line in &hunk.lines {
            match line {
                DiffLine::Context(_) => old_line += 1,
                DiffLine::Remove(_) => {
                    positions.push(old_line);
                    old_line += 1;
                }
                DiffLine::Add(_) => positions.push(old_line),
            }
        }
    }
    positions
}

fn scoped(
    diff: Option<&UnifiedDiff>,
    hypothesis: Option<&Hypothesis>,
    inventory: &Inventory,
    unit: &CodeUnit,
    max_fix_lines: usize,
) -> CheckResult {
    let (Some(diff), Some(h)) = (diff, hypothesis) else {
        return result(SCOPED, false, "diff or hypothesis missing");
    };
    let (added, _) = diff.stats();
    if added > max_fix_lines {
        return result(SCOPED, false, format!("adds {} lines, limit is {}", added, max_fix_lines));
    }
    let (low, high, what) = match inventory.enclosing_block(h.line) {
        Some(block) => (block.line + 1, block.end_line, format!("`{}` block at lines {}-{}", block.keyword, block.line, block.end_line)),
        None => (1, unit.line_count() + 1, "file".to_string()),
    };
    match change_positions(diff).into_iter().find(|p| *p < low || *p > high) {
        Some(p) => result(SCOPED, false, format!("change at line {} escapes the {}", p, what)),
        None => result(SCOPED, true, format!("{} added lines within the {}", added, what)),
    }
}

/// Parses, applies cleanly, and leaves bracket balance unchanged
pub fn well_formed(unit: &CodeUnit, diff_text: &str) -> CheckResult {
    let diff = match parse_unified_diff(diff_text) {
        Ok(diff) => diff,
        Err(e) => return result(WELL_FORMED, false, format!("diff does not parse: {}", e)),
    };
    let patched = match apply_diff(unit.source(), &diff) {
        Ok(text) => text,
        Err(e) => return result(WELL_FORMED, false, format!("diff does not apply: {}", e)),
    };
    let Ok(patched_unit) = unit.revised(patched, usize::MAX) else {
        return result(WELL_FORMED, false, "patched text is not valid source");
    };
    let before = bracket_balance(unit);
    let after = bracket_balance(&patched_unit);
    if before != after {
        return result(
            WELL_FORMED,
            false,
            format!("bracket balance changes from {:?} to {:?}", before, after),
        );
    }
    result(WELL_FORMED, true, "applies cleanly with balanced brackets")
}

/// Net `()`, `[]`, `{}` counts over code, ignoring strings and comments
pub fn bracket_balance(unit: &CodeUnit) -> [i64; 3] {
    let mut balance = [0i64; 3];
    for line in source_lines(unit) {
        for c in blank_strings(line.code).chars() {
            match c {
                '(' => balance[0] += 1,
                ')' => balance[0] -= 1,
                '[' => balance[1] += 1,
                ']' => balance[1] -= 1,
                '{' => balance[2] += 1,
                '}' => balance[2] -= 1,
                _ => {}
            }
        }
    }
    balance
}
