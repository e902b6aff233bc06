//! Phase 6: hypothesis ranking

use crate::report::Hypothesis;
use std::cmp::Ordering;

/// Order open hypotheses by evidence weight, then severity, then how early
/// and where they were raised. Discarded ones follow in creation order.
pub fn rank(hypotheses: &mut [Hypothesis]) {
    hypotheses.sort_by(compare);
}

fn compare(a: &Hypothesis, b: &Hypothesis) -> Ordering {
    match (a.is_open(), b.is_open()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => return id_number(&a.id).cmp(&id_number(&b.id)),
        (true, true) => {}
    }
    b.weight()
        .cmp(&a.weight())
        .then_with(|| b.severity.cmp(&a.severity))
        .then_with(|| a.first_phase.cmp(&b.first_phase))
        .then_with(|| a.line.cmp(&b.line))
        .then_with(|| id_number(&a.id).cmp(&id_number(&b.id)))
}

/// `H12` sorts after `H2`
fn id_number(id: &str) -> usize {
    id.trim_start_matches('H').parse().unwrap_or(usize::MAX)
}
