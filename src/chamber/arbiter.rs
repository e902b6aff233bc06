//! Arbitration over competing proposals
//!
//! Hunks from every successful proposal are grouped per file into conflict
//! clusters of transitively overlapping hunks. Independent clusters are all
//! kept. Inside a conflict the proposal citing the most distinct evidence
//! wins, then the lower configured priority, then the participant id.

use crate::diff::{DiffHunk, DiffLine, UnifiedDiff};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// What the arbiter needs to know about one proposal
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub participant_id: &'a str,
    pub priority: u32,
    pub cited: usize,
    pub diffs: Vec<UnifiedDiff>,
}

/// The winner of one conflict cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWinner {
    pub file: String,
    /// Original line span covered by the cluster (1-based, inclusive)
    pub lines: (usize, usize),
    pub participant_id: String,
    /// Participants whose hunks competed in this cluster, winner included
    pub contenders: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arbitration {
    pub diffs: Vec<UnifiedDiff>,
    pub winners: Vec<ClusterWinner>,
}

struct Tagged<'h> {
    candidate: usize,
    old_path: &'h str,
    hunk: &'h DiffHunk,
}

fn file_key(diff: &UnifiedDiff) -> &str {
    if diff.new_path == "/dev/null" {
        &diff.old_path
    } else {
        &diff.new_path
    }
}

/// Lower sorts first: more citations, then lower priority, then id
fn preference(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.cited
        .cmp(&a.cited)
        .then(a.priority.cmp(&b.priority))
        .then(a.participant_id.cmp(b.participant_id))
}

pub fn arbitrate(candidates: &[Candidate<'_>]) -> Arbitration {
    let mut by_file: BTreeMap<&str, Vec<Tagged<'_>>> = BTreeMap::new();
    for (idx, candidate) in candidates.iter().enumerate() {
        for diff in &candidate.diffs {
            for hunk in &diff.hunks {
                by_file.entry(file_key(diff)).or_default().push(Tagged {
                    candidate: idx,
                    old_path: &diff.old_path,
                    hunk,
                });
            }
        }
    }

    let mut arbitration = Arbitration::default();
    for (file, mut hunks) in by_file {
        hunks.sort_by_key(|t| (t.hunk.old_range(), t.candidate));

        let mut kept: Vec<DiffHunk> = Vec::new();
        let mut old_path = file;
        for cluster in clusters(&hunks) {
            let winner = cluster
                .iter()
                .map(|t| t.candidate)
                .min_by(|a, b| preference(&candidates[*a], &candidates[*b]))
                .unwrap_or(cluster[0].candidate);

            let mut contenders: Vec<String> = cluster
                .iter()
                .map(|t| candidates[t.candidate].participant_id.to_string())
                .collect();
            contenders.sort();
            contenders.dedup();

            let start = cluster.iter().map(|t| t.hunk.old_range().0).min().unwrap_or(1);
            let end = cluster.iter().map(|t| t.hunk.old_range().1).max().unwrap_or(start);
            if contenders.len() > 1 {
                tracing::debug!(
                    file,
                    start,
                    end,
                    winner = candidates[winner].participant_id,
                    "conflict resolved"
                );
            }
            arbitration.winners.push(ClusterWinner {
                file: file.to_string(),
                lines: (start, end),
                participant_id: candidates[winner].participant_id.to_string(),
                contenders,
            });

            for tagged in cluster.iter().filter(|t| t.candidate == winner) {
                old_path = tagged.old_path;
                kept.push(tagged.hunk.clone());
            }
        }

        renumber(&mut kept);
        arbitration.diffs.push(UnifiedDiff {
            old_path: old_path.to_string(),
            new_path: file.to_string(),
            hunks: kept,
        });
    }
    arbitration
}

/// Split hunks sorted by start line into runs of transitively overlapping hunks
fn clusters<'t, 'h>(hunks: &'t [Tagged<'h>]) -> Vec<&'t [Tagged<'h>]> {
    let mut out = Vec::new();
    let mut begin = 0;
    let mut reach = 0;
    for (i, tagged) in hunks.iter().enumerate() {
        let (start, end) = tagged.hunk.old_range();
        if i > begin && start > reach {
            out.push(&hunks[begin..i]);
            begin = i;
        }
        reach = if i == begin { end } else { reach.max(end) };
    }
    if begin < hunks.len() {
        out.push(&hunks[begin..]);
    }
    out
}

/// Recompute new-side start lines once hunks from different proposals are merged
fn renumber(hunks: &mut [DiffHunk]) {
    hunks.sort_by_key(|h| h.old_start);
    let mut delta: isize = 0;
    for hunk in hunks.iter_mut() {
        let old_len = hunk
            .lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Add(_)))
            .count() as isize;
        let new_len = hunk
            .lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Remove(_)))
            .count() as isize;
        hunk.new_start = (hunk.old_start as isize + delta).max(0) as usize;
        hunk.old_count = old_len as usize;
        hunk.new_count = new_len as usize;
        delta += new_len - old_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{apply_diff, parse_unified_diff};

    const SOURCE: &str = "a\nb\nc\nd\ne\nf\ng\nh\n";

    fn candidate<'a>(id: &'a str, priority: u32, cited: usize, diff: &str) -> Candidate<'a> {
        Candidate {
            participant_id: id,
            priority,
            cited,
            diffs: vec![parse_unified_diff(diff).unwrap()],
        }
    }

    #[test]
    fn test_disjoint_hunks_are_both_kept() {
        let first = candidate("p1", 1, 1, "--- a/f\n+++ b/f\n@@ -1,2 +1,3 @@\n a\n+A\n b\n");
        let second = candidate("p2", 2, 1, "--- a/f\n+++ b/f\n@@ -6,2 +6,3 @@\n f\n+F\n g\n");
        let result = arbitrate(&[first, second]);
        assert_eq!(result.diffs.len(), 1);
        assert_eq!(result.diffs[0].hunks.len(), 2);
        assert_eq!(result.winners.len(), 2);

        let patched = apply_diff(SOURCE, &result.diffs[0]).unwrap();
        assert_eq!(patched, "a\nA\nb\nc\nd\ne\nf\nF\ng\nh\n");
        assert_eq!(result.diffs[0].hunks[1].new_start, 7);
    }

    #[test]
    fn test_conflict_goes_to_most_cited() {
        let weak = candidate("p0", 0, 1, "--- a/f\n+++ b/f\n@@ -2,1 +2,1 @@\n-b\n+weak\n");
        let strong = candidate("p9", 9, 3, "--- a/f\n+++ b/f\n@@ -2,2 +2,2 @@\n-b\n+strong\n c\n");
        let result = arbitrate(&[weak, strong]);
        assert_eq!(result.winners.len(), 1);
        assert_eq!(result.winners[0].participant_id, "p9");
        assert_eq!(result.winners[0].contenders, vec!["p0", "p9"]);
        assert_eq!(apply_diff(SOURCE, &result.diffs[0]).unwrap(), "a\nstrong\nc\nd\ne\nf\ng\nh\n");
    }

    #[test]
    fn test_tie_goes_to_priority_then_id() {
        let diff = "--- a/f\n+++ b/f\n@@ -3,1 +3,1 @@\n-c\n+C\n";
        let result = arbitrate(&[candidate("zeta", 1, 2, diff), candidate("alpha", 2, 2, diff)]);
        assert_eq!(result.winners[0].participant_id, "zeta");

        let result = arbitrate(&[candidate("zeta", 1, 2, diff), candidate("alpha", 1, 2, diff)]);
        assert_eq!(result.winners[0].participant_id, "alpha");
    }

    #[test]
    fn test_transitive_overlap_forms_one_cluster() {
        let a = candidate("a", 0, 0, "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n");
        let b = candidate("b", 1, 0, "--- a/f\n+++ b/f\n@@ -3,3 +3,3 @@\n c\n-d\n+D\n e\n");
        let c = candidate("c", 2, 0, "--- a/f\n+++ b/f\n@@ -5,2 +5,2 @@\n-e\n+E\n f\n");
        let result = arbitrate(&[a, b, c]);
        assert_eq!(result.winners.len(), 1);
        assert_eq!(result.winners[0].lines, (1, 6));
        assert_eq!(result.winners[0].participant_id, "a");
    }
}
