//! Unified diff parsing, rendering and application
//!
//! Handles parsing unified diff format (one or many files), applying
//! patches to in-memory text, and measuring how much a patch touches.

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }

    fn render(&self) -> String {
        match self {
            DiffLine::Context(s) => format!(" {}", s),
            DiffLine::Add(s) => format!("+{}", s),
            DiffLine::Remove(s) => format!("-{}", s),
        }
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Get a summary of changes in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }

    /// Lines of the original text this hunk spans (1-based, inclusive)
    pub fn old_range(&self) -> (usize, usize) {
        let start = self.old_start.max(1);
        let span = self.old_side().len().max(1);
        (start, start + span - 1)
    }

    /// Whether two hunks of the same file compete for the same original lines
    pub fn overlaps(&self, other: &DiffHunk) -> bool {
        let (a0, a1) = self.old_range();
        let (b0, b1) = other.old_range();
        a0 <= b1 && b0 <= a1
    }

    fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
                DiffLine::Add(_) => None,
            })
            .collect()
    }

    fn new_side(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Add(s) => Some(s.clone()),
                DiffLine::Remove(_) => None,
            })
            .collect()
    }

    fn render(&self) -> String {
        let old_count = self.old_side().len();
        let new_count = self.new_side().len();
        let mut out = format!(
            "@@ -{},{} +{},{} @@\n",
            self.old_start, old_count, self.new_start, new_count
        );
        for line in &self.lines {
            out.push_str(&line.render());
            out.push('\n');
        }
        out
    }
}

/// A parsed unified diff for one file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    /// Get total additions and deletions
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!("--- a/{}\n+++ b/{}\n", self.old_path, self.new_path);
        for hunk in &self.hunks {
            out.push_str(&hunk.render());
        }
        out
    }
}

/// How much a patch touches: the blast radius fed into risk assessment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlastRadius {
    pub files: usize,
    pub added: usize,
    pub removed: usize,
}

impl BlastRadius {
    pub fn lines_touched(&self) -> usize {
        self.added + self.removed
    }
}

pub fn blast_radius(diffs: &[UnifiedDiff]) -> BlastRadius {
    let (added, removed) = diffs.iter().fold((0, 0), |acc, d| {
        let (a, r) = d.stats();
        (acc.0 + a, acc.1 + r)
    });
    BlastRadius {
        files: diffs.len(),
        added,
        removed,
    }
}

/// Render several file diffs as one patch
pub fn render_patch(diffs: &[UnifiedDiff]) -> String {
    diffs.iter().map(UnifiedDiff::render).collect()
}

/// Parse a unified diff string into structured data
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, String> {
    let mut files = parse_patch(diff)?;
    if files.len() > 1 {
        return Err(format!("Expected one file, found {}", files.len()));
    }
    files.pop().ok_or_else(|| "No file diff found".to_string())
}

/// Parse a patch that may cover several files
pub fn parse_patch(diff: &str) -> Result<Vec<UnifiedDiff>, String> {
    let lines: Vec<&str> = diff.lines().collect();

    if lines.len() < 3 {
        return Err("Diff too short".to_string());
    }

    let mut files = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if is_file_header(&lines, i) {
            let old_path = header_path(lines[i], "--- ", "a/");
            let new_path = header_path(lines[i + 1], "+++ ", "b/");
            i += 2;
            let mut hunks = Vec::new();
            while i < lines.len() && !is_file_header(&lines, i) {
                if lines[i].starts_with("@@ ") {
                    hunks.push(parse_hunk(&lines, &mut i)?);
                } else {
                    i += 1;
                }
            }
            if old_path.is_empty() || new_path.is_empty() {
                return Err("Could not find file paths in diff".to_string());
            }
            if hunks.is_empty() {
                return Err(format!("No hunks found for {}", new_path));
            }
            files.push(UnifiedDiff {
                old_path,
                new_path,
                hunks,
            });
        } else {
            i += 1;
        }
    }

    if files.is_empty() {
        return Err("Could not find file paths in diff".to_string());
    }
    Ok(files)
}

fn is_file_header(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ "))
}

fn header_path(line: &str, marker: &str, prefix: &str) -> String {
    let raw = &line[marker.len()..];
    let mut path = raw.strip_prefix(prefix).unwrap_or(raw).to_string();
    // Handle timestamp suffix
    if let Some(tab_pos) = path.find('\t') {
        path.truncate(tab_pos);
    }
    path.trim().to_string()
}

/// Parse a single hunk from the diff
fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx];

    // Parse @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("Invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];

        // Stop at next hunk, next file or end
        if line.starts_with("@@ ") || line.starts_with("diff ") || is_file_header(lines, *idx) {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
        }
        // Skip other lines (like "\ No newline at end of file")

        *idx += 1;
    }

    // Trailing blank context is an artifact of fenced replies
    while matches!(diff_lines.last(), Some(DiffLine::Context(s)) if s.is_empty()) {
        diff_lines.pop();
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some(comma) = s.find(',') {
        let start: usize = s[..comma].parse().map_err(|_| format!("Invalid start: {}", s))?;
        let count: usize = s[comma + 1..].parse().map_err(|_| format!("Invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| format!("Invalid line number: {}", s))?;
        Ok((start, 1))
    }
}

/// Apply a unified diff to the original content.
///
/// Every context and removed line must match the original. A hunk whose
/// line numbers are off is relocated when its old side matches exactly one
/// place in the file.
pub fn apply_diff(original: &str, diff: &UnifiedDiff) -> Result<String, String> {
    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();

    let mut placed = Vec::with_capacity(diff.hunks.len());
    for hunk in &diff.hunks {
        placed.push((locate_hunk(&lines, hunk)?, hunk));
    }
    placed.sort_by_key(|(start, _)| *start);
    for pair in placed.windows(2) {
        let (start, hunk) = pair[0];
        if start + hunk.old_side().len() > pair[1].0 {
            return Err(format!("Overlapping hunks at line {}", pair[1].0 + 1));
        }
    }

    // Apply hunks in reverse order so line numbers don't shift
    for (start, hunk) in placed.iter().rev() {
        let end = (start + hunk.old_side().len()).min(lines.len());
        lines.splice(*start..end, hunk.new_side());
    }

    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// 0-based index where the hunk's old side starts
fn locate_hunk(lines: &[String], hunk: &DiffHunk) -> Result<usize, String> {
    let old = hunk.old_side();
    let matches_at = |start: usize| {
        start + old.len() <= lines.len()
            && old.iter().enumerate().all(|(k, l)| lines[start + k] == *l)
    };

    let declared = hunk.old_start.saturating_sub(1);
    if old.is_empty() {
        // Pure insertion: old_start names the line after which text is added
        let at = if hunk.old_count == 0 { hunk.old_start } else { declared };
        return if at <= lines.len() {
            Ok(at)
        } else {
            Err(format!("Insertion point {} is past end of file", at))
        };
    }
    if matches_at(declared) {
        return Ok(declared);
    }

    let candidates: Vec<usize> = (0..lines.len()).filter(|&s| matches_at(s)).collect();
    match candidates.as_slice() {
        [only] => Ok(*only),
        [] => Err(format!(
            "Hunk at line {} does not match the original text",
            hunk.old_start
        )),
        _ => Err(format!(
            "Hunk at line {} matches {} places; cannot relocate",
            hunk.old_start,
            candidates.len()
        )),
    }
}

/// Build a single-hunk diff that inserts `new_lines` before line `at` (1-based),
/// carrying up to `context` lines of context on either side.
pub fn insertion_diff(
    path: &str,
    original: &str,
    at: usize,
    new_lines: &[String],
    context: usize,
) -> Result<UnifiedDiff, String> {
    let lines: Vec<&str> = original.lines().collect();
    if at == 0 || at > lines.len() + 1 {
        return Err(format!("Insertion line {} outside 1..={}", at, lines.len() + 1));
    }
    let before_start = at.saturating_sub(1).saturating_sub(context);
    let after_end = (at - 1 + context).min(lines.len());

    let mut hunk_lines = Vec::new();
    for l in &lines[before_start..at - 1] {
        hunk_lines.push(DiffLine::Context(l.to_string()));
    }
    for l in new_lines {
        hunk_lines.push(DiffLine::Add(l.clone()));
    }
    for l in &lines[at - 1..after_end] {
        hunk_lines.push(DiffLine::Context(l.to_string()));
    }

    let old_count = hunk_lines
        .iter()
        .filter(|l| !matches!(l, DiffLine::Add(_)))
        .count();
    let start = before_start + 1;
    Ok(UnifiedDiff {
        old_path: path.to_string(),
        new_path: path.to_string(),
        hunks: vec![DiffHunk {
            old_start: start,
            old_count,
            new_start: start,
            new_count: old_count + new_lines.len(),
            lines: hunk_lines,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_diff() {
        let diff = r#"--- a/src/example.ts
+++ b/src/example.ts
@@ -1,5 +1,6 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }
"#;
        let parsed = parse_unified_diff(diff).unwrap();
        assert_eq!(parsed.old_path, "src/example.ts");
        assert_eq!(parsed.hunks.len(), 1);
        assert_eq!(parsed.stats(), (2, 1)); // 2 adds, 1 remove
    }

    #[test]
    fn test_apply_diff() {
        let original = r#"function hello() {
  console.log("old");
  return true;
}"#;
        let diff = r#"--- a/test.ts
+++ b/test.ts
@@ -1,4 +1,5 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }
"#;
        let parsed = parse_unified_diff(diff).unwrap();
        let result = apply_diff(original, &parsed).unwrap();

        assert!(result.contains("console.log(\"new\")"));
        assert!(result.contains("console.log(\"extra\")"));
        assert!(!result.contains("console.log(\"old\")"));
    }

    #[test]
    fn test_apply_rejects_mismatched_context() {
        let diff = "--- a/x.rb\n+++ b/x.rb\n@@ -1,2 +1,2 @@\n-nothing\n+something\n here\n";
        let parsed = parse_unified_diff(diff).unwrap();
        assert!(apply_diff("a\nb\n", &parsed).is_err());
    }

    #[test]
    fn test_apply_relocates_shifted_hunk() {
        let original = "one\ntwo\nthree\nfour\n";
        let diff = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n three\n-four\n+FOUR\n";
        let parsed = parse_unified_diff(diff).unwrap();
        assert_eq!(apply_diff(original, &parsed).unwrap(), "one\ntwo\nthree\nFOUR\n");
    }

    #[test]
    fn test_multi_file_patch_and_render() {
        let patch = "--- a/a.rb\n+++ b/a.rb\n@@ -1,1 +1,2 @@\n x\n+y\n--- a/b.rb\n+++ b/b.rb\n@@ -3,1 +3,0 @@\n-z\n";
        let files = parse_patch(patch).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].new_path, "b.rb");
        let radius = blast_radius(&files);
        assert_eq!(radius, BlastRadius { files: 2, added: 1, removed: 1 });

        let reparsed = parse_patch(&render_patch(&files)).unwrap();
        assert_eq!(reparsed[0].hunks[0].lines, files[0].hunks[0].lines);
    }

    #[test]
    fn test_removed_line_starting_with_dashes_is_not_a_header() {
        let patch = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1,1 @@\n--- old comment\n select 1;\n";
        let file = parse_unified_diff(patch).unwrap();
        assert_eq!(file.hunks[0].lines[0], DiffLine::Remove("-- old comment".to_string()));
    }

    #[test]
    fn test_insertion_diff_applies() {
        let original = "def f(xs)\n  xs[0]\nend\n";
        let diff = insertion_diff("f.rb", original, 2, &["  return nil if xs.empty?".to_string()], 1)
            .unwrap();
        let patched = apply_diff(original, &diff).unwrap();
        assert_eq!(patched, "def f(xs)\n  return nil if xs.empty?\n  xs[0]\nend\n");
        assert_eq!(diff.hunks[0].old_range(), (1, 2));
    }

    #[test]
    fn test_hunk_overlap() {
        let a = parse_unified_diff("--- a/x\n+++ b/x\n@@ -2,2 +2,2 @@\n b\n-c\n+C\n").unwrap();
        let b = parse_unified_diff("--- a/x\n+++ b/x\n@@ -3,1 +3,1 @@\n-c\n+K\n").unwrap();
        let c = parse_unified_diff("--- a/x\n+++ b/x\n@@ -9,1 +9,1 @@\n-q\n+Q\n").unwrap();
        assert!(a.hunks[0].overlaps(&b.hunks[0]));
        assert!(!a.hunks[0].overlaps(&c.hunks[0]));
    }
}
