//! Task prompt for the chamber and parsing of participant replies

use crate::report::{ProposalSkeleton, Report};
use std::collections::BTreeSet;

pub const DELIBERATION_SYSTEM: &str = r#"You are a senior engineer reviewing candidate fixes for suspected bugs.

You receive a diagnostic report and one or more draft patches. Propose the
smallest patch that resolves the strongest evidence.

OUTPUT FORMAT:
```diff
--- a/path
+++ b/path
@@ -start,count +start,count @@
 context
+added
```
Then 1-3 sentences of justification. Cite evidence by id (for example BH003
or H2) for every claim you rely on.

RULES:
- Exactly one unified diff, in a ```diff fence
- Keep context lines byte-identical to the original
- Do not reformat or rename unrelated code"#;

/// Build the task description every participant receives
pub fn task_prompt(report: &Report, skeletons: &[ProposalSkeleton]) -> String {
    let mut prompt = format!("UNIT: {}\n\n", report.unit);

    if !report.violations.is_empty() {
        prompt.push_str("VIOLATIONS:\n");
        for v in &report.violations {
            prompt.push_str(&format!(
                "- [{}] {} at {} ({}, {} confidence)\n",
                v.rule_id,
                v.message,
                v.location,
                v.severity,
                v.confidence.as_str()
            ));
        }
        prompt.push('\n');
    }

    if let Some(hunt) = &report.bug_hunt {
        let open: Vec<_> = hunt.open_hypotheses().collect();
        if !open.is_empty() {
            prompt.push_str("OPEN HYPOTHESES:\n");
            for h in open {
                prompt.push_str(&format!(
                    "- [{}] line {}: {} (weight {})\n",
                    h.id,
                    h.line,
                    h.challenge,
                    h.weight()
                ));
            }
            prompt.push('\n');
        }
    }

    prompt.push_str("DRAFT PATCHES:\n");
    for skeleton in skeletons {
        prompt.push_str(&format!(
            "# {}\n{}\n```diff\n{}```\n\n",
            skeleton.hypothesis_id, skeleton.justification, skeleton.diff
        ));
    }

    prompt.push_str(&format!(
        "EVIDENCE IDS: {}\n",
        report.evidence_ids().join(", ")
    ));
    prompt
}

/// A participant reply split into its patch and its prose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub diff: String,
    pub justification: String,
}

/// Pull the unified diff and the justification out of a reply.
///
/// Prefers a ```diff fence, then any fence holding a hunk header, then a
/// bare diff starting at the first `--- ` line.
pub fn parse_reply(text: &str) -> Option<ParsedReply> {
    if let Some(parsed) = fenced(text, "```diff").or_else(|| fenced(text, "```patch")) {
        return Some(parsed);
    }
    if let Some(parsed) = fenced(text, "```").filter(|p| p.diff.contains("@@")) {
        return Some(parsed);
    }

    let start = line_offsets(text)
        .find(|(_, line)| line.starts_with("--- "))
        .map(|(at, _)| at)?;
    let body = &text[start..];
    if !body.contains("@@") {
        return None;
    }
    let end = line_offsets(body)
        .find(|(_, line)| line.trim_end_matches(['\r', '\n']).is_empty())
        .map(|(at, _)| at)
        .unwrap_or(body.len());
    let mut diff = body[..end].replace("\r\n", "\n");
    if !diff.ends_with('\n') {
        diff.push('\n');
    }
    let justification = format!("{} {}", text[..start].trim(), body[end..].trim());
    Some(ParsedReply {
        diff,
        justification: justification.trim().to_string(),
    })
}

/// Each line with the byte offset it starts at, terminator included
fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |offset, line| {
        let at = *offset;
        *offset += line.len();
        Some((at, line))
    })
}

fn fenced(text: &str, opener: &str) -> Option<ParsedReply> {
    let open = text.find(opener)?;
    let body_start = open + text[open..].find('\n')? + 1;
    let close_rel = text[body_start..].find("```")?;
    let diff = &text[body_start..body_start + close_rel];
    if diff.trim().is_empty() {
        return None;
    }
    let after = body_start + close_rel + 3;
    let justification = format!("{} {}", text[..open].trim(), text[after..].trim());
    Some(ParsedReply {
        diff: diff.replace("\r\n", "\n"),
        justification: justification.trim().to_string(),
    })
}

/// Distinct evidence ids named in `justification`, matched as whole tokens
pub fn cited_evidence(justification: &str, evidence_ids: &[String]) -> Vec<String> {
    let tokens: BTreeSet<&str> = justification
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let mut cited: Vec<String> = evidence_ids
        .iter()
        .filter(|id| tokens.contains(id.as_str()))
        .cloned()
        .collect();
    cited.sort();
    cited.dedup();
    cited
}

#[cfg(test)]
mod tests {
    use super::*;

    const FENCED: &str = "Guard the lookup first.\n```diff\n--- a/x.rb\n+++ b/x.rb\n@@ -1,1 +1,2 @@\n+return if h.nil?\n x = h[:a]\n```\nFixes H1 and BH003.";

    #[test]
    fn test_parse_fenced_diff() {
        let parsed = parse_reply(FENCED).unwrap();
        assert!(parsed.diff.starts_with("--- a/x.rb\n"));
        assert!(parsed.diff.ends_with(" x = h[:a]\n"));
        assert_eq!(parsed.justification, "Guard the lookup first. Fixes H1 and BH003.");
    }

    #[test]
    fn test_parse_bare_diff() {
        let text = "--- a/x.rb\n+++ b/x.rb\n@@ -1,1 +1,2 @@\n+guard\n x\n\nBecause H2.";
        let parsed = parse_reply(text).unwrap();
        assert_eq!(parsed.diff.lines().count(), 5);
        assert_eq!(parsed.justification, "Because H2.");
    }

    #[test]
    fn test_parse_bare_diff_after_crlf_prose() {
        let text = "ok\r\nfix\r\n--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        let parsed = parse_reply(text).unwrap();
        assert_eq!(parsed.diff, "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-a\n+b\n");
        assert_eq!(parsed.justification, "ok\r\nfix");
        assert!(crate::diff::parse_patch(&parsed.diff).is_ok());
    }

    #[test]
    fn test_parse_bare_diff_after_crlf_non_ascii_prose() {
        let text = "x\r\ny\r\n\u{e9}\r\n--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        let parsed = parse_reply(text).unwrap();
        assert!(parsed.diff.starts_with("--- a/f\n"));
        assert!(parsed.justification.ends_with('\u{e9}'));
    }

    #[test]
    fn test_crlf_diff_ends_at_blank_line() {
        let text = "--- a/f\r\n+++ b/f\r\n@@ -1,1 +1,1 @@\r\n-a\r\n+b\r\n\r\nBecause H1.";
        let parsed = parse_reply(text).unwrap();
        assert_eq!(parsed.diff, "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-a\n+b\n");
        assert_eq!(parsed.justification, "Because H1.");
    }

    #[test]
    fn test_reply_without_diff_is_rejected() {
        assert!(parse_reply("I think the code is fine.").is_none());
        assert!(parse_reply("```\nnot a diff\n```").is_none());
    }

    #[test]
    fn test_cited_evidence_matches_whole_ids() {
        let ids = vec!["BH003".to_string(), "H1".to_string(), "H2".to_string()];
        let cited = cited_evidence("See H12, H1 (twice: H1) and BH003.", &ids);
        assert_eq!(cited, vec!["BH003".to_string(), "H1".to_string()]);
    }
}
