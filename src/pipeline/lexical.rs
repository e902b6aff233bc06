//! Phase 2: lexical consistency
//!
//! Each check looks at code first. When a flag only shows up in comment
//! text it is kept, one confidence tier lower; at `low` it becomes a
//! suggestion instead of a violation.

use super::recon::Inventory;
use crate::report::{
    Confidence, Location, Priority, Severity, Suggestion, SuggestionKind, Violation,
};
use crate::unit::CodeUnit;
use crate::util::{blank_strings, source_lines, SourceLine};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexicalRule {
    MixedNaming,
    MixedIndentation,
    BooleanComparison,
    ConfusableLiteral,
}

impl LexicalRule {
    pub const ALL: [LexicalRule; 4] = [
        LexicalRule::MixedNaming,
        LexicalRule::MixedIndentation,
        LexicalRule::BooleanComparison,
        LexicalRule::ConfusableLiteral,
    ];

    pub fn rule_id(&self) -> &'static str {
        match self {
            LexicalRule::MixedNaming => "LEX001",
            LexicalRule::MixedIndentation => "LEX002",
            LexicalRule::BooleanComparison => "LEX003",
            LexicalRule::ConfusableLiteral => "LEX004",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LexicalRule::MixedNaming => "mixed-naming",
            LexicalRule::MixedIndentation => "mixed-indentation",
            LexicalRule::BooleanComparison => "boolean-comparison",
            LexicalRule::ConfusableLiteral => "confusable-literal",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            LexicalRule::ConfusableLiteral => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            LexicalRule::MixedNaming | LexicalRule::ConfusableLiteral => Confidence::Medium,
            LexicalRule::MixedIndentation | LexicalRule::BooleanComparison => Confidence::High,
        }
    }
}

/// Whether a rule id belongs to the lexical phase rather than the catalog
pub fn is_lexical(rule_id: &str) -> bool {
    rule_id.starts_with("LEX")
}

#[derive(Debug, Default)]
pub struct LexicalFindings {
    pub violations: Vec<Violation>,
    pub suggestions: Vec<Suggestion>,
}

/// A raw hit before confidence is settled
struct Hit {
    line: usize,
    start: usize,
    end: usize,
    detail: String,
}

pub fn check(unit: &CodeUnit, inventory: &Inventory) -> LexicalFindings {
    let lines = source_lines(unit);
    let mut findings = LexicalFindings::default();

    for rule in LexicalRule::ALL {
        let (in_code, in_comment) = match rule {
            LexicalRule::MixedNaming => (
                mixed_naming_in_code(&lines, inventory),
                mixed_naming_in_comments(&lines),
            ),
            LexicalRule::MixedIndentation => (
                mixed_indentation(&lines, false),
                mixed_indentation(&lines, true),
            ),
            LexicalRule::BooleanComparison => (
                regex_in_code(&lines, boolean_cmp_re()),
                regex_in_comments(&lines, boolean_cmp_re()),
            ),
            LexicalRule::ConfusableLiteral => (
                regex_in_code(&lines, confusable_re()),
                regex_in_comments(&lines, confusable_re()),
            ),
        };

        if let Some(hit) = in_code {
            findings.violations.push(violation(rule, &hit, rule.confidence()));
        } else if let Some(hit) = in_comment {
            let confidence = rule.confidence().downgraded();
            if confidence == Confidence::Low {
                findings.suggestions.push(
                    Suggestion::new(
                        SuggestionKind::Style,
                        Priority::Low,
                        format!("{} in comment text", rule.name()),
                    )
                    .with_line(hit.line)
                    .with_detail(hit.detail),
                );
            } else {
                findings.violations.push(violation(rule, &hit, confidence));
            }
        }
    }

    findings.violations.sort_by(|a, b| {
        a.location
            .start_offset
            .cmp(&b.location.start_offset)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
    findings
}

fn violation(rule: LexicalRule, hit: &Hit, confidence: Confidence) -> Violation {
    Violation {
        rule_id: rule.rule_id().to_string(),
        location: Location::line(hit.line, hit.start, hit.end),
        severity: rule.severity(),
        confidence,
        message: format!("{}: {}", rule.name(), hit.detail),
    }
}

fn boolean_cmp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(===?|!==?|\bis)\s*(true|false|True|False)\b|\b(true|false|True|False)\s*(===?|!==?)")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn confusable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d+l|0O[0-7]*)\b").unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_]\w*\b").unwrap_or_else(|_| Regex::new("$^").unwrap()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Naming {
    Snake,
    Camel,
}

fn naming_of(name: &str) -> Option<Naming> {
    let trimmed = name.trim_matches('_');
    let first = trimmed.chars().next()?;
    if !first.is_ascii_lowercase() {
        // PascalCase types and SCREAMING constants follow their own rules
        return None;
    }
    let has_upper = trimmed.chars().any(|c| c.is_ascii_uppercase());
    let has_underscore = trimmed.contains('_');
    match (has_underscore, has_upper) {
        (true, false) => Some(Naming::Snake),
        (false, true) => Some(Naming::Camel),
        _ => None,
    }
}

/// Names the unit itself declares, in order of appearance
fn mixed_naming_in_code(lines: &[SourceLine<'_>], inventory: &Inventory) -> Option<Hit> {
    let mut declared: Vec<(usize, &str)> = inventory
        .definitions
        .iter()
        .map(|d| (d.line, d.name.as_str()))
        .chain(
            inventory
                .definitions
                .iter()
                .flat_map(|d| d.params.iter().map(move |p| (d.line, p.as_str()))),
        )
        .chain(inventory.assignments.iter().map(|a| (a.line, a.name.as_str())))
        .collect();
    declared.sort_by_key(|(line, _)| *line);

    let styled: Vec<(usize, &str, Naming)> = declared
        .into_iter()
        .filter_map(|(line, name)| naming_of(name).map(|n| (line, name, n)))
        .collect();
    let first = styled.first()?;
    let odd = styled.iter().find(|(_, _, n)| *n != first.2)?;
    let line = lines.iter().find(|l| l.number == odd.0)?;
    let col = line.code.find(odd.1).unwrap_or(0);
    Some(Hit {
        line: odd.0,
        start: line.offset + col,
        end: line.offset + col + odd.1.len(),
        detail: format!(
            "`{}` breaks the {} convention set by `{}`",
            odd.1,
            match first.2 {
                Naming::Snake => "snake_case",
                Naming::Camel => "camelCase",
            },
            first.1
        ),
    })
}

fn mixed_naming_in_comments(lines: &[SourceLine<'_>]) -> Option<Hit> {
    let mut first: Option<(&str, Naming)> = None;
    for line in lines {
        let Some(comment) = line.comment else {
            continue;
        };
        let comment_start = line.offset + line.code.len();
        for m in identifier_re().find_iter(comment) {
            let Some(style) = naming_of(m.as_str()) else {
                continue;
            };
            match first {
                None => first = Some((m.as_str(), style)),
                Some((seen, s)) if s != style => {
                    return Some(Hit {
                        line: line.number,
                        start: comment_start + m.start(),
                        end: comment_start + m.end(),
                        detail: format!("comment mixes `{}` with `{}`", seen, m.as_str()),
                    });
                }
                Some(_) => {}
            }
        }
    }
    None
}

/// First line whose indentation disagrees with the first indented line.
/// `comments` selects comment-only lines instead of code lines.
fn mixed_indentation(lines: &[SourceLine<'_>], comments: bool) -> Option<Hit> {
    let mut expected: Option<char> = None;
    for line in lines {
        if line.is_blank() || line.is_comment_only() != comments {
            continue;
        }
        let indent = line.indent();
        if indent.is_empty() {
            continue;
        }
        let has_tab = indent.contains('\t');
        let has_space = indent.contains(' ');
        let style = if has_tab { '\t' } else { ' ' };
        let mismatch = (has_tab && has_space) || expected.is_some_and(|e| e != style);
        if mismatch {
            return Some(Hit {
                line: line.number,
                start: line.offset,
                end: line.offset + indent.len(),
                detail: format!("line {} mixes tabs and spaces", line.number),
            });
        }
        expected.get_or_insert(style);
    }
    None
}

fn regex_in_code(lines: &[SourceLine<'_>], re: &Regex) -> Option<Hit> {
    for line in lines {
        let code = blank_strings(line.code);
        if let Some(m) = re.find(&code) {
            return Some(Hit {
                line: line.number,
                start: line.offset + m.start(),
                end: line.offset + m.end(),
                detail: format!("`{}`", line.code[m.start()..m.end()].trim()),
            });
        }
    }
    None
}

fn regex_in_comments(lines: &[SourceLine<'_>], re: &Regex) -> Option<Hit> {
    for line in lines {
        let Some(comment) = line.comment else {
            continue;
        };
        if let Some(m) = re.find(comment) {
            let comment_start = line.offset + line.code.len();
            return Some(Hit {
                line: line.number,
                start: comment_start + m.start(),
                end: comment_start + m.end(),
                detail: format!("`{}` in a comment", m.as_str().trim()),
            });
        }
    }
    None
}
