//! Pattern catalog: known bug signatures
//!
//! A closed set of rules. Every rule carries a declared severity and
//! confidence and answers one question through [`PatternRule::check`]:
//! where is the first place this unit shows the signature?
//!
//! The catalog is built once and shared read-only across workers.

use crate::report::{Confidence, Location, Severity, Violation};
use crate::unit::CodeUnit;
use crate::util::{blank_strings, source_lines, SourceLine};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternRule {
    HardcodedSecret,
    DynamicEval,
    SwallowedError,
    DeveloperMarker,
    AssignmentInCondition,
    InterpolatedSql,
    UnsafeDeserialization,
}

impl PatternRule {
    pub const ALL: [PatternRule; 7] = [
        PatternRule::HardcodedSecret,
        PatternRule::DynamicEval,
        PatternRule::SwallowedError,
        PatternRule::DeveloperMarker,
        PatternRule::AssignmentInCondition,
        PatternRule::InterpolatedSql,
        PatternRule::UnsafeDeserialization,
    ];

    pub fn rule_id(&self) -> &'static str {
        match self {
            PatternRule::HardcodedSecret => "BH001",
            PatternRule::DynamicEval => "BH002",
            PatternRule::SwallowedError => "BH003",
            PatternRule::DeveloperMarker => "BH004",
            PatternRule::AssignmentInCondition => "BH005",
            PatternRule::InterpolatedSql => "BH006",
            PatternRule::UnsafeDeserialization => "BH007",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatternRule::HardcodedSecret => "hardcoded-secret",
            PatternRule::DynamicEval => "dynamic-eval",
            PatternRule::SwallowedError => "swallowed-error",
            PatternRule::DeveloperMarker => "developer-marker",
            PatternRule::AssignmentInCondition => "assignment-in-condition",
            PatternRule::InterpolatedSql => "interpolated-sql",
            PatternRule::UnsafeDeserialization => "unsafe-deserialization",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PatternRule::HardcodedSecret => Severity::Critical,
            PatternRule::DynamicEval
            | PatternRule::SwallowedError
            | PatternRule::InterpolatedSql
            | PatternRule::UnsafeDeserialization => Severity::High,
            PatternRule::DeveloperMarker | PatternRule::AssignmentInCondition => Severity::Medium,
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            PatternRule::SwallowedError | PatternRule::DeveloperMarker => Confidence::High,
            PatternRule::AssignmentInCondition => Confidence::Low,
            PatternRule::HardcodedSecret
            | PatternRule::DynamicEval
            | PatternRule::InterpolatedSql
            | PatternRule::UnsafeDeserialization => Confidence::Medium,
        }
    }

    /// Security rules gate autonomy more strictly
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            PatternRule::HardcodedSecret
                | PatternRule::DynamicEval
                | PatternRule::InterpolatedSql
                | PatternRule::UnsafeDeserialization
        )
    }

    pub fn from_rule_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.rule_id() == id)
    }

    /// First occurrence of this rule's signature in the unit
    pub fn check(&self, unit: &CodeUnit) -> Option<Violation> {
        let lines = source_lines(unit);
        let (line, start, end, message) = match self {
            PatternRule::HardcodedSecret => find_in_code(&lines, secret_re(), false)
                .map(|(l, s, e, m)| (l, s, e, format!("hardcoded credential in `{}`", first_word(&m)))),
            PatternRule::DynamicEval => find_in_code(&lines, eval_re(), true)
                .map(|(l, s, e, m)| (l, s, e, format!("dynamic code evaluation via `{}`", first_word(&m)))),
            PatternRule::SwallowedError => find_swallowed_error(&lines),
            PatternRule::DeveloperMarker => find_marker(&lines),
            PatternRule::AssignmentInCondition => find_in_code(&lines, cond_assign_re(), true)
                .map(|(l, s, e, m)| {
                    (l, s, e, format!("assignment inside condition `{}`", m.trim()))
                }),
            PatternRule::InterpolatedSql => find_in_code(&lines, sql_interp_re(), false)
                .or_else(|| find_in_code(&lines, sql_concat_re(), false))
                .map(|(l, s, e, _)| (l, s, e, "SQL built from interpolated values".to_string())),
            PatternRule::UnsafeDeserialization => find_in_code(&lines, deser_re(), true)
                .map(|(l, s, e, m)| {
                    (l, s, e, format!("unsafe deserialization via `{}`", m.trim_end_matches(['(', ' '])))
                }),
        }?;

        Some(Violation {
            rule_id: self.rule_id().to_string(),
            location: Location::line(line, start, end),
            severity: self.severity(),
            confidence: self.confidence(),
            message: format!("{}: {}", self.name(), message),
        })
    }
}

/// The shared, read-only rule table
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    rules: Vec<PatternRule>,
}

impl Default for PatternCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternCatalog {
    /// Catalog with every built-in rule
    pub fn new() -> Self {
        Self {
            rules: PatternRule::ALL.to_vec(),
        }
    }

    /// Catalog restricted to a subset of rules
    pub fn with_rules(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Run every rule; results are ordered by location, then rule id
    pub fn scan(&self, unit: &CodeUnit) -> Vec<Violation> {
        let mut found: Vec<Violation> = self.rules.iter().filter_map(|r| r.check(unit)).collect();
        found.sort_by(|a, b| {
            a.location
                .start_offset
                .cmp(&b.location.start_offset)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        found
    }
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|_| Regex::new("$^").unwrap()))
}

fn secret_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r#"(?i)\b\w*(api[_-]?key|secret|password|passwd|token)\w*\s*(=|:|=>)\s*["'][^"']{4,}["']"#,
    )
}

fn eval_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\b(eval|exec|instance_eval|class_eval)\s*\(")
}

fn cond_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\b(if|elsif|unless|while)\s*\(?\s*[A-Za-z_]\w*\s*=[^=~>]")
}

fn sql_interp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r#"(?i)["'`][^"'`]*\b(select\s.+\sfrom|insert\s+into|update\s+\w+\s+set|delete\s+from)\b[^"'`]*(#\{|\$\{|\{\}|%s|\{[a-z_]\w*\})"#,
    )
}

fn sql_concat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r#"(?i)["'][^"']*\b(select\s.+\sfrom|insert\s+into|update\s+\w+\s+set|delete\s+from)\b[^"']*["']\s*(\+|\.\.|<<)\s*[A-Za-z_]"#,
    )
}

fn deser_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\b(Marshal\.load|pickle\.loads?|YAML\.load|yaml\.load)\s*\(")
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\b(FIXME|BUG|XXX)\b")
}

fn handler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r"^\s*(\}\s*)?(rescue\b[^;]*|except\b[^:]*:|catch\s*(\([^)]*\))?\s*\{|\}\s*catch\s*(\([^)]*\))?\s*\{)\s*$",
    )
}

fn inline_swallow_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r"(catch\s*(\([^)]*\))?\s*\{\s*\}|except\b[^:]*:\s*pass\b|\brescue\s+nil\b|rescue\s*(=>\s*\w+)?\s*;\s*end\b)",
    )
}

fn first_word(s: &str) -> String {
    s.trim()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|w| !w.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Match a regex against the code part of each line.
/// `blank` hides string contents first.
fn find_in_code(
    lines: &[SourceLine<'_>],
    re: &Regex,
    blank: bool,
) -> Option<(usize, usize, usize, String)> {
    for line in lines {
        let haystack = if blank {
            blank_strings(line.code)
        } else {
            line.code.to_string()
        };
        if let Some(m) = re.find(&haystack) {
            let matched = line.code[m.start()..m.end()].to_string();
            return Some((line.number, line.offset + m.start(), line.offset + m.end(), matched));
        }
    }
    None
}

fn find_marker(lines: &[SourceLine<'_>]) -> Option<(usize, usize, usize, String)> {
    for line in lines {
        let Some(comment) = line.comment else {
            continue;
        };
        if let Some(m) = marker_re().find(comment) {
            let comment_start = line.offset + line.code.len();
            let note = comment
                .trim_start_matches(['#', '/', '-', ' '])
                .trim()
                .to_string();
            return Some((
                line.number,
                comment_start + m.start(),
                comment_start + m.end(),
                format!("developer left `{}`: {}", m.as_str(), crate::util::truncate(&note, 60)),
            ));
        }
    }
    None
}

fn find_swallowed_error(lines: &[SourceLine<'_>]) -> Option<(usize, usize, usize, String)> {
    for (i, line) in lines.iter().enumerate() {
        let code = blank_strings(line.code);
        if let Some(m) = inline_swallow_re().find(&code) {
            return Some((
                line.number,
                line.offset + m.start(),
                line.offset + m.end(),
                "error handler discards the error".to_string(),
            ));
        }
        if !handler_re().is_match(&code) {
            continue;
        }
        let next = lines[i + 1..]
            .iter()
            .find(|l| !l.is_blank() && !l.is_comment_only());
        if let Some(next) = next {
            let body = next.code.trim();
            if matches!(body, "end" | "pass" | "}" | "};" | "})" | "});") {
                return Some((
                    line.number,
                    line.offset,
                    next.offset + next.text.len(),
                    format!("empty `{}` handler", code.trim().split_whitespace().next().unwrap_or("")),
                ));
            }
        }
    }
    None
}
