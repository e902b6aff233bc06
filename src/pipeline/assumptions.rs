//! Phase 4: assumption interrogation
//!
//! Every risky construct implies an assumption about a symbol. Each one is
//! challenged; challenges that no earlier guard answers become hypotheses.

use super::recon::{is_keyword, Inventory};
use crate::report::{AssumptionKind, Evidence, Hypothesis, HypothesisStatus, Phase};
use crate::unit::{CodeUnit, Language};
use crate::util::{blank_strings, source_lines};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// One implicit assumption and whether the code answers it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub subject: String,
    pub assumption: AssumptionKind,
    pub line: usize,
    pub question: String,
    /// Line of the guard that answers the challenge
    pub answered_at: Option<usize>,
}

pub struct Interrogation {
    pub challenges: Vec<Challenge>,
    pub hypotheses: Vec<Hypothesis>,
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|_| Regex::new("$^").unwrap()))
}

fn unwrap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"\b([A-Za-z_]\w*)((?:\s*\.\s*[A-Za-z_]\w*(?:::<[^>]*>)?\([^()]*\))*)\s*\.\s*(unwrap|expect)\s*\(",
    )
}

fn non_null_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\b([A-Za-z_]\w*)!\s*[.\[]")
}

fn chained_lookup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"\b([A-Za-z_]\w*)\s*\.\s*(find|find_by|detect|get|fetch|first|last)\b\s*(?:\([^()]*\))?\s*\.\s*[A-Za-z_]",
    )
}

fn key_lookup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r#"\b([A-Za-z_]\w*)\s*\[\s*(:\w+|"[^"]*"|'[^']*')\s*\]\s*\.\s*[A-Za-z_]"#,
    )
}

fn member_access_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\b([A-Za-z_]\w*)\s*\.\s*([A-Za-z_]\w*[?!]?)")
}

fn lookup_rhs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r#"(\b(find\w*|detect|get|fetch|first|last)\b|\[\s*(:\w+|"|')[^\]]*\]\s*;?\s*$)"#,
    )
}

fn index_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\b([A-Za-z_]\w*)\s*\[\s*(-?\d+|[A-Za-z_]\w*)\s*\]")
}

fn division_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"[\w)\]]\s*(?:/{1,2}|%)=?\s*([A-Za-z_]\w*)\b")
}

fn conversion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"\b(?:Integer|Float|int|float|parseInt|parseFloat|Number|Atoi|ParseInt|ParseFloat)\s*\(\s*([A-Za-z_]\w*)",
    )
}

fn parse_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\b([A-Za-z_]\w*)\s*\.\s*parse\s*(?:::<[^>]*>)?\s*\(\s*\)")
}

/// Members that are themselves nil checks
const NIL_CHECKS: &[&str] = &[
    "nil?", "present?", "blank?", "is_none", "is_some", "empty?", "is_empty",
];

pub fn interrogate(unit: &CodeUnit, inventory: &Inventory) -> Interrogation {
    let lines = source_lines(unit);
    let blanked: Vec<String> = lines.iter().map(|l| blank_strings(l.code)).collect();
    let language = unit.language();

    let mut challenges: Vec<Challenge> = Vec::new();
    let mut seen: HashSet<(String, usize)> = HashSet::new();
    let mut lookup_uses: HashSet<(String, usize)> = HashSet::new();

    for (line, code) in lines.iter().zip(&blanked) {
        if code.trim().is_empty() {
            continue;
        }
        let n = line.number;
        let mut found: Vec<(String, AssumptionKind)> = Vec::new();

        for caps in unwrap_re().captures_iter(code) {
            found.push((caps[1].to_string(), AssumptionKind::NeverFails));
        }
        if matches!(language, Language::JavaScript | Language::TypeScript) {
            for caps in non_null_re().captures_iter(code) {
                found.push((caps[1].to_string(), AssumptionKind::NeverFails));
            }
        }

        if language != Language::Rust {
            for caps in chained_lookup_re().captures_iter(code) {
                found.push((format!("{}.{}", &caps[1], &caps[2]), AssumptionKind::NeverNil));
            }
            for caps in key_lookup_re().captures_iter(code) {
                let key = line.code[caps.get(2).map(|m| m.range()).unwrap_or(0..0)].to_string();
                found.push((format!("{}[{}]", &caps[1], key), AssumptionKind::NeverNil));
            }
            for caps in member_access_re().captures_iter(code) {
                let (name, member) = (&caps[1], &caps[2]);
                if NIL_CHECKS.contains(&member) {
                    continue;
                }
                let Some(assignment) = inventory.last_assignment_before(name, n) else {
                    continue;
                };
                if lookup_rhs_re().is_match(&assignment.rhs)
                    && lookup_uses.insert((name.to_string(), assignment.line))
                {
                    found.push((name.to_string(), AssumptionKind::NeverNil));
                }
            }
        }

        for caps in index_re().captures_iter(code) {
            let Some(end) = caps.get(0).map(|m| m.end()) else {
                continue;
            };
            // Element writes do not read the collection
            let rest = code[end..].trim_start();
            if rest.starts_with('=') && !rest.starts_with("==") {
                continue;
            }
            found.push((caps[1].to_string(), AssumptionKind::NeverEmpty));
        }

        for caps in division_re().captures_iter(code) {
            let Some(m) = caps.get(1) else {
                continue;
            };
            if code[m.end()..].trim_start().starts_with('(') {
                continue;
            }
            found.push((m.as_str().to_string(), AssumptionKind::NeverZero));
        }

        for caps in conversion_re()
            .captures_iter(code)
            .chain(parse_call_re().captures_iter(code))
        {
            found.push((caps[1].to_string(), AssumptionKind::WellFormedInput));
        }

        for (subject, assumption) in found {
            let base = subject.split(['.', '[']).next().unwrap_or("");
            if is_keyword(base) || !seen.insert((subject.clone(), n)) {
                continue;
            }
            let scope_start = inventory.enclosing_definition(n).map(|d| d.line).unwrap_or(1);
            let answered_at = (scope_start..=n).find(|&l| {
                blanked
                    .get(l - 1)
                    .is_some_and(|text| guards(assumption, &subject, text))
            });
            challenges.push(Challenge {
                question: question(assumption, &subject),
                subject,
                assumption,
                line: n,
                answered_at,
            });
        }
    }

    let hypotheses = challenges
        .iter()
        .filter(|c| c.answered_at.is_none())
        .enumerate()
        .map(|(i, c)| Hypothesis {
            id: format!("H{}", i + 1),
            subject: c.subject.clone(),
            assumption: c.assumption,
            line: c.line,
            severity: c.assumption.severity(),
            challenge: c.question.clone(),
            evidence: vec![Evidence {
                phase: Phase::AssumptionInterrogation,
                observation: format!("{} (unguarded on line {})", c.assumption.describe(&c.subject), c.line),
                weight: 1,
            }],
            first_phase: Phase::AssumptionInterrogation,
            status: HypothesisStatus::Open,
        })
        .collect();

    Interrogation {
        challenges,
        hypotheses,
    }
}

fn question(assumption: AssumptionKind, subject: &str) -> String {
    let what = match assumption {
        AssumptionKind::NeverEmpty => "is empty",
        AssumptionKind::NeverNil => "is nil",
        AssumptionKind::NeverZero => "is zero",
        AssumptionKind::NeverFails => "fails",
        AssumptionKind::WellFormedInput => "is malformed",
    };
    format!("What happens when `{}` {}?", subject, what)
}

fn subject_pattern(subject: &str) -> String {
    let escaped = regex::escape(subject);
    if subject.chars().all(|c| c.is_alphanumeric() || c == '_') {
        format!(r"\b{}\b", escaped)
    } else {
        escaped
    }
}

/// Whether `code` holds a guard that answers the assumption about `subject`
fn guards(assumption: AssumptionKind, subject: &str, code: &str) -> bool {
    let p = subject_pattern(subject);
    let condition = format!(
        r"\b(if|unless|elsif|while)\s+(not\s+|!)?\(?\s*{p}\s*(\)|:|\{{|\bthen\b|&&|\|\||\band\b|\bor\b|$)"
    );
    let handler = r"\b(rescue|try|catch|except)\b".to_string();
    let pattern_match = format!(r"\bif\s+let\b.*{p}|\bmatch\s+{p}");

    let patterns: Vec<String> = match assumption {
        AssumptionKind::NeverEmpty => vec![
            format!(r"{p}\s*\.\s*(empty\?|any\?|(is_empty|length|size|count|len)\b)"),
            format!(r"\b(len|empty|count)\s*\(\s*{p}\s*\)"),
            condition,
            pattern_match,
        ],
        AssumptionKind::NeverNil => vec![
            format!(r"{p}\s*(&\.|\?\.)"),
            format!(r"{p}\s*\.\s*(nil\?|present\?|blank\?|is_none|is_some)"),
            format!(r"{p}\s+is\s+(not\s+)?None"),
            format!(r"{p}\s*(===?|!==?)\s*(nil|null|None|undefined)\b"),
            format!(r"\b(nil|null|None|undefined)\s*(===?|!==?)\s*{p}"),
            format!(r"{p}\s*(\|\|=?|\?\?|\bor\b)"),
            format!(r"Some\(\s*{p}\s*\)"),
            condition,
            pattern_match,
        ],
        AssumptionKind::NeverZero => vec![
            format!(r"{p}\s*(===?|!==?|>=?|<=?)\s*0(\.0)?\b"),
            format!(r"\b0(\.0)?\s*(===?|!==?|<|>)\s*{p}"),
            format!(r"{p}\s*\.\s*(zero\?|nonzero\?|positive\?|is_zero)"),
            condition,
            pattern_match,
        ],
        AssumptionKind::NeverFails => vec![
            format!(r"{p}\s*\.\s*(is_ok|is_some|is_err|is_none)\s*\("),
            format!(r"{p}\s*(===?|!==?)\s*(nil|null|undefined)\b"),
            handler,
            condition,
            pattern_match,
        ],
        AssumptionKind::WellFormedInput => vec![
            format!(r"{p}\s*\.\s*(match\?|isdigit|isnumeric|is_numeric)"),
            format!(r"{p}\s*=~|=~\s*{p}"),
            format!(r"\b(isNaN|isdigit)\s*\(\s*{p}"),
            format!(r"{p}\s*\.\s*parse\s*(::<[^>]*>)?\s*\(\s*\)\s*\?"),
            handler,
            pattern_match,
        ],
    };

    patterns.iter().any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(code))
            .unwrap_or(false)
    })
}
