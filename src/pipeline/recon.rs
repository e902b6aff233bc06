//! Phase 1: symbol inventory and control-flow skeleton
//!
//! Language-agnostic over source lines. Nothing here judges the code; later
//! phases query the inventory.

use crate::unit::CodeUnit;
use crate::util::{blank_strings, source_lines, SourceLine};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// A function or method definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Definition {
    pub name: String,
    pub line: usize,
    pub end_line: usize,
    pub params: Vec<String>,
}

/// `name = rhs` with the right-hand side as written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub name: String,
    pub line: usize,
    pub rhs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolUse {
    pub name: String,
    pub line: usize,
}

/// A block opener with its span and nesting depth (0 = top level)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub keyword: String,
    pub line: usize,
    pub end_line: usize,
    pub depth: usize,
}

impl Block {
    pub fn contains(&self, line: usize) -> bool {
        self.line <= line && line <= self.end_line
    }

    pub fn is_definition(&self) -> bool {
        matches!(self.keyword.as_str(), "def" | "fn" | "func" | "function")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub definitions: Vec<Definition>,
    pub assignments: Vec<Assignment>,
    pub uses: Vec<SymbolUse>,
    pub blocks: Vec<Block>,
}

impl Inventory {
    pub fn symbol_count(&self) -> usize {
        self.definitions.len() + self.assignments.len() + self.uses.len()
    }

    /// Blank or comment-only text: nothing to analyze
    pub fn is_trivially_clean(&self) -> bool {
        self.symbol_count() == 0 && self.blocks.is_empty()
    }

    /// Most recent assignment to `name` strictly before `line`
    pub fn last_assignment_before(&self, name: &str, line: usize) -> Option<&Assignment> {
        self.assignments
            .iter()
            .filter(|a| a.name == name && a.line < line)
            .max_by_key(|a| a.line)
    }

    /// Innermost definition whose span covers `line`
    pub fn enclosing_definition(&self, line: usize) -> Option<&Definition> {
        self.definitions
            .iter()
            .filter(|d| d.line <= line && line <= d.end_line)
            .max_by_key(|d| d.line)
    }

    /// Innermost block whose span covers `line`
    pub fn enclosing_block(&self, line: usize) -> Option<&Block> {
        self.blocks
            .iter()
            .filter(|b| b.contains(line))
            .max_by_key(|b| (b.depth, b.line))
    }

    /// Whether `name` is a parameter of the definition enclosing `line`
    pub fn parameter_of(&self, name: &str, line: usize) -> Option<&Definition> {
        self.enclosing_definition(line)
            .filter(|d| d.params.iter().any(|p| p == name))
    }

    pub fn max_depth(&self) -> usize {
        self.blocks.iter().map(|b| b.depth + 1).max().unwrap_or(0)
    }
}

const KEYWORDS: &[&str] = &[
    "and", "as", "async", "await", "begin", "break", "case", "catch", "class", "const", "continue",
    "def", "defer", "do", "elif", "else", "elsif", "end", "ensure", "enum", "except", "export",
    "extends", "false", "False", "finally", "fn", "for", "from", "func", "function", "go", "if",
    "impl", "import", "in", "interface", "is", "lambda", "let", "loop", "map", "match", "mod",
    "module", "mut", "new", "nil", "None", "not", "null", "or", "package", "pass", "pub", "raise",
    "rescue", "return", "self", "Self", "static", "struct", "switch", "then", "throw", "trait",
    "true", "True", "try", "type", "undefined", "unless", "until", "use", "var", "when", "where",
    "while", "yield",
];

const BLOCK_KEYWORDS: &[&str] = &[
    "if", "unless", "while", "until", "for", "loop", "match", "case", "switch", "begin", "try",
    "def", "fn", "func", "function", "class", "module", "impl",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

fn definition_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(def|fn|func|function)\s+(?:\([^)]*\)\s*)?(?:self\.)?([A-Za-z_]\w*[?!]?)\s*(?:<[^>]*>)?\s*(?:\(([^)]*)\)?)?",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:let\s+(?:mut\s+)?|const\s+|var\s+|local\s+)?([A-Za-z_]\w*(?:\s*,\s*[A-Za-z_]\w*)*)\s*(?::\s*[^=]+?)?\s*(:=|=)\s*([^=~].*)$",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z_]\w*[?!]?").unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternatives = BLOCK_KEYWORDS.join("|");
        Regex::new(&format!(r"^\s*(?:\}}\s*)?(?:pub\s+)?(?:async\s+)?({})\b", alternatives))
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

/// Build the inventory for one unit
pub fn survey(unit: &CodeUnit) -> Inventory {
    let lines = source_lines(unit);
    let blanked: Vec<String> = lines.iter().map(|l| blank_strings(l.code)).collect();
    let mut inventory = Inventory::default();

    for (line, code) in lines.iter().zip(&blanked) {
        if code.trim().is_empty() {
            continue;
        }
        collect_definition(line, code, &mut inventory);
        collect_assignments(line, code, &mut inventory);
        collect_uses(line, code, &mut inventory);
    }

    inventory.blocks = collect_blocks(&lines, &blanked);
    for def in &mut inventory.definitions {
        if let Some(block) = inventory
            .blocks
            .iter()
            .find(|b| b.line == def.line && b.is_definition())
        {
            def.end_line = block.end_line;
        }
    }
    inventory
}

fn collect_definition(line: &SourceLine<'_>, code: &str, inventory: &mut Inventory) {
    let Some(caps) = definition_re().captures(code) else {
        return;
    };
    let name = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
    let params = caps
        .get(3)
        .map(|m| parse_params(m.as_str()))
        .unwrap_or_default();
    inventory.definitions.push(Definition {
        name,
        line: line.number,
        end_line: line.number,
        params,
    });
}

/// `a, b = 1` style parameter lists in any of the supported languages
fn parse_params(list: &str) -> Vec<String> {
    list.split(',')
        .filter_map(|raw| {
            let p = raw
                .trim()
                .trim_start_matches(['*', '&'])
                .trim_start_matches("mut ")
                .trim();
            let name = p
                .split(|c: char| c == ':' || c == '=' || c.is_whitespace())
                .next()
                .unwrap_or("")
                .trim_start_matches(['*', '&']);
            let valid = !name.is_empty()
                && name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_alphanumeric() || c == '_');
            (valid && name != "self" && name != "this").then(|| name.to_string())
        })
        .collect()
}

fn collect_assignments(line: &SourceLine<'_>, code: &str, inventory: &mut Inventory) {
    let Some(caps) = assignment_re().captures(code) else {
        return;
    };
    let (Some(names), Some(rhs)) = (caps.get(1), caps.get(3)) else {
        return;
    };
    // The right-hand side is read from the original text so literals survive
    let rhs_text = line.code[rhs.start()..].trim().to_string();
    for name in names.as_str().split(',').map(str::trim) {
        if name.is_empty() || is_keyword(name) {
            continue;
        }
        inventory.assignments.push(Assignment {
            name: name.to_string(),
            line: line.number,
            rhs: rhs_text.clone(),
        });
    }
}

fn collect_uses(line: &SourceLine<'_>, code: &str, inventory: &mut Inventory) {
    for m in identifier_re().find_iter(code) {
        let word = m.as_str().trim_end_matches(['?', '!']);
        // Skip the tail of numeric literals like `10l` and member names after `::`
        let prev = code[..m.start()].chars().next_back();
        if prev.is_some_and(|c| c.is_ascii_digit()) || is_keyword(word) {
            continue;
        }
        inventory.uses.push(SymbolUse {
            name: word.to_string(),
            line: line.number,
        });
    }
}

/// Find block openers and estimate each span from indentation and closers
fn collect_blocks(lines: &[SourceLine<'_>], blanked: &[String]) -> Vec<Block> {
    let mut blocks = Vec::new();
    for (i, code) in blanked.iter().enumerate() {
        let Some(caps) = block_re().captures(code) else {
            continue;
        };
        let keyword = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let end_line = block_end(lines, blanked, i, keyword);
        blocks.push(Block {
            keyword: keyword.to_string(),
            line: lines[i].number,
            end_line,
            depth: 0,
        });
    }

    for i in 0..blocks.len() {
        let (line, end) = (blocks[i].line, blocks[i].end_line);
        blocks[i].depth = blocks
            .iter()
            .enumerate()
            .filter(|(j, b)| *j != i && b.line <= line && end <= b.end_line && b.line != line)
            .count();
    }
    blocks
}

fn block_end(lines: &[SourceLine<'_>], blanked: &[String], start: usize, keyword: &str) -> usize {
    let opener = &blanked[start];
    // One-liners like `def hello; puts 'hi'; end` or `if x { y }`
    if closes_on_same_line(opener, keyword) {
        return lines[start].number;
    }

    let indent = lines[start].indent().len();
    let mut end = lines[start].number;
    for (line, code) in lines[start + 1..].iter().zip(&blanked[start + 1..]) {
        if line.is_blank() || line.is_comment_only() {
            continue;
        }
        let this_indent = line.indent().len();
        if this_indent > indent {
            end = line.number;
            continue;
        }
        let trimmed = code.trim();
        let is_closer = trimmed.starts_with('}')
            || trimmed == "end"
            || trimmed.starts_with("end ")
            || trimmed.starts_with(')');
        let is_continuation = ["else", "elsif", "elif", "rescue", "ensure", "except", "finally", "when", "catch"]
            .iter()
            .any(|k| trimmed.starts_with(k));
        if this_indent == indent && (is_closer || is_continuation) {
            end = line.number;
            if is_continuation {
                continue;
            }
        }
        break;
    }
    end
}

fn closes_on_same_line(code: &str, keyword: &str) -> bool {
    let opens = code.matches('{').count();
    let closes = code.matches('}').count();
    if opens > 0 {
        return opens <= closes;
    }
    let words: Vec<&str> = code
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    keyword != "fn" && words.last() == Some(&"end")
}
