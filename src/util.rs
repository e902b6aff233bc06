use crate::unit::{CodeUnit, Language};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// One source line split into code and trailing comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine<'a> {
    /// 1-based line number
    pub number: usize,
    /// Byte offset of the line start within the unit
    pub offset: usize,
    pub text: &'a str,
    pub code: &'a str,
    pub comment: Option<&'a str>,
}

impl SourceLine<'_> {
    pub fn is_comment_only(&self) -> bool {
        self.code.trim().is_empty() && self.comment.is_some()
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Leading whitespace of the line
    pub fn indent(&self) -> &str {
        let trimmed = self.text.trim_start();
        &self.text[..self.text.len() - trimmed.len()]
    }
}

/// Split every line of a unit into code and comment parts
pub fn source_lines(unit: &CodeUnit) -> Vec<SourceLine<'_>> {
    let source = unit.source();
    let language = unit.language();
    let mut out = Vec::new();
    let mut offset = 0;
    for (i, raw) in source.split('\n').enumerate() {
        let text = raw.strip_suffix('\r').unwrap_or(raw);
        let (code, comment) = split_comment(text, language);
        out.push(SourceLine {
            number: i + 1,
            offset,
            text,
            code,
            comment,
        });
        offset += raw.len() + 1;
    }
    // A trailing newline produces one empty phantom line
    if source.ends_with('\n') {
        out.pop();
    }
    out
}

/// Split a line at the first comment marker outside a string literal
pub fn split_comment(line: &str, language: Language) -> (&str, Option<&str>) {
    let prefixes = language.comment_prefixes();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                // Rust lifetimes and char-like apostrophes in Rust are not strings we can track
                if !(c == '\'' && language == Language::Rust) {
                    quote = Some(c);
                }
            }
            _ => {
                let rest = &line[i..];
                if prefixes.iter().any(|p| rest.starts_with(p)) {
                    return (&line[..i], Some(&line[i..]));
                }
            }
        }
    }
    (line, None)
}

/// Blank out the contents of string literals, keeping byte offsets intact,
/// so identifiers and keywords inside strings are ignored
pub fn blank_strings(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in code.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
                out.push(c);
                continue;
            }
            out.extend(std::iter::repeat(' ').take(c.len_utf8()));
            continue;
        }
        if matches!(c, '"' | '\'' | '`') {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_truncate_unicode_safe() {
        assert_eq!(truncate("错误: 失败 😊", 5), "错误...");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn test_split_comment_ignores_markers_in_strings() {
        let (code, comment) = split_comment(r#"x = "a # b" # real"#, Language::Ruby);
        assert_eq!(code, r#"x = "a # b" "#);
        assert_eq!(comment, Some("# real"));

        let (code, comment) = split_comment("let url = \"http://x\"; // note", Language::Rust);
        assert_eq!(code, "let url = \"http://x\"; ");
        assert_eq!(comment, Some("// note"));
    }

    #[test]
    fn test_source_lines_offsets() {
        let unit = CodeUnit::new("a = 1\n# c\nb = 2\n", Some(PathBuf::from("x.rb")), 1024).unwrap();
        let lines = source_lines(&unit);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].offset, 6);
        assert!(lines[1].is_comment_only());
        assert_eq!(lines[2].number, 3);
    }

    #[test]
    fn test_blank_strings_keeps_offsets() {
        let code = r#"puts "camelCase" + x"#;
        let blanked = blank_strings(code);
        assert_eq!(blanked, r#"puts "         " + x"#);
        assert_eq!(blanked.len(), code.len());
    }
}
