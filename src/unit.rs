//! Code units: the immutable input to every analysis phase

use crate::error::InputError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Language tag, declared by the caller or inferred from the path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Ruby,
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rb" | "rake" => Language::Ruby,
            "py" => Language::Python,
            "js" | "mjs" | "cjs" | "jsx" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "rs" => Language::Rust,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Language::Ruby => "ruby",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Unknown => "unknown",
        }
    }

    /// Line comment prefixes for the language
    pub fn comment_prefixes(&self) -> &'static [&'static str] {
        match self {
            Language::Ruby | Language::Python => &["#"],
            Language::JavaScript | Language::TypeScript | Language::Rust | Language::Go => &["//"],
            Language::Unknown => &["#", "//", "--"],
        }
    }
}

/// One discrete piece of source text under analysis.
///
/// Only constructible through validating constructors, so a `CodeUnit`
/// in hand is always text within the configured size bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    source: String,
    path: Option<PathBuf>,
    language: Language,
}

impl CodeUnit {
    /// Build a unit from text, inferring the language from `path` when given
    pub fn new(
        source: impl Into<String>,
        path: Option<PathBuf>,
        max_bytes: usize,
    ) -> Result<Self, InputError> {
        let language = path
            .as_deref()
            .map(Language::from_path)
            .unwrap_or(Language::Unknown);
        Self::with_language(source, path, language, max_bytes)
    }

    pub fn with_language(
        source: impl Into<String>,
        path: Option<PathBuf>,
        language: Language,
        max_bytes: usize,
    ) -> Result<Self, InputError> {
        let source = source.into();
        validate_text(&source, max_bytes)?;
        Ok(Self {
            source,
            path,
            language,
        })
    }

    /// Build a unit from raw bytes (file content), rejecting non-text input
    pub fn from_bytes(
        bytes: &[u8],
        path: Option<PathBuf>,
        max_bytes: usize,
    ) -> Result<Self, InputError> {
        if bytes.len() > max_bytes {
            return Err(InputError::SizeExceeded {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| InputError::NotText(format!("invalid UTF-8 at byte {}", e.valid_up_to())))?;
        Self::new(text, path, max_bytes)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Display name for logs and prompts
    pub fn display_name(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string())
    }

    /// Stable identity of the unit's content across sessions
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.language.label().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.source.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// A new unit with replaced text, same path and language
    pub fn revised(&self, source: String, max_bytes: usize) -> Result<Self, InputError> {
        Self::with_language(source, self.path.clone(), self.language, max_bytes)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.source.lines()
    }

    pub fn line_count(&self) -> usize {
        self.source.lines().count()
    }

    /// Re-check the invariants; used by entry points that take a deserialized unit
    pub fn validate(&self, max_bytes: usize) -> Result<(), InputError> {
        validate_text(&self.source, max_bytes)
    }
}

fn validate_text(source: &str, max_bytes: usize) -> Result<(), InputError> {
    if source.len() > max_bytes {
        return Err(InputError::SizeExceeded {
            size: source.len(),
            limit: max_bytes,
        });
    }
    if let Some(pos) = source.find('\0') {
        return Err(InputError::NotText(format!("NUL byte at offset {}", pos)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 32 * 1024;

    #[test]
    fn test_language_inferred_from_path() {
        let unit = CodeUnit::new("x = 1", Some(PathBuf::from("app/models/user.rb")), LIMIT).unwrap();
        assert_eq!(unit.language(), Language::Ruby);

        let unit = CodeUnit::new("x = 1", None, LIMIT).unwrap();
        assert_eq!(unit.language(), Language::Unknown);
    }

    #[test]
    fn test_size_bound() {
        let source = "def hello; puts 'hi'; end".repeat(2000);
        let err = CodeUnit::new(source, None, 4096).unwrap_err();
        assert!(matches!(err, InputError::SizeExceeded { limit: 4096, .. }));
    }

    #[test]
    fn test_binary_input_rejected() {
        let err = CodeUnit::from_bytes(&[0xff, 0xfe, 0x00], None, LIMIT).unwrap_err();
        assert!(matches!(err, InputError::NotText(_)));

        let err = CodeUnit::new("abc\0def", None, LIMIT).unwrap_err();
        assert!(matches!(err, InputError::NotText(_)));
    }

    #[test]
    fn test_fingerprint_depends_on_content_and_language() {
        let a = CodeUnit::with_language("x", None, Language::Ruby, LIMIT).unwrap();
        let b = CodeUnit::with_language("x", None, Language::Python, LIMIT).unwrap();
        let c = CodeUnit::with_language("x", Some(PathBuf::from("elsewhere.rb")), Language::Ruby, LIMIT)
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
