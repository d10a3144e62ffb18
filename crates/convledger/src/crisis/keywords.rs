//! Crisis keyword rules.
//!
//! A keyword table maps each configured term to a severity level. Each entry
//! is compiled into a case-insensitive regex once, when the detector is built.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::SeverityLevel;

/// How keywords are matched against message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Match only on word boundaries, so `die` does not match `diet`.
    #[default]
    WholeWord,
    /// Match anywhere in the text.
    Substring,
}

/// One row of the configured keyword table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisKeyword {
    /// The term to look for.
    pub keyword: String,
    /// Severity attached to flags raised by this term.
    pub severity: SeverityLevel,
}

impl CrisisKeyword {
    /// Create a keyword table entry.
    #[must_use]
    pub fn new(keyword: impl Into<String>, severity: SeverityLevel) -> Self {
        Self {
            keyword: keyword.into(),
            severity,
        }
    }
}

/// A compiled keyword rule.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    keyword: String,
    severity: SeverityLevel,
    regex: Regex,
}

impl KeywordRule {
    /// Compile a rule for the given keyword.
    ///
    /// The keyword is escaped, so regex metacharacters are matched literally.
    /// Inner whitespace matches any run of whitespace. In whole-word mode a
    /// word boundary is required only at an edge that is a word character,
    /// so keywords like `help!` or `#988` still match.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyword is blank.
    pub fn compile(entry: &CrisisKeyword, mode: MatchMode) -> Result<Self> {
        let keyword = entry.keyword.trim();
        if keyword.is_empty() {
            return Err(Error::ConfigValidation {
                message: "crisis keywords cannot be empty".to_string(),
            });
        }

        let body = keyword
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s+");
        let pattern = match mode {
            MatchMode::WholeWord => {
                let start = if keyword.starts_with(is_word_char) { r"\b" } else { "" };
                let end = if keyword.ends_with(is_word_char) { r"\b" } else { "" };
                format!("(?i){start}{body}{end}")
            }
            MatchMode::Substring => format!("(?i){body}"),
        };

        let regex = Regex::new(&pattern).map_err(|e| Error::ConfigValidation {
            message: format!("invalid crisis keyword '{keyword}': {e}"),
        })?;

        Ok(Self {
            keyword: keyword.to_string(),
            severity: entry.severity,
            regex,
        })
    }

    /// The keyword as configured (trimmed).
    #[must_use]
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// The severity attached to this keyword.
    #[must_use]
    pub fn severity(&self) -> SeverityLevel {
        self.severity
    }

    /// Check if the content contains this keyword.
    #[must_use]
    pub fn matches(&self, content: &str) -> bool {
        self.regex.is_match(content)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// The keyword table used when none is configured.
#[must_use]
pub fn default_keywords() -> Vec<CrisisKeyword> {
    use SeverityLevel::{High, Low, Medium};

    vec![
        // Suicidal ideation
        CrisisKeyword::new("suicide", High),
        CrisisKeyword::new("suicidal", High),
        CrisisKeyword::new("kill myself", High),
        CrisisKeyword::new("end it all", High),
        CrisisKeyword::new("want to die", High),
        CrisisKeyword::new("no reason to live", High),
        CrisisKeyword::new("better off dead", High),
        CrisisKeyword::new("hopeless", High),
        // Self-harm
        CrisisKeyword::new("self-harm", Medium),
        CrisisKeyword::new("hurt myself", Medium),
        CrisisKeyword::new("cutting myself", Medium),
        CrisisKeyword::new("can't go on", Medium),
        // Distress
        CrisisKeyword::new("worthless", Low),
        CrisisKeyword::new("give up", Low),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(keyword: &str, mode: MatchMode) -> KeywordRule {
        KeywordRule::compile(&CrisisKeyword::new(keyword, SeverityLevel::High), mode).unwrap()
    }

    #[test]
    fn test_whole_word_is_case_insensitive() {
        let rule = rule("hopeless", MatchMode::WholeWord);
        assert!(rule.matches("I feel hopeless"));
        assert!(rule.matches("HOPELESS."));
        assert!(!rule.matches("I feel hopelessness"));
    }

    #[test]
    fn test_substring_matches_inside_words() {
        let rule = rule("hopeless", MatchMode::Substring);
        assert!(rule.matches("complete hopelessness"));
    }

    #[test]
    fn test_whole_word_does_not_match_prefix() {
        let rule = rule("die", MatchMode::WholeWord);
        assert!(rule.matches("I want to die"));
        assert!(!rule.matches("I'm on a diet"));
    }

    #[test]
    fn test_phrase_tolerates_extra_whitespace() {
        let rule = rule("kill myself", MatchMode::WholeWord);
        assert!(rule.matches("sometimes I want to kill   myself"));
        assert!(rule.matches("Kill\nmyself"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let hyphenated = rule("self-harm", MatchMode::WholeWord);
        assert!(hyphenated.matches("thinking about self-harm again"));
        assert!(!hyphenated.matches("selfxharm"));

        let bracketed = rule("end (it)", MatchMode::Substring);
        assert!(bracketed.matches("end (it)"));
        assert!(!bracketed.matches("end it"));
    }

    #[test]
    fn test_whole_word_with_punctuation_edges() {
        let exclaimed = rule("help!", MatchMode::WholeWord);
        assert!(exclaimed.matches("please help! call someone"));
        assert!(exclaimed.matches("HELP!"));
        assert!(!exclaimed.matches("helpful!"));
        assert!(!exclaimed.matches("please help me"));

        let hotline = rule("#988", MatchMode::WholeWord);
        assert!(hotline.matches("call #988 now"));
        assert!(hotline.matches("dial#988"));
        assert!(!hotline.matches("call #9881"));

        let ellipsis = rule("...", MatchMode::WholeWord);
        assert!(ellipsis.matches("I don't know..."));
    }

    #[test]
    fn test_keyword_is_trimmed() {
        let rule = rule("  suicide ", MatchMode::WholeWord);
        assert_eq!(rule.keyword(), "suicide");
        assert_eq!(rule.severity(), SeverityLevel::High);
    }

    #[test]
    fn test_blank_keyword_rejected() {
        let result = KeywordRule::compile(
            &CrisisKeyword::new("   ", SeverityLevel::Low),
            MatchMode::WholeWord,
        );
        assert!(matches!(result, Err(Error::ConfigValidation { .. })));
    }

    #[test]
    fn test_default_keywords_compile() {
        for entry in default_keywords() {
            assert!(KeywordRule::compile(&entry, MatchMode::WholeWord).is_ok());
        }
    }

    #[test]
    fn test_default_keywords_cover_every_severity() {
        let keywords = default_keywords();
        for severity in [SeverityLevel::High, SeverityLevel::Medium, SeverityLevel::Low] {
            assert!(keywords.iter().any(|k| k.severity == severity));
        }
        assert!(keywords
            .iter()
            .any(|k| k.keyword == "hopeless" && k.severity == SeverityLevel::High));
    }

    #[test]
    fn test_match_mode_default() {
        assert_eq!(MatchMode::default(), MatchMode::WholeWord);
    }
}
