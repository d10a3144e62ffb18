//! Crisis detector.
//!
//! Runs message text against the compiled keyword table. Matching is local
//! and synchronous, so it is safe to call while a write transaction is open.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::keywords::{default_keywords, CrisisKeyword, KeywordRule, MatchMode};
use crate::error::{Error, Result};
use crate::model::SeverityLevel;

/// A keyword found in a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    /// The configured keyword.
    pub keyword: String,
    /// Its configured severity.
    pub severity: SeverityLevel,
}

/// Configuration for the crisis detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Whether detection runs at all.
    pub enabled: bool,
    /// How keywords are matched.
    pub mode: MatchMode,
    /// The keyword-to-severity table.
    pub keywords: Vec<CrisisKeyword>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: MatchMode::WholeWord,
            keywords: default_keywords(),
        }
    }
}

/// Keyword matcher for crisis content.
#[derive(Debug, Clone)]
pub struct CrisisDetector {
    enabled: bool,
    mode: MatchMode,
    rules: Vec<KeywordRule>,
}

impl CrisisDetector {
    /// Create a detector with the default keyword table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DetectorConfig::default())
            .unwrap_or_else(|_| Self::disabled())
    }

    /// Create a detector that never matches.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            mode: MatchMode::default(),
            rules: Vec::new(),
        }
    }

    /// Create a detector from a keyword table.
    ///
    /// # Errors
    ///
    /// Returns an error if a keyword is blank or appears twice (compared
    /// case-insensitively).
    pub fn with_config(config: DetectorConfig) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(config.keywords.len());

        for entry in &config.keywords {
            let rule = KeywordRule::compile(entry, config.mode)?;
            if !seen.insert(rule.keyword().to_lowercase()) {
                return Err(Error::ConfigValidation {
                    message: format!("duplicate crisis keyword: {}", rule.keyword()),
                });
            }
            rules.push(rule);
        }

        if config.enabled && rules.is_empty() {
            warn!("Crisis detection is enabled but the keyword table is empty");
        }

        Ok(Self {
            enabled: config.enabled,
            mode: config.mode,
            rules,
        })
    }

    /// Check if detection is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The configured match mode.
    #[must_use]
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Number of configured keywords.
    #[must_use]
    pub fn keyword_count(&self) -> usize {
        self.rules.len()
    }

    /// The configured keywords, in table order.
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(KeywordRule::keyword)
    }

    /// Find every distinct keyword present in the content.
    ///
    /// Results follow the order of the keyword table. Each keyword appears at
    /// most once no matter how often it occurs in the text.
    #[must_use]
    pub fn detect(&self, content: &str) -> Vec<KeywordMatch> {
        if !self.enabled {
            return Vec::new();
        }

        let matches: Vec<KeywordMatch> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(content))
            .map(|rule| KeywordMatch {
                keyword: rule.keyword().to_string(),
                severity: rule.severity(),
            })
            .collect();

        if !matches.is_empty() {
            debug!(count = matches.len(), "Crisis keywords detected");
        }
        matches
    }

    /// The highest severity present in the content, if any keyword matched.
    #[must_use]
    pub fn highest_severity(&self, content: &str) -> Option<SeverityLevel> {
        self.detect(content).into_iter().map(|m| m.severity).max()
    }
}

impl Default for CrisisDetector {
    fn default() -> Self {
        Self::new()
    }
}
