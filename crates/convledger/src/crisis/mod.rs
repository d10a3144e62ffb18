//! Crisis keyword detection for message content.
//!
//! Messages are checked against a configured keyword-to-severity table:
//!
//! - **Whole-word matching** (the default) avoids flagging `diet` for `die`.
//!   Substring matching can be selected instead.
//!
//! - **One match per keyword**: a message mentioning a keyword several times
//!   yields a single match for it; distinct keywords each yield their own.
//!
//! # Example
//!
//! ```
//! use convledger::crisis::{CrisisDetector, CrisisKeyword, DetectorConfig, MatchMode};
//! use convledger::SeverityLevel;
//!
//! let detector = CrisisDetector::with_config(DetectorConfig {
//!     enabled: true,
//!     mode: MatchMode::WholeWord,
//!     keywords: vec![CrisisKeyword::new("hopeless", SeverityLevel::High)],
//! })
//! .unwrap();
//!
//! let matches = detector.detect("I feel hopeless");
//! assert_eq!(matches.len(), 1);
//! assert_eq!(matches[0].severity, SeverityLevel::High);
//! ```

mod detector;
mod keywords;

pub use detector::{CrisisDetector, DetectorConfig, KeywordMatch};
pub use keywords::{default_keywords, CrisisKeyword, KeywordRule, MatchMode};
