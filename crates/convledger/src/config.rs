//! Configuration management for convledger.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::assignment::AssignmentStrategy;
use crate::crisis::{default_keywords, CrisisKeyword, DetectorConfig, MatchMode};
use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "convledger";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "conversations.db";

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "CONVLEDGER_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `CONVLEDGER_`, sections split on `__`)
/// 2. TOML config file at `~/.config/convledger/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Study protocol configuration.
    pub study: StudyConfig,
    /// Crisis detection configuration.
    pub safety: SafetyConfig,
    /// Export audit configuration.
    pub audit: AuditConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/convledger/conversations.db`
    pub database_path: Option<PathBuf>,
    /// How long a connection waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
}

/// Study protocol configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Number of user messages that completes a conversation.
    pub message_quota: u32,
    /// Prefix for generated participant ids.
    pub participant_id_prefix: String,
    /// How new participants are assigned a bot type.
    pub assignment: AssignmentStrategy,
}

/// Crisis detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Run crisis detection on appended messages.
    pub detection_enabled: bool,
    /// How keywords are matched.
    pub match_mode: MatchMode,
    /// Also scan bot-authored messages.
    pub scan_bot_messages: bool,
    /// Keyword-to-severity table.
    pub keywords: Vec<CrisisKeyword>,
}

/// Export audit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Actor recorded when none is given on the command line.
    pub default_actor: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            message_quota: 20,
            participant_id_prefix: "P".to_string(),
            assignment: AssignmentStrategy::EqualDistribution,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            detection_enabled: true,
            match_mode: MatchMode::WholeWord,
            scan_bot_messages: false,
            keywords: default_keywords(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_actor: "researcher".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `CONVLEDGER_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.busy_timeout_ms == 0 {
            return Err(Error::ConfigValidation {
                message: "busy_timeout_ms must be greater than 0".to_string(),
            });
        }

        if self.study.message_quota == 0 {
            return Err(Error::ConfigValidation {
                message: "message_quota must be greater than 0".to_string(),
            });
        }

        if self.study.participant_id_prefix.trim().is_empty() {
            return Err(Error::ConfigValidation {
                message: "participant_id_prefix cannot be empty".to_string(),
            });
        }

        if self.audit.default_actor.trim().is_empty() {
            return Err(Error::ConfigValidation {
                message: "default_actor cannot be empty".to_string(),
            });
        }

        // Validate keyword table
        let mut seen = HashSet::new();
        for entry in &self.safety.keywords {
            let keyword = entry.keyword.trim();
            if keyword.is_empty() {
                return Err(Error::ConfigValidation {
                    message: "crisis keywords cannot be empty".to_string(),
                });
            }
            if !seen.insert(keyword.to_lowercase()) {
                return Err(Error::ConfigValidation {
                    message: format!("duplicate crisis keyword: {keyword}"),
                });
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the busy timeout as a Duration.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    /// Build the crisis detector configuration.
    #[must_use]
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            enabled: self.safety.detection_enabled,
            mode: self.safety.match_mode,
            keywords: self.safety.keywords.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SeverityLevel;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.study.message_quota, 20);
        assert_eq!(config.study.participant_id_prefix, "P");
        assert!(config.safety.detection_enabled);
        assert!(!config.safety.scan_bot_messages);
        assert_eq!(config.audit.default_actor, "researcher");
    }

    #[test]
    fn test_default_storage_config() {
        let storage = StorageConfig::default();

        assert!(storage.database_path.is_none());
        assert_eq!(storage.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_default_safety_config() {
        let safety = SafetyConfig::default();

        assert_eq!(safety.match_mode, MatchMode::WholeWord);
        assert!(!safety.keywords.is_empty());
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_quota() {
        let mut config = Config::default();
        config.study.message_quota = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("message_quota"));
    }

    #[test]
    fn test_validate_zero_busy_timeout() {
        let mut config = Config::default();
        config.storage.busy_timeout_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("busy_timeout_ms"));
    }

    #[test]
    fn test_validate_empty_prefix() {
        let mut config = Config::default();
        config.study.participant_id_prefix = "  ".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("participant_id_prefix"));
    }

    #[test]
    fn test_validate_empty_keyword() {
        let mut config = Config::default();
        config.safety.keywords = vec![CrisisKeyword::new("", SeverityLevel::High)];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cannot be empty"));
    }

    #[test]
    fn test_validate_duplicate_keyword() {
        let mut config = Config::default();
        config.safety.keywords = vec![
            CrisisKeyword::new("hopeless", SeverityLevel::High),
            CrisisKeyword::new("Hopeless", SeverityLevel::Low),
        ];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate crisis keyword"));
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        let path = config.database_path();

        assert!(path.to_string_lossy().contains("conversations.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_busy_timeout() {
        let config = Config::default();
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_detector_config_mirrors_safety() {
        let mut config = Config::default();
        config.safety.detection_enabled = false;
        config.safety.match_mode = MatchMode::Substring;

        let detector = config.detector_config();
        assert!(!detector.enabled);
        assert_eq!(detector.mode, MatchMode::Substring);
        assert_eq!(detector.keywords, config.safety.keywords);
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("convledger"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        // Loading from a nonexistent path should work (uses defaults)
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Config::default());
    }

    #[test]
    fn test_load_toml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "convledger.toml",
                r#"
                [study]
                message_quota = 10
                participant_id_prefix = "S"
                assignment = "sequential"

                [safety]
                match_mode = "substring"
                keywords = [
                    { keyword = "hopeless", severity = "high" },
                    { keyword = "tired", severity = "low" },
                ]
                "#,
            )?;

            let config = Config::load_from(Some(PathBuf::from("convledger.toml")))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.study.message_quota, 10);
            assert_eq!(config.study.participant_id_prefix, "S");
            assert_eq!(config.study.assignment, AssignmentStrategy::Sequential);
            assert_eq!(config.safety.match_mode, MatchMode::Substring);
            assert_eq!(config.safety.keywords.len(), 2);
            assert_eq!(config.safety.keywords[1].severity, SeverityLevel::Low);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("convledger.toml", "[study]\nmessage_quota = 10\n")?;
            jail.set_env("CONVLEDGER_STUDY__MESSAGE_QUOTA", "12");
            jail.set_env("CONVLEDGER_STORAGE__BUSY_TIMEOUT_MS", "250");

            let config = Config::load_from(Some(PathBuf::from("convledger.toml")))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.study.message_quota, 12);
            assert_eq!(config.storage.busy_timeout_ms, 250);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("convledger.toml", "[study]\nmessage_quota = 0\n")?;

            let result = Config::load_from(Some(PathBuf::from("convledger.toml")));
            assert!(matches!(result, Err(Error::ConfigValidation { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_config_serialize() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("message_quota"));
        assert!(json.contains("whole_word"));
    }
}
