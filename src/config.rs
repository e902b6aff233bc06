//! Configuration management for bughunt
//!
//! Stores tunables in ~/.config/bughunt/config.json. The config is loaded
//! once at startup and handed to each component as `Arc<Config>`.
//! API keys are never part of it; see [`api_key`].

use crate::error::{HuntError, HuntResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "bughunt";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_STORE_DIR: &str = ".bughunt";

const KEYRING_SERVICE: &str = "bughunt";
const KEYRING_USERNAME: &str = "openrouter_api_key";

/// Environment toggle equivalent to `enable_bug_hunting = true`
pub const FORCE_DEEP_ENV: &str = "BUGHUNT_FORCE_DEEP";
const WORKERS_ENV: &str = "BUGHUNT_WORKERS";
const STORE_DIR_ENV: &str = "BUGHUNT_STORE_DIR";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// One deliberation participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Stable name used in audit trails
    pub id: String,
    pub model_id: String,
    /// Arbitration tie-break; lower wins
    pub priority: u32,
    #[serde(default = "default_participant_timeout")]
    pub timeout_secs: u64,
}

impl ParticipantConfig {
    pub fn new(id: &str, model_id: &str, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            model_id: model_id.to_string(),
            priority,
            timeout_secs: default_participant_timeout(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn default_participant_timeout() -> u64 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest code unit accepted, in bytes
    pub max_input_bytes: usize,
    /// Consecutive verification failures before a unit needs a human
    pub repeat_failure_threshold: u32,
    /// Relative improvement below which a cycle counts as a plateau
    pub plateau_threshold: f64,
    /// Consecutive plateau cycles before the loop stops
    pub plateau_cycles: u32,
    /// Hard bound on cycles per unit
    pub max_cycles: u32,
    pub worker_count: usize,
    pub participants: Vec<ParticipantConfig>,
    /// How long an `ask` decision waits for a human before pausing
    pub human_wait_secs: u64,
    /// Top-ranked hypotheses that get a fix skeleton
    pub max_fix_candidates: usize,
    /// Added-line budget for a single fix skeleton
    pub max_fix_lines: usize,
    /// Lines touched before a diff raises the risk tier
    pub blast_radius_lines: usize,
    pub store_dir: Option<PathBuf>,
    /// Set from `BUGHUNT_FORCE_DEEP`; never read from or written to disk
    #[serde(skip)]
    pub force_bug_hunting: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_input_bytes: 32 * 1024,
            repeat_failure_threshold: 3,
            plateau_threshold: 0.02,
            plateau_cycles: 3,
            max_cycles: 12,
            worker_count: 4,
            participants: vec![
                ParticipantConfig::new("smart", "anthropic/claude-opus-4.5", 0),
                ParticipantConfig::new("balanced", "anthropic/claude-sonnet-4.5", 1),
                ParticipantConfig::new("speed", "openai/gpt-oss-120b", 2),
            ],
            human_wait_secs: 300,
            max_fix_candidates: 3,
            max_fix_lines: 6,
            blast_radius_lines: 20,
            store_dir: None,
            force_bug_hunting: false,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load config from disk plus environment overrides, or defaults
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load config from a specific file without environment overrides
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                match preserve_corrupt_config(path, &content) {
                    Ok(backup) => tracing::warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        "config file was corrupted ({}); a backup was saved and defaults were loaded",
                        err
                    ),
                    Err(backup_err) => tracing::warn!(
                        path = %path.display(),
                        "config file was corrupted ({}) and could not be backed up ({}); defaults were loaded",
                        err,
                        backup_err
                    ),
                }
                Self::default()
            }
        }
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(FORCE_DEEP_ENV) {
            self.force_bug_hunting = is_truthy(&value);
        }
        if let Some(value) = lookup(WORKERS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.worker_count = n,
                _ => tracing::warn!("ignoring invalid {}={:?}", WORKERS_ENV, value),
            }
        }
        if let Some(value) = lookup(STORE_DIR_ENV) {
            if !value.trim().is_empty() {
                self.store_dir = Some(PathBuf::from(value.trim()));
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> HuntResult<()> {
        if self.max_input_bytes == 0 {
            return Err(HuntError::Config("max_input_bytes must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(HuntError::Config("worker_count must be at least 1".into()));
        }
        if self.repeat_failure_threshold == 0 || self.plateau_cycles == 0 || self.max_cycles == 0
        {
            return Err(HuntError::Config(
                "thresholds and cycle bounds must be at least 1".into(),
            ));
        }
        if !(self.plateau_threshold > 0.0 && self.plateau_threshold <= 1.0) {
            return Err(HuntError::Config(format!(
                "plateau_threshold must be in (0, 1], got {}",
                self.plateau_threshold
            )));
        }
        let mut seen = HashSet::new();
        for p in &self.participants {
            if !seen.insert(p.id.as_str()) {
                return Err(HuntError::Config(format!(
                    "duplicate participant id '{}'",
                    p.id
                )));
            }
            if p.timeout_secs == 0 {
                return Err(HuntError::Config(format!(
                    "participant '{}' needs a positive timeout",
                    p.id
                )));
            }
        }
        Ok(())
    }

    /// Session store location: configured path or `.bughunt/` in the working directory
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR))
    }

    /// Save config to disk
    pub fn save(&self) -> HuntResult<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| HuntError::Config("could not determine config directory".into()))?;
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(self)?;
        crate::store::write_atomic(&dir.join(CONFIG_FILE), &content)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    is_truthy(&std::env::var("BUGHUNT_DISABLE_KEYRING").unwrap_or_default())
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

/// OpenRouter API key from the environment, falling back to the system keychain.
///
/// Kept outside `Config` so it can never end up in a persisted payload.
pub fn api_key() -> Option<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            return Some(key);
        }
    }
    if keyring_disabled() {
        return None;
    }
    match read_keyring_key() {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(
                "failed to read API key from system keychain: {}; set {} instead",
                err,
                API_KEY_ENV
            );
            None
        }
    }
}

/// Move an unparsable config aside, copying it when the rename fails
fn preserve_corrupt_config(path: &Path, content: &str) -> std::io::Result<PathBuf> {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        fs::write(&corrupt_path, content)?;
    }
    Ok(corrupt_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.repeat_failure_threshold, 3);
        assert_eq!(config.plateau_cycles, 3);
        assert!((config.plateau_threshold - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (FORCE_DEEP_ENV, "yes"),
            (WORKERS_ENV, "8"),
            (STORE_DIR_ENV, "/tmp/hunt"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert!(config.force_bug_hunting);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/hunt"));
    }

    #[test]
    fn test_invalid_worker_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == WORKERS_ENV).then(|| "zero".to_string()));
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn test_force_flag_is_not_serialized() {
        let config = Config {
            force_bug_hunting: true,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("force_bug_hunting"));
    }

    #[test]
    fn test_duplicate_participants_rejected() {
        let mut config = Config::default();
        config.participants = vec![
            ParticipantConfig::new("a", "m1", 0),
            ParticipantConfig::new("a", "m2", 1),
        ];
        assert!(matches!(config.validate(), Err(HuntError::Config(_))));
    }

    #[test]
    fn test_corrupt_config_falls_back_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.worker_count, Config::default().worker_count);
        assert!(dir.path().join("config.json.corrupt").exists());
    }

    #[test]
    fn test_failed_backup_leaves_the_corrupt_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        fs::create_dir(dir.path().join("config.json.corrupt")).unwrap();

        assert!(preserve_corrupt_config(&path, "{ not json").is_err());
        let config = Config::load_from(&path);
        assert_eq!(config.worker_count, Config::default().worker_count);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_cycles": 5}"#).unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.max_cycles, 5);
        assert_eq!(config.participants.len(), 3);
    }
}
