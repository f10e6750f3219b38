//! Configuration system
//!
//! Layered load: global config file, then project file, then `OPSPILOT_*`
//! environment overrides. Every persisted-state path hangs off a single base
//! directory so tests (and embedders) can point the whole engine at a
//! tempdir.

use anyhow::{Context, Result};
use crate::policy::RiskLevel;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub changes: ChangesConfig,

    /// Base directory for all persisted state. Defaults to the platform data
    /// dir when unset.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint root (the client appends
    /// `/chat/completions`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Can also be set via OPSPILOT_API_KEY.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Use structured function calls instead of JSON-in-text.
    #[serde(default)]
    pub supports_function_calling: bool,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<REDACTED>" })
            .field("timeout_secs", &self.timeout_secs)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: String::new(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            supports_function_calling: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Safe-tier instructions run without asking.
    #[serde(default = "default_true")]
    pub auto_approve_safe: bool,

    /// Highest risk tier the non-interactive CLI mode may execute.
    #[serde(default)]
    pub cli_max_risk: RiskLevel,

    /// Highest risk tier the interactive terminal mode may execute.
    #[serde(default = "default_tui_max_risk")]
    pub tui_max_risk: RiskLevel,

    #[serde(default)]
    pub dry_run_by_default: bool,

    /// High-risk instructions must be seen as a dry run first.
    #[serde(default = "default_true")]
    pub require_dry_run_for_high_risk: bool,

    /// When false, commands not matched by the whitelist are rejected
    /// instead of falling through to the risk analyzer.
    #[serde(default = "default_true")]
    pub risk_analyzer_enabled: bool,

    /// Optional TOML file replacing the built-in whitelist rules.
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            auto_approve_safe: true,
            cli_max_risk: RiskLevel::Safe,
            tui_max_risk: RiskLevel::High,
            dry_run_by_default: false,
            require_dry_run_for_high_risk: true,
            risk_analyzer_enabled: true,
            rules_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for one turn.
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_secs: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Failed commands may loop back to the reasoner this many times.
    #[serde(default = "default_max_recoveries")]
    pub max_error_recoveries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            turn_timeout_secs: default_turn_timeout(),
            history_capacity: default_history_capacity(),
            max_error_recoveries: default_max_recoveries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,

    /// Writes within this window coalesce into one save.
    #[serde(default = "default_memory_debounce")]
    pub save_debounce_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_memory_capacity(),
            save_debounce_ms: default_memory_debounce(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesConfig {
    /// Snapshots older than this are pruned on startup.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

/// Resolved filesystem layout under the base directory.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base
    }

    pub fn audit_log(&self) -> PathBuf {
        self.base.join("audit.log")
    }

    pub fn memory_file(&self) -> PathBuf {
        self.base.join("memory.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.base.join("checkpoints")
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.base.join("changes")
    }
}

impl Config {
    /// Load configuration from all sources (global file, project file, env).
    pub async fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let content = fs::read_to_string(&global_path)
                    .await
                    .with_context(|| format!("failed to read {}", global_path.display()))?;
                config = toml::from_str(&content)
                    .with_context(|| format!("invalid config {}", global_path.display()))?;
            }
        }

        for name in ["opspilot.toml", ".opspilot/config.toml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                let project: Config = toml::from_str(&content)
                    .with_context(|| format!("invalid config {}", path.display()))?;
                config = config.merge(project);
            }
        }

        config.apply_env();
        Ok(config)
    }

    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "opspilot", "opspilot")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn default_data_dir() -> PathBuf {
        ProjectDirs::from("dev", "opspilot", "opspilot")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".opspilot"))
    }

    /// Resolved state layout for this configuration.
    pub fn paths(&self) -> Paths {
        Paths::new(
            self.base_dir
                .clone()
                .unwrap_or_else(Self::default_data_dir),
        )
    }

    fn merge(mut self, other: Self) -> Self {
        // Project config wins wholesale. Env overrides still apply on top.
        self.llm = other.llm;
        self.safety = other.safety;
        self.engine = other.engine;
        self.memory = other.memory;
        self.changes = other.changes;
        if other.base_dir.is_some() {
            self.base_dir = other.base_dir;
        }
        self
    }

    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("OPSPILOT_BASE_URL") {
            self.llm.base_url = val;
        }
        if let Ok(val) = std::env::var("OPSPILOT_MODEL") {
            self.llm.model = val;
        }
        if let Ok(val) = std::env::var("OPSPILOT_API_KEY") {
            self.llm.api_key = val;
        }
        if let Ok(val) = std::env::var("OPSPILOT_BASE_DIR") {
            self.base_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("OPSPILOT_DRY_RUN") {
            if let Ok(flag) = parse_bool(&val) {
                self.safety.dry_run_by_default = flag;
            }
        }
        if let Ok(val) = std::env::var("OPSPILOT_RISK_ANALYZER") {
            if let Ok(flag) = parse_bool(&val) {
                self.safety.risk_analyzer_enabled = flag;
            }
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean value: {other}"),
    }
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5:7b".to_string()
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_tui_max_risk() -> RiskLevel {
    RiskLevel::High
}

fn default_max_iterations() -> u32 {
    8
}

fn default_turn_timeout() -> u64 {
    120
}

fn default_history_capacity() -> usize {
    20
}

fn default_max_recoveries() -> u32 {
    2
}

fn default_memory_capacity() -> usize {
    200
}

fn default_memory_debounce() -> u64 {
    2000
}

fn default_retention_days() -> i64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.engine.max_iterations, 8);
        assert_eq!(config.engine.history_capacity, 20);
        assert_eq!(config.safety.cli_max_risk, RiskLevel::Safe);
        assert_eq!(config.safety.tui_max_risk, RiskLevel::High);
        assert!(config.safety.risk_analyzer_enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[llm]
model = "llama3:8b"

[safety]
cli_max_risk = "medium"
"#,
        )
        .unwrap();
        assert_eq!(config.llm.model, "llama3:8b");
        assert_eq!(config.llm.timeout_secs, 30);
        assert_eq!(config.safety.cli_max_risk, RiskLevel::Medium);
        assert!(config.safety.require_dry_run_for_high_risk);
    }

    #[test]
    fn paths_hang_off_base_dir() {
        let config = Config {
            base_dir: Some(PathBuf::from("/tmp/opspilot-test")),
            ..Default::default()
        };
        let paths = config.paths();
        assert_eq!(paths.audit_log(), PathBuf::from("/tmp/opspilot-test/audit.log"));
        assert_eq!(
            paths.checkpoints_dir(),
            PathBuf::from("/tmp/opspilot-test/checkpoints")
        );
    }
}
