use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{KairosError, Result};

/// Organisational default zone (UTC+8). Triggers and execution records use it
/// unless a job names its own.
pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";

/// Top-level config (kairos.toml + KAIROS_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KairosConfig {
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Scheduled task subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Master switch. When false every engine operation fails with
    /// `EngineNotActive`.
    /// Override with env var: KAIROS_TASK_ENABLED=false
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// IANA zone name used for trigger evaluation and record timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Attach the execution listener when the engine starts.
    #[serde(default = "bool_true")]
    pub listener: bool,
    /// Re-register every active job definition right after start.
    #[serde(default = "bool_true")]
    pub restore: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: default_timezone(),
            listener: true,
            restore: true,
        }
    }
}

impl TaskConfig {
    /// Resolve the configured zone name.
    pub fn tz(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Parse an IANA zone name such as `Asia/Shanghai` or `UTC`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| KairosError::InvalidTimezone(name.to_string()))
}

fn bool_true() -> bool {
    true
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kairos/kairos.db", home)
}

impl KairosConfig {
    /// Load config from a TOML file with KAIROS_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.kairos/kairos.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: KairosConfig = Figment::from(Serialized::defaults(KairosConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KAIROS_").split("_"))
            .extract()
            .map_err(|e| KairosError::Config(e.to_string()))?;

        config.task.tz()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kairos/kairos.toml", home)
}
