use serde::{Deserialize, Serialize};
use std::path::Path;

/// Orchestration settings. Every field has a default so an empty file (or no
/// file at all) yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Model identifier passed to the completion provider.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Wall-clock bound for executing a generated query.
    pub query_timeout_ms: u64,
    /// Hard cap on returned rows.
    pub max_result_rows: usize,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub jobs: JobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: i64,
    /// Windows older than this many windows are swept.
    pub cleanup_windows: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// Questions requested from the planner per job.
    pub plan_size: usize,
    pub max_concurrent_jobs: i64,
    /// Jobs below this remaining allowance are refused outright.
    pub min_credit_floor: f64,
    pub default_monthly_allocation: f64,
    /// Pause between steps to stay under provider rate limits.
    pub step_delay_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            query_timeout_ms: 30_000,
            max_result_rows: 1000,
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            jobs: JobConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 3600 }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_ms: 60_000,
            cleanup_windows: 2,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            plan_size: 10,
            max_concurrent_jobs: 3,
            min_credit_floor: 0.50,
            default_monthly_allocation: 10.0,
            step_delay_ms: 1000,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = std::collections::HashSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);

    // serde_ignored wrapper to capture unknown fields
    let cfg: CoreConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    if !ignored_keys.is_empty() {
        tracing::warn!(keys = ?ignored_keys, "ignored unknown config fields");
    }

    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &CoreConfig) -> Result<(), ConfigError> {
    if cfg.max_result_rows == 0 {
        return Err(ConfigError("max_result_rows must be positive".into()));
    }
    if cfg.rate_limit.max_requests == 0 {
        return Err(ConfigError("rate_limit.max_requests must be positive".into()));
    }
    if cfg.rate_limit.window_ms <= 0 {
        return Err(ConfigError("rate_limit.window_ms must be positive".into()));
    }
    if cfg.jobs.plan_size == 0 {
        return Err(ConfigError("jobs.plan_size must be positive".into()));
    }
    Ok(())
}
