use serde::Deserialize;
use serde::Serialize;

pub const DEFAULT_MEMORIES_MAX_ROLLOUTS_PER_STARTUP: usize = 64;
pub const DEFAULT_MEMORIES_MAX_ROLLOUT_AGE_DAYS: i64 = 30;
pub const DEFAULT_MEMORIES_MIN_ROLLOUT_IDLE_HOURS: i64 = 12;
pub const DEFAULT_MEMORIES_THREAD_SCAN_LIMIT: usize = 300;
pub const DEFAULT_MEMORIES_MAX_RAW_MEMORIES_FOR_GLOBAL: usize = 200;
pub const DEFAULT_MEMORIES_STAGE1_CONCURRENCY: usize = 8;
pub const DEFAULT_MEMORIES_STAGE1_LEASE_SECONDS: i64 = 120;
pub const DEFAULT_MEMORIES_STAGE1_RETRY_DELAY_SECONDS: i64 = 120;
pub const DEFAULT_MEMORIES_PHASE2_LEASE_SECONDS: i64 = 180;
pub const DEFAULT_MEMORIES_PHASE2_RETRY_DELAY_SECONDS: i64 = 180;
pub const DEFAULT_MEMORIES_PHASE2_HEARTBEAT_SECONDS: u64 = 30;
pub const DEFAULT_MEMORIES_ROLLOUT_PAYLOAD_PERCENT: f64 = 0.7;
pub const DEFAULT_MEMORIES_FALLBACK_TOKEN_LIMIT: usize = 16_000;
pub const DEFAULT_MEMORIES_SUMMARY_INJECTION_TOKEN_LIMIT: usize = 5_000;

/// Memories settings loaded from config.toml.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct MemoriesToml {
    /// When `true`, eligible sessions run the startup pipeline.
    pub enabled: Option<bool>,
    /// Maximum number of rollout candidates processed per pass.
    pub max_rollouts_per_startup: Option<usize>,
    /// Maximum age of the threads used for memories.
    pub max_rollout_age_days: Option<i64>,
    /// Minimum idle time between last thread activity and memory creation (hours). > 12h recommended.
    pub min_rollout_idle_hours: Option<i64>,
    /// Number of recent threads inspected when looking for stage-1 candidates.
    pub thread_scan_limit: Option<usize>,
    /// Maximum number of recent raw memories retained for global consolidation.
    pub max_raw_memories_for_global: Option<usize>,
    /// Number of stage-1 extractions run in parallel.
    pub stage1_concurrency: Option<usize>,
    pub stage1_lease_seconds: Option<i64>,
    pub stage1_retry_delay_seconds: Option<i64>,
    pub phase2_lease_seconds: Option<i64>,
    pub phase2_retry_delay_seconds: Option<i64>,
    /// How often a running consolidation renews its lease.
    pub phase2_heartbeat_seconds: Option<u64>,
    /// Share of the model context window spent on the rollout payload.
    pub rollout_payload_percent: Option<f64>,
    /// Token budget used when the model context window is unknown.
    pub fallback_token_limit: Option<usize>,
    /// Token budget for the memory summary injected into developer instructions.
    pub summary_injection_token_limit: Option<usize>,
    /// Model used for thread summarisation.
    pub phase_1_model: Option<String>,
    /// Model used for memory consolidation.
    pub phase_2_model: Option<String>,
}

/// Effective memories settings after defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoriesConfig {
    pub enabled: bool,
    pub max_rollouts_per_startup: usize,
    pub max_rollout_age_days: i64,
    pub min_rollout_idle_hours: i64,
    pub thread_scan_limit: usize,
    pub max_raw_memories_for_global: usize,
    pub stage1_concurrency: usize,
    pub stage1_lease_seconds: i64,
    pub stage1_retry_delay_seconds: i64,
    pub phase2_lease_seconds: i64,
    pub phase2_retry_delay_seconds: i64,
    pub phase2_heartbeat_seconds: u64,
    pub rollout_payload_percent: f64,
    pub fallback_token_limit: usize,
    pub summary_injection_token_limit: usize,
    pub phase_1_model: Option<String>,
    pub phase_2_model: Option<String>,
}

impl Default for MemoriesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_rollouts_per_startup: DEFAULT_MEMORIES_MAX_ROLLOUTS_PER_STARTUP,
            max_rollout_age_days: DEFAULT_MEMORIES_MAX_ROLLOUT_AGE_DAYS,
            min_rollout_idle_hours: DEFAULT_MEMORIES_MIN_ROLLOUT_IDLE_HOURS,
            thread_scan_limit: DEFAULT_MEMORIES_THREAD_SCAN_LIMIT,
            max_raw_memories_for_global: DEFAULT_MEMORIES_MAX_RAW_MEMORIES_FOR_GLOBAL,
            stage1_concurrency: DEFAULT_MEMORIES_STAGE1_CONCURRENCY,
            stage1_lease_seconds: DEFAULT_MEMORIES_STAGE1_LEASE_SECONDS,
            stage1_retry_delay_seconds: DEFAULT_MEMORIES_STAGE1_RETRY_DELAY_SECONDS,
            phase2_lease_seconds: DEFAULT_MEMORIES_PHASE2_LEASE_SECONDS,
            phase2_retry_delay_seconds: DEFAULT_MEMORIES_PHASE2_RETRY_DELAY_SECONDS,
            phase2_heartbeat_seconds: DEFAULT_MEMORIES_PHASE2_HEARTBEAT_SECONDS,
            rollout_payload_percent: DEFAULT_MEMORIES_ROLLOUT_PAYLOAD_PERCENT,
            fallback_token_limit: DEFAULT_MEMORIES_FALLBACK_TOKEN_LIMIT,
            summary_injection_token_limit: DEFAULT_MEMORIES_SUMMARY_INJECTION_TOKEN_LIMIT,
            phase_1_model: None,
            phase_2_model: None,
        }
    }
}

impl From<MemoriesToml> for MemoriesConfig {
    fn from(toml: MemoriesToml) -> Self {
        let defaults = Self::default();
        let phase2_lease_seconds = toml
            .phase2_lease_seconds
            .unwrap_or(defaults.phase2_lease_seconds)
            .clamp(2, 86_400);
        // The heartbeat has to fire well inside the lease it renews.
        let max_heartbeat_seconds = u64::try_from(phase2_lease_seconds / 2).unwrap_or(1).max(1);
        let rollout_payload_percent = toml
            .rollout_payload_percent
            .filter(|percent| percent.is_finite())
            .unwrap_or(defaults.rollout_payload_percent)
            .clamp(0.05, 1.0);
        Self {
            enabled: toml.enabled.unwrap_or(defaults.enabled),
            max_rollouts_per_startup: toml
                .max_rollouts_per_startup
                .unwrap_or(defaults.max_rollouts_per_startup)
                .clamp(1, 128),
            max_rollout_age_days: toml
                .max_rollout_age_days
                .unwrap_or(defaults.max_rollout_age_days)
                .clamp(0, 90),
            min_rollout_idle_hours: toml
                .min_rollout_idle_hours
                .unwrap_or(defaults.min_rollout_idle_hours)
                .clamp(1, 48),
            thread_scan_limit: toml
                .thread_scan_limit
                .unwrap_or(defaults.thread_scan_limit)
                .clamp(1, 5_000),
            max_raw_memories_for_global: toml
                .max_raw_memories_for_global
                .unwrap_or(defaults.max_raw_memories_for_global)
                .min(4096),
            stage1_concurrency: toml
                .stage1_concurrency
                .unwrap_or(defaults.stage1_concurrency)
                .clamp(1, 64),
            stage1_lease_seconds: toml
                .stage1_lease_seconds
                .unwrap_or(defaults.stage1_lease_seconds)
                .clamp(1, 86_400),
            stage1_retry_delay_seconds: toml
                .stage1_retry_delay_seconds
                .unwrap_or(defaults.stage1_retry_delay_seconds)
                .clamp(0, 604_800),
            phase2_lease_seconds,
            phase2_retry_delay_seconds: toml
                .phase2_retry_delay_seconds
                .unwrap_or(defaults.phase2_retry_delay_seconds)
                .clamp(0, 604_800),
            phase2_heartbeat_seconds: toml
                .phase2_heartbeat_seconds
                .unwrap_or(defaults.phase2_heartbeat_seconds)
                .clamp(1, max_heartbeat_seconds),
            rollout_payload_percent,
            fallback_token_limit: toml
                .fallback_token_limit
                .unwrap_or(defaults.fallback_token_limit)
                .max(256),
            summary_injection_token_limit: toml
                .summary_injection_token_limit
                .unwrap_or(defaults.summary_injection_token_limit)
                .max(1),
            phase_1_model: toml.phase_1_model,
            phase_2_model: toml.phase_2_model,
        }
    }
}

#[derive(Deserialize, Default)]
struct ConfigToml {
    #[serde(default)]
    memories: Option<MemoriesToml>,
}

impl MemoriesConfig {
    /// Reads the `[memories]` table of a `config.toml` document. Other tables
    /// are ignored; a missing table yields the defaults.
    pub fn from_config_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let config: ConfigToml = toml::from_str(contents)?;
        Ok(config.memories.unwrap_or_default().into())
    }
}
