use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ModelId;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub gate: GateConfig,
    pub queue: QueueConfig,
    pub inference: InferenceConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            gate: GateConfig::from_env(),
            queue: QueueConfig::from_env(),
            inference: InferenceConfig::from_env(),
            retry: RetryConfig::from_env(),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Engine config loaded:");
        tracing::info!("  gate:      capacity={}", self.gate.capacity);
        tracing::info!(
            "  queue:     max_pending_per_user={}, flush_ms={}",
            self.queue.max_pending_per_user,
            self.queue.batch_flush_ms
        );
        tracing::info!(
            "  inference: timeout_ms={}, models={}",
            self.inference.call_timeout_ms,
            self.inference.model_profiles.len()
        );
        tracing::info!(
            "  retry:     max_attempts={}, initial_ms={}, factor={}",
            self.retry.max_attempts,
            self.retry.initial_delay_ms,
            self.retry.backoff_factor
        );
    }
}

// ── Concurrency gate ──────────────────────────────────────────

/// GPU concurrency budget. Capacity is an operator-supplied tunable
/// reflecting GPU memory headroom; it is never derived here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub capacity: usize,
}

impl GateConfig {
    fn from_env() -> Self {
        Self {
            capacity: env_usize("SEG_GATE_CAPACITY", 4).max(1),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

// ── Queue & batching ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Max non-terminal items a single user may hold at once.
    pub max_pending_per_user: usize,
    /// Window after the first item of a forming batch before it is sealed
    /// regardless of fill level.
    pub batch_flush_ms: u64,
}

impl QueueConfig {
    fn from_env() -> Self {
        Self {
            max_pending_per_user: env_usize("SEG_MAX_PENDING_PER_USER", 64),
            batch_flush_ms: env_u64("SEG_BATCH_FLUSH_MS", 500),
        }
    }

    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.batch_flush_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_per_user: 64,
            batch_flush_ms: 500,
        }
    }
}

// ── Inference ─────────────────────────────────────────────────

/// Per-model batch sizing measured offline on the production GPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model_id: ModelId,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Hard timeout per inference call. Queue wait time does not count.
    pub call_timeout_ms: u64,
    pub model_profiles: Vec<ModelProfile>,
    /// Batch size for models without a measured profile.
    pub default_batch_size: usize,
}

impl InferenceConfig {
    fn from_env() -> Self {
        Self {
            call_timeout_ms: env_u64("SEG_INFER_TIMEOUT_MS", 30_000),
            model_profiles: Self::default_profiles(),
            default_batch_size: env_usize("SEG_DEFAULT_BATCH_SIZE", 4),
        }
    }

    fn default_profiles() -> Vec<ModelProfile> {
        vec![
            ModelProfile { model_id: "hrnet".into(), max_batch_size: 8 },
            ModelProfile { model_id: "cbam_resunet".into(), max_batch_size: 2 },
            ModelProfile { model_id: "unet".into(), max_batch_size: 4 },
        ]
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Max batch size for a model, falling back to the default.
    pub fn max_batch_for(&self, model_id: &str) -> usize {
        self.model_profiles
            .iter()
            .find(|p| p.model_id == model_id)
            .map(|p| p.max_batch_size)
            .unwrap_or(self.default_batch_size)
            .max(1)
    }

    pub fn batch_sizes(&self) -> HashMap<ModelId, usize> {
        self.model_profiles
            .iter()
            .map(|p| (p.model_id.clone(), p.max_batch_size.max(1)))
            .collect()
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            model_profiles: Self::default_profiles(),
            default_batch_size: 4,
        }
    }
}

// ── Retry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl RetryConfig {
    fn from_env() -> Self {
        Self {
            max_attempts: env_u32("SEG_RETRY_MAX_ATTEMPTS", 3).max(1),
            initial_delay_ms: env_u64("SEG_RETRY_INITIAL_DELAY_MS", 1_000),
            max_delay_ms: env_u64("SEG_RETRY_MAX_DELAY_MS", 30_000),
            backoff_factor: env_f64("SEG_RETRY_BACKOFF_FACTOR", 2.0),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}
