pub mod config;
pub mod telemetry;
pub mod types;

pub use config::{load_dotenv, EngineConfig, GateConfig, InferenceConfig, ModelProfile, QueueConfig, RetryConfig};
pub use types::{ModelId, OwnerRef, ProjectId, UserId};
