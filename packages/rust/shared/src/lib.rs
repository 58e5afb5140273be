//! Shared types, error model, and configuration for the xAIO pipeline.
//!
//! This crate is the foundation depended on by all other xAIO crates.
//! It provides:
//! - [`XaioError`], the unified error type
//! - Domain types ([`WorkItem`], [`StageRecord`], [`StageStatus`], [`Fingerprint`])
//! - Configuration ([`AppConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ExternalStageConfig, MetaStageConfig, ClaimsStageConfig, BuffersStageConfig,
    ModelConfig, PathsConfig, PipelineConfig, PublishConfig, QueueConfig, RetryConfig,
    RetrySection, StagesConfig, BUILTIN_STAGES, config_dir, config_file_path, init_config,
    load_config, load_config_from, require_env,
};
pub use error::{Result, XaioError};
pub use types::{
    ErrorText, Fingerprint, ItemId, StageFields, StageRecord, StageStatus, WorkItem,
    truncate_chars,
};
