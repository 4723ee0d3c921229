pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliConfig;

pub use config::toml_config::TomlConfig;
pub use core::async_stage::{AsyncFlush, AsyncStage, AsyncStageConfig, AsyncTransform};
pub use core::emitter::{AsyncEmitter, Done, Emitter};
pub use core::pipeline::{PipelineOutcome, StagePipeline};
pub use core::stage::{feed, spawn, StageHandle, DEFAULT_STAGE_NAME};
pub use core::sync_stage::{SyncStage, SyncStageConfig};
pub use domain::model::{Output, Record, StageSummary};
pub use domain::ports::{ErrorChannel, Stage};
pub use utils::error::{BoxError, Phase, PluginError, Result, StageError, TransformResult};
