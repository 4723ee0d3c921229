use crate::core::emitter::Emitter;
use crate::core::stage::{self, call_guarded, forward, report, validate_stage_name};
use crate::domain::model::{Output, StageSummary};
use crate::domain::ports::{ErrorChannel, Stage};
use crate::utils::error::{Phase, PluginError, Result, TransformResult};
use async_trait::async_trait;
use std::time::Instant;
use tokio::sync::mpsc;

pub type SyncTransformFn<T> =
    Box<dyn FnMut(T, &mut Emitter<T>) -> TransformResult<Output<T>> + Send>;
pub type SyncFlushFn<T> = Box<dyn FnMut(&mut Emitter<T>) -> TransformResult<Output<T>> + Send>;

/// 同步 stage 的配置；沒有 transform 時為 pass-through
pub struct SyncStageConfig<T> {
    pub name: String,
    pub transform: Option<SyncTransformFn<T>>,
    pub flush: Option<SyncFlushFn<T>>,
}

impl<T> Default for SyncStageConfig<T> {
    fn default() -> Self {
        Self {
            name: stage::DEFAULT_STAGE_NAME.to_string(),
            transform: None,
            flush: None,
        }
    }
}

impl<T> SyncStageConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: FnMut(T, &mut Emitter<T>) -> TransformResult<Output<T>> + Send + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn with_flush<F>(mut self, flush: F) -> Self
    where
        F: FnMut(&mut Emitter<T>) -> TransformResult<Output<T>> + Send + 'static,
    {
        self.flush = Some(Box::new(flush));
        self
    }
}

/// 以同步函式實作的 stage
///
/// 每筆 record 在同一輪排程內處理完畢：先送出 `Emitter` 收集的 record，
/// 再送出回傳值。錯誤與 panic 都轉成 [`PluginError`] 送往錯誤通道，
/// stage 繼續處理下一筆。
pub struct SyncStage<T> {
    name: String,
    transform: Option<SyncTransformFn<T>>,
    flush: Option<SyncFlushFn<T>>,
}

impl<T: Send + 'static> SyncStage<T> {
    pub fn new(config: SyncStageConfig<T>) -> Result<Self> {
        validate_stage_name(&config.name)?;
        Ok(Self {
            name: config.name,
            transform: config.transform,
            flush: config.flush,
        })
    }

    pub fn passthrough() -> Self {
        Self {
            name: stage::DEFAULT_STAGE_NAME.to_string(),
            transform: None,
            flush: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<T>,
        output: mpsc::Sender<T>,
        errors: ErrorChannel,
    ) -> Result<StageSummary> {
        let started = Instant::now();
        let mut summary = StageSummary::new(&self.name);
        tracing::debug!("▶️ Stage '{}' started", self.name);

        while let Some(record) = input.recv().await {
            summary.records_in += 1;

            let mut emitter = Emitter::new();
            let outcome = match self.transform.as_mut() {
                None => Ok(Output::One(record)),
                Some(transform) => call_guarded(|| transform(record, &mut emitter)),
            };

            // 顯式 emit 的 record 在錯誤發生前就已送出
            let mut records = emitter.into_records();
            let failure = match outcome {
                Ok(returned) => {
                    records.extend(returned.into_records());
                    None
                }
                Err(cause) => Some(PluginError::new(&self.name, Phase::Transform, cause)),
            };

            if !forward(&output, records, &mut summary).await {
                summary.closed_early = true;
                break;
            }
            if let Some(error) = failure {
                report(&errors, &mut summary, error)?;
            }
        }

        if summary.closed_early {
            tracing::debug!("Stage '{}': downstream closed, skipping flush", self.name);
        } else if let Some(flush) = self.flush.as_mut() {
            let mut emitter = Emitter::new();
            let outcome = call_guarded(|| flush(&mut emitter));
            summary.flushed = true;

            let mut records = emitter.into_records();
            let failure = match outcome {
                Ok(returned) => {
                    records.extend(returned.into_records());
                    None
                }
                Err(cause) => Some(PluginError::new(&self.name, Phase::Flush, cause)),
            };

            if !forward(&output, records, &mut summary).await {
                summary.closed_early = true;
            }
            if let Some(error) = failure {
                report(&errors, &mut summary, error)?;
            }
        }

        summary.duration = started.elapsed();
        tracing::debug!(
            "⏹️ Stage '{}' finished (in: {}, out: {}, errors: {}, duration: {:?})",
            summary.stage,
            summary.records_in,
            summary.records_out,
            summary.errors,
            summary.duration
        );
        Ok(summary)
    }
}

#[async_trait]
impl<T: Send + 'static> Stage<T> for SyncStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        self: Box<Self>,
        input: mpsc::Receiver<T>,
        output: mpsc::Sender<T>,
        errors: ErrorChannel,
    ) -> Result<StageSummary> {
        SyncStage::run(*self, input, output, errors).await
    }
}
