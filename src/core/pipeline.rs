use crate::core::stage::feed;
use crate::domain::model::StageSummary;
use crate::domain::ports::{ErrorChannel, Stage};
use crate::utils::error::{PluginError, Result, StageError};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Pipeline 執行結果
#[derive(Debug)]
pub struct PipelineOutcome<T> {
    pub records: Vec<T>,
    pub errors: Vec<PluginError>,
    pub summaries: Vec<StageSummary>,
    pub duration: Duration,
}

/// 依序串接多個 stage，以有界 channel 連接
pub struct StagePipeline<T: Send + 'static> {
    name: String,
    stages: Vec<Box<dyn Stage<T>>>,
    capacity: usize,
    halt_on_error: bool,
}

impl<T: Send + 'static> StagePipeline<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            halt_on_error: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel 容量，最小為 1
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// 第一個錯誤就中止整條 pipeline
    pub fn with_halt_on_error(mut self, halt: bool) -> Self {
        self.halt_on_error = halt;
        self
    }

    pub fn with_stage(mut self, stage: impl Stage<T> + 'static) -> Self {
        self.add_stage(Box::new(stage));
        self
    }

    pub fn add_stage(&mut self, stage: Box<dyn Stage<T>>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// 送入所有 record，收集輸出、錯誤與每個 stage 的摘要
    pub async fn run_collect(self, records: Vec<T>) -> Result<PipelineOutcome<T>> {
        let started = Instant::now();
        let stage_count = self.stages.len();
        tracing::info!(
            "🚀 Running pipeline '{}' ({} stages, {} records)",
            self.name,
            stage_count,
            records.len()
        );

        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut upstream = feed(records, self.capacity);

        for (index, stage) in self.stages.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(self.capacity);
            let errors = ErrorChannel::from_sender(error_tx.clone());
            let input = std::mem::replace(&mut upstream, rx);
            tasks.spawn(async move { (index, stage.run(input, tx, errors).await) });
        }
        // 只剩 stage 持有錯誤通道，全部結束後 error_rx 才會關閉
        drop(error_tx);

        let mut output = upstream;
        let mut collected = Vec::new();
        let mut errors = Vec::new();
        let mut output_open = true;
        let mut errors_open = true;

        while output_open || errors_open {
            tokio::select! {
                record = output.recv(), if output_open => match record {
                    Some(record) => collected.push(record),
                    None => output_open = false,
                },
                error = error_rx.recv(), if errors_open => match error {
                    Some(error) if self.halt_on_error => {
                        tracing::error!("❌ Pipeline '{}' halted: {}", self.name, error);
                        tasks.abort_all();
                        return Err(StageError::Plugin(error));
                    }
                    Some(error) => errors.push(error),
                    None => errors_open = false,
                },
            }
        }

        let mut slots: Vec<Option<StageSummary>> = vec![None; stage_count];
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined?;
            slots[index] = Some(result?);
        }
        let summaries: Vec<StageSummary> = slots.into_iter().flatten().collect();

        let duration = started.elapsed();
        tracing::info!(
            "✅ Pipeline '{}' finished (records: {}, errors: {}, duration: {:?})",
            self.name,
            collected.len(),
            errors.len(),
            duration
        );

        Ok(PipelineOutcome {
            records: collected,
            errors,
            summaries,
            duration,
        })
    }

    /// 執行摘要
    pub fn execution_summary(outcome: &PipelineOutcome<T>) -> HashMap<String, serde_json::Value> {
        let mut summary = HashMap::new();

        let records_in = outcome.summaries.first().map(|s| s.records_in).unwrap_or(0);

        summary.insert(
            "total_stages".to_string(),
            serde_json::Value::Number(outcome.summaries.len().into()),
        );
        summary.insert(
            "records_in".to_string(),
            serde_json::Value::Number(records_in.into()),
        );
        summary.insert(
            "records_out".to_string(),
            serde_json::Value::Number(outcome.records.len().into()),
        );
        summary.insert(
            "total_errors".to_string(),
            serde_json::Value::Number(outcome.errors.len().into()),
        );
        summary.insert(
            "total_duration_ms".to_string(),
            serde_json::Value::Number((outcome.duration.as_millis() as u64).into()),
        );

        let stage_names: Vec<serde_json::Value> = outcome
            .summaries
            .iter()
            .map(|s| serde_json::Value::String(s.stage.clone()))
            .collect();
        summary.insert(
            "executed_stages".to_string(),
            serde_json::Value::Array(stage_names),
        );

        summary
    }
}
