use crate::domain::model::StageSummary;
use crate::domain::ports::{ErrorChannel, Stage};
use crate::utils::error::{BoxError, PluginError, Result, StageError, TransformResult};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 未指定名稱時使用的 stage 名稱
pub const DEFAULT_STAGE_NAME: &str = "use-stage";

pub(crate) fn validate_stage_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StageError::construction(name, "stage name cannot be empty"));
    }
    Ok(())
}

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
}

/// 目前執行緒是否正在 [`call_guarded`] 之內；panic hook 用來辨識已被攔截的 panic
pub fn in_guarded_call() -> bool {
    GUARDED.with(Cell::get)
}

/// 執行使用者函式，把 panic 轉成一般錯誤
pub(crate) fn call_guarded<R>(f: impl FnOnce() -> TransformResult<R>) -> TransformResult<R> {
    let outer = GUARDED.with(|guarded| guarded.replace(true));
    let caught = panic::catch_unwind(AssertUnwindSafe(f));
    GUARDED.with(|guarded| guarded.set(outer));

    match caught {
        Ok(result) => result,
        Err(payload) => Err(panic_cause(payload)),
    }
}

pub(crate) fn panic_cause(payload: Box<dyn Any + Send>) -> BoxError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("panicked: {}", message).into()
}

/// 依序送往下游；下游已關閉時回傳 `false`
pub(crate) async fn forward<T>(
    output: &mpsc::Sender<T>,
    records: Vec<T>,
    summary: &mut StageSummary,
) -> bool {
    for record in records {
        if output.send(record).await.is_err() {
            return false;
        }
        summary.records_out += 1;
    }
    true
}

/// 透過錯誤通道回報；沒有監聽者時中止 stage
pub(crate) fn report(
    errors: &ErrorChannel,
    summary: &mut StageSummary,
    error: PluginError,
) -> Result<()> {
    summary.errors += 1;
    tracing::warn!("⚠️ {}", error);
    errors.report(error).map_err(|e| {
        tracing::error!("❌ Unhandled error in stage '{}', aborting", e.plugin());
        StageError::Plugin(e)
    })
}

/// 在背景執行中的 stage
pub struct StageHandle<T> {
    output: mpsc::Receiver<T>,
    errors: mpsc::UnboundedReceiver<PluginError>,
    task: JoinHandle<Result<StageSummary>>,
}

impl<T: Send + 'static> StageHandle<T> {
    pub fn split(
        self,
    ) -> (
        mpsc::Receiver<T>,
        mpsc::UnboundedReceiver<PluginError>,
        JoinHandle<Result<StageSummary>>,
    ) {
        (self.output, self.errors, self.task)
    }

    /// 讀完所有輸出與錯誤後等待 stage 結束
    pub async fn collect(mut self) -> Result<(Vec<T>, Vec<PluginError>, StageSummary)> {
        let mut records = Vec::new();
        while let Some(record) = self.output.recv().await {
            records.push(record);
        }

        let summary = self.task.await??;

        let mut errors = Vec::new();
        while let Ok(error) = self.errors.try_recv() {
            errors.push(error);
        }
        Ok((records, errors, summary))
    }
}

/// 在 tokio task 上執行 stage，輸出 channel 容量至少為 1
pub fn spawn<T, S>(stage: S, input: mpsc::Receiver<T>, capacity: usize) -> StageHandle<T>
where
    T: Send + 'static,
    S: Stage<T> + 'static,
{
    let (output_tx, output) = mpsc::channel(capacity.max(1));
    let (error_channel, errors) = ErrorChannel::listen();
    let task = tokio::spawn(Box::new(stage).run(input, output_tx, error_channel));
    StageHandle {
        output,
        errors,
        task,
    }
}

/// 把一組 record 依序餵入新的 channel，送完即關閉
pub fn feed<T: Send + 'static>(records: Vec<T>, capacity: usize) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        for record in records {
            if tx.send(record).await.is_err() {
                break;
            }
        }
    });
    rx
}
