use crate::core::emitter::{AsyncEmitter, Done};
use crate::core::stage::{self, call_guarded, forward, report, validate_stage_name};
use crate::domain::model::{Output, StageSummary};
use crate::domain::ports::{ErrorChannel, Stage};
use crate::utils::error::{BoxError, Phase, PluginError, Result, TransformResult};
use crate::utils::validation::Validate;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::task::Poll;
use std::time::Instant;
use tokio::sync::mpsc;

pub type CallbackTransformFn<T> = Box<dyn FnMut(T, AsyncEmitter<T>, Done<T>) + Send>;
pub type FutureTransformFn<T> =
    Box<dyn FnMut(T, AsyncEmitter<T>) -> BoxFuture<'static, TransformResult<Output<T>>> + Send>;
pub type CallbackFlushFn<T> = Box<dyn FnMut(AsyncEmitter<T>, Done<T>) + Send>;
pub type FutureFlushFn<T> =
    Box<dyn FnMut(AsyncEmitter<T>) -> BoxFuture<'static, TransformResult<Output<T>>> + Send>;
pub type Validator<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// 非同步 transform 的呼叫慣例，在建構時決定
pub enum AsyncTransform<T> {
    /// `transform(record, emitter, done)`，透過 `done` 回報結果 (最多一筆)
    Callback(CallbackTransformFn<T>),
    /// `transform(record, emitter)` 回傳 future
    Future(FutureTransformFn<T>),
}

impl<T: Send + 'static> AsyncTransform<T> {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnMut(T, AsyncEmitter<T>, Done<T>) + Send + 'static,
    {
        AsyncTransform::Callback(Box::new(f))
    }

    pub fn future<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(T, AsyncEmitter<T>) -> Fut + Send + 'static,
        Fut: Future<Output = TransformResult<Output<T>>> + Send + 'static,
    {
        AsyncTransform::Future(Box::new(move |record: T, emitter: AsyncEmitter<T>| {
            f(record, emitter).boxed()
        }))
    }

    async fn invoke(&mut self, record: T, emitter: AsyncEmitter<T>) -> TransformResult<Output<T>> {
        match self {
            AsyncTransform::Callback(f) => {
                let (done, settled) = Done::channel();
                call_guarded(|| {
                    f(record, emitter, done);
                    Ok(())
                })?;
                settled.wait().await
            }
            AsyncTransform::Future(f) => {
                let pending = call_guarded(|| Ok(f(record, emitter)))?;
                settle(pending).await
            }
        }
    }
}

/// 非同步 flush 的呼叫慣例
pub enum AsyncFlush<T> {
    Callback(CallbackFlushFn<T>),
    Future(FutureFlushFn<T>),
}

impl<T: Send + 'static> AsyncFlush<T> {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnMut(AsyncEmitter<T>, Done<T>) + Send + 'static,
    {
        AsyncFlush::Callback(Box::new(f))
    }

    pub fn future<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(AsyncEmitter<T>) -> Fut + Send + 'static,
        Fut: Future<Output = TransformResult<Output<T>>> + Send + 'static,
    {
        AsyncFlush::Future(Box::new(move |emitter: AsyncEmitter<T>| f(emitter).boxed()))
    }

    async fn invoke(&mut self, emitter: AsyncEmitter<T>) -> TransformResult<Output<T>> {
        match self {
            AsyncFlush::Callback(f) => {
                let (done, settled) = Done::channel();
                call_guarded(|| {
                    f(emitter, done);
                    Ok(())
                })?;
                settled.wait().await
            }
            AsyncFlush::Future(f) => {
                let pending = call_guarded(|| Ok(f(emitter)))?;
                settle(pending).await
            }
        }
    }
}

/// 等待 future 完成；每次 poll 都在 `call_guarded` 內，poll 時的 panic 視同 rejection
async fn settle<T>(
    mut pending: BoxFuture<'static, TransformResult<Output<T>>>,
) -> TransformResult<Output<T>> {
    future::poll_fn(move |cx| match call_guarded(|| Ok(pending.as_mut().poll(cx))) {
        Ok(polled) => polled,
        Err(cause) => Poll::Ready(Err(cause)),
    })
    .await
}

/// 非同步 stage 的配置
pub struct AsyncStageConfig<T> {
    pub name: String,
    pub transform: Option<AsyncTransform<T>>,
    pub flush: Option<AsyncFlush<T>>,
    /// 檢查 transform / flush 回傳的每一筆 record
    pub validator: Option<Validator<T>>,
}

impl<T> Default for AsyncStageConfig<T> {
    fn default() -> Self {
        Self {
            name: stage::DEFAULT_STAGE_NAME.to_string(),
            transform: None,
            flush: None,
            validator: None,
        }
    }
}

impl<T: Send + 'static> AsyncStageConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transform(mut self, transform: AsyncTransform<T>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_flush(mut self, flush: AsyncFlush<T>) -> Self {
        self.flush = Some(flush);
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// 使用 record 自身的 [`Validate`] 實作
    pub fn with_validation(self) -> Self
    where
        T: Validate,
    {
        self.with_validator(|record: &T| record.validate())
    }
}

/// 以非同步函式實作的 stage
///
/// 同一時間最多只有一個 transform 在執行：前一筆 settle 之前不會讀取下一筆，
/// 因此輸出順序與輸入順序一致。
pub struct AsyncStage<T> {
    name: String,
    transform: Option<AsyncTransform<T>>,
    flush: Option<AsyncFlush<T>>,
    validator: Option<Validator<T>>,
}

impl<T: Send + 'static> AsyncStage<T> {
    pub fn new(config: AsyncStageConfig<T>) -> Result<Self> {
        validate_stage_name(&config.name)?;
        Ok(Self {
            name: config.name,
            transform: config.transform,
            flush: config.flush,
            validator: config.validator,
        })
    }

    pub fn passthrough() -> Self {
        Self {
            name: stage::DEFAULT_STAGE_NAME.to_string(),
            transform: None,
            flush: None,
            validator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 整批驗證，任何一筆不合格則整批不輸出
    fn validate_batch(&self, returned: &Output<T>) -> TransformResult<()> {
        if let Some(validator) = &self.validator {
            for (index, record) in returned.iter().enumerate() {
                validator(record).map_err(|e| -> BoxError {
                    format!("returned record #{} is not a valid record: {}", index, e).into()
                })?;
            }
        }
        Ok(())
    }

    /// 把 settle 後的結果轉成要輸出的 record 或錯誤
    fn resolve(
        &self,
        phase: Phase,
        settled: TransformResult<Output<T>>,
    ) -> (Vec<T>, Option<PluginError>) {
        match settled {
            Ok(returned) => match self.validate_batch(&returned) {
                Ok(()) => (returned.into_records(), None),
                Err(cause) => (
                    Vec::new(),
                    Some(PluginError::new(&self.name, Phase::Validation, cause)),
                ),
            },
            Err(cause) => (Vec::new(), Some(PluginError::new(&self.name, phase, cause))),
        }
    }

    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<T>,
        output: mpsc::Sender<T>,
        errors: ErrorChannel,
    ) -> Result<StageSummary> {
        let started = Instant::now();
        let mut summary = StageSummary::new(&self.name);
        let emitter = AsyncEmitter::new(&output);
        tracing::debug!("▶️ Async stage '{}' started", self.name);

        let result = self
            .drive(&mut input, &output, &errors, &emitter, &mut summary)
            .await;

        // 之後任何遲到的 emit 都會被丟棄
        emitter.close();
        summary.records_out += emitter.emitted();
        summary.duration = started.elapsed();
        result?;

        tracing::debug!(
            "⏹️ Async stage '{}' finished (in: {}, out: {}, errors: {}, duration: {:?})",
            summary.stage,
            summary.records_in,
            summary.records_out,
            summary.errors,
            summary.duration
        );
        Ok(summary)
    }

    async fn drive(
        &mut self,
        input: &mut mpsc::Receiver<T>,
        output: &mpsc::Sender<T>,
        errors: &ErrorChannel,
        emitter: &AsyncEmitter<T>,
        summary: &mut StageSummary,
    ) -> Result<()> {
        while let Some(record) = input.recv().await {
            summary.records_in += 1;

            // pass-through 不經過 validator，原樣送出
            let (records, failure) = match self.transform.as_mut() {
                None => (vec![record], None),
                Some(transform) => {
                    let settled = transform.invoke(record, emitter.clone()).await;
                    self.resolve(Phase::Transform, settled)
                }
            };
            if !forward(output, records, summary).await {
                summary.closed_early = true;
                tracing::debug!("Async stage '{}': downstream closed", self.name);
                return Ok(());
            }
            if let Some(error) = failure {
                report(errors, summary, error)?;
            }
        }

        if let Some(flush) = self.flush.as_mut() {
            let settled = flush.invoke(emitter.clone()).await;
            summary.flushed = true;

            let (records, failure) = self.resolve(Phase::Flush, settled);
            if !forward(output, records, summary).await {
                summary.closed_early = true;
            }
            if let Some(error) = failure {
                report(errors, summary, error)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Stage<T> for AsyncStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        self: Box<Self>,
        input: mpsc::Receiver<T>,
        output: mpsc::Sender<T>,
        errors: ErrorChannel,
    ) -> Result<StageSummary> {
        AsyncStage::run(*self, input, output, errors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::{feed, spawn};
    use crate::domain::model::Record;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_passthrough() {
        let (records, errors, _) = spawn(AsyncStage::passthrough(), feed(vec![1, 2, 3], 4), 4)
            .collect()
            .await
            .unwrap();
        assert_eq!(records, vec![1, 2, 3]);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_skips_validator() {
        let stage = AsyncStage::new(AsyncStageConfig::<Record>::new().with_validation()).unwrap();
        let outside = Record::from_contents("x").with_base("/a/").with_path("/b/x");

        let (records, errors, summary) = spawn(stage, feed(vec![outside.clone()], 2), 2)
            .collect()
            .await
            .unwrap();
        assert_eq!(records, vec![outside]);
        assert!(errors.is_empty());
        assert_eq!(summary.records_out, 1);
    }

    #[tokio::test]
    async fn test_callback_failure_reports_and_continues() {
        let stage = AsyncStage::new(AsyncStageConfig::new().with_transform(
            AsyncTransform::callback(|n: u32, _emitter, done: Done<u32>| {
                if n % 2 == 0 {
                    done.fail(format!("even {}", n));
                } else {
                    done.next(n);
                }
            }),
        ))
        .unwrap();

        let (records, errors, summary) = spawn(stage, feed(vec![1, 2, 3, 4], 2), 2)
            .collect()
            .await
            .unwrap();
        assert_eq!(records, vec![1, 3]);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message(), "even 2");
        assert_eq!(errors[1].phase(), Phase::Transform);
        assert_eq!(summary.records_in, 4);
    }

    #[tokio::test]
    async fn test_dropped_done_is_reported() {
        let stage = AsyncStage::new(
            AsyncStageConfig::new()
                .with_transform(AsyncTransform::callback(|_: u32, _emitter, _done| {})),
        )
        .unwrap();

        let (records, errors, _) = spawn(stage, feed(vec![1], 2), 2).collect().await.unwrap();
        assert!(records.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_callback_completed_from_spawned_task() {
        let stage = AsyncStage::new(AsyncStageConfig::new().with_transform(
            AsyncTransform::callback(|n: u32, _emitter, done: Done<u32>| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.next(n + 1);
                });
            }),
        ))
        .unwrap();

        let (records, _, _) = spawn(stage, feed(vec![1, 2, 3], 2), 2).collect().await.unwrap();
        assert_eq!(records, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_rejected_future_emits_nothing() {
        let stage = AsyncStage::new(AsyncStageConfig::new().with_transform(
            AsyncTransform::future(|n: u32, _emitter| async move {
                if n == 2 {
                    Err(BoxError::from("rejected"))
                } else {
                    Ok(Output::One(n))
                }
            }),
        ))
        .unwrap();

        let (records, errors, _) = spawn(stage, feed(vec![1, 2, 3], 2), 2).collect().await.unwrap();
        assert_eq!(records, vec![1, 3]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message(), "rejected");
    }

    #[tokio::test]
    async fn test_panicking_future_is_contained() {
        let stage = AsyncStage::new(AsyncStageConfig::new().with_transform(
            AsyncTransform::future(|n: u32, _emitter| async move {
                if n == 1 {
                    panic!("async boom");
                }
                Ok::<_, BoxError>(Output::One(n))
            }),
        ))
        .unwrap();

        let (records, errors, _) = spawn(stage, feed(vec![1, 2], 2), 2).collect().await.unwrap();
        assert_eq!(records, vec![2]);
        assert_eq!(errors[0].message(), "panicked: async boom");
    }

    #[tokio::test]
    async fn test_invalid_batch_is_dropped_entirely() {
        let stage = AsyncStage::new(
            AsyncStageConfig::new()
                .with_transform(AsyncTransform::future(|record: Record, _emitter| async move {
                    let outside = Record::from_contents("bad")
                        .with_base("/test/")
                        .with_path("/elsewhere/x");
                    Ok::<_, BoxError>(Output::Many(vec![record, outside]))
                }))
                .with_validation(),
        )
        .unwrap();

        let (records, errors, _) = spawn(stage, feed(vec![Record::from_contents("ok")], 2), 2)
            .collect()
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].phase(), Phase::Validation);
        assert!(errors[0].message().contains("#1"));
    }

    #[tokio::test]
    async fn test_one_transform_in_flight() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let stage = AsyncStage::new(AsyncStageConfig::new().with_transform(
            AsyncTransform::future(move |n: u32, _emitter| {
                let in_flight = Arc::clone(&in_flight_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(Output::One(n))
                }
            }),
        ))
        .unwrap();

        let (records, _, _) = spawn(stage, feed((0..8).collect(), 8), 8)
            .collect()
            .await
            .unwrap();
        assert_eq!(records, (0..8).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_emission_is_discarded() {
        let (late_tx, late_rx) = tokio::sync::oneshot::channel();
        let mut late_tx = Some(late_tx);
        let stage = AsyncStage::new(AsyncStageConfig::new().with_transform(
            AsyncTransform::callback(move |n: u32, emitter: AsyncEmitter<u32>, done: Done<u32>| {
                done.next(n);
                if let Some(tx) = late_tx.take() {
                    let _ = tx.send(emitter);
                }
            }),
        ))
        .unwrap();

        let (records, _, summary) = spawn(stage, feed(vec![1], 2), 2).collect().await.unwrap();
        assert_eq!(records, vec![1]);
        assert_eq!(summary.records_out, 1);

        let emitter = late_rx.await.unwrap();
        assert!(!emitter.is_open());
        assert!(!emitter.emit(42).await);
    }
}
