use crate::domain::model::Output;
use crate::utils::error::{BoxError, TransformResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// 同步 transform 的 emission context
///
/// `emit` 的 record 先暫存，函式返回後、回傳值之前依序送往下游。
/// 同步函式執行期間不會讓出執行權，下游看到的順序與立即送出相同。
#[derive(Debug)]
pub struct Emitter<T> {
    emitted: Vec<T>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            emitted: Vec::new(),
        }
    }

    pub fn emit(&mut self, record: T) {
        self.emitted.push(record);
    }

    pub fn len(&self) -> usize {
        self.emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty()
    }

    pub(crate) fn into_records(self) -> Vec<T> {
        self.emitted
    }
}

/// 非同步 transform 的 emission context，直接寫入下游 channel
///
/// 只持有 weak sender：stage 結束後的 emit 一律被丟棄。
#[derive(Debug)]
pub struct AsyncEmitter<T> {
    sender: mpsc::WeakSender<T>,
    open: Arc<AtomicBool>,
    emitted: Arc<AtomicUsize>,
}

impl<T> Clone for AsyncEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            open: Arc::clone(&self.open),
            emitted: Arc::clone(&self.emitted),
        }
    }
}

impl<T> AsyncEmitter<T> {
    pub(crate) fn new(output: &mpsc::Sender<T>) -> Self {
        Self {
            sender: output.downgrade(),
            open: Arc::new(AtomicBool::new(true)),
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 送出一筆 record，等待下游有空間；stage 已結束或下游已關閉時回傳 `false`
    pub async fn emit(&self, record: T) -> bool {
        if !self.is_open() {
            tracing::debug!("Discarding record emitted after stage teardown");
            return false;
        }

        let Some(sender) = self.sender.upgrade() else {
            tracing::debug!("Discarding record emitted after downstream closed");
            return false;
        };

        if sender.send(record).await.is_err() {
            return false;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn emitted(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Callback 風格的完成信號，只能被使用一次
///
/// 沒有呼叫任何方法就被 drop 時，該筆 record 視為失敗。
#[derive(Debug)]
pub struct Done<T> {
    sender: oneshot::Sender<TransformResult<Option<T>>>,
}

impl<T> Done<T> {
    pub(crate) fn channel() -> (Self, Settled<T>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, Settled { receiver })
    }

    pub fn send(self, result: TransformResult<Option<T>>) {
        // 接收端已不存在代表 stage 已結束，結果直接丟棄
        if self.sender.send(result).is_err() {
            tracing::debug!("Completion signaled after stage teardown");
        }
    }

    /// 成功並輸出一筆 record
    pub fn next(self, record: T) {
        self.send(Ok(Some(record)));
    }

    /// 成功但不輸出
    pub fn skip(self) {
        self.send(Ok(None));
    }

    pub fn fail(self, error: impl Into<BoxError>) {
        self.send(Err(error.into()));
    }
}

pub(crate) struct Settled<T> {
    receiver: oneshot::Receiver<TransformResult<Option<T>>>,
}

impl<T> Settled<T> {
    pub(crate) async fn wait(self) -> TransformResult<Output<T>> {
        match self.receiver.await {
            Ok(result) => result.map(Output::from),
            Err(_) => Err("completion callback was dropped without being signaled".into()),
        }
    }
}
