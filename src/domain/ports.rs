use crate::domain::model::StageSummary;
use crate::utils::error::{PluginError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 一個 pipeline stage：從上游 channel 讀取 record，輸出到下游 channel
#[async_trait]
pub trait Stage<T: Send + 'static>: Send {
    fn name(&self) -> &str;

    /// 執行直到上游結束 (或下游關閉)，回傳執行摘要
    async fn run(
        self: Box<Self>,
        input: mpsc::Receiver<T>,
        output: mpsc::Sender<T>,
        errors: ErrorChannel,
    ) -> Result<StageSummary>;
}

/// Stage 的錯誤側通道
///
/// 沒有訂閱者時 (`unhandled`)，第一個錯誤會中止 stage。
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    sender: Option<mpsc::UnboundedSender<PluginError>>,
}

impl ErrorChannel {
    pub fn listen() -> (Self, mpsc::UnboundedReceiver<PluginError>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn from_sender(sender: mpsc::UnboundedSender<PluginError>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn unhandled() -> Self {
        Self { sender: None }
    }

    pub fn is_handled(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// 送出錯誤；沒有人接收時把錯誤交還給呼叫端
    pub fn report(&self, error: PluginError) -> std::result::Result<(), PluginError> {
        match &self.sender {
            Some(sender) => sender.send(error).map_err(|e| e.0),
            None => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::Phase;

    #[test]
    fn test_error_channel_delivers_to_listener() {
        let (channel, mut receiver) = ErrorChannel::listen();
        assert!(channel.is_handled());
        assert!(channel
            .report(PluginError::new("s", Phase::Transform, "boom"))
            .is_ok());
        let received = receiver.try_recv().unwrap();
        assert_eq!(received.message(), "boom");
    }

    #[test]
    fn test_unhandled_channel_returns_error() {
        let channel = ErrorChannel::unhandled();
        assert!(!channel.is_handled());
        let err = channel
            .report(PluginError::new("s", Phase::Flush, "boom"))
            .unwrap_err();
        assert_eq!(err.phase(), Phase::Flush);
    }

    #[test]
    fn test_dropped_listener_returns_error() {
        let (channel, receiver) = ErrorChannel::listen();
        drop(receiver);
        assert!(!channel.is_handled());
        assert!(channel
            .report(PluginError::new("s", Phase::Transform, "boom"))
            .is_err());
    }
}
