//! 结果回调

use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error};
use tokio::sync::mpsc;

use crate::transfer::handler::TransferState;

/// 传输结果回调
///
/// 每个会话恰好调用一次 `on_complete` 或 `on_failed`。
pub trait TransferListener: Send + Sync {
    /// 状态变化
    fn on_state(&self, _state: TransferState) {}
    /// 响应重组完成
    fn on_complete(&self, data: &[u8], duration: Duration);
    /// 会话失败，参数为错误描述
    fn on_failed(&self, error: &str);
}

/// 通过 channel 转发回调的简单实现
///
/// 使用无界 channel，接收端处理较慢时也不会丢失最终结果。
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    State(TransferState),
    Complete { data: Vec<u8>, duration: Duration },
    Failed(String),
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ListenerEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("Listener receiver dropped, discarding {:?}", e.0);
        }
    }
}

impl TransferListener for ChannelListener {
    fn on_state(&self, state: TransferState) {
        self.forward(ListenerEvent::State(state));
    }

    fn on_complete(&self, data: &[u8], duration: Duration) {
        self.forward(ListenerEvent::Complete {
            data: data.to_vec(),
            duration,
        });
    }

    fn on_failed(&self, error: &str) {
        self.forward(ListenerEvent::Failed(error.to_string()));
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NotifierError {
    #[error("Notifier has already been called")]
    AlreadyNotified,
}

type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// 只触发一次的通知器
///
/// 链路栈可能重复上报同一事件 (例如连接建立)，这里保证回调最多执行一次，
/// 重复调用返回错误并记录日志。
pub struct OnceNotifier<T> {
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> OnceNotifier<T> {
    pub fn new(callback: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    pub fn notify(&self, value: T) -> Result<(), NotifierError> {
        let callback = match self.callback.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match callback {
            Some(callback) => {
                callback(value);
                Ok(())
            }
            None => {
                error!("Notifier called more than once, ignoring");
                Err(NotifierError::AlreadyNotified)
            }
        }
    }

    pub fn is_notified(&self) -> bool {
        match self.callback.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_once_notifier_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let notifier = OnceNotifier::new(move |n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        });

        assert!(!notifier.is_notified());
        assert_eq!(notifier.notify(5), Ok(()));
        assert!(notifier.is_notified());
        assert_eq!(notifier.notify(7), Err(NotifierError::AlreadyNotified));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let (listener, mut rx) = ChannelListener::new();
        listener.on_state(TransferState::RequestWritePending);
        listener.on_complete(b"ok", Duration::from_millis(3));
        listener.on_failed("boom");

        assert_eq!(
            rx.recv().await,
            Some(ListenerEvent::State(TransferState::RequestWritePending))
        );
        assert_eq!(
            rx.recv().await,
            Some(ListenerEvent::Complete {
                data: b"ok".to_vec(),
                duration: Duration::from_millis(3)
            })
        );
        assert_eq!(rx.recv().await, Some(ListenerEvent::Failed("boom".to_string())));
    }

    #[tokio::test]
    async fn test_channel_listener_keeps_result_behind_slow_receiver() {
        let (listener, mut rx) = ChannelListener::new();
        for _ in 0..100 {
            listener.on_state(TransferState::ResponseReadPending);
        }
        listener.on_complete(b"done", Duration::from_millis(1));
        drop(listener);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(ListenerEvent::Complete {
                data: b"done".to_vec(),
                duration: Duration::from_millis(1)
            })
        );
    }
}
