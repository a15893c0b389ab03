//! 会话驱动
//!
//! 把 [`TransferHandler`] 接到一个 [`GattTransport`] 上：
//!
//! - 所有事件 (链路回调、通知、自投递消息、取消) 进入同一个无界队列，
//!   由会话任务逐个交给状态机
//! - 写入和读取由单独的任务按 FIFO 顺序执行，结果再投递回队列
//! - 延迟投递通过独立的定时任务完成，不会阻塞会话队列
//!
//! 每个连接同时只允许一个会话。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::transfer::error::TransferError;
use crate::transfer::handler::{HandlerSettings, TransferHandler, TransferState};
use crate::transfer::message::{Command, TransferEvent, TransferResponse};
use crate::transfer::notify::{OnceNotifier, TransferListener};
use crate::transport::{Attribute, GattTransport, NotificationStream};

pub type TransferResult = Result<TransferResponse, TransferError>;

/// 请求/响应传输客户端
pub struct TransferClient<T: GattTransport> {
    transport: Arc<T>,
    config: TransferConfig,
    active: Arc<AtomicBool>,
}

impl<T: GattTransport> TransferClient<T> {
    pub fn new(transport: Arc<T>, config: TransferConfig) -> Self {
        Self {
            transport,
            config,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 当前是否有会话在进行
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 发送请求并等待响应
    pub async fn transfer(&self, payload: Vec<u8>) -> TransferResult {
        self.begin_transfer(payload).await?.wait().await
    }

    pub async fn begin_transfer(&self, payload: Vec<u8>) -> Result<SessionHandle, TransferError> {
        self.start_session(payload, None).await
    }

    /// 开始会话，结果同时通过回调上报
    pub async fn begin_transfer_with_listener(
        &self,
        payload: Vec<u8>,
        listener: Arc<dyn TransferListener>,
    ) -> Result<SessionHandle, TransferError> {
        self.start_session(payload, Some(listener)).await
    }

    async fn start_session(
        &self,
        payload: Vec<u8>,
        listener: Option<Arc<dyn TransferListener>>,
    ) -> Result<SessionHandle, TransferError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Rejecting transfer: a session is already active");
            return Err(TransferError::SessionActive);
        }
        let guard = ActiveGuard(self.active.clone());

        let notifications = self
            .transport
            .notifications()
            .await
            .map_err(|e| TransferError::TransportUnavailable(e.to_string()))?;

        let settings = HandlerSettings::from_config(&self.config, self.transport.mtu());
        debug!(
            "Starting session with MTU {} (chunk size {})",
            self.transport.mtu(),
            settings.chunk_size
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransferState::Uninitialized);
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let _ = events_tx.send(TransferEvent::Begin(payload));

        let result_listener = listener.clone();
        let on_finished = OnceNotifier::new(move |outcome: TransferResult| {
            if let Some(listener) = &result_listener {
                match &outcome {
                    Ok(response) => listener.on_complete(&response.data, response.duration),
                    Err(e) => listener.on_failed(&e.to_string()),
                }
            }
            let _ = result_tx.send(outcome);
        });

        let session = Session {
            handler: TransferHandler::new(settings),
            transport: self.transport.clone(),
            events_tx,
            events_rx,
            state_tx,
            listener,
            cancel: cancel.clone(),
            _active: guard,
        };
        tokio::spawn(session.run(notifications, on_finished));

        Ok(SessionHandle {
            state: state_rx,
            cancel,
            result: result_rx,
        })
    }
}

/// 会话结束时释放连接上的会话占用
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 调用方持有的会话句柄
pub struct SessionHandle {
    state: watch::Receiver<TransferState>,
    cancel: CancellationToken,
    result: oneshot::Receiver<TransferResult>,
}

impl SessionHandle {
    pub fn current_state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn state_changes(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    /// 请求取消，会话进入 `Cancelled` 状态
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 等待会话结束
    pub async fn wait(self) -> TransferResult {
        self.result.await.unwrap_or(Err(TransferError::SessionClosed))
    }
}

enum Operation {
    Write(Attribute, Vec<u8>),
    Read(Attribute),
}

struct Session<T: GattTransport> {
    handler: TransferHandler,
    transport: Arc<T>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events_rx: mpsc::UnboundedReceiver<TransferEvent>,
    state_tx: watch::Sender<TransferState>,
    listener: Option<Arc<dyn TransferListener>>,
    cancel: CancellationToken,
    _active: ActiveGuard,
}

impl<T: GattTransport> Session<T> {
    async fn run(
        mut self,
        notifications: NotificationStream,
        on_finished: OnceNotifier<TransferResult>,
    ) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_operations(
            self.transport.clone(),
            ops_rx,
            self.events_tx.clone(),
        ));
        let pump = tokio::spawn(pump_notifications(notifications, self.events_tx.clone()));

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => TransferEvent::Cancel,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break Err(TransferError::SessionClosed),
                },
            };
            if let Some(outcome) = self.dispatch(event, &ops_tx) {
                break outcome;
            }
        };

        if outcome.is_ok() {
            // 让最后一个分片确认写出
            drop(ops_tx);
            let _ = writer.await;
        } else {
            writer.abort();
        }
        pump.abort();

        // 释放会话占用后再上报结果
        drop(self);

        match &outcome {
            Ok(response) => info!("Transfer finished: {} response bytes", response.data.len()),
            Err(e) => warn!("Transfer failed: {}", e),
        }
        let _ = on_finished.notify(outcome);
    }

    fn dispatch(
        &mut self,
        event: TransferEvent,
        ops: &mpsc::UnboundedSender<Operation>,
    ) -> Option<TransferResult> {
        let before = self.handler.state();
        let commands = self.handler.handle(event);
        let after = self.handler.state();

        if before != after {
            debug!("Transfer state {} -> {}", before, after);
            self.state_tx.send_replace(after);
            if let Some(listener) = &self.listener {
                listener.on_state(after);
            }
        }

        let mut outcome = None;
        for command in commands {
            match command {
                Command::Write { attribute, value } => {
                    let _ = ops.send(Operation::Write(attribute, value));
                }
                Command::Read(attribute) => {
                    let _ = ops.send(Operation::Read(attribute));
                }
                Command::Post(event) => {
                    let _ = self.events_tx.send(event);
                }
                Command::PostDelayed(event, delay) => {
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(event);
                    });
                }
                Command::Complete(response) => outcome = Some(Ok(response)),
                Command::Fail(error) => outcome = Some(Err(error)),
            }
        }
        outcome
    }
}

/// 按提交顺序执行链路操作
async fn run_operations<T: GattTransport>(
    transport: Arc<T>,
    mut ops: mpsc::UnboundedReceiver<Operation>,
    events: mpsc::UnboundedSender<TransferEvent>,
) {
    while let Some(op) = ops.recv().await {
        let event = match op {
            Operation::Write(attribute, value) => {
                trace!("Writing {} bytes to {:?}", value.len(), attribute);
                let result = transport
                    .write(attribute, &value)
                    .await
                    .map_err(|e| e.to_string());
                TransferEvent::WriteCompleted { attribute, result }
            }
            Operation::Read(attribute) => {
                trace!("Reading {:?}", attribute);
                let result = transport.read(attribute).await.map_err(|e| e.to_string());
                TransferEvent::ReadCompleted { attribute, result }
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

async fn pump_notifications(
    mut notifications: NotificationStream,
    events: mpsc::UnboundedSender<TransferEvent>,
) {
    while let Some(notification) = notifications.next().await {
        if events.send(TransferEvent::Notified(notification)).is_err() {
            return;
        }
    }
    debug!("Notification stream ended");
    let _ = events.send(TransferEvent::LinkLost);
}
