//! 会话事件与命令
//!
//! 传输回调、调用方操作和状态机的自投递消息统一为 [`TransferEvent`]，
//! 经同一个队列按 FIFO 顺序交给状态机。状态机的输出为 [`Command`]，
//! 由会话驱动执行。

use std::time::Duration;

use crate::transfer::error::TransferError;
use crate::transfer::semaphore::SemaphoreMarker;
use crate::transport::{Attribute, Notification};

/// 一次异步发生的事件，只会被消费一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// 调用方提交请求数据
    Begin(Vec<u8>),
    /// 调用方取消会话
    Cancel,
    /// 属性写入结果
    WriteCompleted {
        attribute: Attribute,
        result: Result<(), String>,
    },
    /// 属性读取结果
    ReadCompleted {
        attribute: Attribute,
        result: Result<Vec<u8>, String>,
    },
    /// 对端更新了属性
    Notified(Notification),
    /// 通知流已结束，链路不可用
    LinkLost,
    /// 状态机投递给自己的消息
    Internal(InternalMessage),
}

impl TransferEvent {
    pub fn written(attribute: Attribute) -> Self {
        TransferEvent::WriteCompleted {
            attribute,
            result: Ok(()),
        }
    }

    pub fn write_failed(attribute: Attribute, reason: impl Into<String>) -> Self {
        TransferEvent::WriteCompleted {
            attribute,
            result: Err(reason.into()),
        }
    }

    pub fn notified(attribute: Attribute, value: impl Into<Vec<u8>>) -> Self {
        TransferEvent::Notified(Notification::new(attribute, value))
    }

    pub fn remote_marker(marker: SemaphoreMarker) -> Self {
        Self::notified(Attribute::FlowControlMarker, marker.encode())
    }

    /// 日志用的简短描述，不包含载荷
    pub fn kind(&self) -> &'static str {
        match self {
            TransferEvent::Begin(_) => "begin",
            TransferEvent::Cancel => "cancel",
            TransferEvent::WriteCompleted { .. } => "write completed",
            TransferEvent::ReadCompleted { .. } => "read completed",
            TransferEvent::Notified(_) => "notification",
            TransferEvent::LinkLost => "link lost",
            TransferEvent::Internal(_) => "internal message",
        }
    }
}

/// 状态机内部消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalMessage {
    /// 写入请求大小
    SendRequestSize(usize),
    /// 开始发送请求分片
    StartChunkSend,
    /// 把本端流控标记写给对端
    UpdateChunkWroteStatus(SemaphoreMarker),
    /// 对端已处理完上一个分片，发送下一个
    SendNextChunk,
    /// 请求分片全部发出
    RequestTransferComplete,
    /// 确认一个已接收的响应分片
    AcknowledgeChunk,
    ResponseTransferComplete,
    ResponseTransferFailed(TransferError),
}

impl From<InternalMessage> for TransferEvent {
    fn from(message: InternalMessage) -> Self {
        TransferEvent::Internal(message)
    }
}

/// 成功完成的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub data: Vec<u8>,
    /// 从收到响应大小到重组完成的耗时
    pub duration: Duration,
}

/// 状态机要求会话驱动执行的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Write { attribute: Attribute, value: Vec<u8> },
    Read(Attribute),
    /// 追加到事件队列末尾
    Post(TransferEvent),
    /// 延迟后追加到事件队列末尾 (非阻塞)
    PostDelayed(TransferEvent, Duration),
    Complete(TransferResponse),
    Fail(TransferError),
}

impl Command {
    pub fn write(attribute: Attribute, value: impl Into<Vec<u8>>) -> Self {
        Command::Write {
            attribute,
            value: value.into(),
        }
    }

    pub fn write_marker(marker: SemaphoreMarker) -> Self {
        Self::write(Attribute::FlowControlMarker, marker.encode())
    }

    pub fn post(message: InternalMessage) -> Self {
        Command::Post(message.into())
    }
}
