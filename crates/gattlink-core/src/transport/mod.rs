//! 链路传输能力
//!
//! 传输状态机只通过 [`GattTransport`] 访问底层链路：按属性写入、读取，
//! 以及接收对端更新属性时的通知。连接、发现和 MTU 协商由实现方负责。

use std::pin::Pin;

use futures_util::Stream;
use uuid::Uuid;

use crate::ble::{
    FLOW_CONTROL_CHAR_UUID, REQUEST_DATA_CHAR_UUID, REQUEST_SIZE_CHAR_UUID,
    RESPONSE_DATA_CHAR_UUID, RESPONSE_SIZE_CHAR_UUID,
};

/// 协议使用的具名属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    RequestSize,
    RequestData,
    ResponseSize,
    ResponseData,
    FlowControlMarker,
}

impl Attribute {
    pub const ALL: [Attribute; 5] = [
        Attribute::RequestSize,
        Attribute::RequestData,
        Attribute::ResponseSize,
        Attribute::ResponseData,
        Attribute::FlowControlMarker,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Attribute::RequestSize => REQUEST_SIZE_CHAR_UUID,
            Attribute::RequestData => REQUEST_DATA_CHAR_UUID,
            Attribute::ResponseSize => RESPONSE_SIZE_CHAR_UUID,
            Attribute::ResponseData => RESPONSE_DATA_CHAR_UUID,
            Attribute::FlowControlMarker => FLOW_CONTROL_CHAR_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|attribute| attribute.uuid() == uuid)
    }

    /// 对端会更新并通知的属性
    pub fn is_notifying(self) -> bool {
        matches!(
            self,
            Attribute::ResponseSize | Attribute::ResponseData | Attribute::FlowControlMarker
        )
    }
}

/// 对端更新属性的通知
///
/// `value` 为空表示 "值已变化，需要主动读取"。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub attribute: Attribute,
    pub value: Vec<u8>,
}

impl Notification {
    pub fn new(attribute: Attribute, value: impl Into<Vec<u8>>) -> Self {
        Self {
            attribute,
            value: value.into(),
        }
    }
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("BLE error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

/// 传输状态机依赖的链路能力
///
/// 所有操作都是异步的；会话驱动按 FIFO 顺序逐个执行写入，
/// 并把结果作为事件投递回会话队列。
#[async_trait::async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// 写入属性 (带响应)
    async fn write(&self, attribute: Attribute, value: &[u8]) -> Result<(), TransportError>;

    /// 读取属性当前值
    async fn read(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError>;

    /// 订阅对端的属性通知
    async fn notifications(&self) -> Result<NotificationStream, TransportError>;

    /// 协商后的 MTU
    fn mtu(&self) -> usize;
}
