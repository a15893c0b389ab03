//! Gattlink Core Library
//!
//! 基于 BLE GATT 特征的分片请求/响应传输协议
//!
//! # 模块
//!
//! - **transfer**: 分片、重组、流控标记和传输状态机
//! - **transport**: 状态机依赖的链路抽象
//! - **ble**: 基于 btleplug 的中心设备实现
//! - **config**: 传输设置
//! - **logging**: 日志级别与过滤规则
//!
//! # 使用示例
//!
//! ```ignore
//! use gattlink_core::{BleConnector, TransferClient, TransferConfig};
//! use std::sync::Arc;
//!
//! let config = TransferConfig::load();
//! let transport = BleConnector::new(config.clone()).connect("AA:BB:CC:DD:EE:FF").await?;
//! let client = TransferClient::new(Arc::new(transport), config);
//!
//! let response = client.transfer(b"request".to_vec()).await?;
//! println!("{} bytes in {:?}", response.data.len(), response.duration);
//! ```

pub mod ble;
pub mod config;
pub mod logging;
pub mod transfer;
pub mod transport;

// BLE re-exports
pub use ble::{BleConnector, BleTransport, ConnectionInfo, TRANSFER_SERVICE_UUID};

pub use config::{RemoteMarkerPolicy, TransferConfig};
pub use logging::LogLevel;

// Transfer re-exports
pub use transfer::{
    SemaphoreMarker, SessionHandle, SizeEncoding, TransferClient, TransferError,
    TransferListener, TransferResponse, TransferState,
};

pub use transport::{Attribute, GattTransport, Notification, NotificationStream, TransportError};
