//! BLE 链路
//!
//! 传输服务及其特征的 UUID 定义，以及基于 btleplug 的中心设备实现。

pub mod client;

pub use client::{BleConnector, BleTransport, ConnectionInfo, ConnectionNotifier};

use uuid::Uuid;

pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ab29_5026_444a_9e0e_d6f2450f3a77);

/// 请求大小 (中心设备写入)
pub const REQUEST_SIZE_CHAR_UUID: Uuid = Uuid::from_u128(0x00002032_5026_444a_9e0e_d6f2450f3a77);
/// 请求分片 (中心设备写入)
pub const REQUEST_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x00002033_5026_444a_9e0e_d6f2450f3a77);
/// 响应大小 (外围设备通知)
pub const RESPONSE_SIZE_CHAR_UUID: Uuid = Uuid::from_u128(0x00002034_5026_444a_9e0e_d6f2450f3a77);
/// 响应分片 (外围设备通知)
pub const RESPONSE_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x00002035_5026_444a_9e0e_d6f2450f3a77);
/// 流控标记 (双方读写)
pub const FLOW_CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x00002036_5026_444a_9e0e_d6f2450f3a77);
