//! BLE Client - 中心设备连接传输服务
//!
//! 流程:
//! 1. 扫描并找到目标地址的外围设备
//! 2. 连接并等待链路稳定
//! 3. 发现传输服务，订阅响应大小、响应分片和流控标记的通知
//! 4. 以 [`GattTransport`] 的形式交给会话驱动

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::{StreamExt, future};
use log::{debug, info, warn};
use tokio::time;
use uuid::Uuid;

use crate::ble::TRANSFER_SERVICE_UUID;
use crate::config::TransferConfig;
use crate::transfer::OnceNotifier;
use crate::transport::{
    Attribute, GattTransport, Notification, NotificationStream, TransportError,
};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 连接建立后上报的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address: String,
    pub mtu: usize,
}

/// 连接建立通知，重复上报时只触发一次
pub type ConnectionNotifier = OnceNotifier<ConnectionInfo>;

pub struct BleConnector {
    config: TransferConfig,
    on_connected: Option<ConnectionNotifier>,
}

impl BleConnector {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            on_connected: None,
        }
    }

    /// 连接建立回调，最多触发一次
    pub fn on_connected(mut self, callback: impl FnOnce(ConnectionInfo) + Send + 'static) -> Self {
        self.on_connected = Some(ConnectionNotifier::new(callback));
        self
    }

    /// 连接到设备并准备好传输特征
    pub async fn connect(&self, address: &str) -> Result<BleTransport, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        let peripheral = self.find_device(&adapter, address).await?;

        info!("Connecting to {}", address);
        peripheral.connect().await?;

        // 等待连接稳定
        time::sleep(self.config.connect_settle()).await;

        // btleplug 不支持主动请求 MTU，使用配置值
        info!("Discovering services...");
        peripheral.discover_services().await?;

        let mut characteristics = HashMap::new();
        for attribute in Attribute::ALL {
            let characteristic = find_characteristic(&peripheral, attribute.uuid())?;
            if attribute.is_notifying() {
                debug!("Subscribing to {:?}", attribute);
                peripheral.subscribe(&characteristic).await?;
            }
            characteristics.insert(attribute, characteristic);
        }

        let info = ConnectionInfo {
            address: address.to_string(),
            mtu: self.config.mtu,
        };
        info!("Connected to {} (MTU {})", info.address, info.mtu);
        if let Some(notifier) = &self.on_connected {
            let _ = notifier.notify(info);
        }

        Ok(BleTransport {
            peripheral,
            characteristics,
            mtu: self.config.mtu,
        })
    }

    async fn find_device(
        &self,
        adapter: &Adapter,
        address: &str,
    ) -> Result<PlatformPeripheral, TransportError> {
        adapter.start_scan(ScanFilter::default()).await?;
        info!(
            "Scanning for {} ({} seconds)",
            address,
            self.config.scan_timeout().as_secs()
        );

        let deadline = time::Instant::now() + self.config.scan_timeout();
        let found = loop {
            if let Some(peripheral) = lookup_peripheral(adapter, address).await? {
                break Some(peripheral);
            }
            if time::Instant::now() >= deadline {
                break None;
            }
            time::sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        found.ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))
    }
}

async fn lookup_peripheral(
    adapter: &Adapter,
    address: &str,
) -> Result<Option<PlatformPeripheral>, TransportError> {
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            if props.address.to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .services()
        .into_iter()
        .filter(|service| service.uuid == TRANSFER_SERVICE_UUID)
        .flat_map(|service| service.characteristics)
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(TransportError::CharacteristicNotFound(uuid))
}

/// 已连接的传输服务
pub struct BleTransport {
    peripheral: PlatformPeripheral,
    characteristics: HashMap<Attribute, Characteristic>,
    mtu: usize,
}

impl BleTransport {
    fn characteristic(&self, attribute: Attribute) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&attribute)
            .ok_or(TransportError::CharacteristicNotFound(attribute.uuid()))
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        if self.peripheral.is_connected().await? {
            info!("Disconnecting");
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GattTransport for BleTransport {
    async fn write(&self, attribute: Attribute, value: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(attribute)?;
        self.peripheral
            .write(characteristic, value, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn read(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(attribute)?;
        self.peripheral
            .read(characteristic)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        if !self.peripheral.is_connected().await? {
            return Err(TransportError::NotConnected);
        }
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.filter_map(|notification| {
            future::ready(
                Attribute::from_uuid(notification.uuid)
                    .map(|attribute| Notification::new(attribute, notification.value)),
            )
        })))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
