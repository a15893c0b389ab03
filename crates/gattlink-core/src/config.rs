//! 传输配置和持久化
//!
//! 提供 MTU、大小声明编码、流控重试间隔等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogLevel;
use crate::transfer::wire::SizeEncoding;

/// 中心设备请求的最大 MTU
pub const DEFAULT_MTU: usize = 517;

/// 对端 `ResendRequested` / `Error` 标记的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMarkerPolicy {
    /// 只记录日志，与现有对端行为一致
    #[default]
    LogOnly,
    /// 收到 `ResendRequested` 时重发当前分片，收到 `Error` 时终止会话
    Strict,
}

/// 传输设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// 目标设备地址 (命令行未指定时使用)
    pub device_address: Option<String>,
    /// 链路 MTU，分片大小为 MTU 减去 ATT 头
    pub mtu: usize,
    /// 请求/响应大小声明的线上宽度
    pub size_encoding: SizeEncoding,
    /// 接受的最大响应长度
    pub max_response_size: usize,
    /// 流控通道被占用时，分片确认的重试间隔 (毫秒)
    pub ack_retry_delay_ms: u64,
    pub remote_marker_policy: RemoteMarkerPolicy,
    /// 扫描目标设备的超时 (秒)
    pub scan_timeout_secs: u64,
    /// 连接建立后等待链路稳定的时间 (毫秒)
    pub connect_settle_ms: u64,
    pub log_level: LogLevel,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            mtu: DEFAULT_MTU,
            size_encoding: SizeEncoding::SingleByte,
            max_response_size: 64 * 1024,
            ack_retry_delay_ms: 2,
            remote_marker_policy: RemoteMarkerPolicy::LogOnly,
            scan_timeout_secs: 10,
            connect_settle_ms: 500,
            log_level: LogLevel::Info,
        }
    }
}

impl TransferConfig {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gattlink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match Self::from_toml(&content) {
                    Ok(config) => {
                        debug!("Loaded settings from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, self.to_toml()?)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn ack_retry_delay(&self) -> Duration {
        Duration::from_millis(self.ack_retry_delay_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let config = TransferConfig::default();
        assert_eq!(config.mtu, 517);
        assert_eq!(config.size_encoding, SizeEncoding::SingleByte);
        assert_eq!(config.remote_marker_policy, RemoteMarkerPolicy::LogOnly);
        assert_eq!(config.ack_retry_delay(), Duration::from_millis(2));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = TransferConfig::from_toml(
            r#"
            mtu = 185
            remote_marker_policy = "strict"
            "#,
        )
        .unwrap();

        assert_eq!(config.mtu, 185);
        assert_eq!(config.remote_marker_policy, RemoteMarkerPolicy::Strict);
        assert_eq!(config.max_response_size, 64 * 1024);
        assert!(config.device_address.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TransferConfig {
            device_address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            size_encoding: SizeEncoding::U32BigEndian,
            log_level: LogLevel::Debug,
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        assert!(text.contains("size_encoding = \"u32_big_endian\""));
        assert_eq!(TransferConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(TransferConfig::from_toml("mtu = \"big\"").is_err());
    }
}
