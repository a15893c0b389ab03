//! 流控信号 (Semaphore)
//!
//! 两端通过同一个单字节特征交换流控标记，以在没有链路层确认的情况下
//! 控制分片的发送节奏。线上编码即枚举序号。

use std::fmt;

use crate::transfer::error::TransferError;

/// 流控标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SemaphoreMarker {
    /// 无分片活动；阶段结束时也作为 "传输完成" 的复位信号
    #[default]
    Uninitialized = 0,
    /// 最近写入的分片尚未被接收方处理完
    ChunkProcessingPending = 1,
    /// 接收方已处理完最近的分片，发送方可以继续
    ChunkProcessingComplete = 2,
    /// 接收方要求重发当前分片
    ResendRequested = 3,
    /// 对端检测到不可恢复的错误
    Error = 4,
}

impl SemaphoreMarker {
    /// 编码为单字节特征值
    pub fn encode(self) -> [u8; 1] {
        [self as u8]
    }

    /// 从特征值解码，必须恰好一个字节
    pub fn decode(data: &[u8]) -> Result<Self, TransferError> {
        match data {
            [value] => Self::try_from(*value),
            _ => Err(TransferError::InvalidMarker(data.to_vec())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SemaphoreMarker::Uninitialized => "Uninitialized",
            SemaphoreMarker::ChunkProcessingPending => "ChunkProcessingPending",
            SemaphoreMarker::ChunkProcessingComplete => "ChunkProcessingComplete",
            SemaphoreMarker::ResendRequested => "ResendRequested",
            SemaphoreMarker::Error => "Error",
        }
    }
}

impl TryFrom<u8> for SemaphoreMarker {
    type Error = TransferError;

    fn try_from(value: u8) -> Result<Self, TransferError> {
        match value {
            0 => Ok(SemaphoreMarker::Uninitialized),
            1 => Ok(SemaphoreMarker::ChunkProcessingPending),
            2 => Ok(SemaphoreMarker::ChunkProcessingComplete),
            3 => Ok(SemaphoreMarker::ResendRequested),
            4 => Ok(SemaphoreMarker::Error),
            other => Err(TransferError::InvalidMarker(vec![other])),
        }
    }
}

impl From<SemaphoreMarker> for u8 {
    fn from(marker: SemaphoreMarker) -> Self {
        marker as u8
    }
}

impl fmt::Display for SemaphoreMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
