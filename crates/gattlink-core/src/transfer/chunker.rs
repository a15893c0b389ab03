//! 请求分片器
//!
//! 按协商后的分片大小，从偏移 0 开始按顺序切出请求数据。
//! 分片器不缓存已发出的分片，重发时从原始缓冲区重新切片。

use std::ops::Range;

use crate::transfer::error::TransferError;

/// ATT 写/通知操作的协议头开销 (opcode + handle)
pub const ATT_OVERHEAD: usize = 3;

/// 根据 MTU 计算可用的分片大小
pub fn chunk_size_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_OVERHEAD).max(1)
}

#[derive(Debug)]
pub struct Chunker {
    data: Vec<u8>,
    chunk_size: usize,
    offset: usize,
    last: Option<Range<usize>>,
}

impl Chunker {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self {
            data,
            chunk_size,
            offset: 0,
            last: None,
        })
    }

    /// 返回下一个分片，全部发出后返回 `None`
    pub fn next(&mut self) -> Option<&[u8]> {
        if self.is_complete() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let range = self.offset..end;
        self.offset = end;
        self.last = Some(range.clone());
        Some(&self.data[range])
    }

    /// 最近一次发出的分片 (从原始缓冲区重新切片)
    pub fn previous(&self) -> Option<&[u8]> {
        self.last.clone().map(|range| &self.data[range])
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// 已发送字节数与总字节数
    pub fn progress(&self) -> (usize, usize) {
        (self.offset, self.data.len())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }
}
