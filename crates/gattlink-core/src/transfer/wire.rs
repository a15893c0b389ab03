//! 大小声明编码
//!
//! 现有对端按单字节读写请求/响应大小 (长度被截断为一个字节)。
//! 只有在确认对端也使用 4 字节字段时才应配置 `U32BigEndian`。

use log::warn;
use serde::{Deserialize, Serialize};

use crate::transfer::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeEncoding {
    /// 单字节，与现有对端兼容
    #[default]
    SingleByte,
    /// 4 字节大端有符号整数
    U32BigEndian,
}

impl SizeEncoding {
    /// 编码请求大小
    pub fn encode(self, len: usize) -> Vec<u8> {
        match self {
            SizeEncoding::SingleByte => {
                if len > usize::from(u8::MAX) {
                    warn!(
                        "Request size {} does not fit in one byte, remote will see {}",
                        len,
                        len as u8
                    );
                }
                vec![len as u8]
            }
            SizeEncoding::U32BigEndian => {
                let value = i32::try_from(len).unwrap_or_else(|_| {
                    warn!("Request size {} exceeds i32 range, clamping", len);
                    i32::MAX
                });
                value.to_be_bytes().to_vec()
            }
        }
    }

    /// 解码对端的响应大小声明
    pub fn decode(self, data: &[u8]) -> Result<i64, TransferError> {
        match (self, data) {
            (SizeEncoding::SingleByte, [value]) => Ok(i64::from(*value)),
            (SizeEncoding::U32BigEndian, [a, b, c, d]) => {
                Ok(i64::from(i32::from_be_bytes([*a, *b, *c, *d])))
            }
            _ => Err(TransferError::CorruptedSizeAnnouncement(format!(
                "size announcement has unexpected width {} for {:?}",
                data.len(),
                self
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_truncates() {
        assert_eq!(SizeEncoding::SingleByte.encode(200), vec![200]);
        assert_eq!(SizeEncoding::SingleByte.encode(1200), vec![(1200 % 256) as u8]);
    }

    #[test]
    fn test_single_byte_decode_is_unsigned() {
        assert_eq!(SizeEncoding::SingleByte.decode(&[200]).unwrap(), 200);
        assert_eq!(SizeEncoding::SingleByte.decode(&[0]).unwrap(), 0);
    }

    #[test]
    fn test_wide_encoding() {
        let encoded = SizeEncoding::U32BigEndian.encode(1200);
        assert_eq!(encoded, vec![0, 0, 0x04, 0xB0]);
        assert_eq!(SizeEncoding::U32BigEndian.decode(&encoded).unwrap(), 1200);
        assert_eq!(
            SizeEncoding::U32BigEndian
                .decode(&[0xFF, 0xFF, 0xFF, 0xFF])
                .unwrap(),
            -1
        );
    }

    #[test]
    fn test_wrong_width_is_corrupted() {
        assert!(matches!(
            SizeEncoding::SingleByte.decode(&[1, 2]),
            Err(TransferError::CorruptedSizeAnnouncement(_))
        ));
        assert!(SizeEncoding::U32BigEndian.decode(&[1]).is_err());
        assert!(SizeEncoding::SingleByte.decode(&[]).is_err());
    }
}
