//! 响应重组器
//!
//! 协议本身不携带序号：分片顺序完全依赖链路按发送顺序投递，
//! 以及流控握手保证上一个分片处理完之前不会发送下一个分片。

use crate::transfer::error::TransferError;

#[derive(Debug)]
pub struct Assembler {
    expected: usize,
    data: Vec<u8>,
}

impl Assembler {
    /// 按对端声明的长度创建重组器
    ///
    /// 声明长度 `<= 0` 或超过 `max_len` 视为数据损坏，在接收任何分片之前失败。
    pub fn new(declared_len: i64, max_len: usize) -> Result<Self, TransferError> {
        if declared_len <= 0 {
            return Err(TransferError::CorruptedSizeAnnouncement(format!(
                "invalid response size {declared_len}"
            )));
        }
        let expected = usize::try_from(declared_len)
            .ok()
            .filter(|len| *len <= max_len)
            .ok_or_else(|| {
                TransferError::CorruptedSizeAnnouncement(format!(
                    "response size {declared_len} exceeds limit {max_len}"
                ))
            })?;

        Ok(Self {
            expected,
            data: Vec::with_capacity(expected),
        })
    }

    /// 对端明确声明零长度响应时使用，创建后即完成
    pub fn empty() -> Self {
        Self {
            expected: 0,
            data: Vec::new(),
        }
    }

    /// 按到达顺序追加分片
    ///
    /// 超出声明长度时返回 `ReassemblyOverflow`，该分片不会被追加。
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        let received = self.data.len() + chunk.len();
        if received > self.expected {
            return Err(TransferError::ReassemblyOverflow {
                expected: self.expected,
                received,
            });
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.expected
    }

    /// 完成后返回重组结果，未完成时返回 `None`
    pub fn data(&self) -> Option<&[u8]> {
        self.is_complete().then_some(self.data.as_slice())
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        if self.is_complete() {
            Some(self.data)
        } else {
            None
        }
    }

    pub fn received(&self) -> usize {
        self.data.len()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::chunker::Chunker;

    const MAX: usize = 64 * 1024;

    #[test]
    fn test_reassembles_in_order() {
        let mut assembler = Assembler::new(11, MAX).unwrap();
        for chunk in [&b"hello"[..], &b" "[..], &b"world"[..]] {
            assert!(!assembler.is_complete());
            assembler.add_chunk(chunk).unwrap();
        }
        assert!(assembler.is_complete());
        assert_eq!(assembler.data(), Some(&b"hello world"[..]));
    }

    #[test]
    fn test_data_absent_before_complete() {
        let mut assembler = Assembler::new(4, MAX).unwrap();
        assembler.add_chunk(b"ab").unwrap();
        assert!(assembler.data().is_none());
        assert_eq!(assembler.received(), 2);
        assert!(assembler.into_data().is_none());
    }

    #[test]
    fn test_non_positive_size_is_corrupted() {
        for len in [0, -1, -128] {
            assert!(matches!(
                Assembler::new(len, MAX),
                Err(TransferError::CorruptedSizeAnnouncement(_))
            ));
        }
    }

    #[test]
    fn test_size_above_limit_is_corrupted() {
        assert!(matches!(
            Assembler::new(1025, 1024),
            Err(TransferError::CorruptedSizeAnnouncement(_))
        ));
        assert!(Assembler::new(1024, 1024).is_ok());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut assembler = Assembler::new(4, MAX).unwrap();
        assembler.add_chunk(b"abc").unwrap();
        assert_eq!(
            assembler.add_chunk(b"de"),
            Err(TransferError::ReassemblyOverflow {
                expected: 4,
                received: 5
            })
        );
        // 超出的分片没有被追加
        assert_eq!(assembler.received(), 3);
    }

    #[test]
    fn test_empty_response() {
        let assembler = Assembler::empty();
        assert!(assembler.is_complete());
        assert_eq!(assembler.data(), Some(&[][..]));
    }

    #[test]
    fn test_round_trip_with_chunker() {
        let m = 20;
        for len in [0, 1, m - 1, m, m + 1, 10 * m] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            let mut chunker = Chunker::new(payload.clone(), m).unwrap();
            let mut assembler = if len == 0 {
                Assembler::empty()
            } else {
                Assembler::new(len as i64, MAX).unwrap()
            };

            while let Some(chunk) = chunker.next() {
                assembler.add_chunk(chunk).unwrap();
            }

            assert!(assembler.is_complete(), "len={len}");
            assert_eq!(assembler.into_data().unwrap(), payload);
        }
    }
}
