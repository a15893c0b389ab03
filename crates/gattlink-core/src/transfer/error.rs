//! 传输错误定义

/// 传输会话错误
///
/// 所有终止失败都通过该类型上报，`Display` 即为面向调用方的描述字符串。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Request size write failed: {0}")]
    SizeWriteFailed(String),

    #[error("Request chunk write failed: {0}")]
    ChunkWriteFailed(String),

    #[error("Corrupted Data from Remote: {0}")]
    CorruptedSizeAnnouncement(String),

    #[error("Response overflow: expected {expected} bytes, received {received}")]
    ReassemblyOverflow { expected: usize, received: usize },

    #[error("Assembler is complete but data is missing")]
    MissingAssembledData,

    #[error("Remote marked the chunk as error")]
    RemoteError,

    #[error("Response read failed: {0}")]
    ResponseReadFailed(String),

    #[error("Invalid flow-control marker: {0:?}")]
    InvalidMarker(Vec<u8>),

    #[error("Chunk size must be at least 1 byte")]
    InvalidChunkSize,

    #[error("A transfer session is already active on this connection")]
    SessionActive,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transfer session closed without a result")]
    SessionClosed,
}
