//! 分片请求/响应传输
//!
//! 包含:
//! - 请求分片 ([`Chunker`]) 与响应重组 ([`Assembler`])
//! - 流控标记 ([`SemaphoreMarker`]) 与大小声明编码 ([`SizeEncoding`])
//! - 纯状态机 ([`TransferHandler`])
//! - 基于 tokio 的会话驱动 ([`TransferClient`])

pub mod assembler;
pub mod chunker;
pub mod error;
pub mod handler;
pub mod message;
pub mod notify;
pub mod semaphore;
pub mod session;
pub mod wire;

pub use assembler::Assembler;
pub use chunker::{ATT_OVERHEAD, Chunker, chunk_size_for_mtu};
pub use error::TransferError;
pub use handler::{FlowChannel, HandlerSettings, Phase, TransferHandler, TransferState, TransferStats};
pub use message::{Command, InternalMessage, TransferEvent, TransferResponse};
pub use notify::{ChannelListener, ListenerEvent, NotifierError, OnceNotifier, TransferListener};
pub use semaphore::SemaphoreMarker;
pub use session::{SessionHandle, TransferClient, TransferResult};
pub use wire::SizeEncoding;
