//! 传输状态机
//!
//! 单个请求/响应会话的状态机。它不做任何 I/O：每个 [`TransferEvent`]
//! 产出一组 [`Command`]，由会话驱动执行，写入结果和对端通知再作为新事件
//! 送回。所有状态转换严格按事件投递顺序发生，因此不需要内部加锁。
//!
//! # 流程
//!
//! 1. 写入请求大小 (`RequestSize`)
//! 2. 逐个写入请求分片 (`RequestData`)，每个分片后写入 `ChunkProcessingPending`
//!    标记，等待对端回写 `ChunkProcessingComplete`
//! 3. 写入 `Uninitialized` 标记表示请求发送完毕
//! 4. 等待对端声明响应大小 (`ResponseSize`)
//! 5. 重组响应分片 (`ResponseData`)，每个分片回写一次 `ChunkProcessingComplete`
//!
//! 流控标记特征由请求和响应两个阶段共用，见 [`FlowChannel`]。

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::config::{RemoteMarkerPolicy, TransferConfig};
use crate::transfer::assembler::Assembler;
use crate::transfer::chunker::{Chunker, chunk_size_for_mtu};
use crate::transfer::error::TransferError;
use crate::transfer::message::{
    Command, InternalMessage, TransferEvent, TransferResponse,
};
use crate::transfer::semaphore::SemaphoreMarker;
use crate::transfer::wire::SizeEncoding;
use crate::transport::{Attribute, Notification};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferState {
    #[default]
    Uninitialized,
    RequestSizeWritePending,
    RequestSizeWriteSuccess,
    RequestSizeWriteFailed,
    RequestWritePending,
    RequestWriteFailed,
    ResponseSizeReadPending,
    ResponseReadPending,
    ResponseReadFailed,
    TransferComplete,
    Cancelled,
}

impl TransferState {
    /// 终止状态之后不会再发生任何转换
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::RequestSizeWriteFailed
                | TransferState::RequestWriteFailed
                | TransferState::ResponseReadFailed
                | TransferState::TransferComplete
                | TransferState::Cancelled
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != TransferState::TransferComplete
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 流控通道的使用阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

/// 共享的流控通道
///
/// 一个单字节特征同时承担请求分片和响应分片的握手。这里记录通道上最后一次
/// 被声明的标记以及声明它的阶段。对端在响应阶段每声明一次
/// `ChunkProcessingPending` 就记一次待确认，连续到达的多个声明不会合并；
/// 没有待确认的声明时，响应分片的确认需要稍后重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowChannel {
    marker: SemaphoreMarker,
    owner: Phase,
    remote_pending: usize,
}

impl Default for FlowChannel {
    fn default() -> Self {
        Self {
            marker: SemaphoreMarker::Uninitialized,
            owner: Phase::Request,
            remote_pending: 0,
        }
    }
}

impl FlowChannel {
    pub fn marker(&self) -> SemaphoreMarker {
        self.marker
    }

    pub fn owner(&self) -> Phase {
        self.owner
    }

    /// 声明新的标记，返回旧值
    pub fn assert(&mut self, marker: SemaphoreMarker, owner: Phase) -> SemaphoreMarker {
        if marker == SemaphoreMarker::ChunkProcessingPending && owner == Phase::Response {
            self.remote_pending += 1;
        }
        let old = self.marker;
        self.marker = marker;
        self.owner = owner;
        old
    }

    /// 对端尚未被确认的 Pending 声明数
    pub fn remote_pending(&self) -> usize {
        self.remote_pending
    }

    /// 是否可以确认对端写入的响应分片
    pub fn can_acknowledge(&self) -> bool {
        self.remote_pending > 0
    }

    /// 消耗一次对端声明并在通道上写入 `ChunkProcessingComplete`
    pub fn acknowledge(&mut self) -> bool {
        if self.remote_pending == 0 {
            return false;
        }
        self.remote_pending -= 1;
        self.marker = SemaphoreMarker::ChunkProcessingComplete;
        self.owner = Phase::Response;
        true
    }
}

/// 响应重组完成后，为未发出的确认最多再等待的轮数
pub const ACK_FLUSH_ATTEMPTS: usize = 25;

/// 状态机参数
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub chunk_size: usize,
    pub size_encoding: SizeEncoding,
    pub max_response_size: usize,
    pub ack_retry_delay: Duration,
    pub remote_marker_policy: RemoteMarkerPolicy,
}

impl HandlerSettings {
    pub fn from_config(config: &TransferConfig, mtu: usize) -> Self {
        Self {
            chunk_size: chunk_size_for_mtu(mtu),
            size_encoding: config.size_encoding,
            max_response_size: config.max_response_size,
            ack_retry_delay: config.ack_retry_delay(),
            remote_marker_policy: config.remote_marker_policy,
        }
    }
}

/// 会话统计，用于日志和测试
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks_sent: usize,
    pub chunks_resent: usize,
    pub chunks_received: usize,
    pub chunks_acknowledged: usize,
    pub ack_deferrals: usize,
}

#[derive(Debug)]
pub struct TransferHandler {
    settings: HandlerSettings,
    state: TransferState,
    chunker: Option<Chunker>,
    assembler: Option<Assembler>,
    channel: FlowChannel,
    /// 本轮分片的 Pending 标记已被链路确认写出
    marker_confirmed: bool,
    /// 对端已回写 ChunkProcessingComplete
    remote_processed: bool,
    pending_acks: usize,
    flush_attempts: usize,
    response_started: Option<Instant>,
    stats: TransferStats,
}

impl TransferHandler {
    pub fn new(settings: HandlerSettings) -> Self {
        Self {
            settings,
            state: TransferState::Uninitialized,
            chunker: None,
            assembler: None,
            channel: FlowChannel::default(),
            marker_confirmed: false,
            remote_processed: false,
            pending_acks: 0,
            flush_attempts: 0,
            response_started: None,
            stats: TransferStats::default(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn channel(&self) -> FlowChannel {
        self.channel
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks
    }

    /// 处理一个事件
    ///
    /// 终止状态下的事件被忽略，不产生任何命令。
    pub fn handle(&mut self, event: TransferEvent) -> Vec<Command> {
        if self.state.is_terminal() {
            debug!(
                "Ignoring {} in terminal state {}",
                event.kind(),
                self.state
            );
            return Vec::new();
        }

        match event {
            TransferEvent::Begin(payload) => self.on_begin(payload),
            TransferEvent::Cancel => {
                info!("Transfer cancelled in state {}", self.state);
                self.fail(TransferState::Cancelled, TransferError::Cancelled)
            }
            TransferEvent::WriteCompleted { attribute, result } => {
                self.on_write_completed(attribute, result)
            }
            TransferEvent::ReadCompleted { attribute, result } => {
                self.on_read_completed(attribute, result)
            }
            TransferEvent::Notified(notification) => self.on_notification(notification),
            TransferEvent::LinkLost => self.on_link_lost(),
            TransferEvent::Internal(message) => self.on_internal(message),
        }
    }

    fn on_begin(&mut self, payload: Vec<u8>) -> Vec<Command> {
        if self.state != TransferState::Uninitialized {
            warn!("Transfer already started, ignoring new request");
            return Vec::new();
        }

        let size = payload.len();
        let chunker = match Chunker::new(payload, self.settings.chunk_size) {
            Ok(chunker) => chunker,
            Err(e) => return self.fail(TransferState::RequestWriteFailed, e),
        };
        info!(
            "Starting request transfer: {} bytes in {} chunks of up to {} bytes",
            size,
            chunker.chunk_count(),
            chunker.chunk_size()
        );

        self.chunker = Some(chunker);
        self.state = TransferState::RequestSizeWritePending;
        vec![Command::post(InternalMessage::SendRequestSize(size))]
    }

    fn on_internal(&mut self, message: InternalMessage) -> Vec<Command> {
        match message {
            InternalMessage::SendRequestSize(size) => vec![Command::write(
                Attribute::RequestSize,
                self.settings.size_encoding.encode(size),
            )],
            InternalMessage::StartChunkSend | InternalMessage::SendNextChunk => {
                self.send_request_chunk()
            }
            InternalMessage::UpdateChunkWroteStatus(marker) => match marker {
                SemaphoreMarker::ChunkProcessingPending => vec![Command::write_marker(marker)],
                other => {
                    trace!("No local status update for marker {}", other);
                    Vec::new()
                }
            },
            InternalMessage::RequestTransferComplete => {
                self.channel
                    .assert(SemaphoreMarker::Uninitialized, Phase::Request);
                self.state = TransferState::ResponseSizeReadPending;
                info!(
                    "Request transfer complete ({} chunks), waiting for response size",
                    self.stats.chunks_sent
                );
                vec![Command::write_marker(SemaphoreMarker::Uninitialized)]
            }
            InternalMessage::AcknowledgeChunk => self.acknowledge_chunk(),
            InternalMessage::ResponseTransferComplete => self.complete_response(),
            InternalMessage::ResponseTransferFailed(e) => {
                error!("Response transfer failed: {}", e);
                self.fail(TransferState::ResponseReadFailed, e)
            }
        }
    }

    fn send_request_chunk(&mut self) -> Vec<Command> {
        let Some(chunker) = self.chunker.as_mut() else {
            return self.fail(
                TransferState::RequestWriteFailed,
                TransferError::ChunkWriteFailed("no request in progress".to_string()),
            );
        };

        let chunk = match chunker.next() {
            Some(chunk) => chunk.to_vec(),
            None => return vec![Command::post(InternalMessage::RequestTransferComplete)],
        };
        let (sent, total) = chunker.progress();

        self.stats.chunks_sent += 1;
        debug!(
            "Sending request chunk {} ({}/{} bytes)",
            self.stats.chunks_sent, sent, total
        );
        self.begin_chunk_cycle();
        self.state = TransferState::RequestWritePending;

        vec![
            Command::write(Attribute::RequestData, chunk),
            Command::post(InternalMessage::UpdateChunkWroteStatus(
                SemaphoreMarker::ChunkProcessingPending,
            )),
        ]
    }

    /// 本端在通道上声明分片待处理，并重置本轮的确认条件
    fn begin_chunk_cycle(&mut self) {
        self.channel
            .assert(SemaphoreMarker::ChunkProcessingPending, Phase::Request);
        self.marker_confirmed = false;
        self.remote_processed = false;
    }

    /// Pending 标记已写出且对端已处理完时发送下一个分片
    fn try_advance(&mut self) -> Vec<Command> {
        if self.marker_confirmed && self.remote_processed {
            self.marker_confirmed = false;
            self.remote_processed = false;
            vec![Command::post(InternalMessage::SendNextChunk)]
        } else {
            Vec::new()
        }
    }

    fn on_write_completed(
        &mut self,
        attribute: Attribute,
        result: Result<(), String>,
    ) -> Vec<Command> {
        match (attribute, result) {
            (Attribute::RequestSize, Ok(())) => {
                if self.state != TransferState::RequestSizeWritePending {
                    warn!("Unexpected request size write confirmation in {}", self.state);
                    return Vec::new();
                }
                debug!("Request size write success");
                self.state = TransferState::RequestSizeWriteSuccess;
                vec![Command::post(InternalMessage::StartChunkSend)]
            }
            (Attribute::RequestSize, Err(e)) => {
                error!("Request size write failed with error: {}", e);
                self.fail(
                    TransferState::RequestSizeWriteFailed,
                    TransferError::SizeWriteFailed(e),
                )
            }
            (Attribute::RequestData, Ok(())) => {
                trace!("Request chunk delivered");
                Vec::new()
            }
            (Attribute::RequestData, Err(e)) => {
                error!("Request chunk write to remote failed: {}", e);
                self.fail(
                    TransferState::RequestWriteFailed,
                    TransferError::ChunkWriteFailed(e),
                )
            }
            (Attribute::FlowControlMarker, Ok(())) => {
                if self.state == TransferState::RequestWritePending && !self.marker_confirmed {
                    self.marker_confirmed = true;
                    self.try_advance()
                } else {
                    trace!("Flow-control marker write confirmed in {}", self.state);
                    Vec::new()
                }
            }
            (Attribute::FlowControlMarker, Err(e)) => {
                error!("Flow-control marker write failed: {}", e);
                if self.state == TransferState::ResponseReadPending {
                    self.fail(
                        TransferState::ResponseReadFailed,
                        TransferError::ResponseReadFailed(format!(
                            "flow-control marker write failed: {e}"
                        )),
                    )
                } else {
                    self.fail(
                        TransferState::RequestWriteFailed,
                        TransferError::ChunkWriteFailed(format!(
                            "flow-control marker write failed: {e}"
                        )),
                    )
                }
            }
            (other, result) => {
                warn!("Unexpected write completion for {:?}: {:?}", other, result);
                Vec::new()
            }
        }
    }

    fn on_read_completed(
        &mut self,
        attribute: Attribute,
        result: Result<Vec<u8>, String>,
    ) -> Vec<Command> {
        match result {
            Ok(value) => self.dispatch_value(attribute, value),
            Err(e) if self.in_response_phase() => {
                error!("Reading {:?} failed: {}", attribute, e);
                self.fail(
                    TransferState::ResponseReadFailed,
                    TransferError::ResponseReadFailed(format!("{attribute:?} read failed: {e}")),
                )
            }
            Err(e) => {
                warn!("Reading {:?} failed outside the response phase: {}", attribute, e);
                Vec::new()
            }
        }
    }

    fn on_link_lost(&mut self) -> Vec<Command> {
        error!("Notification stream ended in state {}", self.state);
        let state = match self.state {
            TransferState::Uninitialized
            | TransferState::RequestSizeWritePending
            | TransferState::RequestSizeWriteSuccess => TransferState::RequestSizeWriteFailed,
            TransferState::RequestWritePending => TransferState::RequestWriteFailed,
            _ => TransferState::ResponseReadFailed,
        };
        self.fail(
            state,
            TransferError::TransportUnavailable("notification stream ended".to_string()),
        )
    }

    fn on_notification(&mut self, notification: Notification) -> Vec<Command> {
        let Notification { attribute, value } = notification;
        if value.is_empty() && attribute.is_notifying() {
            // 通知只表示值已变化，主动读取
            return vec![Command::Read(attribute)];
        }
        self.dispatch_value(attribute, value)
    }

    fn dispatch_value(&mut self, attribute: Attribute, value: Vec<u8>) -> Vec<Command> {
        match attribute {
            Attribute::FlowControlMarker => match SemaphoreMarker::decode(&value) {
                Ok(marker) => self.on_remote_marker(marker),
                Err(e) => {
                    warn!("Ignoring {}", e);
                    Vec::new()
                }
            },
            Attribute::ResponseSize if self.state == TransferState::ResponseSizeReadPending => {
                self.on_response_size(&value)
            }
            Attribute::ResponseData if self.state == TransferState::ResponseReadPending => {
                self.on_response_chunk(&value)
            }
            other => {
                warn!(
                    "Ignoring {} bytes on {:?} in state {}",
                    value.len(),
                    other,
                    self.state
                );
                Vec::new()
            }
        }
    }

    fn in_response_phase(&self) -> bool {
        matches!(
            self.state,
            TransferState::ResponseSizeReadPending | TransferState::ResponseReadPending
        )
    }

    fn on_remote_marker(&mut self, marker: SemaphoreMarker) -> Vec<Command> {
        match self.state {
            TransferState::RequestWritePending => match marker {
                SemaphoreMarker::ChunkProcessingComplete => {
                    self.channel
                        .assert(SemaphoreMarker::ChunkProcessingComplete, Phase::Request);
                    self.remote_processed = true;
                    self.try_advance()
                }
                SemaphoreMarker::ResendRequested => self.resend_chunk(),
                SemaphoreMarker::Error => self.on_remote_error(
                    TransferState::RequestWriteFailed,
                    "chunk marked as error while reading by remote",
                ),
                other => {
                    trace!("Remote marker {} during request phase", other);
                    Vec::new()
                }
            },
            TransferState::ResponseSizeReadPending | TransferState::ResponseReadPending => {
                match marker {
                    SemaphoreMarker::ChunkProcessingPending => {
                        let old = self
                            .channel
                            .assert(SemaphoreMarker::ChunkProcessingPending, Phase::Response);
                        debug!(
                            "Chunk wrote by remote status updated from {} to {}",
                            old, marker
                        );
                        Vec::new()
                    }
                    SemaphoreMarker::ResendRequested => {
                        warn!("Remote asked to re-read the response chunk");
                        Vec::new()
                    }
                    SemaphoreMarker::Error => self.on_remote_error(
                        TransferState::ResponseReadFailed,
                        "response chunk marked as error by remote",
                    ),
                    other => {
                        trace!("Remote marker {} during response phase", other);
                        Vec::new()
                    }
                }
            }
            _ => {
                debug!("Ignoring remote marker {} in state {}", marker, self.state);
                Vec::new()
            }
        }
    }

    fn resend_chunk(&mut self) -> Vec<Command> {
        if self.settings.remote_marker_policy == RemoteMarkerPolicy::LogOnly {
            info!("Resend chunk requested");
            return Vec::new();
        }

        let Some(chunk) = self
            .chunker
            .as_ref()
            .and_then(Chunker::previous)
            .map(<[u8]>::to_vec)
        else {
            warn!("Resend requested but no chunk has been sent");
            return Vec::new();
        };

        self.stats.chunks_resent += 1;
        info!("Resending request chunk {}", self.stats.chunks_sent);
        self.begin_chunk_cycle();
        vec![
            Command::write(Attribute::RequestData, chunk),
            Command::post(InternalMessage::UpdateChunkWroteStatus(
                SemaphoreMarker::ChunkProcessingPending,
            )),
        ]
    }

    fn on_remote_error(&mut self, state: TransferState, context: &str) -> Vec<Command> {
        match self.settings.remote_marker_policy {
            RemoteMarkerPolicy::LogOnly => {
                warn!("{}", context);
                Vec::new()
            }
            RemoteMarkerPolicy::Strict => {
                error!("{}", context);
                self.fail(state, TransferError::RemoteError)
            }
        }
    }

    fn on_response_size(&mut self, value: &[u8]) -> Vec<Command> {
        self.response_started = Some(Instant::now());

        let declared = match self.settings.size_encoding.decode(value) {
            Ok(declared) => declared,
            Err(e) => return self.fail(TransferState::ResponseReadFailed, e),
        };
        info!("Response size announced: {} bytes", declared);

        if declared == 0 {
            self.assembler = Some(Assembler::empty());
            self.state = TransferState::ResponseReadPending;
            return vec![Command::post(InternalMessage::ResponseTransferComplete)];
        }

        match Assembler::new(declared, self.settings.max_response_size) {
            Ok(assembler) => {
                self.assembler = Some(assembler);
                self.state = TransferState::ResponseReadPending;
                Vec::new()
            }
            Err(e) => {
                error!("Corrupted response size from remote: {}", e);
                self.fail(TransferState::ResponseReadFailed, e)
            }
        }
    }

    fn on_response_chunk(&mut self, chunk: &[u8]) -> Vec<Command> {
        let Some(assembler) = self.assembler.as_mut() else {
            warn!("Response chunk received before response size");
            return Vec::new();
        };
        if assembler.is_complete() {
            debug!("Response already assembled, dropping extra chunk");
            return Vec::new();
        }
        if let Err(e) = assembler.add_chunk(chunk) {
            error!("Failed to assemble response chunk: {}", e);
            return self.fail(TransferState::ResponseReadFailed, e);
        }

        self.stats.chunks_received += 1;
        self.pending_acks += 1;
        debug!(
            "Response chunk {} received ({}/{} bytes)",
            self.stats.chunks_received,
            assembler.received(),
            assembler.expected()
        );

        let mut commands = vec![Command::post(InternalMessage::AcknowledgeChunk)];
        if assembler.is_complete() {
            commands.push(Command::post(InternalMessage::ResponseTransferComplete));
        }
        commands
    }

    fn acknowledge_chunk(&mut self) -> Vec<Command> {
        if self.pending_acks == 0 {
            trace!("No response chunk waiting for acknowledgement");
            return Vec::new();
        }

        if self.channel.acknowledge() {
            self.pending_acks -= 1;
            self.stats.chunks_acknowledged += 1;
            vec![Command::write_marker(SemaphoreMarker::ChunkProcessingComplete)]
        } else {
            self.stats.ack_deferrals += 1;
            trace!(
                "Flow-control channel holds {} ({:?}), deferring acknowledgement",
                self.channel.marker(),
                self.channel.owner()
            );
            vec![Command::PostDelayed(
                InternalMessage::AcknowledgeChunk.into(),
                self.settings.ack_retry_delay,
            )]
        }
    }

    fn complete_response(&mut self) -> Vec<Command> {
        if self.pending_acks > 0 && self.flush_attempts < ACK_FLUSH_ATTEMPTS {
            self.flush_attempts += 1;
            return vec![Command::PostDelayed(
                InternalMessage::ResponseTransferComplete.into(),
                self.settings.ack_retry_delay,
            )];
        }
        if self.pending_acks > 0 {
            warn!(
                "Completing with {} response chunks unacknowledged",
                self.pending_acks
            );
        }

        let Some(data) = self.assembler.take().and_then(Assembler::into_data) else {
            return self.fail(
                TransferState::ResponseReadFailed,
                TransferError::MissingAssembledData,
            );
        };
        let duration = self
            .response_started
            .map(|started| started.elapsed())
            .unwrap_or_default();

        info!(
            "Response transfer complete in {}ms ({} bytes)",
            duration.as_millis(),
            data.len()
        );
        self.state = TransferState::TransferComplete;
        self.chunker = None;
        vec![Command::Complete(TransferResponse { data, duration })]
    }

    /// 进入终止失败状态并释放缓冲区
    fn fail(&mut self, state: TransferState, error: TransferError) -> Vec<Command> {
        self.state = state;
        self.chunker = None;
        self.assembler = None;
        self.pending_acks = 0;
        vec![Command::Fail(error)]
    }
}
