//! 集成测试 - 完整会话
//!
//! 用内存中的模拟外围设备驱动 `TransferClient`，验证请求分片、流控握手和响应重组。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gattlink_core::transfer::{ChannelListener, ListenerEvent};
use gattlink_core::{
    Attribute, GattTransport, Notification, NotificationStream, SemaphoreMarker, SizeEncoding,
    TransferClient, TransferConfig, TransferError, TransferState, TransportError,
};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Responder = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct PeripheralState {
    request: Vec<u8>,
    response: VecDeque<Vec<u8>>,
    central_markers: Vec<SemaphoreMarker>,
    requests_served: usize,
}

/// 模拟外围设备
///
/// - 每收到一个 `ChunkProcessingPending` 标记就回写 `ChunkProcessingComplete`
/// - 收到 `Uninitialized` 标记后计算响应，声明大小并发出第一个分片
/// - 每收到一个响应分片确认就发出下一个分片
struct SimulatedPeripheral {
    mtu: usize,
    size_encoding: SizeEncoding,
    responder: Responder,
    fail_writes_to: Option<Attribute>,
    silent: bool,
    link_down: bool,
    state: Mutex<PeripheralState>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

impl SimulatedPeripheral {
    fn new(mtu: usize, responder: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self {
            mtu,
            size_encoding: SizeEncoding::SingleByte,
            responder: Box::new(responder),
            fail_writes_to: None,
            silent: false,
            link_down: false,
            state: Mutex::new(PeripheralState::default()),
            notify_tx: Mutex::new(None),
        }
    }

    fn echo(mtu: usize) -> Self {
        Self::new(mtu, |request| request.iter().rev().copied().collect())
    }

    fn with_size_encoding(mut self, encoding: SizeEncoding) -> Self {
        self.size_encoding = encoding;
        self
    }

    fn failing(mut self, attribute: Attribute) -> Self {
        self.fail_writes_to = Some(attribute);
        self
    }

    fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// 通知流立即结束，模拟链路断开
    fn link_down(mut self) -> Self {
        self.link_down = true;
        self
    }

    fn notify(&self, attribute: Attribute, value: impl Into<Vec<u8>>) {
        if let Some(tx) = self.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Notification::new(attribute, value));
        }
    }

    fn send_next_response_chunk(&self, state: &mut PeripheralState) {
        if let Some(chunk) = state.response.pop_front() {
            self.notify(Attribute::ResponseData, chunk);
            self.notify(
                Attribute::FlowControlMarker,
                SemaphoreMarker::ChunkProcessingPending.encode(),
            );
        }
    }

    fn central_markers(&self) -> Vec<SemaphoreMarker> {
        self.state.lock().unwrap().central_markers.clone()
    }

    fn request(&self) -> Vec<u8> {
        self.state.lock().unwrap().request.clone()
    }
}

#[async_trait]
impl GattTransport for SimulatedPeripheral {
    async fn write(&self, attribute: Attribute, value: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes_to == Some(attribute) {
            return Err(TransportError::Write("simulated failure".to_string()));
        }
        if self.silent {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        match attribute {
            Attribute::RequestSize => state.request.clear(),
            Attribute::RequestData => state.request.extend_from_slice(value),
            Attribute::FlowControlMarker => {
                let marker = SemaphoreMarker::decode(value).unwrap();
                state.central_markers.push(marker);
                match marker {
                    SemaphoreMarker::ChunkProcessingPending => self.notify(
                        Attribute::FlowControlMarker,
                        SemaphoreMarker::ChunkProcessingComplete.encode(),
                    ),
                    SemaphoreMarker::Uninitialized => {
                        let response = (self.responder)(&state.request);
                        state.requests_served += 1;
                        self.notify(
                            Attribute::ResponseSize,
                            self.size_encoding.encode(response.len()),
                        );
                        let chunk_size = self.mtu - 3;
                        state.response = response.chunks(chunk_size).map(<[u8]>::to_vec).collect();
                        self.send_next_response_chunk(&mut state);
                    }
                    SemaphoreMarker::ChunkProcessingComplete => {
                        self.send_next_response_chunk(&mut state)
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn read(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Read(format!("{attribute:?} is not readable")))
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.link_down {
            *self.notify_tx.lock().unwrap() = Some(tx);
        }
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

fn reversed(data: &[u8]) -> Vec<u8> {
    data.iter().rev().copied().collect()
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23));
    let client = TransferClient::new(peripheral.clone(), TransferConfig::default());
    let payload = random_payload(45);

    let response = client.transfer(payload.clone()).await.unwrap();

    assert_eq!(peripheral.request(), payload);
    assert_eq!(response.data, reversed(&payload));

    // 3 个请求分片，3 个响应分片 (20 + 20 + 5)
    let markers = peripheral.central_markers();
    let count = |m: SemaphoreMarker| markers.iter().filter(|x| **x == m).count();
    assert_eq!(count(SemaphoreMarker::ChunkProcessingPending), 3);
    assert_eq!(count(SemaphoreMarker::Uninitialized), 1);
    assert_eq!(count(SemaphoreMarker::ChunkProcessingComplete), 3);
    assert!(!client.is_busy());
}

#[tokio::test]
async fn test_large_transfer_with_wide_size_encoding() {
    let peripheral = Arc::new(
        SimulatedPeripheral::new(517, |request| request.repeat(2))
            .with_size_encoding(SizeEncoding::U32BigEndian),
    );
    let config = TransferConfig {
        size_encoding: SizeEncoding::U32BigEndian,
        ..Default::default()
    };
    let client = TransferClient::new(peripheral.clone(), config);
    let payload = random_payload(1200);

    let response = client.transfer(payload.clone()).await.unwrap();

    assert_eq!(response.data, payload.repeat(2));
    let acks = peripheral
        .central_markers()
        .into_iter()
        .filter(|m| *m == SemaphoreMarker::ChunkProcessingComplete)
        .count();
    assert_eq!(acks, 2400usize.div_ceil(514));
}

#[tokio::test]
async fn test_zero_length_response() {
    let peripheral = Arc::new(SimulatedPeripheral::new(23, |_| Vec::new()));
    let client = TransferClient::new(peripheral, TransferConfig::default());

    let handle = client.begin_transfer(b"ping".to_vec()).await.unwrap();
    let mut states = handle.state_changes();
    let response = handle.wait().await.unwrap();

    assert!(response.data.is_empty());
    assert_eq!(*states.borrow_and_update(), TransferState::TransferComplete);
}

#[tokio::test]
async fn test_size_write_failure() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23).failing(Attribute::RequestSize));
    let client = TransferClient::new(peripheral, TransferConfig::default());

    let handle = client.begin_transfer(b"hello".to_vec()).await.unwrap();
    let states = handle.state_changes();
    let result = handle.wait().await;

    assert_eq!(
        result,
        Err(TransferError::SizeWriteFailed(
            "Write failed: simulated failure".to_string()
        ))
    );
    assert_eq!(*states.borrow(), TransferState::RequestSizeWriteFailed);
    assert!(!client.is_busy());
}

#[tokio::test]
async fn test_chunk_write_failure() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23).failing(Attribute::RequestData));
    let client = TransferClient::new(peripheral, TransferConfig::default());

    let result = client.transfer(random_payload(60)).await;
    assert!(matches!(result, Err(TransferError::ChunkWriteFailed(_))));
}

#[tokio::test]
async fn test_cancel_in_flight() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23).silent());
    let client = TransferClient::new(peripheral, TransferConfig::default());

    let handle = client.begin_transfer(random_payload(100)).await.unwrap();
    let mut states = handle.state_changes();
    states
        .wait_for(|state| *state == TransferState::RequestWritePending)
        .await
        .unwrap();

    handle.cancel();
    assert_eq!(handle.wait().await, Err(TransferError::Cancelled));
    assert_eq!(*states.borrow(), TransferState::Cancelled);
}

#[tokio::test]
async fn test_notification_stream_end_fails_session() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23).link_down());
    let client = TransferClient::new(peripheral, TransferConfig::default());

    let handle = client.begin_transfer(random_payload(60)).await.unwrap();
    let states = handle.state_changes();
    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("session should end when the link drops");

    assert_eq!(
        result,
        Err(TransferError::TransportUnavailable(
            "notification stream ended".to_string()
        ))
    );
    assert!(states.borrow().is_failure());
    assert!(!client.is_busy());
}

#[tokio::test]
async fn test_one_session_per_connection() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23).silent());
    let client = TransferClient::new(peripheral, TransferConfig::default());

    let first = client.begin_transfer(b"first".to_vec()).await.unwrap();
    assert!(client.is_busy());
    assert!(matches!(
        client.begin_transfer(b"second".to_vec()).await,
        Err(TransferError::SessionActive)
    ));

    first.cancel();
    let _ = first.wait().await;
    assert!(!client.is_busy());

    let third = client.begin_transfer(b"third".to_vec()).await.unwrap();
    third.cancel();
    assert_eq!(third.wait().await, Err(TransferError::Cancelled));
}

#[tokio::test]
async fn test_sequential_sessions_on_one_connection() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23));
    let client = TransferClient::new(peripheral.clone(), TransferConfig::default());

    for len in [1, 20, 21] {
        let payload = random_payload(len);
        let response = client.transfer(payload.clone()).await.unwrap();
        assert_eq!(response.data, reversed(&payload));
    }
    assert_eq!(peripheral.state.lock().unwrap().requests_served, 3);
}

#[tokio::test]
async fn test_listener_receives_single_result() {
    let peripheral = Arc::new(SimulatedPeripheral::echo(23));
    let client = TransferClient::new(peripheral, TransferConfig::default());
    let (listener, mut events) = ChannelListener::new();

    let handle = client
        .begin_transfer_with_listener(b"abc".to_vec(), Arc::new(listener))
        .await
        .unwrap();
    let response = handle.wait().await.unwrap();
    assert_eq!(response.data, b"cba");

    let mut results = Vec::new();
    while let Ok(event) = tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
        match event {
            Some(ListenerEvent::State(_)) => {}
            Some(other) => results.push(other),
            None => break,
        }
    }
    assert_eq!(results.len(), 1);
    assert!(matches!(
        &results[0],
        ListenerEvent::Complete { data, .. } if data.as_slice() == b"cba"
    ));
}
