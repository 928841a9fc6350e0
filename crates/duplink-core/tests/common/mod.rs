//! 集成测试公用的替身: 记录命令的控制通道、内存数据通道和记录回调

#![allow(dead_code)]

use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use duplink_core::bus::{EventBus, SessionEvent};
use duplink_core::ble::{ControlError, ControlLink};
use duplink_core::logging::LogEntry;
use duplink_core::stream::{StreamConnector, StreamError, StreamingChannel};
use duplink_core::transfer::{TransferDescriptor, TransferSession};
use duplink_core::workflow::{Flow, MachineSettings, SessionObserver, SessionState, StateMachine};
use duplink_core::StreamId;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

/// 记录所有发出的命令
#[derive(Clone, Default)]
pub struct RecordingControl {
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl RecordingControl {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ControlLink for RecordingControl {
    async fn send_command(&self, text: &str) -> Result<(), ControlError> {
        if self.is_closed() {
            return Err(ControlError::Closed);
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 每次连接创建一对内存管道，对端一侧交给测试
pub struct DuplexConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
    fail: bool,
}

impl DuplexConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers, fail: false }, rx)
    }

    pub fn failing() -> Self {
        let (mut connector, _) = Self::new();
        connector.fail = true;
        connector
    }
}

#[async_trait::async_trait]
impl StreamConnector for DuplexConnector {
    async fn connect(&self, id: StreamId) -> Result<StreamingChannel, StreamError> {
        if self.fail {
            return Err(StreamError::Socket(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "host is down",
            )));
        }
        let (local, peer) = tokio::io::duplex(1 << 16);
        let _ = self.peers.send(peer);
        Ok(StreamingChannel::from_io(id, local))
    }

    fn name(&self) -> &'static str {
        "duplex"
    }
}

/// 记录每次底层写入的长度；读一侧永远没有数据
pub struct RecordingIo {
    writes: Arc<Mutex<Vec<usize>>>,
    read: DuplexStream,
    _idle: DuplexStream,
}

impl AsyncRead for RecordingIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.writes.lock().unwrap().push(buf.len());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Clone, Default)]
pub struct RecordingConnector {
    pub writes: Arc<Mutex<Vec<usize>>>,
}

impl RecordingConnector {
    pub fn writes(&self) -> Vec<usize> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StreamConnector for RecordingConnector {
    async fn connect(&self, id: StreamId) -> Result<StreamingChannel, StreamError> {
        let (read, idle) = tokio::io::duplex(64);
        Ok(StreamingChannel::from_io(
            id,
            RecordingIo {
                writes: self.writes.clone(),
                read,
                _idle: idle,
            },
        ))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub statuses: Mutex<Vec<LogEntry>>,
    pub states: Mutex<Vec<(SessionState, SessionState)>>,
    pub progress: Mutex<Vec<(u64, u64)>>,
    pub completed: Mutex<Vec<TransferDescriptor>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn status_count(&self) -> usize {
        self.statuses.lock().unwrap().len()
    }

    pub fn state_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn visited(&self, state: SessionState) -> bool {
        self.states.lock().unwrap().iter().any(|(_, to)| *to == state)
    }

    pub fn completed(&self) -> Vec<TransferDescriptor> {
        self.completed.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_status(&self, entry: &LogEntry) {
        self.statuses.lock().unwrap().push(entry.clone());
    }

    fn on_state(&self, from: SessionState, to: SessionState) {
        self.states.lock().unwrap().push((from, to));
    }

    fn on_progress(&self, transferred: u64, total: u64) {
        self.progress.lock().unwrap().push((transferred, total));
    }

    fn on_complete(&self, descriptor: &TransferDescriptor) {
        self.completed.lock().unwrap().push(descriptor.clone());
    }

    fn on_error(&self, error: &str) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

pub type Machine = StateMachine<Arc<RecordingObserver>>;

pub struct Harness {
    pub machine: Machine,
    pub bus: EventBus,
    pub control: RecordingControl,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new(connector: Arc<dyn StreamConnector>, download_dir: &Path) -> Self {
        Self::with_settings(
            connector,
            MachineSettings {
                download_dir: download_dir.to_path_buf(),
                auto_accept: false,
                command_gap: Duration::ZERO,
                offered_file: None,
            },
        )
    }

    pub fn with_settings(connector: Arc<dyn StreamConnector>, settings: MachineSettings) -> Self {
        let bus = EventBus::new();
        let control = RecordingControl::default();
        let observer = Arc::new(RecordingObserver::default());
        let session = TransferSession::new(Box::new(control.clone()), connector, bus.sender());
        let machine = StateMachine::new(session, observer.clone(), settings);
        Self {
            machine,
            bus,
            control,
            observer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// 模拟对端发来的一条通知
    pub async fn peer_says(&mut self, text: &str) -> Flow {
        self.machine
            .handle(SessionEvent::Control(duplink_core::bus::ControlEvent {
                text: text.to_string(),
            }))
            .await
    }

    pub async fn send(&mut self, event: SessionEvent) -> Flow {
        self.machine.handle(event).await
    }

    /// 从总线取下一个事件交给状态机
    pub async fn step(&mut self) -> Flow {
        let event = tokio::time::timeout(Duration::from_secs(2), self.bus.recv())
            .await
            .expect("timed out waiting for bus event")
            .expect("bus closed");
        self.machine.handle(event).await
    }

    /// 一直处理总线事件直到条件满足
    pub async fn step_until(&mut self, mut done: impl FnMut(&Machine) -> bool) {
        while !done(&self.machine) {
            self.step().await;
        }
    }

    /// 一直处理总线事件直到控制通道发出指定命令
    pub async fn step_until_sent(&mut self, command: &str) {
        while !self.control.sent().iter().any(|c| c == command) {
            self.step().await;
        }
    }

    /// 当前数据通道编号
    pub fn stream_id(&self) -> StreamId {
        self.machine
            .session()
            .stream_id()
            .expect("no stream in progress")
    }

    pub fn transferred(&self) -> u64 {
        self.machine
            .session()
            .descriptor()
            .map(|d| d.transferred)
            .unwrap_or_default()
    }
}
