//! 事件总线
//!
//! 两个传输驱动运行在各自的任务里（BLE 通知转发、RFCOMM 读循环、连接任务），
//! 它们产生的所有事件都投递到同一个单消费者队列。状态机只在消费者一侧运行，
//! 一次处理一个事件，顺序与入队顺序一致，不做重排或合并。

use log::debug;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::stream::StreamingChannel;

/// 数据通道编号，用来区分前后两次传输的事件
pub type StreamId = u64;

/// 控制通道收到的一条命令文本（一个通知 = 一条完整命令）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    pub text: String,
}

/// 读循环读到的一块数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub bytes: Vec<u8>,
    pub length: usize,
}

impl DataEvent {
    pub fn new(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self { bytes, length }
    }
}

/// 数据通道事件
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// 连接建立，句柄随事件交给会话
    Connected(StreamingChannel),
    ConnectFailed(String),
    Data(DataEvent),
    /// 读失败或对端关闭，每个通道最多一次
    Disconnected,
    /// 上传任务累计写入的字节数
    Sent(u64),
    /// 上传任务结束：写入的块数，或失败原因
    Pumped(Result<usize, String>),
}

/// 本地（用户）发起的请求，与传输事件走同一条总线
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRequest {
    /// 准备接收：等待对端的 `fn:`/`fl:` 元数据
    Download { destination: Option<PathBuf> },
    /// 发送本地文件
    Upload { path: PathBuf },
    /// 设置对端发 `send` 时要上传的文件
    Offer { path: Option<PathBuf> },
    Cancel,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Control(ControlEvent),
    /// BLE 连接断开，通知流结束
    ControlLost,
    Stream { id: StreamId, event: StreamEvent },
    Request(LocalRequest),
    Shutdown,
}

/// 总线的生产者端，可以克隆给任意驱动任务
#[derive(Debug, Clone)]
pub struct BusSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl BusSender {
    /// 投递事件；消费者已退出时返回 false
    pub fn post(&self, event: SessionEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Event bus closed, dropping {:?}", e.0);
                false
            }
        }
    }

    pub fn control(&self, text: impl Into<String>) -> bool {
        self.post(SessionEvent::Control(ControlEvent { text: text.into() }))
    }

    pub fn stream(&self, id: StreamId, event: StreamEvent) -> bool {
        self.post(SessionEvent::Stream { id, event })
    }

    pub fn request(&self, request: LocalRequest) -> bool {
        self.post(SessionEvent::Request(request))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 单消费者收件箱
pub struct EventBus {
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> BusSender {
        BusSender {
            tx: self.tx.clone(),
        }
    }

    /// 等待下一个事件
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// 非阻塞地取出下一个事件
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
