//! 数据通道 (经典蓝牙 RFCOMM)
//!
//! `StreamingChannel` 是对一条面向连接的 socket 的句柄：
//!
//! - 读循环运行在独立任务中，每次最多读 [`CHUNK_SIZE`] 字节，结果作为
//!   [`StreamEvent`] 投递到事件总线，断开时只报告一次
//! - `write` 写入后立即 flush，不做批量缓冲
//! - `close` 幂等，任何任务都可以调用；关闭后再读写返回 [`StreamError::Closed`]
//!
//! 句柄可以廉价克隆，连接任务通过 `StreamEvent::Connected` 把它交给会话。

pub mod rfcomm;

pub use rfcomm::RfcommConnector;

use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusSender, DataEvent, StreamEvent, StreamId};

/// 读循环每次读取的最大字节数
pub const CHUNK_SIZE: usize = 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 数据通道错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Socket connect failed: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Streaming channel is closed")]
    Closed,

    #[error("Reader already started")]
    ReaderStarted,

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),
}

/// 建立数据通道的方式
///
/// 生产环境是 [`RfcommConnector`]，测试里可以换成内存管道。
#[async_trait::async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, id: StreamId) -> Result<StreamingChannel, StreamError>;

    fn name(&self) -> &'static str;
}

struct ChannelInner {
    id: StreamId,
    reader: StdMutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    disconnect_reported: AtomicBool,
    cancel: CancellationToken,
}

impl ChannelInner {
    /// 读循环结束时调用；本地主动关闭不算断开
    fn report_disconnect(&self, bus: &BusSender) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Stream {} reader stopped after local close", self.id);
            return;
        }
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            bus.stream(self.id, StreamEvent::Disconnected);
        }
    }
}

#[derive(Clone)]
pub struct StreamingChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for StreamingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingChannel")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl StreamingChannel {
    /// 用任意双向字节流构造通道
    pub fn from_io<S>(id: StreamId, io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            inner: Arc::new(ChannelInner {
                id,
                reader: StdMutex::new(Some(Box::new(reader))),
                writer: Mutex::new(Some(Box::new(writer))),
                closed: AtomicBool::new(false),
                disconnect_reported: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// 启动读循环，每个通道只能启动一次
    pub fn start_reader(&self, bus: BusSender) -> Result<JoinHandle<()>, StreamError> {
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        let reader = self
            .inner
            .reader
            .lock()
            .map_err(|_| StreamError::Closed)?
            .take()
            .ok_or(StreamError::ReaderStarted)?;

        let inner = self.inner.clone();
        Ok(tokio::spawn(read_loop(inner, reader, bus)))
    }

    /// 写入并 flush
    pub async fn write(&self, bytes: &[u8]) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(StreamError::Closed)?;

        let result = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(StreamError::Closed),
            r = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => r.map_err(StreamError::Write),
        };

        if !self.is_open() {
            // 写的过程中被关闭，释放写半边
            guard.take();
        }
        result
    }

    /// 关闭通道，重复调用无副作用
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            trace!("Stream {} already closed", self.inner.id);
            return;
        }
        debug!("Closing stream {}", self.inner.id);
        self.inner.cancel.cancel();

        // 正在写的一方会在取消后自行释放写半边
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.inner.reader.lock() {
            reader.take();
        }
    }
}

async fn read_loop(inner: Arc<ChannelInner>, mut reader: BoxedReader, bus: BusSender) {
    let id = inner.id;
    let mut buf = vec![0u8; CHUNK_SIZE];
    debug!("Stream {} reader started", id);

    loop {
        let read = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => {
                debug!("Stream {} reader cancelled", id);
                return;
            }
            r = reader.read(&mut buf) => r,
        };

        match read {
            Ok(0) => {
                debug!("Stream {} reached EOF", id);
                break;
            }
            Ok(n) => {
                trace!("Stream {} read {} bytes", id, n);
                if !bus.stream(id, StreamEvent::Data(DataEvent::new(buf[..n].to_vec()))) {
                    return;
                }
            }
            Err(e) => {
                warn!("Stream {} read failed: {}", id, e);
                break;
            }
        }
    }

    drop(reader);
    inner.report_disconnect(&bus);
}
