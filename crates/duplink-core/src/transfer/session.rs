//! 传输会话
//!
//! 独占控制通道和数据通道句柄，负责一次传输的文件读写和计数。
//! 只在事件总线的消费者一侧调用，因此内部不需要锁。
//!
//! 下载: `begin_download` -> 连接成功后 `attach_stream` -> 多次 `ingest` -> `finalize`
//!
//! 上传: `begin_upload` -> `open_stream` -> `attach_stream` -> `start_upload_pump` -> `finalize`

use log::{debug, info, warn};

use crate::ble::{ControlError, ControlLink};
use crate::bus::{BusSender, StreamEvent, StreamId};
use crate::stream::{StreamConnector, StreamError, StreamingChannel};
use crate::transfer::{Command, Direction, TransferDescriptor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;

/// 上传时每次写入数据通道的字节数
pub const DEFAULT_CHUNK_SIZE: usize = crate::stream::CHUNK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Storage error on {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("No transfer in progress")]
    NoTransfer,
}

impl TransferError {
    fn storage(path: &Path, source: std::io::Error) -> Self {
        TransferError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub struct TransferSession {
    control: Box<dyn ControlLink>,
    connector: Arc<dyn StreamConnector>,
    bus: BusSender,
    chunk_size: usize,
    next_stream_id: StreamId,
    /// 已发起连接、尚未收到结果的通道编号
    pending_stream: Option<StreamId>,
    stream: Option<StreamingChannel>,
    descriptor: Option<TransferDescriptor>,
    output: Option<BufWriter<File>>,
    pump: Option<JoinHandle<()>>,
}

impl TransferSession {
    pub fn new(
        control: Box<dyn ControlLink>,
        connector: Arc<dyn StreamConnector>,
        bus: BusSender,
    ) -> Self {
        Self {
            control,
            connector,
            bus,
            chunk_size: DEFAULT_CHUNK_SIZE,
            next_stream_id: 1,
            pending_stream: None,
            stream: None,
            descriptor: None,
            output: None,
            pump: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn descriptor(&self) -> Option<&TransferDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some() || self.pending_stream.is_some()
    }

    /// 当前通道（或正在连接的通道）的编号
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream.as_ref().map(StreamingChannel::id).or(self.pending_stream)
    }

    /// 事件是否属于当前通道
    pub fn is_current(&self, id: StreamId) -> bool {
        self.stream_id() == Some(id)
    }

    /// 通过控制通道发送一条命令
    pub async fn send_command(&self, command: &Command) -> Result<(), TransferError> {
        self.control.send_command(&command.to_string()).await?;
        Ok(())
    }

    /// 准备接收：创建（或清空）目标文件并发起数据通道连接
    pub async fn begin_download(
        &mut self,
        expected_name: &str,
        expected_size: u64,
        destination: PathBuf,
    ) -> Result<StreamId, TransferError> {
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::storage(parent, e))?;
        }
        let file = File::create(&destination)
            .await
            .map_err(|e| TransferError::storage(&destination, e))?;
        debug!("Created empty destination {:?}", destination);

        self.output = Some(BufWriter::new(file));
        self.descriptor = Some(TransferDescriptor::new(
            expected_name,
            expected_size,
            Direction::Download,
            destination,
        ));
        Ok(self.open_stream())
    }

    /// 准备发送：读取源文件大小，数据通道稍后由对端就绪后打开
    pub async fn begin_upload(&mut self, path: &Path) -> Result<TransferDescriptor, TransferError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| TransferError::storage(path, e))?;
        if !metadata.is_file() {
            return Err(TransferError::storage(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let descriptor =
            TransferDescriptor::new(name, metadata.len(), Direction::Upload, path.to_path_buf());
        self.descriptor = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// 在独立任务中连接数据通道，结果以 `Connected`/`ConnectFailed` 投递到总线
    pub fn open_stream(&mut self) -> StreamId {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.pending_stream = Some(id);

        let connector = self.connector.clone();
        let bus = self.bus.clone();
        info!("Opening {} stream #{}", connector.name(), id);
        tokio::spawn(async move {
            let event = match connector.connect(id).await {
                Ok(channel) => StreamEvent::Connected(channel),
                Err(e) => StreamEvent::ConnectFailed(e.to_string()),
            };
            if !bus.stream(id, event.clone()) {
                if let StreamEvent::Connected(channel) = event {
                    channel.close();
                }
            }
        });
        id
    }

    /// 接管连接成功的通道并启动读循环
    ///
    /// 不是当前等待的通道时直接关闭，返回 false。
    pub fn attach_stream(&mut self, channel: StreamingChannel) -> Result<bool, TransferError> {
        if self.pending_stream != Some(channel.id()) {
            debug!("Closing stale stream #{}", channel.id());
            channel.close();
            return Ok(false);
        }
        self.pending_stream = None;
        channel.start_reader(self.bus.clone())?;
        self.stream = Some(channel);
        Ok(true)
    }

    /// 追加一块下载数据，返回累计字节数
    pub async fn ingest(&mut self, bytes: &[u8]) -> Result<u64, TransferError> {
        let descriptor = self
            .descriptor
            .as_mut()
            .filter(|d| d.direction == Direction::Download)
            .ok_or(TransferError::NoTransfer)?;
        let output = self.output.as_mut().ok_or(TransferError::NoTransfer)?;

        output
            .write_all(bytes)
            .await
            .map_err(|e| TransferError::storage(&descriptor.path, e))?;

        // 多出来的字节照样写入，但完整性判断只看计数
        descriptor.transferred += bytes.len() as u64;
        if descriptor.transferred > descriptor.total_size {
            warn!(
                "Received {} bytes, more than announced {}",
                descriptor.transferred, descriptor.total_size
            );
        }
        Ok(descriptor.transferred)
    }

    /// 在独立任务中按固定块大小把源文件顺序写入数据通道
    ///
    /// 每写完一块投递 `Sent`，结束时投递 `Pumped`。写入阻塞时关闭通道即可让任务退出，
    /// 状态机因此可以继续处理取消和关闭。
    pub fn start_upload_pump(&mut self) -> Result<(), TransferError> {
        let stream = self.stream.clone().ok_or(StreamError::Closed)?;
        let path = self
            .descriptor
            .as_ref()
            .filter(|d| d.direction == Direction::Upload)
            .map(|d| d.path.clone())
            .ok_or(TransferError::NoTransfer)?;

        let bus = self.bus.clone();
        let chunk_size = self.chunk_size;
        self.pump = Some(tokio::spawn(async move {
            let id = stream.id();
            let result = pump_file(&stream, &path, chunk_size, |sent| {
                bus.stream(id, StreamEvent::Sent(sent));
            })
            .await;
            bus.stream(id, StreamEvent::Pumped(result.map_err(|e| e.to_string())));
        }));
        Ok(())
    }

    /// 记录上传任务汇报的累计字节数，返回 (已发送, 总数)
    pub fn record_sent(&mut self, sent: u64) -> Option<(u64, u64)> {
        let descriptor = self
            .descriptor
            .as_mut()
            .filter(|d| d.direction == Direction::Upload)?;
        descriptor.transferred = sent;
        Some((sent, descriptor.total_size))
    }

    /// 结束当前传输
    ///
    /// 成功: 关闭目标文件；失败: 关闭并删除下载的半成品。数据通道总是关闭。
    /// 每次传输只生效一次，之后的调用返回 `Ok(None)`。
    pub async fn finalize(
        &mut self,
        success: bool,
    ) -> Result<Option<TransferDescriptor>, TransferError> {
        self.close_stream();

        let Some(descriptor) = self.descriptor.take() else {
            return Ok(None);
        };
        let output = self.output.take();

        if descriptor.direction == Direction::Upload {
            return Ok(Some(descriptor));
        }

        let mut flush_error = None;
        if let Some(mut output) = output {
            if let Err(e) = output.shutdown().await {
                flush_error = Some(e);
            }
        }

        match (success, flush_error) {
            (true, None) => Ok(Some(descriptor)),
            (true, Some(e)) => {
                remove_partial(&descriptor.path).await;
                Err(TransferError::storage(&descriptor.path, e))
            }
            (false, e) => {
                if let Some(e) = e {
                    debug!("Flush of discarded download failed: {}", e);
                }
                remove_partial(&descriptor.path).await;
                Ok(Some(descriptor))
            }
        }
    }

    /// 关闭并清理全部资源，包括控制通道
    pub async fn shutdown(&mut self) {
        if self.descriptor.is_some() {
            if let Err(e) = self.finalize(false).await {
                warn!("Cleanup failed: {}", e);
            }
        }
        self.close_stream();
        self.control.close().await;
    }

    fn close_stream(&mut self) {
        self.pending_stream = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }
}

async fn pump_file<F>(
    stream: &StreamingChannel,
    path: &Path,
    chunk_size: usize,
    mut on_sent: F,
) -> Result<usize, TransferError>
where
    F: FnMut(u64),
{
    let mut file = File::open(path)
        .await
        .map_err(|e| TransferError::storage(path, e))?;
    let mut buffer = vec![0u8; chunk_size];
    let mut chunks = 0;
    let mut sent = 0u64;

    loop {
        let n = read_chunk(&mut file, &mut buffer)
            .await
            .map_err(|e| TransferError::storage(path, e))?;
        if n == 0 {
            break;
        }
        stream.write(&buffer[..n]).await?;
        chunks += 1;
        sent += n as u64;
        on_sent(sent);
    }

    info!("Pumped {} bytes in {} chunks", sent, chunks);
    Ok(chunks)
}

/// 尽量填满缓冲区，返回 0 表示 EOF
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => info!("Deleted partial file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete partial file {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, SessionEvent};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct NullControl {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ControlLink for Arc<NullControl> {
        async fn send_command(&self, text: &str) -> Result<(), ControlError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    /// 对端一侧保存在连接器里，测试期间保持连接
    #[derive(Default)]
    struct DuplexConnector {
        peers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    #[async_trait::async_trait]
    impl StreamConnector for DuplexConnector {
        async fn connect(&self, id: StreamId) -> Result<StreamingChannel, StreamError> {
            let (local, peer) = tokio::io::duplex(1 << 16);
            self.peers.lock().unwrap().push(peer);
            Ok(StreamingChannel::from_io(id, local))
        }

        fn name(&self) -> &'static str {
            "duplex"
        }
    }

    fn session(bus: &EventBus) -> (TransferSession, Arc<NullControl>) {
        let control = Arc::new(NullControl::default());
        let session = TransferSession::new(
            Box::new(control.clone()),
            Arc::new(DuplexConnector::default()),
            bus.sender(),
        );
        (session, control)
    }

    async fn connected(bus: &mut EventBus) -> StreamingChannel {
        let event = tokio::time::timeout(Duration::from_secs(1), bus.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Stream {
                event: StreamEvent::Connected(channel),
                ..
            } => channel,
            other => panic!("expected Connected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_download_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"stale contents").unwrap();

        let mut bus = EventBus::new();
        let (mut session, _) = session(&bus);
        let id = session.begin_download("a.bin", 4, path.clone()).await.unwrap();
        assert!(session.is_current(id));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        let channel = connected(&mut bus).await;
        assert!(session.attach_stream(channel).unwrap());

        assert_eq!(session.ingest(b"ab").await.unwrap(), 2);
        assert_eq!(session.ingest(b"cd").await.unwrap(), 4);

        let done = session.finalize(true).await.unwrap().unwrap();
        assert!(done.is_complete());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
        assert!(!session.has_stream());
    }

    #[tokio::test]
    async fn test_failed_download_deletes_partial_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");

        let bus = EventBus::new();
        let (mut session, _) = session(&bus);
        session.begin_download("b.bin", 10, path.clone()).await.unwrap();
        session.ingest(b"12345").await.unwrap();

        assert!(session.finalize(false).await.unwrap().is_some());
        assert!(!path.exists());
        assert!(session.finalize(false).await.unwrap().is_none());
        assert!(session.finalize(true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_excess_bytes_are_written_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");

        let bus = EventBus::new();
        let (mut session, _) = session(&bus);
        session.begin_download("c.bin", 2, path.clone()).await.unwrap();
        assert_eq!(session.ingest(b"xyz").await.unwrap(), 3);
        assert!(!session.descriptor().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_storage_error_when_destination_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let (mut session, _) = session(&bus);

        let result = session
            .begin_download("x", 1, dir.path().to_path_buf())
            .await;
        assert!(matches!(result, Err(TransferError::Storage { .. })));
        assert!(!session.has_stream());
        assert!(session.descriptor().is_none());
    }

    #[tokio::test]
    async fn test_stale_stream_is_closed() {
        let bus = EventBus::new();
        let (mut session, _) = session(&bus);
        let (local, _peer) = tokio::io::duplex(64);
        let stale = StreamingChannel::from_io(42, local);

        assert!(!session.attach_stream(stale.clone()).unwrap());
        assert!(!stale.is_open());
    }

    #[tokio::test]
    async fn test_begin_upload_reads_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("up.txt");
        std::fs::write(&path, vec![1u8; 3000]).unwrap();

        let bus = EventBus::new();
        let (mut session, _) = session(&bus);
        let descriptor = session.begin_upload(&path).await.unwrap();
        assert_eq!(descriptor.file_name, "up.txt");
        assert_eq!(descriptor.total_size, 3000);
        assert_eq!(descriptor.direction, Direction::Upload);
        assert!(!session.has_stream());
    }

    #[tokio::test]
    async fn test_begin_upload_missing_file() {
        let bus = EventBus::new();
        let (mut session, _) = session(&bus);
        let result = session.begin_upload(Path::new("/nonexistent/file")).await;
        assert!(matches!(result, Err(TransferError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_upload_pump_runs_off_the_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("up.bin");
        std::fs::write(&path, vec![9u8; 2500]).unwrap();

        let mut bus = EventBus::new();
        let (mut session, _) = session(&bus);
        session.begin_upload(&path).await.unwrap();
        session.open_stream();
        let channel = connected(&mut bus).await;
        assert!(session.attach_stream(channel).unwrap());
        session.start_upload_pump().unwrap();

        let mut sent = Vec::new();
        let outcome = loop {
            let event = tokio::time::timeout(Duration::from_secs(1), bus.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                SessionEvent::Stream {
                    event: StreamEvent::Sent(n),
                    ..
                } => {
                    sent.push(n);
                    session.record_sent(n);
                }
                SessionEvent::Stream {
                    event: StreamEvent::Pumped(outcome),
                    ..
                } => break outcome,
                other => panic!("unexpected {:?}", other),
            }
        };

        assert_eq!(outcome, Ok(3));
        assert_eq!(sent, vec![1024, 2048, 2500]);
        assert!(session.descriptor().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_upload_pump_requires_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("up.bin");
        std::fs::write(&path, b"abc").unwrap();

        let bus = EventBus::new();
        let (mut session, _) = session(&bus);
        session.begin_upload(&path).await.unwrap();
        assert!(matches!(
            session.start_upload_pump(),
            Err(TransferError::Stream(StreamError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_send_command_formats_text() {
        let bus = EventBus::new();
        let (session, control) = session(&bus);
        session
            .send_command(&Command::meta("a.bin", 500))
            .await
            .unwrap();
        session.send_command(&Command::Download).await.unwrap();
        assert_eq!(
            *control.sent.lock().unwrap(),
            vec!["fn:a.bin fl:500".to_string(), "download".to_string()]
        );
    }
}
