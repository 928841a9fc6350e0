//! 会话状态机
//!
//! 状态机是事件总线唯一的消费者，独占 [`TransferSession`]，一次处理一个事件:
//!
//! ```text
//! Idle -> AwaitingMeta -> StreamConnecting -> Transferring -> Finalizing -> Idle
//!                                \                 \
//!                                 +-----------------+--> Failed -> Idle
//! ```
//!
//! 下载由本地请求 (或 `auto_accept`) 进入 `AwaitingMeta`，等对端的 `fn:`/`fl:` 预告；
//! 上传在本地发出预告和 `download` 后直接连接数据通道。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::{ControlEvent, DataEvent, EventBus, LocalRequest, SessionEvent, StreamEvent, StreamId};
use crate::config::GatewaySettings;
use crate::logging::{LogEntry, LogLevel};
use crate::stream::StreamingChannel;
use crate::transfer::{Command, Direction, TransferSession};
use crate::workflow::SessionObserver;

/// 对端没有给出文件名、本地也没有指定目标时使用的文件名
pub const FALLBACK_FILE_NAME: &str = "download.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    AwaitingMeta,
    StreamConnecting,
    Transferring,
    Finalizing,
    Failed,
}

impl SessionState {
    /// 是否有已经建立 (或正在建立) 数据通道的传输
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::StreamConnecting | SessionState::Transferring | SessionState::Finalizing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "空闲",
            SessionState::AwaitingMeta => "等待文件信息",
            SessionState::StreamConnecting => "连接数据通道",
            SessionState::Transferring => "传输中",
            SessionState::Finalizing => "收尾",
            SessionState::Failed => "失败",
        };
        f.write_str(name)
    }
}

/// 处理完一个事件后是否继续消费
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub download_dir: PathBuf,
    pub auto_accept: bool,
    /// 预告命令和 `download` 之间的间隔
    pub command_gap: Duration,
    /// 对端发 `send` 时上传的文件
    pub offered_file: Option<PathBuf>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from(&GatewaySettings::default())
    }
}

impl From<&GatewaySettings> for MachineSettings {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            download_dir: settings.download_dir.clone(),
            auto_accept: settings.auto_accept,
            command_gap: settings.command_gap(),
            offered_file: None,
        }
    }
}

pub struct StateMachine<O: SessionObserver> {
    state: SessionState,
    session: TransferSession,
    observer: O,
    settings: MachineSettings,
    /// 本地已请求接收；内层为 None 时按对端文件名存到下载目录
    armed: Option<Option<PathBuf>>,
}

impl<O: SessionObserver> StateMachine<O> {
    pub fn new(session: TransferSession, observer: O, settings: MachineSettings) -> Self {
        Self {
            state: SessionState::Idle,
            session,
            observer,
            settings,
            armed: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// 消费总线直到关闭或收到 `Shutdown`/`ControlLost`
    pub async fn run(mut self, mut bus: EventBus) {
        while let Some(event) = bus.recv().await {
            if self.handle(event).await == Flow::Stop {
                break;
            }
        }
        debug!("State machine stopped in {:?}", self.state);
    }

    /// 处理一个事件
    pub async fn handle(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Control(ControlEvent { text }) => self.on_control(&text).await,
            SessionEvent::Stream { id, event } => self.on_stream(id, event).await,
            SessionEvent::Request(request) => self.on_request(request).await,
            SessionEvent::ControlLost => {
                self.on_control_lost().await;
                return Flow::Stop;
            }
            SessionEvent::Shutdown => {
                self.shutdown().await;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // ========== 控制通道 ==========

    async fn on_control(&mut self, text: &str) {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                self.status(LogEntry::warn(format!("忽略无法识别的命令: {}", e)));
                return;
            }
        };

        match (self.state, command) {
            (SessionState::AwaitingMeta, Command::Meta { name, size }) => {
                self.start_download(name, size).await;
            }
            (SessionState::Idle, Command::Meta { name, size }) if self.settings.auto_accept => {
                self.armed = Some(None);
                self.transition(SessionState::AwaitingMeta);
                self.start_download(name, size).await;
            }
            (SessionState::Idle, Command::Meta { .. }) => {
                self.status(LogEntry::warn(format!(
                    "对端预告了文件但本地没有请求接收，已忽略: {}",
                    text.trim()
                )));
            }
            (SessionState::Idle, Command::Send) => match self.settings.offered_file.clone() {
                Some(path) => self.start_upload(path).await,
                None => self.status(LogEntry::warn("对端请求发送文件，但没有选择要发送的文件")),
            },
            (SessionState::Transferring, Command::Completed) => self.finish().await,
            (state, command) => {
                self.status(LogEntry::warn(format!(
                    "{}状态下忽略命令: {:?}",
                    state, command
                )));
            }
        }
    }

    async fn on_control_lost(&mut self) {
        self.status(LogEntry::warn("BLE 控制通道已断开"));
        if self.state.is_active() {
            self.fail("控制通道断开，传输中止").await;
        } else if self.state == SessionState::AwaitingMeta {
            self.armed = None;
            self.transition(SessionState::Idle);
        }
        self.session.shutdown().await;
    }

    // ========== 数据通道 ==========

    async fn on_stream(&mut self, id: StreamId, event: StreamEvent) {
        if !self.session.is_current(id) {
            debug!("Dropping event from stale stream #{}", id);
            if let StreamEvent::Connected(channel) = event {
                channel.close();
            }
            return;
        }

        match (self.state, event) {
            (SessionState::StreamConnecting, StreamEvent::Connected(channel)) => {
                self.on_connected(channel).await;
            }
            (SessionState::StreamConnecting, StreamEvent::ConnectFailed(e)) => {
                self.fail(&format!("经典蓝牙连接失败: {}", e)).await;
            }
            (SessionState::Transferring, StreamEvent::Data(data)) => self.on_data(data).await,
            (SessionState::Transferring, StreamEvent::Sent(sent)) => {
                if let Some((sent, total)) = self.session.record_sent(sent) {
                    self.observer.on_progress(sent, total);
                }
            }
            (SessionState::Transferring, StreamEvent::Pumped(outcome)) => {
                self.on_pumped(outcome).await;
            }
            (SessionState::StreamConnecting | SessionState::Transferring, StreamEvent::Disconnected) => {
                self.fail("数据通道意外断开").await;
            }
            (state, StreamEvent::Connected(channel)) => {
                debug!("Unexpected stream in {:?}, closing", state);
                channel.close();
            }
            (state, event) => debug!("Ignoring {:?} in {:?}", event, state),
        }
    }

    async fn on_connected(&mut self, channel: StreamingChannel) {
        match self.session.attach_stream(channel) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.fail(&format!("无法启动数据通道: {}", e)).await;
                return;
            }
        }
        self.transition(SessionState::Transferring);

        let direction = self.session.descriptor().map(|d| d.direction);
        match direction {
            Some(Direction::Download) => {
                if let Err(e) = self.session.send_command(&Command::Start).await {
                    self.fail(&format!("发送 start 失败: {}", e)).await;
                }
            }
            Some(Direction::Upload) => {
                if let Err(e) = self.session.start_upload_pump() {
                    self.fail(&format!("无法开始上传: {}", e)).await;
                }
            }
            None => self.fail("没有进行中的传输").await,
        }
    }

    async fn on_data(&mut self, data: DataEvent) {
        let total = match self.session.descriptor() {
            Some(d) if d.direction == Direction::Download => d.total_size,
            _ => {
                debug!("Discarding {} bytes received during upload", data.length);
                return;
            }
        };

        match self.session.ingest(&data.bytes).await {
            Ok(transferred) => self.observer.on_progress(transferred, total),
            Err(e) => self.fail(&format!("写入文件失败: {}", e)).await,
        }
    }

    // ========== 本地请求 ==========

    async fn on_request(&mut self, request: LocalRequest) {
        match request {
            LocalRequest::Download { destination } => {
                if self.state != SessionState::Idle {
                    self.busy();
                    return;
                }
                self.armed = Some(destination);
                self.transition(SessionState::AwaitingMeta);
                self.status(LogEntry::info("等待对端发送文件信息"));
            }
            LocalRequest::Upload { path } => {
                if self.state != SessionState::Idle {
                    self.busy();
                    return;
                }
                self.start_upload(path).await;
            }
            LocalRequest::Offer { path } => {
                let line = match &path {
                    Some(p) => format!("对端请求时将发送: {}", p.display()),
                    None => "已清除待发送文件".to_string(),
                };
                self.settings.offered_file = path;
                self.status(LogEntry::info(line));
            }
            LocalRequest::Cancel => match self.state {
                SessionState::Idle => self.status(LogEntry::info("没有进行中的传输")),
                SessionState::AwaitingMeta => {
                    self.armed = None;
                    self.transition(SessionState::Idle);
                    self.status(LogEntry::info("已取消接收"));
                }
                _ => self.fail("传输已取消").await,
            },
        }
    }

    fn busy(&self) {
        self.status(LogEntry::warn(format!("当前{}，请稍后再试", self.state)));
    }

    // ========== 传输流程 ==========

    async fn start_download(&mut self, name: Option<String>, size: u64) {
        let destination = self.armed.take().flatten();
        let file_name = name
            .or_else(|| {
                destination
                    .as_deref()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        let destination = destination
            .unwrap_or_else(|| self.settings.download_dir.join(sanitize_file_name(&file_name)));

        self.status(LogEntry::info(format!("准备接收 {} ({} 字节)", file_name, size)));
        match self.session.begin_download(&file_name, size, destination).await {
            Ok(_) => self.transition(SessionState::StreamConnecting),
            Err(e) => self.fail(&format!("无法创建目标文件: {}", e)).await,
        }
    }

    async fn start_upload(&mut self, path: PathBuf) {
        let descriptor = match self.session.begin_upload(&path).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let message = format!("无法读取要发送的文件: {}", e);
                self.status(LogEntry::error(&message));
                self.observer.on_error(&message);
                return;
            }
        };

        self.transition(SessionState::AwaitingMeta);
        self.status(LogEntry::info(format!(
            "发送 {} ({} 字节)",
            descriptor.file_name, descriptor.total_size
        )));

        let meta = Command::meta(&descriptor.file_name, descriptor.total_size);
        if let Err(e) = self.session.send_command(&meta).await {
            self.fail(&format!("发送文件信息失败: {}", e)).await;
            return;
        }
        // 对端固件需要一点时间处理预告
        if !self.settings.command_gap.is_zero() {
            tokio::time::sleep(self.settings.command_gap).await;
        }
        if let Err(e) = self.session.send_command(&Command::Download).await {
            self.fail(&format!("发送 download 失败: {}", e)).await;
            return;
        }

        self.session.open_stream();
        self.transition(SessionState::StreamConnecting);
    }

    async fn on_pumped(&mut self, outcome: Result<usize, String>) {
        match outcome {
            Ok(chunks) => {
                self.status(LogEntry::info(format!(
                    "已写入 {} 块，等待对端确认",
                    chunks
                )));
                if let Err(e) = self.session.send_command(&Command::Completed).await {
                    self.fail(&format!("发送 completed 失败: {}", e)).await;
                }
            }
            Err(e) => self.fail(&format!("上传失败: {}", e)).await,
        }
    }

    /// 发送方声明结束后比较字节数
    async fn finish(&mut self) {
        self.transition(SessionState::Finalizing);

        // 上传要求本端已写完全部字节，下载要求计数与预告一致
        let success = match self.session.descriptor() {
            Some(d) => {
                if !d.is_complete() {
                    self.status(LogEntry::error(format!(
                        "{} 不完整: {} / {} 字节 ({:.0}%)",
                        d.file_name,
                        d.transferred,
                        d.total_size,
                        d.progress() * 100.0
                    )));
                }
                d.is_complete()
            }
            None => false,
        };

        match self.session.finalize(success).await {
            Ok(Some(descriptor)) if success => {
                self.status(LogEntry::info(format!(
                    "传输完成: {} ({} 字节)",
                    descriptor.file_name, descriptor.transferred
                )));
                self.observer.on_complete(&descriptor);
            }
            Ok(Some(descriptor)) => {
                self.observer.on_error(&format!(
                    "{} 大小不符，已删除",
                    descriptor.file_name
                ));
            }
            Ok(None) => warn!("Completed without a transfer"),
            Err(e) => {
                let message = format!("保存文件失败: {}", e);
                self.status(LogEntry::error(&message));
                self.observer.on_error(&message);
            }
        }

        self.transition(SessionState::Idle);
    }

    async fn fail(&mut self, reason: &str) {
        self.transition(SessionState::Failed);
        self.status(LogEntry::error(reason));
        self.armed = None;

        if let Err(e) = self.session.finalize(false).await {
            warn!("Cleanup after failure: {}", e);
        }
        self.observer.on_error(reason);
        self.transition(SessionState::Idle);
    }

    async fn shutdown(&mut self) {
        if self.state.is_active() {
            self.fail("会话关闭，传输中止").await;
        } else if self.state == SessionState::AwaitingMeta {
            self.armed = None;
            self.transition(SessionState::Idle);
        }
        self.session.shutdown().await;
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.observer.on_state(from, to);
        self.status(LogEntry::new(LogLevel::Debug, format!("{} → {}", from, to)));
    }

    fn status(&self, entry: LogEntry) {
        let entry = entry.emit();
        self.observer.on_status(&entry);
    }
}

/// 只保留对端文件名的最后一段，防止写到下载目录之外
fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}
