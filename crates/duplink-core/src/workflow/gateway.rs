//! 网关
//!
//! 把控制通道、RFCOMM 连接器、事件总线和状态机组装起来，
//! 状态机在后台任务里运行，外部通过 [`GatewayHandle`] 投递请求。

use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::ble::{ControlChannel, ControlLink, PeerLink};
use crate::bus::{BusSender, EventBus, LocalRequest, SessionEvent};
use crate::config::GatewaySettings;
use crate::logging::LogEntry;
use crate::stream::{RfcommConnector, StreamConnector};
use crate::transfer::TransferSession;
use crate::workflow::{MachineSettings, SessionObserver, StateMachine};

/// 向运行中的状态机投递本地请求，可以克隆
///
/// 所有方法在状态机已退出时返回 false。
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    bus: BusSender,
}

impl GatewayHandle {
    /// 准备接收下一个文件；`destination` 为 None 时存到下载目录
    pub fn request_download(&self, destination: Option<PathBuf>) -> bool {
        self.bus.request(LocalRequest::Download { destination })
    }

    pub fn request_upload(&self, path: impl Into<PathBuf>) -> bool {
        self.bus.request(LocalRequest::Upload { path: path.into() })
    }

    /// 设置对端发 `send` 时要上传的文件
    pub fn offer_file(&self, path: Option<PathBuf>) -> bool {
        self.bus.request(LocalRequest::Offer { path })
    }

    pub fn cancel(&self) -> bool {
        self.bus.request(LocalRequest::Cancel)
    }

    pub fn shutdown(&self) -> bool {
        self.bus.post(SessionEvent::Shutdown)
    }

    pub fn is_running(&self) -> bool {
        !self.bus.is_closed()
    }
}

pub struct Gateway {
    handle: GatewayHandle,
    machine: JoinHandle<()>,
    notifications: Option<JoinHandle<()>>,
}

impl Gateway {
    /// 连接对端的 GATT 控制通道并启动状态机
    pub async fn connect<O>(
        settings: &GatewaySettings,
        peer: &PeerLink,
        observer: O,
    ) -> anyhow::Result<Self>
    where
        O: SessionObserver + 'static,
    {
        observer.on_status(&LogEntry::info(format!("正在连接 {}", peer)).emit());

        let control = ControlChannel::connect(peer, settings.scan_timeout()).await?;
        if let Err(e) = control.enable_notifications().await {
            control.close().await;
            return Err(e.into());
        }

        let connector = match RfcommConnector::for_peer(peer, settings.rfcomm_channel) {
            Ok(connector) => connector,
            Err(e) => {
                control.close().await;
                return Err(e.into());
            }
        };

        let bus = EventBus::new();
        let notifications = match control.forward_notifications(bus.sender()).await {
            Ok(task) => task,
            Err(e) => {
                control.close().await;
                return Err(e.into());
            }
        };

        observer.on_status(&LogEntry::info(format!("已连接 {}", peer)).emit());
        let mut gateway = Self::start(
            Box::new(control),
            Arc::new(connector),
            settings,
            observer,
            bus,
        );
        gateway.notifications = Some(notifications);
        Ok(gateway)
    }

    /// 用现成的控制通道和连接器启动状态机
    pub fn start<O>(
        control: Box<dyn ControlLink>,
        connector: Arc<dyn StreamConnector>,
        settings: &GatewaySettings,
        observer: O,
        bus: EventBus,
    ) -> Self
    where
        O: SessionObserver + 'static,
    {
        let handle = GatewayHandle { bus: bus.sender() };
        let session =
            TransferSession::new(control, connector, bus.sender()).with_chunk_size(settings.chunk_size);
        let machine = StateMachine::new(session, observer, MachineSettings::from(settings));

        info!("Session started");
        Self {
            handle,
            machine: tokio::spawn(machine.run(bus)),
            notifications: None,
        }
    }

    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// 等待状态机退出（控制通道断开或收到 shutdown）
    pub async fn wait(mut self) {
        self.join().await;
    }

    /// 中止进行中的传输、断开两条通道并等待状态机退出
    pub async fn shutdown(mut self) {
        self.handle.shutdown();
        self.join().await;
    }

    async fn join(&mut self) {
        if let Err(e) = (&mut self.machine).await {
            warn!("State machine task failed: {}", e);
        }
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}
