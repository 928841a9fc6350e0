//! Duplink Core Library
//!
//! 双通道蓝牙文件传输: BLE GATT 传命令，经典蓝牙 RFCOMM 传文件内容。
//!
//! # 模块
//!
//! - **ble**: 对端扫描、GATT 控制通道
//! - **stream**: RFCOMM 数据通道
//! - **bus**: 两条通道共用的单消费者事件总线
//! - **transfer**: 命令格式和传输会话（文件读写、计数）
//! - **workflow**: 会话状态机和网关
//!
//! # 使用示例
//!
//! ```ignore
//! use duplink_core::{ChannelObserver, Gateway, GatewaySettings, resolve_peer};
//!
//! let settings = GatewaySettings::load();
//! let peer = resolve_peer(&settings).await?;
//!
//! let (observer, mut updates) = ChannelObserver::new();
//! let gateway = Gateway::connect(&settings, &peer, observer).await?;
//!
//! // 接收对端的下一个文件
//! gateway.handle().request_download(None);
//! while let Some(update) = updates.recv().await {
//!     println!("{:?}", update);
//! }
//! ```

pub mod ble;
pub mod bus;
pub mod config;
pub mod logging;
pub mod stream;
pub mod transfer;
pub mod workflow;

// BLE re-exports
pub use ble::{
    ControlChannel, ControlError, ControlLink, DiscoveredPeer, PeerLink, PeerScanner,
    ScanCallback, SERVICE_UUID, resolve_peer,
};

pub use bus::{BusSender, EventBus, LocalRequest, SessionEvent, StreamEvent, StreamId};
pub use config::GatewaySettings;
pub use logging::{LogEntry, LogLevel};

pub use stream::{RfcommConnector, StreamConnector, StreamError, StreamingChannel};

// Transfer re-exports
pub use transfer::{
    Command, Direction, ProtocolViolation, TransferDescriptor, TransferError, TransferSession,
};

// Workflow re-exports
pub use workflow::{
    ChannelObserver, Gateway, GatewayHandle, SessionObserver, SessionState, SessionUpdate,
    StateMachine,
};
