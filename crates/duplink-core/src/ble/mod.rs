pub mod control;
pub mod scanner;

pub use control::{ControlChannel, ControlError, ControlLink, DiscoveryError};
pub use scanner::{DiscoveredPeer, PeerScanner, ScanCallback, resolve_peer};

use uuid::Uuid;

/// 控制服务 (Nordic UART 布局)，必须与对端固件逐位一致
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// 写特征：本端 -> 对端命令
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// 通知特征：对端 -> 本端命令
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);
/// 写入 CCCD 以开启通知的标准值
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// 经典蓝牙串口服务 (SPP)，数据通道连接的就是这个服务
pub const SERIAL_PORT_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// 对端设备身份
///
/// 一次会话内不可变：地址和扫描时看到的名称。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerLink {
    address: String,
    name: String,
}

impl PeerLink {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into().to_uppercase(),
            name: name.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}
