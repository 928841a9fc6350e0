//! BLE 控制通道
//!
//! 流程:
//! 1. 按地址找到对端外设（找不到时按服务 UUID 短暂扫描）
//! 2. 连接并发现服务，定位写特征和通知特征
//! 3. 通过 CCCD 开启通知
//! 4. 每个通知解码为 UTF-8 文本，作为一条 `ControlEvent` 投递到事件总线
//!
//! 驱动本身不做任何协议判断，只负责字节与文本之间的转换。

use log::{debug, info, trace, warn};

use crate::ble::{
    CCCD_UUID, ENABLE_NOTIFICATION_VALUE, NOTIFY_CHAR_UUID, PeerLink, SERVICE_UUID,
    WRITE_CHAR_UUID,
};
use crate::bus::{BusSender, SessionEvent};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

/// 服务或特征缺失
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
}

/// 控制通道错误
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Descriptor not found: {0}")]
    DescriptorNotFound(Uuid),

    #[error("Control channel is closed")]
    Closed,

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// 会话通过它向对端发送命令
#[async_trait::async_trait]
pub trait ControlLink: Send + Sync {
    async fn send_command(&self, text: &str) -> Result<(), ControlError>;

    /// 幂等
    async fn close(&self);
}

/// 通知内容按 UTF-8 解码，非法字节替换为 U+FFFD
pub fn decode_notification(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

pub struct ControlChannel {
    peripheral: PlatformPeripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    closed: Arc<AtomicBool>,
}

impl ControlChannel {
    /// 连接对端并完成服务/特征发现
    pub async fn connect(peer: &PeerLink, scan_timeout: Duration) -> Result<Self, ControlError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ControlError::NoAdapter)?;

        let peripheral = find_device(&adapter, peer.address(), scan_timeout).await?;

        if !peripheral.is_connected().await? {
            info!("Connecting to {}", peer);
            peripheral.connect().await?;
        }

        debug!("Discovering services...");
        peripheral.discover_services().await?;

        let (write_char, notify_char) = locate_characteristics(&peripheral.services())?;
        info!("Control channel ready on {}", peer);

        Ok(Self {
            peripheral,
            write_char,
            notify_char,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 开启通知特征的通知
    ///
    /// 订阅时由 BLE 协议栈把 `ENABLE_NOTIFICATION_VALUE` 写入 CCCD
    /// (BlueZ 不允许客户端直接写 CCCD)。
    pub async fn enable_notifications(&self) -> Result<(), ControlError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ControlError::Closed);
        }
        let cccd = find_cccd(&self.notify_char)?;

        debug!(
            "Subscribing to {} (stack writes {:02x?} to CCCD {})",
            self.notify_char.uuid, ENABLE_NOTIFICATION_VALUE, cccd
        );
        self.peripheral.subscribe(&self.notify_char).await?;
        Ok(())
    }

    /// 启动通知转发任务
    ///
    /// 通知流结束（对端断开）时投递一次 `ControlLost`；本地关闭则不投递。
    pub async fn forward_notifications(
        &self,
        bus: BusSender,
    ) -> Result<JoinHandle<()>, ControlError> {
        let mut notifications = self.peripheral.notifications().await?;
        let notify_uuid = self.notify_char.uuid;
        let closed = self.closed.clone();

        Ok(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                let text = decode_notification(&notification.value);
                trace!("<- {:?}", text);
                if !bus.control(text) {
                    return;
                }
            }

            if !closed.load(Ordering::SeqCst) {
                warn!("Notification stream ended");
                bus.post(SessionEvent::ControlLost);
            }
        }))
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ControlLink for ControlChannel {
    async fn send_command(&self, text: &str) -> Result<(), ControlError> {
        if !self.is_open() {
            return Err(ControlError::Closed);
        }
        debug!("-> {}", text);
        self.peripheral
            .write(&self.write_char, text.as_bytes(), WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing control channel");
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("GATT disconnect failed: {}", e);
        }
    }
}

async fn find_device(
    adapter: &Adapter,
    address: &str,
    scan_timeout: Duration,
) -> Result<PlatformPeripheral, ControlError> {
    if let Some(p) = lookup_peripheral(adapter, address).await? {
        return Ok(p);
    }

    // 适配器缓存里没有，按服务 UUID 扫描一会儿
    debug!("{} not cached, scanning for up to {:?}", address, scan_timeout);
    adapter
        .start_scan(ScanFilter {
            services: vec![SERVICE_UUID],
        })
        .await?;

    let deadline = time::Instant::now() + scan_timeout;
    let mut found = None;
    while time::Instant::now() < deadline {
        time::sleep(Duration::from_millis(500)).await;
        if let Some(p) = lookup_peripheral(adapter, address).await? {
            found = Some(p);
            break;
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    found.ok_or_else(|| ControlError::DeviceNotFound(address.to_string()))
}

async fn lookup_peripheral(
    adapter: &Adapter,
    address: &str,
) -> Result<Option<PlatformPeripheral>, ControlError> {
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            if props.address.to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

fn locate_characteristics(
    services: &BTreeSet<Service>,
) -> Result<(Characteristic, Characteristic), DiscoveryError> {
    let service = services
        .iter()
        .find(|s| s.uuid == SERVICE_UUID)
        .ok_or(DiscoveryError::ServiceNotFound(SERVICE_UUID))?;

    let find = |uuid: Uuid| {
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(DiscoveryError::CharacteristicNotFound(uuid))
    };

    Ok((find(WRITE_CHAR_UUID)?, find(NOTIFY_CHAR_UUID)?))
}

/// 通知特征上的 CCCD；没有 CCCD 的特征无法开启通知
fn find_cccd(characteristic: &Characteristic) -> Result<Uuid, ControlError> {
    characteristic
        .descriptors
        .iter()
        .map(|d| d.uuid)
        .find(|uuid| *uuid == CCCD_UUID)
        .ok_or(ControlError::DescriptorNotFound(CCCD_UUID))
}
