//! BLE Scanner - 发现对端设备
//!
//! 使用 bluer (BlueZ D-Bus) 扫描。对端固件广播固定的名称（默认 `ESP32`），
//! 部分固件还会在广播里带上控制服务 UUID，两者满足其一即可。

use log::{debug, info};

use crate::ble::{PeerLink, SERVICE_UUID};
use crate::config::GatewaySettings;
use bluer::AdapterEvent;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DiscoveredPeer {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// 广播中带有控制服务 UUID
    pub advertises_service: bool,
}

impl DiscoveredPeer {
    pub fn link(&self) -> PeerLink {
        PeerLink::new(&self.address, &self.name)
    }
}

/// 扫描回调接口，用于实时汇报发现的设备
#[async_trait::async_trait]
pub trait ScanCallback: Send + Sync {
    async fn on_device_found(&self, device: DiscoveredPeer);
}

/// 名称匹配（不区分大小写）或广播了控制服务
pub fn matches_peer(name: Option<&str>, uuids: &HashSet<Uuid>, wanted: &str) -> bool {
    let name_matches = name.is_some_and(|n| n.trim().eq_ignore_ascii_case(wanted));
    name_matches || uuids.contains(&SERVICE_UUID)
}

pub struct PeerScanner {
    session: bluer::Session,
}

impl PeerScanner {
    pub async fn new() -> anyhow::Result<Self> {
        let session = bluer::Session::new().await?;
        Ok(Self { session })
    }

    /// 扫描 `timeout` 时长，返回所有匹配 `wanted` 的设备
    ///
    /// `first_only` 为 true 时找到第一个就返回。
    pub async fn scan(
        &self,
        wanted: &str,
        timeout: Duration,
        first_only: bool,
        callback: Option<Arc<dyn ScanCallback>>,
    ) -> anyhow::Result<Vec<DiscoveredPeer>> {
        let adapter = self.session.default_adapter().await?;
        debug!("Powering on adapter '{}' for scan", adapter.name());
        adapter.set_powered(true).await?;

        let mut found: HashMap<bluer::Address, DiscoveredPeer> = HashMap::new();

        // 适配器缓存里的设备（之前配对或扫描过的）
        for addr in adapter.device_addresses().await? {
            let device = adapter.device(addr)?;
            if let Ok(Some(peer)) = inspect(&device, wanted).await {
                debug!("Found {} in adapter cache", peer.address);
                if let Some(ref cb) = callback {
                    cb.on_device_found(peer.clone()).await;
                }
                found.insert(addr, peer);
                if first_only {
                    return Ok(found.into_values().collect());
                }
            }
        }

        let mut discoverer = adapter.discover_devices().await?;
        info!("Scanning for '{}' for {} seconds", wanted, timeout.as_secs());

        let timeout_fut = tokio::time::sleep(timeout);
        tokio::pin!(timeout_fut);

        loop {
            tokio::select! {
                _ = &mut timeout_fut => break,
                event = discoverer.next() => {
                    match event {
                        Some(AdapterEvent::DeviceAdded(addr)) if !found.contains_key(&addr) => {
                            let device = adapter.device(addr)?;
                            if let Ok(Some(peer)) = inspect(&device, wanted).await {
                                if let Some(ref cb) = callback {
                                    cb.on_device_found(peer.clone()).await;
                                }
                                found.insert(addr, peer);
                                if first_only {
                                    break;
                                }
                            }
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        info!("Scan complete: found {} device(s)", found.len());
        Ok(found.into_values().collect())
    }
}

async fn inspect(device: &bluer::Device, wanted: &str) -> anyhow::Result<Option<DiscoveredPeer>> {
    let name = device.name().await?;
    let uuids = device.uuids().await?.unwrap_or_default();
    if !matches_peer(name.as_deref(), &uuids, wanted) {
        return Ok(None);
    }

    let peer = DiscoveredPeer {
        name: name.unwrap_or_else(|| wanted.to_string()),
        address: device.address().to_string(),
        rssi: device.rssi().await?,
        advertises_service: uuids.contains(&SERVICE_UUID),
    };
    info!(
        "Discovered peer: name='{}', addr={}, rssi={:?}",
        peer.name, peer.address, peer.rssi
    );
    Ok(Some(peer))
}

/// 确定要连接的对端：配置了固定地址就直接用，否则按名称扫描
pub async fn resolve_peer(settings: &GatewaySettings) -> anyhow::Result<PeerLink> {
    if let Some(address) = &settings.peer_address {
        debug!("Using configured peer address {}", address);
        return Ok(PeerLink::new(address, &settings.peer_name));
    }

    let scanner = PeerScanner::new().await?;
    let peers = scanner
        .scan(&settings.peer_name, settings.scan_timeout(), true, None)
        .await?;
    peers
        .first()
        .map(DiscoveredPeer::link)
        .ok_or_else(|| anyhow::anyhow!("No device named '{}' found", settings.peer_name))
}
