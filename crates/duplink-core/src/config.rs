//! 应用配置和持久化
//!
//! 对端名称/地址、RFCOMM 信道、下载目录等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// 扫描时按此名称识别对端（对端固件广播的名字）
    pub peer_name: String,
    /// 固定的对端地址，设置后跳过扫描
    pub peer_address: Option<String>,
    /// 对端串口服务所在的 RFCOMM 信道
    pub rfcomm_channel: u8,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 空闲时收到对端的文件预告是否直接接收
    pub auto_accept: bool,
    /// 扫描超时（秒）
    pub scan_timeout_secs: u64,
    /// 上传时预告命令与 `download` 之间的间隔（毫秒）
    pub command_gap_ms: u64,
    /// 上传块大小
    pub chunk_size: usize,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            peer_name: "ESP32".to_string(),
            peer_address: None,
            rfcomm_channel: 1,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_accept: false,
            scan_timeout_secs: 10,
            command_gap_ms: 300,
            chunk_size: crate::stream::CHUNK_SIZE,
            verbose: false,
        }
    }
}

impl GatewaySettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duplink")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }
}
