//! 终端输出
//!
//! 普通模式按图标打印状态行和进度，`--json` 模式每个更新一行 JSON。

use duplink_core::{DiscoveredPeer, LogLevel, ScanCallback, SessionUpdate};

pub struct Printer {
    json: bool,
    /// 比这一级更详细的状态行不打印
    level: LogLevel,
    /// 上次打印的进度百分比（按 10% 取整）
    last_step: Option<u64>,
}

impl Printer {
    pub fn new(json: bool, level: LogLevel) -> Self {
        Self {
            json,
            level,
            last_step: None,
        }
    }

    fn shows(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    pub fn print(&mut self, update: &SessionUpdate) {
        if self.json {
            match serde_json::to_string(update) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to encode update: {}", e),
            }
            return;
        }

        match update {
            SessionUpdate::Status(entry) => {
                if self.shows(entry.level) {
                    println!("{}", entry);
                }
            }
            SessionUpdate::State { .. } => {}
            SessionUpdate::Progress { transferred, total } => {
                let step = progress_step(*transferred, *total);
                if self.last_step != Some(step) {
                    self.last_step = Some(step);
                    println!("📦 {:>3}% ({}/{} 字节)", step, transferred, total);
                }
            }
            SessionUpdate::Complete(descriptor) => {
                self.last_step = None;
                println!(
                    "✅ {} ({} 字节) -> {}",
                    descriptor.file_name,
                    descriptor.transferred,
                    descriptor.path.display()
                );
            }
            SessionUpdate::Error { message } => {
                self.last_step = None;
                eprintln!("❌ {}", message);
            }
        }
    }
}

/// 0, 10, ..., 100；超出声明大小按 100 计
fn progress_step(transferred: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    (transferred.saturating_mul(10) / total).min(10) * 10
}

/// 扫描时实时打印发现的设备
pub struct ScanPrinter {
    pub json: bool,
}

#[async_trait::async_trait]
impl ScanCallback for ScanPrinter {
    async fn on_device_found(&self, device: DiscoveredPeer) {
        if self.json {
            if let Ok(line) = serde_json::to_string(&device) {
                println!("{}", line);
            }
        } else {
            println!(
                "   {} ({}) rssi={}",
                device.name,
                device.address,
                device
                    .rssi
                    .map_or_else(|| "-".to_string(), |r| r.to_string())
            );
        }
    }
}
