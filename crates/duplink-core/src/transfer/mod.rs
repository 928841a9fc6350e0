//! 文件传输模块
//!
//! 包含:
//! - 控制通道文本命令 (`protocol`)
//! - 单次传输的会话：文件读写、进度计数、两个通道的开关 (`session`)

pub mod protocol;
pub mod session;

pub use protocol::{Command, ProtocolViolation};
pub use session::{TransferError, TransferSession};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// 本端 -> 对端
    Upload,
    /// 对端 -> 本端
    Download,
}

/// 单次传输的元数据和进度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    pub file_name: String,
    pub total_size: u64,
    pub direction: Direction,
    /// 实际计数的字节数，可能超过 total_size
    pub transferred: u64,
    /// 上传的源文件或下载的目标文件
    pub path: PathBuf,
}

impl TransferDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        total_size: u64,
        direction: Direction,
        path: PathBuf,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            total_size,
            direction,
            transferred: 0,
            path,
        }
    }

    /// 计数与声明的大小完全一致
    pub fn is_complete(&self) -> bool {
        self.transferred == self.total_size
    }

    /// 0.0 ~ 1.0，超出部分按 1.0 计
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f32 {
        if self.total_size == 0 {
            return 1.0;
        }
        (self.transferred as f64 / self.total_size as f64).min(1.0) as f32
    }
}
