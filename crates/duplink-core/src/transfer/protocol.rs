//! 控制通道命令格式
//!
//! 每条命令是一段 UTF-8 文本，一个 GATT 通知/写入对应一条命令，没有结束符:
//!
//! | 命令 | 含义 |
//! |---|---|
//! | `fn:<name> fl:<size>` | 预告即将传输的文件名和总字节数 |
//! | `download` | 让对端通过数据通道拉取 |
//! | `start` | 让对端通过数据通道推送 |
//! | `send` | 对端请求本端发起自己的流程 |
//! | `completed` | 发送方声明自己这一侧的字节流结束 |
//!
//! 对端固件有时只发 `fl:<size>`，不带文件名，这里一并接受。

use regex::Regex;
use std::sync::LazyLock;

static META_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:fn:(?P<name>.*?)\s+)?fl:\s*(?P<size>\S+)$").unwrap()
});

/// 无法解析的命令文本
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0:?}")]
    Unknown(String),

    #[error("invalid file size in {0:?}")]
    InvalidSize(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Meta { name: Option<String>, size: u64 },
    Download,
    Start,
    Send,
    Completed,
}

impl Command {
    pub fn meta(name: impl Into<String>, size: u64) -> Self {
        Command::Meta {
            name: Some(name.into()),
            size,
        }
    }

    /// 解析一条通知文本
    pub fn parse(text: &str) -> Result<Self, ProtocolViolation> {
        // 对端固件偶尔带上 C 字符串结尾的 NUL
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if text.is_empty() {
            return Err(ProtocolViolation::Empty);
        }

        match text {
            "download" => return Ok(Command::Download),
            "start" => return Ok(Command::Start),
            "send" => return Ok(Command::Send),
            "completed" => return Ok(Command::Completed),
            _ => {}
        }

        let caps = META_PATTERN
            .captures(text)
            .ok_or_else(|| ProtocolViolation::Unknown(text.to_string()))?;

        let size = caps["size"]
            .parse::<u64>()
            .map_err(|_| ProtocolViolation::InvalidSize(text.to_string()))?;
        let name = caps
            .name("name")
            .map(|m| m.as_str().trim().to_string())
            .filter(|n| !n.is_empty());

        Ok(Command::Meta { name, size })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Meta {
                name: Some(name),
                size,
            } => write!(f, "fn:{} fl:{}", name, size),
            Command::Meta { name: None, size } => write!(f, "fl:{}", size),
            Command::Download => f.write_str("download"),
            Command::Start => f.write_str("start"),
            Command::Send => f.write_str("send"),
            Command::Completed => f.write_str("completed"),
        }
    }
}
