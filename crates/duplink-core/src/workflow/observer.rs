//! 会话回调
//!
//! 状态机通过 `SessionObserver` 向外汇报状态行、状态转换、进度和结果。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::logging::LogEntry;
use crate::transfer::TransferDescriptor;
use crate::workflow::SessionState;

/// 会话进度回调
pub trait SessionObserver: Send + Sync {
    /// 状态行，按产生顺序调用
    fn on_status(&self, entry: &LogEntry);
    /// 状态转换
    fn on_state(&self, _from: SessionState, _to: SessionState) {}
    /// 进度更新
    fn on_progress(&self, transferred: u64, total: u64);
    /// 传输成功
    fn on_complete(&self, descriptor: &TransferDescriptor);
    /// 传输失败
    fn on_error(&self, error: &str);
}

impl<T: SessionObserver + ?Sized> SessionObserver for Arc<T> {
    fn on_status(&self, entry: &LogEntry) {
        (**self).on_status(entry);
    }

    fn on_state(&self, from: SessionState, to: SessionState) {
        (**self).on_state(from, to);
    }

    fn on_progress(&self, transferred: u64, total: u64) {
        (**self).on_progress(transferred, total);
    }

    fn on_complete(&self, descriptor: &TransferDescriptor) {
        (**self).on_complete(descriptor);
    }

    fn on_error(&self, error: &str) {
        (**self).on_error(error);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionUpdate {
    Status(LogEntry),
    State { from: SessionState, to: SessionState },
    Progress { transferred: u64, total: u64 },
    Complete(TransferDescriptor),
    Error { message: String },
}

/// 把回调转发到 channel 的简单实现
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionUpdate>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionObserver for ChannelObserver {
    fn on_status(&self, entry: &LogEntry) {
        let _ = self.tx.send(SessionUpdate::Status(entry.clone()));
    }

    fn on_state(&self, from: SessionState, to: SessionState) {
        let _ = self.tx.send(SessionUpdate::State { from, to });
    }

    fn on_progress(&self, transferred: u64, total: u64) {
        let _ = self.tx.send(SessionUpdate::Progress { transferred, total });
    }

    fn on_complete(&self, descriptor: &TransferDescriptor) {
        let _ = self.tx.send(SessionUpdate::Complete(descriptor.clone()));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.send(SessionUpdate::Error {
            message: error.to_string(),
        });
    }
}
