//! 工作流模块
//!
//! 状态机驱动完整的接收/发送流程，网关负责把它和两条蓝牙通道接起来。

pub mod gateway;
pub mod machine;
pub mod observer;

pub use gateway::{Gateway, GatewayHandle};
pub use machine::{Flow, MachineSettings, SessionState, StateMachine};
pub use observer::{ChannelObserver, SessionObserver, SessionUpdate};
