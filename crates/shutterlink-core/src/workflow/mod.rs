//! 连接工作流
//!
//! 高层 API 封装完整的连接流程：
//!
//! - **usb**: 注册表 → 权限 → 连接管理器 →（必要时）恢复 → 拍摄管线
//! - **wifi**: 网络观察 → 发现 → 会话握手 →（必要时）厂商批准 →
//!   状态机 → 拍摄管线

pub mod usb;
pub mod wifi;

pub use usb::UsbConnector;
pub use wifi::WifiConnector;

use tokio::sync::mpsc;

use crate::capture::CapturedFile;
use crate::device::CameraEndpoint;

/// 连接进度回调
pub trait ConnectProgress: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str);
    /// 连接建立
    fn on_connected(&self, endpoint: &CameraEndpoint);
    /// 连接流程失败
    fn on_error(&self, error: &str);
}

/// 静默回调（自动重连等后台路径使用）
pub struct SilentProgress;

impl ConnectProgress for SilentProgress {
    fn on_status(&self, _status: &str) {}
    fn on_connected(&self, _endpoint: &CameraEndpoint) {}
    fn on_error(&self, _error: &str) {}
}

/// 进度事件
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Status(String),
    Connected(CameraEndpoint),
    File(CapturedFile),
    Error(String),
}

/// 简化的通道回调实现
pub struct SimpleProgress {
    tx: mpsc::Sender<ProgressEvent>,
}

impl SimpleProgress {
    pub fn new() -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl ConnectProgress for SimpleProgress {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(ProgressEvent::Status(status.to_string()));
    }

    fn on_connected(&self, endpoint: &CameraEndpoint) {
        let _ = self
            .tx
            .try_send(ProgressEvent::Connected(endpoint.clone()));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(ProgressEvent::Error(error.to_string()));
    }
}
