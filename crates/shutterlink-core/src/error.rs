//! 错误类型
//!
//! 按照恢复策略分类：瞬态 I/O 可重试，权限问题必须交还用户处理，
//! 协议违例中止当前会话但不崩溃，资源占用要求调用方等待。

use std::time::Duration;

/// 核心错误枚举
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// 瞬态 I/O 故障，可带退避重试
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 读取超时（有界超时到期，按失败处理）
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// USB 权限缺失，只有用户能重新授予
    #[error("USB permission denied for {device}")]
    PermissionDenied { device: String },

    /// 意外的包类型/长度，中止当前会话
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// 另一个初始化/会话正在进行中
    #[error("another initialization is already in progress")]
    Busy,

    /// 相机返回了非 OK 的响应码
    #[error("camera returned response code {code:#06x}")]
    ResponseCode { code: u16 },

    /// 原生库初始化返回了错误码
    #[error("native init failed with code {code}")]
    InitFailed { code: i32 },

    /// 对端以 InitFail 拒绝握手
    #[error("peer rejected handshake (reason {reason})")]
    HandshakeRejected { reason: u32 },

    /// 找不到候选相机设备
    #[error("no camera device found")]
    NoDevice,

    /// 会话已被拆除，挂起的操作快速失败
    #[error("session closed")]
    SessionClosed,

    /// 不可恢复的设备/驱动错误
    #[error("fatal device error: {0}")]
    Fatal(String),
}

impl CameraError {
    /// 是否值得带退避重试
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Io(_) | CameraError::Timeout(_))
    }

    /// 是否需要用户介入（权限重新授予）
    pub fn is_permission(&self) -> bool {
        matches!(self, CameraError::PermissionDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;
