//! 连接状态机
//!
//! 进程内只有一个 [`ConnectionState`]，由 [`ConnectionContext`] 持有，
//! 状态转换是唯一合法的修改路径——任何组件都不得直接赋值。
//! 观察者通过 watch 通道订阅。

mod reconnect;

pub use reconnect::{Reconnect, spawn_reconnector};

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use crate::device::CameraEndpoint;
use crate::error::{CameraError, Result};

/// 连接生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// 连接尝试的准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAdmission {
    /// 已进入 Connecting，调用方继续执行
    Proceed,
    /// 已经连接，调用方直接返回成功
    AlreadyConnected,
}

/// 进程级连接上下文
///
/// 聚合状态、独占资源守卫和重连所需的记忆。组件间传递
/// `Arc<ConnectionContext>` 而不是各自持有全局可变量。
pub struct ConnectionContext {
    state_tx: watch::Sender<ConnectionState>,
    /// 重连尝试串行化标志
    connect_in_progress: AtomicBool,
    auto_reconnect: AtomicBool,
    last_endpoint: Mutex<Option<CameraEndpoint>>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            connect_in_progress: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(true),
            last_endpoint: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 申请开始一次连接尝试
    ///
    /// 只有 `Disconnected` 能进入 `Connecting`；`Error` 先复位再进入。
    /// 已在 `Connecting` 的并发调用得到 [`CameraError::Busy`]，
    /// 不会触发第二次初始化。
    pub fn begin_connecting(&self) -> Result<ConnectAdmission> {
        let mut admission = Err(CameraError::Busy);
        self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Disconnected | ConnectionState::Error => {
                *state = ConnectionState::Connecting;
                admission = Ok(ConnectAdmission::Proceed);
                true
            }
            ConnectionState::Connecting => {
                admission = Err(CameraError::Busy);
                false
            }
            ConnectionState::Connected => {
                admission = Ok(ConnectAdmission::AlreadyConnected);
                false
            }
        });
        admission
    }

    /// Connecting → Connected
    pub fn mark_connected(&self) {
        self.transition(ConnectionState::Connected);
    }

    /// 任意状态 → Disconnected（链路消失时立即生效，无宽限期）
    pub fn mark_disconnected(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// 任意状态 → Error
    pub fn mark_error(&self) {
        self.transition(ConnectionState::Error);
    }

    /// Error → Disconnected，允许下一轮 Connecting
    pub fn reset_error(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Error {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    fn transition(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                log::debug!("Connection state: {:?} -> {:?}", state, next);
                *state = next;
                true
            }
        });
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    /// 记住最近一次成功使用的端点（供重连）
    pub fn remember_endpoint(&self, endpoint: CameraEndpoint) {
        *self.last_endpoint.lock().unwrap() = Some(endpoint);
    }

    pub fn last_endpoint(&self) -> Option<CameraEndpoint> {
        self.last_endpoint.lock().unwrap().clone()
    }

    /// 尝试占用"连接进行中"标志（重连串行化）
    pub(crate) fn try_acquire_connecting(&self) -> bool {
        self.connect_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_connecting(&self) {
        self.connect_in_progress.store(false, Ordering::SeqCst);
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}
