//! 原生相机控制库边界
//!
//! 拍摄、对焦、实时取景等相机控制操作委托给外部原生库，
//! 核心层只通过这组窄接口与它交互。原生库被视为不透明、
//! 可能缓慢、且不可重入——同一时刻最多一次 init 在途。
//!
//! [`SimulatedControlLibrary`] 是进程内实现，带调用日志，
//! 供无硬件演示和测试使用。

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// 原生库初始化成功
pub const INIT_OK: i32 = 0;
/// 找不到 USB 设备——允许走一次无描述符的通用初始化回退
pub const ERR_USB_FIND: i32 = -105;
/// 底层传输 I/O 失败——走恢复序列
pub const ERR_TRANSFER_IO: i32 = -108;
/// 内核驱动占用接口——恢复序列中触发最后的通用回退
pub const ERR_KERNEL_DRIVER: i32 = -110;
/// 设备被其他持有者占用——走恢复序列
pub const ERR_DEVICE_BUSY: i32 = -112;

/// 初始化返回码的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCodeClass {
    /// 成功
    Success,
    /// 走一次 initGeneric 回退
    UsbFindFallback,
    /// 交给恢复子系统
    Recoverable,
    /// 内核驱动问题（恢复序列内的最后回退信号）
    KernelDriver,
    /// 硬失败，不重试
    Fatal,
}

/// 按原生返回码分类，决定回退/恢复路由
pub fn classify_init_code(code: i32) -> InitCodeClass {
    match code {
        INIT_OK => InitCodeClass::Success,
        ERR_USB_FIND => InitCodeClass::UsbFindFallback,
        ERR_TRANSFER_IO | ERR_DEVICE_BUSY => InitCodeClass::Recoverable,
        ERR_KERNEL_DRIVER => InitCodeClass::KernelDriver,
        _ => InitCodeClass::Fatal,
    }
}

/// 拍摄事件回调契约
///
/// 回调从原生事件线程进入，必须立即返回；实现方应当只做
/// 入队操作（见 capture 模块的通道适配器）。
pub trait CaptureCallback: Send + Sync {
    /// 批量传输结束
    fn on_flush_complete(&self);
    /// 相机侧快门产生了新文件
    fn on_photo_captured(&self, path: &Path, name: &str);
    /// 拍摄失败
    fn on_capture_failed(&self, code: i32);
    /// 传输层脱离（USB 拔出等）
    fn on_transport_detached(&self);
}

/// 原生相机控制库接口
///
/// 调用可能阻塞数秒；不可重入，上层用互斥锁保证串行。
pub trait ControlLibrary: Send + Sync {
    /// 用已打开的设备描述符初始化
    fn init_with_descriptor(&self, fd: RawFd, lib_dir: &Path) -> i32;
    /// 无描述符初始化，库自行枚举设备
    fn init_generic(&self) -> i32;
    /// 关闭并释放原生侧资源
    fn close(&self) -> i32;
    /// 取消所有在途操作
    fn cancel_all_operations(&self);
    /// 启动拍摄事件监听（重复启动返回非 0）
    fn start_event_listener(&self, callback: Arc<dyn CaptureCallback>) -> i32;
    /// 停止拍摄事件监听
    fn stop_event_listener(&self);
}

// ============================================================================
// 进程内模拟实现
// ============================================================================

struct SimState {
    calls: Vec<String>,
    init_results: VecDeque<i32>,
    generic_results: VecDeque<i32>,
    listener: Option<Arc<dyn CaptureCallback>>,
    initialized: bool,
}

/// 模拟的原生控制库
///
/// 初始化结果可以脚本化（依次弹出预设返回码，耗尽后返回成功），
/// 所有入口调用都记录在日志里供顺序断言。
pub struct SimulatedControlLibrary {
    state: Mutex<SimState>,
    /// 模拟拍摄文件的暂存目录
    staging_dir: PathBuf,
}

impl SimulatedControlLibrary {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                calls: Vec::new(),
                init_results: VecDeque::new(),
                generic_results: VecDeque::new(),
                listener: None,
                initialized: false,
            }),
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// 预设后续 init_with_descriptor 的返回码
    pub fn script_init_results(&self, codes: &[i32]) {
        let mut state = self.state.lock().unwrap();
        state.init_results.extend(codes.iter().copied());
    }

    /// 预设后续 init_generic 的返回码
    pub fn script_generic_results(&self, codes: &[i32]) {
        let mut state = self.state.lock().unwrap();
        state.generic_results.extend(codes.iter().copied());
    }

    /// 调用日志快照
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// init（两种入口合计）被调用的次数
    pub fn init_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with("init"))
            .count()
    }

    pub fn listener_active(&self) -> bool {
        self.state.lock().unwrap().listener.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    /// 模拟一次外部快门：把文件写进暂存目录并通知监听者
    ///
    /// 返回是否有监听者收到了通知。
    pub fn trigger_capture(&self, name: &str, content: &[u8]) -> bool {
        let listener = self.state.lock().unwrap().listener.clone();
        match listener {
            Some(cb) => {
                let path = self.staging_dir.join(name);
                if let Err(e) = std::fs::write(&path, content) {
                    log::warn!("Simulated capture staging failed: {}", e);
                    cb.on_capture_failed(-1);
                    return true;
                }
                cb.on_photo_captured(&path, name);
                true
            }
            None => false,
        }
    }

    /// 模拟传输层脱离
    pub fn trigger_detach(&self) {
        let listener = self.state.lock().unwrap().listener.clone();
        if let Some(cb) = listener {
            cb.on_transport_detached();
        }
    }
}

impl Default for SimulatedControlLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLibrary for SimulatedControlLibrary {
    fn init_with_descriptor(&self, _fd: RawFd, _lib_dir: &Path) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.calls.push("init_with_descriptor".to_string());
        let code = state.init_results.pop_front().unwrap_or(INIT_OK);
        state.initialized = code == INIT_OK;
        code
    }

    fn init_generic(&self) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.calls.push("init_generic".to_string());
        let code = state.generic_results.pop_front().unwrap_or(INIT_OK);
        state.initialized = code == INIT_OK;
        code
    }

    fn close(&self) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.calls.push("close".to_string());
        state.initialized = false;
        state.listener = None;
        INIT_OK
    }

    fn cancel_all_operations(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push("cancel_all_operations".to_string());
    }

    fn start_event_listener(&self, callback: Arc<dyn CaptureCallback>) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.calls.push("start_event_listener".to_string());
        if state.listener.is_some() {
            return -1;
        }
        state.listener = Some(callback);
        INIT_OK
    }

    fn stop_event_listener(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stop_event_listener".to_string());
        state.listener = None;
    }
}
