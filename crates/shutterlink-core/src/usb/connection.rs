//! USB 连接管理
//!
//! 打开设备节点 → 取原始描述符 → 交给原生库初始化。整个流程被
//! 单个独占锁保护，并发调用收拢成一次尝试。结果码分类：0 成功；
//! "USB find" 码走一次无描述符回退；其余硬失败（可恢复的由上层
//! 路由到恢复子系统）。
//!
//! 断开顺序是强制的：先停事件监听，再原生 close，最后释放 USB
//! 句柄——倒过来会让原生侧引用已关闭的描述符。

use log::{debug, info, warn};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::capture::{CaptureNotice, ChannelCaptureCallback};
use crate::config::TimingConfig;
use crate::connection::{ConnectAdmission, ConnectionContext};
use crate::control::{ControlLibrary, INIT_OK, InitCodeClass, classify_init_code};
use crate::device::{CameraEndpoint, Transport, UsbDeviceId};
use crate::error::{CameraError, Result};

/// 已打开的 USB 设备句柄
///
/// 设备节点的文件描述符就是交给原生库的 fd；句柄 drop 即释放。
pub struct UsbDeviceHandle {
    pub id: UsbDeviceId,
    file: File,
    /// 恢复序列中激进 claim 住的接口
    interfaces: Vec<nusb::Interface>,
}

impl UsbDeviceHandle {
    /// 从已打开的文件构造（opener 实现和测试用）
    pub fn from_file(id: UsbDeviceId, file: File) -> Self {
        Self {
            id,
            file,
            interfaces: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// 激进 claim 所有候选接口，从竞争驱动手里强制接管
    ///
    /// 返回成功 claim 的数量；单个接口失败只记录不中止。
    pub fn claim_all_interfaces(&mut self) -> Result<usize> {
        let info = nusb::list_devices()?
            .find(|d| {
                d.bus_number() == self.id.bus_number
                    && d.device_address() == self.id.device_address
            })
            .ok_or(CameraError::NoDevice)?;

        let interface_numbers: Vec<u8> = info.interfaces().map(|i| i.interface_number()).collect();
        let device = info.open()?;

        let mut claimed = 0;
        for number in interface_numbers {
            match device.detach_and_claim_interface(number) {
                Ok(interface) => {
                    self.interfaces.push(interface);
                    claimed += 1;
                }
                Err(e) => warn!("Could not claim interface {}: {}", number, e),
            }
        }
        debug!("Claimed {} interface(s) on {}", claimed, self.id);
        Ok(claimed)
    }
}

/// 句柄打开接口（测试注入用）
pub trait HandleOpener: Send + Sync {
    fn open(&self, id: &UsbDeviceId) -> Result<UsbDeviceHandle>;
}

/// 打开 usbfs 设备节点
pub struct DeviceNodeOpener;

impl HandleOpener for DeviceNodeOpener {
    fn open(&self, id: &UsbDeviceId) -> Result<UsbDeviceHandle> {
        let node = id.device_node();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&node)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    CameraError::PermissionDenied {
                        device: id.to_string(),
                    }
                } else {
                    CameraError::Io(e)
                }
            })?;
        debug!("Opened {} (fd {})", node.display(), file.as_raw_fd());
        Ok(UsbDeviceHandle::from_file(*id, file))
    }
}

/// USB 连接管理器
pub struct UsbConnectionManager {
    control: Arc<dyn ControlLibrary>,
    opener: Arc<dyn HandleOpener>,
    config: TimingConfig,
    lib_dir: PathBuf,
    /// 独占初始化锁——同一时刻最多一次原生 init 在途
    init_lock: tokio::sync::Mutex<()>,
    handle: Mutex<Option<UsbDeviceHandle>>,
}

impl UsbConnectionManager {
    pub fn new(control: Arc<dyn ControlLibrary>, config: TimingConfig, lib_dir: &Path) -> Self {
        Self::with_opener(control, Arc::new(DeviceNodeOpener), config, lib_dir)
    }

    pub fn with_opener(
        control: Arc<dyn ControlLibrary>,
        opener: Arc<dyn HandleOpener>,
        config: TimingConfig,
        lib_dir: &Path,
    ) -> Self {
        Self {
            control,
            opener,
            config,
            lib_dir: lib_dir.to_path_buf(),
            init_lock: tokio::sync::Mutex::new(()),
            handle: Mutex::new(None),
        }
    }

    /// 连接 USB 端点
    ///
    /// 并发调用被独占锁收拢：后到者等待锁，看到已连接就直接返回，
    /// 不会产生第二次原生 init。成功后在稳定等待之后启动拍摄事件
    /// 监听（原生事件线程需要前一个调用完全落定，背靠背调用会
    /// 破坏原生线程状态）。
    pub async fn connect(
        &self,
        ctx: &ConnectionContext,
        endpoint: &CameraEndpoint,
        capture_tx: mpsc::Sender<CaptureNotice>,
    ) -> Result<i32> {
        let _guard = self.init_lock.lock().await;

        match ctx.begin_connecting()? {
            ConnectAdmission::AlreadyConnected => return Ok(INIT_OK),
            ConnectAdmission::Proceed => {}
        }

        let Transport::Usb(id) = &endpoint.transport else {
            ctx.mark_error();
            return Err(CameraError::Fatal(format!(
                "not a USB endpoint: {}",
                endpoint
            )));
        };

        match self.try_init(id) {
            Ok(code) => {
                ctx.remember_endpoint(endpoint.clone());
                ctx.mark_connected();
                info!("USB connected to {}", endpoint);

                self.arm_capture_listener(capture_tx).await;
                Ok(code)
            }
            Err(e) => {
                self.release_handle();
                ctx.mark_error();
                Err(e)
            }
        }
    }

    fn try_init(&self, id: &UsbDeviceId) -> Result<i32> {
        let handle = self.opener.open(id)?;
        let fd = handle.raw_fd();
        *self.handle.lock().unwrap() = Some(handle);

        let code = self.control.init_with_descriptor(fd, &self.lib_dir);
        match classify_init_code(code) {
            InitCodeClass::Success => Ok(code),
            InitCodeClass::UsbFindFallback => {
                // 原生库自行枚举的无设备回退，只此一次
                info!("USB find failed (code {}), retrying device-less init", code);
                let fallback = self.control.init_generic();
                if fallback == INIT_OK {
                    Ok(fallback)
                } else {
                    Err(CameraError::InitFailed { code: fallback })
                }
            }
            _ => Err(CameraError::InitFailed { code }),
        }
    }

    /// 稳定等待后启动拍摄事件监听
    ///
    /// 原生事件线程需要前一个 init 调用完全落定才能接受新调用，
    /// 背靠背调用会破坏原生线程状态。
    pub async fn arm_capture_listener(&self, capture_tx: mpsc::Sender<CaptureNotice>) {
        sleep(self.config.init_stabilization).await;
        let callback = Arc::new(ChannelCaptureCallback::new(capture_tx));
        let rc = self.control.start_event_listener(callback);
        if rc != INIT_OK {
            // 已有监听者在工作，按空操作处理
            debug!("Event listener start returned {} (already armed?)", rc);
        }
    }

    /// 断开连接（顺序强制：停监听 → 原生 close → 释放句柄）
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        info!("USB disconnecting");
        self.control.stop_event_listener();
        let rc = self.control.close();
        if rc != INIT_OK {
            warn!("Native close returned {}", rc);
        }
        self.release_handle();
        ctx.mark_disconnected();
    }

    /// 释放宿主侧 USB 句柄
    pub(crate) fn release_handle(&self) {
        *self.handle.lock().unwrap() = None;
    }

    /// 恢复序列成功后装回新句柄
    pub(crate) fn install_handle(&self, handle: UsbDeviceHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn has_handle(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }
}
