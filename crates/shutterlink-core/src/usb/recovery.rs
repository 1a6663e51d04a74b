//! USB 恢复子系统
//!
//! 只在分类为"可恢复"的初始化失败后调用。一次调用执行一遍
//! 完整的推倒重来序列，绝不无界循环——结果报告给调用方，由它
//! 决定是否向用户提示。
//!
//! 序列：取消在途操作 → 间隔双重 close（容忍错误，强制释放内核级
//! 占用）→ 释放宿主侧 USB 连接 → 系统稳定等待 → 重新枚举 →
//! 权限复查（缺失返回独立的 PermissionRefreshRequired，只有用户能
//! 重新授予）→ 新句柄 + 激进 claim 全部接口 + 接口稳定等待 →
//! 恰好一次原生 init。内核驱动访问失败码触发最后的无设备回退。

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::sleep;

use crate::config::TimingConfig;
use crate::control::{ControlLibrary, INIT_OK, InitCodeClass, classify_init_code};
use crate::device::{Transport, UsbDeviceId};
use crate::error::Result;
use crate::usb::connection::{HandleOpener, UsbConnectionManager};
use crate::usb::registry::{PermissionStatus, UsbRegistry};

/// 恢复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// 原生库重新初始化成功
    Recovered,
    /// 权限已失效，需要用户重新授予（与普通失败区分）
    PermissionRefreshRequired,
    /// 序列执行完毕仍失败，附最后的原生返回码
    Failed(i32),
}

/// 恢复子系统
pub struct RecoverySubsystem {
    control: Arc<dyn ControlLibrary>,
    registry: Arc<UsbRegistry>,
    opener: Arc<dyn HandleOpener>,
    config: TimingConfig,
    lib_dir: PathBuf,
}

impl RecoverySubsystem {
    pub fn new(
        control: Arc<dyn ControlLibrary>,
        registry: Arc<UsbRegistry>,
        opener: Arc<dyn HandleOpener>,
        config: TimingConfig,
        lib_dir: &Path,
    ) -> Self {
        Self {
            control,
            registry,
            opener,
            config,
            lib_dir: lib_dir.to_path_buf(),
        }
    }

    /// 执行一遍恢复序列
    pub async fn run(
        &self,
        manager: &UsbConnectionManager,
        id: &UsbDeviceId,
    ) -> Result<RecoveryOutcome> {
        info!("Starting clean-slate USB recovery for {}", id);

        // (1) 取消在途操作
        self.control.cancel_all_operations();

        // (2) 间隔双重 close，容忍错误
        let rc = self.control.close();
        if rc != INIT_OK {
            debug!("First close returned {} (tolerated)", rc);
        }
        sleep(self.config.recovery_close_gap).await;
        let rc = self.control.close();
        if rc != INIT_OK {
            debug!("Second close returned {} (tolerated)", rc);
        }

        // (3) 释放宿主侧 USB 连接对象
        manager.release_handle();

        // (4) 系统稳定
        sleep(self.config.recovery_settle).await;

        // (5) 重新枚举（绕过缓存）。重枚举后设备地址可能变化，
        //     按 VID/PID 找回同一台设备。
        let devices = self.registry.refresh_camera_devices()?;
        let current_id = devices
            .iter()
            .find_map(|endpoint| match &endpoint.transport {
                Transport::Usb(found)
                    if found.vendor_id == id.vendor_id && found.product_id == id.product_id =>
                {
                    Some(*found)
                }
                _ => None,
            })
            .unwrap_or(*id);

        // (6) 权限复查
        if self.registry.request_permission(&current_id) == PermissionStatus::Denied {
            warn!("Permission lost for {} during recovery", current_id);
            return Ok(RecoveryOutcome::PermissionRefreshRequired);
        }

        // (7) 新句柄，激进 claim，稳定，恰好一次 init
        let mut handle = self.opener.open(&current_id)?;
        match handle.claim_all_interfaces() {
            Ok(claimed) => debug!("Recovery claimed {} interface(s)", claimed),
            Err(e) => warn!("Interface claim failed (tolerated): {}", e),
        }
        sleep(self.config.interface_settle).await;

        let code = self
            .control
            .init_with_descriptor(handle.raw_fd(), &self.lib_dir);
        match classify_init_code(code) {
            InitCodeClass::Success => {
                manager.install_handle(handle);
                info!("Recovery succeeded");
                Ok(RecoveryOutcome::Recovered)
            }
            InitCodeClass::KernelDriver => {
                // 内核驱动访问失败：放弃前的最后一搏，无设备通用 init
                warn!("Kernel driver access failed (code {}), generic fallback", code);
                let fallback = self.control.init_generic();
                if fallback == INIT_OK {
                    manager.install_handle(handle);
                    info!("Recovery succeeded via generic init");
                    Ok(RecoveryOutcome::Recovered)
                } else {
                    Ok(RecoveryOutcome::Failed(fallback))
                }
            }
            _ => {
                warn!("Recovery init failed with code {}", code);
                Ok(RecoveryOutcome::Failed(code))
            }
        }
    }
}
