//! USB 连接工作流
//!
//! 1. 枚举候选相机（或用调用方指定的端点）
//! 2. 权限检查——缺失时交还用户，不自动重试
//! 3. 连接管理器初始化原生库
//! 4. 可恢复失败路由到恢复子系统，恢复成功后补齐监听
//! 5. 拍摄管线消费原生回调暂存的文件
//! 6. 热插拔观察：活动设备拔出即拆除连接

use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capture::{CapturePipeline, StagedFileFetcher};
use crate::config::{AppSettings, TimingConfig};
use crate::connection::ConnectionContext;
use crate::control::{ControlLibrary, InitCodeClass, classify_init_code};
use crate::device::{CameraEndpoint, Transport};
use crate::error::CameraError;
use crate::usb::{
    PermissionStatus, RecoveryOutcome, RecoverySubsystem, UsbConnectionManager, UsbHotplugEvent,
    UsbRegistry,
};
use crate::workflow::ConnectProgress;

/// USB 连接工作流
pub struct UsbConnector {
    registry: Arc<UsbRegistry>,
    manager: Arc<UsbConnectionManager>,
    recovery: Arc<RecoverySubsystem>,
    pipeline: Arc<CapturePipeline>,
    ctx: Arc<ConnectionContext>,
    config: TimingConfig,
    detach_watch: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    listener: tokio::sync::Mutex<Option<crate::capture::ListenerHandle>>,
}

impl UsbConnector {
    pub fn new(
        control: Arc<dyn ControlLibrary>,
        settings: &AppSettings,
        config: TimingConfig,
        lib_dir: &Path,
    ) -> Self {
        let registry = Arc::new(UsbRegistry::new(config.clone()));
        let opener: Arc<dyn crate::usb::HandleOpener> = Arc::new(crate::usb::DeviceNodeOpener);
        Self::with_parts(control, registry, opener, settings, config, lib_dir)
    }

    /// 组件注入构造（测试）
    pub fn with_parts(
        control: Arc<dyn ControlLibrary>,
        registry: Arc<UsbRegistry>,
        opener: Arc<dyn crate::usb::HandleOpener>,
        settings: &AppSettings,
        config: TimingConfig,
        lib_dir: &Path,
    ) -> Self {
        let manager = Arc::new(UsbConnectionManager::with_opener(
            control.clone(),
            opener.clone(),
            config.clone(),
            lib_dir,
        ));
        let recovery = Arc::new(RecoverySubsystem::new(
            control,
            registry.clone(),
            opener,
            config.clone(),
            lib_dir,
        ));
        let pipeline = Arc::new(CapturePipeline::new(
            settings.download_dir.clone(),
            config.clone(),
        ));
        Self {
            registry,
            manager,
            recovery,
            pipeline,
            ctx: Arc::new(ConnectionContext::new()),
            config,
            detach_watch: tokio::sync::Mutex::new(None),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    pub fn context(&self) -> Arc<ConnectionContext> {
        self.ctx.clone()
    }

    pub fn pipeline(&self) -> Arc<CapturePipeline> {
        self.pipeline.clone()
    }

    pub fn registry(&self) -> Arc<UsbRegistry> {
        self.registry.clone()
    }

    /// 执行完整的 USB 连接流程
    ///
    /// `endpoint` 为空时取第一个枚举到的候选。返回实际使用的端点。
    pub async fn connect(
        &self,
        endpoint: Option<CameraEndpoint>,
        callback: &dyn ConnectProgress,
    ) -> anyhow::Result<CameraEndpoint> {
        callback.on_status("扫描 USB 相机...");
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => self
                .registry
                .list_camera_devices()?
                .into_iter()
                .next()
                .ok_or(CameraError::NoDevice)?,
        };
        let Transport::Usb(id) = &endpoint.transport else {
            anyhow::bail!("endpoint is not USB: {}", endpoint);
        };
        let id = *id;

        // 权限是宿主权威的，缺失只能由用户补
        if self.registry.request_permission(&id) == PermissionStatus::Denied {
            callback.on_error("USB 权限缺失，请重新授予后重试");
            return Err(CameraError::PermissionDenied {
                device: id.to_string(),
            }
            .into());
        }

        let (capture_tx, capture_rx) = mpsc::channel(self.config.capture_queue_depth);

        callback.on_status(&format!("连接 {} ...", endpoint));
        match self
            .manager
            .connect(&self.ctx, &endpoint, capture_tx.clone())
            .await
        {
            Ok(code) => {
                info!("Native init returned {}", code);
            }
            Err(CameraError::InitFailed { code })
                if classify_init_code(code) == InitCodeClass::Recoverable =>
            {
                callback.on_status("初始化失败，执行恢复序列...");
                match self.recovery.run(&self.manager, &id).await? {
                    RecoveryOutcome::Recovered => {
                        // 恢复序列已经完成了这一次 init
                        self.ctx.reset_error();
                        self.ctx.begin_connecting()?;
                        self.ctx.remember_endpoint(endpoint.clone());
                        self.ctx.mark_connected();
                        self.manager.arm_capture_listener(capture_tx).await;
                    }
                    RecoveryOutcome::PermissionRefreshRequired => {
                        callback.on_error("恢复期间权限失效，请重新授予");
                        return Err(CameraError::PermissionDenied {
                            device: id.to_string(),
                        }
                        .into());
                    }
                    RecoveryOutcome::Failed(code) => {
                        callback.on_error(&format!("恢复失败 (code {})", code));
                        return Err(CameraError::InitFailed { code }.into());
                    }
                }
            }
            Err(e) => {
                callback.on_error(&format!("连接失败: {}", e));
                return Err(e.into());
            }
        }

        // 拍摄管线消费原生暂存文件
        let fetcher = Arc::new(StagedFileFetcher);
        if let Some(handle) = self.pipeline.start(capture_rx, fetcher) {
            *self.listener.lock().await = Some(handle);
        }

        self.spawn_detach_watch(id).await;

        callback.on_connected(&endpoint);
        Ok(endpoint)
    }

    /// 活动设备拔出时拆除连接
    async fn spawn_detach_watch(&self, active: crate::device::UsbDeviceId) {
        match self.registry.spawn_hotplug_watcher() {
            Ok((mut events, watch_task)) => {
                let manager = self.manager.clone();
                let ctx = self.ctx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if let UsbHotplugEvent::Detached(id) = event {
                            if id == active {
                                warn!("Active camera {} detached, tearing down", id);
                                manager.disconnect(&ctx).await;
                                break;
                            }
                        }
                    }
                    watch_task.abort();
                });
                *self.detach_watch.lock().await = Some(handle);
            }
            Err(e) => {
                // 没有热插拔源时降级为无监控运行
                warn!("Hotplug watcher unavailable: {}", e);
            }
        }
    }

    /// 断开连接（停监听 → 原生 close → 释放句柄）
    pub async fn disconnect(&self) {
        if let Some(handle) = self.detach_watch.lock().await.take() {
            handle.abort();
        }
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
        self.manager.disconnect(&self.ctx).await;
    }
}
