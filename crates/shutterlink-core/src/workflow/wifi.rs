//! WiFi 连接工作流
//!
//! 网络观察 → 端点发现 → PTP/IP 握手 →（Nikon 系 STA 模式时）
//! 两阶段厂商批准 → 事件泵 + 拍摄管线。会话建立被独占锁保护，
//! 同一时刻最多一个 PTP/IP 会话在途。实现 [`Reconnect`] 供
//! 自动重连任务驱动。

use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capture::{CapturePipeline, ListenerHandle, SessionFetcher};
use crate::config::{AppSettings, TimingConfig};
use crate::connection::{ConnectAdmission, ConnectionContext, Reconnect};
use crate::device::CameraEndpoint;
use crate::error::CameraError;
use crate::ptpip::session::{PtpIpSession, spawn_event_pump};
use crate::ptpip::{DiscoveryService, VendorHint, classify_vendor, run_approval};
use crate::wifi::NetworkState;
use crate::workflow::{ConnectProgress, SilentProgress};

type SharedSession = Arc<tokio::sync::Mutex<PtpIpSession>>;

/// WiFi 连接工作流
pub struct WifiConnector {
    settings: AppSettings,
    config: TimingConfig,
    ctx: Arc<ConnectionContext>,
    discovery: DiscoveryService,
    pipeline: Arc<CapturePipeline>,
    /// 会话建立独占锁
    session_lock: tokio::sync::Mutex<()>,
    session: tokio::sync::Mutex<Option<SharedSession>>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    /// 最近一次连接是否 STA 模式（重连沿用）
    last_sta_mode: AtomicBool,
}

impl WifiConnector {
    pub fn new(settings: AppSettings, config: TimingConfig) -> Arc<Self> {
        let pipeline = Arc::new(CapturePipeline::new(
            settings.download_dir.clone(),
            config.clone(),
        ));
        Arc::new(Self {
            discovery: DiscoveryService::new(config.clone()),
            pipeline,
            ctx: Arc::new(ConnectionContext::new()),
            session_lock: tokio::sync::Mutex::new(()),
            session: tokio::sync::Mutex::new(None),
            pump: tokio::sync::Mutex::new(None),
            listener: tokio::sync::Mutex::new(None),
            last_sta_mode: AtomicBool::new(false),
            settings,
            config,
        })
    }

    pub fn context(&self) -> Arc<ConnectionContext> {
        self.ctx.clone()
    }

    pub fn pipeline(&self) -> Arc<CapturePipeline> {
        self.pipeline.clone()
    }

    /// 按当前网络模式发现端点
    pub async fn discover(&self, network: &NetworkState) -> crate::error::Result<Vec<CameraEndpoint>> {
        self.discovery.discover(network).await
    }

    /// 建立到端点的完整连接
    ///
    /// `sta_mode` 指示相机作为站点加入现有网络（厂商批准只在
    /// STA 模式需要）。
    pub async fn connect(
        &self,
        endpoint: &CameraEndpoint,
        sta_mode: bool,
        callback: &dyn ConnectProgress,
    ) -> anyhow::Result<()> {
        let _guard = self.session_lock.lock().await;

        match self.ctx.begin_connecting()? {
            ConnectAdmission::AlreadyConnected => return Ok(()),
            ConnectAdmission::Proceed => {}
        }
        self.last_sta_mode.store(sta_mode, Ordering::SeqCst);

        match self.establish(endpoint, sta_mode, callback).await {
            Ok(()) => {
                self.ctx.remember_endpoint(endpoint.clone());
                self.ctx.mark_connected();
                callback.on_connected(endpoint);
                Ok(())
            }
            Err(e) => {
                self.teardown_transport().await;
                self.ctx.mark_error();
                callback.on_error(&format!("连接失败: {}", e));
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        endpoint: &CameraEndpoint,
        sta_mode: bool,
        callback: &dyn ConnectProgress,
    ) -> anyhow::Result<()> {
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| CameraError::Fatal(format!("not a network endpoint: {}", endpoint)))?;
        let guid = self.settings.guid_bytes();

        callback.on_status(&format!("建立 PTP/IP 会话: {}", addr));
        let mut session =
            PtpIpSession::connect(addr, &guid, &self.settings.device_name, &self.config).await?;

        // STA 模式下 Nikon 系相机要求两阶段批准
        if sta_mode {
            let needs_approval = session
                .device_info
                .as_ref()
                .map(|info| classify_vendor(info) == VendorHint::RequiresApproval)
                .unwrap_or(false);
            if needs_approval {
                callback.on_status("执行厂商连接批准序列...");
                session.close().await;
                run_approval(addr, &guid, &self.settings.device_name, &self.config).await?;
                callback.on_status("批准完成，建立持久会话...");
                session =
                    PtpIpSession::connect(addr, &guid, &self.settings.device_name, &self.config)
                        .await?;
            }
        }

        // 事件泵独占事件 socket，拍摄通知经有界通道进管线
        let event_stream = session.take_event_stream().ok_or_else(|| {
            CameraError::Protocol("session has no event stream".to_string())
        })?;
        let (capture_tx, capture_rx) = mpsc::channel(self.config.capture_queue_depth);
        let pump = spawn_event_pump(event_stream, capture_tx);

        let shared: SharedSession = Arc::new(tokio::sync::Mutex::new(session));
        let fetcher = Arc::new(SessionFetcher::new(shared.clone()));
        if let Some(handle) = self.pipeline.start(capture_rx, fetcher) {
            *self.listener.lock().await = Some(handle);
        }

        *self.session.lock().await = Some(shared);
        *self.pump.lock().await = Some(pump);

        if let Some(info) = self.device_info().await {
            info!("Connected to {} {} at {}", info.manufacturer, info.model, addr);
        }
        Ok(())
    }

    /// 当前会话缓存的设备信息
    pub async fn device_info(&self) -> Option<crate::ptpip::DeviceInfo> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(shared) => shared.lock().await.device_info.clone(),
            None => None,
        }
    }

    /// 拆除传输层：停监听 → 停事件泵 → 关会话 socket
    async fn teardown_transport(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        if let Some(shared) = self.session.lock().await.take() {
            shared.lock().await.close().await;
        }
    }

    /// 主动断开
    pub async fn disconnect(&self) {
        info!("WiFi disconnecting");
        self.teardown_transport().await;
        self.ctx.mark_disconnected();
    }
}

#[async_trait]
impl Reconnect for WifiConnector {
    async fn reconnect(&self, endpoint: &CameraEndpoint) -> anyhow::Result<()> {
        let sta_mode = self.last_sta_mode.load(Ordering::SeqCst);
        match self.connect(endpoint, sta_mode, &SilentProgress).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Reconnect to {} failed: {}", endpoint, e);
                Err(e)
            }
        }
    }

    async fn drop_link(&self) {
        // 状态转换由重连任务负责，这里只拆传输
        self.teardown_transport().await;
    }
}
