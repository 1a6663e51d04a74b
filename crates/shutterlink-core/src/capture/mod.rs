//! 拍摄事件与下载管线
//!
//! 原生回调和事件 socket 的推送都先转成有界通道里的
//! [`CaptureNotice`]，由唯一的管线任务消费——同一时刻最多一个
//! 活动监听者，重复启动是空操作。
//!
//! 收到通知后先用扩展名白名单过滤；通过的先登记一条
//! `Downloading` 占位记录（对观察者立即可见），再异步取回文件。
//! 成功则以最终大小/路径替换占位，失败则移除占位并上报。

use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::TimingConfig;
use crate::control::CaptureCallback;
use crate::error::{CameraError, Result};
use crate::ptpip::session::PtpIpSession;

/// 支持下载的图像扩展名
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heif", "heic", "tif", "tiff", "dng", "raw", "nef", "nrw", "cr2",
    "cr3", "arw", "raf", "rw2", "orf", "gpr",
];

/// 文件名是否在支持的图像白名单里
pub fn is_supported_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_lowercase();
            SUPPORTED_IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// 相机侧产生的拍摄通知
#[derive(Debug, Clone)]
pub enum CaptureNotice {
    /// 原生库已把文件暂存到本地路径
    FileReady { path: PathBuf, name: String },
    /// PTP/IP 事件通道报告新对象，需要经会话取回
    ObjectAdded { handle: u32 },
    /// 拍摄失败
    CaptureFailed { code: i32 },
    /// 批量传输结束
    FlushComplete,
    /// 传输层脱离
    TransportDetached,
}

/// 下载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Complete,
    Failed,
}

/// 一次拍摄产生的文件记录
#[derive(Debug, Clone)]
pub struct CapturedFile {
    pub id: u32,
    /// 相机侧路径/名称
    pub remote_name: String,
    pub file_name: String,
    pub size: u64,
    pub captured_at: SystemTime,
    pub status: DownloadStatus,
    /// 下载完成后的本地路径
    pub local_path: Option<PathBuf>,
}

/// 对象取回接口
///
/// USB 路径由 [`StagedFileFetcher`] 实现（原生库已落盘），
/// WiFi 路径由 [`SessionFetcher`] 实现（GetObjectInfo/GetObject）。
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// 通知对应的文件名（不取数据）
    async fn describe(&self, notice: &CaptureNotice) -> Result<String>;
    /// 取回完整文件内容
    async fn retrieve(&self, notice: &CaptureNotice) -> Result<Vec<u8>>;
}

/// 原生库暂存文件的取回实现
pub struct StagedFileFetcher;

#[async_trait]
impl ObjectFetcher for StagedFileFetcher {
    async fn describe(&self, notice: &CaptureNotice) -> Result<String> {
        match notice {
            CaptureNotice::FileReady { name, .. } => Ok(name.clone()),
            other => Err(CameraError::Protocol(format!(
                "staged fetcher cannot describe {:?}",
                other
            ))),
        }
    }

    async fn retrieve(&self, notice: &CaptureNotice) -> Result<Vec<u8>> {
        match notice {
            CaptureNotice::FileReady { path, .. } => Ok(tokio::fs::read(path).await?),
            other => Err(CameraError::Protocol(format!(
                "staged fetcher cannot retrieve {:?}",
                other
            ))),
        }
    }
}

/// 经 PTP/IP 会话取回对象
pub struct SessionFetcher {
    session: Arc<tokio::sync::Mutex<PtpIpSession>>,
}

impl SessionFetcher {
    pub fn new(session: Arc<tokio::sync::Mutex<PtpIpSession>>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ObjectFetcher for SessionFetcher {
    async fn describe(&self, notice: &CaptureNotice) -> Result<String> {
        match notice {
            CaptureNotice::ObjectAdded { handle } => {
                let mut session = self.session.lock().await;
                Ok(session.get_object_info(*handle).await?.filename)
            }
            CaptureNotice::FileReady { name, .. } => Ok(name.clone()),
            other => Err(CameraError::Protocol(format!(
                "session fetcher cannot describe {:?}",
                other
            ))),
        }
    }

    async fn retrieve(&self, notice: &CaptureNotice) -> Result<Vec<u8>> {
        match notice {
            CaptureNotice::ObjectAdded { handle } => {
                let mut session = self.session.lock().await;
                session.get_object(*handle).await
            }
            other => Err(CameraError::Protocol(format!(
                "session fetcher cannot retrieve {:?}",
                other
            ))),
        }
    }
}

/// 把原生回调转成通道消息的适配器
///
/// 回调来自原生事件线程，这里只做非阻塞入队；队列满时丢弃
/// 并记录，绝不反向阻塞原生线程。
pub struct ChannelCaptureCallback {
    tx: mpsc::Sender<CaptureNotice>,
}

impl ChannelCaptureCallback {
    pub fn new(tx: mpsc::Sender<CaptureNotice>) -> Self {
        Self { tx }
    }

    fn push(&self, notice: CaptureNotice) {
        if let Err(e) = self.tx.try_send(notice) {
            warn!("Capture queue full, dropping notice: {}", e);
        }
    }
}

impl CaptureCallback for ChannelCaptureCallback {
    fn on_flush_complete(&self) {
        self.push(CaptureNotice::FlushComplete);
    }

    fn on_photo_captured(&self, path: &Path, name: &str) {
        self.push(CaptureNotice::FileReady {
            path: path.to_path_buf(),
            name: name.to_string(),
        });
    }

    fn on_capture_failed(&self, code: i32) {
        self.push(CaptureNotice::CaptureFailed { code });
    }

    fn on_transport_detached(&self) {
        self.push(CaptureNotice::TransportDetached);
    }
}

/// 活动监听者的句柄
///
/// drop 或 [`stop`](ListenerHandle::stop) 后释放"唯一监听者"标志，
/// 管线可以围绕批量操作停启并重新武装。
pub struct ListenerHandle {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// 停止监听任务
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
        self.active.store(false, Ordering::SeqCst);
    }
}

/// 拍摄下载管线
pub struct CapturePipeline {
    download_dir: PathBuf,
    config: TimingConfig,
    active: Arc<AtomicBool>,
    next_id: AtomicU32,
    files: Arc<Mutex<Vec<CapturedFile>>>,
    updates_tx: broadcast::Sender<CapturedFile>,
}

impl CapturePipeline {
    pub fn new(download_dir: PathBuf, config: TimingConfig) -> Self {
        let (updates_tx, _) = broadcast::channel(64);
        Self {
            download_dir,
            config,
            active: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU32::new(1),
            files: Arc::new(Mutex::new(Vec::new())),
            updates_tx,
        }
    }

    /// 启动消费任务
    ///
    /// 已有活动监听者时返回 `None`（空操作）。
    pub fn start(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<CaptureNotice>,
        fetcher: Arc<dyn ObjectFetcher>,
    ) -> Option<ListenerHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Capture listener already active, start is a no-op");
            return None;
        }

        let pipeline = self.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            info!("Capture listener armed");
            while let Some(notice) = rx.recv().await {
                match &notice {
                    CaptureNotice::FlushComplete => {
                        debug!("Flush complete");
                    }
                    CaptureNotice::CaptureFailed { code } => {
                        warn!("Camera reported capture failure (code {})", code);
                    }
                    CaptureNotice::TransportDetached => {
                        info!("Transport detached, capture listener exiting");
                        break;
                    }
                    CaptureNotice::FileReady { .. } | CaptureNotice::ObjectAdded { .. } => {
                        pipeline.handle_capture(&notice, &fetcher).await;
                    }
                }
            }
            active.store(false, Ordering::SeqCst);
        });

        Some(ListenerHandle {
            active: self.active.clone(),
            task,
        })
    }

    /// 是否有活动监听者
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 当前记录快照
    pub fn files(&self) -> Vec<CapturedFile> {
        self.files.lock().unwrap().clone()
    }

    /// 订阅记录变化
    pub fn subscribe(&self) -> broadcast::Receiver<CapturedFile> {
        self.updates_tx.subscribe()
    }

    async fn handle_capture(&self, notice: &CaptureNotice, fetcher: &Arc<dyn ObjectFetcher>) {
        let name = match fetcher.describe(notice).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Cannot resolve capture notice: {}", e);
                return;
            }
        };

        if !is_supported_image(&name) {
            debug!("Ignoring unsupported file '{}'", name);
            return;
        }

        // 占位记录立即可见
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let placeholder = CapturedFile {
            id,
            remote_name: name.clone(),
            file_name: name.clone(),
            size: 0,
            captured_at: SystemTime::now(),
            status: DownloadStatus::Downloading,
            local_path: None,
        };
        self.files.lock().unwrap().push(placeholder.clone());
        let _ = self.updates_tx.send(placeholder);

        let outcome = tokio::time::timeout(self.config.download_timeout, async {
            let data = fetcher.retrieve(notice).await?;
            tokio::fs::create_dir_all(&self.download_dir).await?;
            let target = self.download_dir.join(&name);
            tokio::fs::write(&target, &data).await?;
            Ok::<_, CameraError>((target, data.len() as u64))
        })
        .await;

        match outcome {
            Ok(Ok((path, size))) => {
                info!("Downloaded '{}' ({} bytes)", name, size);
                let mut files = self.files.lock().unwrap();
                if let Some(record) = files.iter_mut().find(|f| f.id == id) {
                    record.status = DownloadStatus::Complete;
                    record.size = size;
                    record.local_path = Some(path);
                    let _ = self.updates_tx.send(record.clone());
                }
            }
            Ok(Err(e)) => {
                warn!("Download of '{}' failed: {}", name, e);
                self.fail_and_remove(id);
            }
            Err(_) => {
                warn!(
                    "Download of '{}' timed out after {:?}",
                    name, self.config.download_timeout
                );
                self.fail_and_remove(id);
            }
        }
    }

    /// 失败时移除占位并广播失败记录
    fn fail_and_remove(&self, id: u32) {
        let mut files = self.files.lock().unwrap();
        if let Some(pos) = files.iter().position(|f| f.id == id) {
            let mut removed = files.remove(pos);
            removed.status = DownloadStatus::Failed;
            let _ = self.updates_tx.send(removed);
        }
    }
}
