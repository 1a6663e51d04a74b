//! 应用配置和持久化
//!
//! 所有重试次数、退避基数和稳定等待时间集中在 [`TimingConfig`]，
//! 不允许散落的魔法数字。用户设置通过 TOML 持久化。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// 统一的时序/重试配置面
///
/// 默认值对应真实硬件的稳定时间；测试按需缩短。
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// USB 枚举结果缓存 TTL
    pub enumeration_cache_ttl: Duration,
    /// 权限记录缓存 TTL（宿主子系统是权威，缓存必须短）
    pub permission_cache_ttl: Duration,
    /// 原生 init 成功后、启动事件监听前的稳定等待
    pub init_stabilization: Duration,
    /// 恢复序列中两次 close 之间的间隔
    pub recovery_close_gap: Duration,
    /// 恢复序列释放 USB 后的系统稳定等待
    pub recovery_settle: Duration,
    /// 重新 claim 接口后的稳定等待
    pub interface_settle: Duration,
    /// 命令 socket 单次读取超时
    pub read_timeout: Duration,
    /// TCP 可达性探测超时
    pub probe_timeout: Duration,
    /// STA 模式服务发现总超时
    pub discovery_timeout: Duration,
    /// 厂商批准序列第一阶段后的等待（相机内部处理批准）
    pub approval_wait: Duration,
    /// 第一阶段失败的最大重试次数
    pub approval_retries: u32,
    /// 第一阶段重试之间的冷却
    pub approval_cooldown: Duration,
    /// WiFi 恢复后到重连尝试的固定延迟
    pub reconnect_delay: Duration,
    /// Error 状态下额外重试循环的冷却
    pub error_retry_cooldown: Duration,
    /// 瞬态失败的最大重试次数
    pub max_transient_retries: u32,
    /// 瞬态重试退避基数
    pub backoff_base: Duration,
    /// 网络状态采样间隔
    pub network_poll_interval: Duration,
    /// 拍摄通知队列深度
    pub capture_queue_depth: usize,
    /// 单个文件下载超时
    pub download_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            enumeration_cache_ttl: Duration::from_secs(1),
            permission_cache_ttl: Duration::from_secs(1),
            init_stabilization: Duration::from_millis(1000),
            recovery_close_gap: Duration::from_millis(300),
            recovery_settle: Duration::from_secs(2),
            interface_settle: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(800),
            discovery_timeout: Duration::from_secs(10),
            approval_wait: Duration::from_secs(5),
            approval_retries: 2,
            approval_cooldown: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(3),
            error_retry_cooldown: Duration::from_secs(5),
            max_transient_retries: 3,
            backoff_base: Duration::from_millis(500),
            network_poll_interval: Duration::from_secs(3),
            capture_queue_depth: 32,
            download_timeout: Duration::from_secs(30),
        }
    }
}

/// 用户设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// 握手中向相机展示的主机名
    pub device_name: String,
    /// 客户端 GUID（首次生成后持久化，相机按它记住已批准的客户端）
    pub client_guid: uuid::Uuid,
    /// 下载目录
    pub download_dir: PathBuf,
    /// WiFi 接口名称
    pub wifi_interface: String,
    /// 网络恢复后是否自动重连
    pub auto_reconnect: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            client_guid: uuid::Uuid::new_v4(),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            wifi_interface: "wlan0".to_string(),
            auto_reconnect: true,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shutterlink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 握手用的 16 字节 GUID
    pub fn guid_bytes(&self) -> [u8; 16] {
        *self.client_guid.as_bytes()
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Shutterlink".to_string())
}
