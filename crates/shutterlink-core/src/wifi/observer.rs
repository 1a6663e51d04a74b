//! 网络状态观察者
//!
//! 在独立任务里周期采样宿主连接状态（NetworkManager / ip route），
//! 去重后发布到 watch 通道，观察流程本身绝不阻塞在 I/O 上。
//!
//! # 相机热点识别
//!
//! SSID 与已知相机品牌词匹配即认为关联在相机热点上；候选相机 IP
//! 优先取 DHCP 网关，否则尝试惯例热点地址，每个候选都要通过一次
//! 禁用 linger 的 TCP 探测（绝不用完整协议握手验证，避免副作用）。
//! 探测结果按 SSID 缓存，网关变化时失效。

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Command;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::TimingConfig;
use crate::device::ssid_matches_camera_ap;
use crate::ptpip::{PTPIP_PORT, tcp_probe};
use crate::wifi::NetworkState;

/// 相机热点的惯例网关地址
pub const CONVENTIONAL_AP_ADDRS: &[Ipv4Addr] = &[
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(10, 0, 0, 1),
];

/// 宿主连接状态的一次原始采样
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkSnapshot {
    pub connected: bool,
    pub ssid: Option<String>,
    /// DHCP 网关/服务器地址（可用时）
    pub gateway: Option<IpAddr>,
}

/// 宿主连接性采样接口
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    async fn sample(&self) -> NetworkSnapshot;
}

/// 基于 nmcli / ip route 的采样实现
pub struct NmcliSource {
    interface: String,
}

impl NmcliSource {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    fn sample_blocking(interface: &str) -> NetworkSnapshot {
        let ssid = Self::active_ssid();
        let gateway = Self::default_gateway(interface);
        NetworkSnapshot {
            connected: ssid.is_some() || gateway.is_some(),
            ssid,
            gateway,
        }
    }

    /// 当前活动的 WiFi SSID
    fn active_ssid() -> Option<String> {
        let output = Command::new("nmcli")
            .args(["-t", "-f", "ACTIVE,SSID", "device", "wifi"])
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(ssid) = line.strip_prefix("yes:") {
                if !ssid.is_empty() {
                    return Some(ssid.to_string());
                }
            }
        }
        None
    }

    /// 默认路由的网关地址
    fn default_gateway(interface: &str) -> Option<IpAddr> {
        let output = Command::new("ip")
            .args(["route", "show", "default", "dev", interface])
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if let Some(pos) = parts.iter().position(|&s| s == "via") {
                if let Some(ip) = parts.get(pos + 1).and_then(|s| s.parse().ok()) {
                    return Some(ip);
                }
            }
        }
        None
    }
}

#[async_trait]
impl ConnectivitySource for NmcliSource {
    async fn sample(&self) -> NetworkSnapshot {
        let interface = self.interface.clone();
        tokio::task::spawn_blocking(move || Self::sample_blocking(&interface))
            .await
            .unwrap_or_default()
    }
}

/// 网络观察者
///
/// 持有采样任务；drop 时任务随之结束。
pub struct NetworkObserver {
    state_rx: watch::Receiver<NetworkState>,
    handle: JoinHandle<()>,
}

impl NetworkObserver {
    /// 在标准 PTP/IP 端口上启动观察
    pub fn spawn(source: Arc<dyn ConnectivitySource>, config: TimingConfig) -> Self {
        Self::spawn_with_port(source, config, PTPIP_PORT)
    }

    /// 指定探测端口启动（测试用本地监听端口）
    pub fn spawn_with_port(
        source: Arc<dyn ConnectivitySource>,
        config: TimingConfig,
        probe_port: u16,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(NetworkState::default());
        let handle = tokio::spawn(observe_loop(source, config, probe_port, state_tx));
        Self { state_rx, handle }
    }

    /// 订阅去重后的状态流
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state_rx.clone()
    }

    /// 当前状态快照
    pub fn current(&self) -> NetworkState {
        self.state_rx.borrow().clone()
    }
}

impl Drop for NetworkObserver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn observe_loop(
    source: Arc<dyn ConnectivitySource>,
    config: TimingConfig,
    probe_port: u16,
    state_tx: watch::Sender<NetworkState>,
) {
    // 探测结果按 SSID 缓存: ssid -> (当时的网关, 确认过的相机 IP)
    let mut probe_cache: HashMap<String, (Option<IpAddr>, Option<IpAddr>)> = HashMap::new();
    let mut interval = tokio::time::interval(config.network_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let snapshot = source.sample().await;

        let camera_ap = snapshot
            .ssid
            .as_deref()
            .map(ssid_matches_camera_ap)
            .unwrap_or(false);

        let detected_camera_ip = if snapshot.connected && camera_ap {
            let ssid = snapshot.ssid.clone().unwrap_or_default();
            resolve_camera_ip(
                &mut probe_cache,
                &ssid,
                snapshot.gateway,
                probe_port,
                &config,
            )
            .await
        } else {
            None
        };

        if !snapshot.connected {
            // 能力变化，缓存全部失效
            if !probe_cache.is_empty() {
                debug!("Network down, dropping {} probe cache entries", probe_cache.len());
                probe_cache.clear();
            }
        }

        let next = NetworkState {
            connected: snapshot.connected,
            connected_to_camera_ap: camera_ap,
            ssid: snapshot.ssid,
            detected_camera_ip,
        };

        // 去重：状态没变就不打扰订阅者
        state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                info!(
                    "Network state: connected={}, camera_ap={}, ssid={:?}, camera_ip={:?}",
                    next.connected, next.connected_to_camera_ap, next.ssid, next.detected_camera_ip
                );
                *state = next.clone();
                true
            }
        });

        if state_tx.is_closed() {
            break;
        }
    }
}

/// 解析并验证候选相机 IP（带按 SSID 缓存）
async fn resolve_camera_ip(
    cache: &mut HashMap<String, (Option<IpAddr>, Option<IpAddr>)>,
    ssid: &str,
    gateway: Option<IpAddr>,
    probe_port: u16,
    config: &TimingConfig,
) -> Option<IpAddr> {
    if let Some((cached_gateway, cached_ip)) = cache.get(ssid) {
        if *cached_gateway == gateway {
            return *cached_ip;
        }
        // 网关变了，这条缓存作废
        debug!("Gateway changed for '{}', re-probing", ssid);
    }

    let mut candidates: Vec<IpAddr> = Vec::new();
    if let Some(gw) = gateway {
        candidates.push(gw);
    }
    for addr in CONVENTIONAL_AP_ADDRS {
        let ip = IpAddr::V4(*addr);
        if !candidates.contains(&ip) {
            candidates.push(ip);
        }
    }

    let mut found = None;
    for ip in candidates {
        let addr = SocketAddr::new(ip, probe_port);
        if tcp_probe(addr, config.probe_timeout).await {
            debug!("Camera IP confirmed at {}", addr);
            found = Some(ip);
            break;
        }
    }

    if found.is_none() {
        warn!("No candidate camera IP answered on port {}", probe_port);
    }
    cache.insert(ssid.to_string(), (gateway, found));
    found
}
