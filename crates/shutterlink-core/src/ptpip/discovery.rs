//! PTP/IP 端点发现
//!
//! 两种互斥策略，按当前网络模式选择：
//!
//! - **AP 模式**: 依次探测网关和惯例热点地址，第一个可达的候选
//!   成为唯一端点，完全不触发组播发现。
//! - **STA 模式**: `_ptp._tcp` mDNS 服务发现，按 名称+类型 去重，
//!   受总超时约束——零应答时也会在期限内返回。
//!
//! 可达性探测只做一次禁用 linger 的 TCP 连接，绝不做协议握手。

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::config::TimingConfig;
use crate::device::{CameraEndpoint, name_matches_camera_brand};
use crate::error::{CameraError, Result};
use crate::ptpip::{PTPIP_PORT, SERVICE_TYPE};
use crate::wifi::NetworkState;
use crate::wifi::observer::CONVENTIONAL_AP_ADDRS;

/// 短促的 TCP 可达性探测
///
/// 连接成功即认为可达；关闭 linger 让连接以 RST 结束，
/// 不在相机侧留下半开会话。
pub async fn tcp_probe(addr: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_linger(Some(Duration::ZERO));
            true
        }
        Ok(Err(e)) => {
            debug!("Probe {} refused: {}", addr, e);
            false
        }
        Err(_) => {
            debug!("Probe {} timed out", addr);
            false
        }
    }
}

/// 端点发现服务
pub struct DiscoveryService {
    config: TimingConfig,
}

impl DiscoveryService {
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    /// 按网络模式发现相机端点
    pub async fn discover(&self, network: &NetworkState) -> Result<Vec<CameraEndpoint>> {
        if network.connected_to_camera_ap {
            self.discover_access_point(network).await
        } else {
            self.discover_multicast().await
        }
    }

    /// AP 模式：探测网关及惯例地址
    pub async fn discover_access_point(&self, network: &NetworkState) -> Result<Vec<CameraEndpoint>> {
        let mut candidates: Vec<IpAddr> = Vec::new();
        if let Some(ip) = network.detected_camera_ip {
            candidates.push(ip);
        }
        for addr in CONVENTIONAL_AP_ADDRS {
            let ip = IpAddr::V4(*addr);
            if !candidates.contains(&ip) {
                candidates.push(ip);
            }
        }
        self.probe_candidates(&candidates, PTPIP_PORT, network.ssid.as_deref())
            .await
    }

    /// 依次探测候选地址，第一个可达的成为唯一端点
    pub async fn probe_candidates(
        &self,
        candidates: &[IpAddr],
        port: u16,
        ssid: Option<&str>,
    ) -> Result<Vec<CameraEndpoint>> {
        for ip in candidates {
            let addr = SocketAddr::new(*ip, port);
            if tcp_probe(addr, self.config.probe_timeout).await {
                info!("Reachable camera endpoint at {}", addr);
                let label = derive_ap_label(ssid, *ip);
                return Ok(vec![CameraEndpoint::network(addr, label)]);
            }
        }
        debug!("None of {} AP candidates reachable", candidates.len());
        Ok(Vec::new())
    }

    /// STA 模式：mDNS 组播服务发现
    pub async fn discover_multicast(&self) -> Result<Vec<CameraEndpoint>> {
        let deadline = self.config.discovery_timeout;
        let endpoints = tokio::task::spawn_blocking(move || browse_blocking(deadline))
            .await
            .map_err(|e| CameraError::Fatal(format!("discovery task panicked: {e}")))??;
        info!("Multicast discovery found {} endpoint(s)", endpoints.len());
        Ok(endpoints)
    }
}

/// 在阻塞线程上执行 mDNS browse，受总超时约束
fn browse_blocking(deadline: Duration) -> Result<Vec<CameraEndpoint>> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| CameraError::Fatal(format!("mdns daemon unavailable: {e}")))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| CameraError::Fatal(format!("mdns browse failed: {e}")))?;

    let started = Instant::now();
    let mut seen: HashSet<String> = HashSet::new();
    let mut endpoints = Vec::new();

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                // 名称+类型 去重（fullname 已包含两者）
                let fullname = info.get_fullname().to_string();
                if !seen.insert(fullname.clone()) {
                    continue;
                }
                let Some(ip) = preferred_ip(&info) else {
                    warn!("Resolved service '{}' carries no address", fullname);
                    continue;
                };
                let addr = SocketAddr::new(ip, info.get_port());
                let name = extract_instance_name(&fullname);
                let label = derive_service_label(&name, ip);
                debug!("mDNS resolved '{}' -> {}", name, addr);
                endpoints.push(CameraEndpoint::network(addr, label));
            }
            Ok(other) => {
                debug!("mDNS event: {:?}", other);
            }
            Err(_) => break, // 超时或通道关闭
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(endpoints)
}

/// 从地址集合中优先挑 IPv4
fn preferred_ip(info: &mdns_sd::ResolvedService) -> Option<IpAddr> {
    let mut v6_fallback = None;
    for scoped in info.get_addresses() {
        let ip = scoped.to_ip_addr();
        match ip {
            IpAddr::V4(_) => return Some(ip),
            IpAddr::V6(_) if v6_fallback.is_none() => v6_fallback = Some(ip),
            _ => {}
        }
    }
    v6_fallback
}

/// 从 mDNS 全名中提取实例名
///
/// 如 `"NIKON Z 6._ptp._tcp.local."` → `"NIKON Z 6"`。
/// mdns-sd 会把实例名里的点转义成 `\.`。
pub fn extract_instance_name(fullname: &str) -> String {
    match fullname.find("._") {
        Some(pos) => fullname[..pos].replace("\\.", "."),
        None => fullname.to_string(),
    }
}

/// 服务名匹配厂商词时直接采用，否则回退到通用标签
pub fn derive_service_label(instance_name: &str, ip: IpAddr) -> String {
    if name_matches_camera_brand(instance_name) {
        instance_name.to_string()
    } else {
        format!("PTPIP Camera ({})", ip)
    }
}

/// AP 模式标签：SSID 带品牌词时采用 SSID
fn derive_ap_label(ssid: Option<&str>, ip: IpAddr) -> String {
    match ssid {
        Some(name) if name_matches_camera_brand(name) => name.to_string(),
        _ => format!("PTPIP Camera ({})", ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn fast_config() -> TimingConfig {
        TimingConfig {
            probe_timeout: Duration::from_millis(150),
            discovery_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(tcp_probe(addr, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_probe_unreachable_port() {
        // 紧接着释放的端口大概率无人监听
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!tcp_probe(addr, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_first_reachable_candidate_wins() {
        let listener = TcpListener::bind("127.0.0.3:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let service = DiscoveryService::new(fast_config());
        // 127.0.0.2 不可达，回退到 127.0.0.3
        let candidates = [
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)),
        ];
        let endpoints = service
            .probe_candidates(&candidates, port, Some("Nikon_WU2"))
            .await
            .unwrap();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(
            endpoints[0].socket_addr().unwrap().ip(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3))
        );
        assert_eq!(endpoints[0].label, "Nikon_WU2");
    }

    #[tokio::test]
    async fn test_no_reachable_candidates_yields_empty() {
        let listener = TcpListener::bind("127.0.0.2:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let service = DiscoveryService::new(fast_config());
        let candidates = [IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))];
        let endpoints = service
            .probe_candidates(&candidates, port, None)
            .await
            .unwrap();
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_multicast_discovery_bounded_by_timeout() {
        let service = DiscoveryService::new(fast_config());
        let started = Instant::now();
        // 零服务应答时必须在总超时内返回；无组播环境下报错也可接受
        match service.discover_multicast().await {
            Ok(endpoints) => {
                assert!(started.elapsed() < Duration::from_secs(5));
                // 本机测试环境通常没有 _ptp._tcp 服务
                let _ = endpoints;
            }
            Err(e) => {
                log::debug!("multicast unavailable in test environment: {}", e);
            }
        }
    }

    #[test]
    fn test_extract_instance_name() {
        assert_eq!(
            extract_instance_name("NIKON Z 6._ptp._tcp.local."),
            "NIKON Z 6"
        );
        assert_eq!(
            extract_instance_name("My\\.Cam._ptp._tcp.local."),
            "My.Cam"
        );
        assert_eq!(extract_instance_name("plain"), "plain");
    }

    #[test]
    fn test_label_derivation() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7));
        assert_eq!(derive_service_label("NIKON Z 6", ip), "NIKON Z 6");
        assert_eq!(
            derive_service_label("mystery-device", ip),
            "PTPIP Camera (192.168.0.7)"
        );
        assert_eq!(derive_ap_label(Some("GoPro 9384"), ip), "GoPro 9384");
        assert_eq!(
            derive_ap_label(Some("weird"), ip),
            "PTPIP Camera (192.168.0.7)"
        );
    }
}
