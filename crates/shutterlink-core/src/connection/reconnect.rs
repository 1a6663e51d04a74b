//! 自动重连
//!
//! 订阅网络观察者：连接中丢失 WiFi 立即转为 Disconnected
//! （断开的链路承载不了活 socket，没有宽限期）；网络恢复且
//! 启用自动重连时，延迟固定时间后用最近端点重试，期间如果
//! AP 模式探测到新网关 IP 则先刷新端点。尝试之间由
//! connect-in-progress 标志串行化。

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::TimingConfig;
use crate::connection::{ConnectionContext, ConnectionState};
use crate::device::CameraEndpoint;
use crate::wifi::NetworkState;

/// 重连目标（由 WiFi 工作流实现）
#[async_trait]
pub trait Reconnect: Send + Sync {
    /// 对指定端点重新建立完整连接；成功后负责把状态置为 Connected
    async fn reconnect(&self, endpoint: &CameraEndpoint) -> anyhow::Result<()>;

    /// 网络丢失后的快速拆除（关闭 socket、停止监听）
    async fn drop_link(&self);
}

/// 启动重连任务
///
/// 任务随网络观察者通道关闭而退出。
pub fn spawn_reconnector(
    ctx: Arc<ConnectionContext>,
    mut net_rx: watch::Receiver<NetworkState>,
    target: Arc<dyn Reconnect>,
    config: TimingConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // 只有"连接中丢网"才允许恢复后重连
        let mut lost_while_connected = false;

        while net_rx.changed().await.is_ok() {
            let net = net_rx.borrow_and_update().clone();

            if !net.connected {
                if ctx.state() == ConnectionState::Connected {
                    info!("WiFi lost while connected, dropping link");
                    target.drop_link().await;
                    ctx.mark_disconnected();
                    lost_while_connected = true;
                }
                continue;
            }

            match ctx.state() {
                ConnectionState::Connected => {
                    // DHCP 租约变化：主动重连而不是等 socket 静默失效
                    if let Some(new_ip) = net.detected_camera_ip {
                        let stale = ctx.last_endpoint().and_then(|ep| {
                            ep.socket_addr()
                                .filter(|addr| addr.ip() != new_ip)
                                .map(|_| ep)
                        });
                        if let Some(endpoint) = stale {
                            info!("Camera IP changed to {}, reconnecting", new_ip);
                            let revised = endpoint.with_ip(new_ip);
                            ctx.remember_endpoint(revised.clone());
                            target.drop_link().await;
                            ctx.mark_disconnected();
                            attempt_reconnect(&ctx, &target, revised, &config).await;
                        }
                    }
                }
                ConnectionState::Disconnected if lost_while_connected => {
                    if !ctx.auto_reconnect() {
                        debug!("Auto-reconnect disabled, staying disconnected");
                        lost_while_connected = false;
                        continue;
                    }
                    let Some(endpoint) = ctx.last_endpoint() else {
                        lost_while_connected = false;
                        continue;
                    };
                    lost_while_connected = false;

                    info!(
                        "WiFi regained, reconnecting to {} in {:?}",
                        endpoint, config.reconnect_delay
                    );
                    sleep(config.reconnect_delay).await;

                    // AP 模式下恢复后的网关可能换了地址
                    let endpoint = match net.detected_camera_ip {
                        Some(ip) if endpoint.socket_addr().is_some() => {
                            let revised = endpoint.with_ip(ip);
                            ctx.remember_endpoint(revised.clone());
                            revised
                        }
                        _ => endpoint,
                    };
                    attempt_reconnect(&ctx, &target, endpoint, &config).await;
                }
                _ => {}
            }
        }
        debug!("Reconnector exiting: network observer closed");
    })
}

/// 串行化的重连尝试，Error 状态下带冷却的有界重试
async fn attempt_reconnect(
    ctx: &ConnectionContext,
    target: &Arc<dyn Reconnect>,
    endpoint: CameraEndpoint,
    config: &TimingConfig,
) {
    if !ctx.try_acquire_connecting() {
        debug!("Reconnect already in progress, skipping");
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match target.reconnect(&endpoint).await {
            Ok(()) => break,
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                ctx.mark_error();
                if !ctx.auto_reconnect() || attempt >= config.max_transient_retries {
                    break;
                }
                // 冷却随尝试次数增长，绝不无间隔地永远重试
                sleep(config.error_retry_cooldown * attempt).await;
                ctx.reset_error();
            }
        }
    }

    ctx.release_connecting();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubTarget {
        reconnects: Mutex<Vec<CameraEndpoint>>,
        drops: AtomicUsize,
        ctx: Arc<ConnectionContext>,
        succeed: bool,
    }

    #[async_trait]
    impl Reconnect for StubTarget {
        async fn reconnect(&self, endpoint: &CameraEndpoint) -> anyhow::Result<()> {
            self.reconnects.lock().unwrap().push(endpoint.clone());
            if self.succeed {
                self.ctx.mark_connected();
                Ok(())
            } else {
                anyhow::bail!("simulated failure")
            }
        }

        async fn drop_link(&self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> TimingConfig {
        TimingConfig {
            reconnect_delay: Duration::from_millis(10),
            error_retry_cooldown: Duration::from_millis(10),
            max_transient_retries: 2,
            ..Default::default()
        }
    }

    fn endpoint(ip: [u8; 4]) -> CameraEndpoint {
        CameraEndpoint::network(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), 15740),
            "cam",
        )
    }

    fn net(connected: bool, ip: Option<[u8; 4]>) -> NetworkState {
        NetworkState {
            connected,
            connected_to_camera_ap: ip.is_some(),
            ssid: connected.then(|| "Nikon_WU2".to_string()),
            detected_camera_ip: ip.map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        }
    }

    #[tokio::test]
    async fn test_reconnect_fires_after_loss_while_connected() {
        let ctx = Arc::new(ConnectionContext::new());
        ctx.begin_connecting().unwrap();
        ctx.mark_connected();
        ctx.remember_endpoint(endpoint([192, 168, 1, 1]));

        let target = Arc::new(StubTarget {
            reconnects: Mutex::new(Vec::new()),
            drops: AtomicUsize::new(0),
            ctx: ctx.clone(),
            succeed: true,
        });
        let (net_tx, net_rx) = watch::channel(net(true, None));
        let handle = spawn_reconnector(ctx.clone(), net_rx, target.clone(), fast_config());

        net_tx.send(net(false, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ctx.state(), ConnectionState::Disconnected);
        assert_eq!(target.drops.load(Ordering::SeqCst), 1);

        net_tx.send(net(true, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(target.reconnects.lock().unwrap().len(), 1);
        assert_eq!(ctx.state(), ConnectionState::Connected);

        drop(net_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_no_reconnect_when_loss_from_disconnected() {
        let ctx = Arc::new(ConnectionContext::new());
        ctx.remember_endpoint(endpoint([192, 168, 1, 1]));

        let target = Arc::new(StubTarget {
            reconnects: Mutex::new(Vec::new()),
            drops: AtomicUsize::new(0),
            ctx: ctx.clone(),
            succeed: true,
        });
        let (net_tx, net_rx) = watch::channel(net(true, None));
        let handle = spawn_reconnector(ctx.clone(), net_rx, target.clone(), fast_config());

        // 丢网时已是 Disconnected，恢复后不得重连
        net_tx.send(net(false, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        net_tx.send(net(true, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(target.reconnects.lock().unwrap().is_empty());
        assert_eq!(target.drops.load(Ordering::SeqCst), 0);

        drop(net_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_no_reconnect_when_auto_reconnect_disabled() {
        let ctx = Arc::new(ConnectionContext::new());
        ctx.begin_connecting().unwrap();
        ctx.mark_connected();
        ctx.remember_endpoint(endpoint([192, 168, 1, 1]));
        ctx.set_auto_reconnect(false);

        let target = Arc::new(StubTarget {
            reconnects: Mutex::new(Vec::new()),
            drops: AtomicUsize::new(0),
            ctx: ctx.clone(),
            succeed: true,
        });
        let (net_tx, net_rx) = watch::channel(net(true, None));
        let handle = spawn_reconnector(ctx.clone(), net_rx, target.clone(), fast_config());

        net_tx.send(net(false, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        net_tx.send(net(true, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // 丢网仍然立即断开，但不重连
        assert_eq!(target.drops.load(Ordering::SeqCst), 1);
        assert!(target.reconnects.lock().unwrap().is_empty());

        drop(net_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_ip_change_while_connected_reconnects_with_new_ip() {
        let ctx = Arc::new(ConnectionContext::new());
        ctx.begin_connecting().unwrap();
        ctx.mark_connected();
        ctx.remember_endpoint(endpoint([192, 168, 1, 1]));

        let target = Arc::new(StubTarget {
            reconnects: Mutex::new(Vec::new()),
            drops: AtomicUsize::new(0),
            ctx: ctx.clone(),
            succeed: true,
        });
        let (net_tx, net_rx) = watch::channel(net(true, Some([192, 168, 1, 1])));
        let handle = spawn_reconnector(ctx.clone(), net_rx, target.clone(), fast_config());

        // 租约变化：相机换到了 .0.1
        net_tx.send(net(true, Some([192, 168, 0, 1]))).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let reconnects = target.reconnects.lock().unwrap();
        assert_eq!(reconnects.len(), 1);
        assert_eq!(
            reconnects[0].socket_addr().unwrap().ip(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))
        );

        drop(net_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_failed_reconnect_retries_with_cooldown_then_stops() {
        let ctx = Arc::new(ConnectionContext::new());
        ctx.begin_connecting().unwrap();
        ctx.mark_connected();
        ctx.remember_endpoint(endpoint([192, 168, 1, 1]));

        let target = Arc::new(StubTarget {
            reconnects: Mutex::new(Vec::new()),
            drops: AtomicUsize::new(0),
            ctx: ctx.clone(),
            succeed: false,
        });
        let (net_tx, net_rx) = watch::channel(net(true, None));
        let handle = spawn_reconnector(ctx.clone(), net_rx, target.clone(), fast_config());

        net_tx.send(net(false, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        net_tx.send(net(true, None)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // max_transient_retries=2: 两次尝试后停在 Error
        assert_eq!(target.reconnects.lock().unwrap().len(), 2);
        assert_eq!(ctx.state(), ConnectionState::Error);

        drop(net_tx);
        let _ = handle.await;
    }
}
