//! WiFi 网络观察
//!
//! 把宿主连接性回调收敛成一条去重后的 [`NetworkState`] 流，
//! 并判断当前是否关联在相机自建热点上。

pub mod observer;

pub use observer::{ConnectivitySource, NetworkObserver, NetworkSnapshot, NmcliSource};

use std::net::IpAddr;

/// 去重后的网络状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkState {
    /// 是否有网络连接
    pub connected: bool,
    /// 是否关联在相机自建热点（按 SSID 品牌词推断）
    pub connected_to_camera_ap: bool,
    /// 当前 SSID
    pub ssid: Option<String>,
    /// 探测确认过的候选相机 IP
    pub detected_camera_ip: Option<IpAddr>,
}
