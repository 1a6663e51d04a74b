//! 相机端点和厂商识别表
//!
//! USB 端设备按三个独立信号分类（接口类 / 厂商 ID 白名单 / 品牌词），
//! 任一命中即视为候选相机。端点一经发现不可变；AP 租约变化时
//! 用新值整体替换而不是原地修改。

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// USB 设备标识（总线号 + 设备地址定位，VID/PID 识别型号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbDeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
}

impl UsbDeviceId {
    /// usbfs 设备节点路径
    pub fn device_node(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.bus_number, self.device_address
        ))
    }
}

impl fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {} addr {})",
            self.vendor_id, self.product_id, self.bus_number, self.device_address
        )
    }
}

/// 发现的相机端点
///
/// 不可变；WiFi 端点的 IP 变化通过生成新端点替换旧值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEndpoint {
    pub transport: Transport,
    /// 人类可读标签
    pub label: String,
}

/// 端点的传输方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Usb(UsbDeviceId),
    Network(SocketAddr),
}

impl CameraEndpoint {
    pub fn usb(id: UsbDeviceId, label: impl Into<String>) -> Self {
        Self {
            transport: Transport::Usb(id),
            label: label.into(),
        }
    }

    pub fn network(addr: SocketAddr, label: impl Into<String>) -> Self {
        Self {
            transport: Transport::Network(addr),
            label: label.into(),
        }
    }

    /// WiFi 端点的地址（USB 端点返回 None）
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Network(addr) => Some(*addr),
            Transport::Usb(_) => None,
        }
    }

    /// 用新 IP 生成替代端点（租约变化时）
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        match &self.transport {
            Transport::Network(addr) => Self {
                transport: Transport::Network(SocketAddr::new(ip, addr.port())),
                label: self.label.clone(),
            },
            Transport::Usb(_) => self.clone(),
        }
    }
}

impl fmt::Display for CameraEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport {
            Transport::Usb(id) => write!(f, "{} [{}]", self.label, id),
            Transport::Network(addr) => write!(f, "{} [{}]", self.label, addr),
        }
    }
}

// ============================================================================
// 分类表
// ============================================================================

/// USB 接口类: 静态图像捕获 (PTP)
pub const USB_CLASS_STILL_IMAGE: u8 = 0x06;
/// USB 接口类: 大容量存储
pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;
/// USB 接口类: 厂商自定义
pub const USB_CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

/// 已知相机/无人机/电影机厂商 VID 白名单
pub const KNOWN_CAMERA_VENDOR_IDS: &[u16] = &[
    0x04a9, // Canon
    0x04b0, // Nikon
    0x054c, // Sony
    0x04cb, // Fujifilm
    0x04da, // Panasonic
    0x07b4, // Olympus / OM Digital
    0x132b, // Sigma
    0x1a98, // Leica
    0x2672, // GoPro
    0x2ca3, // DJI
    0x1edb, // Blackmagic Design
    0x19e5, // Insta360 (Huawei-shared VID on some units)
];

/// 产品名中的品牌词（大写比较）
pub const CAMERA_BRAND_TOKENS: &[&str] = &[
    "NIKON",
    "CANON",
    "SONY",
    "FUJIFILM",
    "FUJI",
    "PANASONIC",
    "LUMIX",
    "OLYMPUS",
    "OM-D",
    "LEICA",
    "SIGMA",
    "GOPRO",
    "HERO",
    "DJI",
    "OSMO",
    "BLACKMAGIC",
    "INSTA360",
    "EOS",
    "ALPHA",
    "ILCE",
    "COOLPIX",
];

/// 相机自建热点的 SSID 品牌词（大写比较）
pub const CAMERA_AP_SSID_TOKENS: &[&str] = &[
    "NIKON", "CANON", "SONY", "FUJIFILM", "GOPRO", "DJI", "OSMO", "LUMIX", "OM_SYSTEM",
    "OLYMPUS", "LEICA", "BMPCC", "BLACKMAGIC", "THETA", "INSTA360",
];

/// 产品名是否包含已知品牌词
pub fn name_matches_camera_brand(name: &str) -> bool {
    let upper = name.to_uppercase();
    CAMERA_BRAND_TOKENS.iter().any(|t| upper.contains(t))
}

/// SSID 是否像相机自建热点
pub fn ssid_matches_camera_ap(ssid: &str) -> bool {
    let upper = ssid.to_uppercase();
    CAMERA_AP_SSID_TOKENS.iter().any(|t| upper.contains(t))
}

/// VID 是否在白名单里
pub fn vendor_id_is_camera(vendor_id: u16) -> bool {
    KNOWN_CAMERA_VENDOR_IDS.contains(&vendor_id)
}

/// 接口类是否是相机候选（PTP / 厂商自定义 / 大容量存储）
pub fn interface_class_is_camera(class: u8) -> bool {
    matches!(
        class,
        USB_CLASS_STILL_IMAGE | USB_CLASS_VENDOR_SPECIFIC | USB_CLASS_MASS_STORAGE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_device_node_path() {
        let id = UsbDeviceId {
            vendor_id: 0x04b0,
            product_id: 0x0442,
            bus_number: 1,
            device_address: 4,
        };
        assert_eq!(
            id.device_node(),
            std::path::PathBuf::from("/dev/bus/usb/001/004")
        );
    }

    #[test]
    fn test_endpoint_with_ip_supersedes() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 15740);
        let ep = CameraEndpoint::network(addr, "Nikon Z 6");
        let revised = ep.with_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));

        assert_ne!(ep, revised);
        assert_eq!(revised.label, "Nikon Z 6");
        assert_eq!(
            revised.socket_addr().unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)), 15740)
        );
        // 原端点不被修改
        assert_eq!(ep.socket_addr().unwrap(), addr);
    }

    #[test]
    fn test_brand_token_matching() {
        assert!(name_matches_camera_brand("NIKON Z 6"));
        assert!(name_matches_camera_brand("Canon EOS R5"));
        assert!(name_matches_camera_brand("ILCE-7M3"));
        assert!(!name_matches_camera_brand("Generic Flash Drive"));
    }

    #[test]
    fn test_ssid_matching_tokens() {
        assert!(ssid_matches_camera_ap("Nikon_WU2_XXXX"));
        assert!(ssid_matches_camera_ap("GoPro 9384"));
        assert!(ssid_matches_camera_ap("DIRECT-dji-mavic"));
        assert!(!ssid_matches_camera_ap("HomeNetwork-5G"));
    }

    #[test]
    fn test_interface_class() {
        assert!(interface_class_is_camera(USB_CLASS_STILL_IMAGE));
        assert!(interface_class_is_camera(USB_CLASS_VENDOR_SPECIFIC));
        assert!(interface_class_is_camera(USB_CLASS_MASS_STORAGE));
        assert!(!interface_class_is_camera(0x03)); // HID
    }

    #[test]
    fn test_vendor_allow_list() {
        assert!(vendor_id_is_camera(0x04b0));
        assert!(vendor_id_is_camera(0x2ca3));
        assert!(!vendor_id_is_camera(0x18d1)); // Google
    }
}
