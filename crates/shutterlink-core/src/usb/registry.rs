//! USB 设备注册表
//!
//! 枚举宿主 USB 设备并按三个独立信号分类相机候选：
//! (a) 暴露静态图像捕获/厂商自定义/大容量存储类接口，
//! (b) 厂商 ID 在白名单里，(c) 产品名含已知品牌词。
//!
//! 枚举结果带短 TTL 缓存（~1s）避免高频宿主调用；权限记录同样
//! 短缓存——宿主子系统是权威，过期立即重新探测。

use futures_util::StreamExt;
use log::{debug, info, warn};
use nusb::hotplug::HotplugEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TimingConfig;
use crate::device::{
    CameraEndpoint, UsbDeviceId, interface_class_is_camera, name_matches_camera_brand,
    vendor_id_is_camera,
};
use crate::error::Result;

/// 一台已枚举设备的原始信息
#[derive(Debug, Clone)]
pub struct UsbDeviceRecord {
    pub id: UsbDeviceId,
    pub interface_classes: Vec<u8>,
    pub product_name: Option<String>,
    pub manufacturer: Option<String>,
}

/// 权限探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// 热插拔事件
#[derive(Debug, Clone)]
pub enum UsbHotplugEvent {
    Attached(CameraEndpoint),
    Detached(UsbDeviceId),
}

/// 设备枚举接口（测试注入用）
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<UsbDeviceRecord>>;
}

/// 基于 nusb 的真实枚举
pub struct NusbEnumerator;

impl DeviceEnumerator for NusbEnumerator {
    fn enumerate(&self) -> Result<Vec<UsbDeviceRecord>> {
        let devices = nusb::list_devices()?;
        Ok(devices
            .map(|info| UsbDeviceRecord {
                id: UsbDeviceId {
                    vendor_id: info.vendor_id(),
                    product_id: info.product_id(),
                    bus_number: info.bus_number(),
                    device_address: info.device_address(),
                },
                interface_classes: info.interfaces().map(|i| i.class()).collect(),
                product_name: info.product_string().map(|s| s.to_string()),
                manufacturer: info.manufacturer_string().map(|s| s.to_string()),
            })
            .collect())
    }
}

/// 权限探测接口
pub trait PermissionProbe: Send + Sync {
    fn probe(&self, id: &UsbDeviceId) -> bool;
}

/// 以打开设备节点的方式探测权限（宿主权威检查）
pub struct DeviceNodeProbe;

impl PermissionProbe for DeviceNodeProbe {
    fn probe(&self, id: &UsbDeviceId) -> bool {
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(id.device_node())
        {
            Ok(_) => true,
            Err(e) => {
                debug!("Permission probe for {} failed: {}", id, e);
                false
            }
        }
    }
}

/// 把一条枚举记录分类为相机端点
pub fn classify_record(record: &UsbDeviceRecord) -> Option<CameraEndpoint> {
    let by_interface = record
        .interface_classes
        .iter()
        .any(|class| interface_class_is_camera(*class));
    let by_vendor = vendor_id_is_camera(record.id.vendor_id);
    let by_name = record
        .product_name
        .as_deref()
        .map(name_matches_camera_brand)
        .unwrap_or(false);

    if !(by_interface || by_vendor || by_name) {
        return None;
    }

    let label = match (&record.manufacturer, &record.product_name) {
        (Some(manufacturer), Some(product)) => format!("{} {}", manufacturer, product),
        (None, Some(product)) => product.clone(),
        _ => format!(
            "USB Camera {:04x}:{:04x}",
            record.id.vendor_id, record.id.product_id
        ),
    };
    Some(CameraEndpoint::usb(record.id, label))
}

struct EnumerationCache {
    taken_at: Instant,
    devices: Vec<CameraEndpoint>,
}

struct PermissionEntry {
    taken_at: Instant,
    granted: bool,
}

/// USB 设备注册表
pub struct UsbRegistry {
    enumerator: Arc<dyn DeviceEnumerator>,
    probe: Arc<dyn PermissionProbe>,
    config: TimingConfig,
    cache: Mutex<Option<EnumerationCache>>,
    permissions: Mutex<HashMap<UsbDeviceId, PermissionEntry>>,
}

impl UsbRegistry {
    pub fn new(config: TimingConfig) -> Self {
        Self::with_sources(Arc::new(NusbEnumerator), Arc::new(DeviceNodeProbe), config)
    }

    /// 注入枚举/权限源（测试）
    pub fn with_sources(
        enumerator: Arc<dyn DeviceEnumerator>,
        probe: Arc<dyn PermissionProbe>,
        config: TimingConfig,
    ) -> Self {
        Self {
            enumerator,
            probe,
            config,
            cache: Mutex::new(None),
            permissions: Mutex::new(HashMap::new()),
        }
    }

    /// 列出候选相机（短 TTL 缓存）
    pub fn list_camera_devices(&self) -> Result<Vec<CameraEndpoint>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.as_ref() {
                if entry.taken_at.elapsed() < self.config.enumeration_cache_ttl {
                    return Ok(entry.devices.clone());
                }
            }
        }
        self.refresh_camera_devices()
    }

    /// 绕过缓存重新枚举（恢复序列用）
    pub fn refresh_camera_devices(&self) -> Result<Vec<CameraEndpoint>> {
        let records = self.enumerator.enumerate()?;
        let devices: Vec<CameraEndpoint> = records.iter().filter_map(classify_record).collect();
        debug!(
            "Enumerated {} USB device(s), {} camera candidate(s)",
            records.len(),
            devices.len()
        );
        *self.cache.lock().unwrap() = Some(EnumerationCache {
            taken_at: Instant::now(),
            devices: devices.clone(),
        });
        Ok(devices)
    }

    /// 权限检查/请求（已授予时是幂等操作）
    ///
    /// 记录只缓存很短时间；宿主子系统是权威。
    pub fn request_permission(&self, id: &UsbDeviceId) -> PermissionStatus {
        {
            let permissions = self.permissions.lock().unwrap();
            if let Some(entry) = permissions.get(id) {
                if entry.taken_at.elapsed() < self.config.permission_cache_ttl {
                    return if entry.granted {
                        PermissionStatus::Granted
                    } else {
                        PermissionStatus::Denied
                    };
                }
            }
        }

        let granted = self.probe.probe(id);
        self.permissions.lock().unwrap().insert(
            *id,
            PermissionEntry {
                taken_at: Instant::now(),
                granted,
            },
        );
        if granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }
    }

    /// 作废枚举缓存（热插拔事件后）
    pub fn invalidate_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }

    /// 启动热插拔观察任务
    ///
    /// 相机候选的插入/拔出转成事件流；当前活动设备拔出时由
    /// 订阅方（工作流）触发连接拆除。
    pub fn spawn_hotplug_watcher(
        self: &Arc<Self>,
    ) -> Result<(mpsc::Receiver<UsbHotplugEvent>, JoinHandle<()>)> {
        let watch = nusb::watch_devices()?;
        let (tx, rx) = mpsc::channel(16);
        let registry = self.clone();

        let handle = tokio::spawn(async move {
            let mut known: HashMap<nusb::DeviceId, UsbDeviceId> = HashMap::new();
            let mut stream = watch;
            while let Some(event) = stream.next().await {
                match event {
                    HotplugEvent::Connected(info) => {
                        registry.invalidate_cache();
                        let record = UsbDeviceRecord {
                            id: UsbDeviceId {
                                vendor_id: info.vendor_id(),
                                product_id: info.product_id(),
                                bus_number: info.bus_number(),
                                device_address: info.device_address(),
                            },
                            interface_classes: info.interfaces().map(|i| i.class()).collect(),
                            product_name: info.product_string().map(|s| s.to_string()),
                            manufacturer: info.manufacturer_string().map(|s| s.to_string()),
                        };
                        known.insert(info.id(), record.id);
                        if let Some(endpoint) = classify_record(&record) {
                            info!("Camera attached: {}", endpoint);
                            if tx.send(UsbHotplugEvent::Attached(endpoint)).await.is_err() {
                                break;
                            }
                        }
                    }
                    HotplugEvent::Disconnected(device_id) => {
                        registry.invalidate_cache();
                        if let Some(id) = known.remove(&device_id) {
                            info!("USB device detached: {}", id);
                            if tx.send(UsbHotplugEvent::Detached(id)).await.is_err() {
                                break;
                            }
                        } else {
                            debug!("Detach of unknown device {:?}", device_id);
                        }
                    }
                }
            }
            warn!("USB hotplug stream ended");
        });

        Ok((rx, handle))
    }
}
