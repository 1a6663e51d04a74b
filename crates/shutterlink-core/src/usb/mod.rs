//! USB 设备生命周期
//!
//! - **registry**: 枚举/分类候选相机、权限探测、热插拔事件
//! - **connection**: 独占锁保护的连接管理和原生库交接
//! - **recovery**: 可恢复失败后的"推倒重来"恢复序列

pub mod connection;
pub mod recovery;
pub mod registry;

pub use connection::{DeviceNodeOpener, HandleOpener, UsbConnectionManager, UsbDeviceHandle};
pub use recovery::{RecoveryOutcome, RecoverySubsystem};
pub use registry::{
    DeviceEnumerator, PermissionProbe, PermissionStatus, UsbDeviceRecord, UsbHotplugEvent,
    UsbRegistry,
};
