//! Shutterlink Core Library
//!
//! 移动端/桌面端经 USB 或 WiFi 发现、连接并控制相机的
//! 连接与协议层，包含从零实现的 PTP/IP 客户端。
//!
//! # 模块
//!
//! - **usb**: 设备注册表、连接管理、恢复子系统
//! - **wifi**: 网络状态观察和相机热点识别
//! - **ptpip**: PTP/IP 编解码、会话、发现、厂商批准
//! - **connection**: 连接状态机和自动重连
//! - **capture**: 拍摄事件与下载管线
//! - **control**: 原生相机控制库边界
//! - **workflow**: 高层连接流程
//!
//! # 使用示例
//!
//! ## USB 连接
//!
//! ```ignore
//! use shutterlink_core::{AppSettings, TimingConfig, UsbConnector};
//!
//! let settings = AppSettings::load();
//! let connector = UsbConnector::new(control, &settings, TimingConfig::default(), lib_dir);
//! let endpoint = connector.connect(None, &callback).await?;
//! // 外部快门触发后，管线自动下载文件
//! let files = connector.pipeline().files();
//! ```
//!
//! ## WiFi 连接
//!
//! ```ignore
//! use shutterlink_core::{NetworkObserver, WifiConnector};
//!
//! let observer = NetworkObserver::spawn(source, config.clone());
//! let connector = WifiConnector::new(settings, config);
//! let endpoints = connector.discover(&observer.current()).await?;
//! connector.connect(&endpoints[0], sta_mode, &callback).await?;
//! ```

pub mod capture;
pub mod config;
pub mod connection;
pub mod control;
pub mod device;
pub mod error;
pub mod logging;
pub mod ptpip;
pub mod usb;
pub mod wifi;
pub mod workflow;

// Config re-exports
pub use config::{AppSettings, TimingConfig};

// Device re-exports
pub use device::{CameraEndpoint, Transport, UsbDeviceId};

// Error re-exports
pub use error::{CameraError, Result};

// Connection re-exports
pub use connection::{ConnectionContext, ConnectionState, Reconnect, spawn_reconnector};

// Control re-exports
pub use control::{CaptureCallback, ControlLibrary, SimulatedControlLibrary};

// Capture re-exports
pub use capture::{CaptureNotice, CapturePipeline, CapturedFile, DownloadStatus};

// PTP/IP re-exports
pub use ptpip::{DeviceInfo, DiscoveryService, PtpIpSession, VendorHint, classify_vendor};

// USB re-exports
pub use usb::{RecoveryOutcome, RecoverySubsystem, UsbConnectionManager, UsbRegistry};

// WiFi re-exports
pub use wifi::{NetworkObserver, NetworkState, NmcliSource};

// Workflow re-exports
pub use workflow::{ConnectProgress, ProgressEvent, SimpleProgress, UsbConnector, WifiConnector};

// Logging re-exports
pub use logging::{LogEntry, LogLevel};
