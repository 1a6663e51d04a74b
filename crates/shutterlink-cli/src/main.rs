//! Shutterlink CLI
//!
//! 命令行前端，直接驱动核心库：扫描、连接、监听拍摄事件。
//! 相机控制操作本身由移动端的原生库承担，CLI 的 USB 路径用
//! 进程内模拟实现演示完整流程。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use shutterlink_core::{
    AppSettings, CameraEndpoint, CapturedFile, ConnectProgress, DownloadStatus, LogLevel,
    NetworkObserver, NmcliSource, SimulatedControlLibrary, TimingConfig, WifiConnector,
    spawn_reconnector,
};

/// 模拟环境的组件注入（演示用，不需要真实设备节点）
mod sim {
    use super::*;
    use shutterlink_core::UsbConnector;
    use shutterlink_core::device::UsbDeviceId;
    use shutterlink_core::error::Result;
    use shutterlink_core::usb::{
        DeviceEnumerator, HandleOpener, PermissionProbe, UsbDeviceRecord, UsbRegistry,
    };
    use shutterlink_core::usb::connection::UsbDeviceHandle;

    struct SimEnumerator;

    impl DeviceEnumerator for SimEnumerator {
        fn enumerate(&self) -> Result<Vec<UsbDeviceRecord>> {
            Ok(vec![UsbDeviceRecord {
                id: UsbDeviceId {
                    vendor_id: 0x04b0,
                    product_id: 0x0442,
                    bus_number: 1,
                    device_address: 1,
                },
                interface_classes: vec![0x06],
                product_name: Some("NIKON Z 6".to_string()),
                manufacturer: Some("Nikon Corp.".to_string()),
            }])
        }
    }

    struct AlwaysGranted;

    impl PermissionProbe for AlwaysGranted {
        fn probe(&self, _id: &UsbDeviceId) -> bool {
            true
        }
    }

    struct TempFileOpener;

    impl HandleOpener for TempFileOpener {
        fn open(&self, id: &UsbDeviceId) -> Result<UsbDeviceHandle> {
            let path = std::env::temp_dir().join(format!(
                "shutterlink-sim-{}-{}",
                std::process::id(),
                id.device_address
            ));
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            Ok(UsbDeviceHandle::from_file(*id, file))
        }
    }

    pub fn build_connector(
        control: Arc<SimulatedControlLibrary>,
        settings: &AppSettings,
        config: TimingConfig,
    ) -> UsbConnector {
        let registry = Arc::new(UsbRegistry::with_sources(
            Arc::new(SimEnumerator),
            Arc::new(AlwaysGranted),
            config.clone(),
        ));
        UsbConnector::with_parts(
            control,
            registry,
            Arc::new(TempFileOpener),
            settings,
            config,
            std::path::Path::new("/tmp"),
        )
    }
}

#[derive(Parser)]
#[command(name = "shutterlink", version, about = "相机连接与拍摄下载工具")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描候选相机（USB + WiFi）
    Scan,
    /// 连接 WiFi 相机并退出
    Connect {
        /// 相机地址 ip[:port]，缺省端口 15740
        #[arg(long)]
        ip: String,
        /// STA 模式（相机作为站点加入现有网络）
        #[arg(long)]
        sta: bool,
    },
    /// 连接并持续监听拍摄事件，自动下载新文件
    Monitor {
        /// 相机地址 ip[:port]；不指定则按当前网络自动发现
        #[arg(long)]
        ip: Option<String>,
        /// STA 模式
        #[arg(long)]
        sta: bool,
    },
    /// USB 连接流程演示（进程内模拟原生库）
    Simulate,
    /// 查看或修改设置
    Config {
        /// 设置设备名称
        #[arg(long)]
        device_name: Option<String>,
        /// 开/关自动重连
        #[arg(long)]
        auto_reconnect: Option<bool>,
    },
}

/// 把进度回调打到终端
struct PrintProgress;

impl ConnectProgress for PrintProgress {
    fn on_status(&self, status: &str) {
        println!("{} {}", LogLevel::Info.icon(), status);
    }

    fn on_connected(&self, endpoint: &CameraEndpoint) {
        println!("✅ 已连接: {}", endpoint);
    }

    fn on_error(&self, error: &str) {
        println!("{} {}", LogLevel::Error.icon(), error);
    }
}

fn print_file(file: &CapturedFile) {
    match file.status {
        DownloadStatus::Downloading => {
            println!("📷 {} 下载中...", file.file_name);
        }
        DownloadStatus::Complete => {
            println!(
                "✅ {} ({} 字节) -> {:?}",
                file.file_name,
                file.size,
                file.local_path.as_deref().unwrap_or_else(|| std::path::Path::new("?"))
            );
        }
        DownloadStatus::Failed => {
            println!("{} {} 下载失败", LogLevel::Error.icon(), file.file_name);
        }
        DownloadStatus::Pending => {}
    }
}

fn parse_addr(ip: &str) -> Result<SocketAddr> {
    if ip.contains(':') {
        Ok(ip.parse()?)
    } else {
        Ok(format!("{}:{}", ip, shutterlink_core::ptpip::PTPIP_PORT).parse()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（shutterlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,shutterlink_core=info")),
        )
        .try_init();

    tracing::debug!("Shutterlink CLI starting");

    let cli = Cli::parse();
    let settings = AppSettings::load();
    let config = TimingConfig::default();

    match cli.command {
        Commands::Scan => {
            let registry = shutterlink_core::UsbRegistry::new(config.clone());
            match registry.list_camera_devices() {
                Ok(devices) if !devices.is_empty() => {
                    println!("USB 候选相机:");
                    for endpoint in devices {
                        println!("  {}", endpoint);
                    }
                }
                Ok(_) => println!("未发现 USB 相机"),
                Err(e) => println!("USB 枚举失败: {}", e),
            }

            let source = Arc::new(NmcliSource::new(&settings.wifi_interface));
            let observer = NetworkObserver::spawn(source, config.clone());
            // 等一个采样周期
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let network = observer.current();
            println!(
                "网络: connected={}, camera_ap={}, ssid={:?}",
                network.connected, network.connected_to_camera_ap, network.ssid
            );

            let connector = WifiConnector::new(settings, config);
            println!("正在发现 PTP/IP 相机...");
            match connector.discover(&network).await {
                Ok(endpoints) if !endpoints.is_empty() => {
                    for endpoint in endpoints {
                        println!("  {}", endpoint);
                    }
                }
                Ok(_) => println!("未发现 PTP/IP 相机"),
                Err(e) => println!("发现失败: {}", e),
            }
        }

        Commands::Connect { ip, sta } => {
            let addr = parse_addr(&ip)?;
            let connector = WifiConnector::new(settings, config);
            let endpoint = CameraEndpoint::network(addr, format!("PTPIP Camera ({})", addr.ip()));
            connector.connect(&endpoint, sta, &PrintProgress).await?;
            if let Some(info) = connector.device_info().await {
                println!(
                    "相机: {} {} (固件 {}, 序列号 {})",
                    info.manufacturer, info.model, info.device_version, info.serial_number
                );
            }
            connector.disconnect().await;
        }

        Commands::Monitor { ip, sta } => {
            let auto_reconnect = settings.auto_reconnect;
            let source = Arc::new(NmcliSource::new(&settings.wifi_interface));
            let observer = NetworkObserver::spawn(source, config.clone());
            let connector = WifiConnector::new(settings, config.clone());

            let endpoint = match ip {
                Some(ip) => {
                    let addr = parse_addr(&ip)?;
                    CameraEndpoint::network(addr, format!("PTPIP Camera ({})", addr.ip()))
                }
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    let network = observer.current();
                    println!("按当前网络自动发现...");
                    connector
                        .discover(&network)
                        .await?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("未发现相机端点"))?
                }
            };

            connector.connect(&endpoint, sta, &PrintProgress).await?;

            let ctx = connector.context();
            ctx.set_auto_reconnect(auto_reconnect);
            let _reconnector = spawn_reconnector(
                ctx,
                observer.subscribe(),
                connector.clone(),
                config,
            );

            let mut updates = connector.pipeline().subscribe();
            println!("等待拍摄事件 (Ctrl-C 退出)...");
            loop {
                tokio::select! {
                    update = updates.recv() => {
                        match update {
                            Ok(file) => print_file(&file),
                            Err(_) => break,
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        println!("\n正在断开...");
                        break;
                    }
                }
            }
            connector.disconnect().await;
        }

        Commands::Simulate => {
            let control = Arc::new(SimulatedControlLibrary::new());
            let connector = sim::build_connector(control.clone(), &settings, config);

            match connector.connect(None, &PrintProgress).await {
                Ok(_) => {
                    // 触发一次模拟快门
                    control.trigger_capture("IMG_0001.JPG", &[0xFFu8; 4096]);
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    for file in connector.pipeline().files() {
                        print_file(&file);
                    }
                    connector.disconnect().await;
                }
                Err(e) => {
                    println!("{} 模拟连接失败: {}", LogLevel::Error.icon(), e);
                }
            }
        }

        Commands::Config {
            device_name,
            auto_reconnect,
        } => {
            let mut settings = settings;
            let mut changed = false;
            if let Some(name) = device_name {
                settings.device_name = name;
                changed = true;
            }
            if let Some(enabled) = auto_reconnect {
                settings.auto_reconnect = enabled;
                changed = true;
            }
            if changed {
                settings.save()?;
                println!("设置已保存");
            }
            println!("设备名称: {}", settings.device_name);
            println!("客户端 GUID: {}", settings.client_guid);
            println!("下载目录: {:?}", settings.download_dir);
            println!("WiFi 接口: {}", settings.wifi_interface);
            println!("自动重连: {}", settings.auto_reconnect);
        }
    }

    Ok(())
}
