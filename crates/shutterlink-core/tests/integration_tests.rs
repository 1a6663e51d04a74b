//! 端到端集成测试
//!
//! 进程内的脚本化 PTP/IP 相机（真实 TCP 双通道）+ 模拟原生库，
//! 覆盖 USB 和 WiFi 两条完整连接路径。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use shutterlink_core::capture::DownloadStatus;
use shutterlink_core::device::{CameraEndpoint, UsbDeviceId};
use shutterlink_core::ptpip::packet::{
    self, DataChunk, InitCommandAck, OperationRequest, OperationResponse, StartData,
};
use shutterlink_core::ptpip::session::read_raw_packet;
use shutterlink_core::ptpip::{DiscoveryService, PROTOCOL_VERSION, PacketType, ev, op, rc};
use shutterlink_core::usb::connection::UsbDeviceHandle;
use shutterlink_core::usb::{
    DeviceEnumerator, HandleOpener, PermissionProbe, UsbDeviceRecord, UsbRegistry,
};
use shutterlink_core::workflow::SilentProgress;
use shutterlink_core::{
    AppSettings, ConnectionState, SimulatedControlLibrary, TimingConfig, UsbConnector,
    WifiConnector,
};

fn fast_config() -> TimingConfig {
    TimingConfig {
        init_stabilization: Duration::from_millis(10),
        recovery_close_gap: Duration::from_millis(5),
        recovery_settle: Duration::from_millis(5),
        interface_settle: Duration::from_millis(5),
        read_timeout: Duration::from_millis(800),
        probe_timeout: Duration::from_millis(150),
        discovery_timeout: Duration::from_millis(400),
        approval_wait: Duration::from_millis(50),
        approval_cooldown: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(20),
        error_retry_cooldown: Duration::from_millis(20),
        download_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn temp_download_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("shutterlink-it-{}-{}", tag, std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

fn test_settings(tag: &str) -> AppSettings {
    AppSettings {
        device_name: "it-host".to_string(),
        download_dir: temp_download_dir(tag),
        ..Default::default()
    }
}

// ============================================================================
// 脚本化 PTP/IP 相机
// ============================================================================

struct MockCameraOptions {
    manufacturer: String,
    model: String,
    object_name: String,
    object_data: Vec<u8>,
    /// 事件通道建立后延迟推送一个 ObjectAdded
    push_object_event: bool,
}

impl Default for MockCameraOptions {
    fn default() -> Self {
        Self {
            manufacturer: "Sony Corporation".to_string(),
            model: "ILCE-7M3".to_string(),
            object_name: "IMG_0001.JPG".to_string(),
            object_data: vec![0xA5; 4096],
            push_object_event: false,
        }
    }
}

fn device_info_dataset(manufacturer: &str, model: &str) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&100u16.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&packet::encode_ptp_string(""));
    data.extend_from_slice(&0u16.to_le_bytes());
    for _ in 0..5 {
        data.extend_from_slice(&0u32.to_le_bytes());
    }
    data.extend_from_slice(&packet::encode_ptp_string(manufacturer));
    data.extend_from_slice(&packet::encode_ptp_string(model));
    data.extend_from_slice(&packet::encode_ptp_string("1.00"));
    data.extend_from_slice(&packet::encode_ptp_string("123456"));
    data
}

fn object_info_dataset(filename: &str, size: u32) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0x0001_0001u32.to_le_bytes()); // storage id
    data.extend_from_slice(&0x3801u16.to_le_bytes()); // EXIF/JPEG
    data.extend_from_slice(&0u16.to_le_bytes()); // protection
    data.extend_from_slice(&size.to_le_bytes()); // compressed size
    data.extend_from_slice(&0u16.to_le_bytes()); // thumb format
    for _ in 0..7 {
        // thumb 大小/宽高, image 宽高/位深, parent
        data.extend_from_slice(&0u32.to_le_bytes());
    }
    data.extend_from_slice(&0u16.to_le_bytes()); // association type
    data.extend_from_slice(&0u32.to_le_bytes()); // association desc
    data.extend_from_slice(&0u32.to_le_bytes()); // sequence number
    data.extend_from_slice(&packet::encode_ptp_string(filename));
    data
}

async fn send_data_phase(stream: &mut TcpStream, transaction_id: u32, dataset: &[u8]) {
    let start = StartData {
        transaction_id,
        total_length: dataset.len() as u64,
    };
    stream.write_all(&start.encode()).await.unwrap();
    let chunk = DataChunk {
        transaction_id,
        data: dataset.to_vec().into(),
    };
    stream.write_all(&chunk.encode(true)).await.unwrap();
}

/// 启动脚本化相机；每轮接受一对（命令, 事件）连接
async fn spawn_mock_camera(
    options: MockCameraOptions,
    ops_log: Arc<Mutex<Vec<(u16, u32)>>>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let options = Arc::new(options);
        let mut connection_number = 100u32;
        loop {
            // 命令通道
            let Ok((mut command, _)) = listener.accept().await else {
                break;
            };
            let bound = Duration::from_secs(2);
            let Ok(raw) = read_raw_packet(&mut command, bound).await else {
                continue;
            };
            if raw.kind() != Some(PacketType::InitCommandRequest) {
                continue;
            }
            connection_number += 1;
            let ack = InitCommandAck {
                connection_number,
                guid: [9u8; 16],
                name: "MockCam".to_string(),
                version: PROTOCOL_VERSION,
            };
            command.write_all(&ack.encode()).await.unwrap();

            // 事件通道
            let Ok((mut event, _)) = listener.accept().await else {
                break;
            };
            let Ok(raw) = read_raw_packet(&mut event, bound).await else {
                continue;
            };
            if raw.kind() != Some(PacketType::InitEventRequest) {
                continue;
            }
            event
                .write_all(&packet::encode_init_event_ack())
                .await
                .unwrap();

            // 事件推送
            if options.push_object_event {
                let mut event_stream = event;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let push = packet::EventPacket {
                        event_code: ev::OBJECT_ADDED,
                        transaction_id: 0,
                        parameters: vec![1],
                    };
                    let _ = event_stream.write_all(&push.encode()).await;
                    // 保持事件通道存活
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            } else {
                tokio::spawn(async move {
                    let _hold = event;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            }

            // 命令处理循环
            let options = options.clone();
            let ops_log = ops_log.clone();
            tokio::spawn(async move {
                loop {
                    let raw = match read_raw_packet(&mut command, Duration::from_secs(5)).await {
                        Ok(raw) => raw,
                        Err(_) => break,
                    };
                    if raw.kind() != Some(PacketType::OperationRequest) {
                        continue;
                    }
                    let request = OperationRequest::parse(raw.payload).unwrap();
                    ops_log
                        .lock()
                        .unwrap()
                        .push((request.operation_code, request.transaction_id));

                    match request.operation_code {
                        op::GET_DEVICE_INFO => {
                            let dataset =
                                device_info_dataset(&options.manufacturer, &options.model);
                            send_data_phase(&mut command, request.transaction_id, &dataset).await;
                        }
                        op::GET_STORAGE_IDS => {
                            let mut dataset = Vec::new();
                            dataset.extend_from_slice(&1u32.to_le_bytes());
                            dataset.extend_from_slice(&0x0001_0001u32.to_le_bytes());
                            send_data_phase(&mut command, request.transaction_id, &dataset).await;
                        }
                        op::GET_OBJECT_INFO => {
                            let dataset = object_info_dataset(
                                &options.object_name,
                                options.object_data.len() as u32,
                            );
                            send_data_phase(&mut command, request.transaction_id, &dataset).await;
                        }
                        op::GET_OBJECT => {
                            send_data_phase(
                                &mut command,
                                request.transaction_id,
                                &options.object_data,
                            )
                            .await;
                        }
                        _ => {}
                    }

                    let response = OperationResponse::new(rc::OK, request.transaction_id);
                    if command.write_all(&response.encode()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

// ============================================================================
// USB 路径
// ============================================================================

struct StubEnumerator {
    id: UsbDeviceId,
}

impl DeviceEnumerator for StubEnumerator {
    fn enumerate(&self) -> shutterlink_core::Result<Vec<UsbDeviceRecord>> {
        Ok(vec![UsbDeviceRecord {
            id: self.id,
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
    fn open(&self, id: &UsbDeviceId) -> shutterlink_core::Result<UsbDeviceHandle> {
        let path = std::env::temp_dir().join(format!(
            "shutterlink-it-usb-{}-{}",
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

/// 设备插入 → 权限已授予 → init 返回 0 → Connected →
/// 外部快门 IMG_0001.JPG → 管线产出 Complete 且大小非零的记录
#[tokio::test]
async fn test_usb_end_to_end_capture() {
    let id = UsbDeviceId {
        vendor_id: 0x04b0,
        product_id: 0x0442,
        bus_number: 1,
        device_address: 42,
    };
    let control = Arc::new(SimulatedControlLibrary::new());
    let registry = Arc::new(UsbRegistry::with_sources(
        Arc::new(StubEnumerator { id }),
        Arc::new(AlwaysGranted),
        fast_config(),
    ));
    let settings = test_settings("usb");
    let connector = UsbConnector::with_parts(
        control.clone(),
        registry,
        Arc::new(TempFileOpener),
        &settings,
        fast_config(),
        std::path::Path::new("/tmp"),
    );

    let endpoint = connector.connect(None, &SilentProgress).await.unwrap();
    assert!(matches!(
        endpoint.transport,
        shutterlink_core::Transport::Usb(_)
    ));
    assert_eq!(connector.context().state(), ConnectionState::Connected);
    assert_eq!(control.init_count(), 1);

    let mut updates = connector.pipeline().subscribe();
    assert!(control.trigger_capture("IMG_0001.JPG", &[0xD8u8; 2048]));

    // Downloading 占位，随后 Complete
    let first = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, DownloadStatus::Downloading);
    let second = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, DownloadStatus::Complete);
    assert_eq!(second.size, 2048);
    assert_eq!(second.file_name, "IMG_0001.JPG");

    connector.disconnect().await;
    assert_eq!(connector.context().state(), ConnectionState::Disconnected);

    // 断开顺序：停监听先于 close
    let calls = control.calls();
    let stop_pos = calls
        .iter()
        .position(|c| c == "stop_event_listener")
        .unwrap();
    let close_pos = calls.iter().rposition(|c| c == "close").unwrap();
    assert!(stop_pos < close_pos);
}

/// 不支持的扩展名被忽略
#[tokio::test]
async fn test_usb_unsupported_capture_ignored() {
    let id = UsbDeviceId {
        vendor_id: 0x04b0,
        product_id: 0x0442,
        bus_number: 1,
        device_address: 43,
    };
    let control = Arc::new(SimulatedControlLibrary::new());
    let registry = Arc::new(UsbRegistry::with_sources(
        Arc::new(StubEnumerator { id }),
        Arc::new(AlwaysGranted),
        fast_config(),
    ));
    let settings = test_settings("usb-skip");
    let connector = UsbConnector::with_parts(
        control.clone(),
        registry,
        Arc::new(TempFileOpener),
        &settings,
        fast_config(),
        std::path::Path::new("/tmp"),
    );

    connector.connect(None, &SilentProgress).await.unwrap();
    control.trigger_capture("MOVIE_0001.MP4", &[0u8; 128]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(connector.pipeline().files().is_empty());
    connector.disconnect().await;
}

// ============================================================================
// WiFi 路径
// ============================================================================

/// 完整 WiFi 场景：握手 → Connected → 事件通道推送 ObjectAdded →
/// GetObjectInfo/GetObject 下载 → Complete 记录落盘
#[tokio::test]
async fn test_wifi_end_to_end_capture_download() {
    let ops_log = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_mock_camera(
        MockCameraOptions {
            push_object_event: true,
            ..Default::default()
        },
        ops_log.clone(),
    )
    .await;

    let settings = test_settings("wifi");
    let download_dir = settings.download_dir.clone();
    let connector = WifiConnector::new(settings, fast_config());
    let endpoint = CameraEndpoint::network(addr, "MockCam");

    let mut updates = connector.pipeline().subscribe();
    connector
        .connect(&endpoint, false, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(connector.context().state(), ConnectionState::Connected);

    let info = connector.device_info().await.unwrap();
    assert_eq!(info.manufacturer, "Sony Corporation");

    let first = tokio::time::timeout(Duration::from_secs(3), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, DownloadStatus::Downloading);
    let second = tokio::time::timeout(Duration::from_secs(3), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, DownloadStatus::Complete);
    assert_eq!(second.size, 4096);
    assert!(download_dir.join("IMG_0001.JPG").exists());

    connector.disconnect().await;
    assert_eq!(connector.context().state(), ConnectionState::Disconnected);

    // 事务序列：GetDeviceInfo(0) → OpenSession(强制 0) → 存储探测(1,2)
    let ops = ops_log.lock().unwrap().clone();
    assert_eq!(ops[0], (op::GET_DEVICE_INFO, 0));
    assert_eq!(ops[1], (op::OPEN_SESSION, 0));
    assert_eq!(ops[2], (op::GET_STORAGE_IDS, 1));
}

/// Nikon 系 STA 模式：一次性会话上的两阶段批准（事务 1、2），
/// 然后新 socket 上的持久握手
#[tokio::test]
async fn test_wifi_vendor_approval_sequence() {
    let ops_log = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_mock_camera(
        MockCameraOptions {
            manufacturer: "Nikon Corporation".to_string(),
            model: "Z 6".to_string(),
            ..Default::default()
        },
        ops_log.clone(),
    )
    .await;

    let settings = test_settings("approval");
    let connector = WifiConnector::new(settings, fast_config());
    let endpoint = CameraEndpoint::network(addr, "NIKON Z 6");

    connector
        .connect(&endpoint, true, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(connector.context().state(), ConnectionState::Connected);
    connector.disconnect().await;

    let ops = ops_log.lock().unwrap().clone();
    // 批准请求在专用会话上使用事务 1、2
    assert!(ops.contains(&(op::VENDOR_DEVICE_DECLARE, 1)));
    assert!(ops.contains(&(op::VENDOR_CONNECTION_APPROVAL, 2)));
    // 三次握手：初始识别 + 批准一次性会话 + 持久会话
    let handshakes = ops
        .iter()
        .filter(|(code, _)| *code == op::GET_DEVICE_INFO)
        .count();
    assert_eq!(handshakes, 3);
    // 每次握手 OpenSession 都强制事务 0
    for (code, txid) in &ops {
        if *code == op::OPEN_SESSION {
            assert_eq!(*txid, 0);
        }
    }
}

/// AP 模式回退：主候选不可达时选中后备候选
/// （loopback 别名 127.0.0.2 不可达 → 127.0.0.3 可达）
#[tokio::test]
async fn test_ap_mode_fallback_candidate_selected() {
    let listener = TcpListener::bind("127.0.0.3:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let service = DiscoveryService::new(fast_config());
    let candidates = [
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)),
    ];
    let endpoints = service
        .probe_candidates(&candidates, port, None)
        .await
        .unwrap();

    assert_eq!(endpoints.len(), 1);
    assert_eq!(
        endpoints[0].socket_addr().unwrap().ip(),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3))
    );
}

/// STA 发现：零服务应答时也在配置的总超时内返回
#[tokio::test]
async fn test_sta_discovery_terminates_within_timeout() {
    let config = fast_config();
    let deadline = config.discovery_timeout;
    let service = DiscoveryService::new(config);

    let started = std::time::Instant::now();
    let result = service.discover_multicast().await;
    // 无论环境是否支持组播，都必须有界返回
    assert!(started.elapsed() < deadline + Duration::from_secs(3));
    if let Ok(endpoints) = result {
        // 测试环境不应有真实 _ptp._tcp 服务
        assert!(endpoints.len() < 10);
    }
}

/// 端点消失后的连接尝试得到有界的快速失败而不是悬挂
#[tokio::test]
async fn test_connect_to_dead_endpoint_fails_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let settings = test_settings("dead");
    let connector = WifiConnector::new(settings, fast_config());
    let endpoint = CameraEndpoint::network(addr, "gone");

    let started = std::time::Instant::now();
    let result = connector.connect(&endpoint, false, &SilentProgress).await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(connector.context().state(), ConnectionState::Error);
}
