//! PTP/IP 会话管理
//!
//! 一个会话拥有命令/事件两条 socket、握手得到的 connectionNumber
//! 和单调递增的 transactionId。生命周期从一次成功握手到断开，
//! 重连永远新建会话而不是复用。
//!
//! # 握手序列
//!
//! 1. 命令 socket 上发 Init Command Request（GUID + UTF-16 主机名 +
//!    版本），对端应答携带 connectionNumber 的 ACK
//! 2. 事件 socket 上发 Init Event Request（回传 connectionNumber），
//!    InitFail(5) 即硬失败
//! 3. GetDeviceInfo——事务 0，失败可容忍（信息性操作）
//! 4. OpenSession——事务号强制为 0 且不递增计数器。对端实现要求
//!    前两个操作共享事务 0，这是逐位保真的协议兼容要求。失败致命
//! 5. 可选的存储探测，失败可容忍
//!
//! 所有读取都有界（~2s）；声明长度和实际不符的包被丢弃而不是崩溃。

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::capture::CaptureNotice;
use crate::config::TimingConfig;
use crate::error::{CameraError, Result};
use crate::ptpip::packet::{
    self, DataChunk, DeviceInfo, EventPacket, HEADER_LEN, InitCommandAck, MAX_PACKET_LEN,
    OperationRequest, OperationResponse, RawPacket, StartData,
};
use crate::ptpip::{PROTOCOL_VERSION, PacketType, ev, op, rc};

/// 单个对象的元信息（ObjectInfo 数据集节选）
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub filename: String,
    pub compressed_size: u32,
    pub object_format: u16,
}

/// PTP/IP 会话
pub struct PtpIpSession {
    command: TcpStream,
    event: Option<TcpStream>,
    pub connection_number: u32,
    transaction_id: u32,
    pub device_info: Option<DeviceInfo>,
    read_timeout: Duration,
    closed: bool,
}

impl PtpIpSession {
    /// 建立会话：双 socket + 完整握手 + 存储探测
    pub async fn connect(
        addr: SocketAddr,
        guid: &[u8; 16],
        host_name: &str,
        config: &TimingConfig,
    ) -> Result<Self> {
        Self::establish(addr, guid, host_name, config, true).await
    }

    /// 建立会话但跳过存储探测
    ///
    /// 厂商批准序列要求握手后的前两个操作是它的专用请求
    /// （事务 1、2），存储探测会占掉这两个事务号。
    pub async fn connect_without_storage_probe(
        addr: SocketAddr,
        guid: &[u8; 16],
        host_name: &str,
        config: &TimingConfig,
    ) -> Result<Self> {
        Self::establish(addr, guid, host_name, config, false).await
    }

    async fn establish(
        addr: SocketAddr,
        guid: &[u8; 16],
        host_name: &str,
        config: &TimingConfig,
        probe_storage: bool,
    ) -> Result<Self> {
        info!("PTP/IP connecting to {}", addr);

        // 命令通道
        let mut command = timeout(config.read_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CameraError::Timeout(config.read_timeout))??;
        command.set_nodelay(true)?;

        let init = packet::encode_init_command_request(guid, host_name, PROTOCOL_VERSION);
        write_frame(&mut command, &init, config.read_timeout).await?;

        let raw = read_raw_packet(&mut command, config.read_timeout).await?;
        let connection_number = match raw.kind() {
            Some(PacketType::InitCommandAck) => {
                let ack = InitCommandAck::parse(raw.payload)?;
                debug!(
                    "Init command ack: connection {} from '{}'",
                    ack.connection_number, ack.name
                );
                ack.connection_number
            }
            Some(PacketType::InitFail) => {
                let reason = parse_init_fail_reason(&raw);
                return Err(CameraError::HandshakeRejected { reason });
            }
            other => {
                return Err(CameraError::Protocol(format!(
                    "expected init command ack, got {:?}",
                    other
                )));
            }
        };

        // 事件通道，回传 connectionNumber 绑定到同一逻辑会话
        let mut event = timeout(config.read_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CameraError::Timeout(config.read_timeout))??;
        event.set_nodelay(true)?;

        let init_event = packet::encode_init_event_request(connection_number);
        write_frame(&mut event, &init_event, config.read_timeout).await?;

        let raw = read_raw_packet(&mut event, config.read_timeout).await?;
        match raw.kind() {
            Some(PacketType::InitEventAck) => {}
            Some(PacketType::InitFail) => {
                let reason = parse_init_fail_reason(&raw);
                return Err(CameraError::HandshakeRejected { reason });
            }
            other => {
                return Err(CameraError::Protocol(format!(
                    "expected init event ack, got {:?}",
                    other
                )));
            }
        }

        let mut session = Self {
            command,
            event: Some(event),
            connection_number,
            transaction_id: 0,
            device_info: None,
            read_timeout: config.read_timeout,
            closed: false,
        };

        // GetDeviceInfo 是信息性的，失败记录但不中止会话
        match session.get_device_info().await {
            Ok(info) => {
                debug!(
                    "Device: {} {} (fw {})",
                    info.manufacturer, info.model, info.device_version
                );
            }
            Err(e) => warn!("GetDeviceInfo failed (tolerated): {}", e),
        }

        // OpenSession 失败对会话建立是致命的
        session.open_session().await?;

        // 存储探测确认媒体可访问，失败可容忍
        if probe_storage {
            match session.get_storage_ids().await {
                Ok(ids) if !ids.is_empty() => {
                    if let Err(e) = session.get_storage_info(ids[0]).await {
                        warn!("GetStorageInfo failed (tolerated): {}", e);
                    }
                }
                Ok(_) => debug!("No storage reported"),
                Err(e) => warn!("GetStorageIDs failed (tolerated): {}", e),
            }
        }

        info!("PTP/IP session established (connection {})", connection_number);
        Ok(session)
    }

    /// 取走事件 socket，交给事件泵任务
    pub fn take_event_stream(&mut self) -> Option<TcpStream> {
        self.event.take()
    }

    fn next_transaction_id(&mut self) -> u32 {
        let id = self.transaction_id;
        self.transaction_id = self.transaction_id.wrapping_add(1);
        id
    }

    /// 执行一次操作：请求 → (数据阶段) → 响应
    pub async fn execute(
        &mut self,
        operation_code: u16,
        parameters: Vec<u32>,
    ) -> Result<(OperationResponse, Option<Vec<u8>>)> {
        let transaction_id = self.next_transaction_id();
        self.execute_with_txid(operation_code, transaction_id, parameters)
            .await
    }

    /// OpenSession 的事务号强制为 0，不触碰计数器
    ///
    /// 对端要求前两个操作（GetDeviceInfo、OpenSession）共享事务 0；
    /// 这是协议兼容要求，必须保持。
    pub async fn open_session(&mut self) -> Result<()> {
        let (response, _) = self.execute_with_txid(op::OPEN_SESSION, 0, vec![1]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        Ok(())
    }

    async fn execute_with_txid(
        &mut self,
        operation_code: u16,
        transaction_id: u32,
        parameters: Vec<u32>,
    ) -> Result<(OperationResponse, Option<Vec<u8>>)> {
        if self.closed {
            return Err(CameraError::SessionClosed);
        }

        let request = OperationRequest::new(operation_code, transaction_id, parameters);
        write_frame(&mut self.command, &request.encode(), self.read_timeout).await?;

        let mut data: Option<Vec<u8>> = None;
        let mut expected_total: Option<u64> = None;

        // 读到 OperationResponse 为止，中途重组数据阶段
        loop {
            let raw = match read_raw_packet(&mut self.command, self.read_timeout).await {
                Ok(raw) => raw,
                Err(e @ CameraError::Protocol(_)) => {
                    // 损坏的包丢弃，继续等响应
                    warn!("Discarding malformed packet: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match raw.kind() {
                Some(PacketType::OperationResponse) => {
                    let response = OperationResponse::parse(raw.payload)?;
                    if response.transaction_id != transaction_id {
                        warn!(
                            "Response for transaction {} while waiting for {}, discarding",
                            response.transaction_id, transaction_id
                        );
                        continue;
                    }
                    if let (Some(expected), Some(actual)) =
                        (expected_total, data.as_ref().map(|d| d.len() as u64))
                    {
                        if expected != actual {
                            warn!(
                                "Data phase length mismatch: announced {}, received {}",
                                expected, actual
                            );
                        }
                    }
                    return Ok((response, data));
                }
                Some(PacketType::StartData) => {
                    let start = StartData::parse(raw.payload)?;
                    if start.transaction_id == transaction_id {
                        expected_total = Some(start.total_length);
                        data = Some(Vec::with_capacity(
                            start.total_length.min(MAX_PACKET_LEN as u64) as usize,
                        ));
                    }
                }
                Some(PacketType::Data) | Some(PacketType::EndData) => {
                    let chunk = DataChunk::parse(raw.payload)?;
                    if chunk.transaction_id == transaction_id {
                        data.get_or_insert_with(Vec::new).extend_from_slice(&chunk.data);
                    }
                }
                other => {
                    debug!("Unexpected packet {:?} on command channel, discarding", other);
                }
            }
        }
    }

    /// 请求并解析设备信息，结果缓存在会话上
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo> {
        let (response, data) = self.execute(op::GET_DEVICE_INFO, vec![]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        let payload = data.ok_or_else(|| {
            CameraError::Protocol("GetDeviceInfo returned no dataset".to_string())
        })?;
        let info = DeviceInfo::parse(&payload)?;
        self.device_info = Some(info.clone());
        Ok(info)
    }

    pub async fn get_storage_ids(&mut self) -> Result<Vec<u32>> {
        let (response, data) = self.execute(op::GET_STORAGE_IDS, vec![]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        let payload = data.unwrap_or_default();
        let mut reader = packet::DatasetReader::new(&payload);
        reader.read_u32_array()
    }

    pub async fn get_storage_info(&mut self, storage_id: u32) -> Result<()> {
        let (response, _) = self.execute(op::GET_STORAGE_INFO, vec![storage_id]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        Ok(())
    }

    /// 对象元信息（文件名、大小）
    pub async fn get_object_info(&mut self, handle: u32) -> Result<ObjectInfo> {
        let (response, data) = self.execute(op::GET_OBJECT_INFO, vec![handle]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        let payload = data.ok_or_else(|| {
            CameraError::Protocol("GetObjectInfo returned no dataset".to_string())
        })?;
        parse_object_info(&payload)
    }

    /// 下载完整对象
    pub async fn get_object(&mut self, handle: u32) -> Result<Vec<u8>> {
        let (response, data) = self.execute(op::GET_OBJECT, vec![handle]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        data.ok_or_else(|| CameraError::Protocol("GetObject returned no data".to_string()))
    }

    /// 关闭会话；挂起的后续操作快速失败
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.command.shutdown().await;
        if let Some(mut event) = self.event.take() {
            let _ = event.shutdown().await;
        }
        debug!("PTP/IP session closed (connection {})", self.connection_number);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// ObjectInfo 数据集解析（文件名/大小/格式）
fn parse_object_info(payload: &[u8]) -> Result<ObjectInfo> {
    let mut reader = packet::DatasetReader::new(payload);
    reader.read_u32()?; // storage id
    let object_format = reader.read_u16()?;
    reader.read_u16()?; // protection status
    let compressed_size = reader.read_u32()?;
    reader.read_u16()?; // thumb format
    reader.read_u32()?; // thumb compressed size
    reader.read_u32()?; // thumb pix width
    reader.read_u32()?; // thumb pix height
    reader.read_u32()?; // image pix width
    reader.read_u32()?; // image pix height
    reader.read_u32()?; // image bit depth
    reader.read_u32()?; // parent object
    reader.read_u16()?; // association type
    reader.read_u32()?; // association desc
    reader.read_u32()?; // sequence number
    let filename = reader.read_string()?;
    Ok(ObjectInfo {
        filename,
        compressed_size,
        object_format,
    })
}

fn parse_init_fail_reason(raw: &RawPacket) -> u32 {
    if raw.payload.len() >= 4 {
        u32::from_le_bytes([
            raw.payload[0],
            raw.payload[1],
            raw.payload[2],
            raw.payload[3],
        ])
    } else {
        0
    }
}

/// 有界写入
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &[u8],
    bound: Duration,
) -> Result<()> {
    timeout(bound, stream.write_all(frame))
        .await
        .map_err(|_| CameraError::Timeout(bound))??;
    Ok(())
}

/// 有界读取一个完整的包
///
/// 声明长度越界（< 包头 或 > 上限）返回协议违例，调用方丢弃。
pub async fn read_raw_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
    bound: Duration,
) -> Result<RawPacket> {
    let mut header = [0u8; HEADER_LEN];
    timeout(bound, stream.read_exact(&mut header))
        .await
        .map_err(|_| CameraError::Timeout(bound))??;

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_type = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if length < HEADER_LEN || length > MAX_PACKET_LEN {
        return Err(CameraError::Protocol(format!(
            "packet declares impossible length {}",
            length
        )));
    }

    let mut payload = vec![0u8; length - HEADER_LEN];
    timeout(bound, stream.read_exact(&mut payload))
        .await
        .map_err(|_| CameraError::Timeout(bound))??;

    Ok(RawPacket {
        packet_type,
        payload: payload.into(),
    })
}

/// 事件 socket 上无界读取（专职工作者阻塞在这里）
pub async fn read_event_packet(stream: &mut TcpStream) -> Result<RawPacket> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_type = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if length < HEADER_LEN || length > MAX_PACKET_LEN {
        return Err(CameraError::Protocol(format!(
            "event packet declares impossible length {}",
            length
        )));
    }

    let mut payload = vec![0u8; length - HEADER_LEN];
    stream.read_exact(&mut payload).await?;

    Ok(RawPacket {
        packet_type,
        payload: payload.into(),
    })
}

/// 启动事件泵：把事件 socket 上的推送转成拍摄通知
///
/// 独占一个长期任务，阻塞在 socket 读上；socket 关闭或出错时
/// 发出传输层脱离通知后退出。
pub fn spawn_event_pump(
    mut event_stream: TcpStream,
    tx: mpsc::Sender<CaptureNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let raw = match read_event_packet(&mut event_stream).await {
                Ok(raw) => raw,
                Err(CameraError::Protocol(msg)) => {
                    // 损坏的事件包丢弃，泵继续工作
                    warn!("Discarding malformed event packet: {}", msg);
                    continue;
                }
                Err(e) => {
                    debug!("Event channel ended: {}", e);
                    let _ = tx.send(CaptureNotice::TransportDetached).await;
                    break;
                }
            };

            if raw.kind() != Some(PacketType::Event) {
                debug!("Non-event packet {} on event channel, discarding", raw.packet_type);
                continue;
            }

            let event = match EventPacket::parse(raw.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Unparseable event packet: {}", e);
                    continue;
                }
            };

            let notice = match event.event_code {
                ev::OBJECT_ADDED => {
                    let Some(&handle) = event.parameters.first() else {
                        warn!("ObjectAdded event without handle");
                        continue;
                    };
                    CaptureNotice::ObjectAdded { handle }
                }
                ev::CAPTURE_COMPLETE => CaptureNotice::FlushComplete,
                other => {
                    debug!("Ignoring event {:#06x}", other);
                    continue;
                }
            };

            if tx.send(notice).await.is_err() {
                debug!("Capture channel closed, event pump exiting");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn fast_config() -> TimingConfig {
        TimingConfig {
            read_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn device_info_dataset() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&100u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&packet::encode_ptp_string(""));
        data.extend_from_slice(&0u16.to_le_bytes());
        for _ in 0..5 {
            data.extend_from_slice(&0u32.to_le_bytes());
        }
        data.extend_from_slice(&packet::encode_ptp_string("Nikon Corporation"));
        data.extend_from_slice(&packet::encode_ptp_string("Z 6"));
        data.extend_from_slice(&packet::encode_ptp_string("1.10"));
        data.extend_from_slice(&packet::encode_ptp_string("3001234"));
        data
    }

    /// 最小的脚本化相机：接受两条连接、应答握手、记录收到的操作
    async fn spawn_mock_camera(
        listener: TcpListener,
        seen_ops: Arc<Mutex<Vec<(u16, u32)>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let bound = Duration::from_secs(2);
            let (mut command, _) = listener.accept().await.unwrap();

            // Init Command
            let raw = read_raw_packet(&mut command, bound).await.unwrap();
            assert_eq!(raw.kind(), Some(PacketType::InitCommandRequest));
            let ack = InitCommandAck {
                connection_number: 7,
                guid: [0u8; 16],
                name: "MockCam".to_string(),
                version: PROTOCOL_VERSION,
            };
            command.write_all(&ack.encode()).await.unwrap();

            // Init Event
            let (mut event, _) = listener.accept().await.unwrap();
            let raw = read_raw_packet(&mut event, bound).await.unwrap();
            assert_eq!(raw.kind(), Some(PacketType::InitEventRequest));
            event
                .write_all(&packet::encode_init_event_ack())
                .await
                .unwrap();

            // 命令循环
            loop {
                let raw = match read_raw_packet(&mut command, Duration::from_secs(5)).await {
                    Ok(raw) => raw,
                    Err(_) => break,
                };
                if raw.kind() != Some(PacketType::OperationRequest) {
                    continue;
                }
                let request = OperationRequest::parse(raw.payload).unwrap();
                seen_ops
                    .lock()
                    .unwrap()
                    .push((request.operation_code, request.transaction_id));

                match request.operation_code {
                    op::GET_DEVICE_INFO => {
                        let dataset = device_info_dataset();
                        let start = StartData {
                            transaction_id: request.transaction_id,
                            total_length: dataset.len() as u64,
                        };
                        command.write_all(&start.encode()).await.unwrap();
                        // 拆成两段验证重组
                        let mid = dataset.len() / 2;
                        let chunk1 = DataChunk {
                            transaction_id: request.transaction_id,
                            data: dataset[..mid].to_vec().into(),
                        };
                        command.write_all(&chunk1.encode(false)).await.unwrap();
                        let chunk2 = DataChunk {
                            transaction_id: request.transaction_id,
                            data: dataset[mid..].to_vec().into(),
                        };
                        command.write_all(&chunk2.encode(true)).await.unwrap();
                        let response =
                            OperationResponse::new(rc::OK, request.transaction_id);
                        command.write_all(&response.encode()).await.unwrap();
                    }
                    op::GET_STORAGE_IDS => {
                        let mut dataset = Vec::new();
                        dataset.extend_from_slice(&1u32.to_le_bytes());
                        dataset.extend_from_slice(&0x0001_0001u32.to_le_bytes());
                        let chunk = DataChunk {
                            transaction_id: request.transaction_id,
                            data: dataset.into(),
                        };
                        let start = StartData {
                            transaction_id: request.transaction_id,
                            total_length: chunk.data.len() as u64,
                        };
                        command.write_all(&start.encode()).await.unwrap();
                        command.write_all(&chunk.encode(true)).await.unwrap();
                        let response =
                            OperationResponse::new(rc::OK, request.transaction_id);
                        command.write_all(&response.encode()).await.unwrap();
                    }
                    _ => {
                        let response = OperationResponse::new(rc::OK, request.transaction_id);
                        command.write_all(&response.encode()).await.unwrap();
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_handshake_shares_transaction_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_ops = Arc::new(Mutex::new(Vec::new()));
        let server = spawn_mock_camera(listener, seen_ops.clone()).await;

        let mut session =
            PtpIpSession::connect(addr, &[1u8; 16], "test-host", &fast_config())
                .await
                .unwrap();

        assert_eq!(session.connection_number, 7);
        let info = session.device_info.clone().unwrap();
        assert_eq!(info.manufacturer, "Nikon Corporation");
        assert_eq!(info.model, "Z 6");

        // 握手后的下一个操作拿到事务 1
        let (response, _) = session.execute(op::GET_OBJECT_INFO, vec![1]).await.unwrap();
        assert_eq!(response.response_code, rc::OK);

        session.close().await;
        server.abort();

        let ops = seen_ops.lock().unwrap().clone();
        // GetDeviceInfo 事务 0；OpenSession 强制事务 0；存储探测 1、2；后续 3
        assert_eq!(ops[0], (op::GET_DEVICE_INFO, 0));
        assert_eq!(ops[1], (op::OPEN_SESSION, 0));
        assert_eq!(ops[2], (op::GET_STORAGE_IDS, 1));
        assert_eq!(ops[3], (op::GET_STORAGE_INFO, 2));
        assert_eq!(ops[4], (op::GET_OBJECT_INFO, 3));
    }

    #[tokio::test]
    async fn test_init_fail_rejects_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut command, _) = listener.accept().await.unwrap();
            let _ = read_raw_packet(&mut command, Duration::from_secs(2))
                .await
                .unwrap();
            // InitFail 载荷携带原因码
            let fail = packet::encode_frame(PacketType::InitFail, &5u32.to_le_bytes());
            command.write_all(&fail).await.unwrap();
        });

        let result = PtpIpSession::connect(addr, &[1u8; 16], "test-host", &fast_config()).await;
        match result {
            Err(CameraError::HandshakeRejected { reason }) => assert_eq!(reason, 5),
            other => panic!("expected handshake rejection, got {:?}", other.map(|_| ())),
        }
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_operations_fail_fast_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_ops = Arc::new(Mutex::new(Vec::new()));
        let server = spawn_mock_camera(listener, seen_ops).await;

        let mut session =
            PtpIpSession::connect(addr, &[1u8; 16], "test-host", &fast_config())
                .await
                .unwrap();
        session.close().await;

        let result = session.execute(op::GET_STORAGE_IDS, vec![]).await;
        assert!(matches!(result, Err(CameraError::SessionClosed)));
        server.abort();
    }

    #[tokio::test]
    async fn test_event_pump_translates_object_added() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let event = EventPacket {
                event_code: ev::OBJECT_ADDED,
                transaction_id: 0,
                parameters: vec![0x00AB_CDEF],
            };
            stream.write_all(&event.encode()).await.unwrap();
            // 未知事件应被忽略
            let unknown = EventPacket {
                event_code: 0x4FFF,
                transaction_id: 0,
                parameters: vec![],
            };
            stream.write_all(&unknown.encode()).await.unwrap();
            // 保持一会再关闭，触发脱离通知
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let pump = spawn_event_pump(stream, tx);

        let notice = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            notice,
            CaptureNotice::ObjectAdded { handle: 0x00AB_CDEF }
        ));

        let detached = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(detached, CaptureNotice::TransportDetached));

        let _ = server.await;
        let _ = pump.await;
    }
}
