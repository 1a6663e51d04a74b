//! PTP/IP 二进制包编解码
//!
//! 线上格式（全部小端序）:
//!
//! ```text
//! u32 length | u32 type | payload
//! ```
//!
//! `length` 包含 8 字节包头。OperationRequest 载荷为
//! `u32 dataPhase | u16 opcode | u32 transactionId | u32* params`。
//! 多包传输为 `StartData → Data* → EndData`，共享同一个 transactionId。
//!
//! 字符串采用两种编码：Init 包中为 UTF-16LE 零结尾字符串；
//! PTP 数据集（如 DeviceInfo）中为带字符数前缀的 PTP String。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CameraError;
use crate::ptpip::PacketType;

/// 包头长度（length + type）
pub const HEADER_LEN: usize = 8;

/// 单个包允许的最大长度。数据包可能携带整张照片的分片，
/// 超出此值按协议违例丢弃。
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// 已剥离包头的原始包
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub packet_type: u32,
    pub payload: Bytes,
}

impl RawPacket {
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u32(self.packet_type)
    }
}

/// 编码完整的一帧：包头 + 载荷
pub fn encode_frame(packet_type: PacketType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le((HEADER_LEN + payload.len()) as u32);
    buf.put_u32_le(packet_type as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// 从完整的一帧解出包类型和载荷
///
/// 声明长度与实际字节数不符的帧返回协议违例，由调用方丢弃。
pub fn decode_frame(frame: &[u8]) -> Result<RawPacket, CameraError> {
    if frame.len() < HEADER_LEN {
        return Err(CameraError::Protocol(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let mut buf = frame;
    let length = buf.get_u32_le() as usize;
    let packet_type = buf.get_u32_le();
    if length != frame.len() {
        return Err(CameraError::Protocol(format!(
            "declared length {} != actual {}",
            length,
            frame.len()
        )));
    }
    Ok(RawPacket {
        packet_type,
        payload: Bytes::copy_from_slice(buf),
    })
}

// ============================================================================
// Init 包
// ============================================================================

/// 编码 Init Command Request: GUID + UTF-16 主机名 + 协议版本
pub fn encode_init_command_request(guid: &[u8; 16], host_name: &str, version: u32) -> Bytes {
    let name = encode_utf16le_z(host_name);
    let mut payload = BytesMut::with_capacity(16 + name.len() + 4);
    payload.put_slice(guid);
    payload.put_slice(&name);
    payload.put_u32_le(version);
    encode_frame(PacketType::InitCommandRequest, &payload)
}

/// Init Command ACK 载荷
#[derive(Debug, Clone)]
pub struct InitCommandAck {
    pub connection_number: u32,
    pub guid: [u8; 16],
    pub name: String,
    pub version: u32,
}

impl InitCommandAck {
    /// 解析 ACK 载荷。相机侧名称偶尔编码损坏，宽容处理。
    pub fn parse(mut payload: Bytes) -> Result<Self, CameraError> {
        if payload.len() < 4 + 16 {
            return Err(CameraError::Protocol(format!(
                "init command ack too short: {} bytes",
                payload.len()
            )));
        }
        let connection_number = payload.get_u32_le();
        let mut guid = [0u8; 16];
        payload.copy_to_slice(&mut guid);
        let (name, consumed) = decode_utf16le_z(&payload);
        payload.advance(consumed);
        let version = if payload.len() >= 4 {
            payload.get_u32_le()
        } else {
            0
        };
        Ok(Self {
            connection_number,
            guid,
            name,
            version,
        })
    }

    /// 编码 ACK（测试中的模拟相机使用）
    pub fn encode(&self) -> Bytes {
        let name = encode_utf16le_z(&self.name);
        let mut payload = BytesMut::with_capacity(4 + 16 + name.len() + 4);
        payload.put_u32_le(self.connection_number);
        payload.put_slice(&self.guid);
        payload.put_slice(&name);
        payload.put_u32_le(self.version);
        encode_frame(PacketType::InitCommandAck, &payload)
    }
}

/// 编码 Init Event Request: 绑定命令通道的 connectionNumber
pub fn encode_init_event_request(connection_number: u32) -> Bytes {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32_le(connection_number);
    encode_frame(PacketType::InitEventRequest, &payload)
}

/// 编码 Init Event ACK（模拟相机使用）
pub fn encode_init_event_ack() -> Bytes {
    encode_frame(PacketType::InitEventAck, &[])
}

// ============================================================================
// 操作请求/响应
// ============================================================================

/// 操作请求帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub data_phase: u32,
    pub operation_code: u16,
    pub transaction_id: u32,
    pub parameters: Vec<u32>,
}

impl OperationRequest {
    pub fn new(operation_code: u16, transaction_id: u32, parameters: Vec<u32>) -> Self {
        Self {
            data_phase: 1,
            operation_code,
            transaction_id,
            parameters,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(10 + self.parameters.len() * 4);
        payload.put_u32_le(self.data_phase);
        payload.put_u16_le(self.operation_code);
        payload.put_u32_le(self.transaction_id);
        for p in &self.parameters {
            payload.put_u32_le(*p);
        }
        encode_frame(PacketType::OperationRequest, &payload)
    }

    pub fn parse(mut payload: Bytes) -> Result<Self, CameraError> {
        if payload.len() < 10 {
            return Err(CameraError::Protocol(format!(
                "operation request too short: {} bytes",
                payload.len()
            )));
        }
        let data_phase = payload.get_u32_le();
        let operation_code = payload.get_u16_le();
        let transaction_id = payload.get_u32_le();
        let mut parameters = Vec::new();
        while payload.len() >= 4 {
            parameters.push(payload.get_u32_le());
        }
        Ok(Self {
            data_phase,
            operation_code,
            transaction_id,
            parameters,
        })
    }
}

/// 操作响应帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub response_code: u16,
    pub transaction_id: u32,
    pub parameters: Vec<u32>,
}

impl OperationResponse {
    pub fn new(response_code: u16, transaction_id: u32) -> Self {
        Self {
            response_code,
            transaction_id,
            parameters: Vec::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(6 + self.parameters.len() * 4);
        payload.put_u16_le(self.response_code);
        payload.put_u32_le(self.transaction_id);
        for p in &self.parameters {
            payload.put_u32_le(*p);
        }
        encode_frame(PacketType::OperationResponse, &payload)
    }

    pub fn parse(mut payload: Bytes) -> Result<Self, CameraError> {
        if payload.len() < 6 {
            return Err(CameraError::Protocol(format!(
                "operation response too short: {} bytes",
                payload.len()
            )));
        }
        let response_code = payload.get_u16_le();
        let transaction_id = payload.get_u32_le();
        let mut parameters = Vec::new();
        while payload.len() >= 4 {
            parameters.push(payload.get_u32_le());
        }
        Ok(Self {
            response_code,
            transaction_id,
            parameters,
        })
    }
}

// ============================================================================
// 数据阶段
// ============================================================================

/// StartData: 宣告本事务将要传输的总字节数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartData {
    pub transaction_id: u32,
    pub total_length: u64,
}

impl StartData {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32_le(self.transaction_id);
        payload.put_u64_le(self.total_length);
        encode_frame(PacketType::StartData, &payload)
    }

    pub fn parse(mut payload: Bytes) -> Result<Self, CameraError> {
        if payload.len() < 12 {
            return Err(CameraError::Protocol(format!(
                "start data too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            transaction_id: payload.get_u32_le(),
            total_length: payload.get_u64_le(),
        })
    }
}

/// Data / EndData: 事务 ID + 数据分片
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub transaction_id: u32,
    pub data: Bytes,
}

impl DataChunk {
    pub fn encode(&self, end: bool) -> Bytes {
        let mut payload = BytesMut::with_capacity(4 + self.data.len());
        payload.put_u32_le(self.transaction_id);
        payload.put_slice(&self.data);
        let kind = if end {
            PacketType::EndData
        } else {
            PacketType::Data
        };
        encode_frame(kind, &payload)
    }

    pub fn parse(mut payload: Bytes) -> Result<Self, CameraError> {
        if payload.len() < 4 {
            return Err(CameraError::Protocol(format!(
                "data packet too short: {} bytes",
                payload.len()
            )));
        }
        let transaction_id = payload.get_u32_le();
        Ok(Self {
            transaction_id,
            data: payload,
        })
    }
}

// ============================================================================
// 事件
// ============================================================================

/// 事件 socket 上推送的事件帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPacket {
    pub event_code: u16,
    pub transaction_id: u32,
    pub parameters: Vec<u32>,
}

impl EventPacket {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(6 + self.parameters.len() * 4);
        payload.put_u16_le(self.event_code);
        payload.put_u32_le(self.transaction_id);
        for p in &self.parameters {
            payload.put_u32_le(*p);
        }
        encode_frame(PacketType::Event, &payload)
    }

    pub fn parse(mut payload: Bytes) -> Result<Self, CameraError> {
        if payload.len() < 6 {
            return Err(CameraError::Protocol(format!(
                "event packet too short: {} bytes",
                payload.len()
            )));
        }
        let event_code = payload.get_u16_le();
        let transaction_id = payload.get_u32_le();
        let mut parameters = Vec::new();
        while payload.len() >= 4 {
            parameters.push(payload.get_u32_le());
        }
        Ok(Self {
            event_code,
            transaction_id,
            parameters,
        })
    }
}

// ============================================================================
// 字符串编码
// ============================================================================

/// 编码 UTF-16LE 零结尾字符串
pub fn encode_utf16le_z(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2 + 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// 解码 UTF-16LE 零结尾字符串，返回 (字符串, 消耗的字节数)
///
/// 无效码元宽容替换，不会因损坏的相机固件数据而失败。
pub fn decode_utf16le_z(bytes: &[u8]) -> (String, usize) {
    let mut units = Vec::new();
    let mut consumed = 0;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        consumed += 2;
        let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    (String::from_utf16_lossy(&units), consumed)
}

// ============================================================================
// PTP 数据集
// ============================================================================

/// GetDeviceInfo 返回的设备信息，每个会话解析一次
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
    /// 原始厂商字段字节，供损坏编码时的逐字节匹配使用
    pub raw_manufacturer: Vec<u8>,
}

impl DeviceInfo {
    /// 解析 PTP DeviceInfo 数据集
    ///
    /// 布局: StandardVersion(u16) | VendorExtensionID(u32) |
    /// VendorExtensionVersion(u16) | VendorExtensionDesc(string) |
    /// FunctionalMode(u16) | OperationsSupported(u16[]) |
    /// EventsSupported(u16[]) | DevicePropertiesSupported(u16[]) |
    /// CaptureFormats(u16[]) | ImageFormats(u16[]) |
    /// Manufacturer(string) | Model(string) | DeviceVersion(string) |
    /// SerialNumber(string)
    pub fn parse(payload: &[u8]) -> Result<Self, CameraError> {
        let mut reader = DatasetReader::new(payload);
        reader.read_u16()?; // standard version
        reader.read_u32()?; // vendor extension id
        reader.read_u16()?; // vendor extension version
        reader.skip_string()?; // vendor extension description
        reader.read_u16()?; // functional mode
        reader.skip_u16_array()?; // operations supported
        reader.skip_u16_array()?; // events supported
        reader.skip_u16_array()?; // device properties supported
        reader.skip_u16_array()?; // capture formats
        reader.skip_u16_array()?; // image formats

        let (manufacturer, raw_manufacturer) = reader.read_string_raw()?;
        let (model, _) = reader.read_string_raw()?;
        let (device_version, _) = reader.read_string_raw()?;
        let (serial_number, _) = reader.read_string_raw()?;

        Ok(Self {
            manufacturer,
            model,
            device_version,
            serial_number,
            raw_manufacturer,
        })
    }
}

/// PTP 数据集顺序读取器
pub struct DatasetReader<'a> {
    buf: &'a [u8],
}

impl<'a> DatasetReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CameraError> {
        if self.buf.len() < n {
            return Err(CameraError::Protocol(format!(
                "dataset truncated: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn read_u16(&mut self) -> Result<u16, CameraError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CameraError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CameraError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// 读取 PTP String: u8 字符数（含结尾 null）+ UTF-16LE 码元
    ///
    /// 同时返回原始字节，供厂商识别在编码损坏时回退匹配。
    pub fn read_string_raw(&mut self) -> Result<(String, Vec<u8>), CameraError> {
        let count = self.take(1)?[0] as usize;
        if count == 0 {
            return Ok((String::new(), Vec::new()));
        }
        let raw = self.take(count * 2)?.to_vec();
        let (text, _) = decode_utf16le_z(&raw);
        Ok((text, raw))
    }

    pub fn read_string(&mut self) -> Result<String, CameraError> {
        self.read_string_raw().map(|(s, _)| s)
    }

    pub fn skip_string(&mut self) -> Result<(), CameraError> {
        let count = self.take(1)?[0] as usize;
        self.take(count * 2)?;
        Ok(())
    }

    pub fn read_u32_array(&mut self) -> Result<Vec<u32>, CameraError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.read_u32()?);
        }
        Ok(out)
    }

    pub fn skip_u16_array(&mut self) -> Result<(), CameraError> {
        let count = self.read_u32()? as usize;
        self.take(count * 2)?;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// 构造 PTP String 字节（模拟相机与测试使用）
pub fn encode_ptp_string(s: &str) -> Vec<u8> {
    if s.is_empty() {
        return vec![0];
    }
    let units: Vec<u16> = s.encode_utf16().chain(std::iter::once(0)).collect();
    let mut out = Vec::with_capacity(1 + units.len() * 2);
    out.push(units.len() as u8);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}
