//! PTP/IP 协议实现
//!
//! 从零实现的 PTP over TCP 客户端：
//!
//! - **packet**: 二进制包编解码（小端序，长度前缀）
//! - **session**: 命令/事件双 socket 会话管理和握手
//! - **discovery**: AP 网关探测 + mDNS 服务发现
//! - **auth**: 厂商两阶段连接批准序列

pub mod auth;
pub mod discovery;
pub mod packet;
pub mod session;

pub use auth::{VendorHint, classify_vendor, run_approval};
pub use discovery::{DiscoveryService, tcp_probe};
pub use packet::{DeviceInfo, OperationRequest, OperationResponse, RawPacket};
pub use session::PtpIpSession;

/// PTP/IP 标准 TCP 端口
pub const PTPIP_PORT: u16 = 15740;

/// mDNS 服务类型（mdns-sd 要求带 `.local.` 后缀）
pub const SERVICE_TYPE: &str = "_ptp._tcp.local.";

/// Init Command Request 携带的协议版本号 (1.0)
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// PTP/IP 包类型
///
/// 与 CIPA DC-X005 一致。Data(10) 是 StartData 和 EndData 之间的
/// 中间数据包。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    InitCommandRequest = 1,
    InitCommandAck = 2,
    InitEventRequest = 3,
    InitEventAck = 4,
    InitFail = 5,
    OperationRequest = 6,
    OperationResponse = 7,
    Event = 8,
    StartData = 9,
    Data = 10,
    Cancel = 11,
    EndData = 12,
}

impl PacketType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => PacketType::InitCommandRequest,
            2 => PacketType::InitCommandAck,
            3 => PacketType::InitEventRequest,
            4 => PacketType::InitEventAck,
            5 => PacketType::InitFail,
            6 => PacketType::OperationRequest,
            7 => PacketType::OperationResponse,
            8 => PacketType::Event,
            9 => PacketType::StartData,
            10 => PacketType::Data,
            11 => PacketType::Cancel,
            12 => PacketType::EndData,
            _ => return None,
        })
    }
}

/// PTP 操作码
pub mod op {
    pub const GET_DEVICE_INFO: u16 = 0x1001;
    pub const OPEN_SESSION: u16 = 0x1002;
    pub const CLOSE_SESSION: u16 = 0x1003;
    pub const GET_STORAGE_IDS: u16 = 0x1004;
    pub const GET_STORAGE_INFO: u16 = 0x1005;
    pub const GET_OBJECT_INFO: u16 = 0x1008;
    pub const GET_OBJECT: u16 = 0x1009;

    /// 厂商扩展：设备声明（连接批准第一步）
    pub const VENDOR_DEVICE_DECLARE: u16 = 0x952b;
    /// 厂商扩展：连接批准（连接批准第二步）
    pub const VENDOR_CONNECTION_APPROVAL: u16 = 0x935a;
}

/// PTP 响应码
pub mod rc {
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const DEVICE_BUSY: u16 = 0x2019;
}

/// PTP 事件码（事件 socket 上推送）
pub mod ev {
    pub const OBJECT_ADDED: u16 = 0x4002;
    pub const DEVICE_INFO_CHANGED: u16 = 0x4008;
    pub const CAPTURE_COMPLETE: u16 = 0x400D;
}
