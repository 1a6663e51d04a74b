//! 厂商连接批准序列
//!
//! 部分厂商（Nikon 系）要求 STA 模式会话先经过两阶段批准：
//!
//! - **第一阶段**（临时）：完整握手后在一次性会话上发送设备声明
//!   (`0x952b`) 和连接批准 (`0x935a`)（事务 1、2），无论结果如何都
//!   拆除 socket，等待相机内部处理批准（~5s）
//! - **第二阶段**（持久）：在新 socket 上重做完整握手，作为活连接保留
//!
//! 厂商识别用分层回退：精确匹配 → 子串 → 逐字节模式 → 型号启发。
//! 分层存在的原因是线上数据有时被编码错配损坏（UTF-16 解码成乱码），
//! 单一严格检查不够。

use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::time::sleep;

use crate::config::TimingConfig;
use crate::error::{CameraError, Result};
use crate::ptpip::packet::DeviceInfo;
use crate::ptpip::session::PtpIpSession;
use crate::ptpip::{op, rc};

/// 厂商识别结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorHint {
    /// 需要两阶段连接批准
    RequiresApproval,
    /// 标准 PTP/IP 握手即可
    Standard,
}

/// 厂商分类（纯函数，分层回退）
pub fn classify_vendor(info: &DeviceInfo) -> VendorHint {
    // 第一层：精确匹配
    if info.manufacturer.trim() == "Nikon Corporation" {
        return VendorHint::RequiresApproval;
    }

    // 第二层：子串匹配
    let manufacturer_lower = info.manufacturer.to_lowercase();
    if manufacturer_lower.contains("nikon") {
        return VendorHint::RequiresApproval;
    }

    // 第三层：逐字节模式。UTF-16 解码损坏时字符串层面匹配不到，
    // 但原始字节里的 ASCII 字母仍然在。
    if ascii_letters(&info.raw_manufacturer).contains("nikon") {
        return VendorHint::RequiresApproval;
    }

    // 第四层：型号启发（Z 系 / D 系 / COOLPIX）
    if model_looks_like_nikon(&info.model) {
        return VendorHint::RequiresApproval;
    }

    VendorHint::Standard
}

/// 抽出字节流里的 ASCII 字母并转小写
fn ascii_letters(raw: &[u8]) -> String {
    raw.iter()
        .filter(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_lowercase() as char)
        .collect()
}

/// 型号命名是否符合 Nikon 产品线
fn model_looks_like_nikon(model: &str) -> bool {
    let trimmed = model.trim();
    if trimmed.to_uppercase().contains("COOLPIX") {
        return true;
    }
    let mut chars = trimmed.chars();
    match chars.next() {
        // "Z 6" / "Z6" / "Z fc"
        Some('Z' | 'z') => {
            let rest = chars.as_str().trim_start();
            !rest.is_empty()
                && rest
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
                    .unwrap_or(false)
        }
        // "D850" / "D7500"
        Some('D' | 'd') => {
            let digits: Vec<char> = chars.take_while(|c| c.is_ascii_digit()).collect();
            (3..=4).contains(&digits.len())
        }
        _ => false,
    }
}

/// 执行两阶段批准的第一阶段（含有界重试）
///
/// 成功返回后调用方在新 socket 上重做完整握手作为第二阶段。
pub async fn run_approval(
    addr: SocketAddr,
    guid: &[u8; 16],
    host_name: &str,
    config: &TimingConfig,
) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        debug!(
            "Vendor approval phase 1, attempt {}/{}",
            attempt, config.approval_retries
        );
        match approval_phase(addr, guid, host_name, config).await {
            Ok(()) => {
                // 相机内部处理批准需要时间
                info!(
                    "Approval requests accepted, waiting {:?} for camera processing",
                    config.approval_wait
                );
                sleep(config.approval_wait).await;
                return Ok(());
            }
            Err(e) => {
                warn!("Approval phase 1 attempt {} failed: {}", attempt, e);
                if attempt >= config.approval_retries {
                    return Err(e);
                }
                sleep(config.approval_cooldown).await;
            }
        }
    }
}

/// 一次性会话上的批准请求；socket 无论结果如何都被拆除
async fn approval_phase(
    addr: SocketAddr,
    guid: &[u8; 16],
    host_name: &str,
    config: &TimingConfig,
) -> Result<()> {
    let mut session =
        PtpIpSession::connect_without_storage_probe(addr, guid, host_name, config).await?;

    let result = async {
        // 事务 1：设备声明
        let (response, _) = session.execute(op::VENDOR_DEVICE_DECLARE, vec![]).await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        // 事务 2：连接批准
        let (response, _) = session
            .execute(op::VENDOR_CONNECTION_APPROVAL, vec![])
            .await?;
        if response.response_code != rc::OK {
            return Err(CameraError::ResponseCode {
                code: response.response_code,
            });
        }
        Ok(())
    }
    .await;

    session.close().await;
    result
}
