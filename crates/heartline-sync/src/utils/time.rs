//! 时间处理工具模块
//!
//! 服务端时间字符串解析的唯一入口，全 SDK 共用同一条规则：
//!
//! - **存储层/业务层**: 所有时间字段使用 UTC 毫秒时间戳（i64）
//! - **解析规则**: 带时区标识的字符串按其时区解析；**不带时区标识的字符串一律按 UTC 解释**，
//!   绝不按设备本地时区解释（避免跨时区设备产生错序）
//! - **显示层**: 由应用层自行转换时区，本模块不做显示格式化

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// 时间归一化工具
pub struct TimeNormalizer;

impl TimeNormalizer {
    /// 获取当前 UTC 毫秒时间戳
    pub fn now_utc_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// 服务端时间字符串 → UTC 毫秒时间戳
    ///
    /// 依次尝试：
    /// 1. RFC 3339（`2024-01-17T14:00:00Z` / `2024-01-17T14:00:00+08:00`，可带小数秒）
    /// 2. 带数字时区偏移的 ISO 变体（`2024-01-17T14:00:00+0800`）
    /// 3. 无时区的 ISO 格式（`2024-01-17T14:00:00`）→ 按 UTC 解释
    /// 4. 空格分隔格式（`2024-01-17 14:00:00`）→ 按 UTC 解释
    ///
    /// 解析失败返回 None
    pub fn normalize(raw: &str) -> Option<i64> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.timestamp_millis());
        }
        if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
            return Some(dt.timestamp_millis());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
        None
    }

    /// 宽容版本：解析失败时回退为当前时间并记 warn 日志
    ///
    /// 用于消息接收路径：时间戳坏了不应让整条消息丢失，排序退化为到达时间
    pub fn normalize_or_now(raw: &str) -> i64 {
        match Self::normalize(raw) {
            Some(ms) => ms,
            None => {
                warn!("⚠️ 无法解析服务端时间戳: {:?}，回退为当前时间", raw);
                Self::now_utc_millis()
            }
        }
    }

    /// UTC 毫秒时间戳 → RFC 3339 字符串（调试/记录用）
    pub fn to_rfc3339(utc_timestamp_ms: i64) -> String {
        Utc.timestamp_millis_opt(utc_timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339()
    }
}
