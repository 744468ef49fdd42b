//! NTP 时间戳工具
//!
//! 粒子与状态快照中的时间戳均为 NTP 纪元（1900-01-01 UTC）起的秒数。

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// NTP 纪元与 Unix 纪元之差（秒）
pub const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;

/// 当前时刻的 NTP 时间戳
pub fn ntp_now() -> f64 {
    ntp_from_datetime(&Utc::now())
}

pub fn ntp_from_datetime(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6 + NTP_UNIX_OFFSET
}

/// 将不带时区的仪器时间按 UTC 解释
pub fn ntp_from_naive(naive: &NaiveDateTime) -> f64 {
    ntp_from_datetime(&Utc.from_utc_datetime(naive))
}

/// NTP 时间戳转 UTC 时间；超出可表示范围时返回 `None`
pub fn datetime_from_ntp(ntp: f64) -> Option<DateTime<Utc>> {
    let unix = ntp - NTP_UNIX_OFFSET;
    let secs = unix.floor();
    let nanos = ((unix - secs) * 1e9).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}
