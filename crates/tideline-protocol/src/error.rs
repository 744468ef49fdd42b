//! 解码错误类型定义

use thiserror::Error;

/// 记录解码错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 记录长度不足
    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// 校验和不匹配
    #[error("Checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    /// 记录格式错误
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// 不认识的记录类型
    #[error("Unrecognized record: {0}")]
    Unrecognized(String),
}
