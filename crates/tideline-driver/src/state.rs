//! 协议状态定义
//!
//! 协议状态由 IO 线程写入，由驱动外观与调度器无锁读取。

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 协议状态
///
/// # 状态说明
///
/// - **Unknown**: 尚未确定仪器状态（启动或连接丢失后）
/// - **Command**: 仪器在命令提示符下，可读写参数
/// - **Autosample**: 仪器自主输出数据
/// - **DirectAccess**: 操作员直通，驱动只转发字节
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum ProtocolState {
    #[default]
    Unknown = 0,
    Command = 1,
    Autosample = 2,
    DirectAccess = 3,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 4] = [
        Self::Unknown,
        Self::Command,
        Self::Autosample,
        Self::DirectAccess,
    ];

    /// 从 u8 转换
    ///
    /// 如果值无效，返回 Unknown。
    pub fn from_u8(value: u8) -> Self {
        Self::try_from(value).unwrap_or(Self::Unknown)
    }

    pub fn as_u8(self) -> u8 {
        self.into()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "DRIVER_STATE_UNKNOWN",
            Self::Command => "DRIVER_STATE_COMMAND",
            Self::Autosample => "DRIVER_STATE_AUTOSAMPLE",
            Self::DirectAccess => "DRIVER_STATE_DIRECT_ACCESS",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协议状态（原子版本，用于线程间共享）
#[derive(Debug, Default)]
pub struct AtomicProtocolState {
    inner: AtomicU8,
}

impl AtomicProtocolState {
    pub fn new(state: ProtocolState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self) -> ProtocolState {
        ProtocolState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// 设置新状态，返回旧状态
    pub fn swap(&self, state: ProtocolState) -> ProtocolState {
        ProtocolState::from_u8(self.inner.swap(state.as_u8(), Ordering::AcqRel))
    }
}

/// 连接状态（驱动外观层面）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// 尚未调用 `configure`
    #[default]
    Unconfigured,
    /// 已配置，未连接
    Disconnected,
    /// IO 线程运行中
    Connected,
}
