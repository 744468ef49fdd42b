//! 驱动层错误类型定义

use crate::event::ProtocolEvent;
use crate::param::Parameter;
use crate::state::ProtocolState;
use thiserror::Error;
use tideline_protocol::DecodeError;
use tideline_transport::TransportError;

/// 参数错误
///
/// 除 `Rejected` / `Mismatch` 外都在任何设备 IO 之前产生。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Unknown parameter: {0}")]
    Unknown(String),

    #[error("Parameter {0} is read-only")]
    ReadOnly(Parameter),

    #[error("Parameter {param}: expected {expected}, got {value}")]
    InvalidType {
        param: Parameter,
        expected: &'static str,
        value: String,
    },

    #[error("Parameter {param}: value {value} out of range [{min}, {max}]")]
    OutOfRange {
        param: Parameter,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Parameter {param}: '{value}' does not match format {format}")]
    InvalidFormat {
        param: Parameter,
        value: String,
        format: &'static str,
    },

    /// 仪器以错误响应拒绝了设置
    #[error("Parameter {param}: instrument rejected value: {reason}")]
    Rejected { param: Parameter, reason: String },

    /// 回读值与设置值不一致
    #[error("Parameter {param}: set '{expected}' but instrument reports '{actual}'")]
    Mismatch {
        param: Parameter,
        expected: String,
        actual: String,
    },
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 等待仪器响应超时（已用尽重试）
    #[error("Timeout waiting for response to {0}")]
    Timeout(String),

    /// 仪器返回错误或无法解析的响应
    #[error("Instrument protocol error: {0}")]
    Protocol(String),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    /// 当前状态不接受该事件
    #[error("Event {event} not allowed in state {state}")]
    State {
        state: ProtocolState,
        event: ProtocolEvent,
    },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// 传输层故障（连接不可用）
    #[error("Connection error: {0}")]
    Connection(#[from] TransportError),

    #[error("Driver not configured")]
    NotConfigured,

    #[error("Driver not connected")]
    NotConnected,

    #[error("Driver already connected")]
    AlreadyConnected,

    /// 请求通道已关闭（IO 线程退出）
    #[error("Request channel closed")]
    ChannelClosed,

    /// 请求通道已满（缓冲区容量 10）
    #[error("Request channel full (buffer size: 10)")]
    ChannelFull,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl DriverError {
    /// 是否意味着连接已不可用
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_fatal(),
            Self::ChannelClosed | Self::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::State {
            state: ProtocolState::Autosample,
            event: ProtocolEvent::ClockSync,
        };
        assert_eq!(
            err.to_string(),
            "Event DRIVER_EVENT_CLOCK_SYNC not allowed in state DRIVER_STATE_AUTOSAMPLE"
        );

        let err = DriverError::from(ParameterError::OutOfRange {
            param: Parameter::ErrorVelocityThreshold,
            value: 10000,
            min: 0,
            max: 5000,
        });
        let msg = err.to_string();
        assert!(msg.contains("ERROR_VELOCITY_THRESHOLD") && msg.contains("10000"), "{msg}");

        assert_eq!(
            DriverError::Timeout("PS0".into()).to_string(),
            "Timeout waiting for response to PS0"
        );
    }

    #[test]
    fn test_from_transport_error() {
        let err: DriverError = TransportError::Closed.into();
        assert!(matches!(err, DriverError::Connection(TransportError::Closed)));
        assert!(err.is_connection_lost());

        let err: DriverError = TransportError::Timeout.into();
        assert!(!err.is_connection_lost());
        assert!(!DriverError::UnknownCommand("FOO".into()).is_connection_lost());
    }
}
