//! # Tideline Transport Layer
//!
//! 仪器通信的字节流抽象层。仪器通常挂在串口服务器（RS-232 转 TCP）上，
//! 驱动只依赖 [`Transport`] trait，具体连接方式由实现决定。

use std::time::Duration;
use thiserror::Error;

pub mod tcp;

pub use tcp::TcpTransport;

/// 仪器"软中断"序列（Workhorse 等仪器识别的 break）
pub const SOFT_BREAK: &[u8] = b"===";

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Read timeout")]
    Timeout,
    #[error("Connection closed by peer")]
    Closed,
    #[error("Transport not connected")]
    NotConnected,
}

impl TransportError {
    /// 是否为致命错误（连接已不可用）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout)
    }
}

/// 双向字节流
///
/// `read` 在读超时内没有任何数据时返回 [`TransportError::Timeout`]，
/// 对端关闭时返回 [`TransportError::Closed`]。
pub trait Transport: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn set_read_timeout(&mut self, _timeout: Duration) {}

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.set_read_timeout(timeout);
        self.read(buf)
    }

    /// 非阻塞读取；无数据时返回 `Ok(0)`
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.read_timeout(buf, Duration::from_millis(1)) {
            Ok(n) => Ok(n),
            Err(TransportError::Timeout) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// 发送 break
    ///
    /// 串口服务器上没有真正的线路 break，默认发送 [`SOFT_BREAK`]。
    fn send_break(&mut self) -> Result<(), TransportError> {
        self.write_all(SOFT_BREAK)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        (**self).set_read_timeout(timeout)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_timeout(buf, timeout)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).try_read(buf)
    }

    fn send_break(&mut self) -> Result<(), TransportError> {
        (**self).send_break()
    }
}
