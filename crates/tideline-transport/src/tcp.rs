//! TCP 传输（串口服务器）

use crate::{Transport, TransportError};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// 默认读超时
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// 通过 TCP 连接的仪器端口
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
}

impl TcpTransport {
    /// 连接到 `host:port`
    ///
    /// 依次尝试解析得到的每个地址，返回最后一个错误。
    pub fn connect(
        addr: impl ToSocketAddrs,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut last_err = None;
        for peer in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&peer, connect_timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    debug!("TCP connect to {} failed: {}", peer, e);
                    last_err = Some(e);
                },
            }
        }
        Err(last_err.map(TransportError::Io).unwrap_or(TransportError::NotConnected))
    }

    /// 包装已建立的连接
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(DEFAULT_READ_TIMEOUT))?;
        debug!("TCP transport connected to {}", peer);
        Ok(Self {
            stream,
            peer,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        trace!("TCP TX {} bytes", data.len());
        self.stream.write_all(data).map_err(map_io_error)?;
        self.stream.flush().map_err(map_io_error)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                trace!("TCP RX {} bytes", n);
                Ok(n)
            },
            Err(e) => Err(map_io_error(e)),
        }
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        // 零超时在 std 中非法
        let timeout = timeout.max(Duration::from_millis(1));
        if timeout != self.read_timeout && self.stream.set_read_timeout(Some(timeout)).is_ok() {
            self.read_timeout = timeout;
        }
    }
}

fn map_io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}
