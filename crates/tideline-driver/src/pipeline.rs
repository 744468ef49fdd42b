//! Pipeline IO 循环模块
//!
//! 后台 IO 线程独占 [`Protocol`]：先处理积压的请求，再以短超时轮询传输层。

use crate::error::DriverError;
use crate::event::ProtocolEvent;
use crate::protocol::{CommandResult, EventPayload, Protocol};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// 请求通道容量
pub const REQUEST_QUEUE_CAPACITY: usize = 10;

/// 发往 IO 线程的请求
#[derive(Debug)]
pub enum Request {
    /// 宿主事件，结果通过 `reply` 返回
    Event {
        event: ProtocolEvent,
        payload: EventPayload,
        reply: Sender<Result<CommandResult, DriverError>>,
    },
    /// 定时任务事件（无回复）
    Scheduled(ProtocolEvent),
}

/// 处理单个请求；返回连接是否已丢失
fn handle_request(protocol: &mut Protocol, request: Request) -> bool {
    match request {
        Request::Event {
            event,
            payload,
            reply,
        } => {
            let result = protocol.handle(event, payload);
            let mut lost = false;
            if let Err(e) = &result
                && e.is_connection_lost()
            {
                protocol.connection_lost(e);
                lost = true;
            }
            // 调用方可能已超时放弃等待
            let _ = reply.send(result);
            lost
        },
        Request::Scheduled(event) => match protocol.handle_scheduled(event) {
            Ok(()) => false,
            Err(e) if e.is_connection_lost() => {
                protocol.connection_lost(&e);
                true
            },
            Err(e) => {
                warn!("Scheduled {} failed: {}", event, e);
                false
            },
        },
    }
}

/// 处理通道中积压的请求
///
/// 返回 `true` 表示应退出循环（通道断开或连接丢失）。
fn drain_requests(protocol: &mut Protocol, req_rx: &Receiver<Request>) -> bool {
    loop {
        match req_rx.try_recv() {
            Ok(request) => {
                if handle_request(protocol, request) {
                    return true;
                }
            },
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

/// IO 线程主循环
pub fn io_loop(mut protocol: Protocol, req_rx: Receiver<Request>, is_running: Arc<AtomicBool>) {
    loop {
        if !is_running.load(Ordering::Acquire) {
            debug!("IO loop: stop requested");
            break;
        }

        if drain_requests(&mut protocol, &req_rx) {
            break;
        }

        if let Err(e) = protocol.poll() {
            if e.is_connection_lost() {
                protocol.connection_lost(&e);
                break;
            }
            error!("IO loop poll error: {}", e);
        }
    }
    is_running.store(false, Ordering::Release);
    reject_pending(&req_rx);
}

/// 回复退出时仍在队列中的请求，调用方不必等到请求超时
fn reject_pending(req_rx: &Receiver<Request>) {
    for request in req_rx.try_iter() {
        if let Request::Event { event, reply, .. } = request {
            debug!("Rejecting queued {}: IO loop stopped", event);
            let _ = reply.send(Err(DriverError::NotConnected));
        }
    }
}
