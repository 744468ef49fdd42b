//! 宿主回调
//!
//! 驱动通过 [`DriverEventHandler`] 把异步事件交给宿主：数据粒子、状态变化、
//! 异常、参数变化与直通数据。回调在 IO 线程中同步执行，实现应尽快返回，
//! 耗时处理请转到自己的线程（例如使用 [`ChannelEventHandler`]）。

use crate::error::DriverError;
use crate::param::{ParamValue, Parameter};
use crate::state::ProtocolState;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::BTreeMap;
use tideline_protocol::DataParticle;

/// 驱动事件回调 Trait
///
/// 除 `on_particle` 外均有空的默认实现。
pub trait DriverEventHandler: Send + Sync {
    /// 每解码出一个粒子调用一次，顺序与字节流中的顺序一致
    fn on_particle(&self, particle: &DataParticle);

    /// 协议状态变化
    fn on_state_change(&self, state: ProtocolState) {
        let _ = state;
    }

    /// 无法返回给调用方的错误（例如连接丢失、定时任务失败）
    fn on_exception(&self, error: &DriverError) {
        let _ = error;
    }

    /// 参数值变化（设置成功或启动参数下发后）
    fn on_config_change(&self, params: &BTreeMap<Parameter, ParamValue>) {
        let _ = params;
    }

    /// 直通模式下仪器返回的原始字节
    fn on_direct_access(&self, data: &[u8]) {
        let _ = data;
    }
}

/// 驱动事件（通道形式）
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Particle(DataParticle),
    StateChange(ProtocolState),
    Exception(String),
    ConfigChange(BTreeMap<Parameter, ParamValue>),
    DirectAccess(Vec<u8>),
}

/// 把所有回调转发到 channel 的事件处理器
///
/// # 示例
///
/// ```rust
/// use tideline_driver::hooks::{ChannelEventHandler, DriverEvent};
/// use tideline_driver::ProtocolState;
/// use tideline_driver::DriverEventHandler;
///
/// let (handler, rx) = ChannelEventHandler::new();
/// handler.on_state_change(ProtocolState::Command);
/// assert_eq!(rx.try_recv().unwrap(), DriverEvent::StateChange(ProtocolState::Command));
/// ```
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    tx: Sender<DriverEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, Receiver<DriverEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl DriverEventHandler for ChannelEventHandler {
    fn on_particle(&self, particle: &DataParticle) {
        let _ = self.tx.send(DriverEvent::Particle(particle.clone()));
    }

    fn on_state_change(&self, state: ProtocolState) {
        let _ = self.tx.send(DriverEvent::StateChange(state));
    }

    fn on_exception(&self, error: &DriverError) {
        let _ = self.tx.send(DriverEvent::Exception(error.to_string()));
    }

    fn on_config_change(&self, params: &BTreeMap<Parameter, ParamValue>) {
        let _ = self.tx.send(DriverEvent::ConfigChange(params.clone()));
    }

    fn on_direct_access(&self, data: &[u8]) {
        let _ = self.tx.send(DriverEvent::DirectAccess(data.to_vec()));
    }
}

/// 丢弃所有事件
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventHandler;

impl DriverEventHandler for NullEventHandler {
    fn on_particle(&self, _particle: &DataParticle) {}
}
