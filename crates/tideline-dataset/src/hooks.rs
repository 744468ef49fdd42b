//! 数据集驱动回调
//!
//! 回调在采集线程中同步执行。`on_particle` 返回之后才会前移断点并调用
//! `on_state`，因此宿主在 `on_state` 中持久化的状态之前的记录都已交付。

use crate::error::DatasetError;
use crate::state::DriverState;
use crossbeam_channel::{Receiver, Sender, unbounded};
use tideline_protocol::DataParticle;

pub trait DatasetEventHandler: Send + Sync {
    fn on_particle(&self, particle: &DataParticle);

    /// 断点前移后的完整状态
    fn on_state(&self, state: &DriverState);

    /// 文件一致性错误等无法返回给调用方的错误
    fn on_exception(&self, error: &DatasetError) {
        let _ = error;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatasetEvent {
    Particle(DataParticle),
    State(DriverState),
    Exception(String),
}

/// 把所有回调转发到 channel
#[derive(Debug, Clone)]
pub struct ChannelDatasetHandler {
    tx: Sender<DatasetEvent>,
}

impl ChannelDatasetHandler {
    pub fn new() -> (Self, Receiver<DatasetEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl DatasetEventHandler for ChannelDatasetHandler {
    fn on_particle(&self, particle: &DataParticle) {
        let _ = self.tx.send(DatasetEvent::Particle(particle.clone()));
    }

    fn on_state(&self, state: &DriverState) {
        let _ = self.tx.send(DatasetEvent::State(state.clone()));
    }

    fn on_exception(&self, error: &DatasetError) {
        let _ = self.tx.send(DatasetEvent::Exception(error.to_string()));
    }
}
