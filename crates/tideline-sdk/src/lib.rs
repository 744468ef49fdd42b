//! Tideline SDK - 海洋观测仪器驱动
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 流分块、数据粒子、NTP 时间戳
//! - **传输层** (`transport`): 字节流传输抽象与 TCP 实现
//! - **驱动层** (`driver`): 协议状态机、IO 线程、定时任务、参数模型
//! - **数据集层** (`dataset`): 日志文件采集与断点续读
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tideline_sdk::prelude::*;
//!
//! tideline_sdk::init_logging();
//!
//! let (handler, events) = ChannelEventHandler::new();
//! let mut driver = InstrumentDriver::new(Arc::new(handler));
//! driver.configure(DriverConfig::default())?;
//! driver.connect()?;
//! driver.discover()?;
//! driver.start_sampling()?;
//! for event in events.iter() {
//!     println!("{:?}", event);
//! }
//! # Ok::<(), DriverError>(())
//! ```

mod logging;
pub mod prelude;

pub use tideline_dataset as dataset;
pub use tideline_driver as driver;
pub use tideline_protocol as protocol;
pub use tideline_transport as transport;

pub use logging::{init_logging, init_logging_with};

pub use tideline_dataset::{DatasetConfig, DatasetDriver, DatasetError, DriverState};
pub use tideline_driver::{DriverConfig, DriverError, InstrumentDriver, ProtocolState};
pub use tideline_protocol::{DataParticle, DecodeError};
pub use tideline_transport::{Transport, TransportError};
