//! 仪器驱动层
//!
//! 本 crate 提供 Teledyne RDI Workhorse ADCP 的仪器驱动，包括：
//! - 协议状态机（UNKNOWN / COMMAND / AUTOSAMPLE / DIRECT_ACCESS）
//! - IO 线程与请求通道
//! - 定时任务（时钟同步、校准与配置读取）
//! - 参数模型与校验
//! - 事件回调（粒子、状态、异常、配置、直通数据）
//!
//! 宿主只需使用 [`InstrumentDriver`]；`mock` feature 提供不依赖硬件的模拟仪器。

pub mod config;
mod driver;
mod error;
pub mod event;
pub mod hooks;
pub mod metrics;
pub mod param;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod workhorse;

pub use config::{CommsConfig, DriverConfig, SchedulerConfig, TimeoutConfig};
pub use driver::InstrumentDriver;
pub use error::{DriverError, ParameterError};
pub use event::{Capability, ProtocolEvent};
pub use hooks::{ChannelEventHandler, DriverEvent, DriverEventHandler, NullEventHandler};
pub use metrics::{DriverMetrics, MetricsSnapshot};
pub use param::{ALL_PARAMETERS, ParamDict, ParamValue, Parameter};
pub use protocol::{CommandResult, EventPayload};
pub use state::{AtomicProtocolState, ConnectionState, ProtocolState};
