//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use tideline_sdk::prelude::*;
//! ```

// 仪器驱动
pub use tideline_driver::{
    ChannelEventHandler, CommandResult, DriverConfig, DriverEvent, DriverEventHandler,
    EventPayload, InstrumentDriver, ParamValue, Parameter, ProtocolEvent, ProtocolState,
};

// 数据集驱动
pub use tideline_dataset::{
    ChannelDatasetHandler, DatasetConfig, DatasetDriver, DatasetEvent, DatasetEventHandler,
    DriverState, FlortParser, JsonStateStore,
};

// 粒子与传输
pub use tideline_protocol::{DataParticle, ParticleType, ParticleValue};
pub use tideline_transport::{TcpTransport, Transport};

// 错误类型
pub use tideline_dataset::DatasetError;
pub use tideline_driver::{DriverError, ParameterError};
pub use tideline_protocol::DecodeError;
pub use tideline_transport::TransportError;
