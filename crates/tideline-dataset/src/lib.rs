//! 日志文件数据集驱动
//!
//! 从一个不断增长的目录中按顺序读取仪器日志文件，逐行解码为数据粒子，
//! 并维护可持久化的断点，使驱动重启后不重复、不遗漏。
//!
//! - `config`: 目录、文件模式、轮询间隔与发布速率
//! - `harvester`: 目录扫描、文件排序与一致性检查
//! - `parser`: 可续读的行解析器与 [`RecordParser`] 扩展点
//! - `flort`: FLORT-D 记录解析
//! - `state` / `store`: 断点模型与 JSON 状态文件
//! - `driver`: [`DatasetDriver`] 采集线程与回调

pub mod config;
mod driver;
mod error;
pub mod flort;
pub mod harvester;
pub mod hooks;
pub mod parser;
pub mod state;
pub mod store;

pub use config::{DatasetConfig, HarvesterConfig};
pub use driver::DatasetDriver;
pub use error::DatasetError;
pub use flort::FlortParser;
pub use harvester::{FileHarvester, SortKey};
pub use hooks::{ChannelDatasetHandler, DatasetEvent, DatasetEventHandler};
pub use parser::{ParseEvent, ParserFactory, RecordParser, ResumableParser};
pub use state::{DriverState, HarvesterState, ParserState};
pub use store::JsonStateStore;
