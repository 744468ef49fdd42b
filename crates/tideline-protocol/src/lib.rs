//! # Tideline Protocol
//!
//! 仪器数据流的协议层抽象（无 IO 依赖）
//!
//! ## 模块
//!
//! - `chunk`: 流分块器与记录识别（sieve）
//! - `particle`: 数据粒子模型
//! - `time`: NTP 时间戳工具
//! - `error`: 解码错误

pub mod chunk;
mod error;
pub mod particle;
pub mod time;

pub use chunk::{Chunk, Chunker, DEFAULT_MAX_BUFFERED, RegexSieve, Sieve, line_sieve};
pub use error::DecodeError;
pub use particle::{
    DataParticle, ParticleBuilder, ParticleField, ParticleType, ParticleValue, TimestampSource,
};
pub use time::{NTP_UNIX_OFFSET, datetime_from_ntp, ntp_from_datetime, ntp_from_naive, ntp_now};
