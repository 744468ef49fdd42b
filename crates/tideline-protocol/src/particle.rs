//! 数据粒子（Data Particle）
//!
//! 从单条记录解码得到的、带类型和时间戳的不可变数据记录。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 粒子流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleType {
    /// ADCP PD0 二进制测量集合
    AdcpPd0Parsed,
    /// ADCP 系统配置（PS0 输出）
    AdcpSystemConfiguration,
    /// ADCP 罗盘校准（AC 输出）
    AdcpCompassCalibration,
    /// FLORT-D 荧光计日志记录
    FlortdParsed,
}

impl ParticleType {
    /// 流名称
    pub fn stream_name(self) -> &'static str {
        match self {
            Self::AdcpPd0Parsed => "adcp_pd0_parsed",
            Self::AdcpSystemConfiguration => "adcp_system_configuration",
            Self::AdcpCompassCalibration => "adcp_compass_calibration",
            Self::FlortdParsed => "issmcnsm_flortd_parsed",
        }
    }
}

impl fmt::Display for ParticleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_name())
    }
}

/// 时间戳来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// 仪器内部时钟（记录自带）
    Instrument,
    /// 驱动接收时刻
    #[default]
    Driver,
}

/// 粒子字段值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticleValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
}

impl ParticleValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for ParticleValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParticleValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParticleValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for ParticleValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for ParticleValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<i64>> for ParticleValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

impl From<Vec<f64>> for ParticleValue {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatList(v)
    }
}

/// 命名字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleField {
    pub name: String,
    pub value: ParticleValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// 数据粒子
///
/// 构造后不可变；字段保持插入顺序。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataParticle {
    particle_type: ParticleType,
    timestamp: f64,
    timestamp_source: TimestampSource,
    fields: Vec<ParticleField>,
}

impl DataParticle {
    /// 开始构造粒子
    ///
    /// `timestamp` 为 NTP 纪元起的秒数。
    pub fn builder(particle_type: ParticleType, timestamp: f64) -> ParticleBuilder {
        ParticleBuilder {
            particle: DataParticle {
                particle_type,
                timestamp,
                timestamp_source: TimestampSource::Driver,
                fields: Vec::new(),
            },
        }
    }

    pub fn particle_type(&self) -> ParticleType {
        self.particle_type
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn timestamp_source(&self) -> TimestampSource {
        self.timestamp_source
    }

    pub fn fields(&self) -> &[ParticleField] {
        &self.fields
    }

    /// 按名称查找字段值
    pub fn get(&self, name: &str) -> Option<&ParticleValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

/// 粒子构造器
#[derive(Debug)]
pub struct ParticleBuilder {
    particle: DataParticle,
}

impl ParticleBuilder {
    pub fn timestamp_source(mut self, source: TimestampSource) -> Self {
        self.particle.timestamp_source = source;
        self
    }

    pub fn field(mut self, name: &str, value: impl Into<ParticleValue>) -> Self {
        self.particle.fields.push(ParticleField {
            name: name.to_string(),
            value: value.into(),
            units: None,
        });
        self
    }

    pub fn field_with_units(
        mut self,
        name: &str,
        value: impl Into<ParticleValue>,
        units: &str,
    ) -> Self {
        self.particle.fields.push(ParticleField {
            name: name.to_string(),
            value: value.into(),
            units: Some(units.to_string()),
        });
        self
    }

    pub fn build(self) -> DataParticle {
        self.particle
    }
}
