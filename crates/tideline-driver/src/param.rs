//! 仪器参数模型
//!
//! 每个参数都有一份静态描述（[`ParamSpec`]）：仪器助记符、取值类型与范围、
//! 是否只读、是否在启动时下发、是否在直通模式前后保存/恢复。
//!
//! 校验在任何设备 IO 之前完成；校验通过的值会被规范化（例如 `"50,1"`
//! 规范化为 `"050,001"`），保证回读比较时与仪器的回显格式一致。

use crate::error::ParameterError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 参数值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// 文本参数格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    /// 任意文本
    Free,
    /// 固定位数的 0/1 串
    Bits(usize),
    /// `CCYY/MM/DD,hh:mm:ss`
    Clock,
    /// `hh:mm:ss.ff`
    HourMinSec,
    /// `mm:ss.ff`
    MinSec,
    /// `nnn,nnn`，两段各自的取值范围
    Pair { first: (i64, i64), second: (i64, i64) },
}

impl TextFormat {
    fn describe(self) -> &'static str {
        match self {
            Self::Free => "text",
            Self::Bits(_) => "binary digits",
            Self::Clock => "CCYY/MM/DD,hh:mm:ss",
            Self::HourMinSec => "hh:mm:ss.ff",
            Self::MinSec => "mm:ss.ff",
            Self::Pair { .. } => "nnn,nnn",
        }
    }

    /// 校验并规范化；失败返回 `None`
    fn normalize(self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        match self {
            Self::Free => Some(raw.to_string()),
            Self::Bits(len) => {
                let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
                (digits.len() == len && digits.bytes().all(|b| b == b'0' || b == b'1'))
                    .then_some(digits)
            },
            Self::Clock => NaiveDateTime::parse_from_str(raw, "%Y/%m/%d,%H:%M:%S")
                .ok()
                .map(|dt| dt.format("%Y/%m/%d,%H:%M:%S").to_string()),
            Self::HourMinSec => {
                let (hms, ff) = raw.split_once('.')?;
                let mut parts = hms.split(':');
                let h = two_digits(parts.next()?, 99)?;
                let m = two_digits(parts.next()?, 59)?;
                let s = two_digits(parts.next()?, 59)?;
                let ff = two_digits(ff, 99)?;
                parts
                    .next()
                    .is_none()
                    .then(|| format!("{h:02}:{m:02}:{s:02}.{ff:02}"))
            },
            Self::MinSec => {
                let (ms, ff) = raw.split_once('.')?;
                let (m, s) = ms.split_once(':')?;
                let m = two_digits(m, 59)?;
                let s = two_digits(s, 59)?;
                let ff = two_digits(ff, 99)?;
                Some(format!("{m:02}:{s:02}.{ff:02}"))
            },
            Self::Pair { first, second } => {
                let (a, b) = raw.split_once(',')?;
                let a = bounded_number(a, first)?;
                let b = bounded_number(b, second)?;
                Some(format!("{a:03},{b:03}"))
            },
        }
    }
}

fn two_digits(s: &str, max: u32) -> Option<u32> {
    if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok().filter(|v| *v <= max)
}

fn bounded_number(s: &str, (min, max): (i64, i64)) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() || s.len() > 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok().filter(|v| (min..=max).contains(v))
}

/// 参数取值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int { min: i64, max: i64 },
    Bool,
    Text(TextFormat),
}

/// 编译期常量形式的默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Text(&'static str),
}

impl ConstValue {
    pub fn to_value(self) -> ParamValue {
        match self {
            Self::Int(v) => ParamValue::Int(v),
            Self::Bool(v) => ParamValue::Bool(v),
            Self::Text(v) => ParamValue::Text(v.to_string()),
        }
    }
}

/// 参数静态描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    /// 仪器命令助记符，如 `WP`
    pub command: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
    pub read_only: bool,
    /// 启动时下发的值
    pub startup: Option<ConstValue>,
    /// 直通模式前后保存并恢复
    pub direct_access: bool,
}

impl ParamSpec {
    fn new(
        name: &'static str,
        command: &'static str,
        description: &'static str,
        kind: ParamKind,
    ) -> Self {
        Self {
            name,
            command,
            description,
            kind,
            read_only: false,
            startup: None,
            direct_access: false,
        }
    }

    fn int(
        name: &'static str,
        command: &'static str,
        description: &'static str,
        min: i64,
        max: i64,
    ) -> Self {
        Self::new(name, command, description, ParamKind::Int { min, max })
    }

    fn boolean(name: &'static str, command: &'static str, description: &'static str) -> Self {
        Self::new(name, command, description, ParamKind::Bool)
    }

    fn text(
        name: &'static str,
        command: &'static str,
        description: &'static str,
        format: TextFormat,
    ) -> Self {
        Self::new(name, command, description, ParamKind::Text(format))
    }

    fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn startup(mut self, value: ConstValue) -> Self {
        self.startup = Some(value);
        self
    }

    fn direct_access(mut self) -> Self {
        self.direct_access = true;
        self
    }
}

/// Workhorse 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parameter {
    SerialDataOut,
    SerialFlowControl,
    SaveNvramToRecorder,
    Time,
    SerialOutFwSwitches,
    WaterProfilingMode,
    Banner,
    InstrumentId,
    SleepEnable,
    PolledMode,
    XmitPower,
    SpeedOfSound,
    Pitch,
    Roll,
    Salinity,
    CoordinateTransformation,
    SensorSource,
    TimePerEnsemble,
    TimeOfFirstPing,
    TimePerPing,
    FalseTargetThreshold,
    BandwidthControl,
    CorrelationThreshold,
    ErrorVelocityThreshold,
    BlankAfterTransmit,
    ClipDataPastBottom,
    ReceiverGainSelect,
    WaterReferenceLayer,
    NumberOfDepthCells,
    PingsPerEnsemble,
    DepthCellSize,
    TransmitLength,
    PingWeight,
    AmbiguityVelocity,
}

/// 宿主读取全部参数时使用的名称
pub const ALL_PARAMETERS: &str = "DRIVER_PARAMETER_ALL";

impl Parameter {
    pub const ALL: [Parameter; 34] = [
        Self::SerialDataOut,
        Self::SerialFlowControl,
        Self::SaveNvramToRecorder,
        Self::Time,
        Self::SerialOutFwSwitches,
        Self::WaterProfilingMode,
        Self::Banner,
        Self::InstrumentId,
        Self::SleepEnable,
        Self::PolledMode,
        Self::XmitPower,
        Self::SpeedOfSound,
        Self::Pitch,
        Self::Roll,
        Self::Salinity,
        Self::CoordinateTransformation,
        Self::SensorSource,
        Self::TimePerEnsemble,
        Self::TimeOfFirstPing,
        Self::TimePerPing,
        Self::FalseTargetThreshold,
        Self::BandwidthControl,
        Self::CorrelationThreshold,
        Self::ErrorVelocityThreshold,
        Self::BlankAfterTransmit,
        Self::ClipDataPastBottom,
        Self::ReceiverGainSelect,
        Self::WaterReferenceLayer,
        Self::NumberOfDepthCells,
        Self::PingsPerEnsemble,
        Self::DepthCellSize,
        Self::TransmitLength,
        Self::PingWeight,
        Self::AmbiguityVelocity,
    ];

    pub fn spec(self) -> ParamSpec {
        use ConstValue::{Bool, Int, Text};
        use TextFormat as F;

        match self {
            Self::SerialDataOut => {
                ParamSpec::text("SERIAL_DATA_OUT", "CD", "Serial Data Out", F::Free).read_only()
            },
            Self::SerialFlowControl => {
                ParamSpec::text("SERIAL_FLOW_CONTROL", "CF", "Flow Control", F::Bits(5))
                    .read_only()
                    .startup(Text("11110"))
            },
            Self::SaveNvramToRecorder => {
                ParamSpec::boolean("SAVE_NVRAM_TO_RECORDER", "CN", "Save NVRAM to recorder")
                    .read_only()
                    .startup(Bool(true))
            },
            Self::Time => {
                ParamSpec::text("TIME", "TT", "Time Set (CCYY/MM/DD,hh:mm:ss)", F::Clock)
                    .read_only()
            },
            Self::SerialOutFwSwitches => ParamSpec::text(
                "SERIAL_OUT_FW_SWITCHES",
                "WD",
                "Data Out (Vel;Cor;Amp  PG;St;P0  P1;P2;P3)",
                F::Bits(9),
            )
            .read_only()
            .startup(Text("111100000")),
            Self::WaterProfilingMode => {
                ParamSpec::int("WATER_PROFILING_MODE", "WM", "Profiling Mode (1-15)", 1, 15)
                    .read_only()
                    .startup(Int(1))
            },
            Self::Banner => ParamSpec::boolean("BANNER", "CH", "Suppress Banner")
                .read_only()
                .startup(Bool(false)),
            Self::InstrumentId => {
                ParamSpec::int("INSTRUMENT_ID", "CI", "Instrument ID (0-255)", 0, 255)
                    .startup(Int(0))
            },
            Self::SleepEnable => ParamSpec::int(
                "SLEEP_ENABLE",
                "CL",
                "Sleep Enable (0 = Disable, 1 = Enable, 2 See Manual)",
                0,
                2,
            )
            .startup(Int(0))
            .direct_access(),
            Self::PolledMode => ParamSpec::boolean("POLLED_MODE", "CP", "PolledMode (1=ON, 0=OFF)")
                .startup(Bool(false))
                .direct_access(),
            Self::XmitPower => {
                ParamSpec::int("XMIT_POWER", "CQ", "Xmt Power (0-255)", 0, 255).startup(Int(255))
            },
            Self::SpeedOfSound => {
                ParamSpec::int("SPEED_OF_SOUND", "EC", "Speed Of Sound (1400-1600 m/s)", 1400, 1600)
                    .startup(Int(1485))
            },
            Self::Pitch => {
                ParamSpec::int("PITCH", "EP", "Tilt 1 Sensor (1/100 deg)", -6000, 6000)
                    .startup(Int(0))
            },
            Self::Roll => {
                ParamSpec::int("ROLL", "ER", "Tilt 2 Sensor (1/100 deg)", -6000, 6000)
                    .startup(Int(0))
            },
            Self::Salinity => {
                ParamSpec::int("SALINITY", "ES", "Salinity (0-40 pp thousand)", 0, 40)
                    .startup(Int(35))
            },
            Self::CoordinateTransformation => ParamSpec::text(
                "COORDINATE_TRANSFORMATION",
                "EX",
                "Coord Transform (Xform:Type; Tilts; 3Bm; Map)",
                F::Bits(5),
            )
            .startup(Text("00111")),
            Self::SensorSource => {
                ParamSpec::text("SENSOR_SOURCE", "EZ", "Sensor Source (C;D;H;P;R;S;T)", F::Bits(7))
                    .startup(Text("1111101"))
            },
            Self::TimePerEnsemble => ParamSpec::text(
                "TIME_PER_ENSEMBLE",
                "TE",
                "Time per Ensemble (hrs:min:sec.sec/100)",
                F::HourMinSec,
            )
            .startup(Text("00:00:00.00")),
            Self::TimeOfFirstPing => ParamSpec::text(
                "TIME_OF_FIRST_PING",
                "TG",
                "Time of First Ping (CCYY/MM/DD,hh:mm:ss)",
                F::Clock,
            ),
            Self::TimePerPing => {
                ParamSpec::text("TIME_PER_PING", "TP", "Time per Ping (min:sec.sec/100)", F::MinSec)
                    .startup(Text("00:01.00"))
            },
            Self::FalseTargetThreshold => ParamSpec::text(
                "FALSE_TARGET_THRESHOLD",
                "WA",
                "False Target Threshold (Max) (0-255),[Start Bin]",
                F::Pair { first: (0, 255), second: (0, 255) },
            )
            .startup(Text("050,001")),
            Self::BandwidthControl => {
                ParamSpec::int("BANDWIDTH_CONTROL", "WB", "Bandwidth Control (0=Wid,1=Nar)", 0, 1)
                    .startup(Int(0))
            },
            Self::CorrelationThreshold => {
                ParamSpec::int("CORRELATION_THRESHOLD", "WC", "Correlation Threshold", 0, 255)
                    .startup(Int(64))
            },
            Self::ErrorVelocityThreshold => ParamSpec::int(
                "ERROR_VELOCITY_THRESHOLD",
                "WE",
                "Error Velocity Threshold (0-5000 mm/s)",
                0,
                5000,
            )
            .startup(Int(2000)),
            Self::BlankAfterTransmit => {
                ParamSpec::int("BLANK_AFTER_TRANSMIT", "WF", "Blank After Transmit (cm)", 0, 9999)
                    .startup(Int(704))
            },
            Self::ClipDataPastBottom => ParamSpec::boolean(
                "CLIP_DATA_PAST_BOTTOM",
                "WI",
                "Clip Data Past Bottom (0=OFF,1=ON)",
            )
            .startup(Bool(false)),
            Self::ReceiverGainSelect => ParamSpec::int(
                "RECEIVER_GAIN_SELECT",
                "WJ",
                "Rcvr Gain Select (0=Low,1=High)",
                0,
                1,
            )
            .startup(Int(1)),
            Self::WaterReferenceLayer => ParamSpec::text(
                "WATER_REFERENCE_LAYER",
                "WL",
                "Water Reference Layer:  Begin Cell (0=OFF), End Cell",
                F::Pair { first: (0, 100), second: (1, 100) },
            )
            .startup(Text("001,005")),
            Self::NumberOfDepthCells => ParamSpec::int(
                "NUMBER_OF_DEPTH_CELLS",
                "WN",
                "Number of depth cells (1-255)",
                1,
                255,
            )
            .startup(Int(100)),
            Self::PingsPerEnsemble => {
                ParamSpec::int("PINGS_PER_ENSEMBLE", "WP", "Pings per Ensemble (0-16384)", 0, 16384)
                    .startup(Int(1))
            },
            Self::DepthCellSize => {
                ParamSpec::int("DEPTH_CELL_SIZE", "WS", "Depth Cell Size (cm)", 80, 3200)
                    .startup(Int(800))
            },
            Self::TransmitLength => ParamSpec::int(
                "TRANSMIT_LENGTH",
                "WT",
                "Transmit Length (cm) [0 = Bin Length]",
                0,
                3200,
            )
            .startup(Int(0)),
            Self::PingWeight => {
                ParamSpec::int("PING_WEIGHT", "WU", "Ping Weighting (0=Box,1=Triangle)", 0, 1)
                    .startup(Int(0))
            },
            Self::AmbiguityVelocity => ParamSpec::int(
                "AMBIGUITY_VELOCITY",
                "WV",
                "Mode 1 Ambiguity Vel (cm/s radial)",
                2,
                700,
            )
            .startup(Int(175)),
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn command(self) -> &'static str {
        self.spec().command
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn from_command(command: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.command() == command)
    }

    /// 解析宿主传入的参数名
    pub fn parse(name: &str) -> Result<Self, ParameterError> {
        Self::from_name(name).ok_or_else(|| ParameterError::Unknown(name.to_string()))
    }

    pub fn is_read_only(self) -> bool {
        self.spec().read_only
    }

    /// 校验宿主设置请求（含只读检查）
    pub fn validate_set(self, value: &ParamValue) -> Result<ParamValue, ParameterError> {
        if self.is_read_only() {
            return Err(ParameterError::ReadOnly(self));
        }
        self.validate(value)
    }

    /// 校验取值类型与范围，返回规范化后的值
    pub fn validate(self, value: &ParamValue) -> Result<ParamValue, ParameterError> {
        let invalid_type = |expected: &'static str| ParameterError::InvalidType {
            param: self,
            expected,
            value: format!("{} ({})", value, value.type_name()),
        };

        match (self.spec().kind, value) {
            (ParamKind::Int { min, max }, ParamValue::Int(v)) => {
                if (min..=max).contains(v) {
                    Ok(ParamValue::Int(*v))
                } else {
                    Err(ParameterError::OutOfRange {
                        param: self,
                        value: *v,
                        min,
                        max,
                    })
                }
            },
            (ParamKind::Int { .. }, _) => Err(invalid_type("int")),
            (ParamKind::Bool, ParamValue::Bool(v)) => Ok(ParamValue::Bool(*v)),
            (ParamKind::Bool, ParamValue::Int(v @ (0 | 1))) => Ok(ParamValue::Bool(*v == 1)),
            (ParamKind::Bool, _) => Err(invalid_type("bool")),
            (ParamKind::Text(format), ParamValue::Text(s)) => format
                .normalize(s)
                .map(ParamValue::Text)
                .ok_or_else(|| ParameterError::InvalidFormat {
                    param: self,
                    value: s.clone(),
                    format: format.describe(),
                }),
            (ParamKind::Text(_), _) => Err(invalid_type("string")),
        }
    }

    /// 格式化为仪器设置命令的参数部分
    pub fn format_for_device(self, value: &ParamValue) -> String {
        match value {
            ParamValue::Bool(true) => "1".to_string(),
            ParamValue::Bool(false) => "0".to_string(),
            other => other.to_string(),
        }
    }

    /// 解析仪器回显的参数值
    pub fn parse_device_value(self, raw: &str) -> Option<ParamValue> {
        let raw = raw.trim();
        match self.spec().kind {
            ParamKind::Int { .. } => raw.parse::<i64>().ok().map(ParamValue::Int),
            ParamKind::Bool => match raw.to_ascii_uppercase().as_str() {
                "1" | "YES" | "ON" | "TRUE" => Some(ParamValue::Bool(true)),
                "0" | "NO" | "OFF" | "FALSE" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            ParamKind::Text(format) => Some(ParamValue::Text(
                format.normalize(raw).unwrap_or_else(|| raw.to_string()),
            )),
        }
    }
}

/// 校验一组宿主设置请求，任一值不合法则整体拒绝
pub fn validate_set_values(
    values: &[(Parameter, ParamValue)],
) -> Result<Vec<(Parameter, ParamValue)>, ParameterError> {
    values
        .iter()
        .map(|(param, value)| Ok((*param, param.validate_set(value)?)))
        .collect()
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 当前参数值表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamDict {
    values: BTreeMap<Parameter, ParamValue>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, param: Parameter) -> Option<&ParamValue> {
        self.values.get(&param)
    }

    pub fn set(&mut self, param: Parameter, value: ParamValue) {
        self.values.insert(param, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Parameter, &ParamValue)> {
        self.values.iter().map(|(p, v)| (*p, v))
    }

    /// 选取部分参数；未知值的参数不出现在结果中
    pub fn select(&self, params: &[Parameter]) -> BTreeMap<Parameter, ParamValue> {
        params
            .iter()
            .filter_map(|p| self.values.get(p).map(|v| (*p, v.clone())))
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<Parameter, ParamValue> {
        self.values.clone()
    }
}
