//! Workhorse 命令集与响应解析

use crate::event::ProtocolEvent;
use crate::param::Parameter;
use regex::Regex;
use regex::bytes::Regex as BytesRegex;
use std::fmt;

/// 仪器命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentCommand {
    /// 空行，仪器在命令模式下以提示符回应
    Wakeup,
    /// `CS` 开始采样（无提示符返回）
    StartDeploy,
    /// `CK` 保存当前设置到非易失存储
    SaveSetup,
    /// `CE` 输出最近一个集合
    SendLastSample,
    /// `CY` 错误状态字
    GetErrorStatusWord,
    /// `CY0` 清除错误状态字
    ClearErrorStatusWord,
    /// `FD` 故障日志
    GetFaultLog,
    /// `FC` 清除故障日志
    ClearFaultLog,
    /// `PS0` 系统配置
    SystemConfiguration,
    /// `PS3` 仪器变换矩阵
    TransformMatrix,
    /// `AC` 罗盘校准
    CompassCalibration,
    /// `PT200` 自检
    RunTest200,
    /// `TT` 设置时钟
    SetClock(String),
    /// `XX?` 查询参数
    Query(Parameter),
    /// `XX<value>` 设置参数
    Set(Parameter, String),
}

impl InstrumentCommand {
    /// 命令行文本（不含结束符）
    pub fn to_line(&self) -> String {
        match self {
            Self::Wakeup => String::new(),
            Self::StartDeploy => "CS".into(),
            Self::SaveSetup => "CK".into(),
            Self::SendLastSample => "CE".into(),
            Self::GetErrorStatusWord => "CY".into(),
            Self::ClearErrorStatusWord => "CY0".into(),
            Self::GetFaultLog => "FD".into(),
            Self::ClearFaultLog => "FC".into(),
            Self::SystemConfiguration => "PS0".into(),
            Self::TransformMatrix => "PS3".into(),
            Self::CompassCalibration => "AC".into(),
            Self::RunTest200 => "PT200".into(),
            Self::SetClock(time) => format!("TT{time}"),
            Self::Query(param) => format!("{}?", param.command()),
            Self::Set(param, value) => format!("{}{}", param.command(), value),
        }
    }

    /// 是否以提示符结束响应
    pub fn expects_prompt(&self) -> bool {
        !matches!(self, Self::StartDeploy)
    }

    /// 只需发送单条命令的事件
    pub fn for_event(event: ProtocolEvent) -> Option<Self> {
        Some(match event {
            ProtocolEvent::GetCalibration => Self::CompassCalibration,
            ProtocolEvent::GetConfiguration => Self::SystemConfiguration,
            ProtocolEvent::SaveSetupToRam => Self::SaveSetup,
            ProtocolEvent::SendLastSample => Self::SendLastSample,
            ProtocolEvent::GetErrorStatusWord => Self::GetErrorStatusWord,
            ProtocolEvent::ClearErrorStatusWord => Self::ClearErrorStatusWord,
            ProtocolEvent::GetFaultLog => Self::GetFaultLog,
            ProtocolEvent::ClearFaultLog => Self::ClearFaultLog,
            ProtocolEvent::GetInstrumentTransformMatrix => Self::TransformMatrix,
            ProtocolEvent::RunTest200 => Self::RunTest200,
            _ => return None,
        })
    }
}

impl fmt::Display for InstrumentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wakeup => f.write_str("<newline>"),
            other => f.write_str(&other.to_line()),
        }
    }
}

/// 响应解析
#[derive(Debug, Clone)]
pub struct ResponseParser {
    prompt: BytesRegex,
    error: Regex,
    param_reply: Regex,
}

impl ResponseParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            prompt: BytesRegex::new(r"(?-u)(?:\A|\n)>[ ]*\z")?,
            error: Regex::new(r"ERR\s+(\d+):\s*([^\r\n]*)")?,
            param_reply: Regex::new(r"(?m)^([A-Z]{2}) (.+?)\s+-{2,}")?,
        })
    }

    /// 缓冲区是否以提示符结尾（响应完整）
    pub fn ends_with_prompt(&self, buf: &[u8]) -> bool {
        self.prompt.is_match(buf)
    }

    /// 仪器错误响应，如 `ERR 010:  PARAMETER OUT OF BOUNDS`
    pub fn device_error(&self, text: &str) -> Option<String> {
        self.error
            .captures(text)
            .map(|c| format!("ERR {}: {}", &c[1], c[2].trim()))
    }

    /// 参数查询响应中的原始值
    pub fn param_value<'t>(&self, text: &'t str, param: Parameter) -> Option<&'t str> {
        self.param_reply
            .captures_iter(text)
            .find(|c| &c[1] == param.command())
            .and_then(|c| c.get(2))
            .map(|m| m.as_str().trim())
    }
}
