//! 协议事件与状态转移表
//!
//! 转移表是显式数据：`(状态, 可接受事件)`。表中没有的组合一律视为
//! 状态错误，不会触发任何设备 IO。

use crate::state::ProtocolState;
use std::fmt;
use std::str::FromStr;

/// 协议事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEvent {
    Discover,
    StartAutosample,
    StopAutosample,
    Get,
    Set,
    ClockSync,
    StartDirect,
    StopDirect,
    ExecuteDirect,
    ScheduledClockSync,
    GetCalibration,
    GetConfiguration,
    SaveSetupToRam,
    SendLastSample,
    GetErrorStatusWord,
    ClearErrorStatusWord,
    GetFaultLog,
    ClearFaultLog,
    GetInstrumentTransformMatrix,
    RunTest200,
}

impl ProtocolEvent {
    pub const ALL: [ProtocolEvent; 20] = [
        Self::Discover,
        Self::StartAutosample,
        Self::StopAutosample,
        Self::Get,
        Self::Set,
        Self::ClockSync,
        Self::StartDirect,
        Self::StopDirect,
        Self::ExecuteDirect,
        Self::ScheduledClockSync,
        Self::GetCalibration,
        Self::GetConfiguration,
        Self::SaveSetupToRam,
        Self::SendLastSample,
        Self::GetErrorStatusWord,
        Self::ClearErrorStatusWord,
        Self::GetFaultLog,
        Self::ClearFaultLog,
        Self::GetInstrumentTransformMatrix,
        Self::RunTest200,
    ];

    /// 事件名（宿主 `execute` 使用的字符串）
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "DRIVER_EVENT_DISCOVER",
            Self::StartAutosample => "DRIVER_EVENT_START_AUTOSAMPLE",
            Self::StopAutosample => "DRIVER_EVENT_STOP_AUTOSAMPLE",
            Self::Get => "DRIVER_EVENT_GET",
            Self::Set => "DRIVER_EVENT_SET",
            Self::ClockSync => "DRIVER_EVENT_CLOCK_SYNC",
            Self::StartDirect => "DRIVER_EVENT_START_DIRECT",
            Self::StopDirect => "DRIVER_EVENT_STOP_DIRECT",
            Self::ExecuteDirect => "EXECUTE_DIRECT",
            Self::ScheduledClockSync => "PROTOCOL_EVENT_SCHEDULED_CLOCK_SYNC",
            Self::GetCalibration => "PROTOCOL_EVENT_GET_CALIBRATION",
            Self::GetConfiguration => "PROTOCOL_EVENT_GET_CONFIGURATION",
            Self::SaveSetupToRam => "PROTOCOL_EVENT_SAVE_SETUP_TO_RAM",
            Self::SendLastSample => "PROTOCOL_EVENT_SEND_LAST_SAMPLE",
            Self::GetErrorStatusWord => "PROTOCOL_EVENT_GET_ERROR_STATUS_WORD",
            Self::ClearErrorStatusWord => "PROTOCOL_EVENT_CLEAR_ERROR_STATUS_WORD",
            Self::GetFaultLog => "PROTOCOL_EVENT_GET_FAULT_LOG",
            Self::ClearFaultLog => "PROTOCOL_EVENT_CLEAR_FAULT_LOG",
            Self::GetInstrumentTransformMatrix => "PROTOCOL_EVENT_GET_INSTRUMENT_TRANSFORM_MATRIX",
            Self::RunTest200 => "PROTOCOL_EVENT_RUN_TEST_200",
        }
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolEvent {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|e| e.as_str() == s).ok_or(())
    }
}

/// 对宿主公开的能力
///
/// 能力是事件的子集：发现、读写参数与直通执行不作为能力公开。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    StartAutosample,
    StopAutosample,
    ClockSync,
    StartDirect,
    StopDirect,
    GetCalibration,
    GetConfiguration,
    SaveSetupToRam,
    SendLastSample,
    GetErrorStatusWord,
    ClearErrorStatusWord,
    GetFaultLog,
    ClearFaultLog,
    GetInstrumentTransformMatrix,
    RunTest200,
}

impl Capability {
    pub const ALL: [Capability; 15] = [
        Self::StartAutosample,
        Self::StopAutosample,
        Self::ClockSync,
        Self::StartDirect,
        Self::StopDirect,
        Self::GetCalibration,
        Self::GetConfiguration,
        Self::SaveSetupToRam,
        Self::SendLastSample,
        Self::GetErrorStatusWord,
        Self::ClearErrorStatusWord,
        Self::GetFaultLog,
        Self::ClearFaultLog,
        Self::GetInstrumentTransformMatrix,
        Self::RunTest200,
    ];

    pub fn event(self) -> ProtocolEvent {
        match self {
            Self::StartAutosample => ProtocolEvent::StartAutosample,
            Self::StopAutosample => ProtocolEvent::StopAutosample,
            Self::ClockSync => ProtocolEvent::ClockSync,
            Self::StartDirect => ProtocolEvent::StartDirect,
            Self::StopDirect => ProtocolEvent::StopDirect,
            Self::GetCalibration => ProtocolEvent::GetCalibration,
            Self::GetConfiguration => ProtocolEvent::GetConfiguration,
            Self::SaveSetupToRam => ProtocolEvent::SaveSetupToRam,
            Self::SendLastSample => ProtocolEvent::SendLastSample,
            Self::GetErrorStatusWord => ProtocolEvent::GetErrorStatusWord,
            Self::ClearErrorStatusWord => ProtocolEvent::ClearErrorStatusWord,
            Self::GetFaultLog => ProtocolEvent::GetFaultLog,
            Self::ClearFaultLog => ProtocolEvent::ClearFaultLog,
            Self::GetInstrumentTransformMatrix => ProtocolEvent::GetInstrumentTransformMatrix,
            Self::RunTest200 => ProtocolEvent::RunTest200,
        }
    }

    pub fn from_event(event: ProtocolEvent) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.event() == event)
    }

    pub fn as_str(self) -> &'static str {
        self.event().as_str()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use ProtocolEvent as E;

/// 状态转移表
const TRANSITIONS: &[(ProtocolState, &[ProtocolEvent])] = &[
    (ProtocolState::Unknown, &[E::Discover]),
    (
        ProtocolState::Command,
        &[
            E::Get,
            E::Set,
            E::StartAutosample,
            E::StartDirect,
            E::ClockSync,
            E::ScheduledClockSync,
            E::GetCalibration,
            E::GetConfiguration,
            E::SaveSetupToRam,
            E::SendLastSample,
            E::GetErrorStatusWord,
            E::ClearErrorStatusWord,
            E::GetFaultLog,
            E::ClearFaultLog,
            E::GetInstrumentTransformMatrix,
            E::RunTest200,
        ],
    ),
    (
        ProtocolState::Autosample,
        &[
            E::StopAutosample,
            E::Get,
            E::GetCalibration,
            E::GetConfiguration,
            E::ScheduledClockSync,
        ],
    ),
    (ProtocolState::DirectAccess, &[E::StopDirect, E::ExecuteDirect]),
];

/// 状态下可接受的事件
pub fn events_for(state: ProtocolState) -> &'static [ProtocolEvent] {
    TRANSITIONS
        .iter()
        .find(|(s, _)| *s == state)
        .map(|(_, events)| *events)
        .unwrap_or(&[])
}

/// 状态是否接受事件
pub fn accepts(state: ProtocolState, event: ProtocolEvent) -> bool {
    events_for(state).contains(&event)
}

/// 状态下公开的能力
pub fn capabilities_for(state: ProtocolState) -> Vec<Capability> {
    events_for(state)
        .iter()
        .filter_map(|e| Capability::from_event(*e))
        .collect()
}

/// 将请求的能力列表与当前状态的合法能力求交集
///
/// 不认识的条目静默丢弃。
pub fn filter_capabilities<S: AsRef<str>>(
    state: ProtocolState,
    requested: &[S],
) -> Vec<Capability> {
    let legal = capabilities_for(state);
    let mut out = Vec::new();
    for name in requested {
        let Ok(event) = name.as_ref().parse::<ProtocolEvent>() else {
            continue;
        };
        if let Some(cap) = Capability::from_event(event)
            && legal.contains(&cap)
            && !out.contains(&cap)
        {
            out.push(cap);
        }
    }
    out
}
