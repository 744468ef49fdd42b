//! 协议状态机
//!
//! [`Protocol`] 由 IO 线程独占：持有传输层、分块器和提示符缓冲区，
//! 按转移表处理事件，并把异步数据解码为粒子交给宿主回调。
//!
//! 命令执行是串行的：写入 `<命令>\r`，同一批字节同时进入分块器和提示符
//! 缓冲区，直到提示符 `>` 出现在缓冲区末尾为止。

use crate::config::{DriverConfig, TimeoutConfig};
use crate::error::{DriverError, ParameterError};
use crate::event::{ProtocolEvent, accepts};
use crate::hooks::DriverEventHandler;
use crate::metrics::DriverMetrics;
use crate::param::{ParamDict, ParamValue, Parameter, validate_set_values};
use crate::state::{AtomicProtocolState, ProtocolState};
use crate::workhorse::{
    COMMAND_TERMINATOR, InstrumentCommand, RecordKind, ResponseParser, WorkhorseCodec,
    WorkhorseSieve,
};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tideline_protocol::Chunker;
use tideline_transport::{Transport, TransportError};
use tracing::{debug, error, info, trace, warn};

/// 提示符缓冲区上限，超出时丢弃最旧的字节
const MAX_PROMPT_BUFFER: usize = 64 * 1024;
/// 探测期间重发唤醒换行的间隔
const WAKEUP_INTERVAL: Duration = Duration::from_secs(1);
/// 仪器时钟格式（`TT` 命令）
const CLOCK_FORMAT: &str = "%Y/%m/%d,%H:%M:%S";

/// 事件附带的参数
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventPayload {
    #[default]
    None,
    /// 读取参数（已解析的参数列表）
    Get(Vec<Parameter>),
    /// 设置参数（已在调用侧完成校验）
    Set(Vec<(Parameter, ParamValue)>),
    /// 直通模式下原样写入的字节
    Direct(Vec<u8>),
}

/// 事件执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// 无返回值
    Done,
    /// 事件后的协议状态
    State(ProtocolState),
    /// 参数值
    Params(BTreeMap<Parameter, ParamValue>),
    /// 仪器响应文本
    Text(String),
}

/// IO 线程与 API 共享的状态
///
/// 状态和参数快照都可以无锁读取。
#[derive(Debug)]
pub struct DriverContext {
    pub state: AtomicProtocolState,
    pub params: ArcSwap<ParamDict>,
    pub metrics: DriverMetrics,
    /// IO 线程是否在运行且连接可用
    pub connected: AtomicBool,
}

impl DriverContext {
    pub fn new() -> Self {
        Self {
            state: AtomicProtocolState::new(ProtocolState::Unknown),
            params: ArcSwap::from_pointee(ParamDict::new()),
            metrics: DriverMetrics::new(),
            connected: AtomicBool::new(false),
        }
    }
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Workhorse 协议状态机
pub struct Protocol {
    transport: Box<dyn Transport>,
    chunker: Chunker,
    prompt_buf: Vec<u8>,
    read_buf: Vec<u8>,
    codec: WorkhorseCodec,
    responses: ResponseParser,
    params: ParamDict,
    ctx: Arc<DriverContext>,
    handler: Arc<dyn DriverEventHandler>,
    timeouts: TimeoutConfig,
    startup: Vec<(Parameter, ParamValue)>,
    /// 启动参数尚未下发
    startup_pending: bool,
    /// 进入直通模式时保存的参数
    da_snapshot: BTreeMap<Parameter, ParamValue>,
    saw_ensemble: bool,
}

impl Protocol {
    pub fn new(
        transport: Box<dyn Transport>,
        config: &DriverConfig,
        ctx: Arc<DriverContext>,
        handler: Arc<dyn DriverEventHandler>,
    ) -> Result<Self, DriverError> {
        let pattern_error = |e: regex::Error| DriverError::Config(format!("invalid pattern: {e}"));
        let sieve = WorkhorseSieve::new().map_err(pattern_error)?;

        Ok(Self {
            transport,
            chunker: Chunker::new(sieve),
            prompt_buf: Vec::new(),
            read_buf: vec![0u8; 4096],
            codec: WorkhorseCodec::new().map_err(pattern_error)?,
            responses: ResponseParser::new().map_err(pattern_error)?,
            params: ParamDict::new(),
            ctx,
            handler,
            timeouts: config.timeouts.clone(),
            startup: config.startup_values()?,
            startup_pending: true,
            da_snapshot: BTreeMap::new(),
            saw_ensemble: false,
        })
    }

    pub fn state(&self) -> ProtocolState {
        self.ctx.state.get()
    }

    /// 处理一个事件
    ///
    /// 当前状态不接受该事件时返回 [`DriverError::State`]，不产生任何设备 IO。
    pub fn handle(
        &mut self,
        event: ProtocolEvent,
        payload: EventPayload,
    ) -> Result<CommandResult, DriverError> {
        let state = self.state();
        if !accepts(state, event) {
            return Err(DriverError::State { state, event });
        }
        debug!("Handling {} in {}", event, state);

        use ProtocolEvent as E;
        use ProtocolState as S;
        match (state, event) {
            (S::Unknown, E::Discover) => self.discover().map(CommandResult::State),

            (_, E::Get) => {
                let params = match payload {
                    EventPayload::Get(params) => params,
                    _ => Parameter::ALL.to_vec(),
                };
                Ok(CommandResult::Params(self.params.select(&params)))
            },
            (S::Command, E::Set) => match payload {
                EventPayload::Set(values) => self.set_params(&values).map(CommandResult::Params),
                other => Err(DriverError::Protocol(format!("set requires values, got {other:?}"))),
            },

            (S::Command, E::StartAutosample) => {
                self.start_deploy()?;
                self.transition(S::Autosample);
                Ok(CommandResult::State(S::Autosample))
            },
            (S::Autosample, E::StopAutosample) => {
                self.break_to_command()?;
                self.transition(S::Command);
                self.apply_startup_if_pending()?;
                Ok(CommandResult::State(S::Command))
            },

            (S::Command, E::ClockSync | E::ScheduledClockSync) => {
                self.sync_clock().map(CommandResult::Text)
            },
            (S::Autosample, E::ScheduledClockSync) => {
                self.while_paused(|p| p.sync_clock()).map(CommandResult::Text)
            },
            (S::Autosample, E::GetCalibration | E::GetConfiguration) => {
                let command = InstrumentCommand::for_event(event)
                    .ok_or_else(|| DriverError::UnknownCommand(event.to_string()))?;
                self.while_paused(|p| p.do_cmd_resp(&command)).map(CommandResult::Text)
            },

            (S::Command, E::StartDirect) => {
                self.da_snapshot = self.params.select(&direct_access_params());
                self.transition(S::DirectAccess);
                Ok(CommandResult::State(S::DirectAccess))
            },
            (S::DirectAccess, E::ExecuteDirect) => match payload {
                EventPayload::Direct(bytes) => {
                    self.transport.write_all(&bytes)?;
                    DriverMetrics::add(&self.ctx.metrics.commands_sent, 1);
                    Ok(CommandResult::Done)
                },
                other => Err(DriverError::Protocol(format!(
                    "direct execution requires bytes, got {other:?}"
                ))),
            },
            (S::DirectAccess, E::StopDirect) => self.stop_direct().map(CommandResult::State),

            (S::Command, _) => {
                let command = InstrumentCommand::for_event(event)
                    .ok_or_else(|| DriverError::UnknownCommand(event.to_string()))?;
                self.do_cmd_resp(&command).map(CommandResult::Text)
            },

            _ => Err(DriverError::State { state, event }),
        }
    }

    /// 定时任务触发的事件；状态不合法时什么也不做
    pub fn handle_scheduled(&mut self, event: ProtocolEvent) -> Result<(), DriverError> {
        let state = self.state();
        if !accepts(state, event) {
            debug!("Scheduled {} skipped in {}", event, state);
            DriverMetrics::add(&self.ctx.metrics.scheduled_skipped, 1);
            return Ok(());
        }
        DriverMetrics::add(&self.ctx.metrics.scheduled_fired, 1);
        self.handle(event, EventPayload::None).map(|_| ())
    }

    /// 空闲时轮询：处理异步数据，直通模式下转发原始字节
    pub fn poll(&mut self) -> Result<(), DriverError> {
        let relay = self.state() == ProtocolState::DirectAccess;
        self.pump(relay)?;
        self.prompt_buf.clear();
        Ok(())
    }

    /// 连接丢失：回到 UNKNOWN 并通知宿主
    pub fn connection_lost(&mut self, error: &DriverError) {
        error!("Connection lost: {}", error);
        self.ctx.connected.store(false, Ordering::Release);
        self.startup_pending = true;
        self.transition(ProtocolState::Unknown);
        self.handler.on_exception(error);
    }

    fn transition(&mut self, next: ProtocolState) {
        let prev = self.ctx.state.swap(next);
        if prev != next {
            info!("Protocol state {} -> {}", prev, next);
            self.handler.on_state_change(next);
        }
    }

    /// 读取一次（最多等待一个轮询间隔），返回读到的字节数
    fn pump(&mut self, relay: bool) -> Result<usize, DriverError> {
        let timeout = self.timeouts.poll_interval();
        let n = match self.transport.read_timeout(&mut self.read_buf, timeout) {
            Ok(n) => n,
            Err(TransportError::Timeout) => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(0);
        }
        DriverMetrics::add(&self.ctx.metrics.bytes_received, n as u64);

        let data = &self.read_buf[..n];
        trace!("RX {} bytes", n);
        if relay {
            self.handler.on_direct_access(data);
            return Ok(n);
        }

        self.prompt_buf.extend_from_slice(data);
        if self.prompt_buf.len() > MAX_PROMPT_BUFFER {
            let excess = self.prompt_buf.len() - MAX_PROMPT_BUFFER;
            self.prompt_buf.drain(..excess);
        }
        self.chunker.add(data);
        self.process_chunks();
        Ok(n)
    }

    fn process_chunks(&mut self) {
        while let Some(chunk) = self.chunker.get_next_chunk() {
            if WorkhorseCodec::classify(&chunk.payload) == Some(RecordKind::Ensemble) {
                self.saw_ensemble = true;
            }
            match self.codec.decode(&chunk) {
                Ok(particle) => {
                    DriverMetrics::add(&self.ctx.metrics.particles_published, 1);
                    self.handler.on_particle(&particle);
                },
                Err(e) => {
                    DriverMetrics::add(&self.ctx.metrics.chunks_rejected, 1);
                    warn!(
                        "Dropping undecodable record at offset {} ({} bytes): {}",
                        chunk.start_offset,
                        chunk.len(),
                        e
                    );
                    trace!("Record bytes: {}", hex::encode(&chunk.payload));
                },
            }
        }
    }

    fn write_command(&mut self, command: &InstrumentCommand) -> Result<(), DriverError> {
        let line = format!("{}{}", command.to_line(), COMMAND_TERMINATOR);
        trace!("TX {:?}", line);
        self.transport.write_all(line.as_bytes())?;
        DriverMetrics::add(&self.ctx.metrics.commands_sent, 1);
        Ok(())
    }

    /// 等待提示符，超时返回 `false`
    fn await_prompt(&mut self, timeout: Duration) -> Result<bool, DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump(false)?;
            if self.responses.ends_with_prompt(&self.prompt_buf) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// 发送命令并等待完整响应（带重试）
    fn do_cmd_resp(&mut self, command: &InstrumentCommand) -> Result<String, DriverError> {
        let max_retries = self.timeouts.max_retries;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                warn!("No prompt after {}, retry {}/{}", command, attempt, max_retries);
                DriverMetrics::add(&self.ctx.metrics.command_retries, 1);
            }
            self.prompt_buf.clear();
            self.write_command(command)?;
            if !command.expects_prompt() {
                return Ok(String::new());
            }
            if self.await_prompt(self.timeouts.response())? {
                let text = String::from_utf8_lossy(&self.prompt_buf).into_owned();
                self.prompt_buf.clear();
                if let Some(err) = self.responses.device_error(&text) {
                    return Err(DriverError::Protocol(format!("{command}: {err}")));
                }
                return Ok(text);
            }
        }
        DriverMetrics::add(&self.ctx.metrics.command_timeouts, 1);
        Err(DriverError::Timeout(command.to_string()))
    }

    /// 探测仪器当前模式
    ///
    /// 提示符意味着命令模式，PD0 集合意味着正在采样。
    fn probe(&mut self) -> Result<ProtocolState, DriverError> {
        self.prompt_buf.clear();
        self.saw_ensemble = false;
        let deadline = Instant::now() + self.timeouts.discover();
        let mut next_wakeup = Instant::now();

        loop {
            let now = Instant::now();
            if self.saw_ensemble {
                return Ok(ProtocolState::Autosample);
            }
            if self.responses.ends_with_prompt(&self.prompt_buf) {
                self.prompt_buf.clear();
                return Ok(ProtocolState::Command);
            }
            if now >= deadline {
                return Err(DriverError::Timeout("discover".into()));
            }
            if now >= next_wakeup {
                self.write_command(&InstrumentCommand::Wakeup)?;
                next_wakeup = now + WAKEUP_INTERVAL;
            }
            self.pump(false)?;
        }
    }

    fn discover(&mut self) -> Result<ProtocolState, DriverError> {
        let found = self.probe()?;
        info!("Discovered instrument in {}", found);
        self.transition(found);
        if found == ProtocolState::Command {
            self.apply_startup_if_pending()?;
        }
        Ok(found)
    }

    fn apply_startup_if_pending(&mut self) -> Result<(), DriverError> {
        if !self.startup_pending {
            return Ok(());
        }
        debug!("Applying {} startup parameters", self.startup.len());
        for (param, value) in self.startup.clone() {
            let formatted = param.format_for_device(&value);
            self.do_cmd_resp(&InstrumentCommand::Set(param, formatted))?;
        }
        self.startup_pending = false;
        self.refresh_params()
    }

    /// 重新读取全部参数并发布快照
    fn refresh_params(&mut self) -> Result<(), DriverError> {
        for param in Parameter::ALL {
            let text = self.do_cmd_resp(&InstrumentCommand::Query(param))?;
            match self
                .responses
                .param_value(&text, param)
                .and_then(|raw| param.parse_device_value(raw))
            {
                Some(value) => self.params.set(param, value),
                None => warn!("Could not parse {} from response {:?}", param, text),
            }
        }
        self.publish_params();
        Ok(())
    }

    fn publish_params(&mut self) {
        self.ctx.params.store(Arc::new(self.params.clone()));
        self.handler.on_config_change(&self.params.to_map());
    }

    /// 写入单个参数并回读确认
    fn set_one(&mut self, param: Parameter, value: &ParamValue) -> Result<(), DriverError> {
        let formatted = param.format_for_device(value);
        match self.do_cmd_resp(&InstrumentCommand::Set(param, formatted)) {
            Ok(_) => {},
            Err(DriverError::Protocol(reason)) => {
                return Err(ParameterError::Rejected { param, reason }.into());
            },
            Err(e) => return Err(e),
        }

        let text = self.do_cmd_resp(&InstrumentCommand::Query(param))?;
        let raw = self
            .responses
            .param_value(&text, param)
            .ok_or_else(|| DriverError::Protocol(format!("no value for {param} in {text:?}")))?;
        if param.parse_device_value(raw).as_ref() != Some(value) {
            return Err(ParameterError::Mismatch {
                param,
                expected: value.to_string(),
                actual: raw.to_string(),
            }
            .into());
        }
        self.params.set(param, value.clone());
        Ok(())
    }

    /// 写入宿主请求的参数；写入任何字节之前先整体校验
    fn set_params(
        &mut self,
        values: &[(Parameter, ParamValue)],
    ) -> Result<BTreeMap<Parameter, ParamValue>, DriverError> {
        let values = validate_set_values(values)?;
        let mut result = Ok(());
        let mut applied = BTreeMap::new();
        for (param, value) in &values {
            if let Err(e) = self.set_one(*param, value) {
                result = Err(e);
                break;
            }
            applied.insert(*param, value.clone());
        }
        if !applied.is_empty() {
            self.publish_params();
        }
        result.map(|_| applied)
    }

    fn start_deploy(&mut self) -> Result<(), DriverError> {
        self.do_cmd_resp(&InstrumentCommand::StartDeploy).map(|_| ())
    }

    /// 发送 break 使仪器回到命令模式
    fn break_to_command(&mut self) -> Result<(), DriverError> {
        let max_retries = self.timeouts.max_retries;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                warn!("No prompt after break, retry {}/{}", attempt, max_retries);
                DriverMetrics::add(&self.ctx.metrics.command_retries, 1);
            }
            self.prompt_buf.clear();
            self.transport.send_break()?;
            DriverMetrics::add(&self.ctx.metrics.commands_sent, 1);
            if self.await_prompt(self.timeouts.response())? {
                self.prompt_buf.clear();
                return Ok(());
            }
        }
        DriverMetrics::add(&self.ctx.metrics.command_timeouts, 1);
        Err(DriverError::Timeout("break".into()))
    }

    /// 暂停采样执行命令，然后恢复采样
    fn while_paused<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        self.break_to_command()?;
        let result = f(self);
        self.start_deploy()?;
        result
    }

    fn sync_clock(&mut self) -> Result<String, DriverError> {
        let now = Utc::now().format(CLOCK_FORMAT).to_string();
        debug!("Synchronizing instrument clock to {}", now);
        self.do_cmd_resp(&InstrumentCommand::SetClock(now))
    }

    /// 离开直通模式：重新探测，恢复直通前的参数，回到探测到的状态
    fn stop_direct(&mut self) -> Result<ProtocolState, DriverError> {
        let found = self.probe()?;
        if found == ProtocolState::Autosample {
            self.break_to_command()?;
        }

        let snapshot = std::mem::take(&mut self.da_snapshot);
        for (param, value) in &snapshot {
            let formatted = param.format_for_device(value);
            self.do_cmd_resp(&InstrumentCommand::Set(*param, formatted))?;
        }
        self.refresh_params()?;

        if found == ProtocolState::Autosample {
            self.start_deploy()?;
        }
        self.transition(found);
        Ok(found)
    }
}

fn direct_access_params() -> Vec<Parameter> {
    Parameter::ALL
        .into_iter()
        .filter(|p| p.spec().direct_access)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{ChannelEventHandler, DriverEvent};
    use crate::workhorse::sim::{SimHandle, SimulatedWorkhorse};
    use crossbeam_channel::Receiver;

    fn fast_config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.timeouts.response_secs = 0.5;
        config.timeouts.discover_secs = 1.0;
        config.timeouts.max_retries = 1;
        config.timeouts.poll_interval_ms = 5;
        config
    }

    fn protocol() -> (Protocol, SimHandle, Receiver<DriverEvent>) {
        let (port, sim) = SimulatedWorkhorse::new();
        sim.set_ensemble_interval(Duration::from_millis(20));
        let (handler, events) = ChannelEventHandler::new();
        let protocol = Protocol::new(
            Box::new(port),
            &fast_config(),
            Arc::new(DriverContext::new()),
            Arc::new(handler),
        )
        .unwrap();
        (protocol, sim, events)
    }

    #[test]
    fn test_discover_command_applies_startup() {
        let (mut p, sim, _events) = protocol();
        sim.set_param(Parameter::SpeedOfSound, &ParamValue::Int(1500));

        let result = p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        assert_eq!(result, CommandResult::State(ProtocolState::Command));
        assert_eq!(sim.param(Parameter::SpeedOfSound).as_deref(), Some("1485"));
        assert_eq!(p.params.get(Parameter::SpeedOfSound), Some(&ParamValue::Int(1485)));
        assert_eq!(p.ctx.params.load().len(), Parameter::ALL.len());
    }

    #[test]
    fn test_discover_autosample_defers_startup() {
        let (mut p, sim, events) = protocol();
        sim.start_autosample();

        let result = p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        assert_eq!(result, CommandResult::State(ProtocolState::Autosample));
        assert!(p.startup_pending);
        assert!(events.try_iter().any(|e| matches!(e, DriverEvent::Particle(_))));

        p.handle(ProtocolEvent::StopAutosample, EventPayload::None).unwrap();
        assert_eq!(p.state(), ProtocolState::Command);
        assert!(!p.startup_pending);
        assert!(!sim.is_autosampling());
    }

    #[test]
    fn test_state_error_writes_nothing() {
        let (mut p, sim, _events) = protocol();
        let err = p.handle(ProtocolEvent::StartAutosample, EventPayload::None).unwrap_err();
        assert!(matches!(err, DriverError::State { state: ProtocolState::Unknown, .. }));
        assert!(sim.received().is_empty());
    }

    #[test]
    fn test_set_mismatch_keeps_cached_value() {
        let (mut p, sim, _events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        sim.stick_value(Parameter::PingsPerEnsemble, "2");

        let err = p
            .handle(
                ProtocolEvent::Set,
                EventPayload::Set(vec![(Parameter::PingsPerEnsemble, ParamValue::Int(5))]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Parameter(ParameterError::Mismatch {
                param: Parameter::PingsPerEnsemble,
                ..
            })
        ));
        assert_eq!(p.params.get(Parameter::PingsPerEnsemble), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_invalid_set_writes_nothing() {
        let (mut p, sim, _events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        let before = sim.received().len();

        let err = p
            .handle(
                ProtocolEvent::Set,
                EventPayload::Set(vec![(Parameter::WaterProfilingMode, ParamValue::Int(5))]),
            )
            .unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::ReadOnly(_))));

        // 第一个值合法也不写入
        let err = p
            .handle(
                ProtocolEvent::Set,
                EventPayload::Set(vec![
                    (Parameter::PingsPerEnsemble, ParamValue::Int(3)),
                    (Parameter::Salinity, ParamValue::Int(99)),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::OutOfRange { .. })));
        assert_eq!(sim.received().len(), before);
        assert_eq!(sim.param(Parameter::Salinity).as_deref(), Some("35"));
    }

    #[test]
    fn test_set_rejected_by_instrument() {
        let (mut p, sim, _events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        sim.reject_sets(Parameter::Salinity);

        let err = p
            .handle(
                ProtocolEvent::Set,
                EventPayload::Set(vec![(Parameter::Salinity, ParamValue::Int(30))]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Parameter(ParameterError::Rejected { param: Parameter::Salinity, .. })
        ));
    }

    #[test]
    fn test_mute_instrument_times_out_with_retries() {
        let (mut p, sim, _events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        sim.set_mute(true);

        let before = p.ctx.metrics.snapshot();
        let err = p.handle(ProtocolEvent::GetFaultLog, EventPayload::None).unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
        let after = p.ctx.metrics.snapshot();
        assert_eq!(after.command_retries - before.command_retries, 1);
        assert_eq!(after.command_timeouts - before.command_timeouts, 1);
    }

    #[test]
    fn test_device_error_is_protocol_error() {
        let (mut p, _sim, _events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        let err = p
            .do_cmd_resp(&InstrumentCommand::Set(Parameter::Salinity, String::new()))
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(ref m) if m.contains("ERR 010")));
    }

    #[test]
    fn test_calibration_in_autosample_resumes_sampling() {
        let (mut p, sim, events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        p.handle(ProtocolEvent::StartAutosample, EventPayload::None).unwrap();
        let _ = events.try_iter().count();

        p.handle(ProtocolEvent::GetCalibration, EventPayload::None).unwrap();
        assert_eq!(p.state(), ProtocolState::Autosample);
        assert!(sim.is_autosampling());
        let commands = sim.commands();
        assert_eq!(&commands[commands.len() - 3..], ["<BREAK>", "AC", "CS"]);
        assert!(events.try_iter().any(|e| matches!(
            e,
            DriverEvent::Particle(ref p)
                if p.particle_type() == tideline_protocol::ParticleType::AdcpCompassCalibration
        )));
    }

    #[test]
    fn test_direct_access_restores_parameters() {
        let (mut p, sim, events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        p.handle(ProtocolEvent::StartDirect, EventPayload::None).unwrap();

        p.handle(ProtocolEvent::ExecuteDirect, EventPayload::Direct(b"CL2\r".to_vec()))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            p.poll().unwrap();
        }
        assert_eq!(sim.param(Parameter::SleepEnable).as_deref(), Some("2"));
        assert!(events.try_iter().any(|e| matches!(e, DriverEvent::DirectAccess(_))));

        let result = p.handle(ProtocolEvent::StopDirect, EventPayload::None).unwrap();
        assert_eq!(result, CommandResult::State(ProtocolState::Command));
        assert_eq!(sim.param(Parameter::SleepEnable).as_deref(), Some("0"));
    }

    #[test]
    fn test_connection_lost_resets_state() {
        let (mut p, sim, events) = protocol();
        p.handle(ProtocolEvent::Discover, EventPayload::None).unwrap();
        sim.disconnect();

        let err = p.poll().unwrap_err();
        assert!(err.is_connection_lost());
        p.connection_lost(&err);
        assert_eq!(p.state(), ProtocolState::Unknown);
        assert!(events.try_iter().any(|e| matches!(e, DriverEvent::Exception(_))));
    }
}
