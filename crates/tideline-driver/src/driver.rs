//! 仪器驱动外观（对外 API）
//!
//! [`InstrumentDriver`] 把宿主调用转换为发往 IO 线程的请求，并等待结果。
//! 参数名校验、只读检查、类型与范围检查都在入队之前完成。

use crate::config::DriverConfig;
use crate::error::{DriverError, ParameterError};
use crate::event::{Capability, ProtocolEvent, accepts, capabilities_for, filter_capabilities};
use crate::hooks::DriverEventHandler;
use crate::metrics::MetricsSnapshot;
use crate::param::{ALL_PARAMETERS, ParamDict, ParamValue, Parameter, validate_set_values};
use crate::pipeline::{REQUEST_QUEUE_CAPACITY, Request, io_loop};
use crate::protocol::{CommandResult, DriverContext, EventPayload, Protocol};
use crate::scheduler::{Scheduler, jobs_from_config};
use crate::state::{ConnectionState, ProtocolState};
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tideline_transport::{TcpTransport, Transport};
use tracing::{error, info, warn};

/// 线程退出等待上限
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// 等待回复时检查 IO 线程存活的间隔
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(50);

trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();
        // 看门狗线程代为 join，超时后继续在后台运行
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 一次连接期间的线程与通道
struct Session {
    /// 请求发送端，关闭时必须在 join 之前 drop
    req_tx: Option<Sender<Request>>,
    io_thread: Option<JoinHandle<()>>,
    scheduler: Scheduler,
    is_running: Arc<AtomicBool>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn shutdown(mut self) {
        self.scheduler.stop();
        self.is_running.store(false, Ordering::Release);
        drop(self.req_tx.take());

        if let Some(handle) = self.io_thread.take()
            && let Err(_e) = handle.join_timeout(JOIN_TIMEOUT)
        {
            error!(
                "IO thread panicked or failed to shut down within {:?}",
                JOIN_TIMEOUT
            );
        }
    }
}

/// Workhorse 仪器驱动
///
/// # 示例
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tideline_driver::{DriverConfig, InstrumentDriver, NullEventHandler};
///
/// # fn main() -> Result<(), tideline_driver::DriverError> {
/// let mut driver = InstrumentDriver::new(Arc::new(NullEventHandler));
/// driver.configure(DriverConfig::from_file("workhorse.toml")?)?;
/// driver.connect()?;
/// driver.discover()?;
/// driver.start_sampling()?;
/// # Ok(())
/// # }
/// ```
pub struct InstrumentDriver {
    handler: Arc<dyn DriverEventHandler>,
    config: Option<DriverConfig>,
    ctx: Arc<DriverContext>,
    session: Option<Session>,
}

impl InstrumentDriver {
    pub fn new(handler: Arc<dyn DriverEventHandler>) -> Self {
        Self {
            handler,
            config: None,
            ctx: Arc::new(DriverContext::new()),
            session: None,
        }
    }

    /// 设置配置（连接期间不可修改）
    pub fn configure(&mut self, config: DriverConfig) -> Result<(), DriverError> {
        if self.session.as_ref().is_some_and(Session::is_alive) {
            return Err(DriverError::AlreadyConnected);
        }
        config.validate()?;
        self.config = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Option<&DriverConfig> {
        self.config.as_ref()
    }

    /// 按配置建立 TCP 连接
    pub fn connect(&mut self) -> Result<(), DriverError> {
        let config = self.config.as_ref().ok_or(DriverError::NotConfigured)?;
        let transport = TcpTransport::connect(
            (config.comms.host.as_str(), config.comms.port),
            config.comms.connect_timeout(),
        )?;
        self.connect_with(Box::new(transport))
    }

    /// 使用给定传输层连接（模拟仪器、串口等）
    pub fn connect_with(&mut self, transport: Box<dyn Transport>) -> Result<(), DriverError> {
        let config = self.config.clone().ok_or(DriverError::NotConfigured)?;
        if self.session.as_ref().is_some_and(Session::is_alive) {
            return Err(DriverError::AlreadyConnected);
        }
        if let Some(stale) = self.session.take() {
            stale.shutdown();
        }

        self.set_state(ProtocolState::Unknown);
        let protocol = Protocol::new(transport, &config, self.ctx.clone(), self.handler.clone())?;

        let (req_tx, req_rx) = crossbeam_channel::bounded(REQUEST_QUEUE_CAPACITY);
        let is_running = Arc::new(AtomicBool::new(true));
        self.ctx.connected.store(true, Ordering::Release);

        let running = is_running.clone();
        let io_thread = std::thread::Builder::new()
            .name("tideline-io".into())
            .spawn(move || io_loop(protocol, req_rx, running))
            .map_err(|e| DriverError::Config(format!("failed to spawn IO thread: {e}")))?;

        let scheduler = Scheduler::start(jobs_from_config(&config.scheduler), req_tx.clone());
        info!("Driver connected");

        self.session = Some(Session {
            req_tx: Some(req_tx),
            io_thread: Some(io_thread),
            scheduler,
            is_running,
        });
        Ok(())
    }

    /// 断开连接，停止所有线程，状态回到 UNKNOWN
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown();
            info!("Driver disconnected");
        }
        self.ctx.connected.store(false, Ordering::Release);
        self.set_state(ProtocolState::Unknown);
    }

    fn set_state(&self, state: ProtocolState) {
        if self.ctx.state.swap(state) != state {
            self.handler.on_state_change(state);
        }
    }

    fn request(
        &self,
        event: ProtocolEvent,
        payload: EventPayload,
    ) -> Result<CommandResult, DriverError> {
        let session = self.session.as_ref().ok_or(DriverError::NotConnected)?;
        if !session.is_alive() || !self.ctx.connected.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        let req_tx = session.req_tx.as_ref().ok_or(DriverError::ChannelClosed)?;

        let state = self.current_state();
        if !accepts(state, event) {
            return Err(DriverError::State { state, event });
        }

        let (reply, reply_rx) = crossbeam_channel::bounded(1);
        req_tx
            .try_send(Request::Event {
                event,
                payload,
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => DriverError::ChannelFull,
                TrySendError::Disconnected(_) => DriverError::ChannelClosed,
            })?;

        let timeout = self
            .config
            .as_ref()
            .map(|c| c.timeouts.request())
            .unwrap_or(Duration::from_secs(120));
        let deadline = Instant::now() + timeout;
        loop {
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(REPLY_POLL_INTERVAL);
            match reply_rx.recv_timeout(slice) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(DriverError::ChannelClosed),
                Err(RecvTimeoutError::Timeout) => {},
            }
            // IO 线程已退出：请求不会再被处理
            if !session.is_alive() {
                return reply_rx.try_recv().unwrap_or(Err(DriverError::NotConnected));
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(event.to_string()));
            }
        }
    }

    fn expect_state(result: CommandResult) -> Result<ProtocolState, DriverError> {
        match result {
            CommandResult::State(state) => Ok(state),
            other => Err(DriverError::Protocol(format!("unexpected result {other:?}"))),
        }
    }

    fn expect_params(
        result: CommandResult,
    ) -> Result<BTreeMap<Parameter, ParamValue>, DriverError> {
        match result {
            CommandResult::Params(params) => Ok(params),
            other => Err(DriverError::Protocol(format!("unexpected result {other:?}"))),
        }
    }

    /// 探测仪器状态，重试次数取自配置
    pub fn discover(&mut self) -> Result<ProtocolState, DriverError> {
        let max_tries = self
            .config
            .as_ref()
            .map(|c| c.timeouts.discover_max_tries)
            .ok_or(DriverError::NotConfigured)?;
        self.discover_with_retries(max_tries)
    }

    /// 探测仪器状态，最多尝试 `max_tries` 次；全部超时后断开连接
    pub fn discover_with_retries(&mut self, max_tries: u32) -> Result<ProtocolState, DriverError> {
        let mut last = DriverError::Timeout(ProtocolEvent::Discover.to_string());
        for attempt in 1..=max_tries.max(1) {
            match self.request(ProtocolEvent::Discover, EventPayload::None) {
                Ok(result) => return Self::expect_state(result),
                Err(e @ DriverError::Timeout(_)) => {
                    warn!("Discover attempt {}/{} timed out", attempt, max_tries);
                    last = e;
                },
                Err(e) => return Err(e),
            }
        }
        error!("Instrument not discovered after {} tries, disconnecting", max_tries);
        self.handler.on_exception(&last);
        self.disconnect();
        Err(last)
    }

    pub fn start_sampling(&self) -> Result<ProtocolState, DriverError> {
        self.request(ProtocolEvent::StartAutosample, EventPayload::None)
            .and_then(Self::expect_state)
    }

    pub fn stop_sampling(&self) -> Result<ProtocolState, DriverError> {
        self.request(ProtocolEvent::StopAutosample, EventPayload::None)
            .and_then(Self::expect_state)
    }

    pub fn start_direct(&self) -> Result<ProtocolState, DriverError> {
        self.request(ProtocolEvent::StartDirect, EventPayload::None)
            .and_then(Self::expect_state)
    }

    pub fn stop_direct(&self) -> Result<ProtocolState, DriverError> {
        self.request(ProtocolEvent::StopDirect, EventPayload::None)
            .and_then(Self::expect_state)
    }

    /// 读取参数；`DRIVER_PARAMETER_ALL` 表示全部
    pub fn get(&self, names: &[&str]) -> Result<BTreeMap<Parameter, ParamValue>, DriverError> {
        let mut params = Vec::new();
        for name in names {
            if *name == ALL_PARAMETERS {
                params = Parameter::ALL.to_vec();
                break;
            }
            params.push(Parameter::parse(name)?);
        }
        self.request(ProtocolEvent::Get, EventPayload::Get(params))
            .and_then(Self::expect_params)
    }

    /// 设置参数
    ///
    /// 任一值校验失败时整个请求被拒绝，不会写入仪器。
    pub fn set(
        &self,
        values: &[(&str, ParamValue)],
    ) -> Result<BTreeMap<Parameter, ParamValue>, DriverError> {
        if values.is_empty() {
            return Err(ParameterError::Unknown("<empty>".into()).into());
        }
        let validated = values
            .iter()
            .map(|(name, value)| {
                let param = Parameter::parse(name)?;
                Ok((param, param.validate_set(value)?))
            })
            .collect::<Result<Vec<_>, ParameterError>>()?;
        self.request(ProtocolEvent::Set, EventPayload::Set(validated))
            .and_then(Self::expect_params)
    }

    /// 按事件名执行
    ///
    /// 设置参数的载荷与 [`set`](Self::set) 一样在入队前校验。
    pub fn execute(&self, name: &str, payload: EventPayload) -> Result<CommandResult, DriverError> {
        let event: ProtocolEvent = name
            .parse()
            .map_err(|_| DriverError::UnknownCommand(name.to_string()))?;
        let payload = match payload {
            EventPayload::Set(values) => EventPayload::Set(validate_set_values(&values)?),
            other => other,
        };
        self.request(event, payload)
    }

    /// 直通模式下原样写入字节
    pub fn execute_direct(&self, data: &[u8]) -> Result<(), DriverError> {
        self.request(ProtocolEvent::ExecuteDirect, EventPayload::Direct(data.to_vec()))
            .map(|_| ())
    }

    pub fn current_state(&self) -> ProtocolState {
        self.ctx.state.get()
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.config.is_none() {
            ConnectionState::Unconfigured
        } else if self.session.as_ref().is_some_and(Session::is_alive)
            && self.ctx.connected.load(Ordering::Acquire)
        {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// 当前状态下可用的能力
    pub fn capabilities(&self) -> Vec<Capability> {
        capabilities_for(self.current_state())
    }

    pub fn filter_capabilities<S: AsRef<str>>(&self, requested: &[S]) -> Vec<Capability> {
        filter_capabilities(self.current_state(), requested)
    }

    /// 最近一次读取/设置后的参数快照（无锁）
    pub fn cached_params(&self) -> Arc<ParamDict> {
        self.ctx.params.load_full()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }
}

impl Drop for InstrumentDriver {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{ChannelEventHandler, DriverEvent, NullEventHandler};
    use crate::workhorse::sim::SimulatedWorkhorse;

    fn fast_config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.timeouts.response_secs = 0.3;
        config.timeouts.discover_secs = 0.3;
        config.timeouts.max_retries = 1;
        config.timeouts.poll_interval_ms = 5;
        config
    }

    #[test]
    fn test_unconfigured_driver() {
        let mut driver = InstrumentDriver::new(Arc::new(NullEventHandler));
        assert_eq!(driver.connection_state(), ConnectionState::Unconfigured);
        let (port, _sim) = SimulatedWorkhorse::new();
        assert!(matches!(
            driver.connect_with(Box::new(port)),
            Err(DriverError::NotConfigured)
        ));
        assert!(matches!(driver.get(&["PINGS_PER_ENSEMBLE"]), Err(DriverError::NotConnected)));
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (handler, events) = ChannelEventHandler::new();
        let mut driver = InstrumentDriver::new(Arc::new(handler));
        driver.configure(fast_config()).unwrap();
        assert_eq!(driver.connection_state(), ConnectionState::Disconnected);

        let (port, _sim) = SimulatedWorkhorse::new();
        driver.connect_with(Box::new(port)).unwrap();
        assert_eq!(driver.connection_state(), ConnectionState::Connected);
        assert!(matches!(driver.configure(fast_config()), Err(DriverError::AlreadyConnected)));

        assert_eq!(driver.discover().unwrap(), ProtocolState::Command);
        driver.disconnect();
        assert_eq!(driver.connection_state(), ConnectionState::Disconnected);
        assert_eq!(driver.current_state(), ProtocolState::Unknown);
        assert!(
            events
                .try_iter()
                .any(|e| e == DriverEvent::StateChange(ProtocolState::Unknown))
        );
    }

    #[test]
    fn test_validation_happens_before_queueing() {
        let mut driver = InstrumentDriver::new(Arc::new(NullEventHandler));
        driver.configure(fast_config()).unwrap();
        let (port, sim) = SimulatedWorkhorse::new();
        driver.connect_with(Box::new(port)).unwrap();
        driver.discover().unwrap();
        let before = sim.received().len();

        let err = driver.set(&[("SERIAL_FLOW_CONTROL", ParamValue::from("11111"))]).unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::ReadOnly(_))));
        let err = driver.set(&[("NO_SUCH_PARAM", ParamValue::Int(1))]).unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::Unknown(_))));
        let err = driver.set(&[("SALINITY", ParamValue::Int(99))]).unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::OutOfRange { .. })));
        assert_eq!(sim.received().len(), before);
    }

    #[test]
    fn test_execute_set_is_validated() {
        let mut driver = InstrumentDriver::new(Arc::new(NullEventHandler));
        driver.configure(fast_config()).unwrap();
        let (port, sim) = SimulatedWorkhorse::new();
        driver.connect_with(Box::new(port)).unwrap();
        driver.discover().unwrap();
        let before = sim.received().len();

        let err = driver
            .execute(
                "DRIVER_EVENT_SET",
                EventPayload::Set(vec![(Parameter::WaterProfilingMode, ParamValue::Int(5))]),
            )
            .unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::ReadOnly(_))));
        let err = driver
            .execute(
                "DRIVER_EVENT_SET",
                EventPayload::Set(vec![(Parameter::Salinity, ParamValue::Int(99))]),
            )
            .unwrap_err();
        assert!(matches!(err, DriverError::Parameter(ParameterError::OutOfRange { .. })));
        assert_eq!(sim.received().len(), before);

        let result = driver
            .execute(
                "DRIVER_EVENT_SET",
                EventPayload::Set(vec![(Parameter::Salinity, ParamValue::Int(30))]),
            )
            .unwrap();
        let CommandResult::Params(applied) = result else {
            panic!("expected parameters");
        };
        assert_eq!(applied.get(&Parameter::Salinity), Some(&ParamValue::Int(30)));
        assert_eq!(sim.param(Parameter::Salinity).as_deref(), Some("30"));
    }

    #[test]
    fn test_unknown_command() {
        let mut driver = InstrumentDriver::new(Arc::new(NullEventHandler));
        driver.configure(fast_config()).unwrap();
        assert!(matches!(
            driver.execute("DRIVER_EVENT_DANCE", EventPayload::None),
            Err(DriverError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_discover_gives_up_and_disconnects() {
        let mut driver = InstrumentDriver::new(Arc::new(NullEventHandler));
        driver.configure(fast_config()).unwrap();
        let (port, sim) = SimulatedWorkhorse::new();
        sim.set_mute(true);
        driver.connect_with(Box::new(port)).unwrap();

        let err = driver.discover_with_retries(2).unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
        assert_eq!(driver.connection_state(), ConnectionState::Disconnected);
    }
}
