//! 模拟 Workhorse ADCP
//!
//! 实现 [`Transport`]，按真实仪器的方式回显命令、返回提示符，
//! 在采样模式下周期输出 PD0 集合。测试通过 [`SimHandle`] 注入故障并检查
//! 仪器收到的字节。

use super::pd0::encode::Ensemble;
use crate::param::{ParamValue, Parameter};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tideline_transport::{SOFT_BREAK, Transport, TransportError};

/// PS0 输出
pub const SYSTEM_CONFIGURATION_TEXT: &str = concat!(
    "Instrument S/N:  18444\r\n",
    "       Frequency:  76800 HZ\r\n",
    "   Configuration:  4 BEAM, JANUS\r\n",
    "     Match Layer:  10\r\n",
    "      Beam Angle:  20 DEGREES\r\n",
    "    Beam Pattern:  CONVEX\r\n",
    "     Orientation:  UP\r\n",
    "       Sensor(s):  HEADING  TILT 1  TILT 2  DEPTH  TEMPERATURE  PRESSURE\r\n",
    "Pressure Sens Coefficients:\r\n",
    "              c3 = -1.927850E-11\r\n",
    "              c2 = +1.281892E-06\r\n",
    "              c1 = +1.375793E+00\r\n",
    "          Offset = +2.427800E+00\r\n",
    "\r\n",
    "Temp Sens Offset:  -0.01 degrees C\r\n",
    "\r\n",
    "    CPU Firmware:  50.40 [0]\r\n",
    "   Boot Code Ver:  Required:  1.16   Actual:  1.16\r\n",
    "    DEMOD #1 Ver:  ad48, Type:  1f\r\n",
    "    DEMOD #2 Ver:  ad48, Type:  1f\r\n",
    "    PWRTIMG  Ver:  85d3, Type:   7\r\n",
    "\r\n",
    "Board Serial Number Data:\r\n",
    "   72  00 00 06 FE BC D8  09 HPA727-3009-00B \r\n",
    "   81  00 00 06 F5 CD 9E  09 REC727-1004-06A\r\n",
    "   A5  00 00 06 FF 1C 79  09 HPI727-3007-00A\r\n",
    "   82  00 00 06 FF 23 E5  09 CPU727-2011-00E\r\n",
    "   07  00 00 06 F6 05 15  09 TUN727-1005-06A\r\n",
    "   DB  00 00 06 F5 CB 5D  09 DSP727-2001-06H\r\n",
);

/// AC 输出
pub const CALIBRATION_TEXT: &str = concat!(
    "ACTIVE FLUXGATE CALIBRATION MATRICES in NVRAM\r\n",
    "               Calibration date and time: 9/14/2012  09:25:32\r\n",
    "                             S inverse\r\n",
    "\r\n",
    "     Bx   |   3.9218e-01  3.9660e-01 -3.1681e-02  6.4332e-03 |\r\n",
    "     By   |  -2.4320e-02 -1.0376e-02 -2.2428e-03 -6.0628e-01 |\r\n",
    "     Bz   |   2.2453e-01 -2.1972e-01 -2.7990e-01 -2.4339e-03 |\r\n",
    "     Err  |   4.6514e-01 -4.0455e-01  6.9083e-01 -1.4291e-02 |\r\n",
    "\r\n",
    "                             Coil Offset\r\n",
    "                         |   3.4233e+04   |\r\n",
    "                         |   3.4449e+04   |\r\n",
    "                         |   3.4389e+04   |\r\n",
    "                         |   3.4698e+04   |\r\n",
    "\r\n",
    "                             Electrical Null\r\n",
    "                              | 34285 |\r\n",
    "\r\n",
    "                    TILT CALIBRATION MATRICES in NVRAM\r\n",
    "                Calibration date and time: 9/14/2012  09:14:45\r\n",
    "                    Average Temperature During Calibration was   24.4 C\r\n",
    "\r\n",
    "                   Up                              Down\r\n",
    "\r\n",
    " Roll   |   7.4612e-07  -3.1727e-05 |     |  -3.0054e-07   3.2190e-05 |\r\n",
    " Pitch  |  -3.1639e-05  -6.3505e-07 |     |  -3.1965e-05  -1.4881e-07 |\r\n",
    "\r\n",
    " Offset |   3.2808e+04   3.2568e+04 |     |   3.2279e+04   3.3047e+04 |\r\n",
    "\r\n",
    "                      Null   | 33500 |\r\n",
);

const BREAK_BANNER: &str = concat!(
    "\r\n[BREAK Wakeup A]\r\n",
    "WorkHorse Broadband ADCP Version 50.40\r\n",
    "Teledyne RD Instruments (c) 1996-2010\r\n",
    "All Rights Reserved.\r\n",
    ">",
);

const TRANSFORM_MATRIX_TEXT: &str = concat!(
    "Beam Width:   3.7 degrees\r\n",
    "\r\n",
    "Beam     Elevation     Azimuth\r\n",
    "  1         -70.00      270.00\r\n",
    "  2         -70.00       90.00\r\n",
    "  3         -70.00        0.01\r\n",
    "  4         -70.00      180.00\r\n",
    "\r\n",
    "Instrument Transformation Matrix (Down):    Q14:\r\n",
    "  1.4619  -1.4619   0.0000   0.0000       23952  -23952       0       0\r\n",
    "  0.0000   0.0000  -1.4619   1.4619           0       0  -23952   23952\r\n",
    "  0.2661   0.2661   0.2661   0.2661        4359    4359    4359    4359\r\n",
    "  1.0337   1.0337  -1.0337  -1.0337       16936   16936  -16936  -16936\r\n",
    "Beam Angle Corrections Are Loaded.\r\n",
);

const FAULT_LOG_TEXT: &str = concat!(
    "Total Unique Faults   =     2\r\n",
    "Overflow Count        =     0\r\n",
    "Time of first fault:    13/02/11,10:05:43.29\r\n",
    "Time of last fault:     13/02/22,12:59:26.80\r\n",
    "\r\n",
    "Fault Log:\r\n",
    "Entry #  0 Code=0a08h  Count=    5  Delta=112625967 Time=13/02/22,12:59:26.66\r\n",
    " Parameter = 00000000h\r\n",
    "  Tilt axis X over range.\r\n",
    "Entry #  1 Code=0a16h  Count=   39  Delta=112625966 Time=13/02/22,12:59:26.79\r\n",
    " Parameter = 00000000h\r\n",
    "  Tilt Sensor ADC time out.\r\n",
    "End of fault log.\r\n",
);

const TEST_200_TEXT: &str = concat!(
    "  Ambient  Temperature =    20.63 Degrees C\r\n",
    "  Attitude Temperature =    21.19 Degrees C\r\n",
    "  Internal Moisture    = 8AEEh\r\n",
    "\r\n",
    "Correlation Magnitude: Narrow Bandwidth\r\n",
    "\r\n",
    "               Lag  Bm1  Bm2  Bm3  Bm4\r\n",
    "                 0  255  255  255  255\r\n",
    "                 1  153  136  134  169\r\n",
    "\r\n",
    "  High Gain RSSI:    63   58   51   68\r\n",
    "   Low Gain RSSI:    11   11   10   12\r\n",
    "\r\n",
    "  SIN Duty Cycle:    49   49   50   48\r\n",
    "  COS Duty Cycle:    50   48   50   49\r\n",
    "\r\n",
    "Receive Test Results = $00020000 ... PASS\r\n",
    "\r\n",
    "IXMT    =      5.4 Amps rms  [Data=7bh]\r\n",
    "VXMT    =    387.2 Volts rms [Data=b9h]\r\n",
    "   Z    =     71.8 Ohms\r\n",
    "Transducer Test ... PASS\r\n",
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimMode {
    Command,
    Autosample,
}

#[derive(Debug)]
struct SimState {
    mode: SimMode,
    params: HashMap<Parameter, String>,
    outbox: VecDeque<u8>,
    line: Vec<u8>,
    received: Vec<u8>,
    commands: Vec<String>,
    ensemble_interval: Duration,
    next_ensemble: Instant,
    ensemble_number: u32,
    ensembles_sent: u64,
    mute: bool,
    rejects: HashSet<Parameter>,
    sticky: HashMap<Parameter, String>,
    disconnected: bool,
}

impl SimState {
    fn new() -> Self {
        let mut params: HashMap<Parameter, String> = Parameter::ALL
            .into_iter()
            .filter_map(|p| {
                p.spec().startup.map(|v| (p, p.format_for_device(&v.to_value())))
            })
            .collect();
        params.insert(Parameter::SerialDataOut, "000 000 111".into());
        params.insert(Parameter::SerialOutFwSwitches, "111 100 000".into());
        params.insert(Parameter::TimeOfFirstPing, "****/**/**,**:**:**".into());
        params.insert(
            Parameter::Time,
            Utc::now().format("%Y/%m/%d,%H:%M:%S").to_string(),
        );

        Self {
            mode: SimMode::Command,
            params,
            outbox: VecDeque::new(),
            line: Vec::new(),
            received: Vec::new(),
            commands: Vec::new(),
            ensemble_interval: Duration::from_secs(1),
            next_ensemble: Instant::now(),
            ensemble_number: 0,
            ensembles_sent: 0,
            mute: false,
            rejects: HashSet::new(),
            sticky: HashMap::new(),
            disconnected: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.outbox.extend(data.iter().copied());
    }

    /// 响应正文 + 提示符
    fn respond(&mut self, body: &str) {
        self.push(body.as_bytes());
        if !body.is_empty() && !body.ends_with("\r\n") {
            self.push(b"\r\n");
        }
        self.push(b">");
    }

    fn next_ensemble_bytes(&mut self) -> Vec<u8> {
        self.ensemble_number = self.ensemble_number.wrapping_add(1);
        Ensemble::sample(self.ensemble_number, Utc::now().naive_utc()).encode()
    }

    fn handle_break(&mut self) {
        self.commands.push("<BREAK>".into());
        self.mode = SimMode::Command;
        self.line.clear();
        self.push(BREAK_BANNER.as_bytes());
    }

    fn handle_line(&mut self, line: String) {
        self.push(line.as_bytes());
        self.push(b"\r\n");
        self.commands.push(line.clone());

        match line.as_str() {
            "" => self.respond(""),
            "CS" => {
                self.mode = SimMode::Autosample;
                self.next_ensemble = Instant::now();
            },
            "CK" => self.respond("[Parameters saved as USER defaults]"),
            "CE" => {
                let ensemble = self.next_ensemble_bytes();
                self.push(&ensemble);
                self.push(b"\r\n>");
            },
            "CY" => self.respond("Error Status Word = 00000000"),
            "CY0" => self.respond("Error Status Word Cleared"),
            "FD" => self.respond(FAULT_LOG_TEXT),
            "FC" => {
                self.respond("Fault Log Cleared.\r\nClearing buffer @0x00801000\r\nDone [i=2048].")
            },
            "PS0" => self.respond(SYSTEM_CONFIGURATION_TEXT),
            "PS3" => self.respond(TRANSFORM_MATRIX_TEXT),
            "AC" => self.respond(CALIBRATION_TEXT),
            "PT200" => self.respond(TEST_200_TEXT),
            other => self.handle_param(other),
        }
    }

    fn handle_param(&mut self, line: &str) {
        let param = line.get(..2).and_then(Parameter::from_command);
        let (Some(param), Some(rest)) = (param, line.get(2..)) else {
            self.respond("ERR 002:  UNRECOGNIZED COMMAND");
            return;
        };

        if rest == "?" {
            let value = self.params.get(&param).cloned().unwrap_or_default();
            let reply = format!(
                "{} {} ----------------- {}",
                param.command(),
                value,
                param.spec().description
            );
            self.respond(&reply);
        } else if rest.is_empty() || self.rejects.contains(&param) {
            self.respond("ERR 010:  PARAMETER OUT OF BOUNDS");
        } else {
            let stored = self
                .sticky
                .get(&param)
                .cloned()
                .unwrap_or_else(|| rest.to_string());
            self.params.insert(param, stored);
            self.respond("");
        }
    }

    fn receive(&mut self, data: &[u8]) {
        self.received.extend_from_slice(data);
        if self.mute {
            return;
        }
        if data.windows(SOFT_BREAK.len()).any(|w| w == SOFT_BREAK) {
            self.handle_break();
            return;
        }
        if self.mode == SimMode::Autosample {
            return;
        }
        for &byte in data {
            match byte {
                b'\r' => {
                    let line = String::from_utf8_lossy(&self.line).trim().to_string();
                    self.line.clear();
                    self.handle_line(line);
                },
                b'\n' => {},
                other => self.line.push(other),
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SimState>,
    readable: Condvar,
}

/// 模拟仪器端口
#[derive(Debug)]
pub struct SimulatedWorkhorse {
    shared: Arc<Shared>,
    read_timeout: Duration,
}

/// 测试侧句柄
#[derive(Debug, Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
}

impl SimulatedWorkhorse {
    /// 创建处于命令模式的模拟仪器
    pub fn new() -> (Self, SimHandle) {
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState::new()),
            readable: Condvar::new(),
        });
        (
            Self {
                shared: shared.clone(),
                read_timeout: Duration::from_millis(50),
            },
            SimHandle { shared },
        )
    }
}

impl Transport for SimulatedWorkhorse {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if state.disconnected {
            return Err(TransportError::Closed);
        }
        state.receive(data);
        drop(state);
        self.shared.readable.notify_all();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.disconnected {
                return Err(TransportError::Closed);
            }

            let now = Instant::now();
            if state.mode == SimMode::Autosample && now >= state.next_ensemble {
                let ensemble = state.next_ensemble_bytes();
                state.push(&ensemble);
                state.ensembles_sent += 1;
                state.next_ensemble = now + state.ensemble_interval;
            }

            if !state.outbox.is_empty() {
                let n = buf.len().min(state.outbox.len());
                for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            let mut wait = deadline - now;
            if state.mode == SimMode::Autosample {
                wait = wait.min(state.next_ensemble.saturating_duration_since(now));
            }
            self.shared.readable.wait_for(&mut state, wait);
        }
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }
}

impl SimHandle {
    /// 切换到采样模式（模拟驱动启动时仪器已在采样）
    pub fn start_autosample(&self) {
        let mut state = self.shared.state.lock();
        state.mode = SimMode::Autosample;
        state.next_ensemble = Instant::now();
        drop(state);
        self.shared.readable.notify_all();
    }

    pub fn is_autosampling(&self) -> bool {
        self.shared.state.lock().mode == SimMode::Autosample
    }

    pub fn set_ensemble_interval(&self, interval: Duration) {
        self.shared.state.lock().ensemble_interval = interval;
    }

    pub fn ensembles_sent(&self) -> u64 {
        self.shared.state.lock().ensembles_sent
    }

    /// 仪器收到的全部原始字节
    pub fn received(&self) -> Vec<u8> {
        self.shared.state.lock().received.clone()
    }

    /// 仪器处理过的命令行（break 记为 `<BREAK>`）
    pub fn commands(&self) -> Vec<String> {
        self.shared.state.lock().commands.clone()
    }

    /// 静默：接收但不响应任何输入
    pub fn set_mute(&self, mute: bool) {
        self.shared.state.lock().mute = mute;
    }

    /// 对该参数的设置返回错误
    pub fn reject_sets(&self, param: Parameter) {
        self.shared.state.lock().rejects.insert(param);
    }

    /// 设置该参数时仪器实际保存给定值（回读不一致）
    pub fn stick_value(&self, param: Parameter, value: &str) {
        self.shared.state.lock().sticky.insert(param, value.to_string());
    }

    /// 仪器端当前参数值（仪器格式）
    pub fn param(&self, param: Parameter) -> Option<String> {
        self.shared.state.lock().params.get(&param).cloned()
    }

    /// 直接修改仪器端参数（模拟直通模式下操作员的修改）
    pub fn set_param(&self, param: Parameter, value: &ParamValue) {
        let formatted = param.format_for_device(value);
        self.shared.state.lock().params.insert(param, formatted);
    }

    /// 注入仪器输出（噪声等）
    pub fn inject(&self, data: &[u8]) {
        self.shared.state.lock().push(data);
        self.shared.readable.notify_all();
    }

    /// 模拟连接断开
    pub fn disconnect(&self) {
        self.shared.state.lock().disconnected = true;
        self.shared.readable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_until_prompt(port: &mut SimulatedWorkhorse) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(2);
        while !out.ends_with(b">") && Instant::now() < deadline {
            if let Ok(n) = port.read(&mut buf) {
                out.extend_from_slice(&buf[..n]);
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_query_and_set() {
        let (mut port, handle) = SimulatedWorkhorse::new();
        port.write_all(b"WP?\r").unwrap();
        let reply = read_until_prompt(&mut port);
        assert!(reply.starts_with("WP?\r\nWP 1 ----"), "{reply}");

        port.write_all(b"WP7\r").unwrap();
        assert_eq!(read_until_prompt(&mut port), "WP7\r\n>");
        assert_eq!(handle.param(Parameter::PingsPerEnsemble).as_deref(), Some("7"));
    }

    #[test]
    fn test_autosample_and_break() {
        let (mut port, handle) = SimulatedWorkhorse::new();
        handle.set_ensemble_interval(Duration::from_millis(10));
        port.write_all(b"CS\r").unwrap();
        assert!(handle.is_autosampling());

        let mut buf = [0u8; 1024];
        let mut got = Vec::new();
        while got.len() < 4 {
            if let Ok(n) = port.read(&mut buf) {
                got.extend_from_slice(&buf[..n]);
            }
        }
        assert!(got.windows(2).any(|w| w == [0x7F, 0x7F]));

        port.write_all(SOFT_BREAK).unwrap();
        assert!(!handle.is_autosampling());
        assert!(handle.commands().contains(&"<BREAK>".to_string()));
    }

    #[test]
    fn test_disconnect() {
        let (mut port, handle) = SimulatedWorkhorse::new();
        handle.disconnect();
        assert!(matches!(port.write_all(b"\r"), Err(TransportError::Closed)));
        let mut buf = [0u8; 8];
        assert!(matches!(port.read(&mut buf), Err(TransportError::Closed)));
    }
}
