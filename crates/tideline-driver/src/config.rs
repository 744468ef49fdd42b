//! 驱动配置
//!
//! 配置可以直接构造，也可以从 TOML 读取：
//!
//! ```toml
//! [comms]
//! host = "10.180.80.178"
//! port = 2101
//!
//! [timeouts]
//! response_secs = 5.0
//! max_retries = 3
//!
//! [scheduler]
//! clock_sync_secs = 86400.0
//! get_calibration_secs = 3600.0
//!
//! [startup_params]
//! PINGS_PER_ENSEMBLE = 2
//! ```

use crate::error::DriverError;
use crate::param::{ParamValue, Parameter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// 通信配置（串口服务器地址）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2101,
            connect_timeout_secs: 5.0,
        }
    }
}

impl CommsConfig {
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }
}

/// 超时与重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 单次命令等待响应的时间
    pub response_secs: f64,
    /// 命令超时后的重发次数
    pub max_retries: u32,
    /// 单次发现探测的等待时间
    pub discover_secs: f64,
    /// 发现的默认尝试次数
    pub discover_max_tries: u32,
    /// 外观层等待 IO 线程回复的上限
    pub request_secs: f64,
    /// IO 线程轮询传输层的读超时（毫秒）
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            response_secs: 5.0,
            max_retries: 3,
            discover_secs: 5.0,
            discover_max_tries: 5,
            request_secs: 120.0,
            poll_interval_ms: 20,
        }
    }
}

impl TimeoutConfig {
    pub fn response(&self) -> Duration {
        secs(self.response_secs)
    }

    pub fn discover(&self) -> Duration {
        secs(self.discover_secs)
    }

    pub fn request(&self) -> Duration {
        secs(self.request_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// 定时任务间隔（秒）；`None` 表示不调度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub clock_sync_secs: Option<f64>,
    pub get_calibration_secs: Option<f64>,
    pub get_configuration_secs: Option<f64>,
}

/// 驱动配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub comms: CommsConfig,
    pub timeouts: TimeoutConfig,
    pub scheduler: SchedulerConfig,
    /// 覆盖参数的启动值（按参数名）
    pub startup_params: BTreeMap<String, ParamValue>,
}

impl DriverConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        let config: Self = toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// 检查配置是否可用
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.comms.host.trim().is_empty() {
            return Err(DriverError::Config("comms.host is empty".into()));
        }
        if self.comms.port == 0 {
            return Err(DriverError::Config("comms.port must be non-zero".into()));
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("timeouts.response_secs", t.response_secs),
            ("timeouts.discover_secs", t.discover_secs),
            ("timeouts.request_secs", t.request_secs),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(DriverError::Config(format!("{name} must be positive")));
            }
        }
        let s = &self.scheduler;
        for (name, value) in [
            ("scheduler.clock_sync_secs", s.clock_sync_secs),
            ("scheduler.get_calibration_secs", s.get_calibration_secs),
            ("scheduler.get_configuration_secs", s.get_configuration_secs),
        ] {
            if let Some(v) = value
                && !(v.is_finite() && v > 0.0)
            {
                return Err(DriverError::Config(format!("{name} must be positive")));
            }
        }
        self.startup_values().map(|_| ())
    }

    /// 启动时下发的参数值：静态默认值叠加配置覆盖
    pub fn startup_values(&self) -> Result<Vec<(Parameter, ParamValue)>, DriverError> {
        let mut values: BTreeMap<Parameter, ParamValue> = Parameter::ALL
            .into_iter()
            .filter_map(|p| p.spec().startup.map(|v| (p, v.to_value())))
            .collect();

        for (name, value) in &self.startup_params {
            let param = Parameter::parse(name)?;
            if param.spec().startup.is_none() {
                return Err(DriverError::Config(format!(
                    "{name} is not a startup parameter"
                )));
            }
            values.insert(param, param.validate(value)?);
        }
        Ok(values.into_iter().collect())
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        let startup = config.startup_values().unwrap();
        assert!(startup.contains(&(Parameter::SpeedOfSound, ParamValue::Int(1485))));
        assert!(!startup.iter().any(|(p, _)| *p == Parameter::Time));
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = DriverConfig::from_toml_str(
            r#"
            [comms]
            host = "10.180.80.178"
            port = 2135

            [timeouts]
            response_secs = 0.5

            [scheduler]
            clock_sync_secs = 60.0

            [startup_params]
            PINGS_PER_ENSEMBLE = 2
            WATER_REFERENCE_LAYER = "1,5"
            "#,
        )
        .unwrap();

        assert_eq!(config.comms.port, 2135);
        assert_eq!(config.timeouts.response(), Duration::from_millis(500));
        assert_eq!(config.timeouts.max_retries, 3);
        assert_eq!(config.scheduler.clock_sync_secs, Some(60.0));

        let startup = config.startup_values().unwrap();
        assert!(startup.contains(&(Parameter::PingsPerEnsemble, ParamValue::Int(2))));
        assert!(startup.contains(&(
            Parameter::WaterReferenceLayer,
            ParamValue::Text("001,005".into())
        )));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let err = DriverConfig::from_toml_str("[comms]\nport = 0\n").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));

        let err = DriverConfig::from_toml_str("[startup_params]\nBOGUS = 1\n").unwrap_err();
        assert!(matches!(err, DriverError::Parameter(_)));

        let err = DriverConfig::from_toml_str("[startup_params]\nSALINITY = 99\n").unwrap_err();
        assert!(matches!(err, DriverError::Parameter(_)));

        let err = DriverConfig::from_toml_str("[scheduler]\nclock_sync_secs = -1.0\n").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[comms]\nhost = \"adcp.local\"\nport = 4001").unwrap();
        let config = DriverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.comms.host, "adcp.local");
        assert!(DriverConfig::from_file("/nonexistent/driver.toml").is_err());
    }
}
