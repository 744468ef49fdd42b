//! 数据集驱动配置
//!
//! ```toml
//! records_per_second = 1.0
//!
//! [harvester]
//! directory = "/tmp/dsatest"
//! pattern = "*.flort.log"
//! frequency = 1.0
//! ```

use crate::error::DatasetError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 目录扫描配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvesterConfig {
    pub directory: PathBuf,
    /// 文件名 glob，如 `*.flort.log`
    pub pattern: String,
    /// 无新数据时的轮询间隔（秒）
    #[serde(default = "default_frequency")]
    pub frequency: f64,
}

fn default_frequency() -> f64 {
    1.0
}

impl HarvesterConfig {
    pub fn new(directory: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            pattern: pattern.into(),
            frequency: default_frequency(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.frequency)
    }

    /// 完整 glob 模式（目录 + 文件名模式）
    pub fn glob_pattern(&self) -> String {
        let dir = glob::Pattern::escape(&self.directory.to_string_lossy());
        format!("{}/{}", dir.trim_end_matches('/'), self.pattern)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub harvester: HarvesterConfig,
    /// 记录发布速率上限；`None` 表示不限速
    #[serde(default)]
    pub records_per_second: Option<f64>,
}

impl DatasetConfig {
    pub fn new(harvester: HarvesterConfig) -> Self {
        Self {
            harvester,
            records_per_second: None,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, DatasetError> {
        let config: Self = toml::from_str(text).map_err(|e| DatasetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DatasetError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), DatasetError> {
        let h = &self.harvester;
        if h.pattern.trim().is_empty() {
            return Err(DatasetError::Config("harvester.pattern is empty".into()));
        }
        glob::Pattern::new(&h.pattern)?;
        if !(h.frequency.is_finite() && h.frequency > 0.0) {
            return Err(DatasetError::Config("harvester.frequency must be positive".into()));
        }
        if let Some(rate) = self.records_per_second
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(DatasetError::Config("records_per_second must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let config = DatasetConfig::from_toml_str(
            r#"
            records_per_second = 2.0

            [harvester]
            directory = "/tmp/dsatest"
            pattern = "*.flort.log"
            "#,
        )
        .unwrap();
        assert_eq!(config.harvester.directory, PathBuf::from("/tmp/dsatest"));
        assert_eq!(config.harvester.frequency, 1.0);
        assert_eq!(config.records_per_second, Some(2.0));
        assert_eq!(config.harvester.glob_pattern(), "/tmp/dsatest/*.flort.log");
    }

    #[test]
    fn test_invalid_config() {
        let mut config = DatasetConfig::new(HarvesterConfig::new("/tmp", "*.log"));
        config.harvester.frequency = 0.0;
        assert!(matches!(config.validate(), Err(DatasetError::Config(_))));

        let config = DatasetConfig::new(HarvesterConfig::new("/tmp", "[*.log"));
        assert!(matches!(config.validate(), Err(DatasetError::Glob(_))));

        assert!(DatasetConfig::from_toml_str("[harvester]\npattern = \"*.log\"").is_err());
    }
}
