//! 断点状态（memento）
//!
//! 持久化格式：
//!
//! ```json
//! {"harvester": {"file_path": "/data/20130101.flort.log", "byte_offset": 146},
//!  "parser": {"position": 146, "timestamp": 3592854648.401}}
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 当前文件与已消费的字节数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvesterState {
    pub file_path: PathBuf,
    pub byte_offset: u64,
}

/// 文件内的解析位置
///
/// `position` 之前的记录都已发布；`timestamp` 为最后一条记录的 NTP 时间戳。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserState {
    pub position: u64,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverState {
    pub harvester: Option<HarvesterState>,
    pub parser: Option<ParserState>,
}

impl DriverState {
    /// 指定文件内的续读位置
    pub fn at(file_path: impl Into<PathBuf>, position: u64, timestamp: Option<f64>) -> Self {
        Self {
            harvester: Some(HarvesterState {
                file_path: file_path.into(),
                byte_offset: position,
            }),
            parser: Some(ParserState {
                position,
                timestamp,
            }),
        }
    }

    /// 续读的字节位置：解析器位置优先
    pub fn resume_offset(&self) -> u64 {
        self.parser
            .as_ref()
            .map(|p| p.position)
            .or_else(|| self.harvester.as_ref().map(|h| h.byte_offset))
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_layout() {
        let state = DriverState::at("/tmp/dsatest/20130101.flort.log", 146, Some(3592854648.401));
        let json: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
        assert_eq!(json["harvester"]["byte_offset"], 146);
        assert_eq!(json["parser"]["position"], 146);
        assert_eq!(json["parser"]["timestamp"], 3592854648.401);
        assert_eq!(DriverState::from_json(&state.to_json().unwrap()).unwrap(), state);
    }

    #[test]
    fn test_parser_null() {
        let state = DriverState::from_json(
            r#"{"harvester": {"file_path": "/tmp/dsatest/20130101.flort.log", "byte_offset": 146}, "parser": null}"#,
        )
        .unwrap();
        assert!(state.parser.is_none());
        assert_eq!(state.resume_offset(), 146);
        assert_eq!(DriverState::default().resume_offset(), 0);
    }
}
