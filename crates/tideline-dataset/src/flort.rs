//! FLORT-D 荧光计日志记录
//!
//! 数据记录器在每行前加上接收时间，之后是仪器输出的制表符分隔字段：
//!
//! ```text
//! 2013/01/01 00:00:04.520 01/01/13\t00:00:02\t700\t4130\t695\t700\t460\t4130\t547\r\n
//! ```
//!
//! 粒子时间戳取记录器时间（毫秒精度）。

use crate::error::DatasetError;
use crate::parser::{ParserFactory, RecordParser};
use chrono::NaiveDateTime;
use regex::bytes::Regex;
use std::sync::Arc;
use tideline_protocol::{DataParticle, DecodeError, ParticleType, TimestampSource, ntp_from_naive};

const RECORD_PATTERN: &str = concat!(
    r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{3}) ",
    r"(\d{2}/\d{2}/\d{2})\t(\d{2}:\d{2}:\d{2})",
    r"\t(\d+)\t(\d+)\t(\d+)\t(\d+)\t(\d+)\t(\d+)\t(\d+)\r?\n$",
);

const LOGGER_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

/// 仪器计数字段，按记录中的顺序
const COUNT_FIELDS: [&str; 7] = [
    "measurement_wavelength_beta",
    "raw_signal_beta",
    "measurement_wavelength_chl",
    "raw_signal_chl",
    "measurement_wavelength_cdom",
    "raw_signal_cdom",
    "raw_internal_temp",
];

pub struct FlortParser {
    regex: Regex,
}

impl FlortParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(RECORD_PATTERN)?,
        })
    }

    /// 每个文件一个新解析器
    pub fn factory() -> ParserFactory {
        Arc::new(|| {
            let parser: Box<dyn RecordParser> = Box::new(FlortParser::new()?);
            Ok::<_, DatasetError>(parser)
        })
    }
}

impl RecordParser for FlortParser {
    fn parse_record(&mut self, line: &[u8]) -> Result<DataParticle, DecodeError> {
        let caps = self.regex.captures(line).ok_or_else(|| {
            DecodeError::Unrecognized(String::from_utf8_lossy(line).trim_end().to_string())
        })?;
        // 正则只匹配 ASCII
        let text = |i: usize| String::from_utf8_lossy(&caps[i]).into_owned();

        let logger_time = text(1);
        let naive = NaiveDateTime::parse_from_str(&logger_time, LOGGER_TIME_FORMAT)
            .map_err(|e| DecodeError::Malformed(format!("logger time {}: {}", logger_time, e)))?;

        let mut builder = DataParticle::builder(ParticleType::FlortdParsed, ntp_from_naive(&naive))
            .timestamp_source(TimestampSource::Instrument)
            .field("date_string", text(2))
            .field("time_string", text(3));
        for (i, name) in COUNT_FIELDS.iter().enumerate() {
            let raw = text(4 + i);
            let value: i64 = raw
                .parse()
                .map_err(|_| DecodeError::Malformed(format!("{} out of range: {}", name, raw)))?;
            builder = builder.field(name, value);
        }
        Ok(builder.build())
    }
}
