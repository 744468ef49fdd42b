//! Teledyne RDI Workhorse ADCP
//!
//! - `pd0`: PD0 二进制集合的识别与解码
//! - `text`: PS0 系统配置与 AC 校准文本的解码
//! - `command`: 命令集与响应解析
//! - `sim`: 模拟仪器（`mock` feature）

pub mod command;
pub mod pd0;
#[cfg(any(test, feature = "mock"))]
pub mod sim;
pub mod text;

use regex::bytes::Regex as BytesRegex;
use tideline_protocol::{Chunk, DataParticle, DecodeError, Sieve};

pub use command::{InstrumentCommand, ResponseParser};
pub use text::{CalibrationDecoder, SystemConfigDecoder};

/// 命令提示符
pub const PROMPT: &str = ">";
/// 仪器输出换行
pub const NEWLINE: &str = "\r\n";
/// 命令结束符
pub const COMMAND_TERMINATOR: &str = "\r";

const SYSTEM_CONFIGURATION_BLOCK: &str = r"(?s-u)Instrument S/N.*?DSP\d+-\d+-\d+\w*\r?\n";
const CALIBRATION_BLOCK: &str =
    r"(?s-u)ACTIVE FLUXGATE CALIBRATION MATRICES in NVRAM.*?Null[ ]+\|[ ]*\d+[ ]*\|[ ]*\r?\n";

/// 记录种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Ensemble,
    SystemConfiguration,
    Calibration,
}

/// Workhorse 输出流的 sieve：PD0 集合、PS0 文本块、AC 文本块
#[derive(Debug, Clone)]
pub struct WorkhorseSieve {
    system_configuration: BytesRegex,
    calibration: BytesRegex,
}

impl WorkhorseSieve {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            system_configuration: BytesRegex::new(SYSTEM_CONFIGURATION_BLOCK)?,
            calibration: BytesRegex::new(CALIBRATION_BLOCK)?,
        })
    }
}

impl Sieve for WorkhorseSieve {
    fn sieve(&self, buf: &[u8]) -> Vec<(usize, usize)> {
        let mut spans = pd0::pd0_spans(buf);
        spans.extend(
            self.system_configuration
                .find_iter(buf)
                .map(|m| (m.start(), m.end())),
        );
        spans.extend(self.calibration.find_iter(buf).map(|m| (m.start(), m.end())));
        spans
    }
}

/// 记录分类与解码
#[derive(Debug, Clone)]
pub struct WorkhorseCodec {
    system_configuration: SystemConfigDecoder,
    calibration: CalibrationDecoder,
}

impl WorkhorseCodec {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            system_configuration: SystemConfigDecoder::new()?,
            calibration: CalibrationDecoder::new()?,
        })
    }

    pub fn classify(payload: &[u8]) -> Option<RecordKind> {
        if payload.starts_with(&[pd0::HEADER_ID, pd0::DATA_SOURCE_ID]) {
            Some(RecordKind::Ensemble)
        } else if payload.starts_with(b"Instrument S/N") {
            Some(RecordKind::SystemConfiguration)
        } else if payload.starts_with(b"ACTIVE FLUXGATE") {
            Some(RecordKind::Calibration)
        } else {
            None
        }
    }

    pub fn decode(&self, chunk: &Chunk) -> Result<DataParticle, DecodeError> {
        match Self::classify(&chunk.payload) {
            Some(RecordKind::Ensemble) => pd0::decode_pd0(&chunk.payload),
            Some(RecordKind::SystemConfiguration) => {
                self.system_configuration.decode(&chunk.as_text())
            },
            Some(RecordKind::Calibration) => self.calibration.decode(&chunk.as_text()),
            None => Err(DecodeError::Unrecognized(format!(
                "{} bytes at offset {}",
                chunk.len(),
                chunk.start_offset
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workhorse::pd0::encode::Ensemble;
    use crate::workhorse::sim::{CALIBRATION_TEXT, SYSTEM_CONFIGURATION_TEXT};
    use chrono::NaiveDate;
    use tideline_protocol::{Chunker, ParticleType};

    fn mixed_stream() -> Vec<u8> {
        let time = NaiveDate::from_ymd_opt(2013, 6, 6)
            .unwrap()
            .and_hms_opt(6, 6, 6)
            .unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\r\n>garbage ");
        stream.extend_from_slice(&Ensemble::sample(1, time).encode());
        stream.extend_from_slice(b"PS0\r\n");
        stream.extend_from_slice(SYSTEM_CONFIGURATION_TEXT.as_bytes());
        stream.extend_from_slice(b"\r\n>AC\r\n");
        stream.extend_from_slice(CALIBRATION_TEXT.as_bytes());
        stream.extend_from_slice(b"\r\n>");
        stream.extend_from_slice(&Ensemble::sample(2, time).encode());
        stream
    }

    fn particle_types(chunker: &mut Chunker, codec: &WorkhorseCodec) -> Vec<ParticleType> {
        let mut out = Vec::new();
        while let Some(chunk) = chunker.get_next_chunk() {
            out.push(codec.decode(&chunk).unwrap().particle_type());
        }
        out
    }

    #[test]
    fn test_mixed_stream_in_one_piece() {
        let codec = WorkhorseCodec::new().unwrap();
        let mut chunker = Chunker::new(WorkhorseSieve::new().unwrap());
        chunker.add(&mixed_stream());
        assert_eq!(
            particle_types(&mut chunker, &codec),
            vec![
                ParticleType::AdcpPd0Parsed,
                ParticleType::AdcpSystemConfiguration,
                ParticleType::AdcpCompassCalibration,
                ParticleType::AdcpPd0Parsed,
            ]
        );
    }

    #[test]
    fn test_mixed_stream_fragmented() {
        let codec = WorkhorseCodec::new().unwrap();
        let stream = mixed_stream();

        let mut whole = Chunker::new(WorkhorseSieve::new().unwrap());
        whole.add(&stream);
        let expected = particle_types(&mut whole, &codec);

        for step in [1, 7, 32, 333] {
            let mut chunker = Chunker::new(WorkhorseSieve::new().unwrap());
            let mut actual = Vec::new();
            for piece in stream.chunks(step) {
                chunker.add(piece);
                actual.extend(particle_types(&mut chunker, &codec));
            }
            assert_eq!(actual, expected, "fragment size {step}");
        }
    }

    #[test]
    fn test_unrecognized_chunk() {
        let codec = WorkhorseCodec::new().unwrap();
        let chunk = Chunk {
            start_offset: 5,
            end_offset: 8,
            payload: bytes::Bytes::from_static(b"abc"),
        };
        assert!(matches!(codec.decode(&chunk), Err(DecodeError::Unrecognized(_))));
    }
}
