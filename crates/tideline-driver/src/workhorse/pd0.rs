//! PD0 二进制集合（ensemble）
//!
//! 帧结构：
//!
//! ```text
//! 0x7F 0x7F | num_bytes (u16 LE) | spare | n_types | offsets[n_types] (u16 LE) | ... | checksum (u16 LE)
//! ```
//!
//! `num_bytes` 不含末尾 2 字节校验和；校验和为前 `num_bytes` 字节之和（mod 65536）。
//! 所有多字节字段均为小端。

use chrono::NaiveDate;
use tideline_protocol::{
    DataParticle, DecodeError, ParticleType, TimestampSource, ntp_from_naive, ntp_now,
};
use tracing::trace;

pub const HEADER_ID: u8 = 0x7F;
pub const DATA_SOURCE_ID: u8 = 0x7F;

const FIXED_LEADER_ID: u16 = 0x0000;
const VARIABLE_LEADER_ID: u16 = 0x0080;
const VELOCITY_ID: u16 = 0x0100;
const CORRELATION_ID: u16 = 0x0200;
const ECHO_INTENSITY_ID: u16 = 0x0300;
const PERCENT_GOOD_ID: u16 = 0x0400;

const FIXED_LEADER_LEN: usize = 59;
const VARIABLE_LEADER_LEN: usize = 65;
const MAX_DATA_TYPES: usize = 16;
/// 仪器可输出的最大集合长度
const MAX_ENSEMBLE_BYTES: usize = 0x8000;

/// 无效速度标记
pub const BAD_VELOCITY: i16 = -32768;

fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

/// 在缓冲区中查找完整且校验正确的 PD0 帧
pub fn pd0_spans(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == HEADER_ID
            && buf[i + 1] == DATA_SOURCE_ID
            && let Some(total) = plausible_frame_len(&buf[i..])
            && buf.len() - i >= total
            && frame_checksum_ok(&buf[i..i + total])
        {
            spans.push((i, i + total));
            i += total;
            continue;
        }
        i += 1;
    }
    spans
}

/// 根据帧头判断可能的帧总长（含校验和）；头部不完整或不合理时返回 `None`
fn plausible_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 6 {
        return None;
    }
    let num_bytes = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
    let n_types = usize::from(buf[5]);
    if n_types == 0 || n_types > MAX_DATA_TYPES {
        return None;
    }
    let header_len = 6 + 2 * n_types;
    if num_bytes < header_len || num_bytes > MAX_ENSEMBLE_BYTES {
        return None;
    }
    if buf.len() >= 8 {
        let first_offset = usize::from(u16::from_le_bytes([buf[6], buf[7]]));
        if first_offset != header_len {
            return None;
        }
    }
    Some(num_bytes + 2)
}

fn frame_checksum_ok(frame: &[u8]) -> bool {
    let n = frame.len() - 2;
    checksum(&frame[..n]) == u16::from_le_bytes([frame[n], frame[n + 1]])
}

/// 带边界检查的小端读取器
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&self, off: usize) -> Result<u8, DecodeError> {
        self.data.get(off).copied().ok_or(DecodeError::Truncated {
            expected: off + 1,
            actual: self.data.len(),
        })
    }

    fn bytes(&self, off: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        self.data.get(off..off + len).ok_or(DecodeError::Truncated {
            expected: off + len,
            actual: self.data.len(),
        })
    }

    fn u16(&self, off: usize) -> Result<u16, DecodeError> {
        let b = self.bytes(off, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&self, off: usize) -> Result<i16, DecodeError> {
        Ok(self.u16(off)? as i16)
    }

    fn u32(&self, off: usize) -> Result<u32, DecodeError> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// 解码一个完整的 PD0 帧
pub fn decode_pd0(frame: &[u8]) -> Result<DataParticle, DecodeError> {
    let r = Reader { data: frame };
    if r.u8(0)? != HEADER_ID || r.u8(1)? != DATA_SOURCE_ID {
        return Err(DecodeError::Unrecognized("missing PD0 header id".into()));
    }
    let num_bytes = usize::from(r.u16(2)?);
    if frame.len() != num_bytes + 2 {
        return Err(DecodeError::Truncated {
            expected: num_bytes + 2,
            actual: frame.len(),
        });
    }
    let expected = r.u16(num_bytes)?;
    let actual = checksum(&frame[..num_bytes]);
    if expected != actual {
        return Err(DecodeError::Checksum { expected, actual });
    }

    let n_types = usize::from(r.u8(5)?);
    let offsets = (0..n_types)
        .map(|i| r.u16(6 + 2 * i).map(usize::from))
        .collect::<Result<Vec<_>, _>>()?;

    let mut fixed = None;
    let mut variable = None;
    let mut arrays: Vec<(u16, usize)> = Vec::new();
    for offset in offsets {
        if offset + 2 > num_bytes {
            return Err(DecodeError::Malformed(format!(
                "data type offset {offset} beyond ensemble length {num_bytes}"
            )));
        }
        match r.u16(offset)? {
            FIXED_LEADER_ID => fixed = Some(offset),
            VARIABLE_LEADER_ID => variable = Some(offset),
            id @ (VELOCITY_ID | CORRELATION_ID | ECHO_INTENSITY_ID | PERCENT_GOOD_ID) => {
                arrays.push((id, offset))
            },
            other => trace!("Skipping PD0 data type {:#06x}", other),
        }
    }

    let fixed = fixed.ok_or_else(|| DecodeError::Malformed("PD0 without fixed leader".into()))?;
    let variable =
        variable.ok_or_else(|| DecodeError::Malformed("PD0 without variable leader".into()))?;
    r.bytes(fixed, FIXED_LEADER_LEN)?;
    r.bytes(variable, VARIABLE_LEADER_LEN)?;

    let num_beams = usize::from(r.u8(fixed + 8)?);
    let num_cells = usize::from(r.u8(fixed + 9)?);

    let (timestamp, source) = match instrument_time(&r, variable)? {
        Some(ts) => (ts, TimestampSource::Instrument),
        None => (ntp_now(), TimestampSource::Driver),
    };

    let cpu_serial = r.bytes(fixed + 42, 8)?;
    let adc = r.bytes(variable + 34, 8)?;
    let ensemble_number =
        i64::from(r.u16(variable + 2)?) + (i64::from(r.u8(variable + 11)?) << 16);

    let mut builder = DataParticle::builder(ParticleType::AdcpPd0Parsed, timestamp)
        .timestamp_source(source)
        .field("num_bytes", num_bytes as i64)
        .field("num_data_types", n_types as i64)
        // 固定头
        .field("firmware_version", i64::from(r.u8(fixed + 2)?))
        .field("firmware_revision", i64::from(r.u8(fixed + 3)?))
        .field("sysconfig", i64::from(r.u16(fixed + 4)?))
        .field("data_flag", i64::from(r.u8(fixed + 6)?))
        .field("lag_length", i64::from(r.u8(fixed + 7)?))
        .field("num_beams", num_beams as i64)
        .field("num_cells", num_cells as i64)
        .field("pings_per_ensemble", i64::from(r.u16(fixed + 10)?))
        .field_with_units("cell_length", i64::from(r.u16(fixed + 12)?), "cm")
        .field_with_units("blank_after_transmit", i64::from(r.u16(fixed + 14)?), "cm")
        .field("signal_processing_mode", i64::from(r.u8(fixed + 16)?))
        .field("low_corr_threshold", i64::from(r.u8(fixed + 17)?))
        .field("num_code_repetitions", i64::from(r.u8(fixed + 18)?))
        .field("percent_good_min", i64::from(r.u8(fixed + 19)?))
        .field_with_units("error_vel_threshold", i64::from(r.u16(fixed + 20)?), "mm/s")
        .field_with_units(
            "time_per_ping",
            f64::from(r.u8(fixed + 22)?) * 60.0
                + f64::from(r.u8(fixed + 23)?)
                + f64::from(r.u8(fixed + 24)?) / 100.0,
            "s",
        )
        .field("coord_transform_type", i64::from(r.u8(fixed + 25)?))
        .field_with_units("heading_alignment", i64::from(r.i16(fixed + 26)?), "cdeg")
        .field_with_units("heading_bias", i64::from(r.i16(fixed + 28)?), "cdeg")
        .field("sensor_source", i64::from(r.u8(fixed + 30)?))
        .field("sensor_available", i64::from(r.u8(fixed + 31)?))
        .field_with_units("bin_1_distance", i64::from(r.u16(fixed + 32)?), "cm")
        .field_with_units("transmit_pulse_length", i64::from(r.u16(fixed + 34)?), "cm")
        .field("reference_layer_start", i64::from(r.u8(fixed + 36)?))
        .field("reference_layer_stop", i64::from(r.u8(fixed + 37)?))
        .field("false_target_threshold", i64::from(r.u8(fixed + 38)?))
        .field_with_units("transmit_lag_distance", i64::from(r.u16(fixed + 40)?), "cm")
        .field("cpu_board_serial_number", hex::encode(cpu_serial))
        .field("system_bandwidth", i64::from(r.u16(fixed + 50)?))
        .field("system_power", i64::from(r.u8(fixed + 52)?))
        .field("serial_number", i64::from(r.u32(fixed + 54)?))
        .field_with_units("beam_angle", i64::from(r.u8(fixed + 58)?), "deg")
        // 可变头
        .field("ensemble_number", ensemble_number)
        .field("bit_result", i64::from(r.u16(variable + 12)?))
        .field_with_units("speed_of_sound", i64::from(r.u16(variable + 14)?), "m/s")
        .field_with_units("transducer_depth", i64::from(r.u16(variable + 16)?), "dm")
        .field_with_units("heading", f64::from(r.u16(variable + 18)?) / 100.0, "deg")
        .field_with_units("pitch", f64::from(r.i16(variable + 20)?) / 100.0, "deg")
        .field_with_units("roll", f64::from(r.i16(variable + 22)?) / 100.0, "deg")
        .field_with_units("salinity", i64::from(r.u16(variable + 24)?), "ppt")
        .field_with_units("temperature", f64::from(r.i16(variable + 26)?) / 100.0, "degC")
        .field("heading_stdev", i64::from(r.u8(variable + 31)?))
        .field_with_units("pitch_stdev", f64::from(r.u8(variable + 32)?) / 10.0, "deg")
        .field_with_units("roll_stdev", f64::from(r.u8(variable + 33)?) / 10.0, "deg")
        .field("adc_channels", adc.iter().map(|b| i64::from(*b)).collect::<Vec<_>>())
        .field("error_status_word", i64::from(r.u32(variable + 42)?))
        .field_with_units("pressure", i64::from(r.u32(variable + 48)?), "daPa")
        .field_with_units("pressure_variance", i64::from(r.u32(variable + 52)?), "daPa");

    for (id, offset) in arrays {
        let cells = num_cells * num_beams;
        match id {
            VELOCITY_ID => {
                let values = (0..cells)
                    .map(|i| r.i16(offset + 2 + 2 * i).map(i64::from))
                    .collect::<Result<Vec<_>, _>>()?;
                for (beam, column) in by_beam(&values, num_beams).into_iter().enumerate() {
                    builder = builder.field_with_units(
                        &format!("velocity_beam{}", beam + 1),
                        column,
                        "mm/s",
                    );
                }
            },
            _ => {
                let prefix = match id {
                    CORRELATION_ID => "correlation_magnitude",
                    ECHO_INTENSITY_ID => "echo_intensity",
                    _ => "percent_good",
                };
                let values: Vec<i64> = r
                    .bytes(offset + 2, cells)?
                    .iter()
                    .map(|b| i64::from(*b))
                    .collect();
                for (beam, column) in by_beam(&values, num_beams).into_iter().enumerate() {
                    builder = builder.field(&format!("{}_beam{}", prefix, beam + 1), column);
                }
            },
        }
    }

    Ok(builder.build())
}

/// 按 cell 主序排列的数组拆成每个波束一列
fn by_beam(values: &[i64], num_beams: usize) -> Vec<Vec<i64>> {
    let mut columns = vec![Vec::with_capacity(values.len() / num_beams.max(1)); num_beams];
    for (i, v) in values.iter().enumerate() {
        columns[i % num_beams].push(*v);
    }
    columns
}

/// Y2K 实时时钟（可变头 57..65）
fn instrument_time(r: &Reader<'_>, variable: usize) -> Result<Option<f64>, DecodeError> {
    let year = i32::from(r.u8(variable + 57)?) * 100 + i32::from(r.u8(variable + 58)?);
    let month = u32::from(r.u8(variable + 59)?);
    let day = u32::from(r.u8(variable + 60)?);
    let hour = u32::from(r.u8(variable + 61)?);
    let minute = u32::from(r.u8(variable + 62)?);
    let second = u32::from(r.u8(variable + 63)?);
    let hundredths = u32::from(r.u8(variable + 64)?);

    Ok(NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_milli_opt(hour, minute, second, hundredths * 10))
        .map(|dt| ntp_from_naive(&dt)))
}

/// 模拟仪器与测试使用的 PD0 编码器
#[cfg(any(test, feature = "mock"))]
pub mod encode {
    use super::*;
    use chrono::{Datelike, NaiveDateTime, Timelike};

    /// 一个测量集合的可变内容
    #[derive(Debug, Clone)]
    pub struct Ensemble {
        pub ensemble_number: u32,
        pub time: NaiveDateTime,
        pub num_cells: u8,
        pub heading: u16,
        pub pitch: i16,
        pub roll: i16,
        pub temperature: i16,
        pub serial_number: u32,
    }

    impl Ensemble {
        pub fn sample(ensemble_number: u32, time: NaiveDateTime) -> Self {
            Self {
                ensemble_number,
                time,
                num_cells: 4,
                heading: 27_015,
                pitch: -112,
                roll: 45,
                temperature: 1_652,
                serial_number: 18_444,
            }
        }

        pub fn velocity(&self, cell: usize, beam: usize) -> i16 {
            if cell == 3 && beam == 3 {
                BAD_VELOCITY
            } else {
                (cell as i16 * 10 + beam as i16) * if beam % 2 == 0 { 1 } else { -1 }
            }
        }

        pub fn encode(&self) -> Vec<u8> {
            const NUM_BEAMS: usize = 4;
            let cells = usize::from(self.num_cells);
            let n_types = 6usize;
            let header_len = 6 + 2 * n_types;
            let vel_len = 2 + cells * NUM_BEAMS * 2;
            let u8_len = 2 + cells * NUM_BEAMS;

            let fixed_off = header_len;
            let var_off = fixed_off + FIXED_LEADER_LEN;
            let vel_off = var_off + VARIABLE_LEADER_LEN;
            let cor_off = vel_off + vel_len;
            let echo_off = cor_off + u8_len;
            let pg_off = echo_off + u8_len;
            let num_bytes = pg_off + u8_len;

            let mut out = vec![0u8; num_bytes + 2];
            out[0] = HEADER_ID;
            out[1] = DATA_SOURCE_ID;
            out[2..4].copy_from_slice(&(num_bytes as u16).to_le_bytes());
            out[5] = n_types as u8;
            for (i, off) in [fixed_off, var_off, vel_off, cor_off, echo_off, pg_off]
                .iter()
                .enumerate()
            {
                out[6 + 2 * i..8 + 2 * i].copy_from_slice(&(*off as u16).to_le_bytes());
            }

            // 固定头
            let f = &mut out[fixed_off..fixed_off + FIXED_LEADER_LEN];
            f[0..2].copy_from_slice(&FIXED_LEADER_ID.to_le_bytes());
            f[2] = 50;
            f[3] = 40;
            f[4..6].copy_from_slice(&0x5249u16.to_le_bytes());
            f[8] = NUM_BEAMS as u8;
            f[9] = self.num_cells;
            f[10..12].copy_from_slice(&1u16.to_le_bytes());
            f[12..14].copy_from_slice(&800u16.to_le_bytes());
            f[14..16].copy_from_slice(&704u16.to_le_bytes());
            f[16] = 1;
            f[17] = 64;
            f[19] = 0;
            f[20..22].copy_from_slice(&2000u16.to_le_bytes());
            f[23] = 1;
            f[25] = 0b0000_0111;
            f[30] = 0b0111_1101;
            f[31] = 0b0011_1101;
            f[32..34].copy_from_slice(&1_309u16.to_le_bytes());
            f[34..36].copy_from_slice(&1_004u16.to_le_bytes());
            f[36] = 1;
            f[37] = 5;
            f[38] = 50;
            f[42..50].copy_from_slice(&[0x09, 0xd8, 0xbc, 0xfe, 0x06, 0x00, 0x00, 0x72]);
            f[54..58].copy_from_slice(&self.serial_number.to_le_bytes());
            f[58] = 20;

            // 可变头
            let t = self.time;
            let year = t.year();
            let v = &mut out[var_off..var_off + VARIABLE_LEADER_LEN];
            v[0..2].copy_from_slice(&VARIABLE_LEADER_ID.to_le_bytes());
            v[2..4].copy_from_slice(&((self.ensemble_number & 0xFFFF) as u16).to_le_bytes());
            v[4] = (year % 100) as u8;
            v[5] = t.month() as u8;
            v[6] = t.day() as u8;
            v[7] = t.hour() as u8;
            v[8] = t.minute() as u8;
            v[9] = t.second() as u8;
            v[10] = (t.nanosecond() / 10_000_000) as u8;
            v[11] = (self.ensemble_number >> 16) as u8;
            v[14..16].copy_from_slice(&1485u16.to_le_bytes());
            v[16..18].copy_from_slice(&120u16.to_le_bytes());
            v[18..20].copy_from_slice(&self.heading.to_le_bytes());
            v[20..22].copy_from_slice(&self.pitch.to_le_bytes());
            v[22..24].copy_from_slice(&self.roll.to_le_bytes());
            v[24..26].copy_from_slice(&35u16.to_le_bytes());
            v[26..28].copy_from_slice(&self.temperature.to_le_bytes());
            v[34..42].copy_from_slice(&[88, 120, 130, 112, 79, 150, 153, 155]);
            v[48..52].copy_from_slice(&12_345u32.to_le_bytes());
            v[57] = (year / 100) as u8;
            v[58] = (year % 100) as u8;
            v[59] = t.month() as u8;
            v[60] = t.day() as u8;
            v[61] = t.hour() as u8;
            v[62] = t.minute() as u8;
            v[63] = t.second() as u8;
            v[64] = (t.nanosecond() / 10_000_000) as u8;

            // 速度
            out[vel_off..vel_off + 2].copy_from_slice(&VELOCITY_ID.to_le_bytes());
            for cell in 0..cells {
                for beam in 0..NUM_BEAMS {
                    let pos = vel_off + 2 + 2 * (cell * NUM_BEAMS + beam);
                    out[pos..pos + 2].copy_from_slice(&self.velocity(cell, beam).to_le_bytes());
                }
            }

            for (off, id, base) in [
                (cor_off, CORRELATION_ID, 100u8),
                (echo_off, ECHO_INTENSITY_ID, 60u8),
                (pg_off, PERCENT_GOOD_ID, 0u8),
            ] {
                out[off..off + 2].copy_from_slice(&id.to_le_bytes());
                for i in 0..cells * NUM_BEAMS {
                    out[off + 2 + i] = if id == PERCENT_GOOD_ID { 100 } else { base + i as u8 };
                }
            }

            let sum = checksum(&out[..num_bytes]);
            out[num_bytes..].copy_from_slice(&sum.to_le_bytes());
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::encode::Ensemble;
    use super::*;
    use tideline_protocol::ParticleValue;

    fn sample_time() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 6, 6)
            .unwrap()
            .and_hms_milli_opt(6, 6, 6, 250)
            .unwrap()
    }

    #[test]
    fn test_decode_sample_ensemble() {
        let frame = Ensemble::sample(70_000, sample_time()).encode();
        let particle = decode_pd0(&frame).unwrap();

        assert_eq!(particle.particle_type(), ParticleType::AdcpPd0Parsed);
        assert_eq!(particle.timestamp_source(), TimestampSource::Instrument);
        assert!((particle.timestamp() - ntp_from_naive(&sample_time())).abs() < 1e-6);
        assert_eq!(particle.get("ensemble_number"), Some(&ParticleValue::Int(70_000)));
        assert_eq!(particle.get("serial_number"), Some(&ParticleValue::Int(18_444)));
        assert_eq!(particle.get("num_cells"), Some(&ParticleValue::Int(4)));
        assert_eq!(particle.get("heading"), Some(&ParticleValue::Float(270.15)));
        assert_eq!(particle.get("pitch"), Some(&ParticleValue::Float(-1.12)));
        assert_eq!(
            particle.get("velocity_beam4"),
            Some(&ParticleValue::IntList(vec![-3, -13, -23, i64::from(BAD_VELOCITY)]))
        );
        assert_eq!(
            particle.get("percent_good_beam1"),
            Some(&ParticleValue::IntList(vec![100; 4]))
        );
        assert_eq!(
            particle.get("cpu_board_serial_number"),
            Some(&ParticleValue::Text("09d8bcfe06000072".into()))
        );
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut frame = Ensemble::sample(1, sample_time()).encode();
        let mid = frame.len() / 2;
        frame[mid] ^= 0xFF;
        assert!(matches!(decode_pd0(&frame), Err(DecodeError::Checksum { .. })));
        assert!(pd0_spans(&frame).is_empty());
    }

    #[test]
    fn test_spans_skip_noise_and_wait_for_tail() {
        let frame = Ensemble::sample(2, sample_time()).encode();
        let mut buf = b"\x7f\x7fnoise".to_vec();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(&frame[..10]);

        assert_eq!(pd0_spans(&buf), vec![(7, 7 + frame.len())]);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = Ensemble::sample(3, sample_time()).encode();
        assert!(matches!(
            decode_pd0(&frame[..frame.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
