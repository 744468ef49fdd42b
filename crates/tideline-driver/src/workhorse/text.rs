//! 文本记录：系统配置（PS0）与罗盘校准（AC）

use chrono::NaiveDateTime;
use regex::Regex;
use tideline_protocol::{DataParticle, DecodeError, ParticleType, ntp_from_naive, ntp_now};

fn capture<'t>(re: &Regex, text: &'t str, field: &str) -> Result<&'t str, DecodeError> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .ok_or_else(|| DecodeError::Malformed(format!("missing {field}")))
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, DecodeError> {
    raw.trim()
        .parse()
        .map_err(|_| DecodeError::Malformed(format!("{field}: not a number: '{raw}'")))
}

fn parse_i64(raw: &str, field: &str) -> Result<i64, DecodeError> {
    raw.trim()
        .parse()
        .map_err(|_| DecodeError::Malformed(format!("{field}: not an integer: '{raw}'")))
}

fn float_list(raw: &str, field: &str) -> Result<Vec<f64>, DecodeError> {
    raw.split_whitespace().map(|v| parse_f64(v, field)).collect()
}

/// PS0 系统配置解码器
#[derive(Debug, Clone)]
pub struct SystemConfigDecoder {
    serial: Regex,
    frequency: Regex,
    configuration: Regex,
    match_layer: Regex,
    beam_angle: Regex,
    beam_pattern: Regex,
    orientation: Regex,
    sensors: Regex,
    coefficient: Regex,
    temp_offset: Regex,
    cpu_firmware: Regex,
    boot_code: Regex,
    version_type: Regex,
    board_serials: Regex,
}

impl SystemConfigDecoder {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            serial: Regex::new(r"Instrument S/N:\s*(\S+)")?,
            frequency: Regex::new(r"Frequency:\s*(\d+)")?,
            configuration: Regex::new(r"Configuration:\s*([^\r\n]+)")?,
            match_layer: Regex::new(r"Match Layer:\s*(\S+)")?,
            beam_angle: Regex::new(r"Beam Angle:\s*(\d+)")?,
            beam_pattern: Regex::new(r"Beam Pattern:\s*(\S+)")?,
            orientation: Regex::new(r"Orientation:\s*(\S+)")?,
            sensors: Regex::new(r"Sensor\(s\):\s*([^\r\n]+)")?,
            coefficient: Regex::new(r"(?m)^\s*(c3|c2|c1|Offset)\s*=\s*(\S+)")?,
            temp_offset: Regex::new(r"Temp Sens Offset:\s*(\S+)")?,
            cpu_firmware: Regex::new(r"CPU Firmware:\s*([^\r\n]+)")?,
            boot_code: Regex::new(r"Required:\s*(\S+)\s+Actual:\s*(\S+)")?,
            version_type: Regex::new(
                r"(DEMOD #1|DEMOD #2|PWRTIMG)\s+Ver:\s*(\w+),\s*Type:\s*(\w+)",
            )?,
            board_serials: Regex::new(r"(?s)Board Serial Number Data:\s*\r?\n(.*)")?,
        })
    }

    pub fn decode(&self, text: &str) -> Result<DataParticle, DecodeError> {
        let mut coeffs = [None; 4];
        for c in self.coefficient.captures_iter(text) {
            let idx = match &c[1] {
                "c3" => 0,
                "c2" => 1,
                "c1" => 2,
                _ => 3,
            };
            coeffs[idx] = Some(parse_f64(&c[2], &c[1])?);
        }
        let coeff = |i: usize, name: &str| {
            coeffs[i].ok_or_else(|| {
                DecodeError::Malformed(format!("missing pressure coefficient {name}"))
            })
        };

        let boot = self
            .boot_code
            .captures(text)
            .ok_or_else(|| DecodeError::Malformed("missing boot code versions".into()))?;

        let mut versions = Vec::new();
        for c in self.version_type.captures_iter(text) {
            versions.push((c[1].to_string(), c[2].to_string(), c[3].to_string()));
        }
        let version = |key: &str| {
            versions
                .iter()
                .find(|(k, _, _)| k == key)
                .map(|(_, v, t)| (v.clone(), t.clone()))
                .ok_or_else(|| DecodeError::Malformed(format!("missing {key} version")))
        };
        let (demod1_ver, demod1_type) = version("DEMOD #1")?;
        let (demod2_ver, demod2_type) = version("DEMOD #2")?;
        let (pwr_ver, pwr_type) = version("PWRTIMG")?;

        let boards = capture(&self.board_serials, text, "board serial numbers")?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(DataParticle::builder(ParticleType::AdcpSystemConfiguration, ntp_now())
            .field("serial_number", capture(&self.serial, text, "serial number")?)
            .field_with_units(
                "transducer_frequency",
                parse_i64(capture(&self.frequency, text, "frequency")?, "frequency")?,
                "Hz",
            )
            .field("configuration", capture(&self.configuration, text, "configuration")?)
            .field("match_layer", capture(&self.match_layer, text, "match layer")?)
            .field_with_units(
                "beam_angle",
                parse_i64(capture(&self.beam_angle, text, "beam angle")?, "beam angle")?,
                "deg",
            )
            .field("beam_pattern", capture(&self.beam_pattern, text, "beam pattern")?)
            .field("orientation", capture(&self.orientation, text, "orientation")?)
            .field("sensors", capture(&self.sensors, text, "sensors")?)
            .field("pressure_coeff_c3", coeff(0, "c3")?)
            .field("pressure_coeff_c2", coeff(1, "c2")?)
            .field("pressure_coeff_c1", coeff(2, "c1")?)
            .field("pressure_coeff_offset", coeff(3, "offset")?)
            .field_with_units(
                "temperature_sensor_offset",
                parse_f64(capture(&self.temp_offset, text, "temp offset")?, "temp offset")?,
                "degC",
            )
            .field("cpu_firmware", capture(&self.cpu_firmware, text, "cpu firmware")?)
            .field("boot_code_required", &boot[1])
            .field("boot_code_actual", &boot[2])
            .field("demod_1_version", demod1_ver)
            .field("demod_1_type", demod1_type)
            .field("demod_2_version", demod2_ver)
            .field("demod_2_type", demod2_type)
            .field("power_timing_version", pwr_ver)
            .field("power_timing_type", pwr_type)
            .field("board_serial_numbers", boards)
            .build())
    }
}

/// AC 罗盘/倾角校准解码器
#[derive(Debug, Clone)]
pub struct CalibrationDecoder {
    timestamp: Regex,
    matrix_row: Regex,
    coil_offset: Regex,
    electrical_null: Regex,
    temperature: Regex,
    tilt_row: Regex,
    tilt_null: Regex,
}

impl CalibrationDecoder {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            timestamp: Regex::new(
                r"Calibration date and time:\s*(\d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}:\d{2})",
            )?,
            matrix_row: Regex::new(r"(?m)^\s*(Bx|By|Bz|Err)\s*\|([^|]*)\|")?,
            coil_offset: Regex::new(r"(?s)Coil Offset(.*?)Electrical Null")?,
            electrical_null: Regex::new(r"Electrical Null\s*\r?\n\s*\|\s*(\d+)\s*\|")?,
            temperature: Regex::new(r"Calibration was\s+(-?[\d.]+)\s*C")?,
            tilt_row: Regex::new(r"(?m)^\s*(Roll|Pitch|Offset)\s*\|([^|]*)\|\s*\|([^|]*)\|")?,
            tilt_null: Regex::new(r"(?m)^\s*Null\s*\|\s*(\d+)\s*\|")?,
        })
    }

    fn parse_time(raw: &str) -> Result<f64, DecodeError> {
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        NaiveDateTime::parse_from_str(&normalized, "%m/%d/%Y %H:%M:%S")
            .map(|dt| ntp_from_naive(&dt))
            .map_err(|e| DecodeError::Malformed(format!("calibration time '{raw}': {e}")))
    }

    pub fn decode(&self, text: &str) -> Result<DataParticle, DecodeError> {
        let times = self
            .timestamp
            .captures_iter(text)
            .map(|c| Self::parse_time(&c[1]))
            .collect::<Result<Vec<_>, _>>()?;
        let [fluxgate_time, tilt_time] = times[..] else {
            return Err(DecodeError::Malformed(format!(
                "expected 2 calibration timestamps, found {}",
                times.len()
            )));
        };

        let mut rows: Vec<(String, Vec<f64>)> = Vec::new();
        for c in self.matrix_row.captures_iter(text) {
            rows.push((c[1].to_string(), float_list(&c[2], &c[1])?));
        }
        let row = |name: &str| {
            rows.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| DecodeError::Malformed(format!("missing S inverse row {name}")))
        };

        let coil_block = capture(&self.coil_offset, text, "coil offset")?;
        let coil_offset: Vec<f64> = coil_block
            .lines()
            .filter_map(|l| {
                let inner = l.trim().strip_prefix('|')?.strip_suffix('|')?;
                Some(parse_f64(inner, "coil offset"))
            })
            .collect::<Result<_, _>>()?;
        if coil_offset.len() != 4 {
            return Err(DecodeError::Malformed(format!(
                "expected 4 coil offsets, found {}",
                coil_offset.len()
            )));
        }

        let mut tilt: Vec<(String, Vec<f64>)> = Vec::new();
        for c in self.tilt_row.captures_iter(text) {
            let mut values = float_list(&c[2], &c[1])?;
            values.extend(float_list(&c[3], &c[1])?);
            tilt.push((c[1].to_string(), values));
        }
        let tilt_row = |name: &str| {
            tilt.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| DecodeError::Malformed(format!("missing tilt row {name}")))
        };

        Ok(DataParticle::builder(ParticleType::AdcpCompassCalibration, ntp_now())
            .field("fluxgate_calibration_timestamp", fluxgate_time)
            .field("s_inverse_bx", row("Bx")?)
            .field("s_inverse_by", row("By")?)
            .field("s_inverse_bz", row("Bz")?)
            .field("s_inverse_err", row("Err")?)
            .field("coil_offset", coil_offset)
            .field(
                "electrical_null",
                parse_f64(
                    capture(&self.electrical_null, text, "electrical null")?,
                    "electrical null",
                )?,
            )
            .field("tilt_calibration_timestamp", tilt_time)
            .field_with_units(
                "calibration_temp",
                parse_f64(
                    capture(&self.temperature, text, "calibration temperature")?,
                    "temperature",
                )?,
                "degC",
            )
            .field("roll_up_down", tilt_row("Roll")?)
            .field("pitch_up_down", tilt_row("Pitch")?)
            .field("offset_up_down", tilt_row("Offset")?)
            .field(
                "tilt_null",
                parse_f64(capture(&self.tilt_null, text, "tilt null")?, "tilt null")?,
            )
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workhorse::sim::{CALIBRATION_TEXT, SYSTEM_CONFIGURATION_TEXT};
    use tideline_protocol::ParticleValue;

    #[test]
    fn test_decode_system_configuration() {
        let decoder = SystemConfigDecoder::new().unwrap();
        let particle = decoder.decode(SYSTEM_CONFIGURATION_TEXT).unwrap();

        assert_eq!(particle.get("serial_number"), Some(&ParticleValue::Text("18444".into())));
        assert_eq!(particle.get("transducer_frequency"), Some(&ParticleValue::Int(76800)));
        assert_eq!(
            particle.get("configuration"),
            Some(&ParticleValue::Text("4 BEAM, JANUS".into()))
        );
        assert_eq!(particle.get("beam_angle"), Some(&ParticleValue::Int(20)));
        assert_eq!(particle.get("beam_pattern"), Some(&ParticleValue::Text("CONVEX".into())));
        assert_eq!(particle.get("orientation"), Some(&ParticleValue::Text("UP".into())));
        assert_eq!(
            particle.get("pressure_coeff_c3"),
            Some(&ParticleValue::Float(-1.927850e-11))
        );
        assert_eq!(
            particle.get("temperature_sensor_offset"),
            Some(&ParticleValue::Float(-0.01))
        );
        assert_eq!(particle.get("cpu_firmware"), Some(&ParticleValue::Text("50.40 [0]".into())));
        assert_eq!(particle.get("boot_code_actual"), Some(&ParticleValue::Text("1.16".into())));
        assert_eq!(particle.get("demod_2_version"), Some(&ParticleValue::Text("ad48".into())));
        assert_eq!(particle.get("power_timing_type"), Some(&ParticleValue::Text("7".into())));
        let boards = particle.get("board_serial_numbers").and_then(|v| v.as_text()).unwrap();
        assert_eq!(boards.lines().count(), 6);
        assert!(boards.ends_with("DSP727-2001-06H"));
    }

    #[test]
    fn test_decode_calibration() {
        let decoder = CalibrationDecoder::new().unwrap();
        let particle = decoder.decode(CALIBRATION_TEXT).unwrap();

        assert_eq!(
            particle.get("s_inverse_bx"),
            Some(&ParticleValue::FloatList(vec![3.9218e-01, 3.9660e-01, -3.1681e-02, 6.4332e-03]))
        );
        assert_eq!(
            particle.get("coil_offset"),
            Some(&ParticleValue::FloatList(vec![3.4233e+04, 3.4449e+04, 3.4389e+04, 3.4698e+04]))
        );
        assert_eq!(particle.get("electrical_null"), Some(&ParticleValue::Float(34285.0)));
        assert_eq!(particle.get("calibration_temp"), Some(&ParticleValue::Float(24.4)));
        assert_eq!(
            particle.get("roll_up_down"),
            Some(&ParticleValue::FloatList(vec![7.4612e-07, -3.1727e-05, -3.0054e-07, 3.2190e-05]))
        );
        assert_eq!(particle.get("tilt_null"), Some(&ParticleValue::Float(33500.0)));

        let flux = particle
            .get("fluxgate_calibration_timestamp")
            .and_then(|v| v.as_float())
            .unwrap();
        let tilt = particle
            .get("tilt_calibration_timestamp")
            .and_then(|v| v.as_float())
            .unwrap();
        assert!((flux - tilt - 647.0).abs() < 1e-6);
    }

    #[test]
    fn test_incomplete_calibration_rejected() {
        let decoder = CalibrationDecoder::new().unwrap();
        let cut = CALIBRATION_TEXT.find("TILT CALIBRATION").unwrap();
        assert!(matches!(
            decoder.decode(&CALIBRATION_TEXT[..cut]),
            Err(DecodeError::Malformed(_))
        ));
    }
}
